//! # Event Fan-out
//!
//! Every state change the coordinators make is published here, addressed by
//! guild. Front-ends (web socket bridge, REST responders, bot UI) subscribe to
//! the guilds they are allowed to see; authorization happens before
//! [`EventBus::subscribe`] is called.
//!
//! Each subscriber owns an unbounded channel, so every emission reaches every
//! live subscriber exactly once. Emissions for one guild are made while the
//! coordinators hold that guild's lock, so subscribers observe them in FIFO
//! order.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    audio::{effects::AudioFilters, track::Track},
    engine::TrackEndReason,
    ids::{ChannelId, GuildId},
};

/// Un evento de cambio de estado.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum MusicEvent {
    #[serde(rename = "player:play")]
    PlayerPlay { track: Track },
    #[serde(rename = "player:pause")]
    PlayerPause {},
    #[serde(rename = "player:resume")]
    PlayerResume {},
    #[serde(rename = "player:skip")]
    PlayerSkip { skipped_track: Option<Track> },
    #[serde(rename = "player:stop")]
    PlayerStop {},
    #[serde(rename = "player:volume")]
    PlayerVolume { volume: u16 },
    #[serde(rename = "player:seek")]
    PlayerSeek { position: u64 },
    #[serde(rename = "player:filters")]
    PlayerFilters { filters: AudioFilters },

    #[serde(rename = "queue:update")]
    QueueUpdate { queue: Vec<Track> },
    #[serde(rename = "queue:add")]
    QueueAdd { tracks: Vec<Track> },
    #[serde(rename = "queue:remove")]
    QueueRemove { index: usize, removed_track: Track },
    #[serde(rename = "queue:clear")]
    QueueClear {},
    #[serde(rename = "queue:shuffle")]
    QueueShuffle { new_queue: Vec<Track> },
    #[serde(rename = "queue:move")]
    QueueMove { from: usize, to: usize, queue: Vec<Track> },

    #[serde(rename = "track:start")]
    TrackStart { track: Track },
    #[serde(rename = "track:end")]
    TrackEnd { track: Track, reason: TrackEndReason },
    #[serde(rename = "track:stuck")]
    TrackStuck { track: Track, threshold_ms: u64 },
    #[serde(rename = "track:error")]
    TrackError { track: Track, error: String },

    #[serde(rename = "voice:join")]
    VoiceJoin { channel_id: ChannelId },
    #[serde(rename = "voice:leave")]
    VoiceLeave { channel_id: ChannelId },
    #[serde(rename = "voice:error")]
    VoiceError { error: String },
}

impl MusicEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MusicEvent::PlayerPlay { .. } => "player:play",
            MusicEvent::PlayerPause {} => "player:pause",
            MusicEvent::PlayerResume {} => "player:resume",
            MusicEvent::PlayerSkip { .. } => "player:skip",
            MusicEvent::PlayerStop {} => "player:stop",
            MusicEvent::PlayerVolume { .. } => "player:volume",
            MusicEvent::PlayerSeek { .. } => "player:seek",
            MusicEvent::PlayerFilters { .. } => "player:filters",
            MusicEvent::QueueUpdate { .. } => "queue:update",
            MusicEvent::QueueAdd { .. } => "queue:add",
            MusicEvent::QueueRemove { .. } => "queue:remove",
            MusicEvent::QueueClear {} => "queue:clear",
            MusicEvent::QueueShuffle { .. } => "queue:shuffle",
            MusicEvent::QueueMove { .. } => "queue:move",
            MusicEvent::TrackStart { .. } => "track:start",
            MusicEvent::TrackEnd { .. } => "track:end",
            MusicEvent::TrackStuck { .. } => "track:stuck",
            MusicEvent::TrackError { .. } => "track:error",
            MusicEvent::VoiceJoin { .. } => "voice:join",
            MusicEvent::VoiceLeave { .. } => "voice:leave",
            MusicEvent::VoiceError { .. } => "voice:error",
        }
    }
}

/// Envelope delivered to subscribers: `{"guildId", "event", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildEvent {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub event: MusicEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Arc<GuildEvent>>,
}

/// A live subscription. Dropping it unsubscribes lazily on the next publish.
pub struct Subscription {
    id: SubscriptionId,
    guild_id: Option<GuildId>,
    rx: mpsc::UnboundedReceiver<Arc<GuildEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// `None` for an all-guild subscription.
    pub fn guild_id(&self) -> Option<GuildId> {
        self.guild_id
    }

    pub async fn recv(&mut self) -> Option<Arc<GuildEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<GuildEvent>> {
        self.rx.try_recv().ok()
    }

    /// Drains whatever is already buffered.
    pub fn drain(&mut self) -> Vec<Arc<GuildEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Default)]
pub struct EventBus {
    guilds: DashMap<GuildId, Vec<Subscriber>>,
    global: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_subscriber(&self) -> (Subscriber, mpsc::UnboundedReceiver<Arc<GuildEvent>>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber { id, tx }, rx)
    }

    /// Suscribe al canal de un guild
    pub fn subscribe(&self, guild_id: GuildId) -> Subscription {
        let (subscriber, rx) = self.next_subscriber();
        let id = subscriber.id;
        self.guilds.entry(guild_id).or_default().push(subscriber);
        debug!("📡 Suscripción {:?} al guild {}", id, guild_id);
        Subscription {
            id,
            guild_id: Some(guild_id),
            rx,
        }
    }

    /// Receives the events of every guild (bridges, audit logging).
    pub fn subscribe_all(&self) -> Subscription {
        let (subscriber, rx) = self.next_subscriber();
        let id = subscriber.id;
        self.global.write().push(subscriber);
        Subscription {
            id,
            guild_id: None,
            rx,
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.global.write().retain(|s| s.id != id);
        self.guilds.retain(|_, subscribers| {
            subscribers.retain(|s| s.id != id);
            !subscribers.is_empty()
        });
    }

    pub fn subscriber_count(&self, guild_id: GuildId) -> usize {
        self.guilds.get(&guild_id).map_or(0, |s| s.len())
    }

    /// Publica un evento; devuelve cuántos suscriptores lo recibieron.
    pub fn publish(&self, guild_id: GuildId, event: MusicEvent) -> usize {
        let name = event.name();
        let envelope = Arc::new(GuildEvent { guild_id, event });
        let mut delivered = 0;

        if let Some(mut subscribers) = self.guilds.get_mut(&guild_id) {
            subscribers.retain(|s| s.tx.send(Arc::clone(&envelope)).is_ok());
            delivered += subscribers.len();
        }

        {
            let mut global = self.global.write();
            global.retain(|s| s.tx.send(Arc::clone(&envelope)).is_ok());
            delivered += global.len();
        }

        trace!("{} -> {} suscriptores (guild {})", name, delivered, guild_id);
        delivered
    }
}
