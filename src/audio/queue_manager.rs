use chrono::Utc;
use dashmap::DashMap;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        locks::{GuildGuard, GuildLocks},
        queue::{GuildQueue, LoopMode, PlayerState, QueueUpdate},
        track::Track,
    },
    engine::EngineTrack,
    error::{MusicError, Result},
    events::{EventBus, MusicEvent},
    ids::{GuildId, UserId},
    storage::{is_expired, GuildSettings, QueueStore, SettingsStore},
};

/// Colas inactivas más viejas que esto se eliminan en la limpieza.
pub const DEFAULT_QUEUE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Coordinador de colas: toda mutación de contenido pasa por aquí.
///
/// Every mutation loads the queue, changes a local copy, writes it to the
/// store and only then replaces the cached copy and publishes events. A
/// failed write leaves both cache and subscribers untouched.
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    settings: Arc<dyn SettingsStore>,
    bus: Arc<EventBus>,
    locks: Arc<GuildLocks>,
    cache: DashMap<GuildId, GuildQueue>,
    expiry: Duration,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        settings: Arc<dyn SettingsStore>,
        bus: Arc<EventBus>,
        locks: Arc<GuildLocks>,
    ) -> Self {
        Self {
            store,
            settings,
            bus,
            locks,
            cache: DashMap::new(),
            expiry: DEFAULT_QUEUE_EXPIRY,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn locks(&self) -> &Arc<GuildLocks> {
        &self.locks
    }

    pub async fn guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings> {
        Ok(self.settings.settings(guild_id).await?)
    }

    /// Queue under the lock; created from guild defaults on first access.
    pub(crate) async fn load_locked(&self, guard: &GuildGuard) -> Result<GuildQueue> {
        let guild_id = guard.guild_id();
        if let Some(cached) = self.cache.get(&guild_id) {
            return Ok(cached.clone());
        }

        let queue = match self.store.load(guild_id).await? {
            Some(queue) => queue,
            None => {
                let settings = self.settings.settings(guild_id).await?;
                let queue = GuildQueue::new(guild_id, &settings);
                self.store
                    .save(guild_id, &QueueUpdate::snapshot(&queue))
                    .await?;
                debug!("📝 Nueva cola creada para guild {}", guild_id);
                queue
            }
        };

        self.cache.insert(guild_id, queue.clone());
        Ok(queue)
    }

    /// Persists `update` (stamping activity), then caches `queue`.
    pub(crate) async fn commit(
        &self,
        guard: &GuildGuard,
        mut queue: GuildQueue,
        mut update: QueueUpdate,
    ) -> Result<GuildQueue> {
        let guild_id = guard.guild_id();
        let now = Utc::now();
        update.last_activity = Some(now);

        if let Err(e) = self.store.save(guild_id, &update).await {
            warn!("❌ No se pudo guardar la cola del guild {}: {}", guild_id, e);
            return Err(e.into());
        }

        queue.last_activity = now;
        queue.updated_at = now;
        self.cache.insert(guild_id, queue.clone());
        Ok(queue)
    }

    /// Elimina el documento completo (destroyPlayer).
    pub(crate) async fn delete_locked(&self, guard: &GuildGuard) -> Result<bool> {
        let guild_id = guard.guild_id();
        let existed = self.store.delete(guild_id).await?;
        self.cache.remove(&guild_id);
        Ok(existed)
    }

    fn publish_update(&self, queue: &GuildQueue) {
        self.bus.publish(
            queue.guild_id,
            MusicEvent::QueueUpdate {
                queue: queue.tracks.clone(),
            },
        );
    }

    /// Agrega tracks a la cola en `position` o al final.
    ///
    /// Returns the tracks actually added, which may be fewer than given when
    /// duplicates are disallowed; nothing is written when none survive.
    /// The length limit applies to the queue after duplicates are dropped.
    pub async fn add_tracks(
        &self,
        guild_id: GuildId,
        tracks: Vec<Track>,
        position: Option<usize>,
    ) -> Result<Vec<Track>> {
        let guard = self.locks.lock(guild_id).await;
        self.add_tracks_locked(&guard, tracks, position).await
    }

    pub(crate) async fn add_tracks_locked(
        &self,
        guard: &GuildGuard,
        tracks: Vec<Track>,
        position: Option<usize>,
    ) -> Result<Vec<Track>> {
        let guild_id = guard.guild_id();
        let settings = self.settings.settings(guild_id).await?;
        let mut queue = self.load_locked(guard).await?;

        let added = if settings.allow_duplicates {
            tracks
        } else {
            queue.without_duplicates(tracks)
        };
        if added.is_empty() {
            debug!("Nada que agregar en guild {} (todos duplicados)", guild_id);
            return Ok(added);
        }

        let attempted = queue.len() + added.len();
        if attempted > settings.max_queue_length {
            return Err(MusicError::QueueLimitExceeded {
                max: settings.max_queue_length,
                attempted,
            });
        }

        queue.insert_tracks(added.clone(), position);
        let update = QueueUpdate::contents(&queue);
        let queue = self.commit(guard, queue, update).await?;

        info!("➕ {} tracks agregados a la cola de {}", added.len(), guild_id);
        self.bus.publish(
            guild_id,
            MusicEvent::QueueAdd {
                tracks: added.clone(),
            },
        );
        self.publish_update(&queue);
        Ok(added)
    }

    pub async fn remove_track(&self, guild_id: GuildId, index: usize) -> Result<Track> {
        let guard = self.locks.lock(guild_id).await;
        let mut queue = self.load_locked(&guard).await?;

        let removed = queue.remove(index)?;
        let update = QueueUpdate::contents(&queue);
        let queue = self.commit(&guard, queue, update).await?;

        debug!("➖ Track {} eliminado de la cola de {}", index, guild_id);
        self.bus.publish(
            guild_id,
            MusicEvent::QueueRemove {
                index,
                removed_track: removed.clone(),
            },
        );
        self.publish_update(&queue);
        Ok(removed)
    }

    pub async fn move_track(&self, guild_id: GuildId, from: usize, to: usize) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        let mut queue = self.load_locked(&guard).await?;

        queue.move_track(from, to)?;
        let update = QueueUpdate::contents(&queue);
        let queue = self.commit(&guard, queue, update).await?;

        self.bus.publish(
            guild_id,
            MusicEvent::QueueMove {
                from,
                to,
                queue: queue.tracks.clone(),
            },
        );
        self.publish_update(&queue);
        Ok(())
    }

    pub async fn clear_queue(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        let mut queue = self.load_locked(&guard).await?;

        queue.clear();
        let update = QueueUpdate::contents(&queue);
        let queue = self.commit(&guard, queue, update).await?;

        info!("🗑️ Cola vaciada en guild {}", guild_id);
        self.bus.publish(guild_id, MusicEvent::QueueClear {});
        self.publish_update(&queue);
        Ok(())
    }

    /// Mezcla lo que viene después del track actual.
    pub async fn shuffle_queue(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        let mut queue = self.load_locked(&guard).await?;
        if queue.len() <= 1 {
            return Ok(());
        }

        queue.shuffle_upcoming(&mut rand::thread_rng());
        let update = QueueUpdate::contents(&queue);
        let queue = self.commit(&guard, queue, update).await?;

        debug!("🔀 Cola mezclada en guild {}", guild_id);
        self.bus.publish(
            guild_id,
            MusicEvent::QueueShuffle {
                new_queue: queue.tracks.clone(),
            },
        );
        self.publish_update(&queue);
        Ok(())
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        self.set_loop_mode_locked(&guard, mode).await.map(|_| ())
    }

    pub(crate) async fn set_loop_mode_locked(
        &self,
        guard: &GuildGuard,
        mode: LoopMode,
    ) -> Result<GuildQueue> {
        let mut queue = self.load_locked(guard).await?;
        queue.loop_mode = mode;
        let update = QueueUpdate {
            loop_mode: Some(mode),
            ..Default::default()
        };
        let queue = self.commit(guard, queue, update).await?;

        debug!("🔁 Loop {} en guild {}", mode, guard.guild_id());
        self.publish_update(&queue);
        Ok(queue)
    }

    pub async fn set_autoplay(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        let mut queue = self.load_locked(&guard).await?;
        queue.autoplay = enabled;
        let update = QueueUpdate {
            autoplay: Some(enabled),
            ..Default::default()
        };
        let queue = self.commit(&guard, queue, update).await?;
        self.publish_update(&queue);
        Ok(())
    }

    /// `playing` is forced to false on an empty queue.
    pub async fn set_playing_status(&self, guild_id: GuildId, playing: bool, paused: bool) -> Result<()> {
        let guard = self.locks.lock(guild_id).await;
        self.set_playing_status_locked(&guard, playing, paused)
            .await
            .map(|_| ())
    }

    pub(crate) async fn set_playing_status_locked(
        &self,
        guard: &GuildGuard,
        playing: bool,
        paused: bool,
    ) -> Result<GuildQueue> {
        let mut queue = self.load_locked(guard).await?;
        queue.is_playing = playing && !queue.is_empty();
        queue.is_paused = queue.is_playing && paused;
        let update = QueueUpdate {
            is_playing: Some(queue.is_playing),
            is_paused: Some(queue.is_paused),
            ..Default::default()
        };
        let queue = self.commit(guard, queue, update).await?;
        self.publish_update(&queue);
        Ok(queue)
    }

    /// Busca con `search` y agrega todos los resultados.
    ///
    /// The search runs before the guild lock is taken, so a slow engine never
    /// blocks other commands for the guild.
    pub async fn search_and_add<F, Fut, E>(
        &self,
        guild_id: GuildId,
        query: &str,
        requester: UserId,
        search: F,
    ) -> Result<Vec<Track>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<EngineTrack>, E>>,
        MusicError: From<E>,
    {
        let results = search(query.to_string()).await?;
        if results.is_empty() {
            return Err(MusicError::NoResults {
                query: query.to_string(),
            });
        }

        let now = Utc::now();
        let tracks: Vec<Track> = results
            .into_iter()
            .map(|t| t.into_track(Some(requester), now))
            .collect();

        self.add_tracks(guild_id, tracks, None).await
    }

    pub async fn queue_info(&self, guild_id: GuildId) -> Result<GuildQueue> {
        let guard = self.locks.lock(guild_id).await;
        self.load_locked(&guard).await
    }

    pub async fn current_track(&self, guild_id: GuildId) -> Result<Option<Track>> {
        Ok(self.queue_info(guild_id).await?.current_track().cloned())
    }

    pub async fn next_tracks(&self, guild_id: GuildId, limit: usize) -> Result<Vec<Track>> {
        Ok(self.queue_info(guild_id).await?.next_tracks(limit).to_vec())
    }

    pub async fn player_state(&self, guild_id: GuildId) -> Result<PlayerState> {
        Ok(PlayerState::from(&self.queue_info(guild_id).await?))
    }

    /// Borra colas inactivas; la programación queda a cargo del llamador.
    pub async fn cleanup_old_queues(&self) -> Result<usize> {
        let expiry = chrono::Duration::from_std(self.expiry).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(expiry)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for guild_id in self.store.inactive(cutoff).await? {
            let guard = self.locks.lock(guild_id).await;

            // La cola pudo usarse entre el listado y el lock
            let expired = match self.store.load(guild_id).await? {
                Some(queue) => is_expired(&queue, cutoff),
                None => false,
            };
            if expired && self.delete_locked(&guard).await? {
                removed += 1;
            }

            drop(guard);
            if expired {
                self.locks.forget(guild_id);
            }
        }

        if removed > 0 {
            info!("🧹 Limpiadas {} colas inactivas", removed);
        }
        Ok(removed)
    }
}
