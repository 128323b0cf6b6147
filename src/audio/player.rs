use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        effects::{AudioFilters, FilterPreset},
        locks::GuildGuard,
        queue::{Advance, GuildQueue, LoopMode, PlayerState, QueueUpdate, MAX_VOLUME},
        queue_manager::QueueManager,
        track::Track,
    },
    engine::{
        EngineEvent, EngineEventKind, EngineTrack, PlaybackEngine, TrackEndReason,
        ENGINE_DEFAULT_VOLUME,
    },
    error::{MusicError, Result},
    events::MusicEvent,
    ids::{ChannelId, GuildId},
    storage::StatsStore,
};

/// Conexión de voz activa de un guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSession {
    pub voice_channel_id: ChannelId,
    pub text_channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
}

/// Picks a track when the queue runs out and autoplay is on.
#[async_trait]
pub trait AutoplayPolicy: Send + Sync {
    async fn next_track(&self, queue: &GuildQueue) -> Option<Track>;
}

/// Autoplay that never finds anything, so playback just stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopOnExhausted;

#[async_trait]
impl AutoplayPolicy for StopOnExhausted {
    async fn next_track(&self, _queue: &GuildQueue) -> Option<Track> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Attempt `n` waits `backoff * n`.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

struct ReconnectState {
    attempts: u32,
    cancel: CancellationToken,
}

/// Coordinador del reproductor: sesiones del motor y reacción a sus eventos.
///
/// Commands and engine events for one guild run under that guild's lock, the
/// same one [`QueueManager`] uses, so a `trackEnd` advance never races a
/// `skip`. Engine events enter through [`PlayerManager::dispatch`], which
/// queues them on a per-guild mailbox drained by its own task.
pub struct PlayerManager {
    engine: Arc<dyn PlaybackEngine>,
    queues: Arc<QueueManager>,
    stats: Arc<dyn StatsStore>,
    sessions: DashMap<GuildId, PlayerSession>,
    mailboxes: DashMap<GuildId, mpsc::UnboundedSender<EngineEvent>>,
    reconnects: DashMap<GuildId, ReconnectState>,
    autoplay: Arc<dyn AutoplayPolicy>,
    reconnect: ReconnectPolicy,
}

impl PlayerManager {
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        queues: Arc<QueueManager>,
        stats: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            engine,
            queues,
            stats,
            sessions: DashMap::new(),
            mailboxes: DashMap::new(),
            reconnects: DashMap::new(),
            autoplay: Arc::new(StopOnExhausted),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_autoplay(mut self, policy: Arc<dyn AutoplayPolicy>) -> Self {
        self.autoplay = policy;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    fn emit(&self, guild_id: GuildId, event: MusicEvent) {
        self.queues.bus().publish(guild_id, event);
    }

    pub fn has_session(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    pub fn session(&self, guild_id: GuildId) -> Option<PlayerSession> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Crea la sesión de voz y restaura volumen, filtros y loop guardados.
    pub async fn create_player(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
    ) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if self.has_session(guild_id) {
            return Err(MusicError::SessionAlreadyExists(guild_id));
        }

        let mut queue = self.queues.load_locked(&guard).await?;
        self.engine
            .create_session(guild_id, voice_channel_id, text_channel_id)
            .await?;
        self.sessions.insert(
            guild_id,
            PlayerSession {
                voice_channel_id,
                text_channel_id,
                created_at: Utc::now(),
            },
        );

        if queue.volume != ENGINE_DEFAULT_VOLUME {
            if let Err(e) = self.engine.set_volume(guild_id, queue.volume).await {
                warn!("No se pudo restaurar el volumen en guild {}: {}", guild_id, e);
            }
        }
        if !queue.filters.is_empty() {
            if let Err(e) = self.engine.set_filters(guild_id, &queue.filters).await {
                warn!("No se pudieron restaurar los filtros en guild {}: {}", guild_id, e);
            }
        }
        if queue.loop_mode != LoopMode::Off {
            if let Err(e) = self.engine.set_loop(guild_id, queue.loop_mode).await {
                warn!("No se pudo restaurar el loop en guild {}: {}", guild_id, e);
            }
        }

        queue.voice_channel_id = Some(voice_channel_id);
        queue.text_channel_id = Some(text_channel_id);
        let update = QueueUpdate {
            voice_channel_id: Some(Some(voice_channel_id)),
            text_channel_id: Some(Some(text_channel_id)),
            ..Default::default()
        };
        if let Err(e) = self.queues.commit(&guard, queue, update).await {
            warn!("No se guardaron los canales del guild {}: {}", guild_id, e);
        }

        info!("🔊 Player creado en guild {} (canal {})", guild_id, voice_channel_id);
        self.emit(
            guild_id,
            MusicEvent::VoiceJoin {
                channel_id: voice_channel_id,
            },
        );
        Ok(())
    }

    /// Cierra la sesión y borra la cola persistida por completo.
    ///
    /// Without a live session this is a no-op: the queue is kept and no
    /// `voice:leave` is emitted.
    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        self.destroy_locked(&guard).await
    }

    async fn destroy_locked(&self, guard: &GuildGuard) -> Result<()> {
        let guild_id = guard.guild_id();
        let session = self.sessions.remove(&guild_id).map(|(_, s)| s);

        if let Some((_, pending)) = self.reconnects.remove(&guild_id) {
            pending.cancel.cancel();
        }
        self.mailboxes.remove(&guild_id);

        let Some(session) = session else {
            debug!("Sin player que destruir en guild {}", guild_id);
            return Ok(());
        };

        if let Err(e) = self.engine.destroy(guild_id).await {
            warn!("El motor no pudo destruir el player de {}: {}", guild_id, e);
        }
        self.queues.delete_locked(guard).await?;

        info!("👋 Player destruido en guild {}", guild_id);
        self.emit(
            guild_id,
            MusicEvent::VoiceLeave {
                channel_id: session.voice_channel_id,
            },
        );
        Ok(())
    }

    pub async fn play_track(&self, guild_id: GuildId, track: Track) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        self.play_track_locked(&guard, track).await
    }

    async fn play_track_locked(&self, guard: &GuildGuard, track: Track) -> Result<()> {
        let guild_id = guard.guild_id();
        if !self.has_session(guild_id) {
            return Err(MusicError::NoSession(guild_id));
        }

        self.engine.play(guild_id, &track.encoded).await?;

        let mut queue = self.queues.load_locked(guard).await?;
        queue.is_playing = !queue.is_empty();
        queue.is_paused = false;
        let update = QueueUpdate {
            is_playing: Some(queue.is_playing),
            is_paused: Some(false),
            ..Default::default()
        };
        self.queues.commit(guard, queue, update).await?;

        info!("▶️ Reproduciendo en guild {}: {}", guild_id, track.title());
        self.emit(guild_id, MusicEvent::PlayerPlay { track });
        Ok(())
    }

    /// Reproduce el track bajo el cursor; `None` si la cola ya terminó.
    pub async fn play_current(&self, guild_id: GuildId) -> Result<Option<Track>> {
        let guard = self.queues.locks().lock(guild_id).await;
        let queue = self.queues.load_locked(&guard).await?;
        let Some(track) = queue.current_track().cloned() else {
            return Ok(None);
        };
        self.play_track_locked(&guard, track.clone()).await?;
        Ok(Some(track))
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }

        self.engine.pause(guild_id).await?;
        let mut queue = self.queues.load_locked(&guard).await?;
        queue.is_paused = true;
        let update = QueueUpdate {
            is_paused: Some(true),
            ..Default::default()
        };
        self.queues.commit(&guard, queue, update).await?;

        debug!("⏸️ Pausado en guild {}", guild_id);
        self.emit(guild_id, MusicEvent::PlayerPause {});
        Ok(())
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }
        self.resume_locked(&guard).await
    }

    /// Unlike [`resume`](Self::resume), fails with `NoSession`; the
    /// reconnection loop relies on that to stop after a destroy.
    async fn resume_locked(&self, guard: &GuildGuard) -> Result<()> {
        let guild_id = guard.guild_id();
        if !self.has_session(guild_id) {
            return Err(MusicError::NoSession(guild_id));
        }

        self.engine.resume(guild_id).await?;
        let mut queue = self.queues.load_locked(guard).await?;
        queue.is_paused = false;
        let update = QueueUpdate {
            is_paused: Some(false),
            ..Default::default()
        };
        self.queues.commit(guard, queue, update).await?;

        debug!("▶️ Reanudado en guild {}", guild_id);
        self.emit(guild_id, MusicEvent::PlayerResume {});
        Ok(())
    }

    /// Detiene y rebobina la cola al inicio.
    pub async fn stop(&self, guild_id: GuildId) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }
        let queue = self.queues.load_locked(&guard).await?;
        self.stop_locked(&guard, queue, true).await
    }

    /// `rewind` resets the cursor to 0; the end-of-queue stop keeps it at
    /// `len` so the queue reads as finished.
    async fn stop_locked(&self, guard: &GuildGuard, mut queue: GuildQueue, rewind: bool) -> Result<()> {
        let guild_id = guard.guild_id();
        self.engine.stop(guild_id).await?;

        queue.is_playing = false;
        queue.is_paused = false;
        if rewind {
            queue.current_index = 0;
        }
        let update = QueueUpdate {
            current_index: Some(queue.current_index),
            is_playing: Some(false),
            is_paused: Some(false),
            ..Default::default()
        };
        self.queues.commit(guard, queue, update).await?;

        info!("⏹️ Reproducción detenida en guild {}", guild_id);
        self.emit(guild_id, MusicEvent::PlayerStop {});
        Ok(())
    }

    /// Salta el track actual; devuelve el que se saltó.
    ///
    /// The engine reports the interrupted track as `stopped`, which never
    /// advances, so the advance happens here. Loop-track is ignored: a skip
    /// always moves on.
    pub async fn skip(&self, guild_id: GuildId) -> Result<Option<Track>> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(None);
        }

        let skipped = self.queues.load_locked(&guard).await?.current_track().cloned();
        self.engine.stop(guild_id).await?;

        info!("⏭️ Skip en guild {}", guild_id);
        self.emit(
            guild_id,
            MusicEvent::PlayerSkip {
                skipped_track: skipped.clone(),
            },
        );
        self.advance_locked(&guard, true).await?;
        Ok(skipped)
    }

    pub async fn seek(&self, guild_id: GuildId, position_ms: u64) -> Result<()> {
        let _guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }
        self.engine.seek(guild_id, position_ms).await?;
        self.emit(
            guild_id,
            MusicEvent::PlayerSeek {
                position: position_ms,
            },
        );
        Ok(())
    }

    /// Clamps to `0..=1000` and returns the applied level.
    pub async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<u16> {
        let volume = volume.min(MAX_VOLUME);
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(volume);
        }

        self.engine.set_volume(guild_id, volume).await?;
        let mut queue = self.queues.load_locked(&guard).await?;
        queue.volume = volume;
        let update = QueueUpdate {
            volume: Some(volume),
            ..Default::default()
        };
        self.queues.commit(&guard, queue, update).await?;

        debug!("🔊 Volumen {} en guild {}", volume, guild_id);
        self.emit(guild_id, MusicEvent::PlayerVolume { volume });
        Ok(volume)
    }

    pub async fn set_filters(&self, guild_id: GuildId, filters: AudioFilters) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }

        self.engine.set_filters(guild_id, &filters).await?;
        let mut queue = self.queues.load_locked(&guard).await?;
        queue.filters = filters.clone();
        let update = QueueUpdate {
            filters: Some(filters.clone()),
            ..Default::default()
        };
        self.queues.commit(&guard, queue, update).await?;

        self.emit(guild_id, MusicEvent::PlayerFilters { filters });
        Ok(())
    }

    pub async fn apply_filter_preset(&self, guild_id: GuildId, name: &str) -> Result<AudioFilters> {
        let preset: FilterPreset = name.parse()?;
        let filters = preset.filters();
        self.set_filters(guild_id, filters.clone()).await?;
        info!("🎛️ Preset {} aplicado en guild {}", preset, guild_id);
        Ok(filters)
    }

    /// Guarda el modo y, si hay sesión, lo pasa al motor.
    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        self.queues.set_loop_mode_locked(&guard, mode).await?;
        if self.has_session(guild_id) {
            self.engine.set_loop(guild_id, mode).await?;
        }
        Ok(())
    }

    /// The bot was moved to another voice channel.
    pub async fn move_voice_channel(&self, guild_id: GuildId, voice_channel_id: ChannelId) -> Result<()> {
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            return Ok(());
        }

        self.engine.move_channel(guild_id, voice_channel_id).await?;
        if let Some(mut session) = self.sessions.get_mut(&guild_id) {
            session.voice_channel_id = voice_channel_id;
        }

        let mut queue = self.queues.load_locked(&guard).await?;
        queue.voice_channel_id = Some(voice_channel_id);
        let update = QueueUpdate {
            voice_channel_id: Some(Some(voice_channel_id)),
            ..Default::default()
        };
        self.queues.commit(&guard, queue, update).await?;

        self.emit(
            guild_id,
            MusicEvent::VoiceJoin {
                channel_id: voice_channel_id,
            },
        );
        Ok(())
    }

    pub async fn player_state(&self, guild_id: GuildId) -> Result<PlayerState> {
        self.queues.player_state(guild_id).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<EngineTrack>> {
        Ok(self.engine.search(query).await?)
    }

    /// Destruye todas las sesiones activas.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|s| *s.key()).collect();
        info!("🛑 Cerrando {} sesiones", guilds.len());

        let results = join_all(guilds.iter().map(|&guild_id| self.destroy_player(guild_id))).await;
        for (guild_id, result) in guilds.iter().zip(results) {
            if let Err(e) = result {
                error!("Error cerrando el player de {}: {}", guild_id, e);
            }
        }
    }

    /// Queues an engine event on the guild's mailbox.
    ///
    /// Events for guilds without a session are dropped.
    pub fn dispatch(self: &Arc<Self>, event: EngineEvent) {
        let guild_id = event.guild_id;
        if !self.has_session(guild_id) {
            debug!("Evento descartado para guild {} sin sesión", guild_id);
            return;
        }

        let tx = self
            .mailboxes
            .entry(guild_id)
            .or_insert_with(|| self.spawn_mailbox(guild_id))
            .clone();
        if tx.send(event).is_err() {
            warn!("Buzón cerrado para guild {}", guild_id);
        }
    }

    fn spawn_mailbox(self: &Arc<Self>, guild_id: GuildId) -> mpsc::UnboundedSender<EngineEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let player = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                player.handle_event(event).await;
            }
            debug!("📭 Buzón de eventos cerrado para guild {}", guild_id);
        });
        tx
    }

    /// Reacts to one engine event under the guild lock.
    pub async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        let guild_id = event.guild_id;
        let guard = self.queues.locks().lock(guild_id).await;
        if !self.has_session(guild_id) {
            debug!("Evento tardío para guild {} ignorado", guild_id);
            return;
        }

        match event.kind {
            EngineEventKind::TrackStart { track } => {
                if let Ok(queue) = self.queues.load_locked(&guard).await {
                    if let Err(e) = self.queues.commit(&guard, queue, QueueUpdate::default()).await {
                        warn!("No se registró actividad en guild {}: {}", guild_id, e);
                    }
                }
                if let Err(e) = self.stats.record_play(guild_id, track.info.length_ms).await {
                    warn!("📊 Estadísticas no actualizadas para guild {}: {}", guild_id, e);
                }
                self.emit(guild_id, MusicEvent::TrackStart { track });
            }
            EngineEventKind::TrackEnd { track, reason } => {
                let advance = reason == TrackEndReason::Finished
                    && self.is_current_locked(&guard, &track).await;
                self.emit(guild_id, MusicEvent::TrackEnd { track, reason });
                if advance {
                    if let Err(e) = self.advance_locked(&guard, false).await {
                        error!("❌ Error avanzando la cola de {}: {}", guild_id, e);
                    }
                }
            }
            EngineEventKind::TrackStuck { track, threshold_ms } => {
                warn!("⚠️ Track atascado en guild {}: {} ({}ms)", guild_id, track.title(), threshold_ms);
                self.emit(guild_id, MusicEvent::TrackStuck { track, threshold_ms });
            }
            EngineEventKind::TrackError { track, message } => {
                warn!("❌ Error de track en guild {}: {}", guild_id, message);
                self.emit(guild_id, MusicEvent::TrackError { track, error: message });
            }
            EngineEventKind::PlayerDisconnect { code, reason } => {
                warn!("🔌 Desconectado en guild {} ({:?}): {}", guild_id, code, reason);
                drop(guard);
                self.start_reconnect(guild_id);
            }
        }
    }

    /// Whether `track` is still the one under the cursor.
    ///
    /// A `trackEnd` that arrives after a skip or stop names a track the queue
    /// already moved past and must not advance it again.
    async fn is_current_locked(&self, guard: &GuildGuard, track: &Track) -> bool {
        let guild_id = guard.guild_id();
        match self.queues.load_locked(guard).await {
            Ok(queue) => match queue.current_track() {
                Some(current) if current.encoded == track.encoded => true,
                current => {
                    debug!(
                        "trackEnd obsoleto en guild {}: {} (actual: {:?})",
                        guild_id,
                        track.identifier(),
                        current.map(Track::identifier)
                    );
                    false
                }
            },
            Err(e) => {
                error!("❌ No se pudo leer la cola de {}: {}", guild_id, e);
                false
            }
        }
    }

    /// Moves past the finished track and plays what comes next.
    async fn advance_locked(&self, guard: &GuildGuard, skipping: bool) -> Result<()> {
        let guild_id = guard.guild_id();
        let mut queue = self.queues.load_locked(guard).await?;

        // El motor repite el track por su cuenta
        if queue.loop_mode == LoopMode::Track && !skipping {
            return Ok(());
        }

        match queue.advance() {
            Advance::Next(track) => {
                let update = QueueUpdate::contents(&queue);
                self.queues.commit(guard, queue, update).await?;
                self.play_track_locked(guard, track).await
            }
            Advance::Exhausted => {
                let settings = self.queues.guild_settings(guild_id).await?;
                if queue.autoplay && settings.autoplay {
                    if let Some(next) = self.autoplay.next_track(&queue).await {
                        info!("🎲 Autoplay en guild {}: {}", guild_id, next.title());
                        queue.tracks.push(next.clone());
                        let update = QueueUpdate::contents(&queue);
                        let queue = self.queues.commit(guard, queue, update).await?;
                        self.emit(
                            guild_id,
                            MusicEvent::QueueAdd {
                                tracks: vec![next.clone()],
                            },
                        );
                        self.emit(
                            guild_id,
                            MusicEvent::QueueUpdate {
                                queue: queue.tracks,
                            },
                        );
                        return self.play_track_locked(guard, next).await;
                    }
                }

                debug!("Fin de la cola en guild {}", guild_id);
                self.stop_locked(guard, queue, false).await
            }
        }
    }

    fn start_reconnect(self: &Arc<Self>, guild_id: GuildId) {
        let cancel = match self.reconnects.entry(guild_id) {
            Entry::Occupied(_) => {
                debug!("Reconexión ya en curso para guild {}", guild_id);
                return;
            }
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(ReconnectState {
                    attempts: 0,
                    cancel: cancel.clone(),
                });
                cancel
            }
        };

        let player = Arc::clone(self);
        tokio::spawn(async move { player.reconnect_loop(guild_id, cancel).await });
    }

    pub fn reconnect_attempts(&self, guild_id: GuildId) -> Option<u32> {
        self.reconnects.get(&guild_id).map(|s| s.attempts)
    }

    async fn reconnect_loop(&self, guild_id: GuildId, cancel: CancellationToken) {
        let policy = self.reconnect;

        for attempt in 1..=policy.max_attempts {
            if let Some(mut state) = self.reconnects.get_mut(&guild_id) {
                state.attempts = attempt;
            }
            let delay = policy.backoff * attempt;
            info!(
                "🔄 Reconexión {}/{} para guild {} en {:?}",
                attempt, policy.max_attempts, guild_id, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reconexión cancelada para guild {}", guild_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let guard = self.queues.locks().lock(guild_id).await;
            if cancel.is_cancelled() {
                return;
            }
            match self.resume_locked(&guard).await {
                Ok(()) => {
                    info!("✅ Reconectado en guild {}", guild_id);
                    self.reconnects.remove(&guild_id);
                    return;
                }
                Err(MusicError::NoSession(_)) => {
                    self.reconnects.remove(&guild_id);
                    return;
                }
                Err(e) => warn!("Intento {} fallido en guild {}: {}", attempt, guild_id, e),
            }
        }

        let guard = self.queues.locks().lock(guild_id).await;
        if cancel.is_cancelled() {
            return;
        }
        self.reconnects.remove(&guild_id);

        let exhausted = MusicError::ReconnectExhausted {
            guild: guild_id,
            attempts: policy.max_attempts,
        };
        error!("❌ {}", exhausted);
        self.emit(
            guild_id,
            MusicEvent::VoiceError {
                error: exhausted.to_string(),
            },
        );
        if let Err(e) = self.destroy_locked(&guard).await {
            error!("Error destruyendo el player de {}: {}", guild_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::locks::GuildLocks,
        engine::MockPlaybackEngine,
        events::{EventBus, Subscription},
        storage::{MemoryStorage, QueueStore},
        ids::UserId,
        testing::{engine_track, track, EngineCall, FakeEngine},
    };
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(42);
    const VOICE: ChannelId = ChannelId::new(1);
    const TEXT: ChannelId = ChannelId::new(2);

    struct Harness {
        player: Arc<PlayerManager>,
        engine: Arc<FakeEngine>,
        storage: MemoryStorage,
    }

    fn build(engine: Arc<dyn PlaybackEngine>, storage: &MemoryStorage) -> PlayerManager {
        let queues = QueueManager::new(
            Arc::new(storage.clone()),
            Arc::new(storage.clone()),
            Arc::new(EventBus::new()),
            Arc::new(GuildLocks::new()),
        );
        PlayerManager::new(engine, Arc::new(queues), Arc::new(storage.clone()))
    }

    fn harness() -> Harness {
        let engine = Arc::new(FakeEngine::new());
        let storage = MemoryStorage::new();
        let player = Arc::new(build(engine.clone(), &storage));
        Harness {
            player,
            engine,
            storage,
        }
    }

    impl Harness {
        async fn with_queue(&self, ids: &[&str]) {
            let tracks = ids.iter().map(|id| track(id)).collect();
            self.player.queues().add_tracks(GUILD, tracks, None).await.unwrap();
        }

        fn subscribe(&self) -> Subscription {
            self.player.queues().bus().subscribe(GUILD)
        }

        async fn queue(&self) -> GuildQueue {
            self.player.queues().queue_info(GUILD).await.unwrap()
        }

        fn finished(&self, id: &str) -> EngineEvent {
            EngineEvent::new(
                GUILD,
                EngineEventKind::TrackEnd {
                    track: track(id),
                    reason: TrackEndReason::Finished,
                },
            )
        }
    }

    fn names(sub: &mut Subscription) -> Vec<&'static str> {
        sub.drain().iter().map(|e| e.event.name()).collect()
    }

    #[tokio::test]
    async fn test_create_player_twice_fails() {
        let h = harness();
        let mut sub = h.subscribe();

        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        assert!(matches!(
            h.player.create_player(GUILD, VOICE, TEXT).await,
            Err(MusicError::SessionAlreadyExists(g)) if g == GUILD
        ));

        assert_eq!(names(&mut sub), vec!["voice:join"]);
        assert_eq!(h.engine.calls(), vec![EngineCall::CreateSession(GUILD, VOICE, TEXT)]);
        assert_eq!(h.queue().await.voice_channel_id, Some(VOICE));
    }

    #[tokio::test]
    async fn test_create_player_restores_saved_settings() {
        let storage = MemoryStorage::new();
        storage
            .save(
                GUILD,
                &QueueUpdate {
                    volume: Some(250),
                    filters: Some(FilterPreset::Nightcore.filters()),
                    loop_mode: Some(LoopMode::Queue),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut engine = MockPlaybackEngine::new();
        engine
            .expect_create_session()
            .with(eq(GUILD), eq(VOICE), eq(TEXT))
            .times(1)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_set_volume()
            .with(eq(GUILD), eq(250))
            .times(1)
            .returning(|_, _| Ok(()));
        engine
            .expect_set_filters()
            .withf(|guild, filters| *guild == GUILD && filters.nightcore == Some(true))
            .times(1)
            .returning(|_, _| Ok(()));
        engine
            .expect_set_loop()
            .with(eq(GUILD), eq(LoopMode::Queue))
            .times(1)
            .returning(|_, _| Ok(()));

        let player = build(Arc::new(engine), &storage);
        player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        assert!(player.has_session(GUILD));
    }

    #[tokio::test]
    async fn test_commands_without_session() {
        let h = harness();
        let mut sub = h.subscribe();

        assert!(matches!(
            h.player.play_track(GUILD, track("A")).await,
            Err(MusicError::NoSession(_))
        ));
        h.player.pause(GUILD).await.unwrap();
        h.player.resume(GUILD).await.unwrap();
        h.player.stop(GUILD).await.unwrap();
        assert_eq!(h.player.skip(GUILD).await.unwrap(), None);
        h.player.seek(GUILD, 1_000).await.unwrap();
        assert_eq!(h.player.set_volume(GUILD, 5_000).await.unwrap(), MAX_VOLUME);

        assert!(h.engine.calls().is_empty());
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_deletes_queue_and_blocks_later_commands() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        let mut sub = h.subscribe();

        h.player.destroy_player(GUILD).await.unwrap();

        assert!(!h.player.has_session(GUILD));
        assert_eq!(h.storage.queue_count(), 0);
        assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Destroy(_))), 1);
        assert_eq!(names(&mut sub), vec!["voice:leave"]);
        assert!(matches!(
            h.player.play_track(GUILD, track("A")).await,
            Err(MusicError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn test_track_end_advances_to_next() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.queues().set_autoplay(GUILD, false).await.unwrap();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.play_current(GUILD).await.unwrap();
        h.engine.clear_calls();

        h.player.handle_event(h.finished("A")).await;

        let queue = h.queue().await;
        assert_eq!(queue.current_index, 1);
        assert!(queue.is_playing);
        assert_eq!(h.engine.calls(), vec![EngineCall::Play(GUILD, "enc:B".into())]);
    }

    #[tokio::test]
    async fn test_track_end_at_end_of_queue_stops() {
        let h = harness();
        h.with_queue(&["A"]).await;
        h.player.queues().set_autoplay(GUILD, false).await.unwrap();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.play_current(GUILD).await.unwrap();
        let mut sub = h.subscribe();

        h.player.handle_event(h.finished("A")).await;

        let queue = h.queue().await;
        assert_eq!(queue.current_index, 1);
        assert!(!queue.is_playing);
        assert!(queue.invariants_hold());
        assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Stop(_))), 1);
        assert_eq!(names(&mut sub), vec!["track:end", "player:stop"]);
    }

    #[tokio::test]
    async fn test_loop_track_leaves_cursor_alone() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.set_loop_mode(GUILD, LoopMode::Track).await.unwrap();
        h.engine.clear_calls();

        h.player.handle_event(h.finished("A")).await;

        assert_eq!(h.queue().await.current_index, 0);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_loop_queue_appends_finished_track() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.set_loop_mode(GUILD, LoopMode::Queue).await.unwrap();

        h.player.handle_event(h.finished("A")).await;

        let queue = h.queue().await;
        let ids: Vec<_> = queue.tracks.iter().map(Track::identifier).collect();
        assert_eq!(ids, vec!["A", "B", "A"]);
        assert_eq!(queue.current_index, 1);
    }

    struct Radio;

    #[async_trait]
    impl AutoplayPolicy for Radio {
        async fn next_track(&self, _queue: &GuildQueue) -> Option<Track> {
            Some(track("R"))
        }
    }

    #[tokio::test]
    async fn test_autoplay_policy_extends_queue() {
        let engine = Arc::new(FakeEngine::new());
        let storage = MemoryStorage::new();
        let player = Arc::new(build(engine.clone(), &storage).with_autoplay(Arc::new(Radio)));
        player
            .queues()
            .add_tracks(GUILD, vec![track("A")], None)
            .await
            .unwrap();
        player.create_player(GUILD, VOICE, TEXT).await.unwrap();

        player
            .handle_event(EngineEvent::new(
                GUILD,
                EngineEventKind::TrackEnd {
                    track: track("A"),
                    reason: TrackEndReason::Finished,
                },
            ))
            .await;

        let queue = player.queues().queue_info(GUILD).await.unwrap();
        assert_eq!(queue.current_track(), Some(&track("R")));
        assert_eq!(engine.count(|c| *c == EngineCall::Play(GUILD, "enc:R".into())), 1);
    }

    #[tokio::test]
    async fn test_skip_reports_skipped_and_plays_next() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.set_loop_mode(GUILD, LoopMode::Track).await.unwrap();
        let mut sub = h.subscribe();

        let skipped = h.player.skip(GUILD).await.unwrap();

        assert_eq!(skipped, Some(track("A")));
        assert_eq!(h.queue().await.current_index, 1);
        assert_eq!(names(&mut sub), vec!["player:skip", "player:play"]);
    }

    #[tokio::test]
    async fn test_late_track_end_after_skip_does_not_advance() {
        let h = harness();
        h.with_queue(&["A", "B", "C"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.play_current(GUILD).await.unwrap();
        h.player.skip(GUILD).await.unwrap();
        let mut sub = h.subscribe();

        // El motor todavía reporta el final de A
        h.player.handle_event(h.finished("A")).await;

        let queue = h.queue().await;
        assert_eq!(queue.current_index, 1);
        assert_eq!(queue.current_track(), Some(&track("B")));
        let plays: Vec<_> = h
            .engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Play(_, encoded) => Some(encoded),
                _ => None,
            })
            .collect();
        assert_eq!(plays, vec!["enc:A", "enc:B"]);
        assert_eq!(names(&mut sub), vec!["track:end"]);

        // El final de B sí avanza
        h.player.handle_event(h.finished("B")).await;
        assert_eq!(h.queue().await.current_track(), Some(&track("C")));
    }

    #[tokio::test]
    async fn test_destroy_without_session_keeps_queue() {
        let h = harness();
        h.with_queue(&["A"]).await;
        let mut sub = h.subscribe();

        h.player.destroy_player(GUILD).await.unwrap();

        assert_eq!(h.storage.queue_count(), 1);
        assert!(h.engine.calls().is_empty());
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_search_and_add_through_engine() {
        let h = harness();
        let requester = UserId::new(7);
        h.engine.set_search_results(vec![engine_track("X"), engine_track("Y")]);

        let player = h.player.clone();
        let added = h
            .player
            .queues()
            .search_and_add(GUILD, "lofi", requester, |query| async move {
                player.search(&query).await
            })
            .await
            .unwrap();

        let ids: Vec<_> = added.iter().map(Track::identifier).collect();
        assert_eq!(ids, vec!["X", "Y"]);
        assert!(added.iter().all(|t| t.requested_by == Some(requester)));
        assert_eq!(h.queue().await.len(), 2);

        h.engine.set_search_results(Vec::new());
        let player = h.player.clone();
        let empty = h
            .player
            .queues()
            .search_and_add(GUILD, "silence", requester, |query| async move {
                player.search(&query).await
            })
            .await;
        assert!(matches!(empty, Err(MusicError::NoResults { query }) if query == "silence"));
    }

    #[tokio::test]
    async fn test_stop_rewinds_and_non_finished_end_does_not_advance() {
        let h = harness();
        h.with_queue(&["A", "B"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.play_current(GUILD).await.unwrap();

        h.player
            .handle_event(EngineEvent::new(
                GUILD,
                EngineEventKind::TrackEnd {
                    track: track("A"),
                    reason: TrackEndReason::Replaced,
                },
            ))
            .await;
        assert_eq!(h.queue().await.current_index, 0);

        h.player.queues().move_track(GUILD, 1, 0).await.unwrap();
        h.player.stop(GUILD).await.unwrap();
        let queue = h.queue().await;
        assert_eq!(queue.current_index, 0);
        assert!(!queue.is_playing);
    }

    #[tokio::test]
    async fn test_controls_persist_and_emit() {
        let h = harness();
        h.with_queue(&["A"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player.play_current(GUILD).await.unwrap();
        let mut sub = h.subscribe();

        h.player.pause(GUILD).await.unwrap();
        assert!(h.queue().await.is_paused);
        h.player.resume(GUILD).await.unwrap();
        assert!(!h.queue().await.is_paused);
        assert_eq!(h.player.set_volume(GUILD, 1_500).await.unwrap(), 1_000);
        assert_eq!(h.queue().await.volume, 1_000);
        h.player.seek(GUILD, 30_000).await.unwrap();

        assert_eq!(
            names(&mut sub),
            vec!["player:pause", "player:resume", "player:volume", "player:seek"]
        );
        assert!(h.engine.calls().contains(&EngineCall::Seek(GUILD, 30_000)));
    }

    #[tokio::test]
    async fn test_filter_presets() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();

        let filters = h.player.apply_filter_preset(GUILD, "vaporwave").await.unwrap();
        assert_eq!(filters.vaporwave, Some(true));
        assert_eq!(h.queue().await.filters, filters);

        assert!(matches!(
            h.player.apply_filter_preset(GUILD, "chipmunk").await,
            Err(MusicError::UnknownPreset(_))
        ));

        h.player.apply_filter_preset(GUILD, "reset").await.unwrap();
        assert!(h.queue().await.filters.is_empty());
    }

    #[tokio::test]
    async fn test_move_voice_channel() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        let other = ChannelId::new(9);

        h.player.move_voice_channel(GUILD, other).await.unwrap();

        assert_eq!(h.player.session(GUILD).unwrap().voice_channel_id, other);
        assert_eq!(h.queue().await.voice_channel_id, Some(other));
        assert!(h.engine.calls().contains(&EngineCall::Move(GUILD, other)));
    }

    #[tokio::test]
    async fn test_track_start_records_stats() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        let mut sub = h.subscribe();

        h.player
            .handle_event(EngineEvent::new(GUILD, EngineEventKind::TrackStart { track: track("A") }))
            .await;

        let stats = h.storage.stats(GUILD).await.unwrap();
        assert_eq!(stats.total_tracks_played, 1);
        assert_eq!(stats.total_listening_time_ms, 180_000);
        assert_eq!(names(&mut sub), vec!["track:start"]);
    }

    #[tokio::test]
    async fn test_dispatch_goes_through_mailbox() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        let mut sub = h.subscribe();

        h.player.dispatch(EngineEvent::new(
            GUILD,
            EngineEventKind::TrackStuck {
                track: track("A"),
                threshold_ms: 10_000,
            },
        ));

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event.name(), "track:stuck");

        // Sin sesión los eventos se descartan
        h.player.destroy_player(GUILD).await.unwrap();
        h.player.dispatch(h.finished("A"));
        assert!(h.player.mailboxes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_destroys_once() {
        let h = harness();
        h.with_queue(&["A"]).await;
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.engine.fail_resume(true);
        let mut sub = h.subscribe();

        let disconnect = EngineEvent::new(
            GUILD,
            EngineEventKind::PlayerDisconnect {
                code: Some(4014),
                reason: "Disconnected.".into(),
            },
        );
        for _ in 0..3 {
            h.player.handle_event(disconnect.clone()).await;
        }
        assert!(h.player.reconnect_attempts(GUILD).is_some());

        // 5s + 10s + 15s de espera
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.engine.resume_attempts(), 3);
        assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Destroy(_))), 1);
        assert!(!h.player.has_session(GUILD));
        assert_eq!(h.player.reconnect_attempts(GUILD), None);
        assert_eq!(names(&mut sub), vec!["voice:error", "voice:leave"]);

        h.player.handle_event(disconnect).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.engine.resume_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resets() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.engine.fail_resume(true);

        h.player
            .handle_event(EngineEvent::new(
                GUILD,
                EngineEventKind::PlayerDisconnect {
                    code: None,
                    reason: "gone".into(),
                },
            ))
            .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.engine.resume_attempts(), 1);
        h.engine.fail_resume(false);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(h.engine.resume_attempts(), 2);
        assert!(h.player.has_session(GUILD));
        assert_eq!(h.player.reconnect_attempts(GUILD), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_pending_reconnect() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player
            .handle_event(EngineEvent::new(
                GUILD,
                EngineEventKind::PlayerDisconnect {
                    code: None,
                    reason: "gone".into(),
                },
            ))
            .await;

        h.player.destroy_player(GUILD).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.engine.resume_attempts(), 0);
        assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Destroy(_))), 1);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let h = harness();
        h.player.create_player(GUILD, VOICE, TEXT).await.unwrap();
        h.player
            .create_player(GuildId::new(43), VOICE, TEXT)
            .await
            .unwrap();

        h.player.shutdown().await;

        assert_eq!(h.player.active_sessions(), 0);
        assert_eq!(h.engine.count(|c| matches!(c, EngineCall::Destroy(_))), 2);
    }
}
