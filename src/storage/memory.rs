use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{
    is_expired, GuildSettings, GuildStats, QueueStore, SettingsStore, StatsStore, StorageResult,
};
use crate::{
    audio::queue::{GuildQueue, QueueUpdate},
    ids::GuildId,
};

/// Almacenamiento en memoria, compartible entre clones.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    queues: Arc<DashMap<GuildId, GuildQueue>>,
    settings: Arc<DashMap<GuildId, GuildSettings>>,
    stats: Arc<DashMap<GuildId, GuildStats>>,
    defaults: GuildSettings,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings returned for guilds that never saved their own.
    pub fn with_default_settings(mut self, defaults: GuildSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

#[async_trait]
impl QueueStore for MemoryStorage {
    async fn load(&self, guild_id: GuildId) -> StorageResult<Option<GuildQueue>> {
        Ok(self.queues.get(&guild_id).map(|q| q.clone()))
    }

    async fn save(&self, guild_id: GuildId, update: &QueueUpdate) -> StorageResult<()> {
        self.queues
            .entry(guild_id)
            .or_insert_with(|| GuildQueue::new(guild_id, &GuildSettings::default()))
            .apply(update);
        Ok(())
    }

    async fn delete(&self, guild_id: GuildId) -> StorageResult<bool> {
        Ok(self.queues.remove(&guild_id).is_some())
    }

    async fn inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<GuildId>> {
        Ok(self
            .queues
            .iter()
            .filter(|entry| is_expired(entry.value(), cutoff))
            .map(|entry| *entry.key())
            .collect())
    }
}

#[async_trait]
impl SettingsStore for MemoryStorage {
    async fn settings(&self, guild_id: GuildId) -> StorageResult<GuildSettings> {
        Ok(self
            .settings
            .get(&guild_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| self.defaults.clone()))
    }

    async fn save_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> StorageResult<()> {
        self.settings.insert(guild_id, settings.clone());
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStorage {
    async fn record_play(&self, guild_id: GuildId, duration_ms: u64) -> StorageResult<()> {
        let mut stats = self.stats.entry(guild_id).or_default();
        stats.total_tracks_played += 1;
        stats.total_listening_time_ms += duration_ms;
        stats.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn stats(&self, guild_id: GuildId) -> StorageResult<GuildStats> {
        Ok(self
            .stats
            .get(&guild_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}
