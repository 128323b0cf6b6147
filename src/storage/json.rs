use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{
    is_expired, GuildSettings, GuildStats, QueueStore, SettingsStore, StatsStore, StorageResult,
};
use crate::{
    audio::queue::{GuildQueue, QueueUpdate},
    ids::GuildId,
};

const QUEUES: &str = "queues";
const SETTINGS: &str = "settings";
const STATS: &str = "stats";

/// Almacenamiento basado en archivos JSON
///
/// Layout: `<data_dir>/<collection>/guild_<id>.json`, one pretty-printed
/// document per guild. Writes for a single guild are serialized by the
/// coordinators' guild locks, so no file locking happens here.
pub struct JsonStorage {
    data_dir: PathBuf,
    defaults: GuildSettings,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> StorageResult<Self> {
        for collection in [QUEUES, SETTINGS, STATS] {
            fs::create_dir_all(data_dir.join(collection)).await?;
        }

        info!("📁 Storage inicializado en: {}", data_dir.display());
        Ok(Self {
            data_dir,
            defaults: GuildSettings::default(),
        })
    }

    /// Settings returned for guilds without a settings document.
    pub fn with_default_settings(mut self, defaults: GuildSettings) -> Self {
        self.defaults = defaults;
        self
    }

    fn file_path(&self, collection: &str, guild_id: GuildId) -> PathBuf {
        self.data_dir
            .join(collection)
            .join(format!("guild_{}.json", guild_id))
    }

    async fn read<T: DeserializeOwned>(
        &self,
        collection: &str,
        guild_id: GuildId,
    ) -> StorageResult<Option<T>> {
        match fs::read_to_string(self.file_path(collection, guild_id)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize>(
        &self,
        collection: &str,
        guild_id: GuildId,
        document: &T,
    ) -> StorageResult<()> {
        let path = self.file_path(collection, guild_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(document)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, collection: &str, guild_id: GuildId) -> StorageResult<bool> {
        match fs::remove_file(self.file_path(collection, guild_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lista los guilds con documento en una colección
    async fn guild_ids(&self, collection: &str) -> StorageResult<Vec<GuildId>> {
        let mut files = fs::read_dir(self.data_dir.join(collection)).await?;
        let mut ids = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<GuildId>().ok());
            if let Some(guild_id) = parsed {
                ids.push(guild_id);
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl QueueStore for JsonStorage {
    async fn load(&self, guild_id: GuildId) -> StorageResult<Option<GuildQueue>> {
        self.read(QUEUES, guild_id).await
    }

    async fn save(&self, guild_id: GuildId, update: &QueueUpdate) -> StorageResult<()> {
        let mut queue = match self.read::<GuildQueue>(QUEUES, guild_id).await? {
            Some(queue) => queue,
            None => GuildQueue::new(guild_id, &GuildSettings::default()),
        };
        queue.apply(update);
        self.write(QUEUES, guild_id, &queue).await?;
        debug!("💾 Cola guardada para guild {}", guild_id);
        Ok(())
    }

    async fn delete(&self, guild_id: GuildId) -> StorageResult<bool> {
        self.remove(QUEUES, guild_id).await
    }

    async fn inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<GuildId>> {
        let mut expired = Vec::new();

        for guild_id in self.guild_ids(QUEUES).await? {
            let queue = match self.read::<GuildQueue>(QUEUES, guild_id).await {
                Ok(Some(queue)) => queue,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cola ilegible para guild {}: {}", guild_id, e);
                    continue;
                }
            };

            if is_expired(&queue, cutoff) {
                expired.push(guild_id);
            }
        }

        Ok(expired)
    }
}

#[async_trait]
impl SettingsStore for JsonStorage {
    async fn settings(&self, guild_id: GuildId) -> StorageResult<GuildSettings> {
        Ok(self
            .read(SETTINGS, guild_id)
            .await?
            .unwrap_or_else(|| self.defaults.clone()))
    }

    async fn save_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> StorageResult<()> {
        self.write(SETTINGS, guild_id, settings).await?;
        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }
}

#[async_trait]
impl StatsStore for JsonStorage {
    async fn record_play(&self, guild_id: GuildId, duration_ms: u64) -> StorageResult<()> {
        let mut stats: GuildStats = self.read(STATS, guild_id).await?.unwrap_or_default();
        stats.total_tracks_played += 1;
        stats.total_listening_time_ms += duration_ms;
        stats.updated_at = Some(Utc::now());
        self.write(STATS, guild_id, &stats).await
    }

    async fn stats(&self, guild_id: GuildId) -> StorageResult<GuildStats> {
        Ok(self.read(STATS, guild_id).await?.unwrap_or_default())
    }
}
