//! # Storage Module
//!
//! Document storage for per-guild queues, guild settings and listening
//! statistics.
//!
//! The coordinators only talk to the traits defined here:
//!
//! - [`QueueStore`]: one queue document per guild, partial updates, expiry candidates
//! - [`SettingsStore`]: read-mostly guild settings (limits, duplicate policy)
//! - [`StatsStore`]: fire-and-forget play counters
//!
//! Two backends implement all three: [`JsonStorage`] (one JSON file per guild
//! and collection) and [`MemoryStorage`] (process-local, for tests and
//! ephemeral deployments).

pub mod json;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    audio::queue::{GuildQueue, QueueUpdate},
    error::StorageError,
    ids::GuildId,
};

pub use json::JsonStorage;
pub use memory::MemoryStorage;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Configuración de un guild que el núcleo consulta pero no modifica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuildSettings {
    pub max_queue_length: usize,
    pub allow_duplicates: bool,
    pub autoplay: bool,
    pub default_volume: u16,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            max_queue_length: 1000,
            allow_duplicates: true,
            autoplay: true,
            default_volume: 100,
        }
    }
}

/// Estadísticas acumuladas de reproducción.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuildStats {
    pub total_tracks_played: u64,
    pub total_listening_time_ms: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self, guild_id: GuildId) -> StorageResult<Option<GuildQueue>>;

    /// Upsert: a missing document is created from defaults before applying.
    async fn save(&self, guild_id: GuildId, update: &QueueUpdate) -> StorageResult<()>;

    /// Returns whether a document existed.
    async fn delete(&self, guild_id: GuildId) -> StorageResult<bool>;

    /// Guilds whose queue has been idle since before `cutoff` and is not
    /// playing. Nothing is deleted here; the caller re-checks under the
    /// guild lock and calls [`delete`](Self::delete).
    async fn inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<GuildId>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Defaults when the guild never saved settings.
    async fn settings(&self, guild_id: GuildId) -> StorageResult<GuildSettings>;

    async fn save_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> StorageResult<()>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn record_play(&self, guild_id: GuildId, duration_ms: u64) -> StorageResult<()>;

    async fn stats(&self, guild_id: GuildId) -> StorageResult<GuildStats>;
}

/// Whether a queue qualifies for the expiry sweep.
pub(crate) fn is_expired(queue: &GuildQueue, cutoff: DateTime<Utc>) -> bool {
    queue.last_activity < cutoff && !queue.is_playing
}
