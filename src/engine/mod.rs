//! # Playback Engine
//!
//! The remote audio engine (decoding, streaming, the live voice connection)
//! is reached through the [`PlaybackEngine`] trait. [`lavalink`] implements
//! it against a Lavalink v4 node.
//!
//! The engine's own track shape, [`EngineTrack`], stops at this module:
//! [`EngineTrack::into_track`] is the one conversion into the core
//! [`Track`], and inbound [`EngineEvent`]s already carry core tracks.

pub mod lavalink;
pub mod protocol;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{
    audio::{
        effects::AudioFilters,
        queue::LoopMode,
        track::{Track, TrackInfo},
    },
    error::EngineError,
    ids::{ChannelId, GuildId, UserId},
};

pub use lavalink::{LavalinkConfig, LavalinkEngine};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Volume the engine applies to a fresh session.
pub const ENGINE_DEFAULT_VOLUME: u16 = 100;

/// Control surface of the remote playback engine, keyed by guild.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    async fn create_session(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
    ) -> EngineResult<()>;

    async fn play(&self, guild_id: GuildId, encoded: &str) -> EngineResult<()>;

    async fn pause(&self, guild_id: GuildId) -> EngineResult<()>;

    async fn resume(&self, guild_id: GuildId) -> EngineResult<()>;

    async fn stop(&self, guild_id: GuildId) -> EngineResult<()>;

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> EngineResult<()>;

    /// `volume` is already clamped to `0..=1000`.
    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> EngineResult<()>;

    async fn set_filters(&self, guild_id: GuildId, filters: &AudioFilters) -> EngineResult<()>;

    /// With `LoopMode::Track` the engine repeats the current track by itself.
    async fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> EngineResult<()>;

    async fn move_channel(&self, guild_id: GuildId, voice_channel_id: ChannelId) -> EngineResult<()>;

    async fn search(&self, query: &str) -> EngineResult<Vec<EngineTrack>>;

    async fn destroy(&self, guild_id: GuildId) -> EngineResult<()>;
}

/// Track as the engine describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTrack {
    pub encoded: String,
    pub info: EngineTrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineTrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

impl EngineTrack {
    /// Requester stored in `userData.requester`, as a string or number.
    pub fn requester(&self) -> Option<UserId> {
        match self.user_data.get("requester")? {
            Value::String(id) => id.parse().ok(),
            Value::Number(id) => id.as_u64().map(UserId::new),
            _ => None,
        }
    }

    /// Converts into the core track, stamped with who asked for it and when.
    pub fn into_track(self, requested_by: Option<UserId>, requested_at: DateTime<Utc>) -> Track {
        let info = self.info;
        Track {
            encoded: self.encoded,
            info: TrackInfo {
                identifier: info.identifier,
                title: info.title,
                author: info.author,
                length_ms: info.length,
                uri: info.uri,
                artwork_url: info.artwork_url,
                isrc: info.isrc,
                source_name: info.source_name,
                is_seekable: info.is_seekable,
                is_stream: info.is_stream,
            },
            requested_by,
            requested_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl fmt::Display for TrackEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackEndReason::Finished => "finished",
            TrackEndReason::LoadFailed => "loadFailed",
            TrackEndReason::Stopped => "stopped",
            TrackEndReason::Replaced => "replaced",
            TrackEndReason::Cleanup => "cleanup",
        })
    }
}

/// Asynchronous notification pushed by the engine for one guild.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub guild_id: GuildId,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    TrackStart { track: Track },
    TrackEnd { track: Track, reason: TrackEndReason },
    TrackStuck { track: Track, threshold_ms: u64 },
    TrackError { track: Track, message: String },
    PlayerDisconnect { code: Option<u16>, reason: String },
}

impl EngineEvent {
    pub fn new(guild_id: GuildId, kind: EngineEventKind) -> Self {
        Self { guild_id, kind }
    }
}
