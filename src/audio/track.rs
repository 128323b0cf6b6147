use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::UserId;

/// Display metadata for a track, as resolved by the playback engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// Engine identifier; duplicate detection compares this field.
    pub identifier: String,
    pub title: String,
    pub author: String,
    /// Duration in milliseconds. Zero for live streams.
    #[serde(rename = "length")]
    pub length_ms: u64,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
    pub is_seekable: bool,
    pub is_stream: bool,
}

/// Una canción en la cola de un guild.
///
/// Tracks are immutable once built: the opaque `encoded` payload is what the
/// engine plays, everything else is for display and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    pub requested_by: Option<UserId>,
    pub requested_at: DateTime<Utc>,
}

impl Track {
    pub fn identifier(&self) -> &str {
        &self.info.identifier
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.length_ms)
    }
}
