//! Lavalink v4 wire types: websocket frames, load results, player updates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EngineEvent, EngineEventKind, EngineResult, EngineTrack, TrackEndReason};
use crate::{error::EngineError, ids::GuildId};

/// Frame received on the node websocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Frame {
    Ready(ReadyFrame),
    Event(EventFrame),
    /// `playerUpdate`, `stats` and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyFrame {
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum EventFrame {
    TrackStartEvent(TrackFrame),
    TrackEndEvent(TrackEndFrame),
    TrackExceptionEvent(TrackExceptionFrame),
    TrackStuckEvent(TrackStuckFrame),
    WebSocketClosedEvent(SocketClosedFrame),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFrame {
    pub guild_id: String,
    pub track: EngineTrack,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEndFrame {
    pub guild_id: String,
    pub track: EngineTrack,
    pub reason: TrackEndReason,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackExceptionFrame {
    pub guild_id: String,
    pub track: EngineTrack,
    pub exception: ExceptionFrame,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionFrame {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuckFrame {
    pub guild_id: String,
    pub track: EngineTrack,
    pub threshold_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketClosedFrame {
    pub guild_id: String,
    pub code: u16,
    pub reason: String,
    pub by_remote: bool,
}

fn guild(raw: &str) -> EngineResult<GuildId> {
    raw.parse()
        .map_err(|_| EngineError::Malformed(format!("invalid guild id `{raw}`")))
}

fn core_track(track: EngineTrack) -> crate::audio::track::Track {
    let requester = track.requester();
    track.into_track(requester, Utc::now())
}

impl EventFrame {
    /// Converts into the core event; `Ok(None)` for event types we ignore.
    pub fn into_engine_event(self) -> EngineResult<Option<EngineEvent>> {
        let event = match self {
            EventFrame::TrackStartEvent(f) => EngineEvent::new(
                guild(&f.guild_id)?,
                EngineEventKind::TrackStart {
                    track: core_track(f.track),
                },
            ),
            EventFrame::TrackEndEvent(f) => EngineEvent::new(
                guild(&f.guild_id)?,
                EngineEventKind::TrackEnd {
                    track: core_track(f.track),
                    reason: f.reason,
                },
            ),
            EventFrame::TrackExceptionEvent(f) => {
                let message = f
                    .exception
                    .message
                    .unwrap_or_else(|| format!("{} ({})", f.exception.cause, f.exception.severity));
                EngineEvent::new(
                    guild(&f.guild_id)?,
                    EngineEventKind::TrackError {
                        track: core_track(f.track),
                        message,
                    },
                )
            }
            EventFrame::TrackStuckEvent(f) => EngineEvent::new(
                guild(&f.guild_id)?,
                EngineEventKind::TrackStuck {
                    track: core_track(f.track),
                    threshold_ms: f.threshold_ms,
                },
            ),
            EventFrame::WebSocketClosedEvent(f) => EngineEvent::new(
                guild(&f.guild_id)?,
                EngineEventKind::PlayerDisconnect {
                    code: Some(f.code),
                    reason: f.reason,
                },
            ),
            EventFrame::Unknown => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

/// Respuesta de `/v4/loadtracks`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct PlaylistData {
    tracks: Vec<EngineTrack>,
}

impl LoadResult {
    pub fn into_tracks(self) -> EngineResult<Vec<EngineTrack>> {
        let malformed = |e: serde_json::Error| EngineError::Malformed(e.to_string());
        match self.load_type {
            LoadType::Track => Ok(vec![serde_json::from_value(self.data).map_err(malformed)?]),
            LoadType::Playlist => Ok(serde_json::from_value::<PlaylistData>(self.data)
                .map_err(malformed)?
                .tracks),
            LoadType::Search => serde_json::from_value(self.data).map_err(malformed),
            LoadType::Empty => Ok(Vec::new()),
            LoadType::Error => {
                let message = self
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown load failure")
                    .to_string();
                Err(EngineError::Rejected(message))
            }
        }
    }
}

/// Discord voice server credentials forwarded to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Body of `PATCH /v4/sessions/{session}/players/{guild}`.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<&'a VoiceState>,
}

/// `encoded: None` serializes as `null`, which stops the player.
#[derive(Debug, Serialize)]
pub struct UpdateTrack<'a> {
    pub encoded: Option<&'a str>,
}
