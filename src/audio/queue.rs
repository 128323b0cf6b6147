use chrono::{DateTime, Utc};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, str::FromStr, time::Duration};

use crate::{
    audio::{effects::AudioFilters, track::Track},
    error::{MusicError, Result},
    ids::{ChannelId, GuildId},
    storage::GuildSettings,
};

pub const MAX_VOLUME: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(LoopMode::Off),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode `{other}`")),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        })
    }
}

/// Cola persistida de un guild.
///
/// `current_index` is the playback cursor. It always satisfies
/// `0 <= current_index <= tracks.len()`; `tracks.len()` means idle, past the
/// end. An empty queue is never playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildQueue {
    pub guild_id: GuildId,
    pub tracks: Vec<Track>,
    pub current_index: usize,
    pub is_playing: bool,
    pub is_paused: bool,
    #[serde(rename = "isLooping")]
    pub loop_mode: LoopMode,
    pub volume: u16,
    pub filters: AudioFilters,
    pub autoplay: bool,
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<ChannelId>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the cursor landed on after a finished track.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Next(Track),
    Exhausted,
}

impl GuildQueue {
    pub fn new(guild_id: GuildId, settings: &GuildSettings) -> Self {
        let now = Utc::now();
        Self {
            guild_id,
            tracks: Vec::new(),
            current_index: 0,
            is_playing: false,
            is_paused: false,
            loop_mode: LoopMode::Off,
            volume: settings.default_volume.min(MAX_VOLUME),
            filters: AudioFilters::default(),
            autoplay: settings.autoplay,
            voice_channel_id: None,
            text_channel_id: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.current_index)
    }

    /// Up to `limit` tracks after the cursor.
    pub fn next_tracks(&self, limit: usize) -> &[Track] {
        let start = (self.current_index + 1).min(self.tracks.len());
        let end = start.saturating_add(limit).min(self.tracks.len());
        &self.tracks[start..end]
    }

    pub fn total_duration(&self) -> Duration {
        self.tracks.iter().map(Track::duration).sum()
    }

    pub fn invariants_hold(&self) -> bool {
        self.current_index <= self.tracks.len() && (!self.tracks.is_empty() || !self.is_playing)
    }

    /// Drops tracks whose identifier is already queued, or repeated in the batch.
    pub fn without_duplicates(&self, tracks: Vec<Track>) -> Vec<Track> {
        let mut seen: HashSet<String> = self
            .tracks
            .iter()
            .map(|t| t.identifier().to_string())
            .collect();
        tracks
            .into_iter()
            .filter(|t| seen.insert(t.identifier().to_string()))
            .collect()
    }

    /// Inserta tracks en `position` (o al final).
    ///
    /// While playing, inserting at or before the cursor shifts the cursor so it
    /// keeps pointing at the same track.
    pub fn insert_tracks(&mut self, tracks: Vec<Track>, position: Option<usize>) {
        let count = tracks.len();
        match position {
            Some(pos) if pos < self.tracks.len() => {
                if self.is_playing && pos <= self.current_index {
                    self.current_index += count;
                }
                self.tracks.splice(pos..pos, tracks);
            }
            _ => self.tracks.extend(tracks),
        }
    }

    pub fn remove(&mut self, index: usize) -> Result<Track> {
        if index >= self.tracks.len() {
            return Err(MusicError::IndexOutOfRange {
                index,
                len: self.tracks.len(),
            });
        }

        let removed = self.tracks.remove(index);
        if index < self.current_index {
            self.current_index -= 1;
        } else if index == self.current_index && self.tracks.is_empty() {
            self.current_index = 0;
            self.is_playing = false;
            self.is_paused = false;
        }
        Ok(removed)
    }

    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.tracks.len();
        if from >= len || to >= len {
            return Err(MusicError::InvalidPosition { from, to, len });
        }

        let track = self.tracks.remove(from);
        self.tracks.insert(to, track);

        let cursor = self.current_index;
        if from == cursor {
            self.current_index = to;
        } else if from < cursor && to >= cursor {
            self.current_index -= 1;
        } else if from > cursor && to <= cursor {
            self.current_index += 1;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current_index = 0;
        self.is_playing = false;
        self.is_paused = false;
    }

    /// Mezcla los tracks posteriores al cursor; el actual no se mueve.
    pub fn shuffle_upcoming<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.tracks.len() <= 1 {
            return;
        }
        let start = (self.current_index + 1).min(self.tracks.len());
        self.tracks[start..].shuffle(rng);
    }

    /// Moves the cursor past a finished track.
    ///
    /// With `LoopMode::Queue` the finished track is appended again first.
    pub fn advance(&mut self) -> Advance {
        if self.loop_mode == LoopMode::Queue {
            if let Some(finished) = self.current_track().cloned() {
                self.tracks.push(finished);
            }
        }

        self.current_index = (self.current_index + 1).min(self.tracks.len());
        match self.current_track() {
            Some(next) => Advance::Next(next.clone()),
            None => Advance::Exhausted,
        }
    }

    /// Applies a partial update, as the document store does.
    pub fn apply(&mut self, update: &QueueUpdate) {
        if let Some(tracks) = &update.tracks {
            self.tracks = tracks.clone();
        }
        if let Some(index) = update.current_index {
            self.current_index = index;
        }
        if let Some(playing) = update.is_playing {
            self.is_playing = playing;
        }
        if let Some(paused) = update.is_paused {
            self.is_paused = paused;
        }
        if let Some(mode) = update.loop_mode {
            self.loop_mode = mode;
        }
        if let Some(volume) = update.volume {
            self.volume = volume;
        }
        if let Some(filters) = &update.filters {
            self.filters = filters.clone();
        }
        if let Some(autoplay) = update.autoplay {
            self.autoplay = autoplay;
        }
        if let Some(channel) = update.voice_channel_id {
            self.voice_channel_id = channel;
        }
        if let Some(channel) = update.text_channel_id {
            self.text_channel_id = channel;
        }
        if let Some(at) = update.last_activity {
            self.last_activity = at;
        }
        self.updated_at = Utc::now();
    }
}

/// Actualización parcial de un documento de cola.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueUpdate {
    pub tracks: Option<Vec<Track>>,
    pub current_index: Option<usize>,
    pub is_playing: Option<bool>,
    pub is_paused: Option<bool>,
    pub loop_mode: Option<LoopMode>,
    pub volume: Option<u16>,
    pub filters: Option<AudioFilters>,
    pub autoplay: Option<bool>,
    pub voice_channel_id: Option<Option<ChannelId>>,
    pub text_channel_id: Option<Option<ChannelId>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl QueueUpdate {
    /// Tracks, cursor and play flags: what every content mutation touches.
    pub fn contents(queue: &GuildQueue) -> Self {
        Self {
            tracks: Some(queue.tracks.clone()),
            current_index: Some(queue.current_index),
            is_playing: Some(queue.is_playing),
            is_paused: Some(queue.is_paused),
            ..Default::default()
        }
    }

    /// Every field, for writing a freshly created queue.
    pub fn snapshot(queue: &GuildQueue) -> Self {
        Self {
            loop_mode: Some(queue.loop_mode),
            volume: Some(queue.volume),
            filters: Some(queue.filters.clone()),
            autoplay: Some(queue.autoplay),
            voice_channel_id: Some(queue.voice_channel_id),
            text_channel_id: Some(queue.text_channel_id),
            last_activity: Some(queue.last_activity),
            ..Self::contents(queue)
        }
    }
}

/// Estado combinado para sincronizar clientes web.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub guild_id: GuildId,
    pub current_track: Option<Track>,
    pub queue: Vec<Track>,
    pub is_playing: bool,
    pub is_paused: bool,
    /// Live position is only known to the engine; always 0 here.
    pub position: u64,
    pub volume: u16,
    #[serde(rename = "loop")]
    pub loop_mode: LoopMode,
    pub filters: AudioFilters,
    pub autoplay: bool,
}

impl From<&GuildQueue> for PlayerState {
    fn from(queue: &GuildQueue) -> Self {
        Self {
            guild_id: queue.guild_id,
            current_track: queue.current_track().cloned(),
            queue: queue.tracks.clone(),
            is_playing: queue.is_playing,
            is_paused: queue.is_paused,
            position: 0,
            volume: queue.volume,
            loop_mode: queue.loop_mode,
            filters: queue.filters.clone(),
            autoplay: queue.autoplay,
        }
    }
}
