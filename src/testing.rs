//! Fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    audio::{
        effects::AudioFilters,
        queue::{GuildQueue, LoopMode, QueueUpdate},
        track::{Track, TrackInfo},
    },
    engine::{EngineResult, EngineTrack, EngineTrackInfo, PlaybackEngine},
    error::{EngineError, StorageError},
    ids::{ChannelId, GuildId},
    storage::{MemoryStorage, QueueStore, StorageResult},
};

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Track whose identifier, title and payload derive from `id`.
pub fn track(id: &str) -> Track {
    Track {
        encoded: format!("enc:{id}"),
        info: TrackInfo {
            identifier: id.to_string(),
            title: format!("Song {id}"),
            author: "Tester".to_string(),
            length_ms: 180_000,
            uri: Some(format!("https://example.com/{id}")),
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
            is_seekable: true,
            is_stream: false,
        },
        requested_by: None,
        requested_at: fixed_time(),
    }
}

pub fn engine_track(id: &str) -> EngineTrack {
    EngineTrack {
        encoded: format!("enc:{id}"),
        info: EngineTrackInfo {
            identifier: id.to_string(),
            is_seekable: true,
            author: "Tester".to_string(),
            length: 180_000,
            is_stream: false,
            position: 0,
            title: format!("Song {id}"),
            uri: Some(format!("https://example.com/{id}")),
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
        },
        plugin_info: json!({}),
        user_data: Value::Null,
    }
}

/// Memory store whose writes can be made to fail on demand.
pub struct FlakyStore {
    inner: MemoryStorage,
    fail_saves: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStore for FlakyStore {
    async fn load(&self, guild_id: GuildId) -> StorageResult<Option<GuildQueue>> {
        self.inner.load(guild_id).await
    }

    async fn save(&self, guild_id: GuildId, update: &QueueUpdate) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(guild_id, update).await
    }

    async fn delete(&self, guild_id: GuildId) -> StorageResult<bool> {
        self.inner.delete(guild_id).await
    }

    async fn inactive(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<GuildId>> {
        self.inner.inactive(cutoff).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateSession(GuildId, ChannelId, ChannelId),
    Play(GuildId, String),
    Pause(GuildId),
    Resume(GuildId),
    Stop(GuildId),
    Seek(GuildId, u64),
    Volume(GuildId, u16),
    Filters(GuildId, AudioFilters),
    Loop(GuildId, LoopMode),
    Move(GuildId, ChannelId),
    Destroy(GuildId),
}

/// Engine that records every command.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    search_results: Mutex<Vec<EngineTrack>>,
    fail_resume: AtomicBool,
    resume_attempts: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn resume_attempts(&self) -> usize {
        self.resume_attempts.load(Ordering::SeqCst)
    }

    pub fn set_search_results(&self, results: Vec<EngineTrack>) {
        *self.search_results.lock() = results;
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PlaybackEngine for FakeEngine {
    async fn create_session(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
    ) -> EngineResult<()> {
        self.record(EngineCall::CreateSession(guild_id, voice_channel_id, text_channel_id));
        Ok(())
    }

    async fn play(&self, guild_id: GuildId, encoded: &str) -> EngineResult<()> {
        self.record(EngineCall::Play(guild_id, encoded.to_string()));
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> EngineResult<()> {
        self.record(EngineCall::Pause(guild_id));
        Ok(())
    }

    async fn resume(&self, guild_id: GuildId) -> EngineResult<()> {
        self.resume_attempts.fetch_add(1, Ordering::SeqCst);
        self.record(EngineCall::Resume(guild_id));
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("voice connection lost".into()));
        }
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> EngineResult<()> {
        self.record(EngineCall::Stop(guild_id));
        Ok(())
    }

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> EngineResult<()> {
        self.record(EngineCall::Seek(guild_id, position_ms));
        Ok(())
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> EngineResult<()> {
        self.record(EngineCall::Volume(guild_id, volume));
        Ok(())
    }

    async fn set_filters(&self, guild_id: GuildId, filters: &AudioFilters) -> EngineResult<()> {
        self.record(EngineCall::Filters(guild_id, filters.clone()));
        Ok(())
    }

    async fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> EngineResult<()> {
        self.record(EngineCall::Loop(guild_id, mode));
        Ok(())
    }

    async fn move_channel(&self, guild_id: GuildId, voice_channel_id: ChannelId) -> EngineResult<()> {
        self.record(EngineCall::Move(guild_id, voice_channel_id));
        Ok(())
    }

    async fn search(&self, _query: &str) -> EngineResult<Vec<EngineTrack>> {
        Ok(self.search_results.lock().clone())
    }

    async fn destroy(&self, guild_id: GuildId) -> EngineResult<()> {
        self.record(EngineCall::Destroy(guild_id));
        Ok(())
    }
}
