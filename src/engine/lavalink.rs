use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    protocol::{Frame, LoadResult, PlayerUpdate, UpdateTrack, VoiceState},
    EngineEvent, EngineEventKind, EngineResult, EngineTrack, PlaybackEngine, TrackEndReason,
};
use crate::{
    audio::{effects::AudioFilters, queue::LoopMode},
    error::EngineError,
    ids::{ChannelId, GuildId},
};

/// Conexión a un nodo Lavalink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LavalinkConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
}

impl Default for LavalinkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
        }
    }
}

impl LavalinkConfig {
    pub fn base_url(&self) -> EngineResult<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port))
            .map_err(|e| EngineError::Malformed(format!("invalid node address: {e}")))
    }
}

#[derive(Debug, Clone)]
struct PlayerSlot {
    voice_channel_id: ChannelId,
    text_channel_id: ChannelId,
    voice_state: Option<VoiceState>,
    loop_mode: LoopMode,
    current: Option<String>,
}

/// [`PlaybackEngine`] over the Lavalink v4 REST API.
///
/// The node's websocket is owned by whoever drives the process; its frames
/// are fed through [`LavalinkEngine::handle_frame`], which records the
/// session id and turns player events into [`EngineEvent`]s.
pub struct LavalinkEngine {
    http: Client,
    base: Url,
    password: String,
    session_id: RwLock<Option<String>>,
    players: DashMap<GuildId, PlayerSlot>,
}

impl LavalinkEngine {
    pub fn new(config: &LavalinkConfig) -> EngineResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("guild-playback/", env!("CARGO_PKG_VERSION")))
            .build()?;

        info!("🎵 Nodo Lavalink configurado en {}:{}", config.host, config.port);

        Ok(Self {
            http,
            base: config.base_url()?,
            password: config.password.clone(),
            session_id: RwLock::new(None),
            players: DashMap::new(),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn require_session(&self) -> EngineResult<String> {
        self.session_id().ok_or(EngineError::NotReady)
    }

    fn request(&self, method: Method, path: &str) -> EngineResult<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .map_err(|e| EngineError::Malformed(e.to_string()))?;
        Ok(self
            .http
            .request(method, url)
            .header("Authorization", &self.password))
    }

    async fn send(&self, request: RequestBuilder) -> EngineResult<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn player_path(session: &str, guild_id: GuildId) -> String {
        format!("/v4/sessions/{}/players/{}", session, guild_id)
    }

    async fn update_player(&self, guild_id: GuildId, body: &PlayerUpdate<'_>) -> EngineResult<()> {
        let session = self.require_session()?;
        let request = self
            .request(Method::PATCH, &Self::player_path(&session, guild_id))?
            .json(body);
        self.send(request).await?;
        debug!("🔧 Player {} actualizado", guild_id);
        Ok(())
    }

    /// Forwards Discord voice credentials so the node can join the channel.
    pub async fn update_voice_state(&self, guild_id: GuildId, state: VoiceState) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                voice: Some(&state),
                ..Default::default()
            },
        )
        .await?;

        if let Some(mut slot) = self.players.get_mut(&guild_id) {
            slot.voice_state = Some(state);
        }
        Ok(())
    }

    /// Consumes one websocket frame from the node.
    ///
    /// `ready` records the session id. A finished track under
    /// `LoopMode::Track` is replayed here, so the coordinators only see the
    /// `trackEnd` and never advance the queue for it.
    pub async fn handle_frame(&self, frame: Frame) -> EngineResult<Option<EngineEvent>> {
        let event = match frame {
            Frame::Ready(ready) => {
                info!(
                    "✅ Sesión Lavalink lista: {} (resumed: {})",
                    ready.session_id, ready.resumed
                );
                *self.session_id.write() = Some(ready.session_id);
                return Ok(None);
            }
            Frame::Event(event) => match event.into_engine_event()? {
                Some(event) => event,
                None => return Ok(None),
            },
            Frame::Other => return Ok(None),
        };

        match &event.kind {
            EngineEventKind::TrackStart { track } => {
                if let Some(mut slot) = self.players.get_mut(&event.guild_id) {
                    slot.current = Some(track.encoded.clone());
                }
            }
            EngineEventKind::TrackEnd {
                reason: TrackEndReason::Finished,
                ..
            } => {
                let replay = self
                    .players
                    .get(&event.guild_id)
                    .filter(|slot| slot.loop_mode == LoopMode::Track)
                    .and_then(|slot| slot.current.clone());
                if let Some(encoded) = replay {
                    debug!("🔁 Repitiendo track en guild {}", event.guild_id);
                    if let Err(e) = self.play(event.guild_id, &encoded).await {
                        warn!("No se pudo repetir el track en guild {}: {}", event.guild_id, e);
                    }
                }
            }
            _ => {}
        }

        Ok(Some(event))
    }
}

const SEARCH_PREFIXES: [&str; 4] = ["ytsearch:", "ytmsearch:", "scsearch:", "spsearch:"];

/// Normaliza una consulta: URLs tal cual, texto libre como búsqueda de YouTube.
pub fn search_identifier(query: &str) -> String {
    let query = query.trim();
    let explicit = query.starts_with("http://")
        || query.starts_with("https://")
        || SEARCH_PREFIXES.iter().any(|prefix| query.starts_with(prefix));
    if explicit {
        query.to_string()
    } else {
        format!("ytsearch:{}", query)
    }
}

/// Translates the stored filter map into the node's filter payload.
pub fn filters_payload(filters: &AudioFilters) -> Value {
    let mut out = Map::new();

    if let Some(gain) = filters.bassboost {
        let bands: Vec<Value> = (0..6)
            .map(|band| {
                let falloff = 1.0 - band as f32 * 0.15;
                json!({ "band": band, "gain": gain * falloff.max(0.0) })
            })
            .collect();
        out.insert("equalizer".into(), Value::Array(bands));
    }
    if filters.nightcore == Some(true) {
        out.insert("timescale".into(), json!({ "speed": 1.3, "pitch": 1.3, "rate": 1.0 }));
    } else if filters.vaporwave == Some(true) {
        out.insert("timescale".into(), json!({ "speed": 0.85, "pitch": 0.8, "rate": 1.0 }));
    } else if filters.timescale == Some(true) {
        out.insert("timescale".into(), json!({ "speed": 1.0, "pitch": 1.0, "rate": 1.0 }));
    }
    if filters.eight_d == Some(true) || filters.rotation == Some(true) {
        out.insert("rotation".into(), json!({ "rotationHz": 0.2 }));
    }
    if filters.karaoke == Some(true) {
        out.insert(
            "karaoke".into(),
            json!({ "level": 1.0, "monoLevel": 1.0, "filterBand": 220.0, "filterWidth": 100.0 }),
        );
    }
    if filters.tremolo == Some(true) {
        out.insert("tremolo".into(), json!({ "frequency": 2.0, "depth": 0.5 }));
    }
    if filters.vibrato == Some(true) {
        out.insert("vibrato".into(), json!({ "frequency": 2.0, "depth": 0.5 }));
    }
    if filters.distortion == Some(true) {
        out.insert(
            "distortion".into(),
            json!({ "sinOffset": 0.0, "sinScale": 1.0, "cosOffset": 0.0, "cosScale": 1.0, "tanOffset": 0.0, "tanScale": 1.0, "offset": 0.0, "scale": 1.0 }),
        );
    }
    if filters.lowpass == Some(true) {
        out.insert("lowPass".into(), json!({ "smoothing": 20.0 }));
    }
    if filters.channelmix == Some(true) {
        out.insert(
            "channelMix".into(),
            json!({ "leftToLeft": 0.5, "leftToRight": 0.5, "rightToLeft": 0.5, "rightToRight": 0.5 }),
        );
    }

    // Claves desconocidas pasan tal cual (p.ej. "equalizer" explícito)
    for (key, value) in &filters.extra {
        out.insert(key.clone(), value.clone());
    }

    Value::Object(out)
}

#[async_trait]
impl PlaybackEngine for LavalinkEngine {
    async fn create_session(
        &self,
        guild_id: GuildId,
        voice_channel_id: ChannelId,
        text_channel_id: ChannelId,
    ) -> EngineResult<()> {
        self.require_session()?;
        self.players.insert(
            guild_id,
            PlayerSlot {
                voice_channel_id,
                text_channel_id,
                voice_state: None,
                loop_mode: LoopMode::Off,
                current: None,
            },
        );
        info!(
            "🔊 Player creado para guild {} (voz {}, texto {})",
            guild_id, voice_channel_id, text_channel_id
        );
        Ok(())
    }

    async fn play(&self, guild_id: GuildId, encoded: &str) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                track: Some(UpdateTrack {
                    encoded: Some(encoded),
                }),
                paused: Some(false),
                ..Default::default()
            },
        )
        .await?;

        if let Some(mut slot) = self.players.get_mut(&guild_id) {
            slot.current = Some(encoded.to_string());
        }
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                paused: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    async fn resume(&self, guild_id: GuildId) -> EngineResult<()> {
        let voice = self
            .players
            .get(&guild_id)
            .and_then(|slot| slot.voice_state.clone());
        self.update_player(
            guild_id,
            &PlayerUpdate {
                paused: Some(false),
                voice: voice.as_ref(),
                ..Default::default()
            },
        )
        .await
    }

    async fn stop(&self, guild_id: GuildId) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                track: Some(UpdateTrack { encoded: None }),
                ..Default::default()
            },
        )
        .await?;

        if let Some(mut slot) = self.players.get_mut(&guild_id) {
            slot.current = None;
        }
        Ok(())
    }

    async fn seek(&self, guild_id: GuildId, position_ms: u64) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                position: Some(position_ms),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u16) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                volume: Some(volume),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_filters(&self, guild_id: GuildId, filters: &AudioFilters) -> EngineResult<()> {
        self.update_player(
            guild_id,
            &PlayerUpdate {
                filters: Some(filters_payload(filters)),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_loop(&self, guild_id: GuildId, mode: LoopMode) -> EngineResult<()> {
        match self.players.get_mut(&guild_id) {
            Some(mut slot) => {
                slot.loop_mode = mode;
                Ok(())
            }
            None => Err(EngineError::Rejected(format!("no player for guild {guild_id}"))),
        }
    }

    async fn move_channel(&self, guild_id: GuildId, voice_channel_id: ChannelId) -> EngineResult<()> {
        match self.players.get_mut(&guild_id) {
            Some(mut slot) => {
                debug!(
                    "🔀 Guild {}: canal de voz {} -> {} (texto {})",
                    guild_id, slot.voice_channel_id, voice_channel_id, slot.text_channel_id
                );
                slot.voice_channel_id = voice_channel_id;
                // Las credenciales viejas no valen para el canal nuevo
                slot.voice_state = None;
                Ok(())
            }
            None => Err(EngineError::Rejected(format!("no player for guild {guild_id}"))),
        }
    }

    async fn search(&self, query: &str) -> EngineResult<Vec<EngineTrack>> {
        let identifier = search_identifier(query);
        let path = format!(
            "/v4/loadtracks?identifier={}",
            urlencoding::encode(&identifier)
        );
        let response = self.send(self.request(Method::GET, &path)?).await?;
        let result: LoadResult = response.json().await?;
        let tracks = result.into_tracks()?;

        if tracks.is_empty() {
            warn!("No se encontraron resultados para: {}", identifier);
        } else {
            debug!("🔍 {} resultados para: {}", tracks.len(), identifier);
        }
        Ok(tracks)
    }

    async fn destroy(&self, guild_id: GuildId) -> EngineResult<()> {
        self.players.remove(&guild_id);
        let session = self.require_session()?;
        self.send(self.request(Method::DELETE, &Self::player_path(&session, guild_id))?)
            .await?;
        info!("👋 Player destruido para guild {}", guild_id);
        Ok(())
    }
}
