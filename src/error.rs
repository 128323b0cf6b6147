use thiserror::Error;

use crate::ids::GuildId;

/// Errores que los coordinadores devuelven a los front-ends.
///
/// Front-ends map each kind to their own user-facing text; nothing in this
/// crate formats messages for end users.
#[derive(Debug, Error)]
pub enum MusicError {
    #[error("queue would exceed the maximum length of {max} tracks (attempted {attempted})")]
    QueueLimitExceeded { max: usize, attempted: usize },

    #[error("index {index} is out of range for a queue of {len} tracks")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid track positions: from {from} to {to} in a queue of {len} tracks")]
    InvalidPosition { from: usize, to: usize, len: usize },

    #[error("no tracks found for query `{query}`")]
    NoResults { query: String },

    #[error("no player session for guild {0}")]
    NoSession(GuildId),

    #[error("a player session already exists for guild {0}")]
    SessionAlreadyExists(GuildId),

    #[error("unknown filter preset `{0}`")]
    UnknownPreset(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    #[error("playback engine command failed: {0}")]
    Engine(#[from] EngineError),

    #[error("reconnection to the voice channel of guild {guild} failed after {attempts} attempts")]
    ReconnectExhausted { guild: GuildId, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, MusicError>;

/// Fallos del almacenamiento de documentos.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fallos del motor de reproducción remoto.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("engine session is not ready yet")]
    NotReady,

    #[error("engine rejected the command: {0}")]
    Rejected(String),

    #[error("malformed engine payload: {0}")]
    Malformed(String),
}
