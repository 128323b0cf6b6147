//! Queue and player coordination for a multi-tenant music bot.
//!
//! Each guild owns one queue and at most one playback session on a remote
//! Lavalink node. Commands from any front-end and events from the engine are
//! serialized per guild; every state change is published on the
//! [`events::EventBus`].

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{MusicError, Result};
