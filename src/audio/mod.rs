//! # Audio Module
//!
//! Per-guild queue and player coordination.
//!
//! ## Architecture
//!
//! ### [`track`] and [`queue`] - Model
//! - Immutable [`track::Track`] values and the persisted [`queue::GuildQueue`]
//! - Cursor arithmetic for insert, remove, move, shuffle and advance
//!
//! ### [`queue_manager`] - Queue Coordinator
//! - Every content mutation: limits, duplicate policy, write-through persistence
//! - Emits `queue:*` events
//!
//! ### [`player`] - Player Coordinator
//! - Engine sessions per guild, playback controls, filter presets
//! - Reacts to engine events: advance on track end, reconnect on disconnect
//! - Emits `player:*`, `track:*` and `voice:*` events
//!
//! ### [`locks`] - Guild Locks
//! - One async mutex per guild shared by both coordinators
//!
//! ### [`effects`] - Audio Filters
//! - Open filter map stored with the queue and the fixed preset table
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use guild_playback::{
//!     audio::{locks::GuildLocks, player::PlayerManager, queue_manager::QueueManager},
//!     engine::{LavalinkConfig, LavalinkEngine},
//!     events::EventBus,
//!     ids::{ChannelId, GuildId},
//!     storage::MemoryStorage,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let storage = MemoryStorage::new();
//! let queues = Arc::new(QueueManager::new(
//!     Arc::new(storage.clone()),
//!     Arc::new(storage.clone()),
//!     Arc::new(EventBus::new()),
//!     Arc::new(GuildLocks::new()),
//! ));
//! let engine = Arc::new(LavalinkEngine::new(&LavalinkConfig::default())?);
//! let player = Arc::new(PlayerManager::new(engine, queues.clone(), Arc::new(storage)));
//!
//! let guild = GuildId::new(123456789);
//! player.create_player(guild, ChannelId::new(1), ChannelId::new(2)).await?;
//! let found = player.search("never gonna give you up").await?;
//! if let Some(first) = found.into_iter().next() {
//!     queues.add_tracks(guild, vec![first.into_track(None, chrono::Utc::now())], None).await?;
//!     player.play_current(guild).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod effects;
pub mod locks;
pub mod player;
pub mod queue;
pub mod queue_manager;
pub mod track;
