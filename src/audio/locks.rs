//! Exclusión mutua por guild.
//!
//! Every read-modify-write of a guild's queue, and every player command that
//! depends on queue state, runs while holding that guild's [`GuildGuard`].
//! Guilds never contend with each other.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::ids::GuildId;

#[derive(Debug, Default)]
pub struct GuildLocks {
    locks: DashMap<GuildId, Arc<Mutex<()>>>,
}

/// Proof that the holder owns a guild's critical section.
///
/// Helpers that must only run under the lock take `&GuildGuard` instead of
/// locking again, which would deadlock.
#[derive(Debug)]
pub struct GuildGuard {
    guild_id: GuildId,
    _guard: OwnedMutexGuard<()>,
}

impl GuildGuard {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }
}

impl GuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the guild's lock. Waiters are served in FIFO order.
    pub async fn lock(&self, guild_id: GuildId) -> GuildGuard {
        let mutex = Arc::clone(self.locks.entry(guild_id).or_default().value());
        let guard = mutex.lock_owned().await;
        trace!("🔒 Lock adquirido para guild {}", guild_id);
        GuildGuard {
            guild_id,
            _guard: guard,
        }
    }

    /// Drops the lock entry if nobody holds or waits on it.
    pub fn forget(&self, guild_id: GuildId) -> bool {
        self.locks
            .remove_if(&guild_id, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
