use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::{ChunkId, WriteToken};
use crate::error::{GfsError, Result};

struct Staged {
    data: Vec<u8>,
    last_touched: Instant,
}

/// Pushed, uncommitted payloads keyed by (write token, chunk).
///
/// Bounded by total bytes, not entry count. To make room the least recently
/// pushed entries are evicted, but only once they are older than the eviction
/// grace; if that is not enough the push is rejected. A commit claims its
/// entry, removing it from the cache, so nothing can evict data mid-commit.
pub struct StagingBuffer {
    entries: LruCache<(WriteToken, ChunkId), Staged>,
    used_bytes: u64,
    capacity_bytes: u64,
    idle_timeout: Duration,
    eviction_grace: Duration,
}

impl StagingBuffer {
    pub fn new(capacity_bytes: u64, idle_timeout: Duration, eviction_grace: Duration) -> StagingBuffer {
        StagingBuffer {
            entries: LruCache::unbounded(),
            used_bytes: 0,
            capacity_bytes,
            idle_timeout,
            eviction_grace,
        }
    }

    /// Stage `data`. Re-pushing the same key replaces the earlier payload.
    pub fn put(&mut self, token: WriteToken, chunk: ChunkId, data: Vec<u8>, now: Instant) -> Result<()> {
        let len = data.len() as u64;
        if len > self.capacity_bytes {
            return Err(GfsError::StagingFull { len });
        }

        if let Some(old) = self.entries.pop(&(token, chunk)) {
            self.used_bytes -= old.data.len() as u64;
        }

        while self.used_bytes + len > self.capacity_bytes {
            let evictable = match self.entries.peek_lru() {
                Some((_, staged)) => now.saturating_duration_since(staged.last_touched) >= self.eviction_grace,
                None => false,
            };
            if !evictable {
                return Err(GfsError::StagingFull { len });
            }
            if let Some(((victim, victim_chunk), staged)) = self.entries.pop_lru() {
                self.used_bytes -= staged.data.len() as u64;
                tracing::debug!(token = %victim, chunk = victim_chunk, "evicted staged data");
            }
        }

        self.used_bytes += len;
        self.entries.put((token, chunk), Staged { data, last_touched: now });
        Ok(())
    }

    /// Remove and return the payload for a commit.
    pub fn claim(&mut self, token: WriteToken, chunk: ChunkId) -> Option<Vec<u8>> {
        let staged = self.entries.pop(&(token, chunk))?;
        self.used_bytes -= staged.data.len() as u64;
        Some(staged.data)
    }

    pub fn contains(&self, token: WriteToken, chunk: ChunkId) -> bool {
        self.entries.contains(&(token, chunk))
    }

    /// Drop entries nobody has touched for the idle timeout. Returns how many
    /// were purged.
    pub fn purge_idle(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        loop {
            let idle = match self.entries.peek_lru() {
                Some((_, staged)) => now.saturating_duration_since(staged.last_touched) >= self.idle_timeout,
                None => false,
            };
            if !idle {
                break;
            }
            if let Some((_, staged)) = self.entries.pop_lru() {
                self.used_bytes -= staged.data.len() as u64;
                purged += 1;
            }
        }
        purged
    }

    /// Drop everything. Used when a node loses its memory, e.g. on restart.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
