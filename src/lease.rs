//! Mutation leases.
//!
//! The master keeps a `LeaseTable` with at most one active lease per chunk.
//! A chunkserver keeps a `HeldLease` per chunk it was granted and trusts it
//! until it expires without asking the master again. That trust is advisory:
//! a primary whose clock runs slow could keep ordering after the master has
//! moved on. Epochs bound the damage, since a secondary that has seen a newer
//! epoch rejects instructions from an older one.
//!
//! The master records a lease before it sends the grant. Until the holder
//! acknowledges, the lease is tentative: it is not handed to clients, but it
//! still keeps every other replica from being granted the chunk.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{ChunkId, Epoch, ServerId};
use crate::msg::LeaseGrant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: ServerId,
    pub epoch: Epoch,
    pub expires: Instant,
    /// Set once the holder acknowledged the grant.
    pub confirmed: bool,
}

impl Lease {
    pub fn is_active(&self, now: Instant) -> bool {
        now < self.expires
    }
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<ChunkId, Lease>,
    epochs: HashMap<ChunkId, Epoch>,
}

impl LeaseTable {
    pub fn new() -> LeaseTable {
        LeaseTable::default()
    }

    /// The lease on `chunk`, if one is active at `now`.
    pub fn active(&self, chunk: ChunkId, now: Instant) -> Option<&Lease> {
        self.leases.get(&chunk).filter(|l| l.is_active(now))
    }

    /// Reserve the epoch for the next grant on `chunk`.
    pub fn next_epoch(&mut self, chunk: ChunkId) -> Epoch {
        let epoch = self.epochs.entry(chunk).or_insert(0);
        *epoch += 1;
        *epoch
    }

    /// Record a lease, tentative or acknowledged.
    ///
    /// Returns false and leaves the table alone if another holder still has
    /// an active lease, or the epoch is older than the latest reservation.
    pub fn install(&mut self, chunk: ChunkId, lease: Lease, now: Instant) -> bool {
        if let Some(current) = self.active(chunk, now) {
            if current.holder != lease.holder {
                return false;
            }
        }
        if self.epochs.get(&chunk).copied().unwrap_or(0) > lease.epoch {
            return false;
        }
        self.leases.insert(chunk, lease);
        true
    }

    /// Explicitly end `holder`'s lease on `chunk`.
    pub fn release(&mut self, chunk: ChunkId, holder: &ServerId) -> bool {
        match self.leases.get(&chunk) {
            Some(l) if &l.holder == holder => {
                self.leases.remove(&chunk);
                true
            }
            _ => false,
        }
    }

    /// Drop every lease held by `holder`, e.g. after it restarted.
    pub fn revoke_holder(&mut self, holder: &ServerId) -> Vec<ChunkId> {
        let chunks: Vec<ChunkId> = self
            .leases
            .iter()
            .filter(|(_, l)| &l.holder == holder)
            .map(|(c, _)| *c)
            .collect();
        for c in &chunks {
            self.leases.remove(c);
        }
        chunks
    }

    /// Forget leases that have run out.
    pub fn expire(&mut self, now: Instant) {
        self.leases.retain(|_, l| l.is_active(now));
    }

    /// The acknowledged lease on `chunk`, if one is active at `now`.
    pub fn confirmed(&self, chunk: ChunkId, now: Instant) -> Option<&Lease> {
        self.active(chunk, now).filter(|l| l.confirmed)
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.leases.values().filter(|l| l.is_active(now)).count()
    }
}

/// A lease as seen by the chunkserver holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLease {
    pub epoch: Epoch,
    pub expires: Instant,
    pub secondaries: Vec<ServerId>,
}

impl HeldLease {
    pub fn from_grant(grant: &LeaseGrant, now: Instant) -> HeldLease {
        HeldLease {
            epoch: grant.epoch,
            expires: now + Duration::from_millis(grant.duration_ms),
            secondaries: grant.secondaries.clone(),
        }
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: &str, epoch: Epoch, expires: Instant) -> Lease {
        Lease { holder: holder.into(), epoch, expires, confirmed: true }
    }

    #[test]
    fn at_most_one_active_lease_per_chunk() {
        let now = Instant::now();
        let mut table = LeaseTable::new();

        let e1 = table.next_epoch(1);
        assert!(table.install(1, lease("s1", e1, now + Duration::from_secs(60)), now));

        let e2 = table.next_epoch(1);
        assert!(!table.install(1, lease("s2", e2, now + Duration::from_secs(60)), now));
        assert_eq!(table.active(1, now).unwrap().holder, ServerId::from("s1"));
        assert_eq!(table.active_count(now), 1);

        // Once the first lease runs out another holder may take over.
        let later = now + Duration::from_secs(61);
        assert!(table.active(1, later).is_none());
        assert!(table.install(1, lease("s2", e2, later + Duration::from_secs(60)), later));
        assert_eq!(table.active(1, later).unwrap().epoch, 2);
    }

    #[test]
    fn stale_epoch_is_refused() {
        let now = Instant::now();
        let mut table = LeaseTable::new();
        let old = table.next_epoch(5);
        let _newer = table.next_epoch(5);
        assert!(!table.install(5, lease("s1", old, now + Duration::from_secs(1)), now));
    }

    #[test]
    fn tentative_lease_blocks_other_holders() {
        let now = Instant::now();
        let mut table = LeaseTable::new();
        let epoch = table.next_epoch(1);
        let tentative = Lease { confirmed: false, ..lease("s1", epoch, now + Duration::from_secs(60)) };
        assert!(table.install(1, tentative, now));

        assert!(table.active(1, now).is_some());
        assert!(table.confirmed(1, now).is_none());
        assert!(!table.install(1, lease("s2", epoch, now + Duration::from_secs(60)), now));

        // The same holder confirms under the epoch it was sent.
        assert!(table.install(1, lease("s1", epoch, now + Duration::from_secs(60)), now));
        assert_eq!(table.confirmed(1, now).unwrap().epoch, epoch);
    }

    #[test]
    fn release_and_revoke() {
        let now = Instant::now();
        let mut table = LeaseTable::new();
        for chunk in [1, 2, 3] {
            let epoch = table.next_epoch(chunk);
            let holder = if chunk == 3 { "s2" } else { "s1" };
            assert!(table.install(chunk, lease(holder, epoch, now + Duration::from_secs(60)), now));
        }

        assert!(!table.release(3, &"s1".into()));
        assert!(table.release(3, &"s2".into()));

        let mut revoked = table.revoke_holder(&"s1".into());
        revoked.sort();
        assert_eq!(revoked, vec![1, 2]);
        assert_eq!(table.active_count(now), 0);
    }

    #[test]
    fn held_lease_expires() {
        let now = Instant::now();
        let grant = LeaseGrant { chunk: 1, epoch: 3, duration_ms: 100, secondaries: vec!["s2".into()] };
        let held = HeldLease::from_grant(&grant, now);
        assert!(held.is_valid(now + Duration::from_millis(99)));
        assert!(!held.is_valid(now + Duration::from_millis(100)));
    }
}
