use std::collections::{BTreeMap, VecDeque};

use crate::common::{Epoch, SeqNo};
use crate::msg::{MutationRecord, RetransmitRecord};

/// What a replica should do with an incoming mutation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admit {
    /// Already applied; acknowledge without touching the chunk.
    Duplicate,
    /// Next in sequence; apply now.
    Ready,
    /// Ahead of the cursor. The record is held and `from..=to` must arrive first.
    Held { from: SeqNo, to: SeqNo },
    /// From an epoch older than one this replica has already seen.
    Stale { current: Epoch },
}

/// Per-chunk apply cursor: the lease epoch and the highest sequence number
/// applied in it, plus records that arrived ahead of their turn.
///
/// At most `held_limit` records are held. Past that the one furthest ahead is
/// dropped; the primary resends it as part of a later gap.
#[derive(Debug)]
pub struct ReplicaCursor {
    epoch: Epoch,
    applied: SeqNo,
    held: BTreeMap<SeqNo, MutationRecord>,
    held_limit: usize,
}

impl ReplicaCursor {
    pub fn new(held_limit: usize) -> ReplicaCursor {
        ReplicaCursor { epoch: 0, applied: 0, held: BTreeMap::new(), held_limit }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn applied(&self) -> SeqNo {
        self.applied
    }

    /// Switch to `epoch` if it is newer, restarting the sequence.
    pub fn enter_epoch(&mut self, epoch: Epoch) {
        if epoch > self.epoch {
            self.epoch = epoch;
            self.applied = 0;
            self.held.clear();
        }
    }

    pub fn admit(&mut self, record: &MutationRecord) -> Admit {
        if record.epoch < self.epoch {
            return Admit::Stale { current: self.epoch };
        }
        self.enter_epoch(record.epoch);

        if record.seq <= self.applied {
            Admit::Duplicate
        } else if record.seq == self.applied + 1 {
            Admit::Ready
        } else {
            self.hold(record.clone());
            Admit::Held { from: self.applied + 1, to: record.seq - 1 }
        }
    }

    /// Mark `seq` applied. Must be the next number in sequence.
    pub fn advance(&mut self, seq: SeqNo) {
        debug_assert_eq!(seq, self.applied + 1, "sequence gap");
        self.applied = seq;
        self.held.remove(&seq);
    }

    /// The held record that is next in line, if any.
    pub fn take_ready(&mut self) -> Option<MutationRecord> {
        self.held.remove(&(self.applied + 1))
    }

    /// Keep a record until its turn comes.
    pub fn hold(&mut self, record: MutationRecord) {
        self.held.insert(record.seq, record);
        while self.held.len() > self.held_limit {
            self.held.pop_last();
        }
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Next sequence number for a primary to hand out.
    pub fn next_seq(&self) -> SeqNo {
        self.applied + 1
    }
}

/// Bounded history of the records a primary ordered in its current epoch,
/// kept with their payloads so gaps at a secondary can be refilled.
#[derive(Debug)]
pub struct MutationLog {
    epoch: Epoch,
    records: VecDeque<RetransmitRecord>,
    capacity: usize,
}

impl MutationLog {
    pub fn new(capacity: usize) -> MutationLog {
        MutationLog { epoch: 0, records: VecDeque::new(), capacity }
    }

    pub fn push(&mut self, record: MutationRecord, data: Vec<u8>) {
        if record.epoch != self.epoch {
            self.epoch = record.epoch;
            self.records.clear();
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(RetransmitRecord { record, data });
    }

    /// Records `from..=to` of `epoch`, or `None` if any of them is gone.
    pub fn range(&self, epoch: Epoch, from: SeqNo, to: SeqNo) -> Option<Vec<RetransmitRecord>> {
        if epoch != self.epoch || from > to {
            return None;
        }
        let out: Vec<RetransmitRecord> = self
            .records
            .iter()
            .filter(|r| r.record.seq >= from && r.record.seq <= to)
            .cloned()
            .collect();
        if out.len() as u64 == to - from + 1 {
            Some(out)
        } else {
            None
        }
    }
}
