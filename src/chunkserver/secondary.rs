use crate::common::{ChunkId, SeqNo};
use crate::error::{GfsError, Result};
use crate::msg::{MutationRecord, Response, RetransmitRecord};

use super::ordering::{Admit, ReplicaCursor};
use super::Chunkserver;

impl Chunkserver {
    /// Apply a mutation the primary ordered, strictly in sequence.
    pub(crate) async fn handle_apply(&self, record: MutationRecord) -> Result<Response> {
        let chunk = record.chunk;
        let state = self.chunk_state(chunk);
        let mut state = state.lock().await;

        match state.cursor.admit(&record) {
            Admit::Stale { current } => Err(GfsError::StaleEpoch { chunk, got: record.epoch, current }),
            Admit::Duplicate => Ok(Response::Applied { through: state.cursor.applied() }),
            Admit::Held { from, to } => {
                tracing::debug!(server = %self.id, chunk, seq = record.seq, from, to, "holding out-of-order mutation");
                Ok(Response::Missing { from, to })
            }
            Admit::Ready => {
                let data = self.claim_payload(&record).ok_or(GfsError::StagedDataMissing { chunk })?;
                self.apply_local(&record, &data)?;
                state.cursor.advance(record.seq);
                self.drain_held(&mut state.cursor)?;
                Ok(Response::Applied { through: state.cursor.applied() })
            }
        }
    }

    /// Apply records the primary replayed to close a gap, then whatever was
    /// held behind it. Succeeds once `until` has been applied.
    pub(crate) async fn handle_retransmit(
        &self,
        chunk: ChunkId,
        records: Vec<RetransmitRecord>,
        until: SeqNo,
    ) -> Result<Response> {
        let state = self.chunk_state(chunk);
        let mut state = state.lock().await;

        for RetransmitRecord { record, data } in records {
            if record.epoch != state.cursor.epoch() || record.seq != state.cursor.applied() + 1 {
                continue;
            }
            self.apply_local(&record, &data)?;
            state.cursor.advance(record.seq);
        }
        self.drain_held(&mut state.cursor)?;

        if state.cursor.applied() >= until {
            Ok(Response::Applied { through: state.cursor.applied() })
        } else {
            Err(GfsError::StagedDataMissing { chunk })
        }
    }

    /// Apply held records that have become next in line.
    fn drain_held(&self, cursor: &mut ReplicaCursor) -> Result<()> {
        while let Some(next) = cursor.take_ready() {
            let Some(data) = self.claim_payload(&next) else {
                tracing::warn!(
                    server = %self.id,
                    chunk = next.chunk,
                    seq = next.seq,
                    "held mutation lost its staged data"
                );
                cursor.hold(next);
                break;
            };
            self.apply_local(&next, &data)?;
            cursor.advance(next.seq);
        }
        Ok(())
    }
}
