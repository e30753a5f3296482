use futures::future::join_all;

use crate::common::{ChunkId, ServerId, WriteToken};
use crate::error::{GfsError, Result};
use crate::lease::HeldLease;
use crate::msg::{CommitRequest, MutationKind, MutationRecord, Request, Response, WriteMode};

use super::ordering::MutationLog;
use super::{ChunkState, Chunkserver};

impl Chunkserver {
    /// Order, apply and replicate one mutation as the chunk's primary.
    ///
    /// Runs under the chunk's state lock, so sequence numbers for a chunk are
    /// handed out one commit at a time. A write is only given a number once it
    /// has been accepted. A write that crosses the chunk end instead seals the
    /// chunk, and the seal takes the number.
    pub(crate) async fn handle_commit(&self, req: CommitRequest) -> Result<Response> {
        let CommitRequest { chunk, token, mode, len } = req;
        let not_primary = || GfsError::NotPrimary { chunk, server: self.id.clone() };

        let lease = self.current_lease(chunk).ok_or_else(not_primary)?;
        let state = self.chunk_state(chunk);
        let mut state = state.lock().await;

        if state.cursor.epoch() > lease.epoch {
            return Err(not_primary());
        }
        state.cursor.enter_epoch(lease.epoch);

        let data = self.staging().claim(token, chunk).ok_or(GfsError::StagedDataMissing { chunk })?;
        if data.len() as u64 != len {
            return Err(GfsError::Protocol(format!("commit for {len} bytes, {} staged", data.len())));
        }

        let max = self.geometry.max_write();
        if len > max {
            return Err(GfsError::WriteTooLarge { len, max });
        }

        let landing = {
            let storage = self.storage();
            let info = storage.info(chunk).ok_or(GfsError::NoSuchChunk(chunk))?;
            if info.full {
                return Err(GfsError::ChunkFull { chunk });
            }
            let offset = match mode {
                WriteMode::At(offset) => offset,
                WriteMode::Append => info.used,
            };
            offset.checked_add(len).filter(|end| *end <= self.geometry.chunk_size).map(|_| offset)
        };
        let Some(offset) = landing else {
            tracing::info!(server = %self.id, chunk, ?mode, len, "chunk full");
            self.seal(&mut state, chunk, &lease).await?;
            return Err(GfsError::ChunkFull { chunk });
        };

        let seq = state.cursor.next_seq();
        let record = MutationRecord { chunk, token, epoch: lease.epoch, seq, offset, len, kind: MutationKind::Write };
        self.apply_local(&record, &data)?;
        state.cursor.advance(seq);
        state.log.push(record.clone(), data);

        let failed = self.replicate(&state.log, &record, &lease.secondaries).await;
        if failed.is_empty() {
            tracing::debug!(server = %self.id, chunk, seq, offset, "committed");
            Ok(Response::Committed { offset, seq })
        } else {
            tracing::warn!(server = %self.id, chunk, seq, ?failed, "commit failed at some replicas");
            Err(GfsError::PartialFailure { failed })
        }
    }

    /// Seal `chunk` on every replica as the next mutation in sequence, so a
    /// later primary of the chunk refuses writes too.
    async fn seal(&self, state: &mut ChunkState, chunk: ChunkId, lease: &HeldLease) -> Result<()> {
        let seq = state.cursor.next_seq();
        let record = MutationRecord {
            chunk,
            token: WriteToken::generate(self.id.as_str(), seq, &[]),
            epoch: lease.epoch,
            seq,
            offset: 0,
            len: 0,
            kind: MutationKind::Seal,
        };
        self.apply_local(&record, &[])?;
        state.cursor.advance(seq);
        state.log.push(record.clone(), Vec::new());

        let failed = self.replicate(&state.log, &record, &lease.secondaries).await;
        if !failed.is_empty() {
            tracing::warn!(server = %self.id, chunk, seq, ?failed, "seal did not reach every replica");
        }
        Ok(())
    }

    /// Send `record` to every secondary at once. Returns the ones that failed.
    async fn replicate(&self, log: &MutationLog, record: &MutationRecord, secondaries: &[ServerId]) -> Vec<ServerId> {
        let sends = secondaries.iter().map(|secondary| async move {
            let res = self.apply_at(secondary, log, record).await;
            (secondary, res)
        });

        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(secondary, res)| match res {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(chunk = record.chunk, seq = record.seq, %secondary, error = %e, "apply failed");
                    Some(secondary.clone())
                }
            })
            .collect()
    }

    async fn apply_at(&self, secondary: &ServerId, log: &MutationLog, record: &MutationRecord) -> Result<()> {
        match self.call(secondary, Request::Apply(record.clone())).await? {
            Response::Applied { through } if through >= record.seq => Ok(()),
            Response::Missing { from, to } => {
                let records = log.range(record.epoch, from, to).ok_or_else(|| {
                    GfsError::Protocol(format!("cannot retransmit {from}..={to} to {secondary}"))
                })?;
                tracing::debug!(chunk = record.chunk, from, to, %secondary, "retransmitting");

                let req = Request::Retransmit { chunk: record.chunk, records, until: record.seq };
                match self.call(secondary, req).await? {
                    Response::Applied { through } if through >= record.seq => Ok(()),
                    other => Err(other.into_error()),
                }
            }
            other => Err(other.into_error()),
        }
    }
}
