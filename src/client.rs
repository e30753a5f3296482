use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::chunk::ChunkGeometry;
use crate::common::{ChunkId, SeqNo, ServerId, WriteToken};
use crate::config::ClientConfig;
use crate::error::{GfsError, Result};
use crate::msg::{ChunkLocation, CommitRequest, PushData, ReadTarget, Request, Response, WriteMode};
use crate::network::{call_timeout, Transport};

/// Where a committed mutation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub chunk: ChunkId,
    pub chunk_index: u64,
    /// Offset within the chunk.
    pub offset: u64,
    pub seq: SeqNo,
}

impl MutationOutcome {
    /// Offset within the file.
    pub fn file_offset(&self, geometry: ChunkGeometry) -> u64 {
        self.chunk_index * geometry.chunk_size + self.offset
    }
}

pub struct Client {
    master: ServerId,
    config: ClientConfig,
    geometry: ChunkGeometry,
    transport: Arc<dyn Transport>,
    /// Feeds the write token so every attempt gets a fresh one.
    attempts: AtomicU64,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Client {
        Client {
            master: ServerId::new(config.master_addr.clone()),
            geometry: config.geometry(),
            attempts: AtomicU64::new(0),
            transport,
            config,
        }
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    /// Append `data` as one record at the end of the file.
    ///
    /// The record lands atomically at an offset the primary picks. If the
    /// last chunk is full the client asks for a new one and tries there. A
    /// retried append may leave a partially replicated copy behind in an
    /// earlier position; readers see whatever every replica agreed on.
    pub async fn append(&self, path: &str, data: &[u8]) -> Result<MutationOutcome> {
        let max = self.geometry.max_write();
        if data.len() as u64 > max {
            return Err(GfsError::WriteTooLarge { len: data.len() as u64, max });
        }
        self.mutate(path, None, WriteMode::Append, data).await
    }

    /// Write `data` at `offset` in the file, one chunk-sized piece at a time.
    /// Pieces are written in order and the first failure stops the write.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<Vec<MutationOutcome>> {
        let mut outcomes = vec![];
        for piece in self.geometry.split_write(offset, data)? {
            let outcome = self
                .mutate(path, Some(piece.chunk_index), WriteMode::At(piece.offset), piece.data)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// A chunk sealed before it filled up reads as zeros to its end when the
    /// file carries on past it, so offsets agree with
    /// [`MutationOutcome::file_offset`]. A short read in the file's last chunk
    /// ends the result.
    pub async fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GfsError::ReadErr(format!("{len} bytes at {offset} runs past the largest offset")))?;
        let mut out = vec![];
        let mut pos = offset;
        // Unused tail of the last short chunk, owed once a later chunk exists.
        let mut padding = 0u64;

        while pos < end {
            let (chunk_index, chunk_offset) = self.geometry.locate(pos);
            let want = std::cmp::min(end - pos, self.geometry.chunk_size - chunk_offset);

            let req = Request::ClientRead {
                target: ReadTarget::File(path.to_string()),
                offset_or_index: chunk_index,
                length: want,
            };
            let location = match self.call(&self.master, req).await? {
                Response::Located(location) => location,
                // Past the last chunk.
                Response::ReadErr { .. } if !out.is_empty() || padding > 0 => break,
                other => return Err(other.into_error()),
            };
            out.resize(out.len() + padding as usize, 0);

            let data = self.read_replica(&location, chunk_offset, want).await?;
            padding = want - data.len() as u64;
            out.extend_from_slice(&data);
            pos += want;
        }

        Ok(out)
    }

    async fn read_replica(&self, location: &ChunkLocation, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut replicas = location.replicas.clone();
        replicas.shuffle(&mut rand::thread_rng());

        let mut last = GfsError::ReadErr(format!("chunk {} has no replicas", location.chunk));
        for replica in &replicas {
            let req = Request::ClientRead {
                target: ReadTarget::Chunk(location.chunk),
                offset_or_index: offset,
                length: len,
            };
            match self.call(replica, req).await {
                Ok(Response::Data(data)) => return Ok(data),
                Ok(other) => last = other.into_error(),
                Err(e) => last = e,
            }
            tracing::debug!(chunk = location.chunk, %replica, error = %last, "read failed, trying next replica");
        }
        Err(last)
    }

    /// Run one mutation to completion, restarting it from the top with a
    /// fresh token after each retryable failure.
    async fn mutate(
        &self,
        path: &str,
        chunk_index: Option<u64>,
        mode: WriteMode,
        data: &[u8],
    ) -> Result<MutationOutcome> {
        let mut full_chunk = None;
        let mut last = None;

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }

            match self.attempt(path, chunk_index, full_chunk.take(), mode, data).await {
                Ok(outcome) => return Ok(outcome),
                Err(GfsError::ChunkFull { chunk }) if mode == WriteMode::Append => {
                    tracing::info!(path, chunk, "chunk full, moving to a new chunk");
                    full_chunk = Some(chunk);
                    last = Some(GfsError::ChunkFull { chunk });
                }
                // An explicit write names its chunk; a new one would not help.
                Err(e @ GfsError::ChunkFull { .. }) => return Err(e),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(path, attempt, error = %e, "mutation failed, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(GfsError::RetriesExhausted {
            attempts: self.config.max_attempts,
            last: Box::new(last.unwrap_or_else(|| GfsError::Protocol("no attempts configured".to_string()))),
        })
    }

    async fn attempt(
        &self,
        path: &str,
        chunk_index: Option<u64>,
        full_chunk: Option<ChunkId>,
        mode: WriteMode,
        data: &[u8],
    ) -> Result<MutationOutcome> {
        let req = match full_chunk {
            Some(full_chunk) => Request::AllocateChunk { path: path.to_string(), full_chunk },
            None => Request::ClientOpen { path: path.to_string(), chunk_index, length: data.len() as u64 },
        };
        let location = match self.call(&self.master, req).await? {
            Response::Located(location) => location,
            other => return Err(other.into_error()),
        };
        let chunk = location.chunk;
        let primary = location
            .primary
            .clone()
            .ok_or_else(|| GfsError::Protocol(format!("master returned no primary for chunk {chunk}")))?;

        let token = WriteToken::generate(&self.config.id, self.attempts.fetch_add(1, Ordering::Relaxed), data);
        let chain = self.push_chain(&location.replicas);
        let (first, rest) = chain
            .split_first()
            .ok_or(GfsError::NotEnoughChunkservers { needed: 1, available: 0 })?;

        let push = Request::PushData(PushData { token, chunk, data: data.to_vec(), chain: rest.to_vec() });
        self.call(first, push).await?.ok()?;
        tracing::debug!(path, chunk, token = %token, "pushed");

        let commit = Request::Commit(CommitRequest { chunk, token, mode, len: data.len() as u64 });
        match self.call(&primary, commit).await? {
            Response::Committed { offset, seq } => {
                tracing::debug!(path, chunk, offset, seq, "committed");
                Ok(MutationOutcome { chunk, chunk_index: location.chunk_index, offset, seq })
            }
            other => Err(other.into_error()),
        }
    }

    /// Replicas ordered cheapest first. Servers with no configured cost go
    /// last, in the order the master listed them.
    fn push_chain(&self, replicas: &[ServerId]) -> Vec<ServerId> {
        let mut chain = replicas.to_vec();
        chain.sort_by_key(|r| self.config.proximity.get(r.as_str()).copied().unwrap_or(u32::MAX));
        chain
    }

    async fn call(&self, to: &ServerId, req: Request) -> Result<Response> {
        call_timeout(&*self.transport, to, req, self.config.rpc_timeout()).await
    }
}
