use serde::{Deserialize, Serialize};

use crate::common::{ChunkId, Epoch, ServerId};

/// Errors raised anywhere in the mutation protocol.
///
/// The type is serializable because chunkservers hand it back to their
/// callers inside a `Response::Failed`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GfsError {
    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: ServerId, reason: String },
    #[error("request to {peer} timed out")]
    Timeout { peer: ServerId },
    #[error("no staged data for token on chunk {chunk}")]
    StagedDataMissing { chunk: ChunkId },
    #[error("staging buffer full, cannot accept {len} bytes")]
    StagingFull { len: u64 },
    #[error("chunk {chunk} is full")]
    ChunkFull { chunk: ChunkId },
    #[error("write of {len} bytes exceeds the {max} byte limit")]
    WriteTooLarge { len: u64, max: u64 },
    #[error("{server} is not primary for chunk {chunk}")]
    NotPrimary { chunk: ChunkId, server: ServerId },
    #[error("stale lease epoch {got} for chunk {chunk}, replica is at {current}")]
    StaleEpoch { chunk: ChunkId, got: Epoch, current: Epoch },
    #[error("mutation failed at replicas {failed:?}")]
    PartialFailure { failed: Vec<ServerId> },
    #[error("push to {hop} failed: {reason}")]
    PushFailed { hop: ServerId, reason: String },
    #[error("no such chunk {0}")]
    NoSuchChunk(ChunkId),
    #[error("read failed: {0}")]
    ReadErr(String),
    #[error("need {needed} chunkservers, {available} available")]
    NotEnoughChunkservers { needed: usize, available: usize },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<GfsError> },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl GfsError {
    /// Errors the client answers by restarting the mutation from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GfsError::Transport { .. }
                | GfsError::Timeout { .. }
                | GfsError::StagedDataMissing { .. }
                | GfsError::StagingFull { .. }
                | GfsError::ChunkFull { .. }
                | GfsError::NotPrimary { .. }
                | GfsError::StaleEpoch { .. }
                | GfsError::PartialFailure { .. }
                | GfsError::PushFailed { .. }
        )
    }
}

impl From<std::io::Error> for GfsError {
    fn from(e: std::io::Error) -> Self {
        GfsError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for GfsError {
    fn from(e: serde_json::Error) -> Self {
        GfsError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GfsError>;
