//! Message contracts between master, chunkservers and clients.
//!
//! Every conversation is a single `Request` answered by a single `Response`.
//! Nodes dispatch on the request variant; `MessageKind` names the variant for
//! logging and routing checks.

use serde::{Deserialize, Serialize};

use crate::common::{ChunkId, Epoch, SeqNo, ServerId, WriteToken};
use crate::error::GfsError;

/// Where a mutation lands in the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Explicit offset chosen by the client.
    At(u64),
    /// Record append: the primary picks the current end of chunk.
    Append,
}

/// Read-only snapshot of a chunk's replica set handed out by the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub chunk: ChunkId,
    pub chunk_index: u64,
    pub replicas: Vec<ServerId>,
    /// Current lease holder, if a lease was requested.
    pub primary: Option<ServerId>,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Write the staged payload at the record's offset.
    #[default]
    Write,
    /// Close the chunk to further mutations. Carries no payload.
    Seal,
}

/// One accepted mutation, as ordered by the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub chunk: ChunkId,
    pub token: WriteToken,
    pub epoch: Epoch,
    pub seq: SeqNo,
    /// Resolved landing offset (appends are resolved by the primary).
    pub offset: u64,
    pub len: u64,
    #[serde(default)]
    pub kind: MutationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub chunk: ChunkId,
    pub epoch: Epoch,
    pub duration_ms: u64,
    pub secondaries: Vec<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushData {
    pub token: WriteToken,
    pub chunk: ChunkId,
    pub data: Vec<u8>,
    /// Hops still to be reached after the recipient, nearest first.
    pub chain: Vec<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub chunk: ChunkId,
    pub token: WriteToken,
    pub mode: WriteMode,
    pub len: u64,
}

/// A record replayed by the primary together with its payload, used to fill
/// a secondary's sequence gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetransmitRecord {
    pub record: MutationRecord,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadTarget {
    /// Resolve a file's chunk at `offset_or_index` (a chunk index) via the master.
    File(String),
    /// Fetch bytes at `offset_or_index` (a byte offset) from a chunkserver.
    Chunk(ChunkId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ChunkConnect { server: ServerId, chunks: Vec<ChunkId> },
    Heartbeat { server: ServerId, chunks: Vec<ChunkId> },
    ChunkLost { server: ServerId, chunk: ChunkId },
    /// Resolve a chunk for mutation, granting a lease if none is active.
    /// `chunk_index: None` means the file's last chunk.
    ClientOpen { path: String, chunk_index: Option<u64>, length: u64 },
    AllocateChunk { path: String, full_chunk: ChunkId },
    ClientRead { target: ReadTarget, offset_or_index: u64, length: u64 },
    CreateChunk { chunk: ChunkId },
    GrantLease(LeaseGrant),
    PushData(PushData),
    Commit(CommitRequest),
    Apply(MutationRecord),
    Retransmit { chunk: ChunkId, records: Vec<RetransmitRecord>, until: SeqNo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ChunkConnect,
    Heartbeat,
    ChunkLost,
    ClientOpen,
    AllocateChunk,
    ClientRead,
    CreateChunk,
    GrantLease,
    PushData,
    Commit,
    Apply,
    Retransmit,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::ChunkConnect { .. } => MessageKind::ChunkConnect,
            Request::Heartbeat { .. } => MessageKind::Heartbeat,
            Request::ChunkLost { .. } => MessageKind::ChunkLost,
            Request::ClientOpen { .. } => MessageKind::ClientOpen,
            Request::AllocateChunk { .. } => MessageKind::AllocateChunk,
            Request::ClientRead { .. } => MessageKind::ClientRead,
            Request::CreateChunk { .. } => MessageKind::CreateChunk,
            Request::GrantLease(_) => MessageKind::GrantLease,
            Request::PushData(_) => MessageKind::PushData,
            Request::Commit(_) => MessageKind::Commit,
            Request::Apply(_) => MessageKind::Apply,
            Request::Retransmit { .. } => MessageKind::Retransmit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Located(ChunkLocation),
    Data(Vec<u8>),
    Committed { offset: u64, seq: SeqNo },
    /// The secondary has applied every sequence number up to `through`.
    Applied { through: SeqNo },
    /// The secondary holds the instruction and needs `from..=to` first.
    Missing { from: SeqNo, to: SeqNo },
    ReadErr { reason: String },
    Failed(GfsError),
}

impl Response {
    /// Turn a response the caller did not expect into an error.
    pub fn into_error(self) -> GfsError {
        match self {
            Response::Failed(e) => e,
            Response::ReadErr { reason } => GfsError::ReadErr(reason),
            other => GfsError::Protocol(format!("{other:?}")),
        }
    }

    /// For requests answered with a bare acknowledgement.
    pub fn ok(self) -> Result<(), GfsError> {
        match self {
            Response::Ok => Ok(()),
            other => Err(other.into_error()),
        }
    }
}

impl From<GfsError> for Response {
    fn from(e: GfsError) -> Self {
        Response::Failed(e)
    }
}
