//! A chunkserver stores chunk replicas on local disk, stages pushed data in
//! memory, and takes the primary or secondary role for each chunk depending on
//! whether it currently holds that chunk's lease.

pub mod ordering;
pub mod primary;
pub mod push;
pub mod secondary;
pub mod staging;
pub mod storage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::chunk::{ChunkGeometry, ChunkInfo};
use crate::common::{ChunkId, Epoch, SeqNo, ServerId};
use crate::config::ChunkserverConfig;
use crate::error::{GfsError, Result};
use crate::lease::HeldLease;
use crate::msg::{LeaseGrant, MutationKind, MutationRecord, ReadTarget, Request, Response};
use crate::network::{call_timeout, Node, Transport};

use ordering::{MutationLog, ReplicaCursor};
use staging::StagingBuffer;
use storage::ChunkserverStorage;

/// Mutation state of one chunk. Its async mutex serializes commits and
/// applies for the chunk.
pub(crate) struct ChunkState {
    pub(crate) cursor: ReplicaCursor,
    pub(crate) log: MutationLog,
}

pub struct Chunkserver {
    id: ServerId,
    master: ServerId,
    config: ChunkserverConfig,
    geometry: ChunkGeometry,
    transport: Arc<dyn Transport>,

    /// The storage for the chunkserver.
    storage: Mutex<ChunkserverStorage>,

    /// Pushed data waiting for its commit.
    staging: Mutex<StagingBuffer>,

    leases: Mutex<HashMap<ChunkId, HeldLease>>,
    chunk_states: Mutex<HashMap<ChunkId, Arc<tokio::sync::Mutex<ChunkState>>>>,
}

impl Chunkserver {
    pub fn new(config: ChunkserverConfig, transport: Arc<dyn Transport>) -> Result<Chunkserver> {
        let geometry = config.geometry();
        let storage = ChunkserverStorage::open(&config.data_dir, geometry.chunk_size)?;
        let staging = StagingBuffer::new(
            config.staging_capacity_bytes,
            Duration::from_millis(config.staging_idle_timeout_ms),
            Duration::from_millis(config.staging_eviction_grace_ms),
        );

        Ok(Chunkserver {
            id: config.server_id(),
            master: ServerId::new(config.master_addr.clone()),
            geometry,
            transport,
            storage: Mutex::new(storage),
            staging: Mutex::new(staging),
            leases: Mutex::new(HashMap::new()),
            chunk_states: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    pub(crate) fn storage(&self) -> MutexGuard<'_, ChunkserverStorage> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn staging(&self) -> MutexGuard<'_, StagingBuffer> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn chunk_state(&self, chunk: ChunkId) -> Arc<tokio::sync::Mutex<ChunkState>> {
        let mut states = self.chunk_states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(chunk)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(ChunkState {
                    cursor: ReplicaCursor::new(self.config.mutation_log_len),
                    log: MutationLog::new(self.config.mutation_log_len),
                }))
            })
            .clone()
    }

    pub(crate) async fn call(&self, to: &ServerId, req: Request) -> Result<Response> {
        call_timeout(&*self.transport, to, req, self.config.rpc_timeout()).await
    }

    /// The lease on `chunk` if this server holds a valid one.
    pub fn current_lease(&self, chunk: ChunkId) -> Option<HeldLease> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.get(&chunk).filter(|l| l.is_valid(Instant::now())).cloned()
    }

    pub fn is_primary(&self, chunk: ChunkId) -> bool {
        self.current_lease(chunk).is_some()
    }

    pub fn chunk_info(&self, chunk: ChunkId) -> Option<ChunkInfo> {
        self.storage().info(chunk).cloned()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.storage().chunk_ids()
    }

    pub fn read_chunk(&self, chunk: ChunkId, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.storage().read(chunk, offset, len)
    }

    /// (epoch, highest applied sequence number) for `chunk`.
    pub async fn applied(&self, chunk: ChunkId) -> (Epoch, SeqNo) {
        let state = self.chunk_state(chunk);
        let state = state.lock().await;
        (state.cursor.epoch(), state.cursor.applied())
    }

    pub fn staged_bytes(&self) -> u64 {
        self.staging().used_bytes()
    }

    /// Forget all staged data, as if the process had lost its memory.
    pub fn drop_staged(&self) {
        self.staging().clear();
    }

    fn grant_lease(&self, grant: LeaseGrant) {
        tracing::info!(
            server = %self.id,
            chunk = grant.chunk,
            epoch = grant.epoch,
            secondaries = ?grant.secondaries,
            "lease granted"
        );
        let held = HeldLease::from_grant(&grant, Instant::now());
        self.leases.lock().unwrap_or_else(PoisonError::into_inner).insert(grant.chunk, held);
    }

    /// Write a mutation to the local replica.
    pub(crate) fn apply_local(&self, record: &MutationRecord, data: &[u8]) -> Result<()> {
        if data.len() as u64 != record.len {
            return Err(GfsError::Protocol(format!(
                "payload of {} bytes for a {} byte mutation",
                data.len(),
                record.len
            )));
        }
        let res = match record.kind {
            MutationKind::Write => self.storage().write_at(record.chunk, record.offset, data),
            MutationKind::Seal => self.storage().mark_full(record.chunk).map(|()| 0),
        };
        match res {
            Ok(used) => {
                tracing::debug!(
                    server = %self.id,
                    chunk = record.chunk,
                    seq = record.seq,
                    kind = ?record.kind,
                    offset = record.offset,
                    used,
                    "applied mutation"
                );
                Ok(())
            }
            Err(GfsError::Storage(reason)) => Err(self.storage_failed(record.chunk, reason)),
            Err(e) => Err(e),
        }
    }

    /// The payload a record needs before it can be applied. Seals carry none.
    pub(crate) fn claim_payload(&self, record: &MutationRecord) -> Option<Vec<u8>> {
        match record.kind {
            MutationKind::Write => self.staging().claim(record.token, record.chunk),
            MutationKind::Seal => Some(Vec::new()),
        }
    }

    /// The replica of `chunk` is unusable: stop serving it and tell the master.
    fn storage_failed(&self, chunk: ChunkId, reason: String) -> GfsError {
        tracing::error!(server = %self.id, chunk, %reason, "storage failure, dropping replica");
        self.storage().drop_chunk(chunk);

        let transport = self.transport.clone();
        let master = self.master.clone();
        let req = Request::ChunkLost { server: self.id.clone(), chunk };
        tokio::spawn(async move {
            if let Err(e) = transport.call(&master, req).await {
                tracing::warn!(chunk, error = %e, "could not report lost chunk");
            }
        });

        GfsError::Storage(reason)
    }

    fn read_request(&self, target: ReadTarget, offset: u64, length: u64) -> Response {
        let chunk = match target {
            ReadTarget::Chunk(chunk) => chunk,
            ReadTarget::File(path) => {
                return Response::ReadErr { reason: format!("{path}: files are resolved by the master") }
            }
        };
        match self.read_chunk(chunk, offset, length) {
            Ok(data) => Response::Data(data),
            Err(e) => Response::ReadErr { reason: e.to_string() },
        }
    }

    async fn dispatch(&self, req: Request) -> Response {
        let kind = req.kind();
        tracing::trace!(server = %self.id, ?kind, "request");

        let res = match req {
            Request::PushData(push) => self.handle_push(push).await.map(|()| Response::Ok),
            Request::Commit(commit) => self.handle_commit(commit).await,
            Request::Apply(record) => self.handle_apply(record).await,
            Request::Retransmit { chunk, records, until } => {
                self.handle_retransmit(chunk, records, until).await
            }
            Request::ClientRead { target, offset_or_index, length } => {
                Ok(self.read_request(target, offset_or_index, length))
            }
            Request::CreateChunk { chunk } => self.storage().create_chunk(chunk).map(|()| Response::Ok),
            Request::GrantLease(grant) => {
                self.grant_lease(grant);
                Ok(Response::Ok)
            }
            Request::ChunkConnect { .. }
            | Request::Heartbeat { .. }
            | Request::ChunkLost { .. }
            | Request::ClientOpen { .. }
            | Request::AllocateChunk { .. } => {
                Err(GfsError::Protocol(format!("chunkserver does not handle {kind:?}")))
            }
        };

        res.unwrap_or_else(|e| {
            tracing::debug!(server = %self.id, ?kind, error = %e, "request failed");
            Response::Failed(e)
        })
    }

    /// Announce this server and its chunks to the master once.
    pub async fn connect_to_master(&self) -> Result<()> {
        let req = Request::ChunkConnect { server: self.id.clone(), chunks: self.chunk_ids() };
        self.call(&self.master, req).await?.ok()
    }

    /// Keep the master link alive: connect, heartbeat, and reconnect after any
    /// failure. Never returns.
    pub async fn run_master_link(self: Arc<Self>) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);

        loop {
            match self.connect_to_master().await {
                Ok(()) => {
                    tracing::info!(server = %self.id, master = %self.master, "connected to master");
                    loop {
                        tokio::time::sleep(heartbeat).await;
                        let req = Request::Heartbeat { server: self.id.clone(), chunks: self.chunk_ids() };
                        if let Err(e) = self.call(&self.master, req).await.and_then(Response::ok) {
                            tracing::warn!(server = %self.id, error = %e, "lost master, reconnecting");
                            break;
                        }
                    }
                }
                Err(e) => tracing::warn!(server = %self.id, error = %e, "master connect failed"),
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Periodically drop staged data whose commit never came.
    pub async fn run_staging_purge(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.purge_interval_ms);
        loop {
            tokio::time::sleep(interval).await;
            let purged = self.staging().purge_idle(Instant::now());
            if purged > 0 {
                tracing::debug!(server = %self.id, purged, "purged idle staged data");
            }
        }
    }

    /// Spawn the master link and the purge task.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_master_link()),
            tokio::spawn(self.clone().run_staging_purge()),
        ]
    }
}

impl Node for Chunkserver {
    fn id(&self) -> &ServerId {
        &self.id
    }

    fn handle(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
        async move { self.dispatch(req).await }.boxed()
    }
}
