//! Minimal in-memory master.
//!
//! Keeps the file → chunk table, chunk replica sets, chunkserver liveness and
//! mutation leases. It holds no operation log and does not re-replicate; it
//! exists so the mutation protocol can run end to end.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

use crate::common::{ChunkId, ServerId};
use crate::config::MasterConfig;
use crate::error::{GfsError, Result};
use crate::lease::{Lease, LeaseTable};
use crate::msg::{ChunkLocation, LeaseGrant, MessageKind, ReadTarget, Request, Response};
use crate::network::{call_timeout, Node, Transport};

struct ChunkserverInfo {
    last_seen: Instant,
    chunks: HashSet<ChunkId>,
}

#[derive(Default)]
struct MasterState {
    /// Path → chunks, in file order.
    file_table: HashMap<String, Vec<ChunkId>>,
    chunkservers: HashMap<ServerId, ChunkserverInfo>,
    chunk_counter: u64,
    chunk_locations: HashMap<ChunkId, Vec<ServerId>>,
    leases: LeaseTable,
    /// Chunks a client found full. They are never leased again.
    sealed: HashSet<ChunkId>,
    /// Last server whose grant on a chunk went unacknowledged.
    failed_grants: HashMap<ChunkId, ServerId>,
}

impl MasterState {
    fn live_servers(&self, config: &MasterConfig, now: Instant) -> Vec<&ServerId> {
        self.chunkservers.keys().filter(|id| self.is_live(id, config, now)).collect()
    }

    fn register(&mut self, server: &ServerId, chunks: &[ChunkId], now: Instant) {
        let info = self
            .chunkservers
            .entry(server.clone())
            .or_insert_with(|| ChunkserverInfo { last_seen: now, chunks: HashSet::new() });
        info.last_seen = now;
        info.chunks = chunks.iter().copied().collect();

        for chunk in chunks {
            let replicas = self.chunk_locations.entry(*chunk).or_default();
            if !replicas.contains(server) {
                replicas.push(server.clone());
            }
            self.chunk_counter = self.chunk_counter.max(chunk + 1);
        }
    }

    fn is_live(&self, server: &ServerId, config: &MasterConfig, now: Instant) -> bool {
        self.chunkservers
            .get(server)
            .is_some_and(|info| now.saturating_duration_since(info.last_seen) < config.heartbeat_timeout())
    }

    /// Where `chunk` lives, listing only replicas that are still heartbeating.
    fn location(&self, chunk: ChunkId, chunk_index: u64, config: &MasterConfig, now: Instant) -> ChunkLocation {
        let lease = self.leases.confirmed(chunk, now);
        let replicas: Vec<ServerId> = self
            .chunk_locations
            .get(&chunk)
            .map(|rs| rs.iter().filter(|r| self.is_live(r, config, now)).cloned().collect())
            .unwrap_or_default();
        ChunkLocation {
            chunk,
            chunk_index,
            replicas,
            primary: lease.map(|l| l.holder.clone()),
            epoch: lease.map(|l| l.epoch).unwrap_or(0),
        }
    }
}

pub struct MasterServer {
    id: ServerId,
    config: MasterConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<MasterState>,
    /// Held while allocating chunks or granting leases, both of which talk
    /// to chunkservers before the state can be updated.
    grant_lock: tokio::sync::Mutex<()>,
}

impl MasterServer {
    pub fn new(id: ServerId, config: MasterConfig, transport: Arc<dyn Transport>) -> MasterServer {
        MasterServer {
            id,
            config,
            transport,
            state: Mutex::new(MasterState::default()),
            grant_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chunkserver_count(&self) -> usize {
        self.state().chunkservers.len()
    }

    pub fn file_chunks(&self, path: &str) -> Vec<ChunkId> {
        self.state().file_table.get(path).cloned().unwrap_or_default()
    }

    pub fn replicas(&self, chunk: ChunkId) -> Vec<ServerId> {
        self.state().chunk_locations.get(&chunk).cloned().unwrap_or_default()
    }

    /// Current lease holder of `chunk`.
    pub fn lease_holder(&self, chunk: ChunkId) -> Option<ServerId> {
        self.state().leases.confirmed(chunk, Instant::now()).map(|l| l.holder.clone())
    }

    pub fn active_leases(&self) -> usize {
        self.state().leases.active_count(Instant::now())
    }

    /// Receive a chunkserver's (re)connect. A reconnecting server has lost
    /// its in-memory leases, so the master forgets them too.
    fn chunk_connect(&self, server: ServerId, chunks: Vec<ChunkId>) {
        let mut state = self.state();
        let revoked = state.leases.revoke_holder(&server);
        state.register(&server, &chunks, Instant::now());
        tracing::info!(%server, chunks = chunks.len(), ?revoked, "chunkserver connected");
    }

    fn heartbeat(&self, server: ServerId, chunks: Vec<ChunkId>) -> Result<()> {
        let mut state = self.state();
        if !state.chunkservers.contains_key(&server) {
            return Err(GfsError::Protocol(format!("unknown chunkserver {server}, reconnect")));
        }
        state.register(&server, &chunks, Instant::now());
        Ok(())
    }

    fn chunk_lost(&self, server: ServerId, chunk: ChunkId) {
        let mut state = self.state();
        if let Some(replicas) = state.chunk_locations.get_mut(&chunk) {
            replicas.retain(|r| r != &server);
        }
        if let Some(info) = state.chunkservers.get_mut(&server) {
            info.chunks.remove(&chunk);
        }
        state.leases.release(chunk, &server);
        tracing::warn!(%server, chunk, "replica lost");
    }

    /// Allocate a chunk at the end of `path` and format it on its replicas.
    /// Caller holds `grant_lock`.
    async fn allocate_chunk(&self, path: &str) -> Result<ChunkId> {
        let (chunk, replicas) = {
            let mut state = self.state();
            let mut live: Vec<(ServerId, usize)> = state
                .live_servers(&self.config, Instant::now())
                .into_iter()
                .map(|id| (id.clone(), state.chunkservers.get(id).map(|i| i.chunks.len()).unwrap_or(0)))
                .collect();
            if live.len() < self.config.replication {
                return Err(GfsError::NotEnoughChunkservers {
                    needed: self.config.replication,
                    available: live.len(),
                });
            }
            // Least loaded first.
            live.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let replicas: Vec<ServerId> =
                live.into_iter().take(self.config.replication).map(|(id, _)| id).collect();

            let chunk = state.chunk_counter;
            state.chunk_counter += 1;
            (chunk, replicas)
        };

        let creates = replicas.iter().map(|server| {
            call_timeout(&*self.transport, server, Request::CreateChunk { chunk }, self.config.rpc_timeout())
        });
        for res in join_all(creates).await {
            res?.ok()?;
        }

        let mut state = self.state();
        for server in &replicas {
            if let Some(info) = state.chunkservers.get_mut(server) {
                info.chunks.insert(chunk);
            }
        }
        state.chunk_locations.insert(chunk, replicas.clone());
        state.file_table.entry(path.to_string()).or_default().push(chunk);
        tracing::info!(path, chunk, ?replicas, "chunk allocated");
        Ok(chunk)
    }

    /// Return `chunk`'s location, granting a lease first if none is active.
    ///
    /// The lease is recorded as tentative before the grant is sent. If the
    /// holder's answer is lost the grant may still have landed, so the
    /// tentative lease stays in place and only the same holder is asked
    /// again, under the same epoch, until it has run out. Caller holds
    /// `grant_lock`.
    async fn ensure_lease(&self, chunk: ChunkId, chunk_index: u64) -> Result<ChunkLocation> {
        let (primary, epoch, replicas) = {
            let mut state = self.state();
            let now = Instant::now();
            state.leases.expire(now);
            if state.sealed.contains(&chunk) {
                return Err(GfsError::ChunkFull { chunk });
            }
            if !state.chunk_locations.contains_key(&chunk) {
                return Err(GfsError::NoSuchChunk(chunk));
            }
            let replicas = state.location(chunk, chunk_index, &self.config, now).replicas;
            match state.leases.active(chunk, now).cloned() {
                Some(lease) if lease.confirmed => return Ok(state.location(chunk, chunk_index, &self.config, now)),
                Some(lease) => (lease.holder, lease.epoch, replicas),
                None => {
                    // Prefer a replica other than the one that last left a grant unanswered.
                    let failed = state.failed_grants.get(&chunk);
                    let primary = replicas
                        .iter()
                        .find(|r| Some(*r) != failed)
                        .or_else(|| replicas.first())
                        .cloned()
                        .ok_or(GfsError::NotEnoughChunkservers { needed: 1, available: 0 })?;
                    let epoch = state.leases.next_epoch(chunk);
                    (primary, epoch, replicas)
                }
            }
        };

        let sent = Instant::now();
        // The holder starts its lease on receipt. A grant that arrives at all
        // arrives within the rpc timeout.
        let tentative_expiry = sent + self.config.lease_duration() + self.config.rpc_timeout();
        {
            let mut state = self.state();
            let tentative = Lease { holder: primary.clone(), epoch, expires: tentative_expiry, confirmed: false };
            if !state.leases.install(chunk, tentative, sent) {
                return Err(GfsError::Protocol(format!("lease on chunk {chunk} changed during grant")));
            }
        }

        let grant = LeaseGrant {
            chunk,
            epoch,
            duration_ms: self.config.lease_duration_ms,
            secondaries: replicas.iter().filter(|r| **r != primary).cloned().collect(),
        };
        let res = call_timeout(&*self.transport, &primary, Request::GrantLease(grant), self.config.rpc_timeout())
            .await
            .and_then(Response::ok);

        let mut state = self.state();
        let now = Instant::now();
        if let Err(e) = res {
            tracing::warn!(chunk, %primary, epoch, error = %e, "lease grant unacknowledged, holding it as tentative");
            state.failed_grants.insert(chunk, primary);
            return Err(e);
        }

        // Never end the lease before the holder does, even if an earlier
        // copy of this grant lands late.
        let expires = std::cmp::max(now + self.config.lease_duration(), tentative_expiry);
        let lease = Lease { holder: primary.clone(), epoch, expires, confirmed: true };
        if !state.leases.install(chunk, lease, now) {
            return Err(GfsError::Protocol(format!("lease on chunk {chunk} changed during grant")));
        }
        state.failed_grants.remove(&chunk);
        tracing::info!(chunk, %primary, epoch, "lease granted");
        Ok(state.location(chunk, chunk_index, &self.config, now))
    }

    async fn client_open(&self, path: String, chunk_index: Option<u64>) -> Result<ChunkLocation> {
        let _guard = self.grant_lock.lock().await;

        let existing = self.file_chunks(&path);
        let wanted = match chunk_index {
            Some(index) => index,
            None => existing.len().saturating_sub(1) as u64,
        };
        let mut have = existing.len() as u64;
        while have <= wanted {
            self.allocate_chunk(&path).await?;
            have += 1;
        }

        let chunk = self.file_chunks(&path)[wanted as usize];
        self.ensure_lease(chunk, wanted).await
    }

    async fn allocate_after(&self, path: String, full_chunk: ChunkId) -> Result<ChunkLocation> {
        let _guard = self.grant_lock.lock().await;

        if self.file_chunks(&path).contains(&full_chunk) {
            self.state().sealed.insert(full_chunk);
        }
        // Someone else may already have moved the file past the full chunk.
        if self.file_chunks(&path).last() == Some(&full_chunk) {
            self.allocate_chunk(&path).await?;
        }
        let chunks = self.file_chunks(&path);
        let index = chunks.len().saturating_sub(1);
        let chunk = *chunks.get(index).ok_or_else(|| GfsError::ReadErr(format!("no such file {path}")))?;
        self.ensure_lease(chunk, index as u64).await
    }

    fn client_read(&self, target: ReadTarget, chunk_index: u64) -> Response {
        let ReadTarget::File(path) = target else {
            return Response::ReadErr { reason: "the master resolves files, not chunks".to_string() };
        };
        let state = self.state();
        let Some(chunks) = state.file_table.get(&path) else {
            return Response::ReadErr { reason: format!("no such file {path}") };
        };
        match chunks.get(chunk_index as usize) {
            Some(chunk) => Response::Located(state.location(*chunk, chunk_index, &self.config, Instant::now())),
            None => Response::ReadErr { reason: format!("{path} has no chunk {chunk_index}") },
        }
    }

    async fn dispatch(&self, req: Request) -> Response {
        let kind = req.kind();
        tracing::trace!(?kind, "master request");

        let res = match req {
            Request::ChunkConnect { server, chunks } => {
                self.chunk_connect(server, chunks);
                Ok(Response::Ok)
            }
            Request::Heartbeat { server, chunks } => self.heartbeat(server, chunks).map(|()| Response::Ok),
            Request::ChunkLost { server, chunk } => {
                self.chunk_lost(server, chunk);
                Ok(Response::Ok)
            }
            Request::ClientOpen { path, chunk_index, length: _ } => {
                self.client_open(path, chunk_index).await.map(Response::Located)
            }
            Request::AllocateChunk { path, full_chunk } => {
                self.allocate_after(path, full_chunk).await.map(Response::Located)
            }
            Request::ClientRead { target, offset_or_index, length: _ } => {
                Ok(self.client_read(target, offset_or_index))
            }
            Request::CreateChunk { .. }
            | Request::GrantLease(_)
            | Request::PushData(_)
            | Request::Commit(_)
            | Request::Apply(_)
            | Request::Retransmit { .. } => Err(GfsError::Protocol(format!("master does not handle {kind:?}"))),
        };

        res.unwrap_or_else(|e| {
            tracing::debug!(?kind, error = %e, "master request failed");
            // Opens that cannot succeed on retry end as a read error.
            match kind {
                MessageKind::ClientOpen | MessageKind::AllocateChunk if !e.is_retryable() => {
                    Response::ReadErr { reason: e.to_string() }
                }
                _ => Response::Failed(e),
            }
        })
    }
}

impl Node for MasterServer {
    fn id(&self) -> &ServerId {
        &self.id
    }

    fn handle(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
        async move { self.dispatch(req).await }.boxed()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::chunkserver::tests::test_config;
    use crate::chunkserver::Chunkserver;
    use crate::network::NetworkShim;

    /// A master and `n` connected chunkservers on one in-process network.
    pub(crate) async fn setup(
        n: usize,
        dir: &std::path::Path,
    ) -> (Arc<NetworkShim>, Arc<MasterServer>, Vec<Arc<Chunkserver>>) {
        setup_with(n, dir, MasterConfig::default()).await
    }

    async fn setup_with(
        n: usize,
        dir: &std::path::Path,
        config: MasterConfig,
    ) -> (Arc<NetworkShim>, Arc<MasterServer>, Vec<Arc<Chunkserver>>) {
        let net = Arc::new(NetworkShim::new());
        let master = Arc::new(MasterServer::new("master".into(), config, net.clone()));
        net.add_node(master.clone());

        let mut servers = vec![];
        for i in 0..n {
            let cs = Arc::new(Chunkserver::new(test_config(&format!("s{i}"), dir), net.clone()).unwrap());
            net.add_node(cs.clone());
            cs.connect_to_master().await.unwrap();
            servers.push(cs);
        }
        (net, master, servers)
    }

    fn located(res: Response) -> ChunkLocation {
        match res {
            Response::Located(loc) => loc,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_allocates_and_leases() {
        let dir = tempfile::tempdir().unwrap();
        let (net, master, servers) = setup(3, dir.path()).await;

        let req = Request::ClientOpen { path: "/logs".into(), chunk_index: None, length: 10 };
        let loc = located(net.call(&"master".into(), req).await.unwrap());

        assert_eq!(loc.chunk_index, 0);
        assert_eq!(loc.replicas.len(), 3);
        assert_eq!(loc.epoch, 1);
        let primary = loc.primary.clone().unwrap();
        assert_eq!(master.lease_holder(loc.chunk), Some(primary.clone()));
        for cs in &servers {
            assert!(cs.chunk_info(loc.chunk).is_some());
            assert_eq!(cs.is_primary(loc.chunk), cs.id() == &primary);
        }

        // Opening again reuses the active lease.
        let req = Request::ClientOpen { path: "/logs".into(), chunk_index: Some(0), length: 10 };
        let again = located(net.call(&"master".into(), req).await.unwrap());
        assert_eq!(again, loc);
        assert_eq!(master.active_leases(), 1);
    }

    #[tokio::test]
    async fn allocate_after_full_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (net, master, _servers) = setup(3, dir.path()).await;

        let open = Request::ClientOpen { path: "/f".into(), chunk_index: None, length: 0 };
        let first = located(net.call(&"master".into(), open).await.unwrap());

        let alloc = Request::AllocateChunk { path: "/f".into(), full_chunk: first.chunk };
        let second = located(net.call(&"master".into(), alloc.clone()).await.unwrap());
        assert_ne!(second.chunk, first.chunk);
        assert_eq!(second.chunk_index, 1);

        // A second client reporting the same full chunk does not allocate again.
        let again = located(net.call(&"master".into(), alloc).await.unwrap());
        assert_eq!(again.chunk, second.chunk);
        assert_eq!(master.file_chunks("/f"), vec![first.chunk, second.chunk]);
    }

    #[tokio::test]
    async fn not_enough_chunkservers() {
        let dir = tempfile::tempdir().unwrap();
        let (net, _master, _servers) = setup(2, dir.path()).await;

        let req = Request::ClientOpen { path: "/f".into(), chunk_index: None, length: 0 };
        let res = net.call(&"master".into(), req).await.unwrap();
        assert!(matches!(res, Response::ReadErr { .. }));
    }

    #[tokio::test]
    async fn reads_resolve_without_granting_leases() {
        let dir = tempfile::tempdir().unwrap();
        let (net, master, _servers) = setup(3, dir.path()).await;

        let read = Request::ClientRead { target: ReadTarget::File("/f".into()), offset_or_index: 0, length: 4 };
        assert!(matches!(net.call(&"master".into(), read.clone()).await.unwrap(), Response::ReadErr { .. }));

        let open = Request::ClientOpen { path: "/f".into(), chunk_index: Some(1), length: 0 };
        net.call(&"master".into(), open).await.unwrap();
        assert_eq!(master.file_chunks("/f").len(), 2);
        assert_eq!(master.active_leases(), 1);

        let loc = located(net.call(&"master".into(), read).await.unwrap());
        assert_eq!(loc.chunk, master.file_chunks("/f")[0]);
        assert_eq!(loc.primary, None);
    }

    #[tokio::test]
    async fn reconnect_revokes_leases_and_lost_chunks_leave_replica_set() {
        let dir = tempfile::tempdir().unwrap();
        let (net, master, servers) = setup(3, dir.path()).await;

        let open = Request::ClientOpen { path: "/f".into(), chunk_index: None, length: 0 };
        let loc = located(net.call(&"master".into(), open).await.unwrap());
        let primary = loc.primary.unwrap();

        let holder = servers.iter().find(|cs| cs.id() == &primary).unwrap();
        holder.connect_to_master().await.unwrap();
        assert_eq!(master.active_leases(), 0);

        let lost = Request::ChunkLost { server: primary.clone(), chunk: loc.chunk };
        net.call(&"master".into(), lost).await.unwrap().ok().unwrap();
        assert!(!master.replicas(loc.chunk).contains(&primary));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_server_asks_for_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (net, _master, _servers) = setup(1, dir.path()).await;

        let hb = Request::Heartbeat { server: "stranger".into(), chunks: vec![] };
        let res = net.call(&"master".into(), hb).await.unwrap();
        assert!(matches!(res, Response::Failed(GfsError::Protocol(_))));
    }

    /// A chunkserver whose lease grants take effect at once but are answered
    /// late while `slow` is set.
    struct SlowGrants {
        inner: Arc<Chunkserver>,
        slow: AtomicBool,
    }

    impl Node for SlowGrants {
        fn id(&self) -> &ServerId {
            self.inner.id()
        }

        fn handle(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
            async move {
                let grant = matches!(req, Request::GrantLease(_));
                let res = self.inner.clone().handle(req).await;
                if grant && self.slow.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                res
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn unanswered_grant_keeps_other_replicas_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig { rpc_timeout_ms: 50, ..MasterConfig::default() };
        let (net, master, servers) = setup_with(3, dir.path(), config).await;
        let slow = Arc::new(SlowGrants { inner: servers[0].clone(), slow: AtomicBool::new(true) });
        net.add_node(slow.clone());

        let open = Request::ClientOpen { path: "/f".into(), chunk_index: None, length: 0 };
        for _ in 0..2 {
            let res = net.call(&"master".into(), open.clone()).await.unwrap();
            assert_eq!(res, Response::Failed(GfsError::Timeout { peer: "s0".into() }));
        }

        // The grant landed at s0, and nobody else was asked.
        let chunk = master.file_chunks("/f")[0];
        assert_eq!(servers[0].current_lease(chunk).unwrap().epoch, 1);
        assert!(!servers[1].is_primary(chunk));
        assert!(!servers[2].is_primary(chunk));
        assert_eq!(master.lease_holder(chunk), None);

        // Once s0 answers, the same grant is confirmed.
        slow.slow.store(false, Ordering::SeqCst);
        let loc = located(net.call(&"master".into(), open).await.unwrap());
        assert_eq!(loc.primary, Some(ServerId::from("s0")));
        assert_eq!(loc.epoch, 1);
        assert_eq!(master.lease_holder(chunk), Some(ServerId::from("s0")));
    }

    #[tokio::test]
    async fn sealed_chunk_is_not_leased_again() {
        let dir = tempfile::tempdir().unwrap();
        let (net, master, _servers) = setup(3, dir.path()).await;

        let open = Request::ClientOpen { path: "/f".into(), chunk_index: Some(0), length: 0 };
        let first = located(net.call(&"master".into(), open.clone()).await.unwrap());
        let alloc = Request::AllocateChunk { path: "/f".into(), full_chunk: first.chunk };
        located(net.call(&"master".into(), alloc).await.unwrap());

        let res = net.call(&"master".into(), open).await.unwrap();
        assert_eq!(res, Response::Failed(GfsError::ChunkFull { chunk: first.chunk }));
        assert_eq!(master.file_chunks("/f").len(), 2);
    }
}
