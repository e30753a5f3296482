use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;

use gfs::common::{ServerId, WriteToken};
use gfs::config::{ChunkserverConfig, ClientConfig, MasterConfig};
use gfs::msg::{ChunkLocation, CommitRequest, MessageKind, PushData, Request, Response, WriteMode};
use gfs::{Chunkserver, Client, GfsError, MasterServer, NetworkShim, Node, Transport};

const CHUNK_SIZE: u64 = 64;

struct Cluster {
    net: Arc<NetworkShim>,
    master: Arc<MasterServer>,
    servers: Vec<Arc<Chunkserver>>,
    dir: TempDir,
}

fn chunkserver_config(id: &str, dir: &Path) -> ChunkserverConfig {
    ChunkserverConfig {
        id: Some(id.to_string()),
        master_addr: "master".to_string(),
        data_dir: dir.join(id),
        chunk_size: CHUNK_SIZE,
        staging_capacity_bytes: 4096,
        staging_eviction_grace_ms: 0,
        rpc_timeout_ms: 1_000,
        ..ChunkserverConfig::default()
    }
}

async fn cluster() -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(NetworkShim::new());
    let master = Arc::new(MasterServer::new("master".into(), MasterConfig::default(), net.clone()));
    net.add_node(master.clone());

    let mut servers = vec![];
    for id in ["s1", "s2", "s3"] {
        let cs = Arc::new(Chunkserver::new(chunkserver_config(id, dir.path()), net.clone()).unwrap());
        net.add_node(cs.clone());
        cs.connect_to_master().await.unwrap();
        servers.push(cs);
    }
    Cluster { net, master, servers, dir }
}

impl Cluster {
    fn client(&self, id: &str) -> Client {
        let config = ClientConfig {
            id: id.to_string(),
            master_addr: "master".to_string(),
            chunk_size: CHUNK_SIZE,
            max_attempts: 5,
            retry_backoff_ms: 20,
            rpc_timeout_ms: 1_000,
            proximity: HashMap::new(),
        };
        Client::new(config, self.net.clone())
    }

    fn server(&self, id: &ServerId) -> &Arc<Chunkserver> {
        self.servers.iter().find(|cs| cs.id() == id).unwrap()
    }

    async fn open(&self, path: &str, chunk_index: u64) -> ChunkLocation {
        let req = Request::ClientOpen { path: path.to_string(), chunk_index: Some(chunk_index), length: 0 };
        match self.net.call(&"master".into(), req).await.unwrap() {
            Response::Located(loc) => loc,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Push then commit by hand, bypassing the client's retries.
    async fn raw_mutation(&self, loc: &ChunkLocation, attempt: u64, mode: WriteMode, data: &[u8]) -> Response {
        let token = WriteToken::generate("raw", attempt, data);
        let (first, rest) = loc.replicas.split_first().unwrap();
        let push = PushData { token, chunk: loc.chunk, data: data.to_vec(), chain: rest.to_vec() };
        self.net.call(first, Request::PushData(push)).await.unwrap().ok().unwrap();

        let commit = CommitRequest { chunk: loc.chunk, token, mode, len: data.len() as u64 };
        let primary = loc.primary.clone().unwrap();
        self.net.call(&primary, Request::Commit(commit)).await.unwrap()
    }

    fn contents(&self, chunk: u64) -> Vec<Vec<u8>> {
        self.servers.iter().map(|cs| cs.read_chunk(chunk, 0, CHUNK_SIZE).unwrap()).collect()
    }
}

#[tokio::test]
async fn append_to_empty_chunk_reaches_every_replica() {
    let c = cluster().await;
    let client = c.client("a");

    let outcome = client.append("/log", b"0123456789").await.unwrap();
    assert_eq!(outcome.offset, 0);
    for cs in &c.servers {
        assert_eq!(cs.chunk_info(outcome.chunk).unwrap().used, 10);
    }
}

#[tokio::test]
async fn write_past_chunk_end_seals_it_and_appends_move_on() {
    let c = cluster().await;
    let loc = c.open("/f", 0).await;

    let res = c.raw_mutation(&loc, 1, WriteMode::At(60), &[b'x'; 10]).await;
    assert_eq!(res, Response::Failed(GfsError::ChunkFull { chunk: loc.chunk }));
    for cs in &c.servers {
        let info = cs.chunk_info(loc.chunk).unwrap();
        assert!(info.full);
        assert_eq!(info.used, 0);
    }

    // The client is sent to a fresh chunk.
    let outcome = c.client("a").append("/f", b"next").await.unwrap();
    assert_eq!((outcome.chunk_index, outcome.offset), (1, 0));
    assert_ne!(outcome.chunk, loc.chunk);

    // The sealed chunk is not leased again, even once its lease has gone.
    let err = c.client("b").write("/f", 0, b"late").await.unwrap_err();
    assert_eq!(err, GfsError::ChunkFull { chunk: loc.chunk });
}

#[tokio::test]
async fn storage_failure_drops_replica_and_tells_master() {
    let c = cluster().await;
    let loc = c.open("/f", 0).await;
    let primary = loc.primary.clone().unwrap();
    let victim = loc.replicas.iter().find(|r| **r != primary).unwrap().clone();

    std::fs::remove_file(c.dir.path().join(victim.as_str()).join(format!("ch{}", loc.chunk))).unwrap();
    let res = c.raw_mutation(&loc, 1, WriteMode::At(0), b"abcd").await;
    assert_eq!(res, Response::Failed(GfsError::PartialFailure { failed: vec![victim.clone()] }));
    assert!(c.server(&victim).chunk_info(loc.chunk).is_none());

    // The report reaches the master in the background.
    for _ in 0..100 {
        if !c.master.replicas(loc.chunk).contains(&victim) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!c.master.replicas(loc.chunk).contains(&victim));
    assert_eq!(c.master.replicas(loc.chunk).len(), 2);
}

#[tokio::test]
async fn partial_failure_names_replica_and_retry_converges() {
    let c = cluster().await;
    let loc = c.open("/f", 0).await;
    let primary = loc.primary.clone().unwrap();
    let victim = loc.replicas.iter().find(|r| **r != primary).unwrap().clone();

    c.net.fail_kind(&victim, MessageKind::Apply);
    let res = c.raw_mutation(&loc, 1, WriteMode::At(0), b"abcd").await;
    assert_eq!(res, Response::Failed(GfsError::PartialFailure { failed: vec![victim.clone()] }));

    // The replica comes back while the client is retrying.
    let net = c.net.clone();
    let healed = victim.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        net.heal(&healed);
    });
    c.client("a").write("/f", 0, b"abcd").await.unwrap();

    for contents in c.contents(loc.chunk) {
        assert_eq!(contents, b"abcd".to_vec());
    }
}

#[tokio::test]
async fn retried_explicit_write_is_idempotent() {
    let c = cluster().await;
    let client = c.client("a");

    client.write("/f", 8, b"data").await.unwrap();
    let once = c.contents(c.master.file_chunks("/f")[0]);

    client.write("/f", 8, b"data").await.unwrap();
    let twice = c.contents(c.master.file_chunks("/f")[0]);

    assert_eq!(once, twice);
    let mut expected = vec![0u8; 8];
    expected.extend_from_slice(b"data");
    assert!(twice.iter().all(|replica| *replica == expected));
}

#[tokio::test]
async fn writes_are_capped_at_a_quarter_chunk() {
    let c = cluster().await;
    let client = c.client("a");

    let err = client.append("/f", &[1u8; 17]).await.unwrap_err();
    assert_eq!(err, GfsError::WriteTooLarge { len: 17, max: 16 });
    assert!(c.servers.iter().all(|cs| cs.staged_bytes() == 0));

    // File writes are split instead.
    let outcomes = client.write("/f", 0, &[2u8; 40]).await.unwrap();
    let sizes: Vec<u64> = outcomes.windows(2).map(|w| w[1].offset - w[0].offset).collect();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(sizes, vec![16, 16]);
    assert_eq!(client.read("/f", 0, 64).await.unwrap(), vec![2u8; 40]);
}

#[tokio::test]
async fn concurrent_appends_get_distinct_sequence_numbers() {
    let c = cluster().await;
    let clients = [c.client("a"), c.client("b")];

    let records: Vec<[u8; 4]> = (0..8u8).map(|i| [i; 4]).collect();
    let appends = records.iter().enumerate().map(|(i, r)| clients[i % 2].append("/log", r));
    let outcomes: Vec<_> = join_all(appends).await.into_iter().map(Result::unwrap).collect();

    let seqs: HashSet<u64> = outcomes.iter().map(|o| o.seq).collect();
    let offsets: HashSet<u64> = outcomes.iter().map(|o| o.offset).collect();
    assert_eq!(seqs, (1..=8).collect());
    assert_eq!(offsets.len(), 8);
    assert_eq!(c.master.active_leases(), 1);

    let chunk = outcomes[0].chunk;
    for cs in &c.servers {
        assert_eq!(cs.applied(chunk).await, (1, 8));
    }
    let contents = c.contents(chunk);
    assert!(contents.iter().all(|replica| replica == &contents[0]));
    assert_eq!(contents[0].len(), 32);
}

#[tokio::test]
async fn restarted_primary_gets_a_new_epoch() {
    let c = cluster().await;
    let client = c.client("a");

    let first = client.append("/log", b"before").await.unwrap();
    let holder = c.master.lease_holder(first.chunk).unwrap();

    // Restart the primary: same disk, empty memory.
    let config = chunkserver_config(holder.as_str(), c.dir.path());
    let restarted = Arc::new(Chunkserver::new(config, c.net.clone()).unwrap());
    assert!(!restarted.is_primary(first.chunk));
    c.net.add_node(restarted.clone());
    restarted.connect_to_master().await.unwrap();
    assert_eq!(c.master.lease_holder(first.chunk), None);

    let second = client.append("/log", b"after").await.unwrap();
    assert_eq!(second.chunk, first.chunk);
    assert_eq!(second.offset, 6);
    assert_eq!(second.seq, 1);
    assert_eq!(restarted.applied(first.chunk).await.0, 2);
    assert_eq!(client.read("/log", 0, 64).await.unwrap(), b"beforeafter".to_vec());
}

#[tokio::test]
async fn checksums_survive_restart() {
    let c = cluster().await;
    let client = c.client("a");
    let outcome = client.append("/log", b"persisted").await.unwrap();

    let before = c.servers[0].chunk_info(outcome.chunk).unwrap();
    let reopened = Chunkserver::new(chunkserver_config("s1", c.dir.path()), c.net.clone()).unwrap();
    let after = reopened.chunk_info(outcome.chunk).unwrap();

    assert_eq!(before.checksum, after.checksum);
    assert_eq!(before.used, after.used);
}
