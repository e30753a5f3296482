use std::path::PathBuf;
use std::sync::Arc;

use byte_unit::Byte;
use gfs::config::{ChunkserverConfig, ClientConfig, MasterConfig};
use gfs::msg::MessageKind;
use gfs::{Chunkserver, Client, MasterServer, NetworkShim, Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let network = Arc::new(NetworkShim::new());

    // Setup master.
    println!("Creating master.\n");
    let master = Arc::new(MasterServer::new("master".into(), MasterConfig::default(), network.clone()));
    network.add_node(master.clone());

    // Setup chunkserver 1-N.
    let n_chunkservers = 3;
    let mut chunkservers = vec![];
    for i in 0..n_chunkservers {
        println!("Creating chunkserver {i}.\n");
        let config = ChunkserverConfig {
            id: Some(format!("chunkserver-{i}")),
            master_addr: "master".to_string(),
            // data path is relative ./data/chunkserver-{i}
            data_dir: PathBuf::from(format!("./data/chunkserver-{i}")),
            ..ChunkserverConfig::default()
        };
        let chunkserver = Arc::new(Chunkserver::new(config, network.clone())?);
        network.add_node(chunkserver.clone());
        chunkserver.connect_to_master().await?;
        chunkservers.push(chunkserver);
    }
    println!("master sees {} chunkservers", master.chunkserver_count());

    let client_config = ClientConfig { master_addr: "master".to_string(), ..ClientConfig::default() };
    let client = Client::new(client_config, network.clone());

    // Record appends land wherever the primary puts them.
    for line in ["hello world\n", "second record\n"] {
        let outcome = client.append("/test", line.as_bytes()).await?;
        println!(
            "appended {:#} at offset {} (chunk {}, seq {})",
            Byte::from_u64(line.len() as u64),
            outcome.file_offset(client.geometry()),
            outcome.chunk,
            outcome.seq
        );
    }

    // One replica drops applies for a moment; the client retries through it.
    let chunk = master.file_chunks("/test")[0];
    let primary = master.lease_holder(chunk);
    let flaky = chunkservers.iter().map(|cs| cs.id().clone()).find(|id| Some(id) != primary.as_ref());
    if let Some(flaky) = flaky {
        network.fail_kind(&flaky, MessageKind::Apply);
        let healer = network.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            healer.heal(&flaky);
        });
    }
    client.write("/test", 0, b"HELLO").await?;

    let data = client.read("/test", 0, 1024).await?;
    println!("read {:#}:\n{}", Byte::from_u64(data.len() as u64), String::from_utf8_lossy(&data));

    for cs in &chunkservers {
        if let Some(info) = cs.chunk_info(chunk) {
            println!("{}: {:#} used, crc32 {:08x}", cs.id(), Byte::from_u64(info.used), info.checksum);
        }
    }

    Ok(())
}
