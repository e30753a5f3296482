use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use byte_unit::Byte;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use gfs::common::ServerId;
use gfs::config::{GfsConfig, ObservabilityConfig};
use gfs::wire::{serve, TcpTransport};
use gfs::{Chunkserver, Client, MasterServer};

#[derive(Parser, Debug)]
#[command(name = "gfs", about = "GFS-style chunk mutation cluster")]
struct Cli {
    /// TOML config file, layered over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master.
    Master {
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run a chunkserver.
    Chunkserver {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        master: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Append a record to a file.
    Append { path: String, data: String },
    /// Write at a file offset.
    Write { path: String, offset: u64, data: String },
    /// Read a byte range of a file.
    Read { path: String, offset: u64, len: u64 },
}

fn init_tracing(config: &ObservabilityConfig) {
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.log_level)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GfsConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.observability);

    let transport = Arc::new(TcpTransport::new());

    match cli.command {
        Command::Master { listen } => {
            if let Some(listen) = listen {
                config.master.listen_addr = listen;
            }
            let addr = config.master.listen_addr.clone();
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;

            tracing::info!(
                %addr,
                replication = config.master.replication,
                lease_ms = config.master.lease_duration_ms,
                "master starting"
            );
            let master = Arc::new(MasterServer::new(ServerId::new(addr), config.master, transport));
            serve(listener, master).await.context("master stopped")?;
        }
        Command::Chunkserver { listen, master, data_dir } => {
            let cs_config = &mut config.chunkserver;
            if let Some(listen) = listen {
                cs_config.listen_addr = listen;
            }
            if let Some(master) = master {
                cs_config.master_addr = master;
            }
            if let Some(data_dir) = data_dir {
                cs_config.data_dir = data_dir;
            }

            let addr = cs_config.listen_addr.clone();
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            let chunkserver = Arc::new(
                Chunkserver::new(cs_config.clone(), transport)
                    .with_context(|| format!("failed to open {}", cs_config.data_dir.display()))?,
            );

            tracing::info!(
                %addr,
                master = %cs_config.master_addr,
                chunks = chunkserver.chunk_ids().len(),
                staging = %Byte::from_u64(cs_config.staging_capacity_bytes),
                "chunkserver starting"
            );
            let _tasks = chunkserver.start();
            serve(listener, chunkserver).await.context("chunkserver stopped")?;
        }
        Command::Append { path, data } => {
            let client = Client::new(config.client, transport);
            let outcome = client.append(&path, data.as_bytes()).await.context("append failed")?;
            println!(
                "appended {:#} to {path} at offset {} (chunk {}, seq {})",
                Byte::from_u64(data.len() as u64),
                outcome.file_offset(client.geometry()),
                outcome.chunk,
                outcome.seq
            );
        }
        Command::Write { path, offset, data } => {
            let client = Client::new(config.client, transport);
            let outcomes = client.write(&path, offset, data.as_bytes()).await.context("write failed")?;
            println!(
                "wrote {:#} to {path} at offset {offset} in {} piece(s)",
                Byte::from_u64(data.len() as u64),
                outcomes.len()
            );
        }
        Command::Read { path, offset, len } => {
            let client = Client::new(config.client, transport);
            let data = client.read(&path, offset, len).await.context("read failed")?;
            eprintln!("read {:#}", Byte::from_u64(data.len() as u64));
            println!("{}", String::from_utf8_lossy(&data));
        }
    }

    Ok(())
}
