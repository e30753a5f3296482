//! Chunk mutation protocol for a GFS-style file system.
//!
//! Write flow:
//! - the master grants a lease on the chunk to one replica, the primary
//! - the client pushes the data along a chain of replicas, where it is staged
//! - the client asks the primary to commit
//! - the primary picks the offset and sequence number, applies locally, and
//!   tells the secondaries to apply in the same order
//! - the primary answers once every replica has applied, or names those that
//!   did not
//!
//! Nodes talk through a [`network::Transport`]: [`network::NetworkShim`] in
//! process, or [`wire::TcpTransport`] between processes.

pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod lease;
pub mod master;
pub mod msg;
pub mod network;
pub mod wire;

pub use chunkserver::Chunkserver;
pub use client::{Client, MutationOutcome};
pub use error::{GfsError, Result};
pub use master::MasterServer;
pub use network::{NetworkShim, Node, Transport};
