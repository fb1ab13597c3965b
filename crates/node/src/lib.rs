//! A swarm peer: stores verified chunks, serves them to other peers, and
//! pulls files from many peers at once using a central tracker for discovery.

pub mod announce;
pub mod config;
pub mod context;
pub mod directory;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod store;
pub mod tracker;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::NodeConfig;
pub use context::{DownloadHandle, PeerContext, PeerStatus, RemoteFile};
pub use download::{DownloadOutcome, DownloadProgress, DownloadState};
pub use error::{FetchError, Result, SwarmError};
pub use store::ChunkStore;
