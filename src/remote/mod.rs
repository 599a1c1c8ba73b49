//! Connection lifecycle and channel multiplexing for remote hosts.
//!
//! This module is organized into the following submodules:
//!
//! - `host`: host identity (`user@address:port`, or the local machine)
//! - `config`: configuration resolution with environment variable support
//! - `error`: connect failures, error kinds and task errors
//! - `metadata`: file metadata record and its text form
//! - `prefs`: key-value preference store behind credentials and recents
//! - `credentials`: per-host authentication records
//! - `vault`: password vault over secure storage
//! - `recent`: most-recently-connected hosts
//! - `profile`: per-host OS, shell and identity cache
//! - `transport`: transport traits plus the russh/SFTP implementation
//! - `auth`: SSH authentication strategies
//! - `storage`: session registry
//! - `session`: one live connection with its channel pool
//! - `pool`: per-session channel pool with a concurrency cap
//! - `executor`: bounded per-host task executors
//! - `transfer`: upload, download, stat, list and rename workers
//! - `sync_check`: MD5 comparison of local and remote files
//! - `watcher`: background detection of dead connections
//! - `manager`: connect, disconnect and event fan-out

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod host;
pub mod manager;
pub mod metadata;
pub mod pool;
pub mod prefs;
pub mod profile;
pub mod recent;
pub mod session;
pub mod storage;
pub mod sync_check;
pub mod transfer;
pub mod transport;
pub mod vault;
pub mod watcher;

#[cfg(test)]
pub(crate) mod mock;

pub use config::MuxConfig;
pub use error::{ConnectFailure, ErrorKind, RemoteError, TaskError};
pub use host::HostId;
pub use manager::{ConnectOutcome, ConnectionEvent, ConnectionManager, DisconnectCause};
pub use metadata::{FileInfo, FileType};
pub use transfer::{FileTasks, UploadOutcome, UploadRequest};
