//! Transport abstractions.
//!
//! The connection layer never touches wire bytes. It talks to three traits:
//!
//! - [`Transport`]: performs the handshake and authentication for one host.
//! - [`Connection`]: one live authenticated connection; opens sub-channels and
//!   runs short remote commands.
//! - [`FileChannel`]: one file-protocol conversation multiplexed over a
//!   connection. Pooled and reused, never shared concurrently.
//!
//! The production implementation lives in [`ssh`] (russh) and [`sftp`]
//! (russh-sftp). Adapters classify every wire error into
//! [`ErrorKind`](crate::remote::error::ErrorKind) before returning it.

pub mod sftp;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::remote::credentials::AuthSettings;
use crate::remote::error::{ConnectFailure, RemoteError};
use crate::remote::host::HostId;
use crate::remote::metadata::FileInfo;

/// Everything a transport needs to open one connection.
#[derive(Clone)]
pub struct ConnectRequest {
    pub host: HostId,
    pub auth: AuthSettings,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("auth", &self.auth)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Output of a short remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Opens authenticated connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectFailure>;
}

/// One live authenticated connection to a host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Cheap, lock-free liveness check.
    fn is_alive(&self) -> bool;

    /// Open and initialise a new file-protocol sub-channel.
    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>, RemoteError>;

    /// Run a short command and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError>;

    /// Take new authentication settings into account without reconnecting.
    fn apply_auth(&self, _auth: &AuthSettings) {}

    /// Close the connection; best effort, never fails.
    async fn disconnect(&self);
}

/// A file-protocol sub-channel.
#[async_trait]
pub trait FileChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Follows symlinks.
    async fn stat(&self, path: &str) -> Result<FileInfo, RemoteError>;

    /// Does not follow symlinks; fills in the link target for links.
    async fn lstat(&self, path: &str) -> Result<FileInfo, RemoteError>;

    /// Entries of a directory, possibly including `.` and `..`.
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, RemoteError>;

    async fn read_link(&self, path: &str) -> Result<String, RemoteError>;

    /// Create or truncate `path` and copy `source` into it. Returns bytes written.
    async fn write_from(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, RemoteError>;

    /// Copy the content of `path` into `sink`. Returns bytes read.
    async fn read_into(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, RemoteError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), RemoteError>;

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError>;

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Close the channel; best effort.
    async fn close(&self);
}

/// Quote a string for a POSIX shell command line.
pub(crate) fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Parent directory of a remote path, if it has one other than the root.
pub(crate) fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

/// Last segment of a remote path.
pub(crate) fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None if trimmed.is_empty() && path.starts_with('/') => "/",
        None => trimmed,
    }
}

/// Join a directory and an entry name.
pub(crate) fn remote_join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
