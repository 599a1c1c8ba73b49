//! SFTP file channel over one russh session channel.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::remote::error::{ErrorKind, RemoteError, classify_io};
use crate::remote::metadata::{FileInfo, FileType};
use crate::remote::transport::{FileChannel, remote_file_name, remote_join};
use crate::remote::transport::ssh::SshClientHandler;

/// Map a russh-sftp error onto the crate taxonomy.
pub(crate) fn classify_sftp(e: &SftpError) -> ErrorKind {
    match e {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => ErrorKind::NoSuchFile,
            StatusCode::PermissionDenied => ErrorKind::PermissionDenied,
            StatusCode::OpUnsupported => ErrorKind::Unsupported,
            StatusCode::NoConnection | StatusCode::ConnectionLost | StatusCode::BadMessage => {
                ErrorKind::ChannelLost
            }
            _ => ErrorKind::Failure,
        },
        SftpError::Timeout => ErrorKind::Timeout,
        // The stream is gone or out of sync; the channel cannot be reused.
        SftpError::IO(_) | SftpError::UnexpectedPacket | SftpError::UnexpectedBehavior(_) => {
            ErrorKind::ChannelLost
        }
        _ => ErrorKind::Failure,
    }
}

fn attrs_to_info(name: impl Into<String>, attrs: &FileAttributes, link_target: Option<String>) -> FileInfo {
    FileInfo::from_raw_mode(
        name,
        attrs.permissions.unwrap_or(0),
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        i64::from(attrs.mtime.unwrap_or(0)) * 1000,
        link_target,
    )
}

/// One SFTP subsystem conversation. Pooled by
/// [`ChannelPool`](crate::remote::pool::ChannelPool); never used by two
/// tasks at once.
pub struct SftpChannel {
    sftp: SftpSession,
    handle: Arc<client::Handle<SshClientHandler>>,
    lost: AtomicBool,
}

impl SftpChannel {
    pub fn new(sftp: SftpSession, handle: Arc<client::Handle<SshClientHandler>>) -> Self {
        Self {
            sftp,
            handle,
            lost: AtomicBool::new(false),
        }
    }

    fn check<T>(&self, result: Result<T, SftpError>, path: &str) -> Result<T, RemoteError> {
        result.map_err(|e| {
            let kind = classify_sftp(&e);
            if kind == ErrorKind::ChannelLost {
                self.lost.store(true, Ordering::Release);
            }
            RemoteError::new(kind, format!("{}: {}", path, e))
        })
    }

    fn check_io<T>(&self, result: io::Result<T>, path: &str) -> Result<T, RemoteError> {
        result.map_err(|e| {
            let kind = classify_io(&e);
            if kind == ErrorKind::ChannelLost {
                self.lost.store(true, Ordering::Release);
            }
            RemoteError::new(kind, format!("{}: {}", path, e))
        })
    }

    async fn link_target(&self, path: &str, attrs: &FileAttributes) -> Option<String> {
        if FileType::from_mode(attrs.permissions.unwrap_or(0)) != FileType::Symlink {
            return None;
        }
        match self.sftp.read_link(path).await {
            Ok(target) => Some(target),
            Err(e) => {
                debug!(path, "could not read link target: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl FileChannel for SftpChannel {
    fn is_connected(&self) -> bool {
        !self.lost.load(Ordering::Acquire) && !self.handle.is_closed()
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, RemoteError> {
        let attrs = self.check(self.sftp.metadata(path).await, path)?;
        Ok(attrs_to_info(remote_file_name(path), &attrs, None))
    }

    async fn lstat(&self, path: &str) -> Result<FileInfo, RemoteError> {
        let attrs = self.check(self.sftp.symlink_metadata(path).await, path)?;
        let target = self.link_target(path, &attrs).await;
        Ok(attrs_to_info(remote_file_name(path), &attrs, target))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, RemoteError> {
        let entries = self.check(self.sftp.read_dir(path).await, path)?;
        let mut infos = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            let attrs = entry.metadata();
            let full = remote_join(path, &name);
            let target = self.link_target(&full, &attrs).await;
            infos.push(attrs_to_info(name, &attrs, target));
        }
        Ok(infos)
    }

    async fn read_link(&self, path: &str) -> Result<String, RemoteError> {
        self.check(self.sftp.read_link(path).await, path)
    }

    async fn write_from(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, RemoteError> {
        let mut file = self.check(self.sftp.create(path).await, path)?;
        let bytes = self.check_io(tokio::io::copy(source, &mut file).await, path)?;
        self.check_io(file.shutdown().await, path)?;
        Ok(bytes)
    }

    async fn read_into(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, RemoteError> {
        let mut file = self.check(self.sftp.open(path).await, path)?;
        let bytes = self.check_io(tokio::io::copy(&mut file, sink).await, path)?;
        self.check_io(sink.flush().await, path)?;
        Ok(bytes)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.check(self.sftp.rename(from, to).await, from)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), RemoteError> {
        let attrs = FileAttributes {
            permissions: Some(mode & 0o7777),
            ..FileAttributes::empty()
        };
        self.check(self.sftp.set_metadata(path, attrs).await, path)
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.check(self.sftp.create_dir(path).await, path)
    }

    async fn remove_file(&self, path: &str) -> Result<(), RemoteError> {
        self.check(self.sftp.remove_file(path).await, path)
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("sftp close: {}", e);
        }
    }
}
