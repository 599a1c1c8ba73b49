use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::remote::error::{ErrorKind, RemoteError, TaskError};
use crate::remote::metadata::FileInfo;
use crate::remote::pool::ChannelLease;
use crate::remote::sync_check::{self, SyncState};
use crate::remote::transport::{remote_file_name, remote_parent};

use super::{TaskContext, bounded, settle};

/// What to upload and how.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub destination: String,
    /// Permission bits applied after the write.
    pub mask: Option<u32>,
    /// Skip the transfer when the remote content already matches.
    pub check_md5: bool,
    /// Write to a temporary name and rename into place.
    pub atomic: bool,
    /// Stat the final path afterwards.
    pub return_stat: bool,
}

impl UploadRequest {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mask: None,
            check_md5: false,
            atomic: false,
            return_stat: false,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_md5_check(mut self) -> Self {
        self.check_md5 = true;
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_stat(mut self) -> Self {
        self.return_stat = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    /// False when the content check found the remote file up to date.
    pub transferred: bool,
    pub bytes: u64,
    pub stat: Option<FileInfo>,
}

pub(super) async fn run(ctx: &TaskContext, request: UploadRequest) -> Result<UploadOutcome, TaskError> {
    let dest = request.destination.as_str();
    let source = request.source.as_path();

    let meta = tokio::fs::metadata(source)
        .await
        .map_err(|e| TaskError::local_io("upload", source.display().to_string(), &e))?;
    if !meta.is_file() {
        return Err(TaskError::new(
            ErrorKind::InvalidInput,
            "upload",
            source.display().to_string(),
            "source is not a regular file",
        ));
    }

    let state = if request.check_md5 {
        sync_check::check(
            ctx.session.connection().as_ref(),
            ctx.session.pool(),
            ctx.profile.as_deref(),
            source,
            dest,
        )
        .await?
    } else {
        SyncState::Differs
    };

    if state == SyncState::UpToDate {
        debug!(host = %ctx.host, path = dest, "remote content up to date, upload skipped");
        let stat = if request.return_stat {
            Some(super::query::stat(ctx, dest, true).await?)
        } else {
            None
        };
        return Ok(UploadOutcome {
            transferred: false,
            bytes: 0,
            stat,
        });
    }

    if state == SyncState::Inexistent
        && let Some(parent) = remote_parent(dest)
    {
        let mut lease = ctx.lease("mkdir", parent).await?;
        let result = mkdir_p(&lease, parent).await;
        settle(&mut lease, result, "mkdir", parent)?;
    }

    let target = if request.atomic {
        temp_name(dest)
    } else {
        dest.to_string()
    };

    let written = bounded(
        ctx.upload_retries.saturating_add(1),
        || write_once(ctx, source, &target, dest),
        TaskError::is_transient_transfer,
    )
    .await;
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            if request.atomic {
                discard_partial(ctx, &target, dest).await;
            }
            return Err(e);
        }
    };

    let stat = if request.atomic || request.mask.is_some() || request.return_stat {
        finish(ctx, &request, &target).await?
    } else {
        None
    };

    info!(host = %ctx.host, path = dest, bytes, "upload complete");
    Ok(UploadOutcome {
        transferred: true,
        bytes,
        stat,
    })
}

/// Rename into place, chmod and stat, on one channel.
async fn finish(
    ctx: &TaskContext,
    request: &UploadRequest,
    target: &str,
) -> Result<Option<FileInfo>, TaskError> {
    let dest = request.destination.as_str();
    let mut lease = ctx.lease("upload", dest).await?;
    if request.atomic {
        let result = replace(&lease, target, dest).await;
        if result.is_err() {
            let _ = lease.remove_file(target).await;
        }
        settle(&mut lease, result, "rename", dest)?;
    }
    if let Some(mask) = request.mask {
        let result = lease.chmod(dest, mask).await;
        settle(&mut lease, result, "chmod", dest)?;
    }
    if !request.return_stat {
        return Ok(None);
    }
    let result = lease.stat(dest).await;
    settle(&mut lease, result, "stat", dest).map(Some)
}

/// Best effort: the write already failed and that error is what the caller sees.
async fn discard_partial(ctx: &TaskContext, target: &str, dest: &str) {
    let Ok(mut lease) = ctx.lease("upload", dest).await else {
        return;
    };
    match lease.remove_file(target).await {
        Ok(()) => debug!(host = %ctx.host, path = target, "removed partial upload"),
        Err(e) if e.kind == ErrorKind::NoSuchFile => {}
        Err(e) => {
            debug!(host = %ctx.host, path = target, "could not remove partial upload: {}", e);
            if e.kind == ErrorKind::ChannelLost {
                lease.discard();
            }
        }
    }
}

async fn write_once(
    ctx: &TaskContext,
    source: &Path,
    target: &str,
    dest: &str,
) -> Result<u64, TaskError> {
    let mut file = tokio::fs::File::open(source)
        .await
        .map_err(|e| TaskError::local_io("upload", source.display().to_string(), &e))?;
    let mut lease = ctx.lease("upload", dest).await?;
    let result = lease.write_from(target, &mut file).await;
    settle(&mut lease, result, "upload", dest)
}

/// Rename `from` over `to`, removing an existing `to` if the server refuses
/// to replace it.
async fn replace(lease: &ChannelLease, from: &str, to: &str) -> Result<(), RemoteError> {
    let Err(e) = lease.rename(from, to).await else {
        return Ok(());
    };
    if e.kind != ErrorKind::Failure || lease.lstat(to).await.is_err() {
        return Err(e);
    }
    lease.remove_file(to).await?;
    lease.rename(from, to).await
}

/// Create `path` and every missing ancestor.
async fn mkdir_p(lease: &ChannelLease, path: &str) -> Result<(), RemoteError> {
    let mut current = String::new();
    for component in path.split('/') {
        if component.is_empty() {
            if current.is_empty() {
                current.push('/');
            }
            continue;
        }
        if current.is_empty() || current == "/" {
            current = format!("{current}{component}");
        } else {
            current = format!("{current}/{component}");
        }
        match lease.mkdir(&current).await {
            Ok(()) => {}
            // Already there, most likely; confirm with a stat.
            Err(e) if e.kind == ErrorKind::Failure => {
                lease.stat(&current).await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn temp_name(dest: &str) -> String {
    let name = format!(".{}.{}.part", remote_file_name(dest), Uuid::new_v4().simple());
    match remote_parent(dest) {
        Some(parent) => format!("{}/{}", parent, name),
        None if dest.starts_with('/') => format!("/{}", name),
        None => name,
    }
}
