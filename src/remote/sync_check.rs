//! Content-sync check.
//!
//! Before an upload the remote file's MD5 is computed with a short remote
//! command while the local file is hashed in parallel. Equal hashes mean the
//! upload can be skipped. When the hash tool is missing or misbehaves, a plain
//! existence check decides instead.
//!
//! macOS hosts are not hashed at all: their `md5` output differs from the
//! other families and the check reports [`SyncState::Inexistent`], so the
//! upload always happens.

use std::io;
use std::path::Path;
use std::sync::Arc;

use md5::{Digest, Md5};
use serde::Serialize;
use tracing::debug;

use crate::remote::error::{ErrorKind, TaskError};
use crate::remote::pool::ChannelPool;
use crate::remote::profile::{HostProfile, OsFamily};
use crate::remote::transport::{Connection, shell_quote};

/// Exit status of the hash command when the remote path does not exist.
const MISSING_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Same content; skip the upload.
    UpToDate,
    /// Different content; upload, the directory exists.
    Differs,
    /// Nothing at the remote path; create the directory, then upload.
    Inexistent,
}

/// Remote command printing the MD5 of `path`, or `None` when the family is not checked.
pub fn remote_md5_command(os: OsFamily, path: &str) -> Option<String> {
    let quoted = shell_quote(path);
    let hash = match os {
        OsFamily::MacOs => return None,
        OsFamily::SunOs => format!("digest -a md5 {}", quoted),
        OsFamily::FreeBsd => format!("md5 -q {}", quoted),
        OsFamily::Linux | OsFamily::Windows | OsFamily::Unknown => format!("md5sum {}", quoted),
    };
    Some(format!(
        "test -e {} || exit {}; {}",
        quoted, MISSING_EXIT_CODE, hash
    ))
}

/// Hex MD5 of a local file, computed off the async runtime.
pub async fn local_md5(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Md5::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(io::Error::other)?
}

/// First 32-hex-digit token of the hash command output.
fn parse_remote_hash(stdout: &str) -> Option<String> {
    let token = stdout.split_whitespace().next()?;
    (token.len() == 32 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| token.to_ascii_lowercase())
}

/// Compare a local file against a remote path.
pub async fn check(
    conn: &dyn Connection,
    pool: &Arc<ChannelPool>,
    profile: Option<&HostProfile>,
    local: &Path,
    remote: &str,
) -> Result<SyncState, TaskError> {
    let os = profile.map(|p| p.os).unwrap_or_default();
    let Some(command) = remote_md5_command(os, remote) else {
        debug!(path = remote, "content check skipped on macOS host");
        return Ok(SyncState::Inexistent);
    };

    let (hashed, local_hash) = tokio::join!(conn.exec(&command), local_md5(local));
    let local_hash =
        local_hash.map_err(|e| TaskError::local_io("md5", local.display().to_string(), &e))?;

    match hashed {
        Ok(out) if out.exit_code == MISSING_EXIT_CODE => Ok(SyncState::Inexistent),
        Ok(out) if out.exit_code == 0 => match parse_remote_hash(&out.stdout) {
            Some(remote_hash) if remote_hash == local_hash => Ok(SyncState::UpToDate),
            Some(_) => Ok(SyncState::Differs),
            None => {
                debug!(path = remote, "unparseable hash output, checking existence");
                exists_check(pool, remote).await
            }
        },
        Ok(out) => {
            debug!(
                path = remote,
                code = out.exit_code,
                "hash command failed, checking existence"
            );
            exists_check(pool, remote).await
        }
        Err(e) => {
            debug!(path = remote, "hash command unavailable ({}), checking existence", e);
            exists_check(pool, remote).await
        }
    }
}

async fn exists_check(pool: &Arc<ChannelPool>, remote: &str) -> Result<SyncState, TaskError> {
    let mut lease = pool.acquire().await.map_err(|e| e.context("stat", remote))?;
    match lease.stat(remote).await {
        Ok(_) => Ok(SyncState::UpToDate),
        Err(e) if e.kind == ErrorKind::NoSuchFile => Ok(SyncState::Inexistent),
        Err(e) => {
            if e.kind.corrupts_channel() {
                lease.discard();
            }
            Err(e.context("stat", remote))
        }
    }
}
