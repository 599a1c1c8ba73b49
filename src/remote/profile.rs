//! Host profile cache.
//!
//! A [`HostProfile`] holds facts about a remote host that do not change while
//! the process runs: OS family, login shell, temp directory, user and group
//! ids. It is fetched once right after a successful connect and kept until the
//! process exits, so permission checks on [`FileInfo`](super::metadata::FileInfo)
//! need no extra round trip.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::remote::error::{ErrorKind, RemoteError};
use crate::remote::host::HostId;
use crate::remote::transport::Connection;

/// Operating system family reported by `uname -s`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsFamily {
    Linux,
    MacOs,
    SunOs,
    FreeBsd,
    Windows,
    #[default]
    Unknown,
}

impl OsFamily {
    pub fn from_uname(uname: &str) -> Self {
        let uname = uname.trim();
        match uname {
            "Linux" => Self::Linux,
            "Darwin" => Self::MacOs,
            "SunOS" => Self::SunOs,
            "FreeBSD" | "OpenBSD" | "NetBSD" | "DragonFly" => Self::FreeBsd,
            _ if uname.starts_with("CYGWIN") || uname.starts_with("MINGW") || uname.starts_with("MSYS") => {
                Self::Windows
            }
            _ => Self::Unknown,
        }
    }
}

/// Static facts about one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub os: OsFamily,
    pub shell: String,
    pub tmp_dir: String,
    pub user: String,
    pub uid: u32,
    pub gids: Vec<u32>,
}

/// Source of host profiles; the default one asks the host through a remote command.
#[async_trait]
pub trait HostProfileProvider: Send + Sync {
    async fn fetch(&self, host: &HostId, conn: &dyn Connection) -> Result<HostProfile, RemoteError>;
}

/// Profile command: one line per fact, in a fixed order.
pub(crate) const PROFILE_COMMAND: &str =
    "uname -s; id -u; id -G; echo \"$SHELL\"; echo \"${TMPDIR:-/tmp}\"";

/// Fetches the profile with a single shell command.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellProfileProvider;

#[async_trait]
impl HostProfileProvider for ShellProfileProvider {
    async fn fetch(&self, host: &HostId, conn: &dyn Connection) -> Result<HostProfile, RemoteError> {
        let output = conn.exec(PROFILE_COMMAND).await?;
        if output.exit_code != 0 {
            return Err(RemoteError::new(
                ErrorKind::Failure,
                format!(
                    "profile command exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        parse_profile(host.user(), &output.stdout)
    }
}

/// Parse the output of [`PROFILE_COMMAND`].
pub(crate) fn parse_profile(user: &str, stdout: &str) -> Result<HostProfile, RemoteError> {
    let mut lines = stdout.lines().map(str::trim);
    let malformed = |what: &str| {
        RemoteError::new(
            ErrorKind::Failure,
            format!("malformed profile command output: {}", what),
        )
    };

    let os = OsFamily::from_uname(lines.next().ok_or_else(|| malformed("missing uname"))?);
    let uid = lines
        .next()
        .and_then(|l| l.parse::<u32>().ok())
        .ok_or_else(|| malformed("bad uid"))?;
    let gids = lines
        .next()
        .ok_or_else(|| malformed("missing groups"))?
        .split_whitespace()
        .map(|g| g.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed("bad group id"))?;
    let shell = lines.next().unwrap_or_default().to_string();
    let tmp_dir = match lines.next() {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => "/tmp".to_string(),
    };

    Ok(HostProfile {
        os,
        shell,
        tmp_dir,
        user: user.to_string(),
        uid,
        gids,
    })
}

/// Per-host cache of profiles; populated once per connect.
pub struct HostProfileCache {
    provider: Arc<dyn HostProfileProvider>,
    profiles: DashMap<HostId, Arc<HostProfile>>,
}

impl HostProfileCache {
    pub fn new(provider: Arc<dyn HostProfileProvider>) -> Self {
        Self {
            provider,
            profiles: DashMap::new(),
        }
    }

    pub fn get(&self, host: &HostId) -> Option<Arc<HostProfile>> {
        self.profiles.get(host).map(|p| p.clone())
    }

    pub fn contains(&self, host: &HostId) -> bool {
        self.profiles.contains_key(host)
    }

    /// Fetch and store the profile for a freshly connected host.
    pub async fn populate(
        &self,
        host: &HostId,
        conn: &dyn Connection,
    ) -> Result<Arc<HostProfile>, RemoteError> {
        let profile = Arc::new(self.provider.fetch(host, conn).await?);
        debug!(%host, os = ?profile.os, uid = profile.uid, "host profile cached");
        self.profiles.insert(host.clone(), profile.clone());
        Ok(profile)
    }
}
