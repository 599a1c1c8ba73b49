//! Authentication errors.

use std::io;
use std::path::{Path, PathBuf};

use russh::keys;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("private key {} not found", .path.display())]
    KeyMissing { path: PathBuf },

    #[error("private key {} is passphrase-protected; load it into the agent", .path.display())]
    KeyEncrypted { path: PathBuf },

    #[error("private key {} unreadable: {reason}", .path.display())]
    KeyUnreadable { path: PathBuf, reason: String },

    #[error("ssh agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("ssh agent holds no identities")]
    AgentEmpty,

    #[error("{method} exchange failed: {reason}")]
    Exchange { method: &'static str, reason: String },

    #[error("no authentication method configured")]
    NoMethods,

    #[error(
        "no method accepted (tried: {}){}",
        .tried.join(", "),
        .last.as_ref().map(|e| format!("; last error: {}", e)).unwrap_or_default()
    )]
    Exhausted {
        tried: Vec<&'static str>,
        last: Option<Box<AuthError>>,
    },
}

impl AuthError {
    pub(crate) fn key(path: &Path, e: keys::Error) -> Self {
        let path = path.to_path_buf();
        match e {
            keys::Error::KeyIsEncrypted => Self::KeyEncrypted { path },
            keys::Error::IO(io) if io.kind() == io::ErrorKind::NotFound => Self::KeyMissing { path },
            other => Self::KeyUnreadable {
                path,
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn exchange(method: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Exchange {
            method,
            reason: e.to_string(),
        }
    }

    /// Whether the failure happened on this side, before the server could judge
    /// the credentials.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::KeyMissing { .. }
                | Self::KeyEncrypted { .. }
                | Self::KeyUnreadable { .. }
                | Self::AgentUnavailable(_)
                | Self::AgentEmpty
                | Self::NoMethods
        )
    }
}
