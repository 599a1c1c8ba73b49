//! Host identity.
//!
//! A [`HostId`] names one remote endpoint: login user, address, port, and a
//! flag marking the local machine. Equality on the whole tuple defines "same
//! host" for session pooling, credential lookup and profile caching.
//!
//! The textual form is `user@address:port`, parsed with `rsplit_once` so that
//! bracketed IPv6 addresses (`[::1]:22`) keep their inner colons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default SSH port used when an address carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity of a remote (or the local) endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId {
    user: String,
    address: String,
    port: u16,
    local: bool,
}

impl HostId {
    /// Create a remote host identity.
    pub fn new(user: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            address: address.into(),
            port,
            local: false,
        }
    }

    /// The local machine. It is always considered connected.
    pub fn local() -> Self {
        Self {
            user: current_user(),
            address: "localhost".to_string(),
            port: 0,
            local: true,
        }
    }

    /// Parse `user@host[:port]` or `host[:port]`.
    ///
    /// Without a user part the current login name (`$USER`/`$USERNAME`) is used.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err("Empty host specification".to_string());
        }
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some(_) => return Err(format!("Empty user name in '{}'", spec)),
            None => (current_user(), spec),
        };
        let (address, port) = parse_address(rest)?;
        if address.is_empty() {
            return Err(format!("Empty host name in '{}'", spec));
        }
        Ok(Self::new(user, address, port))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Stable key used for persisted per-host preferences.
    pub fn storage_key(&self) -> String {
        if self.local {
            "localhost".to_string()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local {
            return write!(f, "localhost");
        }
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

/// Split an address into host and port, defaulting to port 22.
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), String> {
    // A bare IPv6 literal has colons but no brackets; treat it as host only.
    if !address.starts_with('[') && address.matches(':').count() > 1 {
        return Ok((address.to_string(), DEFAULT_SSH_PORT));
    }
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {}", e))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), DEFAULT_SSH_PORT))
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
