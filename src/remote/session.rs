//! One live, authenticated connection to a host and its channel pool.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::remote::config::MuxConfig;
use crate::remote::credentials::AuthSettings;
use crate::remote::host::HostId;
use crate::remote::pool::{ChannelPool, PoolStats};
use crate::remote::transport::Connection;

/// Serializable summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub host: String,
    pub connected_at: String,
    pub alive: bool,
    pub pool: PoolStats,
}

pub struct Session {
    host: HostId,
    connection: Arc<dyn Connection>,
    pool: Arc<ChannelPool>,
    connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(host: HostId, connection: Arc<dyn Connection>, config: &MuxConfig) -> Self {
        let pool = Arc::new(ChannelPool::new(
            host.clone(),
            connection.clone(),
            config.max_channels,
            config.channel_wait,
        ));
        Self {
            host,
            connection,
            pool,
            connected_at: Utc::now(),
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Lock-free liveness check.
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    /// Liveness re-checked under the pool lock, so it cannot race with teardown.
    pub fn confirm_alive(&self) -> bool {
        self.pool.is_connected()
    }

    pub fn apply_auth(&self, auth: &AuthSettings) {
        self.connection.apply_auth(auth);
    }

    /// Close the pool, then the connection.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.connection.disconnect().await;
        debug!(host = %self.host, "session closed");
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            host: self.host.to_string(),
            connected_at: self.connected_at.to_rfc3339(),
            alive: self.is_alive(),
            pool: self.pool.stats(),
        }
    }
}
