//! Per-session channel pool.
//!
//! Each [`Session`](super::session::Session) owns one [`ChannelPool`] that
//! caches idle file channels and caps how many are open at once. Callers get a
//! [`ChannelLease`]; dropping the lease is the only way capacity returns to
//! the pool, so no code path can leak a slot.
//!
//! # Accounting
//!
//! The idle list and counters sit behind one mutex that is never held across
//! an await. At every point where the lock is released:
//!
//! ```text
//! idle + busy == opened - discarded
//! busy <= max_channels
//! ```
//!
//! The cap is enforced by a semaphore acquired before the lock, with an
//! optional bounded wait.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::remote::error::{ErrorKind, RemoteError};
use crate::remote::host::HostId;
use crate::remote::transport::{Connection, FileChannel};

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub high_water: usize,
    pub opened: u64,
    pub discarded: u64,
    pub max_channels: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Box<dyn FileChannel>>,
    busy: usize,
    high_water: usize,
    opened: u64,
    discarded: u64,
    closed: bool,
}

impl PoolState {
    fn mark_busy(&mut self) {
        self.busy += 1;
        self.high_water = self.high_water.max(self.busy);
    }
}

pub struct ChannelPool {
    host: HostId,
    connection: Arc<dyn Connection>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    max_channels: usize,
    wait: Option<Duration>,
}

impl ChannelPool {
    pub fn new(
        host: HostId,
        connection: Arc<dyn Connection>,
        max_channels: usize,
        wait: Option<Duration>,
    ) -> Self {
        let max_channels = max_channels.max(1);
        Self {
            host,
            connection,
            state: Mutex::new(PoolState::default()),
            permits: Arc::new(Semaphore::new(max_channels)),
            max_channels,
            wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Lease a channel: an idle connected one if available, else a new one.
    ///
    /// Waits while the cap is reached, up to the configured bound.
    pub async fn acquire(self: &Arc<Self>) -> Result<ChannelLease, RemoteError> {
        let permit = self.acquire_permit().await?;

        let mut dead = Vec::new();
        let reused = {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_error());
            }
            let mut found = None;
            while let Some(channel) = state.idle.pop() {
                if channel.is_connected() {
                    found = Some(channel);
                    break;
                }
                state.discarded += 1;
                dead.push(channel);
            }
            if found.is_some() {
                state.mark_busy();
            }
            found
        };
        for channel in dead {
            debug!(host = %self.host, "dropping idle channel that lost its connection");
            channel.close().await;
        }

        let channel = match reused {
            Some(channel) => channel,
            None => self.open_channel().await?,
        };

        Ok(ChannelLease {
            channel: Some(channel),
            pool: Arc::clone(self),
            discard: false,
            _permit: permit,
        })
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, RemoteError> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match self.wait {
            Some(wait) => tokio::time::timeout(wait, acquire).await.map_err(|_| {
                RemoteError::new(
                    ErrorKind::Timeout,
                    format!(
                        "no free channel to {} after {:?} ({} in use)",
                        self.host, wait, self.max_channels
                    ),
                )
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| self.closed_error())
    }

    async fn open_channel(&self) -> Result<Box<dyn FileChannel>, RemoteError> {
        let channel = self.connection.open_file_channel().await?;
        let closed = {
            let mut state = self.lock();
            if !state.closed {
                state.opened += 1;
                state.mark_busy();
                trace!(host = %self.host, opened = state.opened, busy = state.busy, "opened channel");
            }
            state.closed
        };
        if closed {
            channel.close().await;
            return Err(self.closed_error());
        }
        Ok(channel)
    }

    fn closed_error(&self) -> RemoteError {
        RemoteError::new(
            ErrorKind::NotConnected,
            format!("session to {} is closed", self.host),
        )
    }

    fn release(&self, channel: Box<dyn FileChannel>, discard: bool) {
        let mut state = self.lock();
        state.busy = state.busy.saturating_sub(1);
        if !discard && !state.closed && channel.is_connected() {
            state.idle.push(channel);
            return;
        }
        state.discarded += 1;
        drop(state);
        close_in_background(channel);
    }

    /// Whether the underlying connection is still up, checked under the pool lock.
    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        !state.closed && self.connection.is_alive()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy,
            high_water: state.high_water,
            opened: state.opened,
            discarded: state.discarded,
            max_channels: self.max_channels,
        }
    }

    /// Close every idle channel and refuse new leases. Busy channels are
    /// closed as their leases drop.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.discarded += idle.len() as u64;
            idle
        };
        self.permits.close();
        debug!(host = %self.host, closing = idle.len(), "channel pool shut down");
        for channel in idle {
            channel.close().await;
        }
    }
}

fn close_in_background(channel: Box<dyn FileChannel>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { channel.close().await });
        }
        Err(_) => warn!("no runtime to close discarded channel; dropping it"),
    }
}

/// Exclusive use of one pooled channel.
///
/// Dropping the lease returns the channel to the idle list if it still
/// reports connected, and discards it otherwise.
pub struct ChannelLease {
    channel: Option<Box<dyn FileChannel>>,
    pool: Arc<ChannelPool>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl ChannelLease {
    /// Do not return this channel to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discard
    }
}

impl Deref for ChannelLease {
    type Target = dyn FileChannel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("channel is only taken in drop"),
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.release(channel, self.discard);
        }
    }
}
