//! Connection watcher.
//!
//! A background task that notices connections which died without anyone
//! asking them to. It polls only while at least one session is registered.
//! Each tick does a lock-free pass over every session's liveness flag, and
//! anything that looks dead is re-checked under its pool lock. A confirmed
//! break is reported exactly once: the session leaves the registry, the host
//! is marked broken, and one [`ConnectionEvent::Disconnected`] is sent. The
//! mark stays until the host reconnects or is explicitly disconnected.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::host::HostId;
use crate::remote::manager::{ConnectionEvent, DisconnectCause};
use crate::remote::storage::SessionStorage;

struct WatcherInner {
    sessions: Arc<dyn SessionStorage>,
    events: broadcast::Sender<ConnectionEvent>,
    broken: DashSet<HostId>,
    interval: Duration,
    nudge: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConnectionWatcher {
    inner: Arc<WatcherInner>,
}

impl ConnectionWatcher {
    pub fn new(
        sessions: Arc<dyn SessionStorage>,
        events: broadcast::Sender<ConnectionEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                sessions,
                events,
                broken: DashSet::new(),
                interval,
                nudge: Notify::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the polling task on `runtime` unless it is already running.
    pub fn spawn(&self, runtime: &Handle) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) || self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(runtime.spawn(async move { inner.run().await }));
        debug!(interval = ?self.inner.interval, "connection watcher started");
    }

    /// Ask for a check soon, without waiting for the next interval.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    /// One poll pass. Returns the hosts found broken by this pass.
    pub async fn tick(&self) -> Vec<HostId> {
        self.inner.tick().await
    }

    pub fn is_broken(&self, host: &HostId) -> bool {
        self.inner.broken.contains(host)
    }

    /// Forget the broken mark for `host` and reschedule.
    pub fn clear_broken(&self, host: &HostId) {
        if self.inner.broken.remove(host).is_some() {
            debug!(%host, "broken mark cleared");
        }
        self.nudge();
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            warn!("connection watcher ended abnormally: {}", e);
        }
    }
}

impl WatcherInner {
    async fn run(self: Arc<Self>) {
        loop {
            if self.sessions.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.nudge.notified() => continue,
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.nudge.notified() => {}
            }
            self.tick().await;
        }
        debug!("connection watcher stopped");
    }

    async fn tick(&self) -> Vec<HostId> {
        let mut found = Vec::new();
        for session in self.sessions.sessions() {
            if session.is_alive() {
                continue;
            }
            let host = session.host().clone();
            if self.broken.contains(&host) || session.confirm_alive() {
                continue;
            }
            // Only the caller that actually removes the entry reports it.
            if self.sessions.remove_if_same(&host, &session).is_none() {
                continue;
            }
            self.broken.insert(host.clone());
            info!(%host, "connection lost");
            session.shutdown().await;
            let _ = self.events.send(ConnectionEvent::Disconnected {
                host: host.clone(),
                cause: DisconnectCause::Broken,
            });
            found.push(host);
        }
        found
    }
}
