//! Connection manager.
//!
//! Owns the per-host session registry and drives each host through
//! `Disconnected -> Connecting -> Connected -> Disconnected`. A connection that
//! dies on its own is picked up by the [`ConnectionWatcher`], which reports it
//! the same way an explicit [`ConnectionManager::disconnect`] does.
//!
//! # Connect Deduplication
//!
//! Concurrent connects to one host share a single attempt. The first caller
//! spawns the handshake on the manager's runtime and parks a
//! [`Shared`](futures::future::Shared) future in the in-flight map; every
//! later caller awaits a clone of it and observes the same outcome. Dropping
//! a waiter (cancellation) never aborts the handshake for the others.
//!
//! # Outcomes
//!
//! Connect failures are values, not errors: [`ConnectOutcome`] tells
//! `Connected`, `Cancelled` and `Failed(reason)` apart. Callers that prefer
//! push-style notification use [`ConnectionManager::connect_notify`] with a
//! [`ConnectContinuation`].
//!
//! # Test Mode
//!
//! With `test_mode` set, authentication failures are retried up to ten
//! attempts with jittered backoff. Nothing else ever retries a connect.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::remote::config::{MuxConfig, TEST_MODE_AUTH_ATTEMPTS};
use crate::remote::credentials::CredentialStore;
use crate::remote::error::{ConnectFailure, ErrorKind, TaskError};
use crate::remote::executor::{HostExecutors, TaskHandle, default_parallelism};
use crate::remote::host::HostId;
use crate::remote::pool::ChannelPool;
use crate::remote::prefs::{MemoryPreferences, PreferenceStore};
use crate::remote::profile::{HostProfile, HostProfileCache, HostProfileProvider, ShellProfileProvider};
use crate::remote::recent::RecentConnections;
use crate::remote::session::{Session, SessionInfo};
use crate::remote::storage::{DashMapSessionStorage, SessionStorage};
use crate::remote::transfer::FileTasks;
use crate::remote::transport::{ConnectRequest, Connection, Transport};
use crate::remote::vault::{MemorySecureStorage, PasswordVault, SecureStorage};
use crate::remote::watcher::ConnectionWatcher;

const EVENT_CAPACITY: usize = 64;
const TEST_MODE_MIN_DELAY: Duration = Duration::from_millis(10);
const TEST_MODE_MAX_DELAY: Duration = Duration::from_millis(200);

/// Why a host went from connected to disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectCause {
    /// Someone called `disconnect`, `forget` or `shutdown`.
    Requested,
    /// The watcher found the connection dead.
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
    Connected { host: HostId },
    Disconnected { host: HostId, cause: DisconnectCause },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Cancelled,
    Failed(ConnectFailure),
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl From<Result<(), ConnectFailure>> for ConnectOutcome {
    fn from(result: Result<(), ConnectFailure>) -> Self {
        match result {
            Ok(()) => Self::Connected,
            Err(ConnectFailure::Cancelled) => Self::Cancelled,
            Err(failure) => Self::Failed(failure),
        }
    }
}

/// Push-style receiver of connect outcomes.
pub trait ConnectContinuation: Send + Sync {
    fn connected(&self, _host: &HostId) {}

    fn cancelled(&self, _host: &HostId) {}

    fn failed(&self, host: &HostId, failure: &ConnectFailure);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockingConnectError {
    /// Blocking here could deadlock the runtime driving the work.
    #[error("blocking manager calls must not be made from an async runtime thread")]
    InsideRuntime,
}

type SharedConnect = Shared<BoxFuture<'static, Result<(), ConnectFailure>>>;

/// Runtime the manager spawns on: borrowed from the caller, or owned when
/// the manager was built outside of any runtime.
enum RuntimeHost {
    Borrowed(Handle),
    Owned(Option<Runtime>, Handle),
}

impl RuntimeHost {
    fn current_or_owned() -> std::io::Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self::Borrowed(handle));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hostmux")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self::Owned(Some(runtime), handle))
    }

    fn handle(&self) -> &Handle {
        match self {
            Self::Borrowed(handle) | Self::Owned(_, handle) => handle,
        }
    }
}

impl Drop for RuntimeHost {
    fn drop(&mut self) {
        if let Self::Owned(runtime, _) = self
            && let Some(runtime) = runtime.take()
        {
            runtime.shutdown_background();
        }
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: MuxConfig,
    sessions: Arc<dyn SessionStorage>,
    credentials: Arc<CredentialStore>,
    vault: Arc<PasswordVault>,
    profiles: Arc<HostProfileCache>,
    recent: RecentConnections,
    executors: Arc<HostExecutors>,
    watcher: ConnectionWatcher,
    events: broadcast::Sender<ConnectionEvent>,
    in_flight: DashMap<HostId, SharedConnect>,
    shutdown: CancellationToken,
    runtime: RuntimeHost,
}

/// Builder for [`ConnectionManager`]. Every collaborator has an in-memory default.
pub struct ManagerBuilder {
    transport: Arc<dyn Transport>,
    config: Option<MuxConfig>,
    prefs: Option<Arc<dyn PreferenceStore>>,
    secure: Option<Arc<dyn SecureStorage>>,
    sessions: Option<Arc<dyn SessionStorage>>,
    profile_provider: Option<Arc<dyn HostProfileProvider>>,
    parallelism: Option<usize>,
}

impl ManagerBuilder {
    pub fn config(mut self, config: MuxConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn preferences(mut self, prefs: Arc<dyn PreferenceStore>) -> Self {
        self.prefs = Some(prefs);
        self
    }

    pub fn secure_storage(mut self, secure: Arc<dyn SecureStorage>) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStorage>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn profile_provider(mut self, provider: Arc<dyn HostProfileProvider>) -> Self {
        self.profile_provider = Some(provider);
        self
    }

    /// Concurrent file tasks per host. Defaults to `max(2, cpus)`.
    pub fn parallelism(mut self, per_host: usize) -> Self {
        self.parallelism = Some(per_host);
        self
    }

    /// Build the manager. Outside of a tokio runtime a small private runtime
    /// is created to drive handshakes, the watcher and file tasks.
    pub fn build(self) -> std::io::Result<ConnectionManager> {
        let runtime = RuntimeHost::current_or_owned()?;
        let config = self.config.unwrap_or_else(MuxConfig::from_env);
        let prefs = self
            .prefs
            .unwrap_or_else(|| Arc::new(MemoryPreferences::new()));
        let secure = self
            .secure
            .unwrap_or_else(|| Arc::new(MemorySecureStorage::new()));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(DashMapSessionStorage::new()));
        let provider = self
            .profile_provider
            .unwrap_or_else(|| Arc::new(ShellProfileProvider));
        let executors = Arc::new(HostExecutors::new(
            self.parallelism.unwrap_or_else(default_parallelism),
            runtime.handle().clone(),
        ));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watcher = ConnectionWatcher::new(sessions.clone(), events.clone(), config.watch_interval);

        Ok(ConnectionManager {
            inner: Arc::new(ManagerInner {
                transport: self.transport,
                credentials: Arc::new(CredentialStore::new(prefs.clone())),
                vault: Arc::new(PasswordVault::new(secure, prefs.clone(), config.keep_password)),
                profiles: Arc::new(HostProfileCache::new(provider)),
                recent: RecentConnections::new(prefs),
                config,
                sessions,
                executors,
                watcher,
                events,
                in_flight: DashMap::new(),
                shutdown: CancellationToken::new(),
                runtime,
            }),
        })
    }
}

/// Entry point of the connection layer. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn builder(transport: Arc<dyn Transport>) -> ManagerBuilder {
        ManagerBuilder {
            transport,
            config: None,
            prefs: None,
            secure: None,
            sessions: None,
            profile_provider: None,
            parallelism: None,
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Local host: always. Remote: a session exists and its transport is alive.
    ///
    /// A session whose transport reports dead nudges the watcher.
    pub fn is_connected_to(&self, host: &HostId) -> bool {
        if host.is_local() {
            return true;
        }
        match self.inner.sessions.get(host) {
            Some(session) if session.is_alive() => true,
            Some(_) => {
                self.inner.watcher.nudge();
                false
            }
            None => false,
        }
    }

    pub async fn connect(&self, host: &HostId) -> ConnectOutcome {
        self.connect_cancellable(host, &CancellationToken::new()).await
    }

    /// Connect, giving up (as `Cancelled`) when `cancel` fires. The shared
    /// handshake itself keeps running for other waiters.
    pub async fn connect_cancellable(&self, host: &HostId, cancel: &CancellationToken) -> ConnectOutcome {
        if self.is_connected_to(host) {
            return ConnectOutcome::Connected;
        }
        let attempt = self.attempt(host);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%host, "connect wait cancelled by caller");
                ConnectOutcome::Cancelled
            }
            _ = self.inner.shutdown.cancelled() => ConnectOutcome::Cancelled,
            result = attempt => result.into(),
        }
    }

    /// Connect and report the outcome to `continuation`. Returns whether the
    /// host is connected.
    pub async fn connect_notify(&self, host: &HostId, continuation: &dyn ConnectContinuation) -> bool {
        match self.connect(host).await {
            ConnectOutcome::Connected => {
                continuation.connected(host);
                true
            }
            ConnectOutcome::Cancelled => {
                continuation.cancelled(host);
                false
            }
            ConnectOutcome::Failed(failure) => {
                continuation.failed(host, &failure);
                false
            }
        }
    }

    /// Blocking connect for synchronous callers.
    ///
    /// Fails fast when called on a runtime thread.
    pub fn connect_to_blocking(&self, host: &HostId) -> Result<ConnectOutcome, BlockingConnectError> {
        if Handle::try_current().is_ok() {
            return Err(BlockingConnectError::InsideRuntime);
        }
        Ok(self.inner.runtime.handle().block_on(self.connect(host)))
    }

    /// Wait for a file task from a synchronous caller.
    ///
    /// Fails fast when called on a runtime thread.
    pub fn wait_blocking<T>(&self, task: TaskHandle<T>) -> Result<Result<T, TaskError>, BlockingConnectError> {
        if Handle::try_current().is_ok() {
            return Err(BlockingConnectError::InsideRuntime);
        }
        Ok(self.inner.runtime.handle().block_on(task))
    }

    fn attempt(&self, host: &HostId) -> SharedConnect {
        match self.inner.in_flight.entry(host.clone()) {
            Entry::Occupied(entry) => {
                debug!(%host, "joining in-flight connect");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // An attempt that finished between the caller's check and here.
                if self.inner.sessions.get(host).is_some_and(|s| s.is_alive()) {
                    debug!(%host, "session came up while waiting; reusing it");
                    return futures::future::ready(Ok::<(), ConnectFailure>(())).boxed().shared();
                }
                let inner = Arc::clone(&self.inner);
                let target = host.clone();
                let task = self.inner.runtime.handle().spawn(async move {
                    let result = inner.establish(&target).await;
                    inner.in_flight.remove(&target);
                    result
                });
                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(ConnectFailure::Cancelled),
                        Err(e) => Err(ConnectFailure::Io(e.to_string())),
                    }
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        }
    }

    /// Tear down the session for `host`. Idempotent; only the call that
    /// actually removed a session sends the event.
    pub async fn disconnect(&self, host: &HostId) -> bool {
        self.inner.vault.clear_memory(host);
        self.inner.watcher.clear_broken(host);
        let Some(session) = self.inner.sessions.remove(host) else {
            return false;
        };
        session.shutdown().await;
        info!(%host, "disconnected");
        let _ = self.inner.events.send(ConnectionEvent::Disconnected {
            host: host.clone(),
            cause: DisconnectCause::Requested,
        });
        true
    }

    /// Disconnect and drop every trace of `host`: recent entry, credentials, password.
    pub async fn forget(&self, host: &HostId) {
        self.disconnect(host).await;
        self.inner.recent.remove(host);
        self.inner.credentials.forget(host);
        self.inner.vault.forget(host);
        self.inner.executors.close(host);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn recent_connections(&self) -> Vec<HostId> {
        self.inner.recent.list()
    }

    pub fn pool(&self, host: &HostId) -> Option<Arc<ChannelPool>> {
        self.inner.sessions.get(host).map(|s| s.pool().clone())
    }

    /// File tasks bound to the live session for `host`.
    pub fn files(&self, host: &HostId) -> Result<FileTasks, TaskError> {
        let session = self
            .inner
            .sessions
            .get(host)
            .filter(|s| s.is_alive())
            .ok_or_else(|| {
                TaskError::new(
                    ErrorKind::NotConnected,
                    "files",
                    host.to_string(),
                    "no live session",
                )
            })?;
        Ok(FileTasks::new(
            session,
            self.inner.profiles.get(host),
            self.inner.executors.clone(),
            &self.inner.config,
        ))
    }

    pub fn profile(&self, host: &HostId) -> Option<Arc<HostProfile>> {
        self.inner.profiles.get(host)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.sessions.list()
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.credentials
    }

    /// Persist the credential record for `host` and push it into a live session.
    pub fn apply_credentials(&self, host: &HostId) -> bool {
        self.inner
            .credentials
            .apply(host, self.inner.sessions.as_ref())
    }

    pub fn vault(&self) -> &Arc<PasswordVault> {
        &self.inner.vault
    }

    pub fn watcher(&self) -> &ConnectionWatcher {
        &self.inner.watcher
    }

    /// Cancel pending connects, stop the watcher and close every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.watcher.shutdown().await;
        for host in self.inner.sessions.hosts() {
            self.disconnect(&host).await;
        }
    }
}

impl ManagerInner {
    async fn establish(&self, host: &HostId) -> Result<(), ConnectFailure> {
        let request = ConnectRequest {
            host: host.clone(),
            auth: self.credentials.auth_settings(host),
            password: self.vault.get(host),
            timeout: self
                .credentials
                .timeout_or(host, self.config.connect_timeout),
        };
        debug!(%host, auth = ?request.auth.kind, "connecting");

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ConnectFailure::Cancelled),
            result = self.handshake(&request) => result,
        };
        self.vault.end_attempt(host);

        match result {
            Ok(connection) => {
                if let Some(live) = self.sessions.get(host).filter(|s| s.is_alive()) {
                    debug!(%host, since = %live.connected_at(), "keeping the live session");
                    connection.disconnect().await;
                    return Ok(());
                }
                self.register(host, connection).await;
                Ok(())
            }
            Err(failure) => {
                match &failure {
                    ConnectFailure::Cancelled => debug!(%host, "connect cancelled"),
                    ConnectFailure::Authentication(msg) => {
                        warn!(%host, "authentication failed: {}", msg)
                    }
                    ConnectFailure::Io(msg) => error!(%host, "connect failed: {}", msg),
                }
                Err(failure)
            }
        }
    }

    async fn handshake(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectFailure> {
        if !self.config.test_mode {
            return self.transport.connect(request).await;
        }
        let backoff = ExponentialBuilder::default()
            .with_min_delay(TEST_MODE_MIN_DELAY)
            .with_max_delay(TEST_MODE_MAX_DELAY)
            .with_max_times(TEST_MODE_AUTH_ATTEMPTS - 1)
            .with_jitter();
        (|| async { self.transport.connect(request).await })
            .retry(backoff)
            .when(ConnectFailure::is_authentication)
            .notify(|err, dur| {
                warn!(host = %request.host, "test mode: {}. Retrying in {:?}", err, dur);
            })
            .await
    }

    async fn register(&self, host: &HostId, connection: Arc<dyn Connection>) {
        let session = Arc::new(Session::new(host.clone(), connection.clone(), &self.config));
        if let Some(previous) = self.sessions.insert(session) {
            previous.shutdown().await;
        }
        self.watcher.clear_broken(host);
        self.recent.touch(host);
        self.credentials.mark_connected(host);
        if let Err(e) = self.profiles.populate(host, connection.as_ref()).await {
            warn!(%host, "could not fetch host profile: {}", e);
        }
        self.watcher.spawn(self.runtime.handle());
        self.watcher.nudge();
        info!(%host, "connected");
        let _ = self.events.send(ConnectionEvent::Connected { host: host.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::credentials::AuthKind;
    use crate::remote::mock::MockTransport;
    use crate::remote::profile::OsFamily;
    use crate::remote::transfer::UploadRequest;
    use std::sync::Mutex;

    fn manager_with(config: MuxConfig) -> (Arc<MockTransport>, ConnectionManager) {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::builder(transport.clone())
            .config(config)
            .build()
            .unwrap();
        (transport, manager)
    }

    fn manager() -> (Arc<MockTransport>, ConnectionManager) {
        manager_with(MuxConfig::default().with_watch_interval(Duration::from_millis(20)))
    }

    fn host() -> HostId {
        HostId::new("dev", "build-01", 22)
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    mod connecting {
        use super::*;

        #[tokio::test]
        async fn test_local_host_is_always_connected() {
            let (transport, manager) = manager();
            assert!(manager.is_connected_to(&HostId::local()));
            assert_eq!(manager.connect(&HostId::local()).await, ConnectOutcome::Connected);
            assert_eq!(transport.handshakes(), 0);
        }

        #[tokio::test]
        async fn test_connect_registers_session_and_side_effects() {
            let (_, manager) = manager();
            let mut rx = manager.subscribe();

            assert_eq!(manager.connect(&host()).await, ConnectOutcome::Connected);
            assert!(manager.is_connected_to(&host()));
            assert_eq!(manager.recent_connections(), vec![host()]);
            assert_eq!(manager.profile(&host()).unwrap().os, OsFamily::Linux);
            assert_eq!(
                drain(&mut rx),
                vec![ConnectionEvent::Connected { host: host() }]
            );
        }

        #[tokio::test]
        async fn test_second_connect_reuses_session() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            manager.connect(&host()).await;
            assert_eq!(transport.handshakes(), 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_connects_share_one_handshake() {
            let (transport, manager) = manager();
            transport.set_delay(Duration::from_millis(50));

            let attempts: Vec<_> = (0..16)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.connect(&host()).await })
                })
                .collect();
            for attempt in attempts {
                assert_eq!(attempt.await.unwrap(), ConnectOutcome::Connected);
            }
            assert_eq!(transport.handshakes(), 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_connects_share_one_failure() {
            let (transport, manager) = manager();
            transport.set_delay(Duration::from_millis(50));
            transport.fail_next(ConnectFailure::Io("refused".into()));

            let attempts: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.connect(&host()).await })
                })
                .collect();
            for attempt in attempts {
                assert_eq!(
                    attempt.await.unwrap(),
                    ConnectOutcome::Failed(ConnectFailure::Io("refused".into()))
                );
            }
            assert_eq!(transport.handshakes(), 1);
            assert!(!manager.is_connected_to(&host()));
        }

        #[tokio::test]
        async fn test_cancelled_wait_is_a_distinct_outcome() {
            let (transport, manager) = manager();
            transport.set_delay(Duration::from_millis(200));
            let cancel = CancellationToken::new();
            cancel.cancel();

            let outcome = manager.connect_cancellable(&host(), &cancel).await;
            assert_eq!(outcome, ConnectOutcome::Cancelled);
        }

        #[tokio::test]
        async fn test_transport_cancellation_maps_to_cancelled() {
            let (transport, manager) = manager();
            transport.fail_next(ConnectFailure::Cancelled);
            assert_eq!(manager.connect(&host()).await, ConnectOutcome::Cancelled);
        }

        #[tokio::test]
        async fn test_blocking_connect_fails_fast_inside_runtime() {
            let (_, manager) = manager();
            assert_eq!(
                manager.connect_to_blocking(&host()),
                Err(BlockingConnectError::InsideRuntime)
            );
        }

        #[test]
        fn test_blocking_connect_outside_runtime() {
            let (transport, manager) = manager();
            let outcome = manager.connect_to_blocking(&host()).unwrap();
            assert_eq!(outcome, ConnectOutcome::Connected);
            assert_eq!(transport.handshakes(), 1);
        }

        #[tokio::test]
        async fn test_late_attempt_keeps_live_session() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            let pool = manager.pool(&host()).unwrap();
            let lease = pool.acquire().await.unwrap();

            assert_eq!(manager.attempt(&host()).await, Ok(()));
            assert_eq!(transport.handshakes(), 1);
            assert!(!pool.is_closed());
            assert!(Arc::ptr_eq(&manager.pool(&host()).unwrap(), &pool));
            assert!(lease.stat("/").await.is_ok());
        }

        #[tokio::test]
        async fn test_finished_handshake_does_not_replace_live_session() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            let pool = manager.pool(&host()).unwrap();
            let mut rx = manager.subscribe();

            assert_eq!(manager.inner.establish(&host()).await, Ok(()));
            assert_eq!(transport.handshakes(), 2);
            assert!(!pool.is_closed());
            assert!(Arc::ptr_eq(&manager.pool(&host()).unwrap(), &pool));
            assert!(drain(&mut rx).is_empty());
        }

        #[test]
        fn test_file_task_after_blocking_connect() {
            let (_, manager) = manager();
            assert!(manager.connect_to_blocking(&host()).unwrap().is_connected());

            let stat = manager.files(&host()).unwrap().stat("/");
            let info = manager.wait_blocking(stat).unwrap().unwrap();
            assert!(info.is_directory());
        }
    }

    mod credentials {
        use super::*;

        #[tokio::test]
        async fn test_password_is_offered_then_dropped() {
            let (transport, manager) = manager();
            manager.vault().put(&host(), "s3cret", false);
            manager.connect(&host()).await;
            assert_eq!(transport.passwords(), vec![Some("s3cret".to_string())]);
            assert_eq!(manager.vault().get(&host()), None);
        }

        #[tokio::test]
        async fn test_disconnect_purges_kept_password() {
            let (_, manager) = manager_with(MuxConfig::default().with_keep_password(true));
            manager.vault().put(&host(), "s3cret", false);
            manager.connect(&host()).await;
            assert!(manager.vault().has_in_memory(&host()));
            manager.disconnect(&host()).await;
            assert!(!manager.vault().has_in_memory(&host()));
        }

        #[tokio::test]
        async fn test_apply_reaches_live_session() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            manager.credentials().set_kind(&host(), AuthKind::Password);
            assert!(manager.apply_credentials(&host()));
            let applied = transport.last_connection().unwrap().applied_auth().unwrap();
            assert_eq!(applied.kind, AuthKind::Password);
        }

        #[tokio::test]
        async fn test_applied_settings_drive_next_handshake() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            manager.credentials().set_kind(&host(), AuthKind::KeyFile);
            manager
                .credentials()
                .set_key_file(&host(), Some("/home/dev/.ssh/id_ed25519".into()));
            assert!(manager.apply_credentials(&host()));

            manager.disconnect(&host()).await;
            manager.connect(&host()).await;
            let requests = transport.auth_requests();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[1].kind, AuthKind::KeyFile);
            assert_eq!(
                requests[1].key_file.as_deref(),
                Some(std::path::Path::new("/home/dev/.ssh/id_ed25519"))
            );
        }

        #[tokio::test]
        async fn test_test_mode_retries_auth_failures() {
            let (transport, manager) = manager_with(MuxConfig::default().with_test_mode(true));
            for _ in 0..3 {
                transport.fail_next(ConnectFailure::Authentication("flaky".into()));
            }
            assert_eq!(manager.connect(&host()).await, ConnectOutcome::Connected);
            assert_eq!(transport.handshakes(), 4);
        }

        #[tokio::test]
        async fn test_test_mode_gives_up_after_bound() {
            let (transport, manager) = manager_with(MuxConfig::default().with_test_mode(true));
            for _ in 0..(TEST_MODE_AUTH_ATTEMPTS + 2) {
                transport.fail_next(ConnectFailure::Authentication("nope".into()));
            }
            let outcome = manager.connect(&host()).await;
            assert!(matches!(outcome, ConnectOutcome::Failed(ConnectFailure::Authentication(_))));
            assert_eq!(transport.handshakes(), TEST_MODE_AUTH_ATTEMPTS);
        }

        #[tokio::test]
        async fn test_production_never_retries() {
            let (transport, manager) = manager();
            transport.fail_next(ConnectFailure::Authentication("nope".into()));
            assert!(!manager.connect(&host()).await.is_connected());
            assert_eq!(transport.handshakes(), 1);
        }
    }

    mod continuation {
        use super::*;

        #[derive(Default)]
        struct Recorder {
            seen: Mutex<Vec<String>>,
        }

        impl ConnectContinuation for Recorder {
            fn connected(&self, host: &HostId) {
                self.seen.lock().unwrap().push(format!("connected {}", host));
            }

            fn failed(&self, host: &HostId, failure: &ConnectFailure) {
                self.seen.lock().unwrap().push(format!("failed {} {}", host, failure));
            }
        }

        #[tokio::test]
        async fn test_outcomes_are_pushed() {
            let (transport, manager) = manager();
            let recorder = Recorder::default();
            transport.fail_next(ConnectFailure::Io("refused".into()));

            assert!(!manager.connect_notify(&host(), &recorder).await);
            assert!(manager.connect_notify(&host(), &recorder).await);
            assert_eq!(
                *recorder.seen.lock().unwrap(),
                vec![
                    "failed dev@build-01:22 connection failed: refused".to_string(),
                    "connected dev@build-01:22".to_string(),
                ]
            );
        }
    }

    mod disconnecting {
        use super::*;

        #[tokio::test]
        async fn test_disconnect_twice_sends_one_event() {
            let (_, manager) = manager();
            manager.connect(&host()).await;
            let mut rx = manager.subscribe();

            assert!(manager.disconnect(&host()).await);
            assert!(!manager.disconnect(&host()).await);

            assert_eq!(
                drain(&mut rx),
                vec![ConnectionEvent::Disconnected {
                    host: host(),
                    cause: DisconnectCause::Requested
                }]
            );
            assert!(!manager.is_connected_to(&host()));
        }

        #[tokio::test]
        async fn test_silent_death_is_reported_once() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            let mut rx = manager.subscribe();

            transport.last_connection().unwrap().kill();
            assert!(!manager.is_connected_to(&host()));

            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                event,
                ConnectionEvent::Disconnected {
                    host: host(),
                    cause: DisconnectCause::Broken
                }
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.disconnect(&host()).await;
            assert!(drain(&mut rx).is_empty());
        }

        #[tokio::test]
        async fn test_reconnect_after_break() {
            let (transport, manager) = manager();
            manager.connect(&host()).await;
            transport.last_connection().unwrap().kill();
            manager.watcher().tick().await;
            assert!(manager.watcher().is_broken(&host()));

            assert!(manager.connect(&host()).await.is_connected());
            assert!(!manager.watcher().is_broken(&host()));
            assert_eq!(transport.handshakes(), 2);
        }

        #[tokio::test]
        async fn test_forget_removes_everything() {
            let (_, manager) = manager();
            manager.vault().put(&host(), "pw", true);
            manager.connect(&host()).await;
            manager.forget(&host()).await;

            assert!(manager.recent_connections().is_empty());
            assert!(!manager.vault().is_remembered(&host()));
            assert!(manager.sessions().is_empty());
        }

        #[tokio::test]
        async fn test_files_require_live_session() {
            let (_, manager) = manager();
            let err = manager.files(&host()).err().unwrap();
            assert_eq!(err.kind, ErrorKind::NotConnected);
        }
    }

    mod end_to_end {
        use super::*;

        #[tokio::test]
        async fn test_upload_then_list_shows_permissions_and_size() {
            let (transport, manager) = manager();
            assert!(manager.connect(&host()).await.is_connected());
            transport.fs().put_dir("/home/dev/deploy");

            let local = tempfile::NamedTempFile::new().unwrap();
            let payload = b"#!/bin/sh\necho deployed\n";
            std::fs::write(local.path(), payload).unwrap();

            let files = manager.files(&host()).unwrap();
            let outcome = files
                .upload(UploadRequest::new(local.path(), "/home/dev/deploy/run.sh").with_mask(0o755))
                .await
                .unwrap();
            assert!(outcome.transferred);

            let entries = files.list_dir("/home/dev/deploy").await.unwrap();
            let entry = entries.iter().find(|e| e.name() == "run.sh").unwrap();
            assert_eq!(entry.file_type().as_char(), '-');
            assert_eq!(entry.access_string(), "rwxr-xr-x");
            assert_eq!(entry.size(), payload.len() as u64);

            let stats = manager.pool(&host()).unwrap().stats();
            assert_eq!(stats.busy, 0);
            manager.shutdown().await;
        }
    }
}
