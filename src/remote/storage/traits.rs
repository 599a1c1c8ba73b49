//! Storage trait for the host-to-session registry.

use std::sync::Arc;

use crate::remote::host::HostId;
use crate::remote::session::{Session, SessionInfo};

/// Trait for session storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`) and must not serialize
/// operations on different hosts behind one lock.
pub trait SessionStorage: Send + Sync {
    /// Insert a session, returning the one it replaced.
    fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>>;

    fn get(&self, host: &HostId) -> Option<Arc<Session>>;

    fn remove(&self, host: &HostId) -> Option<Arc<Session>>;

    /// Remove the entry for `host` only if it is still `session`.
    ///
    /// Lets the watcher drop a dead session without clobbering a fresh one
    /// installed by a concurrent reconnect.
    fn remove_if_same(&self, host: &HostId, session: &Arc<Session>) -> Option<Arc<Session>>;

    fn list(&self) -> Vec<SessionInfo>;

    fn hosts(&self) -> Vec<HostId>;

    /// All sessions, for scans that must not hold map locks.
    fn sessions(&self) -> Vec<Arc<Session>>;

    fn contains(&self, host: &HostId) -> bool;

    fn is_empty(&self) -> bool;
}
