//! DashMap-based session storage implementation.
//!
//! Provides sharded concurrent access to sessions keyed by [`HostId`].

use std::sync::Arc;

use dashmap::DashMap;

use crate::remote::host::HostId;
use crate::remote::session::{Session, SessionInfo};

use super::traits::SessionStorage;

#[derive(Default)]
pub struct DashMapSessionStorage {
    sessions: DashMap<HostId, Arc<Session>>,
}

impl DashMapSessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for DashMapSessionStorage {
    fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.host().clone(), session)
    }

    fn get(&self, host: &HostId) -> Option<Arc<Session>> {
        self.sessions.get(host).map(|entry| entry.value().clone())
    }

    fn remove(&self, host: &HostId) -> Option<Arc<Session>> {
        self.sessions.remove(host).map(|(_, session)| session)
    }

    fn remove_if_same(&self, host: &HostId, session: &Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .remove_if(host, |_, stored| Arc::ptr_eq(stored, session))
            .map(|(_, session)| session)
    }

    fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.info()).collect()
    }

    fn hosts(&self) -> Vec<HostId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    fn contains(&self, host: &HostId) -> bool {
        self.sessions.contains_key(host)
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
