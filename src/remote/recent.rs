//! Recent-connections list, most recently used first.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::remote::host::HostId;
use crate::remote::prefs::PreferenceStore;

const RECENT_KEY: &str = "hostmux.recent";

/// Upper bound on persisted entries.
pub const MAX_RECENT: usize = 20;

pub struct RecentConnections {
    prefs: Arc<dyn PreferenceStore>,
    // Serializes read-modify-write of the persisted list.
    lock: Mutex<()>,
}

impl RecentConnections {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self {
            prefs,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Vec<HostId> {
        let Some(text) = self.prefs.get(RECENT_KEY) else {
            return Vec::new();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("discarding unreadable recent-connections list: {}", e);
            Vec::new()
        })
    }

    fn save(&self, hosts: &[HostId]) {
        match serde_json::to_string(hosts) {
            Ok(text) => self.prefs.put(RECENT_KEY, &text),
            Err(e) => warn!("failed to serialize recent-connections list: {}", e),
        }
    }

    /// Move `host` to the front.
    pub fn touch(&self, host: &HostId) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut hosts = self.load();
        hosts.retain(|h| h != host);
        hosts.insert(0, host.clone());
        hosts.truncate(MAX_RECENT);
        self.save(&hosts);
    }

    pub fn remove(&self, host: &HostId) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut hosts = self.load();
        let before = hosts.len();
        hosts.retain(|h| h != host);
        if hosts.len() != before {
            self.save(&hosts);
        }
    }

    pub fn list(&self) -> Vec<HostId> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load()
    }
}
