//! Password vault adapter.
//!
//! Holds at most one password per host in memory, and only past the current
//! connect attempt when "keep in memory" is on. "Remember password" is a
//! separate persisted flag: a remembered password lives in the external
//! [`SecureStorage`], not in this process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::remote::host::HostId;
use crate::remote::prefs::PreferenceStore;

const REMEMBER_KEY_PREFIX: &str = "hostmux.remember.";
const SECRET_KEY_PREFIX: &str = "hostmux.password.";

/// External secret store (OS keyring or similar).
pub trait SecureStorage: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;

    fn save(&self, key: &str, secret: &str);

    fn delete(&self, key: &str);
}

/// Secure storage kept in process memory. Suitable for tests and one-shot tools.
#[derive(Debug, Default)]
pub struct MemorySecureStorage {
    secrets: DashMap<String, String>,
}

impl MemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStorage for MemorySecureStorage {
    fn read(&self, key: &str) -> Option<String> {
        self.secrets.get(key).map(|s| s.clone())
    }

    fn save(&self, key: &str, secret: &str) {
        self.secrets.insert(key.to_string(), secret.to_string());
    }

    fn delete(&self, key: &str) {
        self.secrets.remove(key);
    }
}

pub struct PasswordVault {
    secure: Arc<dyn SecureStorage>,
    prefs: Arc<dyn PreferenceStore>,
    memory: DashMap<HostId, String>,
    keep_in_memory: AtomicBool,
}

impl PasswordVault {
    pub fn new(
        secure: Arc<dyn SecureStorage>,
        prefs: Arc<dyn PreferenceStore>,
        keep_in_memory: bool,
    ) -> Self {
        Self {
            secure,
            prefs,
            memory: DashMap::new(),
            keep_in_memory: AtomicBool::new(keep_in_memory),
        }
    }

    fn remember_key(host: &HostId) -> String {
        format!("{}{}", REMEMBER_KEY_PREFIX, host.storage_key())
    }

    fn secret_key(host: &HostId) -> String {
        format!("{}{}", SECRET_KEY_PREFIX, host.storage_key())
    }

    /// Store a password for the next connect attempt to `host`.
    pub fn put(&self, host: &HostId, password: impl Into<String>, remember: bool) {
        let password = password.into();
        if remember {
            self.secure.save(&Self::secret_key(host), &password);
        }
        self.set_remember(host, remember);
        self.memory.insert(host.clone(), password);
    }

    /// In-memory password, or the remembered one from secure storage.
    pub fn get(&self, host: &HostId) -> Option<String> {
        if let Some(password) = self.memory.get(host) {
            return Some(password.clone());
        }
        if !self.is_remembered(host) {
            return None;
        }
        let password = self.secure.read(&Self::secret_key(host))?;
        self.memory.insert(host.clone(), password.clone());
        Some(password)
    }

    pub fn has_in_memory(&self, host: &HostId) -> bool {
        self.memory.contains_key(host)
    }

    pub fn is_remembered(&self, host: &HostId) -> bool {
        self.prefs
            .get(&Self::remember_key(host))
            .is_some_and(|v| v == "true")
    }

    /// Persist the "remember password" flag. Turning it off deletes the stored secret.
    pub fn set_remember(&self, host: &HostId, remember: bool) {
        if remember {
            self.prefs.put(&Self::remember_key(host), "true");
        } else {
            self.prefs.remove(&Self::remember_key(host));
            self.secure.delete(&Self::secret_key(host));
        }
    }

    /// A connect attempt finished; drop the in-memory copy unless kept.
    pub fn end_attempt(&self, host: &HostId) {
        if !self.keep_in_memory() {
            self.clear_memory(host);
        }
    }

    /// Drop the in-memory copy regardless of any flag.
    pub fn clear_memory(&self, host: &HostId) {
        if self.memory.remove(host).is_some() {
            debug!(%host, "in-memory password cleared");
        }
    }

    /// Remove every trace of the password for `host`.
    pub fn forget(&self, host: &HostId) {
        self.clear_memory(host);
        self.set_remember(host, false);
    }

    pub fn keep_in_memory(&self) -> bool {
        self.keep_in_memory.load(Ordering::Relaxed)
    }

    pub fn set_keep_in_memory(&self, keep: bool) {
        self.keep_in_memory.store(keep, Ordering::Relaxed);
        if !keep {
            self.memory.clear();
        }
    }
}
