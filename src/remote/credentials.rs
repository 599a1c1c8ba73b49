//! Per-host authentication settings.
//!
//! A [`CredentialRecord`] says how to authenticate against one host: which
//! kind of credential (password or key file), the key file path, the ordered
//! list of SSH methods to try and the handshake timeout. Records are loaded
//! lazily from the [`PreferenceStore`] the first time a host is looked at.
//!
//! When a host has no key file of its own, the most recently used key file
//! that actually let a connection through (process wide) is offered instead,
//! and password authentication is the last resort.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::remote::host::HostId;
use crate::remote::prefs::PreferenceStore;
use crate::remote::storage::SessionStorage;

const RECORD_KEY_PREFIX: &str = "hostmux.auth.";
const LAST_KEY_FILE_KEY: &str = "hostmux.auth.last_key_file";

/// Kind of credential configured for a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    Undefined,
    Password,
    KeyFile,
}

/// SSH user authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    KeyboardInteractive,
    Agent,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PublicKey => "publickey",
            Self::KeyboardInteractive => "keyboard-interactive",
            Self::Agent => "agent",
        }
    }
}

/// Methods tried when a record does not list its own.
pub fn default_methods() -> Vec<(AuthMethod, bool)> {
    vec![
        (AuthMethod::PublicKey, true),
        (AuthMethod::Agent, true),
        (AuthMethod::KeyboardInteractive, true),
        (AuthMethod::Password, true),
    ]
}

/// Persisted authentication settings for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub kind: AuthKind,
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_methods")]
    pub methods: Vec<(AuthMethod, bool)>,
    /// Handshake timeout in milliseconds; `None` uses the configured default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for CredentialRecord {
    fn default() -> Self {
        Self {
            kind: AuthKind::Undefined,
            key_file: None,
            methods: default_methods(),
            timeout_ms: None,
        }
    }
}

impl CredentialRecord {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn enabled_methods(&self) -> impl Iterator<Item = AuthMethod> + '_ {
        self.methods
            .iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(method, _)| *method)
    }
}

/// The part of a record a transport needs to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub kind: AuthKind,
    pub key_file: Option<PathBuf>,
    /// Enabled methods, in the order they are tried.
    pub methods: Vec<AuthMethod>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        CredentialRecord::default().into()
    }
}

impl From<CredentialRecord> for AuthSettings {
    fn from(record: CredentialRecord) -> Self {
        let methods = record.enabled_methods().collect();
        Self {
            kind: record.kind,
            key_file: record.key_file,
            methods,
        }
    }
}

/// Lazily loaded, write-through store of credential records.
pub struct CredentialStore {
    prefs: Arc<dyn PreferenceStore>,
    records: DashMap<HostId, CredentialRecord>,
    last_key_file: Mutex<Option<PathBuf>>,
}

impl CredentialStore {
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        let last_key_file = prefs.get(LAST_KEY_FILE_KEY).map(PathBuf::from);
        Self {
            prefs,
            records: DashMap::new(),
            last_key_file: Mutex::new(last_key_file),
        }
    }

    fn record_key(host: &HostId) -> String {
        format!("{}{}", RECORD_KEY_PREFIX, host.storage_key())
    }

    fn last_valid_key_file(&self) -> Option<PathBuf> {
        let guard = self.last_key_file.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().filter(|p| p.is_file()).cloned()
    }

    fn load(&self, host: &HostId) -> CredentialRecord {
        let stored = self.prefs.get(&Self::record_key(host)).and_then(|text| {
            serde_json::from_str::<CredentialRecord>(&text)
                .map_err(|e| warn!(%host, "ignoring unreadable credential record: {}", e))
                .ok()
        });
        let mut record = stored.unwrap_or_default();

        if record.kind != AuthKind::Password && record.key_file.is_none() {
            match self.last_valid_key_file() {
                Some(key_file) => {
                    debug!(%host, key = %key_file.display(), "falling back to last valid key file");
                    record.kind = AuthKind::KeyFile;
                    record.key_file = Some(key_file);
                }
                None => record.kind = AuthKind::Password,
            }
        }
        record
    }

    /// The record for `host`, loading it on first access.
    pub fn record(&self, host: &HostId) -> CredentialRecord {
        self.records
            .entry(host.clone())
            .or_insert_with(|| self.load(host))
            .clone()
    }

    fn update(&self, host: &HostId, change: impl FnOnce(&mut CredentialRecord)) {
        let mut entry = self
            .records
            .entry(host.clone())
            .or_insert_with(|| self.load(host));
        change(entry.value_mut());
    }

    pub fn set_kind(&self, host: &HostId, kind: AuthKind) {
        self.update(host, |r| r.kind = kind);
    }

    pub fn set_key_file(&self, host: &HostId, key_file: Option<PathBuf>) {
        self.update(host, |r| r.key_file = key_file);
    }

    pub fn set_methods(&self, host: &HostId, methods: Vec<(AuthMethod, bool)>) {
        self.update(host, |r| r.methods = methods);
    }

    pub fn set_timeout(&self, host: &HostId, timeout: Option<Duration>) {
        self.update(host, |r| r.timeout_ms = timeout.map(|t| t.as_millis() as u64));
    }

    /// Persist the current record for `host`.
    pub fn store(&self, host: &HostId) {
        let record = self.record(host);
        match serde_json::to_string(&record) {
            Ok(text) => self.prefs.put(&Self::record_key(host), &text),
            Err(e) => warn!(%host, "failed to serialize credential record: {}", e),
        }
    }

    /// Persist the record and push it into an already open session, if any.
    ///
    /// Returns whether a live session received the new settings.
    pub fn apply(&self, host: &HostId, sessions: &dyn SessionStorage) -> bool {
        self.store(host);
        match sessions.get(host) {
            Some(session) => {
                session.apply_auth(&self.auth_settings(host));
                debug!(%host, "authentication settings pushed to live session");
                true
            }
            None => false,
        }
    }

    /// Drop the record from memory and from the preference store.
    pub fn forget(&self, host: &HostId) {
        self.records.remove(host);
        self.prefs.remove(&Self::record_key(host));
    }

    /// Remember the key file that just authenticated `host` as the
    /// process-wide fallback.
    pub fn mark_connected(&self, host: &HostId) {
        let record = self.record(host);
        if record.kind != AuthKind::KeyFile {
            return;
        }
        let Some(key_file) = record.key_file else {
            return;
        };
        let mut guard = self.last_key_file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_deref() != Some(key_file.as_path()) {
            self.prefs
                .put(LAST_KEY_FILE_KEY, &key_file.to_string_lossy());
            *guard = Some(key_file);
        }
    }

    pub fn last_key_file(&self) -> Option<PathBuf> {
        self.last_key_file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn auth_settings(&self, host: &HostId) -> AuthSettings {
        self.record(host).into()
    }

    /// Handshake timeout for `host`, or `default` when the record has none.
    pub fn timeout_or(&self, host: &HostId, default: Duration) -> Duration {
        self.record(host).timeout().unwrap_or(default)
    }
}
