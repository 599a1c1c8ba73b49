//! Ordered chain of authentication strategies.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, warn};

use crate::remote::credentials::{AuthKind, AuthMethod, AuthSettings};
use crate::remote::transport::ssh::SshClientHandler;

use super::error::AuthError;
use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, KeyboardInteractiveAuth, PasswordAuth};

/// Tries strategies in insertion order; the first success wins.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
    /// Methods that could not be set up, such as an unreadable key file.
    skipped: Vec<AuthError>,
}

/// `<key>.pub` next to a private key file.
fn companion_public_key(key_file: &Path) -> Option<keys::PublicKey> {
    let mut name = OsString::from(key_file.as_os_str());
    name.push(".pub");
    keys::load_public_key(PathBuf::from(name)).ok()
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Build the chain for one host from its credential settings.
    ///
    /// Methods are taken in the record's order. `publickey` needs a key file
    /// that loads and a non-password kind; the password methods need a
    /// password; a `Password` kind never offers keys or the agent. An empty
    /// result falls back to the agent. The agent offers the identity of the
    /// record's key file first, read from `<key>.pub` when the key itself is
    /// passphrase-protected.
    pub fn from_settings(settings: &AuthSettings, password: Option<&str>) -> Self {
        let offers_keys = settings.kind != AuthKind::Password;
        let key_file = settings.key_file.as_deref().filter(|_| offers_keys);
        let mut key = key_file.map(KeyAuth::load);
        let preferred = match &key {
            Some(Ok(key)) => Some(key.public_key().clone()),
            Some(Err(_)) => key_file.and_then(companion_public_key),
            None => None,
        };
        let agent = || {
            let agent = AgentAuth::from_env();
            match &preferred {
                Some(public) => agent.prefer(public.clone()),
                None => agent,
            }
        };

        let mut chain = Self::new();
        for method in &settings.methods {
            chain = match (method, password) {
                (AuthMethod::PublicKey, _) if offers_keys => match key.take() {
                    Some(Ok(key)) => chain.with_key(key),
                    Some(Err(e)) => {
                        warn!("public key method skipped: {}", e);
                        chain.skipped.push(e);
                        chain
                    }
                    None => chain,
                },
                (AuthMethod::Agent, _) if offers_keys => chain.with_agent(agent()),
                (AuthMethod::KeyboardInteractive, Some(pw)) => chain.with_keyboard_interactive(pw),
                (AuthMethod::Password, Some(pw)) => chain.with_password(pw),
                _ => chain,
            };
        }
        if chain.is_empty() {
            chain = chain.with_agent(agent());
        }
        chain
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_keyboard_interactive(mut self, password: impl Into<String>) -> Self {
        self.strategies
            .push(Box::new(KeyboardInteractiveAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key: KeyAuth) -> Self {
        self.strategies.push(Box::new(key));
        self
    }

    pub fn with_agent(mut self, agent: AgentAuth) -> Self {
        self.strategies.push(Box::new(agent));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn skipped(&self) -> &[AuthError] {
        &self.skipped
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    /// Never `Ok(false)`: when nothing is accepted the error names every
    /// method tried and the last failure, falling back to a skipped method's
    /// error.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError> {
        if self.strategies.is_empty() {
            return Err(AuthError::NoMethods);
        }

        let mut last = None;
        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), "trying authentication");
            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!(strategy = strategy.name(), "authentication succeeded");
                    return Ok(true);
                }
                Ok(false) => debug!(strategy = strategy.name(), "rejected"),
                Err(e) if e.is_local() => {
                    warn!(strategy = strategy.name(), "{}", e);
                    last = Some(e);
                }
                Err(e) => {
                    debug!(strategy = strategy.name(), "authentication error: {}", e);
                    last = Some(e);
                }
            }
        }

        let last = last.or_else(|| self.skipped.first().cloned());
        Err(AuthError::Exhausted {
            tried: self.names(),
            last: last.map(Box::new),
        })
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
