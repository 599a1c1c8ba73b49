//! SSH agent authentication.

use std::path::PathBuf;

use async_trait::async_trait;
use russh::client;
use russh::keys::PublicKey;
use russh::keys::agent::client::AgentClient;
use tracing::{debug, info};

use crate::remote::transport::ssh::SshClientHandler;

use super::error::AuthError;
use super::key::rsa_hash;
use super::traits::AuthStrategy;

/// Offers the identities of a running agent.
///
/// When the host's record names a key file, the matching agent identity is
/// offered first, which covers keys that are only usable unlocked in the agent.
#[derive(Default)]
pub struct AgentAuth {
    socket: Option<PathBuf>,
    preferred: Option<PublicKey>,
}

impl AgentAuth {
    /// Agent at `SSH_AUTH_SOCK`, read when the strategy is built.
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from),
            preferred: None,
        }
    }

    pub fn at(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
            preferred: None,
        }
    }

    pub fn prefer(mut self, key: PublicKey) -> Self {
        self.preferred = Some(key);
        self
    }

    pub fn preferred(&self) -> Option<&PublicKey> {
        self.preferred.as_ref()
    }
}

/// Preferred identity first, the rest in agent order.
fn order_identities(mut identities: Vec<PublicKey>, preferred: Option<&PublicKey>) -> Vec<PublicKey> {
    if let Some(preferred) = preferred
        && let Some(pos) = identities
            .iter()
            .position(|id| id.key_data() == preferred.key_data())
    {
        let first = identities.remove(pos);
        identities.insert(0, first);
    }
    identities
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| AuthError::AgentUnavailable("SSH_AUTH_SOCK is not set".to_string()))?;
        let mut agent = AgentClient::connect_uds(socket)
            .await
            .map_err(|e| AuthError::AgentUnavailable(format!("{}: {}", socket.display(), e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| AuthError::AgentUnavailable(e.to_string()))?;
        if identities.is_empty() {
            return Err(AuthError::AgentEmpty);
        }

        for identity in order_identities(identities, self.preferred.as_ref()) {
            let hash_alg = rsa_hash(handle, identity.algorithm()).await;
            debug!(comment = identity.comment(), ?hash_alg, "offering agent identity");
            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!(comment = identity.comment(), "authenticated through ssh agent");
                    return Ok(true);
                }
                Ok(_) => debug!("agent identity refused"),
                Err(e) => return Err(AuthError::exchange(self.name(), e)),
            }
        }
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
