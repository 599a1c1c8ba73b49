//! Private key file authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::remote::transport::ssh::SshClientHandler;

use super::error::AuthError;
use super::traits::AuthStrategy;

/// A decoded, passphrase-less private key offered as `publickey`.
///
/// The key is read when the strategy is built, so a missing or encrypted key
/// file is known before the handshake starts.
pub struct KeyAuth {
    key_path: PathBuf,
    key: Arc<keys::PrivateKey>,
}

impl KeyAuth {
    pub fn load(key_path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let key_path = key_path.into();
        let key = keys::load_secret_key(&key_path, None).map_err(|e| AuthError::key(&key_path, e))?;
        Ok(Self {
            key_path,
            key: Arc::new(key),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn public_key(&self) -> &keys::PublicKey {
        self.key.public_key()
    }

    pub fn is_rsa(&self) -> bool {
        self.key.algorithm().is_rsa()
    }
}

/// Signature hash for an RSA key; other key types carry their own.
pub(crate) async fn rsa_hash(
    handle: &client::Handle<SshClientHandler>,
    algorithm: keys::Algorithm,
) -> Option<keys::HashAlg> {
    if !algorithm.is_rsa() {
        return None;
    }
    handle.best_supported_rsa_hash().await.ok().flatten().flatten()
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError> {
        let hash_alg = rsa_hash(handle, self.key.algorithm()).await;
        debug!(key = %self.key_path.display(), ?hash_alg, "offering key");

        let signed = keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);
        let result = handle
            .authenticate_publickey(username, signed)
            .await
            .map_err(|e| AuthError::exchange(self.name(), e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
