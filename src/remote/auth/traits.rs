//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::remote::transport::ssh::SshClientHandler;

use super::error::AuthError;

/// One way of proving identity to an SSH server.
///
/// Implementations are `Send + Sync` so a chain can be built once and driven
/// from any task.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - the server accepted
    /// * `Ok(false)` - the server rejected the credentials
    /// * `Err(_)` - the strategy could not try ([`AuthError::is_local`]) or the
    ///   exchange broke off
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError>;

    fn name(&self) -> &'static str;
}
