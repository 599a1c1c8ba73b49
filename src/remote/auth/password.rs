//! Password and keyboard-interactive authentication.

use async_trait::async_trait;
use russh::client;
use russh::client::KeyboardInteractiveAuthResponse;
use tracing::debug;

use crate::remote::transport::ssh::SshClientHandler;

use super::error::AuthError;
use super::traits::AuthStrategy;

/// Plain `password` method.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| AuthError::exchange(self.name(), e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// `keyboard-interactive` method answering every prompt with the stored password.
///
/// Servers that disable plain password auth usually still accept this.
pub struct KeyboardInteractiveAuth {
    password: String,
}

/// Upper bound on info-request rounds before giving up.
const MAX_ROUNDS: usize = 4;

impl KeyboardInteractiveAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, AuthError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| AuthError::exchange(self.name(), e))?;

        for _ in 0..MAX_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    debug!(prompts = prompts.len(), "keyboard-interactive info request");
                    let answers = vec![self.password.clone(); prompts.len()];
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| AuthError::exchange(self.name(), e))?;
                }
            }
        }
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}
