//! SSH authentication strategies.
//!
//! Each method a host may use is one [`AuthStrategy`]. [`AuthChain`] strings
//! them together in the order the host's credential record lists them.
//!
//! - [`PasswordAuth`]: `password`
//! - [`KeyboardInteractiveAuth`]: `keyboard-interactive`, answered with the password
//! - [`KeyAuth`]: `publickey` from a private key file, decoded up front
//! - [`AgentAuth`]: `publickey` through the SSH agent
//!
//! Failures are [`AuthError`]s; the chain folds them into one error naming
//! every method it tried.

mod agent;
mod chain;
mod error;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use error::AuthError;
pub use key::KeyAuth;
pub use password::{KeyboardInteractiveAuth, PasswordAuth};
pub use traits::AuthStrategy;
