//! Session registry.
//!
//! The host-to-session map is an injected object rather than process-wide
//! state, so several independent managers (and tests) can coexist.

mod session;
mod traits;

pub use session::DashMapSessionStorage;
pub use traits::SessionStorage;
