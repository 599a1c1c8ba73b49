use tracing::debug;

use crate::remote::error::{ErrorKind, TaskError};

use super::{TaskContext, settle};

/// Single attempt. A generic failure also discards the channel, which may be
/// left in an unknown state.
pub(super) async fn run(ctx: &TaskContext, from: &str, to: &str) -> Result<(), TaskError> {
    let mut lease = ctx.lease("rename", from).await?;
    let result = lease.rename(from, to).await;
    if let Err(e) = &result
        && e.kind == ErrorKind::Failure
    {
        debug!(host = %ctx.host, from, to, "discarding channel after failed rename");
        lease.discard();
    }
    settle(&mut lease, result, "rename", from)
}
