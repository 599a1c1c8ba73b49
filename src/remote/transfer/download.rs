use std::path::Path;

use tracing::debug;

use crate::remote::error::TaskError;

use super::{TaskContext, settle};

/// Single attempt; a partial local file is removed on failure.
pub(super) async fn run(ctx: &TaskContext, remote: &str, local: &Path) -> Result<u64, TaskError> {
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| TaskError::local_io("download", local.display().to_string(), &e))?;

    let mut lease = ctx.lease("download", remote).await?;
    let result = lease.read_into(remote, &mut file).await;
    let result = settle(&mut lease, result, "download", remote);
    drop(lease);

    if result.is_err() {
        drop(file);
        if let Err(e) = tokio::fs::remove_file(local).await {
            debug!(path = %local.display(), "could not remove partial download: {}", e);
        }
    }
    result
}
