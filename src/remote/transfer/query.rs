//! Metadata queries: stat, lstat and directory listing.

use crate::remote::error::TaskError;
use crate::remote::metadata::FileInfo;

use super::{TaskContext, bounded, settle};

pub(super) async fn stat(ctx: &TaskContext, path: &str, follow: bool) -> Result<FileInfo, TaskError> {
    let op = if follow { "stat" } else { "lstat" };
    bounded(
        ctx.stat_attempts,
        || async {
            let mut lease = ctx.lease(op, path).await?;
            let result = if follow {
                lease.stat(path).await
            } else {
                lease.lstat(path).await
            };
            settle(&mut lease, result, op, path)
        },
        TaskError::is_transient,
    )
    .await
}

pub(super) async fn list_dir(ctx: &TaskContext, path: &str) -> Result<Vec<FileInfo>, TaskError> {
    let entries = bounded(
        ctx.stat_attempts,
        || async {
            let mut lease = ctx.lease("list", path).await?;
            let result = lease.read_dir(path).await;
            settle(&mut lease, result, "list", path)
        },
        TaskError::is_transient,
    )
    .await?;

    Ok(entries
        .into_iter()
        .filter(|e| e.name() != "." && e.name() != "..")
        .collect())
}
