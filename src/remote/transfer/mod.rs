//! Transfer task workers.
//!
//! Every operation follows the same shape:
//!
//! 1. lease a channel from the session's pool
//! 2. run one remote operation
//! 3. on an error that means the channel is corrupt, discard the lease
//! 4. drop the lease (returns or discards the channel)
//! 5. decorate the error with operation and path
//!
//! Retries are bounded and driven by `backon`:
//!
//! | Operation | Attempts | Retried on |
//! |-----------|----------|------------|
//! | stat / lstat / list | `stat_attempts` (2) | generic failure |
//! | upload write | 1 + `upload_retries` (1) | generic failure, lost channel |
//! | download | 1 | never |
//! | rename | 1 | never; generic failure discards the channel |
//!
//! Tasks run on the host's bounded executor and are returned as
//! [`TaskHandle`]s.

mod download;
mod query;
mod rename;
mod upload;

pub use upload::{UploadOutcome, UploadRequest};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tracing::debug;

use crate::remote::config::MuxConfig;
use crate::remote::error::{RemoteError, TaskError};
use crate::remote::executor::{HostExecutors, TaskHandle};
use crate::remote::host::HostId;
use crate::remote::metadata::FileInfo;
use crate::remote::pool::ChannelLease;
use crate::remote::profile::HostProfile;
use crate::remote::session::Session;

/// Everything a task needs, shared by all tasks of one host.
pub(crate) struct TaskContext {
    host: HostId,
    session: Arc<Session>,
    profile: Option<Arc<HostProfile>>,
    upload_retries: u32,
    stat_attempts: u32,
}

impl TaskContext {
    async fn lease(&self, op: &'static str, path: &str) -> Result<ChannelLease, TaskError> {
        self.session
            .pool()
            .acquire()
            .await
            .map_err(|e| e.context(op, path))
    }
}

/// Finish one channel operation: discard a corrupt channel and add context.
fn settle<T>(
    lease: &mut ChannelLease,
    result: Result<T, RemoteError>,
    op: &'static str,
    path: &str,
) -> Result<T, TaskError> {
    result.map_err(|e| {
        if e.kind.corrupts_channel() {
            lease.discard();
        }
        e.context(op, path)
    })
}

/// Run `attempt` up to `attempts` times while `retry_if` holds.
async fn bounded<T, F, Fut>(
    attempts: u32,
    attempt: F,
    retry_if: fn(&TaskError) -> bool,
) -> Result<T, TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let backoff = ConstantBuilder::default()
        .with_delay(Duration::ZERO)
        .with_max_times(attempts.saturating_sub(1) as usize);

    attempt
        .retry(backoff)
        .when(retry_if)
        .notify(|e: &TaskError, _| {
            debug!(op = e.op, path = %e.path, kind = %e.kind, "retrying after transient error");
        })
        .await
}

/// File operations against one connected host.
#[derive(Clone)]
pub struct FileTasks {
    ctx: Arc<TaskContext>,
    executors: Arc<HostExecutors>,
}

impl FileTasks {
    pub(crate) fn new(
        session: Arc<Session>,
        profile: Option<Arc<HostProfile>>,
        executors: Arc<HostExecutors>,
        config: &MuxConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(TaskContext {
                host: session.host().clone(),
                session,
                profile,
                upload_retries: config.upload_retries,
                stat_attempts: config.stat_attempts.max(1),
            }),
            executors,
        }
    }

    pub fn host(&self) -> &HostId {
        &self.ctx.host
    }

    pub fn upload(&self, request: UploadRequest) -> TaskHandle<UploadOutcome> {
        let ctx = self.ctx.clone();
        self.executors
            .submit(&self.ctx.host, async move { upload::run(&ctx, request).await })
    }

    /// Fetch `remote` into `local`. Returns the number of bytes copied.
    pub fn download(&self, remote: impl Into<String>, local: impl Into<PathBuf>) -> TaskHandle<u64> {
        let ctx = self.ctx.clone();
        let (remote, local) = (remote.into(), local.into());
        self.executors.submit(&self.ctx.host, async move {
            download::run(&ctx, &remote, &local).await
        })
    }

    pub fn stat(&self, path: impl Into<String>) -> TaskHandle<FileInfo> {
        let ctx = self.ctx.clone();
        let path = path.into();
        self.executors
            .submit(&self.ctx.host, async move { query::stat(&ctx, &path, true).await })
    }

    pub fn lstat(&self, path: impl Into<String>) -> TaskHandle<FileInfo> {
        let ctx = self.ctx.clone();
        let path = path.into();
        self.executors
            .submit(&self.ctx.host, async move { query::stat(&ctx, &path, false).await })
    }

    /// Directory entries without `.` and `..`.
    pub fn list_dir(&self, path: impl Into<String>) -> TaskHandle<Vec<FileInfo>> {
        let ctx = self.ctx.clone();
        let path = path.into();
        self.executors
            .submit(&self.ctx.host, async move { query::list_dir(&ctx, &path).await })
    }

    pub fn rename(&self, from: impl Into<String>, to: impl Into<String>) -> TaskHandle<()> {
        let ctx = self.ctx.clone();
        let (from, to) = (from.into(), to.into());
        self.executors
            .submit(&self.ctx.host, async move { rename::run(&ctx, &from, &to).await })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::mock::MockConnection;

    /// Tasks over a fresh mock connection with default settings.
    pub(crate) fn tasks() -> (Arc<MockConnection>, FileTasks) {
        tasks_with(MuxConfig::default())
    }

    pub(crate) fn tasks_with(config: MuxConfig) -> (Arc<MockConnection>, FileTasks) {
        let conn = Arc::new(MockConnection::new());
        let session = Arc::new(Session::new(
            HostId::new("u", "h", 22),
            conn.clone(),
            &config,
        ));
        let profile = Arc::new(HostProfile {
            os: crate::remote::profile::OsFamily::Linux,
            uid: 1000,
            gids: vec![1000],
            ..HostProfile::default()
        });
        let tasks = FileTasks::new(session, Some(profile), Arc::new(HostExecutors::current(4)), &config);
        (conn, tasks)
    }

    pub(crate) fn assert_pool_balanced(tasks: &FileTasks) {
        let stats = tasks.ctx.session.pool().stats();
        assert_eq!(stats.busy, 0, "leaked lease: {:?}", stats);
        assert_eq!((stats.idle + stats.busy) as u64, stats.opened - stats.discarded);
    }

    #[tokio::test]
    async fn test_bounded_stops_at_limit() {
        use crate::remote::error::ErrorKind;
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = AtomicU32::new(0);
        let result: Result<(), TaskError> = bounded(
            3,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::new(ErrorKind::Failure, "stat", "/x", "boom"))
            },
            TaskError::is_transient,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
