//! Per-host bounded task executors.
//!
//! Every host gets its own semaphore, so a backlog of transfers to one host
//! never delays tasks queued for another. Submitted work runs on the runtime
//! whose handle the executors were built with, so a synchronous caller can
//! submit too; callers receive a [`TaskHandle`] and are never blocked unless
//! they await it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::error;

use crate::remote::error::{ErrorKind, TaskError};
use crate::remote::host::HostId;

/// Default number of concurrently running tasks per host.
pub fn default_parallelism() -> usize {
    num_cpus::get().max(2)
}

pub struct HostExecutors {
    limits: DashMap<HostId, Arc<Semaphore>>,
    per_host: usize,
    runtime: Handle,
}

impl HostExecutors {
    pub fn new(per_host: usize, runtime: Handle) -> Self {
        Self {
            limits: DashMap::new(),
            per_host: per_host.max(1),
            runtime,
        }
    }

    /// Executors on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Outside of a tokio runtime.
    pub fn current(per_host: usize) -> Self {
        Self::new(per_host, Handle::current())
    }

    pub fn per_host(&self) -> usize {
        self.per_host
    }

    fn limit(&self, host: &HostId) -> Arc<Semaphore> {
        self.limits
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone()
    }

    /// Number of tasks for `host` that are running right now.
    pub fn running(&self, host: &HostId) -> usize {
        self.limits
            .get(host)
            .map(|s| self.per_host - s.available_permits())
            .unwrap_or(0)
    }

    /// Queue `task` on the executor for `host`.
    pub fn submit<T, F>(&self, host: &HostId, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let limit = self.limit(host);
        let label = host.to_string();
        let inner = self.runtime.spawn(async move {
            let _permit = limit.acquire_owned().await.map_err(|_| {
                TaskError::new(ErrorKind::Cancelled, "schedule", &label, "executor closed")
            })?;
            task.await
        });
        TaskHandle {
            inner,
            host: host.to_string(),
        }
    }

    /// Stop accepting work for `host`; queued tasks fail as cancelled.
    pub fn close(&self, host: &HostId) {
        if let Some((_, limit)) = self.limits.remove(host) {
            limit.close();
        }
    }
}

/// Result of a submitted task.
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T, TaskError>>,
    host: String,
}

impl<T> TaskHandle<T> {
    /// Cancel the task. Awaiting the handle then yields a cancelled error.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let host = self.host.clone();
        Pin::new(&mut self.inner).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TaskError::new(
                ErrorKind::Cancelled,
                "task",
                host,
                "task was cancelled",
            )),
            Err(e) => {
                error!(host = %host, "task panicked: {}", e);
                Err(TaskError::new(ErrorKind::Failure, "task", host, e.to_string()))
            }
        })
    }
}
