//! Bounded task pool with supervised shutdown.
//!
//! Retry calls and callbacks run as independent tasks so one slow provider
//! call or requester never stalls the rest of a run. The pool caps how many
//! run at once, gives each a deadline, counts every outcome, and can be
//! drained on shutdown so in-flight callbacks are not silently lost.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{RwLock, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCategory, ReconcileError, Result};

type TimeoutFallback = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Configuration for the task pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum tasks running at the same time.
    pub concurrency: usize,
    /// Deadline for a single task.
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::DEFAULT_DISPATCH_CONCURRENCY,
            task_timeout: Duration::from_secs(crate::DEFAULT_TASK_TIMEOUT_SECONDS),
        }
    }
}

/// Kind of work submitted to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Requester callback.
    Notification,
    /// Provider retry of a reverse operation.
    ProviderRetry,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::ProviderRetry => write!(f, "provider_retry"),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Future returned `Ok`.
    Succeeded,
    /// Future returned `Err`.
    Failed,
    /// Future exceeded the task deadline and was dropped.
    TimedOut,
}

/// Counters for pool monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted.
    pub submitted: u64,
    /// Tasks that completed successfully.
    pub succeeded: u64,
    /// Tasks that returned an error.
    pub failed: u64,
    /// Tasks dropped at their deadline.
    pub timed_out: u64,
    /// Submissions refused because the pool was closed.
    pub rejected: u64,
    /// Tasks that panicked.
    pub panicked: u64,
}

impl PoolStats {
    /// Tasks accepted but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.succeeded + self.failed + self.timed_out + self.panicked)
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Bounded pool of supervised background tasks.
pub struct TaskPool {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<TaskOutcome>>,
    stats: Arc<RwLock<PoolStats>>,
    closed: AtomicBool,
}

impl TaskPool {
    /// Creates an open pool.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` for zero concurrency or a zero
    /// task timeout.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(ReconcileError::configuration("pool concurrency must be greater than 0"));
        }
        if config.task_timeout.is_zero() {
            return Err(ReconcileError::configuration("task timeout must be greater than 0"));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            tasks: Mutex::new(JoinSet::new()),
            stats: Arc::new(RwLock::new(PoolStats::default())),
            closed: AtomicBool::new(false),
        })
    }

    /// Submits a task without waiting for it to start.
    ///
    /// The task waits for a free slot, then runs under the task deadline.
    /// Its outcome is counted and logged; the error itself goes no further.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::PoolClosed` once shutdown has begun.
    pub async fn submit<F, T>(&self, kind: TaskKind, label: String, task: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(kind, label, task, None).await
    }

    /// Submits a task that runs `on_timeout` if it hits the task deadline.
    ///
    /// The task future is dropped at the deadline, so any bookkeeping it
    /// would have done on failure has to happen in `on_timeout`. The fallback
    /// gets its own deadline of the same length.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::PoolClosed` once shutdown has begun.
    pub async fn submit_with_timeout_fallback<F, T, G>(
        &self,
        kind: TaskKind,
        label: String,
        task: F,
        on_timeout: G,
    ) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        G: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(kind, label, task, Some(Box::pin(on_timeout))).await
    }

    async fn spawn<F, T>(
        &self,
        kind: TaskKind,
        label: String,
        task: F,
        on_timeout: Option<TimeoutFallback>,
    ) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            self.stats.write().await.rejected += 1;
            warn!(%kind, %label, "task pool closed, dropping task");
            return Err(ReconcileError::PoolClosed);
        }

        self.stats.write().await.submitted += 1;

        let permits = self.permits.clone();
        let stats = self.stats.clone();
        let timeout = self.config.task_timeout;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        reap_finished(&mut tasks);
        tasks.spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(_)) => {
                        debug!(%kind, %label, "task completed");
                        TaskOutcome::Succeeded
                    },
                    Ok(Err(error)) => {
                        warn!(
                            %kind,
                            %label,
                            category = %ErrorCategory::from(&error),
                            error = %error,
                            "task failed"
                        );
                        TaskOutcome::Failed
                    },
                    Err(_elapsed) => {
                        warn!(%kind, %label, timeout_ms = timeout.as_millis(), "task timed out");
                        if let Some(fallback) = on_timeout {
                            run_fallback(kind, &label, timeout, fallback).await;
                        }
                        TaskOutcome::TimedOut
                    },
                },
                Err(_closed) => {
                    warn!(%kind, %label, "task slots closed before start");
                    TaskOutcome::Failed
                },
            };

            stats.write().await.record(outcome);
            outcome
        });

        Ok(())
    }

    /// Waits until every submitted task has finished.
    ///
    /// Tasks submitted while draining are waited for as well.
    pub async fn drain(&self) {
        loop {
            let mut batch = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if batch.is_empty() {
                return;
            }
            self.join_all(&mut batch).await;
        }
    }

    /// Stops accepting work and waits for in-flight tasks.
    ///
    /// Tasks still running at the deadline are aborted.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::ShutdownTimeout` if tasks had to be aborted.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<()> {
        self.closed.store(true, Ordering::Release);

        let mut remaining =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));

        info!(
            in_flight = remaining.len(),
            timeout_seconds = timeout.as_secs(),
            "draining task pool"
        );

        if tokio::time::timeout(timeout, self.join_all(&mut remaining)).await.is_ok() {
            info!("task pool drained");
            return Ok(());
        }

        let abandoned = remaining.len();
        remaining.abort_all();
        while remaining.join_next().await.is_some() {}

        error!(abandoned, timeout_seconds = timeout.as_secs(), "task pool shutdown timed out");
        Err(ReconcileError::ShutdownTimeout { timeout, abandoned })
    }

    /// Deadline applied to each task.
    pub fn task_timeout(&self) -> Duration {
        self.config.task_timeout
    }

    /// Whether shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns current pool statistics.
    pub async fn stats(&self) -> PoolStats {
        self.stats.read().await.clone()
    }

    async fn join_all(&self, set: &mut JoinSet<TaskOutcome>) {
        while let Some(joined) = set.join_next().await {
            if let Err(join_error) = joined {
                self.record_join_error(&join_error).await;
            }
        }
    }

    async fn record_join_error(&self, join_error: &tokio::task::JoinError) {
        if join_error.is_panic() {
            self.stats.write().await.panicked += 1;
            error!(error = %join_error, "task panicked");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() && !self.closed.load(Ordering::Acquire) {
            warn!(
                active_tasks = tasks.len(),
                "TaskPool dropped with active tasks; call shutdown_graceful() to drain them"
            );
        }
    }
}

/// Runs a timed-out task's fallback under its own deadline.
async fn run_fallback(kind: TaskKind, label: &str, timeout: Duration, fallback: TimeoutFallback) {
    match tokio::time::timeout(timeout, fallback).await {
        Ok(Ok(())) => debug!(%kind, %label, "timeout fallback completed"),
        Ok(Err(error)) => {
            error!(%kind, %label, error = %error, "timeout fallback failed");
        },
        Err(_elapsed) => error!(%kind, %label, "timeout fallback timed out"),
    }
}

/// Removes finished tasks so the set does not grow across runs.
fn reap_finished(tasks: &mut JoinSet<TaskOutcome>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(join_error) = joined {
            if join_error.is_panic() {
                error!(error = %join_error, "task panicked");
            }
        }
    }
}
