//! Periodic job scheduling with structured shutdown.
//!
//! Each job runs in its own supervised task on its own interval. A tick runs
//! to completion before the job looks at the cancellation token again, so a
//! shutdown never cuts a page or a retry pass in half.

use std::{fmt, sync::Arc, time::Duration};

use postback_core::models::ReverseKind;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::ReconcileEngine,
    error::{ErrorCategory, ReconcileError, Result},
};

/// Intervals for the scheduled jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Tracking poll of `Used` requests.
    pub poll_interval: Duration,
    /// Retry pass over errored requests.
    pub reprocess_interval: Duration,
    /// Follow-up of collect and postage updates.
    pub follow_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30 * 60),
            reprocess_interval: Duration::from_secs(20 * 60),
            follow_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl ScheduleConfig {
    /// Rejects zero intervals.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` naming the zero interval.
    pub fn validate(&self) -> Result<()> {
        for (name, interval) in [
            ("poll_interval", self.poll_interval),
            ("reprocess_interval", self.reprocess_interval),
            ("follow_interval", self.follow_interval),
        ] {
            if interval.is_zero() {
                return Err(ReconcileError::configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Tracking poll.
    Poll,
    /// Retry pass.
    Reprocess,
    /// Follow-up of one reverse kind.
    Follow(ReverseKind),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll => write!(f, "poll_used"),
            Self::Reprocess => write!(f, "reprocess_errored"),
            Self::Follow(ReverseKind::Collect) => write!(f, "follow_collect"),
            Self::Follow(ReverseKind::Postage) => write!(f, "follow_postage"),
        }
    }
}

/// Runs one job to completion and logs its outcome.
pub async fn run_job(engine: &ReconcileEngine, job: Job) {
    match job {
        Job::Poll => match engine.poll_all().await {
            Ok(summary) => info!(%job, pages = summary.pages, "job finished"),
            Err(e) => error!(%job, category = %ErrorCategory::from(&e), error = %e, "job failed"),
        },
        Job::Reprocess => match engine.reprocess_with_configured_ceiling().await {
            Ok(summary) => info!(%job, found = summary.found, "job finished"),
            Err(e) => error!(%job, category = %ErrorCategory::from(&e), error = %e, "job failed"),
        },
        Job::Follow(kind) => {
            let dispatched = engine.follow_updates(kind).await;
            info!(%job, dispatched, "job finished");
        },
    }
}

/// Supervises the periodic jobs of one engine.
pub struct Scheduler {
    engine: Arc<ReconcileEngine>,
    config: ScheduleConfig,
    cancellation_token: CancellationToken,
    job_handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Creates a scheduler; no job runs until [`Scheduler::start`].
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` for zero intervals.
    pub fn new(engine: Arc<ReconcileEngine>, config: ScheduleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            cancellation_token: CancellationToken::new(),
            job_handles: Vec::new(),
        })
    }

    /// Spawns one supervised loop per job.
    ///
    /// The first run of each job happens one interval after start.
    pub fn start(&mut self) {
        let jobs = [
            (Job::Poll, self.config.poll_interval),
            (Job::Reprocess, self.config.reprocess_interval),
            (Job::Follow(ReverseKind::Collect), self.config.follow_interval),
            (Job::Follow(ReverseKind::Postage), self.config.follow_interval),
        ];

        for (job, period) in jobs {
            let engine = self.engine.clone();
            let token = self.cancellation_token.clone();

            let handle = tokio::spawn(async move {
                info!(%job, interval_seconds = period.as_secs(), "scheduled job starting");

                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => run_job(&engine, job).await,
                    }
                }

                info!(%job, "scheduled job stopped");
            });

            self.job_handles.push(handle);
        }

        info!(jobs = self.job_handles.len(), "scheduler started");
    }

    /// Whether any job loop is still running.
    pub fn has_active_jobs(&self) -> bool {
        self.job_handles.iter().any(|h| !h.is_finished())
    }

    /// Stops the job loops, then drains the engine's task pool.
    ///
    /// The loops and the pool share one deadline.
    ///
    /// # Errors
    ///
    /// - `ShutdownTimeout` when loops or pool tasks outlive the deadline
    /// - `TaskPanic` when a job loop panicked
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            jobs = self.job_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating scheduler shutdown"
        );

        let deadline = Instant::now() + timeout;
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.job_handles);
        let job_count = handles.len();
        let join_all = async {
            let mut panic = None;
            for handle in handles {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "scheduled job panicked");
                    panic = Some(ReconcileError::TaskPanic { message: join_error.to_string() });
                }
            }
            panic
        };

        let panic = match tokio::time::timeout_at(deadline, join_all).await {
            Ok(panic) => panic,
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "scheduled jobs did not stop in time");
                return Err(ReconcileError::ShutdownTimeout { timeout, abandoned: job_count });
            },
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.engine.shutdown(remaining).await?;

        match panic {
            Some(error) => Err(error),
            None => {
                info!("scheduler shutdown completed");
                Ok(())
            },
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let active = self.job_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_jobs = active,
                "Scheduler dropped without shutdown_graceful(); cancelling job loops"
            );
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::mock::RecordingNotifier, engine::ReconcileConfig, provider::mock::MockProvider,
        storage::mock::MockRequestStorage,
    };

    fn engine(storage: &MockRequestStorage, provider: &Arc<MockProvider>) -> Arc<ReconcileEngine> {
        let engine = ReconcileEngine::new(
            ReconcileConfig::default(),
            Arc::new(storage.clone()),
            provider.clone(),
            Arc::new(RecordingNotifier::new()),
        )
        .unwrap();
        Arc::new(engine)
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ScheduleConfig { poll_interval: Duration::ZERO, ..ScheduleConfig::default() };
        assert!(matches!(config.validate(), Err(ReconcileError::Configuration { .. })));
    }

    #[test]
    fn default_intervals() {
        let config = ScheduleConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1800));
        assert_eq!(config.reprocess_interval, Duration::from_secs(1200));
        assert_eq!(config.follow_interval, Duration::from_secs(21600));
    }

    #[tokio::test]
    async fn jobs_run_on_their_intervals_until_shutdown() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let config = ScheduleConfig {
            poll_interval: Duration::from_millis(10),
            reprocess_interval: Duration::from_millis(10),
            follow_interval: Duration::from_millis(10),
        };

        let mut scheduler = Scheduler::new(engine(&storage, &provider), config).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.has_active_jobs());

        scheduler.shutdown_graceful(Duration::from_secs(2)).await.unwrap();

        let follows = provider.follow_calls().await;
        assert!(follows.contains(&ReverseKind::Collect));
        assert!(follows.contains(&ReverseKind::Postage));
        assert!(storage.searches().await.len() >= 2);
    }

    #[tokio::test]
    async fn nothing_runs_before_first_interval() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());

        let mut scheduler =
            Scheduler::new(engine(&storage, &provider), ScheduleConfig::default()).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown_graceful(Duration::from_secs(1)).await.unwrap();

        assert!(provider.follow_calls().await.is_empty());
        assert!(storage.searches().await.is_empty());
    }

    #[test]
    fn job_names() {
        assert_eq!(Job::Poll.to_string(), "poll_used");
        assert_eq!(Job::Follow(ReverseKind::Postage).to_string(), "follow_postage");
    }
}
