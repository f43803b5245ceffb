use crate::jobs::{
    dispatch::JobHandler,
    error_codes::ErrorCode,
    model::{Job, JobDecodeError},
    repo::JobQueue,
    retry::{classify_error, next_delay_seconds, ErrorClass, RetryConfig},
};
use crate::notify::PipelineError;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// What happens to a job whose pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizePolicy {
    /// Delete only on success. Failures are retried with backoff, then
    /// dead-lettered.
    OnSuccess,
    /// Delete regardless of outcome. Failed jobs are lost.
    Always,
}

impl FromStr for FinalizePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on-success" | "on_success" | "success" => Ok(Self::OnSuccess),
            "always" => Ok(Self::Always),
            other => anyhow::bail!("unknown finalize policy {other:?} (expected on-success or always)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Poll forever, logging queue depth while idle.
    Daemon,
    /// Stop as soon as the queue has nothing runnable.
    Drain,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daemon" => Ok(Self::Daemon),
            "drain" | "batch" => Ok(Self::Drain),
            other => anyhow::bail!("unknown run mode {other:?} (expected daemon or drain)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub worker_id: String,
    pub finalize: FinalizePolicy,
    pub mode: RunMode,
    pub max_attempts: i32,
    pub retry: RetryConfig,
    pub idle_poll: Duration,
    /// In-progress rows older than this are assumed orphaned and requeued.
    /// Must exceed the longest fetch poll.
    pub claim_timeout: Duration,
    pub job_deadline: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            finalize: FinalizePolicy::OnSuccess,
            mode: RunMode::Daemon,
            max_attempts: 5,
            retry: RetryConfig::default(),
            idle_poll: Duration::from_secs(10),
            claim_timeout: Duration::from_secs(3 * 60 * 60),
            job_deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying { run_at: DateTime<Utc> },
    DeadLettered { code: ErrorCode },
    /// Failed but deleted anyway under [`FinalizePolicy::Always`].
    Dropped { code: ErrorCode },
    /// Interrupted by worker shutdown and handed back unchanged.
    Released,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    pub released: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retrying += 1,
            JobOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            JobOutcome::Dropped { .. } => self.dropped += 1,
            JobOutcome::Released => self.released += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.retrying + self.dead_lettered + self.dropped + self.released
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A missing engine or credential; every following job would fail the
    /// same way. The claimed job was released first.
    #[error("worker halted on configuration error: {0}")]
    Halted(#[source] PipelineError),

    #[error("job queue: {0:#}")]
    Queue(anyhow::Error),
}

/// The worker loop: claim, dispatch, finalize.
#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    cfg: RunnerConfig,
}

impl JobRunner {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, cfg: RunnerConfig) -> Self {
        Self {
            queue,
            handler,
            cfg,
        }
    }

    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunSummary, RunnerError> {
        match self.cfg.mode {
            RunMode::Drain => self.drain(shutdown).await,
            RunMode::Daemon => self.run_daemon(shutdown).await,
        }
    }

    /// Process jobs until none is runnable.
    pub async fn drain(&self, shutdown: &CancellationToken) -> Result<RunSummary, RunnerError> {
        self.reap().await?;

        let mut summary = RunSummary::default();
        while !shutdown.is_cancelled() {
            match self.run_once(shutdown).await? {
                Some(outcome) => summary.record(&outcome),
                None => break,
            }
        }

        info!(
            worker_id = %self.cfg.worker_id,
            processed = summary.processed(),
            completed = summary.completed,
            retrying = summary.retrying,
            dead_lettered = summary.dead_lettered,
            released = summary.released,
            "queue drained"
        );
        Ok(summary)
    }

    async fn run_daemon(&self, shutdown: &CancellationToken) -> Result<RunSummary, RunnerError> {
        let mut summary = RunSummary::default();
        let mut last_reap_at: Option<Instant> = None;

        info!(worker_id = %self.cfg.worker_id, "worker loop started");

        while !shutdown.is_cancelled() {
            if last_reap_at.map_or(true, |at| at.elapsed() >= REAP_INTERVAL) {
                if let Err(e) = self.reap().await {
                    error!(worker_id = %self.cfg.worker_id, error = %e, "reaping stale claims failed");
                }
                last_reap_at = Some(Instant::now());
            }

            match self.run_once(shutdown).await {
                Ok(Some(outcome)) => {
                    summary.record(&outcome);
                    continue;
                }
                Ok(None) => match self.queue.pending_count().await {
                    Ok(depth) => info!(worker_id = %self.cfg.worker_id, depth, "queue idle"),
                    Err(e) => warn!(worker_id = %self.cfg.worker_id, error = %e, "queue depth unavailable"),
                },
                Err(halt @ RunnerError::Halted(_)) => return Err(halt),
                // The queue transaction rolled back; whatever the job already
                // did (an email sent) stays done. Try again next tick.
                Err(RunnerError::Queue(e)) => {
                    error!(worker_id = %self.cfg.worker_id, error = %e, "job queue error");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.idle_poll) => {}
            }
        }

        info!(worker_id = %self.cfg.worker_id, processed = summary.processed(), "worker loop stopped");
        Ok(summary)
    }

    /// Claim and process a single job. `Ok(None)` means nothing was runnable.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<Option<JobOutcome>, RunnerError> {
        let worker_id = self.cfg.worker_id.as_str();

        let Some(job) = self
            .queue
            .claim_one(worker_id)
            .await
            .map_err(RunnerError::Queue)?
        else {
            return Ok(None);
        };

        info!(
            worker_id,
            job_id = job.id,
            task_name = %job.task_name,
            attempt = job.attempts + 1,
            "claimed job"
        );

        let command = match job.command() {
            Ok(command) => command,
            Err(e) => {
                let code = match e {
                    JobDecodeError::UnknownKind(_) => ErrorCode::UnknownJobType,
                    JobDecodeError::MissingArg { .. } => ErrorCode::BadArgs,
                };
                warn!(worker_id, job_id = job.id, error = %e, "job cannot be dispatched");
                return self.finalize_failure(&job, code, &e.to_string()).await.map(Some);
            }
        };

        let cancel = shutdown.child_token();
        let handled = self.handler.handle(&command, &cancel);
        let result = match self.cfg.job_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handled).await {
                Ok(res) => res,
                Err(_) => {
                    cancel.cancel();
                    warn!(worker_id, job_id = job.id, deadline_secs = deadline.as_secs(), "job deadline exceeded");
                    Err(PipelineError::Cancelled)
                }
            },
            None => handled.await,
        };

        match result {
            Ok(()) => {
                self.queue
                    .complete(&job, worker_id)
                    .await
                    .map_err(RunnerError::Queue)?;
                info!(worker_id, job_id = job.id, order_id = command.order_id(), "job completed");
                Ok(Some(JobOutcome::Completed))
            }
            Err(e) if e.code() == ErrorCode::Configuration => {
                self.queue
                    .release(&job, worker_id)
                    .await
                    .map_err(RunnerError::Queue)?;
                error!(worker_id, job_id = job.id, error = %e, "configuration error, releasing job and halting");
                Err(RunnerError::Halted(e))
            }
            // Shutdown, not the job deadline, cut the attempt short.
            Err(e) if e.code() == ErrorCode::Cancelled && shutdown.is_cancelled() => {
                self.queue
                    .release(&job, worker_id)
                    .await
                    .map_err(RunnerError::Queue)?;
                warn!(worker_id, job_id = job.id, order_id = command.order_id(), "job interrupted by shutdown, released");
                Ok(Some(JobOutcome::Released))
            }
            Err(e) => {
                error!(
                    worker_id,
                    job_id = job.id,
                    order_id = command.order_id(),
                    code = %e.code(),
                    error = %e,
                    "job failed"
                );
                self.finalize_failure(&job, e.code(), &e.to_string())
                    .await
                    .map(Some)
            }
        }
    }

    async fn finalize_failure(
        &self,
        job: &Job,
        code: ErrorCode,
        message: &str,
    ) -> Result<JobOutcome, RunnerError> {
        let worker_id = self.cfg.worker_id.as_str();

        match self.cfg.finalize {
            FinalizePolicy::Always => {
                self.queue
                    .complete(job, worker_id)
                    .await
                    .map_err(RunnerError::Queue)?;
                warn!(worker_id, job_id = job.id, %code, "failed job deleted (finalize=always)");
                Ok(JobOutcome::Dropped { code })
            }
            FinalizePolicy::OnSuccess => {
                let attempt_no = job.attempts + 1;
                let can_retry =
                    classify_error(code) == ErrorClass::Retryable && attempt_no < self.cfg.max_attempts;

                if can_retry {
                    let delay_secs = {
                        let mut rng = StdRng::from_entropy();
                        next_delay_seconds(attempt_no, &self.cfg.retry, &mut rng)
                    };
                    let run_at = Utc::now() + chrono::Duration::seconds(delay_secs);

                    self.queue
                        .retry_later(job, worker_id, run_at, code, message)
                        .await
                        .map_err(RunnerError::Queue)?;
                    warn!(worker_id, job_id = job.id, attempt_no, delay_secs, %code, "job rescheduled");
                    Ok(JobOutcome::Retrying { run_at })
                } else {
                    self.queue
                        .mark_failed(job, worker_id, code, message)
                        .await
                        .map_err(RunnerError::Queue)?;
                    error!(worker_id, job_id = job.id, attempt_no, %code, "job dead-lettered");
                    Ok(JobOutcome::DeadLettered { code })
                }
            }
        }
    }

    async fn reap(&self) -> Result<(), RunnerError> {
        let reaped = self
            .queue
            .reap_stale_claims(self.cfg.claim_timeout)
            .await
            .map_err(RunnerError::Queue)?;
        if reaped > 0 {
            warn!(worker_id = %self.cfg.worker_id, reaped, "requeued stale claims");
        } else {
            debug!(worker_id = %self.cfg.worker_id, "no stale claims");
        }
        Ok(())
    }
}
