use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mission_control_core::{
    MissionStep, MissionStore, PipelineConfig, PipelineError, Resolution, StepId, StepStatus,
    WorkerConfig,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::orchestrator::{Orchestrator, StepCompletion};
use crate::policy;

const STOP_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Executes the work a mission step describes.
pub trait TaskExecutor {
    /// Runs the step and returns its JSON result. An error fails the step
    /// with the error chain as its reason.
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, step: &MissionStep) -> anyhow::Result<Value>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&MissionStep) -> anyhow::Result<Value>,
{
    fn execute(&self, step: &MissionStep) -> anyhow::Result<Value> {
        self(step)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Paused,
    Idle,
    Completed(StepCompletion),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WorkerReport {
    pub iterations: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub idle_polls: u64,
    pub paused_polls: u64,
    pub transient_errors: u64,
    /// Claimed steps resolved by someone else (e.g. reclaimed as stuck)
    /// before this worker finished them.
    pub abandoned: u64,
}

/// Poll-execute-resolve loop for one worker identity.
pub struct Worker<'a, E> {
    store: &'a dyn MissionStore,
    orchestrator: Orchestrator<'a>,
    executor: E,
    worker_id: String,
    project: Option<String>,
    kinds: Vec<String>,
    config: WorkerConfig,
}

impl<'a, E: TaskExecutor> Worker<'a, E> {
    #[must_use]
    pub fn new(
        store: &'a dyn MissionStore,
        config: &PipelineConfig,
        worker_id: impl Into<String>,
        executor: E,
    ) -> Self {
        Self {
            store,
            orchestrator: Orchestrator::new(store, config),
            executor,
            worker_id: worker_id.into(),
            project: None,
            kinds: Vec::new(),
            config: config.worker.clone(),
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    #[must_use]
    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    /// One iteration: honor the kill switch, claim, execute, resolve.
    ///
    /// # Errors
    /// Propagates store errors and resolve conflicts. A transient error while
    /// recording the result is retried first (see
    /// [`WorkerConfig::resolve_attempts`]).
    pub fn poll_once(&self) -> Result<PollOutcome, PipelineError> {
        self.poll(&AtomicBool::new(false), &mut rand::thread_rng())
    }

    fn poll<R: Rng>(&self, stop: &AtomicBool, rng: &mut R) -> Result<PollOutcome, PipelineError> {
        if !policy::worker_enabled(self.store, &self.worker_id)? {
            return Ok(PollOutcome::Paused);
        }

        let Some(step) = self.orchestrator.queue().claim_next(
            &self.worker_id,
            self.project.as_deref(),
            &self.kinds,
        )?
        else {
            return Ok(PollOutcome::Idle);
        };

        let resolution = match self.executor.execute(&step) {
            Ok(result) => Resolution::Succeeded { result },
            Err(err) => {
                tracing::warn!(step_id = %step.step_id, error = %format!("{err:#}"), "step execution failed");
                Resolution::Failed {
                    reason: Some(format!("{err:#}")),
                }
            }
        };

        let completion = self.complete(step.step_id, &resolution, stop, rng)?;
        Ok(PollOutcome::Completed(completion))
    }

    /// Records a finished step, backing off between transient failures so the
    /// executor's result survives a briefly locked store.
    fn complete<R: Rng>(
        &self,
        step_id: StepId,
        resolution: &Resolution,
        stop: &AtomicBool,
        rng: &mut R,
    ) -> Result<StepCompletion, PipelineError> {
        let mut attempt: u32 = 1;
        loop {
            match self.orchestrator.complete_step(step_id, resolution.clone()) {
                Err(err) if err.is_retriable() && attempt < self.config.resolve_attempts => {
                    let backoff_step = self.config.max_empty_polls.saturating_add(attempt - 1);
                    let delay = next_delay(&self.config, backoff_step, rng);
                    tracing::warn!(
                        step_id = %step_id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis(),
                        "transient error recording step result, retrying"
                    );
                    sleep_unless_stopped(stop, delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Polls until `stop` is set or `max_iterations` polls have run.
    ///
    /// # Errors
    /// Returns the first non-transient store error.
    pub fn run(
        &self,
        stop: &AtomicBool,
        max_iterations: Option<u64>,
    ) -> Result<WorkerReport, PipelineError> {
        let mut rng = rand::thread_rng();
        let mut report = WorkerReport::default();
        let mut consecutive_empty: u32 = 0;

        tracing::info!(worker_id = %self.worker_id, "worker started");
        while !stop.load(Ordering::Relaxed) {
            if max_iterations.is_some_and(|max| report.iterations >= max) {
                break;
            }
            report.iterations += 1;

            let delay = match self.poll(stop, &mut rng) {
                Ok(PollOutcome::Completed(completion)) => {
                    consecutive_empty = 0;
                    report.claimed += 1;
                    if completion.step.status == StepStatus::Succeeded {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                    Duration::ZERO
                }
                Ok(PollOutcome::Idle) => {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    report.idle_polls += 1;
                    next_delay(&self.config, consecutive_empty, &mut rng)
                }
                Ok(PollOutcome::Paused) => {
                    report.paused_polls += 1;
                    tracing::debug!(worker_id = %self.worker_id, "worker paused by policy");
                    paused_delay(&self.config)
                }
                Err(PipelineError::InvalidTransition { id, from, .. }) => {
                    report.abandoned += 1;
                    tracing::warn!(step_id = %id, status = %from, "claimed step was resolved elsewhere");
                    Duration::ZERO
                }
                Err(err) if err.is_retriable() => {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    report.transient_errors += 1;
                    let delay = next_delay(&self.config, consecutive_empty, &mut rng);
                    tracing::warn!(error = %err, delay_ms = delay.as_millis(), "transient store error, backing off");
                    delay
                }
                Err(err) => return Err(err),
            };

            if max_iterations.is_some_and(|max| report.iterations >= max) {
                break;
            }
            sleep_unless_stopped(stop, delay);
        }

        tracing::info!(
            worker_id = %self.worker_id,
            iterations = report.iterations,
            claimed = report.claimed,
            "worker stopped"
        );
        Ok(report)
    }
}

/// Delay before the next poll after `consecutive_empty` idle polls.
///
/// The base interval holds until `max_empty_polls` is exceeded, then grows
/// by `backoff_multiplier` per extra idle poll up to `max_backoff_ms`.
/// Uniform jitter in `[0, jitter_ms]` is added on top.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn next_delay<R: Rng>(config: &WorkerConfig, consecutive_empty: u32, rng: &mut R) -> Duration {
    let base = config.poll_interval_ms as f64;
    let extra = consecutive_empty.saturating_sub(config.max_empty_polls);
    let scaled = if extra == 0 {
        base
    } else {
        base * config
            .backoff_multiplier
            .powi(i32::try_from(extra).unwrap_or(i32::MAX))
    };
    let capped = scaled.min(config.max_backoff_ms as f64).max(0.0) as u64;

    let jitter = if config.jitter_ms == 0 {
        0
    } else {
        rng.gen_range(0..=config.jitter_ms)
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

fn paused_delay(config: &WorkerConfig) -> Duration {
    Duration::from_millis(
        config
            .poll_interval_ms
            .saturating_mul(u64::from(config.disabled_sleep_multiplier)),
    )
}

fn sleep_unless_stopped(stop: &AtomicBool, delay: Duration) {
    let deadline = Instant::now() + delay;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
    }
}
