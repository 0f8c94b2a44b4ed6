//! Two independent recurring jobs evaluated once per tick.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ScheduleSection;
use crate::resilience::{BackoffPolicy, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Post,
    CheckMessages,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Post => "post",
            JobKind::CheckMessages => "check_messages",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "kind")]
pub enum JobOutcome {
    Success,
    Failed(FailureKind),
    Skipped,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub interval: Duration,
    pub enabled: bool,
    pub next_due_at: Instant,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    pub consecutive_failures: u32,
    pub runs: u64,
}

impl ScheduledJob {
    pub fn new(kind: JobKind, interval: Duration, first_due: Instant) -> Self {
        Self {
            kind,
            interval,
            enabled: true,
            next_due_at: first_due,
            last_run_at: None,
            last_outcome: None,
            consecutive_failures: 0,
            runs: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due_at <= now
    }
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    jitter: Duration,
    backoff: BackoffPolicy,
    rng: ChaCha8Rng,
}

impl Scheduler {
    pub fn new(jobs: Vec<ScheduledJob>, backoff: BackoffPolicy) -> Self {
        Self {
            jobs,
            jitter: Duration::ZERO,
            backoff,
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn from_config(config: &ScheduleSection, backoff: BackoffPolicy, now: Instant) -> Self {
        let first_due = |interval: Duration| {
            if config.run_on_start {
                now
            } else {
                now + interval
            }
        };
        let mut post = ScheduledJob::new(
            JobKind::Post,
            config.post_interval(),
            first_due(config.post_interval()),
        );
        post.enabled = config.post_enabled;
        let mut messages = ScheduledJob::new(
            JobKind::CheckMessages,
            config.message_interval(),
            first_due(config.message_interval()),
        );
        messages.enabled = config.messages_enabled;

        let scheduler = Self::new(vec![messages, post], backoff)
            .with_jitter(Duration::from_secs(config.jitter_secs));
        match config.jitter_seed {
            Some(seed) => scheduler.with_seed(seed),
            None => scheduler,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn job(&self, kind: JobKind) -> Option<&ScheduledJob> {
        self.jobs.iter().find(|job| job.kind == kind)
    }

    fn job_mut(&mut self, kind: JobKind) -> Option<&mut ScheduledJob> {
        self.jobs.iter_mut().find(|job| job.kind == kind)
    }

    /// Jobs due at `now`, in registration order. Each appears once no matter
    /// how many intervals were missed.
    pub fn due(&self, now: Instant) -> Vec<JobKind> {
        self.jobs
            .iter()
            .filter(|job| job.is_due(now))
            .map(|job| job.kind)
            .collect()
    }

    pub fn is_enabled(&self, kind: JobKind) -> bool {
        self.job(kind).map(|job| job.enabled).unwrap_or(false)
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.jobs.iter().map(|job| job.next_due_at).min()
    }

    /// Books a finished run and returns the delay until the job is due again.
    pub fn complete(&mut self, kind: JobKind, outcome: JobOutcome, now: Instant) -> Duration {
        let backoff = self.backoff.clone();
        let jitter = self.jitter;
        let offset = self.jitter_offset(jitter);
        let Some(job) = self.job_mut(kind) else {
            return Duration::ZERO;
        };
        job.runs += 1;
        job.last_run_at = Some(Utc::now());
        job.last_outcome = Some(outcome);

        let delay = match outcome {
            JobOutcome::Failed(failure) => {
                job.consecutive_failures = job.consecutive_failures.saturating_add(1);
                backoff.delay(failure, job.consecutive_failures)
            }
            JobOutcome::Success | JobOutcome::Skipped => {
                job.consecutive_failures = 0;
                apply_jitter(job.interval, offset)
            }
        };
        // Anchored on `now`, never on the missed deadline.
        job.next_due_at = now + delay;

        match outcome {
            JobOutcome::Failed(failure) => info!(
                target: "scheduler",
                job = %kind,
                kind = %failure,
                consecutive_failures = job.consecutive_failures,
                retry_in_secs = delay.as_secs(),
                "job failed, backing off"
            ),
            _ => debug!(
                target: "scheduler",
                job = %kind,
                outcome = outcome.label(),
                next_in_secs = delay.as_secs(),
                "job rescheduled"
            ),
        }
        delay
    }

    fn jitter_offset(&mut self, jitter: Duration) -> i64 {
        let span = jitter.as_secs() as i64;
        if span == 0 {
            0
        } else {
            self.rng.gen_range(-span..=span)
        }
    }
}

fn apply_jitter(interval: Duration, offset_secs: i64) -> Duration {
    let shifted = if offset_secs >= 0 {
        interval + Duration::from_secs(offset_secs as u64)
    } else {
        interval.saturating_sub(Duration::from_secs(offset_secs.unsigned_abs()))
    };
    shifted.max(Duration::from_secs(1))
}
