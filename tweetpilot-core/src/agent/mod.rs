//! Orchestration: one scheduler tick at a time, every job run wrapped by the
//! failure classifier, escalations handed to the [`Supervisor`].

mod error;
mod supervisor;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{AgentConfig, Credentials};
use crate::conversation::{ConversationProcessor, ConversationRegistry};
use crate::generator::{ContentGenerator, GuardedGenerator};
use crate::journal::{AgentJournal, JobRunEntry, RemediationAction};
use crate::metrics::AgentMetrics;
use crate::publisher::PostPublisher;
use crate::resilience::{BackoffPolicy, FailureRecord};
use crate::scheduler::{JobKind, JobOutcome, Scheduler};
use crate::session::SessionManager;
use crate::surface::AutomationSurface;

pub use error::{AgentError, AgentResult, SupervisorError};
pub use supervisor::Supervisor;

/// Everything a job body may touch during one run.
pub struct JobContext<'a> {
    pub session: &'a mut SessionManager,
    pub surface: &'a mut dyn AutomationSurface,
    pub generator: &'a GuardedGenerator,
    pub metrics: &'a mut AgentMetrics,
    pub journal: Option<&'a AgentJournal>,
}

impl JobContext<'_> {
    pub async fn ensure_active(&mut self) -> AgentResult<()> {
        self.session.ensure_active(self.surface, self.metrics).await
    }

    pub async fn navigate(&mut self, url: &str) -> AgentResult<()> {
        self.session.navigate(self.surface, url).await
    }

    pub fn journal_failure(&self, failure: &FailureRecord, action: &RemediationAction) {
        if let Some(journal) = self.journal {
            if let Err(err) = journal.record_failure(failure, action) {
                warn!(target: "agent", error = %err, "failed to journal failure");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub retry_in: Duration,
}

pub struct Agent {
    session: SessionManager,
    conversations: ConversationProcessor,
    publisher: PostPublisher,
    scheduler: Scheduler,
    generator: GuardedGenerator,
    metrics: AgentMetrics,
    journal: Option<Arc<AgentJournal>>,
    tick: Duration,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        credentials: Credentials,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        let mut session = SessionManager::new(
            credentials,
            config.account.clone(),
            config.selectors.clone(),
            config.timeouts.clone(),
        );
        if let Some(dir) = &config.observability.diagnostics_dir {
            session = session.with_diagnostics_dir(dir);
        }
        let conversations = ConversationProcessor::new(
            &config.account,
            config.selectors.clone(),
            config.timeouts.clone(),
            config.conversations.clone(),
            config.generator.clone(),
        );
        let publisher = PostPublisher::new(
            &config.account,
            config.selectors.clone(),
            config.timeouts.clone(),
            config.generator.clone(),
        );
        let scheduler = Scheduler::from_config(
            &config.schedule,
            BackoffPolicy::from_config(&config.resilience),
            Instant::now(),
        );
        Self {
            session,
            conversations,
            publisher,
            scheduler,
            generator: GuardedGenerator::from_config(generator, &config.generator),
            metrics: AgentMetrics::default(),
            journal: None,
            tick: config.schedule.tick(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<AgentJournal>) -> Self {
        self.session = self.session.with_journal(Arc::clone(&journal));
        self.journal = Some(journal);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &ConversationRegistry {
        self.conversations.registry()
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub fn journal(&self) -> Option<&AgentJournal> {
        self.journal.as_deref()
    }

    /// Drops the authenticated state; the next job logs in from scratch.
    pub fn reset_session(&mut self) {
        self.session.reset();
    }

    pub(crate) fn record_restart(&mut self, failure: &FailureRecord, cooldown: Duration) {
        self.metrics.record_restart();
        if let Some(journal) = &self.journal {
            let action = RemediationAction::Restart {
                cooldown_seconds: cooldown.as_secs(),
            };
            if let Err(err) = journal.record_failure(failure, &action) {
                warn!(target: "agent", error = %err, "failed to journal restart");
            }
        }
    }

    /// Runs every job due now, once each. Contained failures become `Failed`
    /// outcomes; an `Unknown` failure or a panic is returned for the
    /// supervisor to handle.
    pub async fn tick(&mut self, surface: &mut dyn AutomationSurface) -> AgentResult<Vec<JobRun>> {
        let now = Instant::now();
        let mut runs = Vec::new();
        for kind in self.scheduler.due(now) {
            if !self.scheduler.is_enabled(kind) {
                let retry_in = self.scheduler.complete(kind, JobOutcome::Skipped, now);
                self.journal_run(kind, JobOutcome::Skipped, Duration::ZERO, "disabled");
                runs.push(JobRun {
                    kind,
                    outcome: JobOutcome::Skipped,
                    retry_in,
                });
                continue;
            }

            let started = Instant::now();
            let result = AssertUnwindSafe(self.dispatch(kind, &mut *surface))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(AgentError::Panicked(panic_message(panic))));
            let finished = Instant::now();
            let elapsed = finished.duration_since(started);

            match result {
                Ok(detail) => {
                    let retry_in = self.scheduler.complete(kind, JobOutcome::Success, finished);
                    self.journal_run(kind, JobOutcome::Success, elapsed, &detail);
                    runs.push(JobRun {
                        kind,
                        outcome: JobOutcome::Success,
                        retry_in,
                    });
                }
                Err(err) => {
                    let failure = FailureRecord::from_agent_error(&err, kind.name());
                    let outcome = JobOutcome::Failed(failure.kind);
                    let retry_in = self.scheduler.complete(kind, outcome, finished);
                    self.metrics.record_job_failure();
                    warn!(
                        target: "agent",
                        job = %kind,
                        kind = %failure.kind,
                        error = %err,
                        retry_in_secs = retry_in.as_secs(),
                        "job failed"
                    );
                    self.journal_run(kind, outcome, elapsed, &failure.message);
                    if let Some(journal) = &self.journal {
                        let action = RemediationAction::RetryScheduled {
                            delay_seconds: retry_in.as_secs(),
                        };
                        if let Err(err) = journal.record_failure(&failure, &action) {
                            warn!(target: "agent", error = %err, "failed to journal failure");
                        }
                    }
                    if failure.kind.escalates() {
                        return Err(err);
                    }
                    runs.push(JobRun {
                        kind,
                        outcome,
                        retry_in,
                    });
                }
            }
        }
        Ok(runs)
    }

    /// Ticks forever; returns only the failure that escaped the job wrapper.
    pub async fn run_until_escalation(&mut self, surface: &mut dyn AutomationSurface) -> AgentError {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target: "agent",
            tick_ms = self.tick.as_millis() as u64,
            jobs = self.scheduler.jobs().len(),
            "agent loop started"
        );
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick(&mut *surface).await {
                return err;
            }
        }
    }

    async fn dispatch(
        &mut self,
        kind: JobKind,
        surface: &mut dyn AutomationSurface,
    ) -> AgentResult<String> {
        let mut ctx = JobContext {
            session: &mut self.session,
            surface,
            generator: &self.generator,
            metrics: &mut self.metrics,
            journal: self.journal.as_deref(),
        };
        match kind {
            JobKind::Post => {
                let report = self.publisher.run(&mut ctx).await?;
                Ok(serde_json::to_string(&report).unwrap_or_default())
            }
            JobKind::CheckMessages => {
                let report = self.conversations.run(&mut ctx).await?;
                Ok(serde_json::to_string(&report).unwrap_or_default())
            }
        }
    }

    fn journal_run(&self, kind: JobKind, outcome: JobOutcome, elapsed: Duration, detail: &str) {
        if let Some(journal) = &self.journal {
            let entry = JobRunEntry::new(
                kind.name(),
                outcome.label(),
                elapsed.as_millis() as i64,
                detail,
            );
            if let Err(err) = journal.record_run(&entry) {
                warn!(target: "agent", error = %err, "failed to journal job run");
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
