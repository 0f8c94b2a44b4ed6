use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::ResilienceSection;
use crate::resilience::{FailureKind, FailureRecord};
use crate::surface::SurfaceFactory;

use super::{Agent, SupervisorError};

const CONTEXT: &str = "supervisor";

/// Top-level crash layer: whatever escapes [`Agent::tick`] tears the browser
/// down, and after a cool-down the agent starts again from `LoggedOut`.
///
/// The conversation registry and scheduler bookkeeping live in the agent and
/// survive restarts.
pub struct Supervisor<F: SurfaceFactory> {
    factory: F,
    agent: Agent,
    cooldown: Duration,
    max_restarts: Option<u32>,
    restarts: u32,
}

impl<F: SurfaceFactory> Supervisor<F> {
    pub fn new(factory: F, agent: Agent, config: &ResilienceSection) -> Self {
        Self {
            factory,
            agent,
            cooldown: Duration::from_secs(config.restart_cooldown_secs),
            max_restarts: config.max_restarts,
            restarts: 0,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Keeps the agent alive. Returns only when `max_restarts` is exhausted.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        loop {
            let failure = self.run_generation().await;

            if let Some(max) = self.max_restarts {
                if self.restarts >= max {
                    error!(
                        target: "supervisor",
                        restarts = self.restarts,
                        error = %failure.message,
                        "restart budget exhausted"
                    );
                    return Err(SupervisorError::RestartsExhausted {
                        restarts: self.restarts,
                        last_failure: failure.message,
                    });
                }
            }

            self.restarts += 1;
            self.agent.record_restart(&failure, self.cooldown);
            error!(
                target: "supervisor",
                restarts = self.restarts,
                kind = %failure.kind,
                error = %failure.message,
                cooldown_secs = self.cooldown.as_secs(),
                "agent crashed, restarting after cool-down"
            );
            sleep(self.cooldown).await;
        }
    }

    /// One launch-run-teardown cycle; returns the failure that ended it.
    async fn run_generation(&mut self) -> FailureRecord {
        let mut surface = match self.factory.launch().await {
            Ok(surface) => surface,
            Err(err) => {
                return FailureRecord::new(
                    FailureKind::Unknown,
                    CONTEXT,
                    format!("surface launch failed: {err}"),
                )
            }
        };
        info!(target: "supervisor", restarts = self.restarts, "agent generation started");

        let err = self.agent.run_until_escalation(surface.as_mut()).await;
        let failure = FailureRecord::from_agent_error(&err, CONTEXT);
        if let Err(shutdown_err) = surface.shutdown().await {
            warn!(target: "supervisor", error = %shutdown_err, "surface shutdown failed");
        }
        // The login belonged to the torn-down browser.
        self.agent.reset_session();
        failure
    }
}
