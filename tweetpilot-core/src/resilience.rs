use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::AgentError;
use crate::config::ResilienceSection;
use crate::surface::SurfaceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ElementNotFound,
    GenerationFailure,
    SurfaceFault,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ElementNotFound => "element_not_found",
            FailureKind::GenerationFailure => "generation_failure",
            FailureKind::SurfaceFault => "surface_fault",
            FailureKind::Unknown => "unknown",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::ElementNotFound)
    }

    /// Failures the per-job wrapper cannot contain; the supervisor restarts.
    pub fn escalates(&self) -> bool {
        matches!(self, FailureKind::Unknown)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct FailureClassifier;

impl FailureClassifier {
    pub fn surface(error: &SurfaceError) -> FailureKind {
        match error {
            SurfaceError::ElementTimeout { .. } => FailureKind::Timeout,
            SurfaceError::ElementNotFound(_) => FailureKind::ElementNotFound,
            SurfaceError::Navigation { message, .. } => {
                if message.to_lowercase().contains("timeout") {
                    FailureKind::Timeout
                } else {
                    FailureKind::SurfaceFault
                }
            }
            SurfaceError::Cdp(message) => {
                let text = message.to_lowercase();
                if text.contains("timeout") {
                    FailureKind::Timeout
                } else {
                    FailureKind::SurfaceFault
                }
            }
            SurfaceError::Io(_) | SurfaceError::Configuration(_) => FailureKind::SurfaceFault,
            SurfaceError::Launch(_) | SurfaceError::Disconnected(_) | SurfaceError::Unexpected(_) => {
                FailureKind::Unknown
            }
        }
    }

    pub fn agent(error: &AgentError) -> FailureKind {
        match error {
            AgentError::Surface(source) | AgentError::Authentication { source } => {
                Self::surface(source)
            }
            AgentError::SessionExpired { .. } => FailureKind::SurfaceFault,
            AgentError::Panicked(_) => FailureKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub occurred_at: DateTime<Utc>,
    pub context: String,
    pub conversation_id: Option<String>,
    pub message: String,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            occurred_at: Utc::now(),
            context: context.into(),
            conversation_id: None,
            message: message.into(),
        }
    }

    pub fn from_agent_error(error: &AgentError, context: impl Into<String>) -> Self {
        Self::new(FailureClassifier::agent(error), context, error.to_string())
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Exponential backoff with a per-kind floor and a shared ceiling.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    transient_floor: Duration,
    fault_floor: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(transient_floor: Duration, fault_floor: Duration, ceiling: Duration) -> Self {
        Self {
            transient_floor,
            fault_floor,
            ceiling: ceiling.max(transient_floor).max(fault_floor),
        }
    }

    pub fn from_config(config: &ResilienceSection) -> Self {
        Self::new(
            Duration::from_secs(config.transient_floor_secs),
            Duration::from_secs(config.fault_floor_secs),
            Duration::from_secs(config.ceiling_secs),
        )
    }

    pub fn floor(&self, kind: FailureKind) -> Duration {
        if kind.is_transient() {
            self.transient_floor
        } else {
            self.fault_floor
        }
    }

    /// Delay before retrying after `consecutive_failures` failures in a row.
    pub fn delay(&self, kind: FailureKind, consecutive_failures: u32) -> Duration {
        let floor = self.floor(kind);
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        floor
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .clamp(floor, self.ceiling)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_surface_errors() {
        let timeout = SurfaceError::ElementTimeout {
            selector: "#x".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(FailureClassifier::surface(&timeout), FailureKind::Timeout);
        assert_eq!(
            FailureClassifier::surface(&SurfaceError::ElementNotFound("#x".into())),
            FailureKind::ElementNotFound
        );
        assert_eq!(
            FailureClassifier::surface(&SurfaceError::Navigation {
                url: "https://example.com".into(),
                message: "net::ERR_CONNECTION_RESET".into(),
            }),
            FailureKind::SurfaceFault
        );
        assert_eq!(
            FailureClassifier::surface(&SurfaceError::Disconnected("ws closed".into())),
            FailureKind::Unknown
        );
    }

    #[test]
    fn authentication_failure_takes_kind_of_cause() {
        let err = AgentError::Authentication {
            source: SurfaceError::ElementTimeout {
                selector: "input[name='password']".into(),
                timeout: Duration::from_secs(15),
            },
        };
        assert_eq!(FailureClassifier::agent(&err), FailureKind::Timeout);
        assert_eq!(
            FailureClassifier::agent(&AgentError::SessionExpired {
                url: "https://twitter.com/login".into()
            }),
            FailureKind::SurfaceFault
        );
    }

    #[test]
    fn backoff_doubles_between_floor_and_ceiling() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(120),
            Duration::from_secs(600),
        );
        assert_eq!(policy.delay(FailureKind::Timeout, 1), Duration::from_secs(30));
        assert_eq!(policy.delay(FailureKind::Timeout, 2), Duration::from_secs(60));
        assert_eq!(policy.delay(FailureKind::Timeout, 3), Duration::from_secs(120));
        assert_eq!(policy.delay(FailureKind::Timeout, 10), Duration::from_secs(600));
        assert_eq!(policy.delay(FailureKind::SurfaceFault, 1), Duration::from_secs(120));
        assert_eq!(policy.delay(FailureKind::GenerationFailure, 3), Duration::from_secs(480));
        assert_eq!(policy.delay(FailureKind::SurfaceFault, 40), Duration::from_secs(600));
    }

    #[test]
    fn zero_failures_still_waits_the_floor() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.delay(FailureKind::ElementNotFound, 0),
            Duration::from_secs(30)
        );
    }
}
