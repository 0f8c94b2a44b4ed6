pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod generator;
pub mod journal;
pub mod metrics;
pub mod publisher;
pub mod resilience;
pub mod scheduler;
pub mod session;
pub mod surface;

pub use agent::{Agent, AgentError, AgentResult, JobContext, JobRun, Supervisor, SupervisorError};
pub use config::{load_agent_config, AgentConfig, Credentials};
pub use conversation::{ConversationProcessor, ConversationRegistry, CycleReport, Fingerprint};
pub use error::{ConfigError, Result};
pub use generator::{
    ContentGenerator, GeneratedText, GenerationError, GenerationRequest, GuardedGenerator,
    OpenAiGenerator, PromptKind, TextSource,
};
pub use journal::{AgentJournal, JobRunEntry, JournalError, RemediationAction};
pub use metrics::AgentMetrics;
pub use publisher::{PostPublisher, PostReport};
pub use resilience::{BackoffPolicy, FailureClassifier, FailureKind, FailureRecord};
pub use scheduler::{JobKind, JobOutcome, ScheduledJob, Scheduler};
pub use session::{Session, SessionManager, SessionState};
pub use surface::{
    AutomationSurface, ChromiumLauncher, ElementHandle, SurfaceError, SurfaceFactory,
    SurfaceResult,
};
