use thiserror::Error;

use crate::surface::SurfaceError;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("authentication failed: {source}")]
    Authentication { source: SurfaceError },
    #[error("session expired, redirected to {url}")]
    SessionExpired { url: String },
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("job panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("giving up after {restarts} restarts, last failure: {last_failure}")]
    RestartsExhausted { restarts: u32, last_failure: String },
}
