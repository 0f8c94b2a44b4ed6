use std::time::Duration;

use thiserror::Error;

pub type SurfaceResult<T> = Result<T, SurfaceError>;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("timeout after {timeout:?} waiting for {selector}")]
    ElementTimeout { selector: String, timeout: Duration },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("browser connection lost: {0}")]
    Disconnected(String),
    #[error("cdp error: {0}")]
    Cdp(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<chromiumoxide::error::CdpError> for SurfaceError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        use chromiumoxide::error::CdpError;
        match err {
            CdpError::NotFound => SurfaceError::ElementNotFound(err.to_string()),
            CdpError::NoResponse | CdpError::ChannelSendError(_) => {
                SurfaceError::Disconnected(err.to_string())
            }
            other => SurfaceError::Cdp(other.to_string()),
        }
    }
}
