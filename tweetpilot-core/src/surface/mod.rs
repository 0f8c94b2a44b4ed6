//! The browser capability the orchestrator drives.
//!
//! Everything above this module talks to [`AutomationSurface`] only, so the
//! Chromium adapter can be swapped for a scripted double in tests.

mod chromium;
mod error;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

pub use chromium::{ChromiumLauncher, ChromiumSurface};
pub use error::{SurfaceError, SurfaceResult};

/// Opaque reference to an element located on the current page.
///
/// Handles are only valid until the next navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    id: u64,
    selector: String,
}

impl ElementHandle {
    pub fn new(id: u64, selector: impl Into<String>) -> Self {
        Self {
            id,
            selector: selector.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }
}

#[async_trait(?Send)]
pub trait AutomationSurface {
    async fn navigate(&mut self, url: &str) -> SurfaceResult<()>;

    /// Polls for `selector` until it appears or `timeout` elapses.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> SurfaceResult<ElementHandle>;

    async fn find_all(&mut self, selector: &str) -> SurfaceResult<Vec<ElementHandle>>;

    async fn type_text(&mut self, element: &ElementHandle, text: &str) -> SurfaceResult<()>;

    async fn click(&mut self, element: &ElementHandle) -> SurfaceResult<()>;

    /// Presses Enter inside the element.
    async fn submit(&mut self, element: &ElementHandle) -> SurfaceResult<()>;

    async fn text(&mut self, element: &ElementHandle) -> SurfaceResult<String>;

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>>;

    async fn current_url(&mut self) -> SurfaceResult<String>;

    async fn screenshot(&mut self, path: &Path) -> SurfaceResult<()>;

    async fn shutdown(self: Box<Self>) -> SurfaceResult<()>;
}

/// Builds fresh surfaces; the supervisor relaunches through this after a crash.
#[async_trait(?Send)]
pub trait SurfaceFactory {
    async fn launch(&self) -> SurfaceResult<Box<dyn AutomationSurface>>;
}
