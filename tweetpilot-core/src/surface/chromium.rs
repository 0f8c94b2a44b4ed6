use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::BrowserSection;

use super::error::{SurfaceError, SurfaceResult};
use super::{AutomationSurface, ElementHandle, SurfaceFactory};

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    config: Arc<BrowserSection>,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrowserSection {
        &self.config
    }

    pub async fn launch_surface(&self) -> SurfaceResult<ChromiumSurface> {
        let chromium_config = self.build_chromium_config()?;
        info!(
            target: "surface",
            executable = %self.config.executable_path,
            headless = self.config.headless,
            width = self.config.window_size[0],
            height = self.config.window_size[1],
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| SurfaceError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(target: "surface", error = %err, "chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await
            .map_err(|err| SurfaceError::Launch(err.to_string()))?;

        Ok(ChromiumSurface {
            browser,
            page,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            elements: HashMap::new(),
            next_element_id: 0,
        })
    }

    fn build_chromium_config(&self) -> SurfaceResult<ChromiumConfig> {
        let [width, height] = self.config.window_size;
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.executable_path)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_secs {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if self.config.disable_dev_shm {
            args.push("--disable-dev-shm-usage".into());
        }
        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        args.push("--no-first-run".into());
        args.push("--password-store=basic".into());
        args.extend(self.config.extra_args.iter().cloned());

        builder = builder.args(args);
        builder.build().map_err(SurfaceError::Configuration)
    }
}

#[async_trait(?Send)]
impl SurfaceFactory for ChromiumLauncher {
    async fn launch(&self) -> SurfaceResult<Box<dyn AutomationSurface>> {
        Ok(Box::new(self.launch_surface().await?))
    }
}

/// One Chromium instance with a single tab.
#[derive(Debug)]
pub struct ChromiumSurface {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<BrowserSection>,
    elements: HashMap<u64, Element>,
    next_element_id: u64,
}

impl ChromiumSurface {
    fn register(&mut self, selector: &str, element: Element) -> ElementHandle {
        let id = self.next_element_id;
        self.next_element_id += 1;
        self.elements.insert(id, element);
        ElementHandle::new(id, selector)
    }

    fn element(&self, handle: &ElementHandle) -> SurfaceResult<&Element> {
        self.elements.get(&handle.id()).ok_or_else(|| {
            SurfaceError::ElementNotFound(format!("stale handle for {}", handle.selector()))
        })
    }

    fn typing_delay(&self) -> Duration {
        let [low, high] = self.config.typing_delay_ms;
        if high == 0 {
            return Duration::ZERO;
        }
        let (low, high) = (low.min(high), low.max(high));
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

#[async_trait(?Send)]
impl AutomationSurface for ChromiumSurface {
    async fn navigate(&mut self, url: &str) -> SurfaceResult<()> {
        self.elements.clear();
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SurfaceError::Configuration)?;
        let navigation = async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        navigation.await.map_err(|err| match SurfaceError::from(err) {
            SurfaceError::Disconnected(message) => SurfaceError::Disconnected(message),
            other => SurfaceError::Navigation {
                url: url.to_string(),
                message: other.to_string(),
            },
        })
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> SurfaceResult<ElementHandle> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        loop {
            match self.page.find_element(selector).await {
                Ok(element) => return Ok(self.register(selector, element)),
                Err(err) => {
                    let err = SurfaceError::from(err);
                    if matches!(err, SurfaceError::Disconnected(_)) {
                        return Err(err);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(SurfaceError::ElementTimeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            sleep(poll).await;
        }
    }

    async fn find_all(&mut self, selector: &str) -> SurfaceResult<Vec<ElementHandle>> {
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(chromiumoxide::error::CdpError::NotFound) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(elements
            .into_iter()
            .map(|element| self.register(selector, element))
            .collect())
    }

    async fn type_text(&mut self, element: &ElementHandle, text: &str) -> SurfaceResult<()> {
        let delay = self.typing_delay();
        let target = self.element(element)?;
        target.click().await?;
        if delay.is_zero() {
            target.type_str(text).await?;
            return Ok(());
        }
        for ch in text.chars() {
            target.type_str(ch.to_string()).await?;
            sleep(self.typing_delay()).await;
        }
        Ok(())
    }

    async fn click(&mut self, element: &ElementHandle) -> SurfaceResult<()> {
        self.element(element)?.click().await?;
        Ok(())
    }

    async fn submit(&mut self, element: &ElementHandle) -> SurfaceResult<()> {
        self.element(element)?.press_key("Enter").await?;
        Ok(())
    }

    async fn text(&mut self, element: &ElementHandle) -> SurfaceResult<String> {
        Ok(self
            .element(element)?
            .inner_text()
            .await?
            .unwrap_or_default())
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>> {
        Ok(self.element(element)?.attribute(name).await?)
    }

    async fn current_url(&mut self) -> SurfaceResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn screenshot(&mut self, path: &Path) -> SurfaceResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.page
            .save_screenshot(ScreenshotParams::builder().build(), path)
            .await?;
        Ok(())
    }

    async fn shutdown(self: Box<Self>) -> SurfaceResult<()> {
        let mut this = self;
        info!(target: "surface", "shutting down chromium instance");
        this.elements.clear();
        if let Err(err) = this.browser.close().await {
            warn!(target: "surface", error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = this.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(target: "surface", error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSurface {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(target: "surface", "ChromiumSurface dropped without explicit shutdown");
            }
        }
    }
}
