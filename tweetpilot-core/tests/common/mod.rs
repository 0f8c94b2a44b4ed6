#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tweetpilot_core::config::{AccountSection, AgentConfig, Credentials, SelectorSet};
use tweetpilot_core::generator::{
    ContentGenerator, GenerationError, GenerationRequest, GenerationResult,
};
use tweetpilot_core::surface::{
    AutomationSurface, ElementHandle, SurfaceError, SurfaceFactory, SurfaceResult,
};

pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.schedule.tick_millis = 1000;
    config.schedule.post_interval_secs = 2 * 3600;
    config.schedule.message_interval_secs = 10 * 60;
    config.schedule.jitter_secs = 0;
    config.conversations.pacing_ms = [0, 0];
    config.generator.deadline_secs = 5;
    config.resilience.restart_cooldown_secs = 5;
    config
}

pub fn credentials() -> Credentials {
    Credentials::new("pilot", "hunter2", "sk-test")
}

#[derive(Debug, Clone)]
pub struct FakeConversation {
    pub href: String,
    pub messages: Vec<String>,
}

/// In-memory stand-in for the social network, shared between the test and
/// every surface opened on it.
#[derive(Debug, Default)]
pub struct WebState {
    pub account: AccountSection,
    pub selectors: SelectorSet,
    pub logged_in: bool,
    pub current_url: String,
    pub conversations: Vec<FakeConversation>,
    pub echo_replies: bool,
    pub login_broken: bool,
    pub inbox_broken: bool,
    pub compose_broken: bool,
    pub disconnect_on_compose: bool,
    pub broken_composers: HashSet<String>,
    pub disconnected: bool,
    pub calls: usize,
    pub navigations: Vec<String>,
    pub typed: HashMap<String, String>,
    pub sent_replies: Vec<(String, String)>,
    pub posts: Vec<String>,
    pub logins: usize,
    pub screenshots: Vec<PathBuf>,
    pub shutdowns: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Web {
    state: Rc<RefCell<WebState>>,
}

impl Web {
    pub fn new() -> Self {
        let web = Self::default();
        web.state.borrow_mut().echo_replies = true;
        web
    }

    pub fn with_conversations(conversations: &[(&str, &[&str])]) -> Self {
        let web = Self::new();
        for (href, messages) in conversations {
            web.add_conversation(href, messages);
        }
        web
    }

    pub fn add_conversation(&self, href: &str, messages: &[&str]) {
        self.state.borrow_mut().conversations.push(FakeConversation {
            href: href.to_string(),
            messages: messages.iter().map(|m| m.to_string()).collect(),
        });
    }

    pub fn push_message(&self, href: &str, message: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(conversation) = state.conversations.iter_mut().find(|c| c.href == href) {
            conversation.messages.push(message.to_string());
        }
    }

    pub fn surface(&self) -> ScriptedSurface {
        ScriptedSurface {
            state: Rc::clone(&self.state),
            next_id: 0,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut WebState)) {
        f(&mut self.state.borrow_mut());
    }

    pub fn calls(&self) -> usize {
        self.state.borrow().calls
    }

    pub fn logins(&self) -> usize {
        self.state.borrow().logins
    }

    pub fn sent_replies(&self) -> Vec<(String, String)> {
        self.state.borrow().sent_replies.clone()
    }

    pub fn posts(&self) -> Vec<String> {
        self.state.borrow().posts.clone()
    }

    pub fn screenshots(&self) -> usize {
        self.state.borrow().screenshots.len()
    }

    pub fn shutdowns(&self) -> usize {
        self.state.borrow().shutdowns
    }

    /// Drops the server-side session; the next navigation lands on the login page.
    pub fn expire_session(&self) {
        self.state.borrow_mut().logged_in = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Login,
    Inbox,
    Compose,
    Conversation(usize),
    Other,
}

pub struct ScriptedSurface {
    state: Rc<RefCell<WebState>>,
    next_id: u64,
}

impl ScriptedSurface {
    fn enter(&self) -> SurfaceResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls += 1;
        if state.disconnected {
            return Err(SurfaceError::Disconnected("websocket closed".into()));
        }
        Ok(())
    }

    fn page(&self) -> Page {
        let state = self.state.borrow();
        let url = state.current_url.as_str();
        if url.starts_with(&state.account.login_url) {
            Page::Login
        } else if url == state.account.inbox_url {
            Page::Inbox
        } else if url == state.account.compose_url {
            Page::Compose
        } else if let Some(index) = state
            .conversations
            .iter()
            .position(|c| url.ends_with(&c.href))
        {
            Page::Conversation(index)
        } else {
            Page::Other
        }
    }

    fn handle(&mut self, selector: &str) -> ElementHandle {
        let id = self.next_id;
        self.next_id += 1;
        ElementHandle::new(id, selector)
    }

    fn timeout(selector: &str, timeout: Duration) -> SurfaceError {
        SurfaceError::ElementTimeout {
            selector: selector.to_string(),
            timeout,
        }
    }
}

#[async_trait(?Send)]
impl AutomationSurface for ScriptedSurface {
    async fn navigate(&mut self, url: &str) -> SurfaceResult<()> {
        self.enter()?;
        let mut state = self.state.borrow_mut();
        state.navigations.push(url.to_string());
        if state.disconnect_on_compose && url == state.account.compose_url {
            state.disconnected = true;
            return Err(SurfaceError::Disconnected("target crashed".into()));
        }
        state.current_url = if url == state.account.login_url || state.logged_in {
            url.to_string()
        } else {
            format!("{}?redirect_after_login=%2F", state.account.login_url)
        };
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> SurfaceResult<ElementHandle> {
        self.enter()?;
        let page = self.page();
        let available = {
            let mut state = self.state.borrow_mut();
            let selectors = state.selectors.clone();
            if selector == selectors.identity_field || selector == selectors.secret_field {
                page == Page::Login && !state.login_broken
            } else if selector == selectors.post_login_landmark {
                let ok = page == Page::Login && !state.login_broken;
                if ok {
                    state.logged_in = true;
                    state.logins += 1;
                }
                ok
            } else if selector == selectors.conversation_list {
                page == Page::Inbox && !state.inbox_broken
            } else if selector == selectors.message_entry {
                match page {
                    Page::Conversation(index) => !state.conversations[index].messages.is_empty(),
                    _ => false,
                }
            } else if selector == selectors.message_composer {
                match page {
                    Page::Conversation(index) => {
                        let href = state.conversations[index].href.clone();
                        !state.broken_composers.contains(&href)
                    }
                    _ => false,
                }
            } else if selector == selectors.post_text_area || selector == selectors.post_submit {
                page == Page::Compose && !state.compose_broken
            } else {
                false
            }
        };
        if available {
            Ok(self.handle(selector))
        } else {
            Err(Self::timeout(selector, timeout))
        }
    }

    async fn find_all(&mut self, selector: &str) -> SurfaceResult<Vec<ElementHandle>> {
        self.enter()?;
        let page = self.page();
        let state = self.state.borrow();
        let count = if selector == state.selectors.conversation_link && page == Page::Inbox {
            state.conversations.len()
        } else if selector == state.selectors.message_entry {
            match page {
                Page::Conversation(index) => state.conversations[index].messages.len(),
                _ => 0,
            }
        } else {
            0
        };
        Ok((0..count as u64)
            .map(|id| ElementHandle::new(id, selector))
            .collect())
    }

    async fn type_text(&mut self, element: &ElementHandle, text: &str) -> SurfaceResult<()> {
        self.enter()?;
        self.state
            .borrow_mut()
            .typed
            .insert(element.selector().to_string(), text.to_string());
        Ok(())
    }

    async fn click(&mut self, element: &ElementHandle) -> SurfaceResult<()> {
        self.enter()?;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if element.selector() == state.selectors.post_submit {
            let text = state
                .typed
                .remove(&state.selectors.post_text_area)
                .unwrap_or_default();
            state.posts.push(text);
        }
        Ok(())
    }

    async fn submit(&mut self, element: &ElementHandle) -> SurfaceResult<()> {
        self.enter()?;
        let page = self.page();
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if element.selector() != state.selectors.message_composer {
            return Ok(());
        }
        let Page::Conversation(index) = page else {
            return Err(SurfaceError::ElementNotFound(element.selector().to_string()));
        };
        let text = state
            .typed
            .remove(&state.selectors.message_composer)
            .unwrap_or_default();
        let href = state.conversations[index].href.clone();
        if state.echo_replies {
            state.conversations[index].messages.push(text.clone());
        }
        state.sent_replies.push((href, text));
        Ok(())
    }

    async fn text(&mut self, element: &ElementHandle) -> SurfaceResult<String> {
        self.enter()?;
        let page = self.page();
        let state = self.state.borrow();
        match page {
            Page::Conversation(index) => state.conversations[index]
                .messages
                .get(element.id() as usize)
                .cloned()
                .ok_or_else(|| SurfaceError::ElementNotFound(element.selector().to_string())),
            _ => Err(SurfaceError::ElementNotFound(element.selector().to_string())),
        }
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> SurfaceResult<Option<String>> {
        self.enter()?;
        let state = self.state.borrow();
        if name != "href" {
            return Ok(None);
        }
        Ok(state
            .conversations
            .get(element.id() as usize)
            .map(|c| c.href.clone()))
    }

    async fn current_url(&mut self) -> SurfaceResult<String> {
        self.enter()?;
        Ok(self.state.borrow().current_url.clone())
    }

    async fn screenshot(&mut self, path: &Path) -> SurfaceResult<()> {
        self.enter()?;
        self.state.borrow_mut().screenshots.push(path.to_path_buf());
        Ok(())
    }

    async fn shutdown(self: Box<Self>) -> SurfaceResult<()> {
        self.state.borrow_mut().shutdowns += 1;
        Ok(())
    }
}

/// Hands out one scripted surface per launch; launching past the script fails.
pub struct ScriptedFactory {
    webs: RefCell<VecDeque<Web>>,
    launches: Cell<usize>,
}

impl ScriptedFactory {
    pub fn new(webs: Vec<Web>) -> Self {
        Self {
            webs: RefCell::new(webs.into()),
            launches: Cell::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.get()
    }
}

#[async_trait(?Send)]
impl SurfaceFactory for ScriptedFactory {
    async fn launch(&self) -> SurfaceResult<Box<dyn AutomationSurface>> {
        self.launches.set(self.launches.get() + 1);
        match self.webs.borrow_mut().pop_front() {
            Some(web) => Ok(Box::new(web.surface())),
            None => Err(SurfaceError::Launch("chrome binary missing".into())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum GeneratorMode {
    Echo,
    Fail,
    Hang,
    Panic,
}

pub struct ScriptedGenerator {
    mode: GeneratorMode,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(mode: GeneratorMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> GenerationResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match self.mode {
            GeneratorMode::Echo => Ok(format!("re: {}", request.user_context)),
            GeneratorMode::Fail => Err(GenerationError::Status {
                status: 503,
                body: "overloaded".into(),
            }),
            GeneratorMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".into())
            }
            GeneratorMode::Panic => panic!("generator exploded"),
        }
    }
}
