//! Authentication state machine for the single account the agent drives.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentError, AgentResult};
use crate::config::{AccountSection, Credentials, SelectorSet, TimeoutSection};
use crate::journal::AgentJournal;
use crate::metrics::AgentMetrics;
use crate::surface::{AutomationSurface, SurfaceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    Authenticating,
    Active,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::LoggedOut => "logged_out",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub state: SessionState,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::LoggedOut,
            last_activity_at: None,
        }
    }
}

pub struct SessionManager {
    session: Session,
    credentials: Credentials,
    account: AccountSection,
    selectors: SelectorSet,
    timeouts: TimeoutSection,
    login_patterns: Vec<Regex>,
    diagnostics_dir: Option<PathBuf>,
    journal: Option<Arc<AgentJournal>>,
}

impl SessionManager {
    pub fn new(
        credentials: Credentials,
        account: AccountSection,
        selectors: SelectorSet,
        timeouts: TimeoutSection,
    ) -> Self {
        // Invalid patterns are rejected by AgentConfig::validate.
        let login_patterns = account
            .login_url_patterns
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self {
            session: Session::default(),
            credentials,
            account,
            selectors,
            timeouts,
            login_patterns,
            diagnostics_dir: None,
            journal: None,
        }
    }

    pub fn with_diagnostics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.diagnostics_dir = Some(dir.into());
        self
    }

    pub fn with_journal(mut self, journal: Arc<AgentJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn is_active(&self) -> bool {
        self.session.state == SessionState::Active
    }

    pub fn touch(&mut self) {
        self.session.last_activity_at = Some(Utc::now());
    }

    /// Returns immediately when already active; otherwise runs the credential
    /// sequence once. A failed attempt leaves the session in `Authenticating`
    /// and the next call tries again.
    pub async fn ensure_active(
        &mut self,
        surface: &mut dyn AutomationSurface,
        metrics: &mut AgentMetrics,
    ) -> AgentResult<()> {
        if self.is_active() {
            return Ok(());
        }
        if self.session.state != SessionState::Authenticating {
            self.transition(SessionState::Authenticating);
        }

        match self.authenticate(surface).await {
            Ok(()) => {
                metrics.record_auth_attempt(true);
                self.touch();
                self.transition(SessionState::Active);
                Ok(())
            }
            Err(source) => {
                metrics.record_auth_attempt(false);
                warn!(
                    target: "session",
                    error = %source,
                    state = %self.session.state,
                    "authentication failed"
                );
                self.capture_diagnostics(surface, "auth-failure").await;
                Err(AgentError::Authentication { source })
            }
        }
    }

    async fn authenticate(&mut self, surface: &mut dyn AutomationSurface) -> SurfaceResult<()> {
        let step = self.timeouts.login_step();
        info!(target: "session", url = %self.account.login_url, "starting login sequence");
        surface.navigate(&self.account.login_url).await?;

        let identity = surface.wait_for(&self.selectors.identity_field, step).await?;
        surface.type_text(&identity, &self.credentials.identity).await?;
        surface.submit(&identity).await?;

        let secret = surface.wait_for(&self.selectors.secret_field, step).await?;
        surface.type_text(&secret, &self.credentials.secret).await?;
        surface.submit(&secret).await?;

        surface
            .wait_for(&self.selectors.post_login_landmark, step)
            .await?;
        Ok(())
    }

    /// Navigation used by jobs. Landing on a login page marks the session expired.
    pub async fn navigate(
        &mut self,
        surface: &mut dyn AutomationSurface,
        url: &str,
    ) -> AgentResult<()> {
        surface.navigate(url).await?;
        let current = surface.current_url().await?;
        if self.is_login_url(&current) {
            self.expire();
            return Err(AgentError::SessionExpired { url: current });
        }
        self.touch();
        Ok(())
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_patterns.iter().any(|pattern| pattern.is_match(url))
    }

    pub fn expire(&mut self) {
        if self.session.state == SessionState::Active {
            self.transition(SessionState::Expired);
        }
    }

    /// Back to `LoggedOut`; used when the surface behind the session is replaced.
    pub fn reset(&mut self) {
        if self.session.state != SessionState::LoggedOut {
            self.transition(SessionState::LoggedOut);
        }
        self.session.last_activity_at = None;
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.session.state;
        self.session.state = to;
        info!(target: "session", from = %from, to = %to, "session state transition");
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_transition(from.as_str(), to.as_str()) {
                warn!(target: "session", error = %err, "failed to journal session transition");
            }
        }
    }

    pub async fn capture_diagnostics(&self, surface: &mut dyn AutomationSurface, label: &str) {
        let Some(dir) = &self.diagnostics_dir else {
            return;
        };
        let path = dir.join(format!("{label}-{}.png", Utc::now().format("%Y%m%dT%H%M%S")));
        match surface.screenshot(&path).await {
            Ok(()) => info!(target: "session", path = %path.display(), "diagnostic screenshot saved"),
            Err(err) => warn!(
                target: "session",
                error = %err,
                "failed to capture diagnostic screenshot"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(
            Credentials::new("bot", "secret", "key"),
            AccountSection::default(),
            SelectorSet::default(),
            TimeoutSection::default(),
        )
    }

    #[test]
    fn starts_logged_out() {
        let manager = manager();
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.session().last_activity_at.is_none());
    }

    #[test]
    fn login_urls_are_detected() {
        let manager = manager();
        assert!(manager.is_login_url("https://twitter.com/login"));
        assert!(manager.is_login_url("https://twitter.com/login?redirect_after_login=%2Fmessages"));
        assert!(manager.is_login_url("https://twitter.com/i/flow/login"));
        assert!(!manager.is_login_url("https://twitter.com/messages"));
        assert!(!manager.is_login_url("https://twitter.com/loginhelp/articles"));
    }

    #[test]
    fn expire_only_applies_to_active_sessions() {
        let mut manager = manager();
        manager.expire();
        assert_eq!(manager.state(), SessionState::LoggedOut);
        manager.transition(SessionState::Active);
        manager.expire();
        assert_eq!(manager.state(), SessionState::Expired);
        manager.reset();
        assert_eq!(manager.state(), SessionState::LoggedOut);
    }
}
