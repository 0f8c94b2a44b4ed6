use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const IDENTITY_ENV: &str = "TWITTER_USERNAME";
pub const SECRET_ENV: &str = "TWITTER_PASSWORD";
pub const GENERATOR_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentConfig {
    pub account: AccountSection,
    pub browser: BrowserSection,
    pub selectors: SelectorSet,
    pub timeouts: TimeoutSection,
    pub schedule: ScheduleSection,
    pub conversations: ConversationSection,
    pub generator: GeneratorSection,
    pub resilience: ResilienceSection,
    pub observability: ObservabilitySection,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schedule.post_interval_secs == 0 || self.schedule.message_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule intervals must be greater than zero".into(),
            ));
        }
        if self.schedule.tick_millis == 0 {
            return Err(ConfigError::Invalid("schedule.tick_millis must be > 0".into()));
        }
        if self.conversations.max_per_cycle == 0 {
            return Err(ConfigError::Invalid(
                "conversations.max_per_cycle must be at least 1".into(),
            ));
        }
        if self.resilience.transient_floor_secs > self.resilience.ceiling_secs
            || self.resilience.fault_floor_secs > self.resilience.ceiling_secs
        {
            return Err(ConfigError::Invalid(
                "resilience floors must not exceed the ceiling".into(),
            ));
        }
        for url in [
            &self.account.login_url,
            &self.account.inbox_url,
            &self.account.compose_url,
        ] {
            url::Url::parse(url)
                .map_err(|err| ConfigError::Invalid(format!("invalid url {url}: {err}")))?;
        }
        for pattern in &self.account.login_url_patterns {
            regex::Regex::new(pattern).map_err(|err| {
                ConfigError::Invalid(format!("invalid login url pattern {pattern}: {err}"))
            })?;
        }
        if self.generator.fallback_reply.trim().is_empty()
            || self.generator.fallback_post.trim().is_empty()
        {
            return Err(ConfigError::Invalid("fallback texts must not be empty".into()));
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountSection {
    pub login_url: String,
    pub inbox_url: String,
    pub compose_url: String,
    /// Regexes matched against the current URL; a hit after navigation means the
    /// session was lost.
    pub login_url_patterns: Vec<String>,
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            login_url: "https://twitter.com/login".into(),
            inbox_url: "https://twitter.com/messages".into(),
            compose_url: "https://twitter.com/compose/tweet".into(),
            login_url_patterns: vec![r"/login(\?|$)".into(), r"/i/flow/login".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub disable_dev_shm: bool,
    pub window_size: [u32; 2],
    pub user_agent: Option<String>,
    pub extra_args: Vec<String>,
    pub request_timeout_secs: Option<u64>,
    pub typing_delay_ms: [u64; 2],
    pub poll_interval_ms: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: "/usr/local/bin/google-chrome".into(),
            headless: true,
            sandbox: false,
            disable_gpu: true,
            disable_dev_shm: true,
            window_size: [1366, 768],
            user_agent: None,
            extra_args: Vec::new(),
            request_timeout_secs: Some(30),
            typing_delay_ms: [0, 0],
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    pub identity_field: String,
    pub secret_field: String,
    pub post_login_landmark: String,
    pub conversation_list: String,
    pub conversation_link: String,
    pub message_entry: String,
    pub message_composer: String,
    pub post_text_area: String,
    pub post_submit: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            identity_field: "input[name='text']".into(),
            secret_field: "input[name='password']".into(),
            post_login_landmark: "[data-testid='SideNav_NewTweet_Button']".into(),
            conversation_list: "[data-testid='DM_Conversation_List']".into(),
            conversation_link: "a[href*='/messages/']".into(),
            message_entry: "div[data-testid='messageEntry']".into(),
            message_composer: "div[data-testid='dmComposerTextInput']".into(),
            post_text_area: "div[data-testid='tweetTextarea_0']".into(),
            post_submit: "div[data-testid='tweetButtonInline']".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub login_step_secs: u64,
    pub element_secs: u64,
    pub page_load_secs: u64,
}

impl TimeoutSection {
    pub fn login_step(&self) -> Duration {
        Duration::from_secs(self.login_step_secs)
    }

    pub fn element(&self) -> Duration {
        Duration::from_secs(self.element_secs)
    }

    pub fn page_load(&self) -> Duration {
        Duration::from_secs(self.page_load_secs)
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            login_step_secs: 15,
            element_secs: 10,
            page_load_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub tick_millis: u64,
    pub post_interval_secs: u64,
    pub message_interval_secs: u64,
    pub run_on_start: bool,
    pub jitter_secs: u64,
    pub post_enabled: bool,
    pub messages_enabled: bool,
    /// Seed for the jitter RNG; unset seeds from entropy.
    pub jitter_seed: Option<u64>,
}

impl ScheduleSection {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn post_interval(&self) -> Duration {
        Duration::from_secs(self.post_interval_secs)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_secs(self.message_interval_secs)
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            post_interval_secs: 3600,
            message_interval_secs: 60,
            run_on_start: true,
            jitter_secs: 0,
            post_enabled: true,
            messages_enabled: true,
            jitter_seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub max_per_cycle: usize,
    pub pacing_ms: [u64; 2],
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_per_cycle: 5,
            pacing_ms: [1500, 3000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorSection {
    pub endpoint: String,
    pub model: String,
    pub deadline_secs: u64,
    pub breaker_window: usize,
    pub breaker_failure_threshold: f64,
    pub breaker_open_secs: u64,
    pub reply_framing: String,
    pub reply_max_tokens: u32,
    pub reply_temperature: f32,
    pub fallback_reply: String,
    pub post_framing: String,
    pub post_prompt: String,
    pub post_max_tokens: u32,
    pub post_temperature: f32,
    pub post_max_chars: usize,
    pub fallback_post: String,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-3.5-turbo".into(),
            deadline_secs: 30,
            breaker_window: 10,
            breaker_failure_threshold: 0.5,
            breaker_open_secs: 300,
            reply_framing: "You are a sarcastic and funny bot specialised in personal development."
                .into(),
            reply_max_tokens: 100,
            reply_temperature: 0.7,
            fallback_reply: "Sorry, I can't answer right now.".into(),
            post_framing:
                "You are a Twitter bot that writes funny, motivating tweets about personal development."
                    .into(),
            post_prompt: "Give me one funny and motivating tweet.".into(),
            post_max_tokens: 50,
            post_temperature: 0.8,
            post_max_chars: 280,
            fallback_post: "A small dose of motivation... or not!".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub transient_floor_secs: u64,
    pub fault_floor_secs: u64,
    pub ceiling_secs: u64,
    pub restart_cooldown_secs: u64,
    pub max_restarts: Option<u32>,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            transient_floor_secs: 30,
            fault_floor_secs: 120,
            ceiling_secs: 1800,
            restart_cooldown_secs: 60,
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub failure_log: Option<String>,
    pub journal_db: Option<String>,
    pub diagnostics_dir: Option<String>,
}

/// Account and generator secrets read from the environment at startup.
#[derive(Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: String,
    pub generator_api_key: String,
}

impl Credentials {
    pub fn new(
        identity: impl Into<String>,
        secret: impl Into<String>,
        generator_api_key: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
            generator_api_key: generator_api_key.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::MissingCredential(name))
        };
        Ok(Self {
            identity: read(IDENTITY_ENV)?,
            secret: read(SECRET_ENV)?,
            generator_api_key: read(GENERATOR_KEY_ENV)?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("generator_api_key", &"<redacted>")
            .finish()
    }
}

pub fn load_agent_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    let config: AgentConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/agent.toml");
        let config = load_agent_config(path).expect("config should parse");
        assert_eq!(config.schedule.post_interval_secs, 3600);
        assert_eq!(config.conversations.max_per_cycle, 5);
        assert!(config.browser.headless);
        assert!(!config.account.login_url_patterns.is_empty());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule.tick(), Duration::from_secs(1));
        assert_eq!(config.generator.model, "gpt-3.5-turbo");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config: AgentConfig = toml::from_str("[schedule]\nmessage_interval_secs = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let err = Credentials::from_lookup(|name| match name {
            IDENTITY_ENV => Some("bot".into()),
            SECRET_ENV => Some("   ".into()),
            _ => Some("key".into()),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(SECRET_ENV)));
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let credentials = Credentials::new("bot", "hunter2", "sk-123");
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("bot"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sk-123"));
    }
}
