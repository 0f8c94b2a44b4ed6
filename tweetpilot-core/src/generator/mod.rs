use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::GeneratorSection;

pub type GenerationResult<T> = Result<T, GenerationError>;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generator returned no content")]
    Empty,
    #[error("generator timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit open, generator calls suspended")]
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Reply,
    Post,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub kind: PromptKind,
    pub system_framing: String,
    pub user_context: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn reply(config: &GeneratorSection, message: &str) -> Self {
        Self {
            kind: PromptKind::Reply,
            system_framing: config.reply_framing.clone(),
            user_context: message.to_string(),
            max_tokens: config.reply_max_tokens,
            temperature: config.reply_temperature,
        }
    }

    pub fn post(config: &GeneratorSection) -> Self {
        Self {
            kind: PromptKind::Post,
            system_framing: config.post_framing.clone(),
            user_context: config.post_prompt.clone(),
            max_tokens: config.post_max_tokens,
            temperature: config.post_temperature,
        }
    }
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> GenerationResult<String>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &GeneratorSection, api_key: impl Into<String>) -> Self {
        Self::new(config.endpoint.clone(), config.model.clone(), api_key)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> GenerationResult<String> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_framing,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_context,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatCompletionResponse = serde_json::from_slice(&response.bytes().await?)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(GenerationError::Empty)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            open_for: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    outcomes: VecDeque<bool>,
    state: CircuitState,
    open_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

enum CircuitDecision {
    Proceed,
    ShortCircuit,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            outcomes: VecDeque::with_capacity(config.window_size),
            state: CircuitState::Closed,
            open_until: None,
        }
    }

    fn before_call(&mut self, now: Instant) -> CircuitDecision {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => CircuitDecision::Proceed,
            CircuitState::Open => match self.open_until {
                Some(until) if now < until => CircuitDecision::ShortCircuit,
                _ => {
                    self.state = CircuitState::HalfOpen;
                    CircuitDecision::Proceed
                }
            },
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        match self.state {
            CircuitState::HalfOpen => {
                if success {
                    self.state = CircuitState::Closed;
                    self.outcomes.clear();
                } else {
                    self.trip(now);
                }
            }
            CircuitState::Closed => {
                self.push_outcome(success);
                if self.should_trip() {
                    self.trip(now);
                }
            }
            CircuitState::Open => {
                if !success {
                    self.trip(now);
                }
            }
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() == self.config.window_size.max(1) {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    // Only trips once the window is full so a single early failure does not
    // suspend the generator.
    fn should_trip(&self) -> bool {
        if self.outcomes.len() < self.config.window_size.max(1) {
            return false;
        }
        let failures = self.outcomes.iter().filter(|outcome| !**outcome).count();
        let rate = failures as f64 / self.outcomes.len() as f64;
        rate > self.config.failure_threshold
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.open_until = Some(now + self.config.open_for);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "reason")]
pub enum TextSource {
    Generated,
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedText {
    pub text: String,
    pub source: TextSource,
}

impl GeneratedText {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, TextSource::Fallback(_))
    }
}

/// Wraps a generator with a deadline, a circuit breaker and fallback text.
///
/// [`GuardedGenerator::generate_or`] never fails: every error is logged and
/// replaced by the caller's fallback string.
#[derive(Clone)]
pub struct GuardedGenerator {
    inner: Arc<dyn ContentGenerator>,
    deadline: Duration,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl GuardedGenerator {
    pub fn new(
        inner: Arc<dyn ContentGenerator>,
        deadline: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            inner,
            deadline,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(breaker))),
        }
    }

    pub fn from_config(inner: Arc<dyn ContentGenerator>, config: &GeneratorSection) -> Self {
        Self::new(
            inner,
            Duration::from_secs(config.deadline_secs.max(1)),
            CircuitBreakerConfig {
                window_size: config.breaker_window,
                failure_threshold: config.breaker_failure_threshold,
                open_for: Duration::from_secs(config.breaker_open_secs),
            },
        )
    }

    pub async fn try_generate(&self, request: GenerationRequest) -> GenerationResult<String> {
        let now = Instant::now();
        if let Ok(mut breaker) = self.breaker.lock() {
            if let CircuitDecision::ShortCircuit = breaker.before_call(now) {
                return Err(GenerationError::CircuitOpen);
            }
        }
        let result = match timeout(self.deadline, self.inner.generate(request)).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(GenerationError::Empty),
            Ok(Ok(text)) => Ok(text.trim().to_string()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(GenerationError::Timeout(self.deadline)),
        };
        if let Ok(mut breaker) = self.breaker.lock() {
            breaker.record(now, result.is_ok());
        }
        result
    }

    pub async fn generate_or(&self, request: GenerationRequest, fallback: &str) -> GeneratedText {
        let kind = request.kind;
        match self.try_generate(request).await {
            Ok(text) => {
                debug!(target: "generator", kind = ?kind, chars = text.chars().count(), "text generated");
                GeneratedText {
                    text,
                    source: TextSource::Generated,
                }
            }
            Err(err) => {
                warn!(
                    target: "generator",
                    kind = ?kind,
                    error = %err,
                    failure_kind = "generation_failure",
                    "generation failed, using fallback text"
                );
                GeneratedText {
                    text: fallback.to_string(),
                    source: TextSource::Fallback(err.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticGenerator {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentGenerator for StaticGenerator {
        async fn generate(&self, _request: GenerationRequest) -> GenerationResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => Ok(text.clone()),
                None => Err(GenerationError::Status {
                    status: 503,
                    body: "overloaded".into(),
                }),
            }
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::reply(&GeneratorSection::default(), "hello")
    }

    #[tokio::test]
    async fn generated_text_is_trimmed() {
        let generator = GuardedGenerator::new(
            Arc::new(StaticGenerator {
                reply: Some("  hi there \n".into()),
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
            CircuitBreakerConfig::default(),
        );
        let text = generator.generate_or(request(), "fallback").await;
        assert_eq!(text.text, "hi there");
        assert_eq!(text.source, TextSource::Generated);
    }

    #[tokio::test]
    async fn blank_generation_falls_back() {
        let generator = GuardedGenerator::new(
            Arc::new(StaticGenerator {
                reply: Some("   ".into()),
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
            CircuitBreakerConfig::default(),
        );
        let text = generator.generate_or(request(), "fallback").await;
        assert_eq!(text.text, "fallback");
        assert!(text.is_fallback());
    }

    #[tokio::test]
    async fn circuit_breaker_short_circuits_after_full_window_of_failures() {
        let inner = Arc::new(StaticGenerator {
            reply: None,
            calls: AtomicUsize::new(0),
        });
        let generator = GuardedGenerator::new(
            inner.clone(),
            Duration::from_secs(1),
            CircuitBreakerConfig {
                window_size: 3,
                failure_threshold: 0.5,
                open_for: Duration::from_secs(60),
            },
        );
        for _ in 0..3 {
            assert!(generator.generate_or(request(), "fb").await.is_fallback());
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        let err = generator.try_generate(request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::CircuitOpen));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            window_size: 1,
            failure_threshold: 0.0,
            open_for: Duration::from_millis(0),
        });
        let now = Instant::now();
        breaker.record(now, false);
        assert_eq!(breaker.state, CircuitState::Open);
        assert!(matches!(breaker.before_call(now), CircuitDecision::Proceed));
        assert_eq!(breaker.state, CircuitState::HalfOpen);
        breaker.record(now, true);
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    #[test]
    fn post_request_uses_post_framing() {
        let config = GeneratorSection::default();
        let request = GenerationRequest::post(&config);
        assert_eq!(request.kind, PromptKind::Post);
        assert_eq!(request.user_context, config.post_prompt);
        assert_eq!(request.max_tokens, 50);
    }
}
