mod registry;

use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentResult, JobContext};
use crate::config::{AccountSection, ConversationSection, GeneratorSection, SelectorSet, TimeoutSection};
use crate::generator::GenerationRequest;
use crate::journal::RemediationAction;
use crate::resilience::{FailureKind, FailureRecord};

pub use registry::{
    normalize, ConversationRecord, ConversationRegistry, Fingerprint, ReplyDecision,
};

pub const JOB_NAME: &str = "check_messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoMessages,
    EmptyMessage,
    AlreadyAnswered,
    OwnReply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConversationOutcome {
    Replied { fallback: bool },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub listed: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub fallbacks: usize,
    pub duration_ms: u64,
}

pub struct ConversationProcessor {
    inbox_url: String,
    selectors: SelectorSet,
    timeouts: TimeoutSection,
    config: ConversationSection,
    generator: GeneratorSection,
    registry: ConversationRegistry,
    pacer: Pacer,
}

impl ConversationProcessor {
    pub fn new(
        account: &AccountSection,
        selectors: SelectorSet,
        timeouts: TimeoutSection,
        config: ConversationSection,
        generator: GeneratorSection,
    ) -> Self {
        let pacer = Pacer::new(config.pacing_ms);
        Self {
            inbox_url: account.inbox_url.clone(),
            selectors,
            timeouts,
            config,
            generator,
            registry: ConversationRegistry::new(),
            pacer,
        }
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    /// One message-check cycle over at most `max_per_cycle` conversations.
    ///
    /// A failure inside one conversation is logged and the batch moves on;
    /// only failures that invalidate the whole page (inbox not loading, an
    /// expired session, a dead browser) end the cycle early.
    pub async fn run(&mut self, ctx: &mut JobContext<'_>) -> AgentResult<CycleReport> {
        let start = Instant::now();
        ctx.ensure_active().await?;

        let targets = self.list_conversations(ctx).await?;
        let mut report = CycleReport {
            listed: targets.len(),
            ..Default::default()
        };
        debug!(target: "conversations", listed = report.listed, "conversations listed");

        for (index, id) in targets.iter().enumerate() {
            if index > 0 {
                self.pacer.wait().await;
            }
            match self.process_conversation(ctx, id).await {
                Ok(ConversationOutcome::Replied { fallback }) => {
                    report.replied += 1;
                    if fallback {
                        report.fallbacks += 1;
                    }
                }
                Ok(ConversationOutcome::Skipped(reason)) => {
                    report.skipped += 1;
                    ctx.metrics.record_reply_skipped();
                    debug!(target: "conversations", conversation = %id, reason = ?reason, "conversation skipped");
                }
                Err(err) => {
                    let failure = FailureRecord::from_agent_error(&err, JOB_NAME).with_conversation(id);
                    if aborts_cycle(&err, failure.kind) {
                        return Err(err);
                    }
                    report.failed += 1;
                    ctx.metrics.record_reply_failure();
                    warn!(
                        target: "conversations",
                        conversation = %id,
                        kind = %failure.kind,
                        error = %err,
                        "conversation failed, will retry next cycle"
                    );
                    ctx.journal_failure(&failure, &RemediationAction::Contained);
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            target: "conversations",
            listed = report.listed,
            replied = report.replied,
            skipped = report.skipped,
            failed = report.failed,
            fallbacks = report.fallbacks,
            duration_ms = report.duration_ms,
            "message check finished"
        );
        Ok(report)
    }

    async fn list_conversations(&self, ctx: &mut JobContext<'_>) -> AgentResult<Vec<String>> {
        ctx.navigate(&self.inbox_url).await?;
        if let Err(err) = ctx
            .surface
            .wait_for(&self.selectors.conversation_list, self.timeouts.page_load())
            .await
        {
            ctx.session.capture_diagnostics(ctx.surface, "inbox-load").await;
            return Err(err.into());
        }

        let links = ctx.surface.find_all(&self.selectors.conversation_link).await?;
        let mut targets: Vec<String> = Vec::new();
        for link in &links {
            if targets.len() >= self.config.max_per_cycle {
                break;
            }
            match ctx.surface.attribute(link, "href").await? {
                Some(href) if !href.trim().is_empty() => {
                    let href = href.trim().to_string();
                    if !targets.contains(&href) {
                        targets.push(href);
                    }
                }
                _ => warn!(target: "conversations", selector = link.selector(), "conversation link without href skipped"),
            }
        }
        Ok(targets)
    }

    async fn process_conversation(
        &mut self,
        ctx: &mut JobContext<'_>,
        id: &str,
    ) -> AgentResult<ConversationOutcome> {
        let url = resolve_href(&self.inbox_url, id);
        ctx.navigate(&url).await?;
        // The composer marks a loaded thread; an empty thread has no entries to wait on.
        let composer = ctx
            .surface
            .wait_for(&self.selectors.message_composer, self.timeouts.element())
            .await?;
        let entries = ctx.surface.find_all(&self.selectors.message_entry).await?;
        let Some(latest) = entries.last() else {
            return Ok(ConversationOutcome::Skipped(SkipReason::NoMessages));
        };
        let message = normalize(&ctx.surface.text(latest).await?);
        if message.is_empty() {
            return Ok(ConversationOutcome::Skipped(SkipReason::EmptyMessage));
        }

        let fingerprint = Fingerprint::of(&message);
        match self.registry.decide(id, &fingerprint) {
            ReplyDecision::AlreadyAnswered => {
                return Ok(ConversationOutcome::Skipped(SkipReason::AlreadyAnswered))
            }
            ReplyDecision::OwnReply => return Ok(ConversationOutcome::Skipped(SkipReason::OwnReply)),
            ReplyDecision::Reply => {}
        }

        info!(target: "conversations", conversation = %id, fingerprint = %fingerprint, "new inbound message");
        let reply = ctx
            .generator
            .generate_or(
                GenerationRequest::reply(&self.generator, &message),
                &self.generator.fallback_reply,
            )
            .await;
        if reply.is_fallback() {
            ctx.metrics.record_fallback();
            let failure = FailureRecord::new(
                FailureKind::GenerationFailure,
                JOB_NAME,
                format!("{:?}", reply.source),
            )
            .with_conversation(id);
            ctx.journal_failure(&failure, &RemediationAction::Fallback);
        }

        ctx.surface.type_text(&composer, &reply.text).await?;
        ctx.surface.submit(&composer).await?;

        self.registry
            .record_reply(id, fingerprint, Some(Fingerprint::of(&reply.text)));
        ctx.metrics.record_reply_sent();
        ctx.session.touch();
        info!(
            target: "conversations",
            conversation = %id,
            fallback = reply.is_fallback(),
            chars = reply.text.chars().count(),
            "reply sent"
        );
        Ok(ConversationOutcome::Replied {
            fallback: reply.is_fallback(),
        })
    }
}

fn aborts_cycle(error: &AgentError, kind: FailureKind) -> bool {
    kind.escalates() || matches!(error, AgentError::SessionExpired { .. })
}

fn resolve_href(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(href))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| href.to_string())
}

struct Pacer {
    range: (u64, u64),
}

impl Pacer {
    fn new(range: [u64; 2]) -> Self {
        Self {
            range: (range[0].min(range[1]), range[0].max(range[1])),
        }
    }

    async fn wait(&self) -> u64 {
        if self.range.1 == 0 {
            return 0;
        }
        let delay = rand::thread_rng().gen_range(self.range.0..=self.range.1);
        sleep(Duration::from_millis(delay)).await;
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_hrefs_resolve_against_inbox() {
        assert_eq!(
            resolve_href("https://twitter.com/messages", "/messages/123-456"),
            "https://twitter.com/messages/123-456"
        );
        assert_eq!(
            resolve_href("https://twitter.com/messages", "https://x.com/messages/9"),
            "https://x.com/messages/9"
        );
    }

    #[test]
    fn only_page_level_failures_abort_the_cycle() {
        let expired = AgentError::SessionExpired {
            url: "https://twitter.com/login".into(),
        };
        assert!(aborts_cycle(&expired, FailureKind::SurfaceFault));
        let timeout = AgentError::Surface(crate::surface::SurfaceError::ElementTimeout {
            selector: "composer".into(),
            timeout: Duration::from_secs(1),
        });
        assert!(!aborts_cycle(&timeout, FailureKind::Timeout));
        assert!(aborts_cycle(
            &AgentError::Panicked("boom".into()),
            FailureKind::Unknown
        ));
    }
}
