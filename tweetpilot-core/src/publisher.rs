use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentResult, JobContext};
use crate::config::{AccountSection, GeneratorSection, SelectorSet, TimeoutSection};
use crate::generator::GenerationRequest;
use crate::journal::RemediationAction;
use crate::resilience::{FailureKind, FailureRecord};

pub const JOB_NAME: &str = "post";

#[derive(Debug, Clone, Serialize)]
pub struct PostReport {
    pub text: String,
    pub fallback: bool,
    pub truncated: bool,
}

pub struct PostPublisher {
    compose_url: String,
    selectors: SelectorSet,
    timeouts: TimeoutSection,
    generator: GeneratorSection,
}

impl PostPublisher {
    pub fn new(
        account: &AccountSection,
        selectors: SelectorSet,
        timeouts: TimeoutSection,
        generator: GeneratorSection,
    ) -> Self {
        Self {
            compose_url: account.compose_url.clone(),
            selectors,
            timeouts,
            generator,
        }
    }

    /// Generates one post (or falls back) and submits it. Stateless per call.
    pub async fn run(&self, ctx: &mut JobContext<'_>) -> AgentResult<PostReport> {
        ctx.ensure_active().await?;

        let post = ctx
            .generator
            .generate_or(
                GenerationRequest::post(&self.generator),
                &self.generator.fallback_post,
            )
            .await;
        if post.is_fallback() {
            ctx.metrics.record_fallback();
            let failure = FailureRecord::new(
                FailureKind::GenerationFailure,
                JOB_NAME,
                format!("{:?}", post.source),
            );
            ctx.journal_failure(&failure, &RemediationAction::Fallback);
        }
        let (text, truncated) = truncate_chars(&post.text, self.generator.post_max_chars);

        if let Err(err) = self.submit(ctx, &text).await {
            ctx.metrics.record_post(false);
            warn!(target: "publisher", error = %err, "post submission failed");
            return Err(err);
        }
        ctx.metrics.record_post(true);
        ctx.session.touch();
        info!(
            target: "publisher",
            fallback = post.is_fallback(),
            truncated,
            chars = text.chars().count(),
            "post published"
        );
        Ok(PostReport {
            text,
            fallback: post.is_fallback(),
            truncated,
        })
    }

    async fn submit(&self, ctx: &mut JobContext<'_>, text: &str) -> AgentResult<()> {
        ctx.navigate(&self.compose_url).await?;
        let area = ctx
            .surface
            .wait_for(&self.selectors.post_text_area, self.timeouts.element())
            .await?;
        ctx.surface.type_text(&area, text).await?;
        let button = ctx
            .surface
            .wait_for(&self.selectors.post_submit, self.timeouts.element())
            .await?;
        ctx.surface.click(&button).await?;
        Ok(())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    (text.chars().take(max_chars).collect(), true)
}
