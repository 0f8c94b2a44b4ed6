use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub auth_attempts: u64,
    pub auth_failures: u64,
    pub replies_sent: u64,
    pub replies_skipped: u64,
    pub reply_failures: u64,
    pub posts_published: u64,
    pub post_failures: u64,
    pub fallbacks_used: u64,
    pub job_failures: u64,
    pub restarts: u64,
}

impl AgentMetrics {
    pub fn record_auth_attempt(&mut self, success: bool) {
        self.auth_attempts = self.auth_attempts.saturating_add(1);
        if !success {
            self.auth_failures = self.auth_failures.saturating_add(1);
        }
    }

    pub fn record_reply_sent(&mut self) {
        self.replies_sent = self.replies_sent.saturating_add(1);
    }

    pub fn record_reply_skipped(&mut self) {
        self.replies_skipped = self.replies_skipped.saturating_add(1);
    }

    pub fn record_reply_failure(&mut self) {
        self.reply_failures = self.reply_failures.saturating_add(1);
    }

    pub fn record_post(&mut self, success: bool) {
        if success {
            self.posts_published = self.posts_published.saturating_add(1);
        } else {
            self.post_failures = self.post_failures.saturating_add(1);
        }
    }

    pub fn record_fallback(&mut self) {
        self.fallbacks_used = self.fallbacks_used.saturating_add(1);
    }

    pub fn record_job_failure(&mut self) {
        self.job_failures = self.job_failures.saturating_add(1);
    }

    pub fn record_restart(&mut self) {
        self.restarts = self.restarts.saturating_add(1);
    }

    pub fn auth_success_rate(&self) -> f64 {
        if self.auth_attempts == 0 {
            0.0
        } else {
            ((self.auth_attempts - self.auth_failures) as f64 / self.auth_attempts as f64) * 100.0
        }
    }
}
