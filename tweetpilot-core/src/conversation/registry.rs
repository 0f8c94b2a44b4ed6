use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of a message with whitespace runs collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let normalized = normalize(text);
        Self(hex::encode(Sha256::digest(normalized.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub last_seen: Fingerprint,
    pub last_reply: Option<Fingerprint>,
    pub replied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    Reply,
    AlreadyAnswered,
    OwnReply,
}

/// Which conversations were answered, and for which inbound message.
///
/// In memory only; a restarted process may answer a conversation once more.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    records: HashMap<String, ConversationRecord>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&self, id: &str, fingerprint: &Fingerprint) -> ReplyDecision {
        match self.records.get(id) {
            Some(record) if &record.last_seen == fingerprint => ReplyDecision::AlreadyAnswered,
            Some(record) if record.last_reply.as_ref() == Some(fingerprint) => {
                ReplyDecision::OwnReply
            }
            _ => ReplyDecision::Reply,
        }
    }

    pub fn record_reply(&mut self, id: &str, inbound: Fingerprint, reply: Option<Fingerprint>) {
        self.records.insert(
            id.to_string(),
            ConversationRecord {
                id: id.to_string(),
                last_seen: inbound,
                last_reply: reply,
                replied_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&ConversationRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
