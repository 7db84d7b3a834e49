use crate::domain::Topic;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent { count: usize },
    Failed,
}

/// Receipt of a single upload attempt for a topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSendResult {
    pub topic: Topic,
    #[serde(flatten)]
    pub outcome: SendOutcome,
    pub timestamp: DateTime<Utc>,
}

impl TopicSendResult {
    pub fn success(topic: Topic, count: usize) -> Self {
        Self {
            topic,
            outcome: SendOutcome::Sent { count },
            timestamp: Utc::now(),
        }
    }

    pub fn failure(topic: Topic) -> Self {
        Self {
            topic,
            outcome: SendOutcome::Failed,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SendOutcome::Sent { .. })
    }

    /// Number of records sent, zero for a failed attempt.
    pub fn count(&self) -> usize {
        match self.outcome {
            SendOutcome::Sent { count } => count,
            SendOutcome::Failed => 0,
        }
    }
}
