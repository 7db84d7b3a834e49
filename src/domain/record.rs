use super::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies who produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub user_id: String,
    pub source_id: String,
}

impl RecordKey {
    pub fn new(
        project_id: Option<String>,
        user_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            user_id: user_id.into(),
            source_id: source_id.into(),
        }
    }

    /// Whether a record with this key belongs to the given session. Project ids are only
    /// compared when both sides have one.
    pub fn belongs_to(&self, user_id: &str, project_id: Option<&str>) -> bool {
        if self.user_id != user_id {
            return false;
        }
        match (self.project_id.as_deref(), project_id) {
            (Some(own), Some(other)) => own == other,
            _ => true,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project_id {
            Some(project) => write!(f, "{}/{}/{}", project, self.user_id, self.source_id),
            None => write!(f, "{}/{}", self.user_id, self.source_id),
        }
    }
}

/// A single telemetry record. Stored as one JSON document per queue element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub value: Value,
}

impl Record {
    pub fn new(key: RecordKey, value: Value) -> Self {
        Self { key, value }
    }
}

/// Consecutive records of one topic that share a key, as read from the head of a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub topic: Topic,
    pub key: RecordKey,
    pub values: Vec<Value>,
}

impl RecordBatch {
    pub fn new(topic: Topic, key: RecordKey, values: Vec<Value>) -> Self {
        Self { topic, key, values }
    }

    /// Number of records, which equals the number of queue elements the batch covers.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_belongs_to_session() {
        let key = RecordKey::new(Some("radar".to_string()), "user-1", "source-1");
        assert!(key.belongs_to("user-1", Some("radar")));
        assert!(key.belongs_to("user-1", None));
        assert!(!key.belongs_to("user-1", Some("other")));
        assert!(!key.belongs_to("user-2", Some("radar")));

        let key = RecordKey::new(None, "user-1", "source-1");
        assert!(key.belongs_to("user-1", Some("radar")));
    }

    #[test]
    fn test_record_json_omits_missing_project() {
        let record = Record::new(RecordKey::new(None, "u", "s"), json!({"x": 1.5}));
        let encoded = serde_json::to_string(&record).unwrap();
        assert_eq!(
            encoded,
            r#"{"key":{"user_id":"u","source_id":"s"},"value":{"x":1.5}}"#
        );
        let decoded: Record = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
