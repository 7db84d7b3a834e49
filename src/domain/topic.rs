use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const FILE_EXTENSION: &str = ".tape";

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid topic '{input}': {reason}")]
pub struct TopicParseError {
    input: String,
    reason: &'static str,
}

/// A named record stream. The version identifies the record schema stored in the queue file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Topic {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Queue file name: `<name>-v<version>.tape`.
    pub fn file_name(&self) -> String {
        format!("{}-v{}{FILE_EXTENSION}", self.name, self.version)
    }

    /// Parse a queue file name produced by [`Topic::file_name`].
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(FILE_EXTENSION)?;
        let (name, version) = stem.rsplit_once("-v")?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, version.parse().ok()?))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Parses `name` or `name@version`.
impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = |reason| TopicParseError {
            input: s.to_string(),
            reason,
        };
        let (name, version) = match s.split_once('@') {
            Some((name, version)) => (
                name,
                version
                    .parse()
                    .map_err(|_| error("version must be a positive integer"))?,
            ),
            None => (s, default_version()),
        };
        if name.is_empty() {
            return Err(error("name is empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(error("name may only contain [A-Za-z0-9._-]"));
        }
        Ok(Self::new(name, version))
    }
}
