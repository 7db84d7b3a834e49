//! Domain types shared across the crate:
//! - `Record` / `RecordKey`: a telemetry record and its producer
//! - `RecordBatch`: records read together from the head of a cache
//! - `Topic`: a named, versioned record stream

pub mod record;
pub mod topic;

pub use record::{Record, RecordBatch, RecordKey};
pub use topic::{Topic, TopicParseError};
