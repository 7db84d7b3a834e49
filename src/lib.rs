#![warn(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Queue offsets are bounded by the file length
    clippy::missing_errors_doc,       // Internal API
    clippy::missing_panics_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. CacheError in cache module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::doc_markdown              // Internal API
)]

pub mod app;
pub mod cache;
pub mod connection;
pub mod domain;
pub mod error;
pub mod queue;
pub mod sender;
pub mod storage;
pub mod submitter;

// Re-export main types for easy access
pub use app::{App, Config};
pub use cache::{Cache, CacheStore};
pub use connection::{ConnectionChecker, ServerStatus};
pub use error::ConfigError;
pub use queue::ElementQueue;
pub use storage::RingBufferStorage;
pub use submitter::{SubmitterConfig, TopicSendResult, UploadSubmitter};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
