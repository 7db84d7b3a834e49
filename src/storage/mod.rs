pub mod error;
pub mod header;
pub mod ring;

pub use error::{Result, StorageError};
pub use header::{MINIMUM_LENGTH, QUEUE_HEADER_LENGTH, QueueFileHeader};
pub use ring::RingBufferStorage;
