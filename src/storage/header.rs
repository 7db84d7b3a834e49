//! Fixed-size queue file header.
//!
//! ```text
//! ┌─────────┬─────────────┬───────────┬──────────────┬─────────────┬──────────┐
//! │ Version │ File length │ Count     │ First offset │ Last offset │ CRC32    │
//! │ (4 B)   │ (8 B)       │ (4 B)     │ (8 B)        │ (8 B)       │ (4 B)    │
//! └─────────┴─────────────┴───────────┴──────────────┴─────────────┴──────────┘
//! ```
//!
//! All integers are big-endian. The checksum covers the first 32 bytes.

use super::error::{Result, StorageError};
use bytes::{Buf, BufMut, BytesMut};

/// Length of the queue header in bytes. Element data starts at this offset.
pub const QUEUE_HEADER_LENGTH: u64 = 36;

/// Smallest file length, one file system block. Every file length is a power-of-two
/// multiple of this value.
pub const MINIMUM_LENGTH: u64 = 4096;

const VERSION: u32 = 1;
const CHECKSUMMED_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFileHeader {
    /// Logical length of the file.
    pub length: u64,
    /// Number of committed elements.
    pub count: u32,
    /// Position of the eldest element.
    pub first_position: u64,
    /// Position of the newest element.
    pub last_position: u64,
}

impl QueueFileHeader {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            count: 0,
            first_position: QUEUE_HEADER_LENGTH,
            last_position: QUEUE_HEADER_LENGTH,
        }
    }

    /// Reset to the empty state, keeping the length.
    pub fn clear(&mut self) {
        self.count = 0;
        self.first_position = QUEUE_HEADER_LENGTH;
        self.last_position = QUEUE_HEADER_LENGTH;
    }

    pub fn encode(&self) -> [u8; QUEUE_HEADER_LENGTH as usize] {
        let mut buf = BytesMut::with_capacity(QUEUE_HEADER_LENGTH as usize);
        buf.put_u32(VERSION);
        buf.put_u64(self.length);
        buf.put_u32(self.count);
        buf.put_u64(self.first_position);
        buf.put_u64(self.last_position);
        let crc = crc32fast::hash(&buf[..CHECKSUMMED_LENGTH]);
        buf.put_u32(crc);

        let mut out = [0u8; QUEUE_HEADER_LENGTH as usize];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode and validate a header read from a file of `file_length` bytes.
    pub fn decode(data: &[u8], file_length: u64) -> Result<Self> {
        if data.len() < QUEUE_HEADER_LENGTH as usize {
            return Err(StorageError::corrupt(format!(
                "header has {} bytes, expected {}",
                data.len(),
                QUEUE_HEADER_LENGTH
            )));
        }

        let mut cursor = &data[..QUEUE_HEADER_LENGTH as usize];
        let version = cursor.get_u32();
        let length = cursor.get_u64();
        let count = cursor.get_u32();
        let first_position = cursor.get_u64();
        let last_position = cursor.get_u64();
        let stored_crc = cursor.get_u32();

        let calculated_crc = crc32fast::hash(&data[..CHECKSUMMED_LENGTH]);
        if stored_crc != calculated_crc {
            return Err(StorageError::corrupt(format!(
                "header checksum {stored_crc:#010x} does not match {calculated_crc:#010x}"
            )));
        }
        if version != VERSION {
            return Err(StorageError::corrupt(format!(
                "unsupported queue file version {version}"
            )));
        }

        let header = Self {
            length,
            count,
            first_position,
            last_position,
        };
        header.validate(file_length)?;
        Ok(header)
    }

    fn validate(&self, file_length: u64) -> Result<()> {
        if self.length > file_length {
            return Err(StorageError::corrupt(format!(
                "header length {} exceeds file length {file_length}",
                self.length
            )));
        }
        if !is_valid_length(self.length) {
            return Err(StorageError::corrupt(format!(
                "length {} is not a power-of-two multiple of {MINIMUM_LENGTH}",
                self.length
            )));
        }
        let in_body = |position: u64| (QUEUE_HEADER_LENGTH..self.length).contains(&position);
        if !in_body(self.first_position) || !in_body(self.last_position) {
            return Err(StorageError::corrupt(format!(
                "element positions first={} last={} fall outside [{QUEUE_HEADER_LENGTH}, {})",
                self.first_position, self.last_position, self.length
            )));
        }
        if self.count == 0
            && (self.first_position != QUEUE_HEADER_LENGTH
                || self.last_position != QUEUE_HEADER_LENGTH)
        {
            return Err(StorageError::corrupt("empty queue has element positions set"));
        }
        Ok(())
    }
}

/// Whether `length` is `MINIMUM_LENGTH * 2^k` for some `k >= 0`.
pub fn is_valid_length(length: u64) -> bool {
    length >= MINIMUM_LENGTH
        && length % MINIMUM_LENGTH == 0
        && (length / MINIMUM_LENGTH).is_power_of_two()
}
