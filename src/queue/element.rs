use crate::storage::{Result, StorageError};

/// Length of the header preceding each element: payload length and a checksum byte.
pub const ELEMENT_HEADER_LENGTH: u64 = 5;

/// Location of a stored element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Element {
    /// Position of the element header.
    pub position: u64,
    /// Payload length in bytes.
    pub length: u32,
}

impl Element {
    pub fn new(position: u64, length: u32) -> Self {
        Self { position, length }
    }

    /// Position right after the payload, before wrapping.
    pub fn next_position(&self) -> u64 {
        self.position + ELEMENT_HEADER_LENGTH + u64::from(self.length)
    }

    pub fn encode_header(&self) -> [u8; ELEMENT_HEADER_LENGTH as usize] {
        let length = self.length.to_be_bytes();
        let mut out = [0u8; ELEMENT_HEADER_LENGTH as usize];
        out[..4].copy_from_slice(&length);
        out[4] = length_checksum(&length);
        out
    }

    /// Decode an element header read at `position`.
    pub fn decode_header(
        position: u64,
        data: &[u8; ELEMENT_HEADER_LENGTH as usize],
    ) -> Result<Self> {
        let mut length = [0u8; 4];
        length.copy_from_slice(&data[..4]);
        let expected = length_checksum(&length);
        if data[4] != expected {
            return Err(StorageError::corrupt(format!(
                "element at {position}: checksum {:#04x} does not match {expected:#04x}",
                data[4]
            )));
        }
        Ok(Self::new(position, u32::from_be_bytes(length)))
    }
}

fn length_checksum(length: &[u8; 4]) -> u8 {
    (crc32fast::hash(length) & 0xff) as u8
}
