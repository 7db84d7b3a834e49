use super::error::{Result, StorageError};
use super::header::{MINIMUM_LENGTH, QUEUE_HEADER_LENGTH, is_valid_length};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Chunk size used when relocating data inside the file.
const MOVE_CHUNK_SIZE: u64 = 8192;

/// Circular byte storage over a single file.
///
/// The first [`QUEUE_HEADER_LENGTH`] bytes are reserved for the queue header. Reads and
/// writes that cross the end of the file continue right after the header.
pub struct RingBufferStorage {
    file: File,
    path: PathBuf,
    length: u64,
    maximum_length: u64,
    preexisting: bool,
    closed: AtomicBool,
}

impl RingBufferStorage {
    /// Open `path`, creating it with the minimum length if it does not exist yet.
    pub fn open(path: impl AsRef<Path>, maximum_length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let maximum_length = round_down_length(maximum_length)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current_length = file.metadata()?.len();
        let (length, preexisting) = if current_length == 0 {
            file.set_len(MINIMUM_LENGTH)?;
            (MINIMUM_LENGTH, false)
        } else if current_length < QUEUE_HEADER_LENGTH {
            return Err(StorageError::corrupt(format!(
                "file length {current_length} is shorter than the queue header"
            )));
        } else {
            (current_length, true)
        };

        Ok(Self {
            file,
            path,
            length,
            maximum_length,
            preexisting,
            closed: AtomicBool::new(false),
        })
    }

    /// Current length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn minimum_length(&self) -> u64 {
        MINIMUM_LENGTH
    }

    pub fn maximum_length(&self) -> u64 {
        self.maximum_length
    }

    /// Change the maximum length. The value is rounded down to a power-of-two multiple of
    /// the minimum length. A maximum below the current length only prevents growth.
    pub fn set_maximum_length(&mut self, maximum_length: u64) -> Result<()> {
        self.maximum_length = round_down_length(maximum_length)?;
        Ok(())
    }

    /// Whether the file existed with content when the storage was opened.
    pub fn is_preexisting(&self) -> bool {
        self.preexisting
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map a virtual position past the end of the file back into the body.
    pub fn wrap_position(&self, position: u64) -> Result<u64> {
        let wrapped = if position < self.length {
            position
        } else {
            QUEUE_HEADER_LENGTH + position - self.length
        };
        if wrapped >= self.length {
            return Err(StorageError::InvalidArgument(format!(
                "position {position} invalid for storage of length {}",
                self.length
            )));
        }
        Ok(wrapped)
    }

    /// Read `buffer.len()` bytes at `position`, wrapping around the end of the file.
    /// Returns the wrapped position after the read.
    pub fn read(&self, position: u64, buffer: &mut [u8]) -> Result<u64> {
        self.require_open()?;
        let count = buffer.len() as u64;
        self.check_transfer_size(count)?;

        let position = self.wrap_position(position)?;
        let linear_part = self.length - position;
        if count <= linear_part {
            self.read_at(position, buffer)?;
        } else {
            let (head, tail) = buffer.split_at_mut(linear_part as usize);
            self.read_at(position, head)?;
            self.read_at(QUEUE_HEADER_LENGTH, tail)?;
        }
        self.wrap_position(position + count)
    }

    /// Write `data` at `position`, wrapping around the end of the file.
    /// Returns the wrapped position after the write.
    pub fn write(&mut self, position: u64, data: &[u8]) -> Result<u64> {
        self.require_open()?;
        let count = data.len() as u64;
        self.check_transfer_size(count)?;

        let position = self.wrap_position(position)?;
        let linear_part = self.length - position;
        if count <= linear_part {
            self.write_at(position, data)?;
        } else {
            let (head, tail) = data.split_at(linear_part as usize);
            self.write_at(position, head)?;
            self.write_at(QUEUE_HEADER_LENGTH, tail)?;
        }
        self.wrap_position(position + count)
    }

    /// Copy `count` bytes from `src` to `dst`, overwriting the destination. Overlapping
    /// ranges are copied in the direction that preserves the source content.
    pub fn move_range(&mut self, src: u64, dst: u64, count: u64) -> Result<()> {
        self.require_open()?;
        if count == 0 {
            return Ok(());
        }
        self.check_transfer_size(count)?;
        let body = QUEUE_HEADER_LENGTH..self.length;
        if !body.contains(&src) || !body.contains(&dst) {
            return Err(StorageError::InvalidArgument(format!(
                "move src={src} dst={dst} count={count} is invalid for storage of length {}",
                self.length
            )));
        }

        // distance from src to dst in ring order
        let body_length = self.length - QUEUE_HEADER_LENGTH;
        let distance = (dst + body_length - src) % body_length;
        if distance == 0 {
            return Ok(());
        }
        let backwards = distance < count;

        let mut buffer = vec![0u8; count.min(MOVE_CHUNK_SIZE) as usize];

        let mut done = 0;
        while done < count {
            let chunk = (count - done).min(MOVE_CHUNK_SIZE);
            let offset = if backwards { count - done - chunk } else { done };
            let slice = &mut buffer[..chunk as usize];
            self.read(self.wrap_position(src + offset)?, slice)?;
            self.write(self.wrap_position(dst + offset)?, slice)?;
            done += chunk;
        }
        Ok(())
    }

    /// Resize the file. Growing is limited by the maximum length; shrinking is limited by
    /// the number of bytes in use.
    pub fn resize(&mut self, new_length: u64, used_bytes: u64) -> Result<()> {
        self.require_open()?;
        if new_length == self.length {
            return Ok(());
        }
        if !is_valid_length(new_length) {
            return Err(StorageError::Capacity {
                requested: new_length,
                reason: format!("length must be a power-of-two multiple of {MINIMUM_LENGTH}"),
            });
        }
        if new_length > self.length && new_length > self.maximum_length {
            return Err(StorageError::Capacity {
                requested: new_length,
                reason: format!("exceeds maximum length {}", self.maximum_length),
            });
        }
        if new_length < used_bytes {
            return Err(StorageError::Capacity {
                requested: new_length,
                reason: format!("{used_bytes} bytes are in use"),
            });
        }

        debug!("Resizing {} from {} to {}", self, self.length, new_length);
        self.file.sync_data()?;
        self.file.set_len(new_length)?;
        self.file.sync_all()?;
        self.length = new_length;
        Ok(())
    }

    /// Flush written data to the storage medium.
    pub fn flush(&self) -> Result<()> {
        self.require_open()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush and mark the storage closed. Further operations fail with
    /// [`StorageError::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn check_transfer_size(&self, count: u64) -> Result<()> {
        if count + QUEUE_HEADER_LENGTH > self.length {
            return Err(StorageError::InvalidArgument(format!(
                "transfer of {count} bytes exceeds storage length {}",
                self.length
            )));
        }
        Ok(())
    }

    fn require_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_at(&self, position: u64, buffer: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(buffer)?;
        Ok(())
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(data)?;
        Ok(())
    }
}

impl fmt::Display for RingBufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        write!(f, "RingBufferStorage<{name}>[length={}]", self.length)
    }
}

impl fmt::Debug for RingBufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferStorage")
            .field("path", &self.path)
            .field("length", &self.length)
            .field("maximum_length", &self.maximum_length)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Largest `MINIMUM_LENGTH * 2^k` not exceeding `length`.
fn round_down_length(length: u64) -> Result<u64> {
    let blocks = length / MINIMUM_LENGTH;
    if blocks == 0 {
        return Err(StorageError::InvalidArgument(format!(
            "maximum length {length} is smaller than minimum length {MINIMUM_LENGTH}"
        )));
    }
    let power = 1u64 << (63 - blocks.leading_zeros());
    Ok(MINIMUM_LENGTH * power)
}
