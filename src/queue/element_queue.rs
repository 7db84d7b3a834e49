use super::element::{ELEMENT_HEADER_LENGTH, Element};
use super::reader::{ElementIter, ElementReader};
use super::writer::ElementWriter;
use crate::storage::{
    MINIMUM_LENGTH, QUEUE_HEADER_LENGTH, QueueFileHeader, Result, RingBufferStorage, StorageError,
};
use std::fmt;
use std::path::Path;
use tracing::{debug, error};

/// A file-based FIFO queue of variable-length elements.
///
/// Elements are appended through an [`ElementWriter`] and read back in insertion order with
/// [`peek`](Self::peek) or [`iter`](Self::iter). Reading does not remove anything; callers
/// [`remove`](Self::remove) elements once they are processed, so a crash in between leaves
/// them in the queue.
///
/// A modification only becomes visible once the queue header is rewritten. The header stores
/// the logical file length, so an interrupted growth is rolled back on the next open.
pub struct ElementQueue {
    storage: RingBufferStorage,
    header: QueueFileHeader,
    first: Element,
    last: Element,
}

impl ElementQueue {
    /// Open or create the queue file at `path`. The file will not grow beyond
    /// `maximum_size` bytes.
    pub fn open(path: impl AsRef<Path>, maximum_size: u64) -> Result<Self> {
        let mut storage = RingBufferStorage::open(path, maximum_size)?;

        let header = if storage.is_preexisting() {
            let mut data = [0u8; QUEUE_HEADER_LENGTH as usize];
            storage.read(0, &mut data)?;
            QueueFileHeader::decode(&data, storage.length())?
        } else {
            let header = QueueFileHeader::new(storage.length());
            storage.write(0, &header.encode())?;
            storage.flush()?;
            header
        };

        if header.length < storage.length() {
            debug!(
                "Truncating {} to length {} recorded in its header",
                storage, header.length
            );
            storage.resize(header.length, QUEUE_HEADER_LENGTH)?;
        }

        let mut queue = Self {
            storage,
            header,
            first: Element::default(),
            last: Element::default(),
        };
        if queue.header.count > 0 {
            queue.first = queue.read_element(queue.header.first_position)?;
            queue.last = queue.read_element(queue.header.last_position)?;
        }
        Ok(queue)
    }

    /// Number of elements in the queue.
    pub fn len(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    /// Current length of the queue file.
    pub fn file_size(&self) -> u64 {
        self.header.length
    }

    pub fn maximum_file_size(&self) -> u64 {
        self.storage.maximum_length()
    }

    /// Set the size the file may grow to. Values are rounded down to a power-of-two multiple of
    /// the minimum file size. A smaller maximum than the current size only prevents growth.
    pub fn set_maximum_file_size(&mut self, maximum_size: u64) -> Result<()> {
        self.storage.set_maximum_length(maximum_size)
    }

    /// Bytes in use by the header and all stored elements.
    pub fn used_bytes(&self) -> u64 {
        if self.is_empty() {
            return QUEUE_HEADER_LENGTH;
        }
        let first_position = self.header.first_position;
        let wrap_offset = if self.last.position >= first_position {
            QUEUE_HEADER_LENGTH
        } else {
            // newest element lies before the eldest: the ring wraps
            self.header.length
        };
        self.last.next_position() + wrap_offset - first_position
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    /// Start appending elements. Each call to [`ElementWriter::next`] commits one element.
    pub fn element_writer(&mut self) -> Result<ElementWriter<'_>> {
        self.require_open()?;
        Ok(ElementWriter::new(self))
    }

    /// Reader over the eldest element, or `None` if the queue is empty.
    pub fn peek(&self) -> Result<Option<ElementReader<'_>>> {
        self.require_open()?;
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(ElementReader::new(&self.storage, self.first)))
    }

    /// Iterate over all elements from eldest to newest.
    pub fn iter(&self) -> ElementIter<'_> {
        ElementIter::new(self)
    }

    /// Remove the eldest `n` elements.
    pub fn remove(&mut self, n: usize) -> Result<()> {
        self.require_open()?;
        if n == 0 {
            return Ok(());
        }
        let count = self.len();
        if n > count {
            return Err(StorageError::NoSuchElement {
                requested: n,
                available: count,
            });
        }
        if n == count {
            return self.clear();
        }

        let mut new_first = self.first;
        for _ in 0..n {
            let position = self.storage.wrap_position(new_first.next_position())?;
            new_first = self.read_element(position)?;
        }

        let mut header = self.header;
        header.first_position = new_first.position;
        header.count -= n as u32;
        self.first = new_first;

        let result = self.commit_removal(header);
        self.fail_if_fatal(result)
    }

    /// Remove all elements and truncate the file to its minimum size.
    pub fn clear(&mut self) -> Result<()> {
        self.require_open()?;
        let mut header = self.header;
        header.clear();
        header.length = MINIMUM_LENGTH;

        let result = self.write_header(&header).and_then(|()| {
            if self.storage.length() != MINIMUM_LENGTH {
                self.storage.resize(MINIMUM_LENGTH, QUEUE_HEADER_LENGTH)?;
            }
            self.storage.flush()
        });
        self.header = header;
        self.first = Element::default();
        self.last = Element::default();
        self.fail_if_fatal(result)
    }

    /// Flush and close the underlying storage.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }

    pub(crate) fn storage(&self) -> &RingBufferStorage {
        &self.storage
    }

    pub(crate) fn first_element(&self) -> Option<Element> {
        (!self.is_empty()).then_some(self.first)
    }

    pub(crate) fn require_open(&self) -> Result<()> {
        if self.storage.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    /// Append `data` as a single element and commit the header.
    pub(crate) fn append_element(&mut self, data: &[u8]) -> Result<()> {
        self.require_open()?;
        let length = u32::try_from(data.len()).map_err(|_| {
            StorageError::InvalidArgument(format!("element of {} bytes is too large", data.len()))
        })?;
        let needed = self.used_bytes() + ELEMENT_HEADER_LENGTH + u64::from(length);
        let maximum = self.maximum_file_size().max(self.header.length);
        if needed > maximum {
            return Err(StorageError::QueueFull { needed, maximum });
        }

        let result = self.commit_element(data, length, needed);
        self.fail_if_fatal(result)
    }

    fn commit_element(&mut self, data: &[u8], length: u32, needed: u64) -> Result<()> {
        let mut header = self.header;
        let mut position = if self.is_empty() {
            QUEUE_HEADER_LENGTH
        } else {
            self.storage.wrap_position(self.last.next_position())?
        };

        if needed > header.length {
            let mut new_length = header.length;
            while new_length < needed {
                new_length *= 2;
            }
            new_length = new_length.min(self.maximum_file_size());
            position = self.grow(&mut header, new_length, position)?;
        }

        let element = Element::new(position, length);
        let data_position = self.storage.write(position, &element.encode_header())?;
        self.storage.write(data_position, data)?;

        if header.count == 0 {
            header.first_position = position;
            self.first = element;
        }
        header.last_position = position;
        header.count += 1;
        self.write_header(&header)?;

        self.header = header;
        self.last = element;
        Ok(())
    }

    /// Extend the file to `new_length`. If the ring wraps, the wrapped segment
    /// `[QUEUE_HEADER_LENGTH, write_position)` is appended after the old end so the elements
    /// stay contiguous. Returns the relocated write position.
    fn grow(
        &mut self,
        header: &mut QueueFileHeader,
        new_length: u64,
        write_position: u64,
    ) -> Result<u64> {
        let old_length = header.length;
        debug!("Extending {} from {} to {}", self, old_length, new_length);

        let used = self.used_bytes();
        self.storage.resize(new_length, used)?;

        let mut write_position = write_position;
        if header.count > 0 && write_position <= header.first_position {
            let shift = old_length - QUEUE_HEADER_LENGTH;
            let wrapped_bytes = write_position - QUEUE_HEADER_LENGTH;
            self.storage
                .move_range(QUEUE_HEADER_LENGTH, old_length, wrapped_bytes)?;

            if header.last_position < header.first_position {
                header.last_position += shift;
            }
            write_position += shift;
        }
        header.length = new_length;
        Ok(write_position)
    }

    fn commit_removal(&mut self, mut header: QueueFileHeader) -> Result<()> {
        let new_length = self.truncated_length(&header);
        if new_length < header.length {
            debug!("Truncating {} from {} to {}", self, header.length, new_length);
            header.length = new_length;
            self.write_header(&header)?;
            self.header = header;
            let used = self.used_bytes();
            self.storage.resize(new_length, used)?;
        } else {
            self.write_header(&header)?;
            self.header = header;
        }
        self.storage.flush()
    }

    /// Length the file can shrink to after a removal. Only contiguous data is truncated, and
    /// only while it fills at most half of the new length.
    fn truncated_length(&self, header: &QueueFileHeader) -> u64 {
        if header.last_position < header.first_position {
            return header.length;
        }
        let used = self.last.next_position() - header.first_position + QUEUE_HEADER_LENGTH;
        let max_extent = self.last.next_position();

        let mut new_length = header.length;
        let mut goal = new_length / 2;
        while goal >= MINIMUM_LENGTH && max_extent <= goal && used <= goal / 2 {
            new_length = goal;
            goal /= 2;
        }
        new_length
    }

    fn write_header(&mut self, header: &QueueFileHeader) -> Result<()> {
        self.storage.write(0, &header.encode())?;
        Ok(())
    }

    /// Read and verify the element header at `position`.
    pub(crate) fn read_element(&self, position: u64) -> Result<Element> {
        let mut data = [0u8; ELEMENT_HEADER_LENGTH as usize];
        self.storage.read(position, &mut data)?;

        let element = Element::decode_header(position, &data).and_then(|element| {
            let body = self.header.length - QUEUE_HEADER_LENGTH;
            if element.length == 0 || ELEMENT_HEADER_LENGTH + u64::from(element.length) > body {
                Err(StorageError::corrupt(format!(
                    "element at {position} has invalid length {}",
                    element.length
                )))
            } else {
                Ok(element)
            }
        });

        element.inspect_err(|e| {
            error!("Failed to verify element of {}: {}. Closing queue.", self, e);
            let _ = self.storage.close();
        })
    }

    /// Close the queue after an error that leaves the file in an unknown state.
    fn fail_if_fatal(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if !e.is_recoverable() && !matches!(e, StorageError::Closed) {
                error!("Closing {} after error: {}", self, e);
                let _ = self.storage.close();
            }
        }
        result
    }
}

impl fmt::Display for ElementQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ElementQueue<{}>[length={}, size={}, first={}, last={}]",
            self.storage
                .path()
                .file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default(),
            self.header.length,
            self.header.count,
            self.header.first_position,
            self.header.last_position
        )
    }
}

impl fmt::Debug for ElementQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'a> IntoIterator for &'a ElementQueue {
    type Item = Result<ElementReader<'a>>;
    type IntoIter = ElementIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
