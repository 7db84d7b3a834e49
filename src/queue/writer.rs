use super::element::ELEMENT_HEADER_LENGTH;
use super::element_queue::ElementQueue;
use super::reader::into_io_error;
use crate::storage::{Result, StorageError};
use std::io::{self, Write};

/// Appends elements to an [`ElementQueue`].
///
/// Bytes written are collected into the current element, which is committed by
/// [`next`](Self::next). Dropping the writer discards an uncommitted element and leaves the
/// queue unchanged.
pub struct ElementWriter<'a> {
    queue: &'a mut ElementQueue,
    current: Vec<u8>,
    elements_written: usize,
}

impl<'a> ElementWriter<'a> {
    pub(crate) fn new(queue: &'a mut ElementQueue) -> Self {
        Self {
            queue,
            current: Vec::new(),
            elements_written: 0,
        }
    }

    /// Add bytes to the current element.
    ///
    /// Fails with [`StorageError::QueueFull`] once the element can no longer fit in the queue.
    /// The current element is discarded in that case.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.queue.require_open()?;

        let element_length = (self.current.len() + data.len()) as u64;
        let needed = self.queue.used_bytes() + ELEMENT_HEADER_LENGTH + element_length;
        let maximum = self.queue.maximum_file_size().max(self.queue.file_size());
        if needed > maximum {
            self.current.clear();
            return Err(StorageError::QueueFull { needed, maximum });
        }

        self.current.extend_from_slice(data);
        Ok(())
    }

    /// Commit the current element. Does nothing if no bytes were written since the last
    /// commit.
    pub fn next(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let result = self.queue.append_element(&self.current);
        self.current.clear();
        result?;
        self.elements_written += 1;
        Ok(())
    }

    /// Number of bytes in the uncommitted element.
    pub fn pending_len(&self) -> usize {
        self.current.len()
    }

    /// Elements committed by this writer.
    pub fn elements_written(&self) -> usize {
        self.elements_written
    }

    /// Commit the current element and flush the queue file to disk. Returns the number of
    /// elements written.
    pub fn finish(mut self) -> Result<usize> {
        self.next()?;
        self.queue.flush()?;
        Ok(self.elements_written)
    }
}

impl Write for ElementWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.queue.flush().map_err(into_io_error)
    }
}
