use super::element::{ELEMENT_HEADER_LENGTH, Element};
use super::element_queue::ElementQueue;
use crate::storage::{Result, RingBufferStorage, StorageError};
use std::io::{self, Read};

/// Streaming reader over the payload of one element.
pub struct ElementReader<'a> {
    storage: &'a RingBufferStorage,
    position: u64,
    remaining: u64,
    length: u64,
}

impl<'a> ElementReader<'a> {
    pub(crate) fn new(storage: &'a RingBufferStorage, element: Element) -> Self {
        Self {
            storage,
            position: element.position + ELEMENT_HEADER_LENGTH,
            remaining: u64::from(element.length),
            length: u64::from(element.length),
        }
    }

    /// Payload length of the element.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the remaining payload into a new buffer.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.remaining as usize];
        self.read_into(&mut data)?;
        Ok(data)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let count = (buf.len() as u64).min(self.remaining);
        if count == 0 {
            return Ok(0);
        }
        self.position = self
            .storage
            .read(self.position, &mut buf[..count as usize])?;
        self.remaining -= count;
        Ok(count as usize)
    }
}

impl Read for ElementReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(into_io_error)
    }
}

/// Iterator over the elements of a queue, eldest first.
///
/// The iterator borrows the queue, so the queue cannot be modified until it is dropped. After
/// an error the iterator ends.
pub struct ElementIter<'a> {
    queue: &'a ElementQueue,
    next_position: Option<u64>,
    index: usize,
}

impl<'a> ElementIter<'a> {
    pub(crate) fn new(queue: &'a ElementQueue) -> Self {
        Self {
            queue,
            next_position: queue.first_element().map(|e| e.position),
            index: 0,
        }
    }

    fn read_next(&self, position: u64) -> Result<Element> {
        self.queue.require_open()?;
        let position = self.queue.storage().wrap_position(position)?;
        self.queue.read_element(position)
    }
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<ElementReader<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let position = self.next_position.take()?;
        if self.index >= self.queue.len() {
            return None;
        }
        let element = match self.read_next(position) {
            Ok(element) => element,
            Err(e) => return Some(Err(e)),
        };

        self.index += 1;
        if self.index < self.queue.len() {
            self.next_position = Some(element.next_position());
        }
        Some(Ok(ElementReader::new(self.queue.storage(), element)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next_position.is_some() {
            self.queue.len() - self.index
        } else {
            0
        };
        (remaining, Some(remaining))
    }
}

pub(crate) fn into_io_error(err: StorageError) -> io::Error {
    match err {
        StorageError::Io(e) => e,
        other => io::Error::other(other),
    }
}
