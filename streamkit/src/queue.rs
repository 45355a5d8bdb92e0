//! Internal buffer shared by the Readable and Writable engines
//!
//! An ordered holder of entries with size accounting and an end-of-stream
//! sentinel. Once the sentinel is set, `enqueue` is refused; entries already
//! buffered can still be dequeued (and put back at the head).

use std::collections::VecDeque;

use crate::chunk::Chunk;
use crate::error::{ProtocolViolation, StreamError};

/// Returned by `Queue::enqueue` once the sentinel is present
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue already holds the end-of-stream sentinel")]
pub struct QueueClosed;

impl From<QueueClosed> for StreamError {
    fn from(_: QueueClosed) -> Self {
        ProtocolViolation::PushAfterEnd.into()
    }
}

/// Anything the queue can hold and size
pub trait Weighted {
    fn weight(&self, object_mode: bool) -> usize;
}

impl Weighted for Chunk {
    fn weight(&self, object_mode: bool) -> usize {
        Chunk::weight(self, object_mode)
    }
}

#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
    size: usize,
    object_mode: bool,
    terminated: bool,
}

impl<T: Weighted> Queue<T> {
    #[must_use]
    pub fn new(object_mode: bool) -> Self {
        Self {
            items: VecDeque::new(),
            size: 0,
            object_mode,
            terminated: false,
        }
    }

    /// Append an entry at the tail
    ///
    /// # Errors
    /// Fails with `QueueClosed` after `terminate()`.
    pub fn enqueue(&mut self, item: T) -> Result<(), QueueClosed> {
        if self.terminated {
            return Err(QueueClosed);
        }
        self.size += item.weight(self.object_mode);
        self.items.push_back(item);
        Ok(())
    }

    /// Put an entry back at the head (allowed after the sentinel)
    pub fn push_front(&mut self, item: T) {
        self.size += item.weight(self.object_mode);
        self.items.push_front(item);
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.size -= item.weight(self.object_mode);
        Some(item)
    }

    #[must_use]
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Cumulative weight of the buffered entries
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn below_threshold(&self, high_water_mark: usize) -> bool {
        self.size < high_water_mark
    }

    #[must_use]
    pub fn object_mode(&self) -> bool {
        self.object_mode
    }

    /// Append the end-of-stream sentinel
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Release every buffered entry (the sentinel stays)
    pub fn clear(&mut self) -> Vec<T> {
        self.size = 0;
        self.items.drain(..).collect()
    }
}

impl Queue<Chunk> {
    /// Take data from the head
    ///
    /// Object mode (or no hint) pops one chunk. In byte mode, `Some(n)` takes
    /// exactly `n` bytes, splitting the chunk that straddles the offset and
    /// concatenating across chunks; `n` at or above the size drains all.
    pub fn dequeue(&mut self, n: Option<usize>) -> Option<Chunk> {
        match n {
            _ if self.object_mode => self.pop_front(),
            None => self.pop_front(),
            Some(n) if n >= self.size => self.drain_all(),
            Some(n) => self.take_prefix(n),
        }
    }

    /// Concatenate every buffered chunk into one
    pub fn drain_all(&mut self) -> Option<Chunk> {
        if self.object_mode || self.items.len() <= 1 {
            return self.pop_front();
        }
        let size = self.size;
        self.take_prefix(size)
    }

    fn take_prefix(&mut self, n: usize) -> Option<Chunk> {
        let as_text = matches!(self.items.front()?, Chunk::Text(_));
        let mut bytes = Vec::new();
        let mut text = String::new();
        let mut remaining = n;

        while remaining > 0 {
            let Some(chunk) = self.pop_front() else {
                break;
            };
            let piece = if chunk.len() <= remaining {
                chunk
            } else {
                let (head, tail) = split_chunk(chunk, remaining);
                self.push_front(tail);
                head
            };
            remaining = remaining.saturating_sub(piece.len());
            match piece {
                Chunk::Text(s) if as_text => text.push_str(&s),
                other => bytes.extend_from_slice(other.as_bytes().unwrap_or_default()),
            }
        }

        Some(if as_text {
            Chunk::Text(text)
        } else {
            Chunk::Bytes(bytes)
        })
    }
}

/// Split a byte/text chunk at `at` bytes; text splits on a char boundary,
/// taking at least one character.
fn split_chunk(chunk: Chunk, at: usize) -> (Chunk, Chunk) {
    match chunk {
        Chunk::Text(mut head) => {
            let mut cut = at.min(head.len());
            while cut > 0 && !head.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                cut = head.chars().next().map_or(head.len(), char::len_utf8);
            }
            let tail = head.split_off(cut);
            (Chunk::Text(head), Chunk::Text(tail))
        }
        Chunk::Bytes(mut head) => {
            let tail = head.split_off(at.min(head.len()));
            (Chunk::Bytes(head), Chunk::Bytes(tail))
        }
        object @ Chunk::Object(_) => (object, Chunk::Bytes(Vec::new())),
    }
}
