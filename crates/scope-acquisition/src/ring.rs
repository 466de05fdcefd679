//! Bounded single-producer/single-consumer channels for samples and tags.
//!
//! Each enabled channel owns two of these: one for calibrated samples, one
//! for metadata tags. The engine writes from the chunk-processing context,
//! the downstream consumer reads from its own context; there is exactly one
//! of each per ring, so no locking is needed beyond what the underlying
//! lock-free buffer provides.
//!
//! Overrun handling is all-or-nothing: a publish that does not fit leaves
//! the buffer untouched and reports how much room was missing, so a consumer
//! never observes a partially written chunk.

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use thiserror::Error;

/// A publish would have overwritten unconsumed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring overrun: tried to publish {requested} entries with only {free} free")]
pub struct Overrun {
    pub requested: usize,
    pub free: usize,
}

/// Writing half of a ring channel. Held by the acquisition engine.
pub struct RingProducer<T> {
    inner: HeapProducer<T>,
}

/// Reading half of a ring channel. Handed to the downstream consumer.
pub struct RingConsumer<T> {
    inner: HeapConsumer<T>,
}

/// Create a bounded SPSC channel with room for `capacity` entries.
pub fn ring_channel<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let (producer, consumer) = HeapRb::new(capacity).split();
    (
        RingProducer { inner: producer },
        RingConsumer { inner: consumer },
    )
}

impl<T: Clone> RingProducer<T> {
    /// Copy `items` into the buffer and expose them to the consumer.
    ///
    /// Fails without writing anything when free capacity is insufficient.
    pub fn publish(&mut self, items: &[T]) -> Result<(), Overrun> {
        let free = self.inner.free_len();
        if items.len() > free {
            return Err(Overrun {
                requested: items.len(),
                free,
            });
        }
        for item in items {
            // cannot fail, free capacity was checked above
            let _ = self.inner.push(item.clone());
        }
        Ok(())
    }
}

impl<T> RingProducer<T> {
    /// Move a single entry into the buffer.
    pub fn publish_one(&mut self, item: T) -> Result<(), Overrun> {
        if self.inner.is_full() {
            return Err(Overrun {
                requested: 1,
                free: 0,
            });
        }
        let _ = self.inner.push(item);
        Ok(())
    }

    pub fn free(&self) -> usize {
        self.inner.free_len()
    }
}

impl<T> RingConsumer<T> {
    /// Number of entries ready to read.
    pub fn available(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Take the oldest entry, if any.
    pub fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    /// Advance the read cursor past `n` entries without returning them.
    /// Returns how many were actually skipped.
    pub fn consume(&mut self, n: usize) -> usize {
        self.inner.skip(n)
    }

    /// Pop everything currently readable.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(item) = self.inner.pop() {
            out.push(item);
        }
        out
    }
}

impl<T: Copy> RingConsumer<T> {
    /// Fill `buf` from the front of the ring. Returns the number copied.
    pub fn read(&mut self, buf: &mut [T]) -> usize {
        self.inner.pop_slice(buf)
    }
}
