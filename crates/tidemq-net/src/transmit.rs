//! Outbound packet queue shared by a socket and its handle.

use std::collections::VecDeque;

/// Bounded FIFO of packets waiting to be written.
#[derive(Debug)]
pub struct TransmitBuffer<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

impl<T> TransmitBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Queue a packet. Returns false when the buffer is full.
    pub fn put(&mut self, packet: T) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(packet);
        true
    }

    pub fn take(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
