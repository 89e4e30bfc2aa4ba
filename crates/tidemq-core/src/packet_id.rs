//! Packet identifier allocation.
//!
//! Identifiers are 16-bit non-zero values shared by every client in the
//! process. The allocator only guarantees uniqueness until the counter wraps;
//! callers must not hand out an identifier that still has an in-flight
//! record, which at 65535 values per wrap is not a practical concern for a
//! single outstanding request per client.

use std::sync::atomic::{AtomicU16, Ordering};

/// Process-wide identifier source.
static GLOBAL: PacketIdAllocator = PacketIdAllocator::new();

/// Allocate the next identifier from the process-wide source.
pub fn next_packet_id() -> u16 {
    GLOBAL.allocate()
}

/// Monotonic, wrapping, zero-skipping identifier source.
#[derive(Debug)]
pub struct PacketIdAllocator {
    /// Next ID to hand out
    next_id: AtomicU16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    /// Create a new packet ID allocator starting at 1.
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create an allocator whose next identifier is `id` (0 is skipped).
    pub const fn starting_at(id: u16) -> Self {
        Self {
            next_id: AtomicU16::new(id),
        }
    }

    /// Allocate an identifier. Never returns 0.
    pub fn allocate(&self) -> u16 {
        loop {
            // fetch_add wraps at u16::MAX
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
