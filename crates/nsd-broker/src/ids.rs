//! Broker-global transaction id allocator (spec §4.2).
//!
//! Single-threaded by design — only the event loop ever touches this, so no
//! atomics are needed. Monotonically increasing with wraparound, skipping
//! the reserved `0` sentinel (spec I8, P3). No recycling: a 32-bit id space
//! exhausting within one process's lifetime is treated as out of scope (the
//! source notes this as a place to swap in a generation-tagged id if it
//! ever becomes a real risk).

use nsd_core::types::TransactionId;

pub struct TransactionIdAllocator {
    next: u32,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> TransactionId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        TransactionId::from_raw(id)
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
