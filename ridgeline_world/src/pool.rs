// Process-wide slab pools for scratch buffers.
//
// Hot query paths borrow a buffer, fill it, and hand it back instead of
// allocating per call. The contract is deliberately opaque: `acquire`
// returns an empty buffer with at least the requested capacity (contents
// unspecified beyond "cleared"), `release` returns it for reuse. A bounded
// entry count caps the memory a pool can hold; releases past the bound
// drop the buffer.
//
// A single `Mutex` serializes every get/put, which is all the
// synchronization the contract promises. Pools amortize allocation; they
// are not a channel and must never be used to pass data between threads.

use std::sync::Mutex;

pub struct SlabPool<T> {
    entries: Mutex<Vec<Vec<T>>>,
    max_entries: usize,
}

impl<T> SlabPool<T> {
    pub const fn new(max_entries: usize) -> Self {
        Self { entries: Mutex::new(Vec::new()), max_entries }
    }

    /// An empty buffer with capacity at least `min_capacity`. Reuses the
    /// first pooled buffer that is large enough.
    pub fn acquire(&self, min_capacity: usize) -> Vec<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = entries.iter().position(|b| b.capacity() >= min_capacity) {
            return entries.swap_remove(pos);
        }
        drop(entries);
        Vec::with_capacity(min_capacity)
    }

    /// Return a buffer. Cleared before pooling; dropped when full.
    pub fn release(&self, mut buf: Vec<T>) {
        buf.clear();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() < self.max_entries {
            entries.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
