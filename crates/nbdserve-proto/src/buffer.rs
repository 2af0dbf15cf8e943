//! Size-indexed buffer pool.
//!
//! The kernel queue tends to issue requests in a small set of payload
//! lengths, so keeping one free list per distinct size recycles nearly
//! every buffer while still tolerating backends that see arbitrary
//! lengths. A `get` always returns a buffer of exactly the requested
//! size; a `put` files the buffer under its own length.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// One free list per buffer size.
///
/// The size-class table entry is created on first use of a size; after
/// that, gets and puts for the size only contend on the class's own
/// lock. Free lists are unbounded — the set of distinct sizes is small
/// and the steady-state population is bounded by the engine's queue
/// depth.
pub struct BufferPool {
    classes: DashMap<usize, Arc<SizeClass>>,
}

struct SizeClass {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
        }
    }

    fn class(&self, size: usize) -> Arc<SizeClass> {
        self.classes
            .entry(size)
            .or_insert_with(|| {
                Arc::new(SizeClass {
                    free: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Get a buffer of exactly `size` bytes, recycled if one is free.
    ///
    /// Recycled buffers keep their previous contents; callers overwrite
    /// the full span.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let class = self.class(size);
        let recycled = class.free.lock().unwrap().pop();
        recycled.unwrap_or_else(|| vec![0u8; size])
    }

    /// Return a buffer to the free list for its length.
    ///
    /// The caller must no longer hold any reference into the buffer.
    pub fn put(&self, buf: Vec<u8>) {
        let class = self.class(buf.len());
        class.free.lock().unwrap().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
