//! Fixed-class byte pool.
//!
//! Utility module: an alternative to the size-indexed pool for
//! workloads with one dominant buffer size. A single class of
//! `capacity`-bounded recycled buffers, all allocated at `size` bytes;
//! oversized requests fall through to a plain allocation and foreign
//! buffers are dropped on return instead of polluting the class.

use std::sync::Mutex;

/// Bounded pool of buffers sharing one allocation size.
pub struct BytePool {
    size: usize,
    max: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BytePool {
    /// Create a pool of up to `max` recycled buffers of `size` bytes.
    pub fn new(size: usize, max: usize) -> Self {
        Self {
            size,
            max,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Get a zeroed buffer of `len` bytes.
    ///
    /// Requests at or under the class size come from the free list
    /// (keeping the class-sized allocation underneath); larger ones
    /// are plain allocations that will not be retained on `put`.
    pub fn get(&self, len: usize) -> Vec<u8> {
        if len > self.size {
            return vec![0u8; len];
        }
        let mut buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.size));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer. Buffers whose allocation does not match the
    /// class size are dropped, as are returns beyond the pool bound.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() != self.size {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max {
            free.push(buf);
        }
    }

    /// Number of buffers currently pooled.
    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Whether the free list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_exact_lengths_within_class() {
        let pool = BytePool::new(4096, 8);
        for len in [0usize, 1, 512, 4096] {
            let buf = pool.get(len);
            assert_eq!(buf.len(), len);
            assert_eq!(buf.capacity(), 4096);
            pool.put(buf);
        }
    }

    #[test]
    fn oversize_requests_bypass_the_pool() {
        let pool = BytePool::new(4096, 8);
        let big = pool.get(8192);
        assert_eq!(big.len(), 8192);
        pool.put(big);
        assert!(pool.is_empty());
    }

    #[test]
    fn foreign_buffers_are_dropped() {
        let pool = BytePool::new(4096, 8);
        pool.put(vec![0u8; 100]);
        assert!(pool.is_empty());
    }

    #[test]
    fn bounded_retention() {
        let pool = BytePool::new(512, 2);
        for _ in 0..5 {
            pool.put(Vec::with_capacity(512));
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn recycled_buffers_are_zeroed() {
        let pool = BytePool::new(512, 2);
        let mut buf = pool.get(512);
        buf.fill(0xFF);
        pool.put(buf);
        let again = pool.get(512);
        assert!(again.iter().all(|&b| b == 0));
    }
}
