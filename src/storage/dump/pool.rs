//! Reusable serialization buffers.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_POOLED: usize = 64;

/// Default capacity of a freshly allocated buffer; fits a typical record line.
pub const DEFAULT_BUFFER_CAPACITY: usize = 128;

/// Pool of byte buffers used to encode dump records.
///
/// Returned buffers are zeroed and cleared before they go back on the free list, so a
/// pooled buffer never carries a previous record's bytes.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    buffer_capacity: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED, DEFAULT_BUFFER_CAPACITY)
    }
}

impl BufferPool {
    /// Creates a pool keeping at most `max_pooled` idle buffers.
    #[must_use]
    pub const fn new(max_pooled: usize, buffer_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
            buffer_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an empty buffer, reusing an idle one when available.
    pub fn get(&self) -> Vec<u8> {
        self.lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity))
    }

    /// Zeroes `buf` and returns it to the pool. Dropped if the pool is full.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.fill(0);
        buf.clear();
        let mut free = self.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(4, 16);
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        let ptr = buf.as_ptr();
        pool.put(buf);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn test_returned_buffer_keeps_capacity() {
        let pool = BufferPool::new(4, 16);
        let mut buf = pool.get();
        buf.extend_from_slice(&[7u8; 64]);
        let capacity = buf.capacity();
        pool.put(buf);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }

    #[test]
    fn test_pool_is_capped() {
        let pool = BufferPool::new(2, 8);
        pool.put(Vec::new());
        pool.put(Vec::new());
        pool.put(Vec::new());
        assert_eq!(pool.idle(), 2);
    }
}
