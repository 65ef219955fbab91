//! Reusable receive buffers
//!
//! A `PooledBuffer` goes back to its pool when dropped, so a datagram's
//! buffer is released on every path through a worker, including errors.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Pool of `buffer_size`-byte buffers keeping at most `max_idle` for reuse
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let data = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            len: data.len(),
            data,
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, mut data: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            data.resize(self.buffer_size, 0);
            idle.push(data);
        }
    }
}

/// A receive buffer borrowed from a `BufferPool`
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// The whole buffer, for receiving into
    pub fn as_mut_full(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Limit the visible bytes to the first `len`
    pub fn truncate(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new(1500, 4);
        {
            let mut buffer = pool.get();
            buffer.as_mut_full()[..3].copy_from_slice(&[1, 2, 3]);
            buffer.truncate(3);
            assert_eq!(&*buffer, &[1, 2, 3]);
        }
        assert_eq!(pool.idle(), 1);

        let buffer = pool.get();
        assert_eq!(buffer.len(), 1500);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_idle_is_bounded() {
        let pool = BufferPool::new(16, 2);
        let buffers: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(buffers);
        assert_eq!(pool.idle(), 2);
    }
}
