//! Fixed pools of aligned I/O buffers
//!
//! Pools are sized once at engine open and never grow. Checking out more
//! buffers than are free blocks the caller until others are returned.

use crate::raw_io::AlignedBuffer;
use crate::sync::Semaphore;
use flashkv_common::{BLOCK_SIZE, Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Semaphore-gated free list of equally sized buffers
pub struct BufferPool {
    name: &'static str,
    buffer_blocks: usize,
    capacity: usize,
    free: Mutex<Vec<AlignedBuffer>>,
    permits: Semaphore,
}

impl BufferPool {
    pub fn new(name: &'static str, buffers: usize, buffer_blocks: usize) -> Arc<Self> {
        let free = (0..buffers)
            .map(|_| AlignedBuffer::blocks(buffer_blocks))
            .collect();
        Arc::new(Self {
            name,
            buffer_blocks,
            capacity: buffers,
            free: Mutex::new(free),
            permits: Semaphore::new(buffers),
        })
    }

    /// Blocks per buffer
    pub const fn buffer_blocks(&self) -> usize {
        self.buffer_blocks
    }

    /// Total buffers in the pool
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently free
    pub fn available(&self) -> usize {
        self.permits.available()
    }

    /// Check out `count` buffers, blocking until they are all free
    pub fn checkout(self: &Arc<Self>, count: usize) -> Result<PoolLease> {
        if count == 0 || count > self.capacity {
            return Err(Error::OutOfMemory(format!(
                "{} pool holds {} buffers, {count} requested",
                self.name, self.capacity
            )));
        }
        self.permits.acquire_many(count);
        let mut free = self.free.lock();
        let start = free.len() - count;
        let buffers = free.split_off(start);
        drop(free);
        Ok(PoolLease {
            pool: Arc::clone(self),
            buffers,
        })
    }

    fn restore(&self, buffers: Vec<AlignedBuffer>) {
        let n = buffers.len();
        self.free.lock().extend(buffers);
        self.permits.release_many(n);
    }
}

/// Buffers checked out of a pool; returned on drop
pub struct PoolLease {
    pool: Arc<BufferPool>,
    buffers: Vec<AlignedBuffer>,
}

impl PoolLease {
    pub fn buffers(&self) -> &[AlignedBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [AlignedBuffer] {
        &mut self.buffers
    }

    /// Blocks across all leased buffers
    pub fn total_blocks(&self) -> usize {
        self.buffers.len() * self.pool.buffer_blocks
    }

    /// Buffer and in-buffer byte offset holding `block`
    pub fn locate(&self, block: usize) -> (usize, usize) {
        let per = self.pool.buffer_blocks;
        (block / per, (block % per) * BLOCK_SIZE)
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.pool.restore(buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_checkout_and_return() {
        let pool = BufferPool::new("table", 4, 8);
        {
            let lease = pool.checkout(3).unwrap();
            assert_eq!(lease.total_blocks(), 24);
            assert_eq!(lease.locate(9), (1, BLOCK_SIZE));
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let pool = BufferPool::new("table", 2, 8);
        assert!(matches!(pool.checkout(3), Err(Error::OutOfMemory(_))));
        assert!(pool.checkout(0).is_err());
    }

    #[test]
    fn test_exhaustion_blocks() {
        let pool = BufferPool::new("log-read", 1, 4);
        let lease = pool.checkout(1).unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.checkout(1).map(|l| l.total_blocks()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(lease);
        assert_eq!(waiter.join().unwrap().unwrap(), 4);
    }
}
