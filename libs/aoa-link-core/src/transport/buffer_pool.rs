use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, PoisonError},
};

use crate::util::lock;

/// Number of read buffers a transporter keeps by default.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// A fixed set of equally sized byte buffers.
///
/// Checking a buffer out blocks while all of them are in use. Buffers are
/// not cleared when they come back, so a holder must only look at the
/// prefix it filled itself.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    returned: Condvar,
    buffer_size: usize,
    count: usize,
}

impl BufferPool {
    /// Create `count` buffers of `buffer_size` bytes. A pool always holds at
    /// least one buffer.
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let count = count.max(1);
        let free = (0..count)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            free: Mutex::new(free),
            returned: Condvar::new(),
            buffer_size,
            count,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers, checked out or not.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn available(&self) -> usize {
        lock(&self.free).len()
    }

    /// Take a buffer, waiting for one to be returned if none is free.
    pub fn checkout(&self) -> PooledBuffer<'_> {
        let mut free = lock(&self.free);
        loop {
            if let Some(buffer) = free.pop() {
                return PooledBuffer {
                    pool: self,
                    buffer: Some(buffer),
                };
            }
            free = self
                .returned
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_checkout(&self) -> Option<PooledBuffer<'_>> {
        lock(&self.free).pop().map(|buffer| PooledBuffer {
            pool: self,
            buffer: Some(buffer),
        })
    }

    fn release(&self, buffer: Box<[u8]>) {
        lock(&self.free).push(buffer);
        self.returned.notify_one();
    }
}

/// A buffer on loan from a [`BufferPool`]; it goes back when dropped.
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buffer: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn test_buffers_have_fixed_size() {
        let pool = BufferPool::new(64, 2);
        let buffer = pool.checkout();
        assert_eq!(buffer.len(), 64);
        assert_eq!(pool.available(), 1);
        drop(buffer);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_empty_pool_is_bumped_to_one() {
        let pool = BufferPool::new(8, 0);
        assert_eq!(pool.count(), 1);
        assert!(pool.try_checkout().is_some());
    }

    #[test]
    fn test_exhausted_pool() {
        let pool = BufferPool::new(8, 2);
        let _a = pool.checkout();
        let _b = pool.checkout();
        assert!(pool.try_checkout().is_none());
    }

    #[test]
    fn test_contents_survive_release() {
        let pool = BufferPool::new(4, 1);
        pool.checkout().copy_from_slice(b"abcd");
        assert_eq!(&*pool.checkout(), b"abcd");
    }

    #[test]
    fn test_checkout_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(8, 1));
        let held = pool.checkout();

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || {
            let buffer = waiter_pool.checkout();
            buffer.len()
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.join().unwrap(), 8);
    }
}
