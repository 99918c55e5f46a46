use log::*;

/// A reusable fixed-capacity byte container. The logical `len` tracks how
/// much of the capacity is in use for the message currently held.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    pooled: bool,
}

impl Buffer {
    fn with_capacity(capacity: usize, pooled: bool) -> Self {
        Buffer { data: vec![0u8; capacity].into_boxed_slice(), len: 0, pooled }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The held payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub(crate) fn store(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= self.capacity());
        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
    }
}

/// Recycles receive buffers so the per-tick drain loop does not allocate.
///
/// Only ever touched from the tick thread, so there is no locking. `take`
/// always succeeds: an empty free list allocates fresh, and the retention
/// bound is enforced on `release` instead (excess buffers are simply
/// dropped).
#[derive(Debug)]
pub struct BufferPool {
    item_capacity: usize,
    max_retained: usize,
    free: Vec<Buffer>,
    allocated: usize,
}

impl BufferPool {
    pub fn new(item_capacity: usize, prewarm: usize, max_retained: usize) -> Self {
        let prewarm = prewarm.min(max_retained);
        let free = (0..prewarm).map(|_| Buffer::with_capacity(item_capacity, true)).collect();
        BufferPool { item_capacity, max_retained, free, allocated: prewarm }
    }

    pub fn item_capacity(&self) -> usize {
        self.item_capacity
    }

    /// Check a buffer out for reuse.
    pub fn take(&mut self) -> Buffer {
        match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocated += 1;
                Buffer::with_capacity(self.item_capacity, true)
            }
        }
    }

    /// One-off buffer for a message larger than the pooled capacity. It is
    /// discarded on release rather than retained.
    pub fn take_oversized(&mut self, size: usize) -> Buffer {
        Buffer::with_capacity(size, false)
    }

    /// Copy `payload` into a buffer of the right kind, routing oversized
    /// messages through the one-off escape valve.
    pub fn take_copy(&mut self, payload: &[u8]) -> Buffer {
        let mut buffer = if payload.len() > self.item_capacity {
            warn!(
                "Inbound message of {} bytes exceeds the pooled capacity of {}; using a one-off buffer",
                payload.len(),
                self.item_capacity
            );
            self.take_oversized(payload.len())
        } else {
            self.take()
        };
        buffer.store(payload);
        buffer
    }

    /// Return a buffer for future reuse. Non-pooled buffers and buffers
    /// beyond the retention bound are dropped.
    pub fn release(&mut self, mut buffer: Buffer) {
        if !buffer.pooled || self.free.len() >= self.max_retained {
            return;
        }
        buffer.len = 0;
        self.free.push(buffer);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pooled buffers ever allocated, including the prewarmed ones.
    pub fn allocated_total(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn release_after_take_restores_the_free_count() {
        let mut pool = BufferPool::new(64, 4, 8);
        assert_eq!(pool.free_count(), 4);
        let buffer = pool.take();
        assert_eq!(pool.free_count(), 3);
        pool.release(buffer);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.allocated_total(), 4);
    }

    #[test]
    fn exhausting_the_pool_allocates_but_retention_stays_bounded() {
        let mut pool = BufferPool::new(16, 2, 3);
        let taken = (0..5).map(|_| pool.take()).collect::<Vec<_>>();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocated_total(), 5);
        for buffer in taken {
            pool.release(buffer);
        }
        // Two of the five were dropped on release.
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn oversized_buffers_are_never_retained() {
        let mut pool = BufferPool::new(8, 0, 4);
        let buffer = pool.take_copy(&[7u8; 32]);
        assert_eq!(buffer.as_slice(), &[7u8; 32]);
        assert_eq!(buffer.capacity(), 32);
        pool.release(buffer);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn take_copy_reuses_pooled_buffers() {
        let mut pool = BufferPool::new(8, 1, 4);
        let buffer = pool.take_copy(b"abc");
        assert_eq!(buffer.as_slice(), b"abc");
        assert_eq!(buffer.capacity(), 8);
        pool.release(buffer);
        let buffer = pool.take_copy(b"defg");
        assert_eq!(buffer.as_slice(), b"defg");
        assert_eq!(pool.allocated_total(), 1);
        pool.release(buffer);
    }
}
