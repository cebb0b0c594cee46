//! Per-receiver TS stream buffer.
//!
//! One producer (the demultiplexer, on the bus I/O thread) and one
//! consumer (the caller's read loop) share a bounded byte ring. Writes
//! never block: when the chunk does not fit, the whole chunk is dropped
//! so the consumer never observes a torn packet. Reads may block until
//! data, stop or purge.
//!
//! ```text
//!              head                    head+len
//!               v                         v
//!   +-----------+-------------------------+---------+
//!   |           |########## len ##########|         |
//!   +-----------+-------------------------+---------+
//!   0                                          capacity
//! ```

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Cursor state guarded by the buffer mutex.
struct Inner {
    arena: Vec<u8>,
    /// Read cursor.
    head: usize,
    /// Unread byte count.
    len: usize,
    /// Accepting writes; blocked reads return once this clears.
    active: bool,
    /// Bumped by purge so a waiting reader can tell why it woke.
    generation: u64,
}

/// Bounded single-producer single-consumer byte ring.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    /// Unread bytes required before a blocked reader is woken.
    wake_threshold: usize,
}

impl RingBuffer {
    /// Create an empty, inactive buffer. The arena is reserved later by
    /// [`RingBuffer::alloc`], once per capture session.
    pub fn new(wake_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                arena: Vec::new(),
                head: 0,
                len: 0,
                active: false,
                generation: 0,
            }),
            readable: Condvar::new(),
            wake_threshold: wake_threshold.max(1),
        }
    }

    /// Reserve the arena for a capture session. Fails without touching
    /// the current arena while the buffer is active.
    pub fn alloc(&self, capacity: usize) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.active {
            return Err(Error::InvalidState {
                op: "buffer alloc",
                state: "active",
            });
        }
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(capacity)
            .map_err(|_| Error::ResourceExhausted {
                requested: capacity,
            })?;
        arena.resize(capacity, 0);
        inner.arena = arena;
        inner.head = 0;
        inner.len = 0;
        Ok(())
    }

    /// Release the arena between capture sessions.
    pub fn free(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.active {
            return Err(Error::InvalidState {
                op: "buffer free",
                state: "active",
            });
        }
        inner.arena = Vec::new();
        inner.head = 0;
        inner.len = 0;
        Ok(())
    }

    /// Begin accepting writes. Idempotent.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.active = true;
    }

    /// Reject further writes and wake a blocked reader. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if !inner.active {
            return;
        }
        inner.active = false;
        self.readable.notify_all();
    }

    /// Producer side. Never blocks; returns the number of bytes taken,
    /// which is `data.len()` or 0.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        if !inner.active || inner.arena.is_empty() {
            return 0;
        }
        let capacity = inner.arena.len();
        if data.len() > capacity - inner.len {
            // 満杯時はチャンクごと破棄してパケット境界を守る
            return 0;
        }
        let was = inner.len;
        let tail = (inner.head + inner.len) % capacity;
        let first = data.len().min(capacity - tail);
        inner.arena[tail..tail + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let second = data.len() - first;
            inner.arena[..second].copy_from_slice(&data[first..]);
        }
        inner.len += data.len();
        // Wake coalescing: only the threshold-crossing write notifies.
        if was < self.wake_threshold && inner.len >= self.wake_threshold {
            self.readable.notify_one();
        }
        data.len()
    }

    /// Consumer side. Drains up to `buf.len()` bytes.
    ///
    /// With `blocking` set and nothing buffered, waits until the next
    /// threshold-crossing write, a stop, or a purge; the latter two
    /// return 0. Buffered data is drained even after a stop.
    pub fn read(&self, buf: &mut [u8], blocking: bool) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            if !blocking || !inner.active {
                return 0;
            }
            let entered = inner.generation;
            while inner.len == 0 && inner.active && inner.generation == entered {
                self.readable.wait(&mut inner);
            }
            if inner.len == 0 {
                return 0;
            }
        }
        let capacity = inner.arena.len();
        let n = buf.len().min(inner.len);
        let head = inner.head;
        let first = n.min(capacity - head);
        buf[..first].copy_from_slice(&inner.arena[head..head + first]);
        if first < n {
            buf[first..n].copy_from_slice(&inner.arena[..n - first]);
        }
        inner.head = (head + n) % capacity;
        inner.len -= n;
        n
    }

    /// Discard all unread data and wake a blocked reader with 0 bytes.
    /// Taking the cursor lock lets an in-flight write finish first, so
    /// the buffer is really empty when this returns.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.head = 0;
        inner.len = 0;
        inner.generation = inner.generation.wrapping_add(1);
        self.readable.notify_all();
    }

    /// Unread byte count.
    pub fn readable_len(&self) -> usize {
        self.inner.lock().len
    }

    /// Size of the reserved arena; 0 between sessions.
    pub fn capacity(&self) -> usize {
        self.inner.lock().arena.len()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }
}
