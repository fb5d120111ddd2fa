//! Reusable backing storage for payload bytes
//!
//! A [`BufferPool`] hands out consecutive slices of one backing allocation and
//! only reallocates when a request does not fit. Resetting the pool rewinds
//! it; the shrink strategy decides whether the backing allocation should get
//! smaller, and a hysteresis counter keeps a single small message from
//! throwing away a buffer sized for a recent burst.

use bytes::BytesMut;
use std::fmt;

/// Computes the size of a new backing buffer from `(used, requested)`
pub type GrowStrategy = Box<dyn Fn(usize, usize) -> usize + Send>;

/// Number of shrink signals the pool ignores before it reallocates
const SHRINK_HYSTERESIS: i32 = 2;

/// Default grow strategy: exactly enough for everything handed out since the last reset
pub fn default_grow(used: usize, length: usize) -> usize {
    used + length
}

/// Counters describing a pool at the moment it is reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Size of the current backing buffer
    pub size: usize,
    /// Bytes handed out since the last reset
    pub used: usize,
    /// Position of the next slice in the backing buffer
    pub offset: usize,
}

/// Exponential smoothing of recent usage
///
/// The first target is the usage itself; afterwards each target is the
/// rounded-up mean of the previous target and the current usage.
#[derive(Debug, Clone, Default)]
pub struct SmoothedShrink {
    previous: Option<usize>,
}

impl SmoothedShrink {
    /// Create a smoother with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `used` into the running estimate and return the new target size
    pub fn next_size(&mut self, used: usize) -> usize {
        let next = match self.previous {
            Some(previous) => (previous + used).div_ceil(2),
            None => used,
        };
        self.previous = Some(next);
        next
    }
}

/// How a pool picks its target size on reset
pub enum ShrinkStrategy {
    /// Always the same target
    Fixed(usize),
    /// Exponential smoothing of recent usage
    Smoothed(SmoothedShrink),
    /// Caller-supplied policy
    Custom(Box<dyn FnMut(&PoolStats) -> usize + Send>),
}

impl ShrinkStrategy {
    fn target(&mut self, stats: &PoolStats) -> usize {
        match self {
            ShrinkStrategy::Fixed(size) => *size,
            ShrinkStrategy::Smoothed(smoother) => smoother.next_size(stats.used),
            ShrinkStrategy::Custom(f) => f(stats),
        }
    }
}

impl fmt::Debug for ShrinkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShrinkStrategy::Fixed(size) => f.debug_tuple("Fixed").field(size).finish(),
            ShrinkStrategy::Smoothed(smoother) => f.debug_tuple("Smoothed").field(smoother).finish(),
            ShrinkStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Pooling allocator for payload slices
///
/// Slices returned by [`get`](Self::get) are views into the pool's backing
/// allocation. They stay valid on their own (the allocation is reference
/// counted) but the pool only reclaims the allocation in place once every
/// view has been dropped.
pub struct BufferPool {
    /// Unused tail of the backing allocation
    buffer: BytesMut,
    size: usize,
    used: usize,
    grow: GrowStrategy,
    shrink: ShrinkStrategy,
    change_factor: i32,
}

impl BufferPool {
    /// Create a pool with an initial backing buffer and explicit strategies
    pub fn new(initial_size: usize, grow: GrowStrategy, shrink: ShrinkStrategy) -> Self {
        let mut pool = Self {
            buffer: BytesMut::new(),
            size: 0,
            used: 0,
            grow,
            shrink,
            change_factor: 0,
        };
        pool.set_buffer(initial_size);
        pool
    }

    /// Create a pool that shrinks by exponential smoothing, as message parsing does
    pub fn smoothed(initial_size: usize) -> Self {
        Self::new(
            initial_size,
            Box::new(default_grow),
            ShrinkStrategy::Smoothed(SmoothedShrink::new()),
        )
    }

    /// Take `length` bytes from the backing buffer, growing it if needed
    pub fn get(&mut self, length: usize) -> BytesMut {
        if length > self.buffer.len() {
            let new_size = (self.grow)(self.used, length).max(length);
            tracing::trace!(old_size = self.size, new_size, "buffer pool grow");
            self.set_buffer(new_size);
        }
        self.used += length;
        self.buffer.split_to(length)
    }

    /// Rewind the pool, shrinking the backing buffer when the strategy says so
    pub fn reset(&mut self, force_new_buffer: bool) {
        let stats = self.stats();
        let target = self.shrink.target(&stats);
        if target < self.size {
            self.change_factor -= 1;
        }
        if force_new_buffer || self.change_factor < -SHRINK_HYSTERESIS {
            self.change_factor = 0;
            if target == self.size {
                self.rewind();
            } else {
                tracing::trace!(old_size = self.size, new_size = target, "buffer pool resize");
                self.set_buffer(target);
            }
        } else {
            self.rewind();
        }
        self.used = 0;
    }

    /// Release the backing buffer; the pool remains usable as an empty pool
    pub fn destroy(&mut self) {
        self.buffer = BytesMut::new();
        self.size = 0;
        self.used = 0;
        self.change_factor = 0;
    }

    /// Size of the current backing buffer
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes handed out since the last reset
    pub fn used(&self) -> usize {
        self.used
    }

    /// Position of the next slice within the backing buffer
    pub fn offset(&self) -> usize {
        self.size - self.buffer.len()
    }

    /// Bytes left before the next `get` has to grow the pool
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            used: self.used,
            offset: self.offset(),
        }
    }

    fn set_buffer(&mut self, size: usize) {
        self.buffer = if size == 0 {
            BytesMut::new()
        } else {
            BytesMut::zeroed(size)
        };
        self.size = size;
    }

    fn rewind(&mut self) {
        // `reserve` takes the whole original allocation back when no view
        // handed out by `get` is still alive.
        self.buffer.clear();
        self.buffer.reserve(self.size);
        self.buffer.resize(self.size, 0);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(0, Box::new(default_grow), ShrinkStrategy::Fixed(0))
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.size)
            .field("used", &self.used)
            .field("offset", &self.offset())
            .field("shrink", &self.shrink)
            .field("change_factor", &self.change_factor)
            .finish()
    }
}
