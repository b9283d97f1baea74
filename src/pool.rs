//! Fixed-size byte buffer pool for line assembly.
//!
//! Scanners draw `MAX_RECORD_SIZE` buffers here instead of allocating 4 MiB
//! per scan. The pool is an ordinary value so callers can inject their own
//! instance; [`shared`] is the process-wide default used when nothing is
//! injected.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Maximum record size in bytes; every pooled buffer is this large.
pub const MAX_RECORD_SIZE: usize = 4 << 20;

/// Unbounded free-list pool of fixed-size byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer from the pool, allocating when the free list is
    /// empty. The buffer returns to the pool when the guard drops.
    pub fn alloc(&self) -> PoolBuf<'_> {
        let recycled = self.free.lock().ok().and_then(|mut free| free.pop());
        let buf =
            recycled.unwrap_or_else(|| vec![0u8; MAX_RECORD_SIZE].into_boxed_slice());
        PoolBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Buffers currently sitting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn release(&self, buf: Box<[u8]>) {
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide default pool.
pub fn shared() -> &'static BufferPool {
    static SHARED: BufferPool = BufferPool::new();
    &SHARED
}

/// A pooled buffer; dereferences to `[u8; MAX_RECORD_SIZE]` as a slice and
/// returns to its pool on drop.
pub struct PoolBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PoolBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PoolBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
