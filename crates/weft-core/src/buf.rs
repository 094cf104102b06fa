//! Pooled packet buffers and zero-copy slices.
//!
//! Every datagram lives in a fixed-capacity [`Buf`] drawn from a
//! [`BufPool`]. Buffers are sized for one maximum-length packet plus
//! trailing headroom for the 64-byte Salsa20 block granularity, and
//! return to the pool when dropped. A [`Slice`] is a `(buffer, start,
//! end)` window over a shared buffer; the defragmenter hands completed
//! packets to the pipeline as a [`SliceVector`] of them.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// Pool buffer capacity: one maximum-length packet plus crypto headroom.
pub const BUF_SIZE: usize = 16384;

/// Buffers retained by the pool for reuse; beyond this they are freed.
const MAX_POOLED: usize = 128;

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
}

/// A shared pool of fixed-capacity packet buffers.
///
/// Cloning the pool handle is cheap; all clones share one free list.
#[derive(Clone)]
pub struct BufPool {
    inner: Arc<PoolInner>,
}

impl BufPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Obtain a buffer, reusing pooled memory when available.
    ///
    /// Buffer contents are unspecified; callers overwrite the region
    /// they use. Lengths are tracked by the slices laid over it.
    #[must_use]
    pub fn get(&self) -> Buf {
        let mem = self
            .inner
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; BUF_SIZE].into_boxed_slice());
        Buf {
            mem: Some(mem),
            pool: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-capacity packet buffer owned by, and returned to, a pool.
pub struct Buf {
    mem: Option<Box<[u8]>>,
    pool: Weak<PoolInner>,
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.mem {
            Some(mem) => mem,
            None => &[],
        }
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.mem {
            Some(mem) => mem,
            None => Default::default(),
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        let Some(mem) = self.mem.take() else { return };
        if let Some(pool) = self.pool.upgrade() {
            let mut free = match pool.free.lock() {
                Ok(free) => free,
                Err(_) => return,
            };
            if free.len() < MAX_POOLED {
                free.push(mem);
            }
        }
    }
}

/// A zero-copy window over a shared [`Buf`].
///
/// The window is a value; the buffer it references is kept alive by the
/// shared handle and may outlive the slice.
#[derive(Clone)]
pub struct Slice {
    buf: Arc<Buf>,
    start: usize,
    end: usize,
}

impl Slice {
    /// Create a window over `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or `end` exceeds the buffer capacity.
    #[must_use]
    pub fn new(buf: Arc<Buf>, start: usize, end: usize) -> Self {
        assert!(start <= end && end <= buf.len());
        Self { buf, start, end }
    }

    /// Window length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Start offset within the backing buffer.
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// End offset within the backing buffer.
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    /// The windowed bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The shared backing buffer.
    #[must_use]
    pub fn buf(&self) -> &Arc<Buf> {
        &self.buf
    }

    /// Mutable access to the backing buffer and window bounds, available
    /// only while this slice holds the sole reference to the buffer.
    ///
    /// Used by the pre-decryption rebalance, which moves bytes between
    /// adjacent fragment buffers in place.
    pub fn exclusive(&mut self) -> Option<ExclusiveSlice<'_>> {
        // Bounds live on self; borrow them apart from the buffer.
        let (start, end) = (&mut self.start, &mut self.end);
        let mem = Arc::get_mut(&mut self.buf)?;
        Some(ExclusiveSlice {
            mem: &mut mem[..],
            start,
            end,
        })
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Exclusive view of a slice's buffer and bounds. See [`Slice::exclusive`].
pub struct ExclusiveSlice<'a> {
    /// Full backing memory.
    pub mem: &'a mut [u8],
    /// Window start, adjustable.
    pub start: &'a mut usize,
    /// Window end, adjustable.
    pub end: &'a mut usize,
}

/// An ordered run of slices holding one (possibly fragmented) packet.
///
/// Bounded by [`crate::protocol::MAX_PACKET_FRAGMENTS`]; the first
/// slice always begins with the common packet header.
pub type SliceVector = Vec<Slice>;

/// Copy a slice vector into one contiguous buffer from `pool`.
///
/// The result spans `[0, total)` of a fresh buffer. Callers have
/// already bounded the total span to the maximum packet length.
#[must_use]
pub fn assemble_slice_vector(pool: &BufPool, pktv: &[Slice]) -> Slice {
    let mut out = pool.get();
    let mut at = 0;
    for s in pktv {
        let bytes = s.as_bytes();
        out[at..at + bytes.len()].copy_from_slice(bytes);
        at += bytes.len();
    }
    Slice::new(Arc::new(out), 0, at)
}
