//! Packet buffer pool for zero-copy descriptor rings.
//!
//! This crate owns one contiguous, page-aligned memory region carved into
//! fixed-size packet buffers. Rings and devices never own buffer memory;
//! they refer to buffers through [`BufIdx`] handles and resolve them here.
//!
//! # Design Philosophy
//!
//! - **Handles, not pointers**: a slot stores a `BufIdx`, the pool turns it
//!   into a CPU pointer or a device-visible bus address
//! - **Index 0 is reserved**: it never resolves, so a zeroed slot is always
//!   detected as unmapped
//! - **No allocation on the hot path**: the region and the free list are
//!   sized once at construction
//! - **Thread-safe**: spin-lock protected free list
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::BufferPool;
//!
//! let pool = BufferPool::new(1024, 2048)?;
//! let buf = pool.alloc()?;
//! let addr = pool.map(buf)?;      // device-visible address
//! // ... hand `addr` to a descriptor ...
//! pool.free(buf)?;
//! ```

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use log::debug;
use spin::Mutex;
use thiserror::Error;

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Default packet buffer size (2KB, one mbuf cluster).
pub const DEFAULT_BUF_SIZE: usize = 2048;

/// Smallest buffer the pool hands out.
pub const MIN_BUF_SIZE: usize = 64;

/// Buffer sizes must be a multiple of this (cache line).
pub const BUF_ALIGN: usize = 64;

/// Upper bound on buffers per pool.
pub const MAX_BUFFERS: usize = 1 << 20;

/// Base of the bus address window the pool exposes to devices.
pub const BUS_BASE: u64 = 0x1_0000_0000;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Convert pages to bytes.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

// ============================================================================
// Handles and addresses
// ============================================================================

/// Handle of one packet buffer inside a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BufIdx(pub u32);

impl BufIdx {
    /// The reserved handle. Never resolves to memory.
    pub const RESERVED: Self = Self(0);

    /// Create a handle from a raw index.
    pub const fn new(idx: u32) -> Self {
        Self(idx)
    }

    /// Raw index.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Check for the reserved handle.
    pub const fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

/// Device-visible bus address of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    /// Raw address.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::LowerHex for DmaAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A bus address window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base bus address.
    pub base: u64,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub const fn new(base: u64, size: usize) -> Self {
        Self { base, size }
    }

    /// Check whether `[addr, addr + len)` lies inside the region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && (addr - self.base)
                .checked_add(len as u64)
                .map_or(false, |end| end <= self.size as u64)
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Buffer pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Requested a pool with no buffers.
    #[error("pool must hold at least one buffer")]
    ZeroBuffers,
    /// Too many buffers requested.
    #[error("{0} buffers exceeds the pool limit")]
    TooManyBuffers(usize),
    /// Buffer size out of range or misaligned.
    #[error("invalid buffer size {0}")]
    InvalidBufferSize(usize),
    /// Backing region could not be allocated.
    #[error("failed to allocate pool region")]
    RegionAllocation,
    /// Every buffer is handed out.
    #[error("buffer pool exhausted")]
    OutOfBuffers,
    /// Handle does not refer to a buffer of this pool.
    #[error("invalid buffer handle {0:?}")]
    InvalidHandle(BufIdx),
    /// Buffer returned twice.
    #[error("buffer {0:?} is already free")]
    DoubleFree(BufIdx),
}

/// Result type for pool operations.
pub type Result<T> = core::result::Result<T, PoolError>;

// ============================================================================
// Free list
// ============================================================================

struct FreeList {
    /// Stack of free buffer indices.
    stack: Vec<u32>,
    /// Allocation state per buffer (index 0 unused).
    in_use: Vec<bool>,
}

impl FreeList {
    fn new(count: usize) -> Self {
        // Pop order hands out low indices first.
        let stack = (1..=count as u32).rev().collect();
        Self {
            stack,
            in_use: vec![false; count + 1],
        }
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// Fixed-size packet buffer pool.
///
/// Buffer `i` occupies bytes `[i * buf_size, (i + 1) * buf_size)` of the
/// region; buffer 0 exists but is never handed out.
pub struct BufferPool {
    /// Start of the backing region.
    region: NonNull<u8>,
    /// Layout used to allocate the region.
    layout: Layout,
    /// Size of each buffer.
    buf_size: usize,
    /// Number of usable buffers (excluding the reserved one).
    count: usize,
    /// Bus window covering the whole region.
    bus: MemoryRegion,
    /// Allocation tracking.
    free: Mutex<FreeList>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buf_size` bytes each.
    ///
    /// Memory is zeroed before return.
    pub fn new(count: usize, buf_size: usize) -> Result<Self> {
        if count == 0 {
            return Err(PoolError::ZeroBuffers);
        }
        if count > MAX_BUFFERS {
            return Err(PoolError::TooManyBuffers(count));
        }
        if buf_size < MIN_BUF_SIZE || buf_size % BUF_ALIGN != 0 || buf_size > u16::MAX as usize {
            return Err(PoolError::InvalidBufferSize(buf_size));
        }

        let bytes = pages_to_bytes(bytes_to_pages((count + 1) * buf_size));
        let layout =
            Layout::from_size_align(bytes, PAGE_SIZE).map_err(|_| PoolError::RegionAllocation)?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let region = NonNull::new(ptr).ok_or(PoolError::RegionAllocation)?;

        debug!(
            "buffer pool: {} buffers x {} bytes ({} pages)",
            count,
            buf_size,
            bytes_to_pages(bytes)
        );

        Ok(Self {
            region,
            layout,
            buf_size,
            count,
            bus: MemoryRegion::new(BUS_BASE, bytes),
            free: Mutex::new(FreeList::new(count)),
        })
    }

    /// Size of each buffer in bytes.
    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().stack.len()
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.count - self.free_count()
    }

    /// Check whether a handle names a buffer of this pool.
    #[inline]
    pub fn is_valid(&self, idx: BufIdx) -> bool {
        !idx.is_reserved() && (idx.get() as usize) <= self.count
    }

    /// Allocate one buffer.
    pub fn alloc(&self) -> Result<BufIdx> {
        let mut free = self.free.lock();
        let idx = free.stack.pop().ok_or(PoolError::OutOfBuffers)?;
        free.in_use[idx as usize] = true;
        Ok(BufIdx(idx))
    }

    /// Return a buffer to the pool.
    pub fn free(&self, idx: BufIdx) -> Result<()> {
        if !self.is_valid(idx) {
            return Err(PoolError::InvalidHandle(idx));
        }
        let mut free = self.free.lock();
        let slot = &mut free.in_use[idx.get() as usize];
        if !*slot {
            return Err(PoolError::DoubleFree(idx));
        }
        *slot = false;
        free.stack.push(idx.get());
        Ok(())
    }

    /// Check whether a buffer is currently handed out.
    pub fn is_allocated(&self, idx: BufIdx) -> bool {
        self.is_valid(idx) && self.free.lock().in_use[idx.get() as usize]
    }

    /// Resolve a handle to its device-visible address.
    pub fn map(&self, idx: BufIdx) -> Result<DmaAddr> {
        if !self.is_valid(idx) {
            return Err(PoolError::InvalidHandle(idx));
        }
        Ok(DmaAddr(self.bus.base + idx.get() as u64 * self.buf_size as u64))
    }

    /// Resolve a handle to its CPU pointer.
    pub fn buffer_ptr(&self, idx: BufIdx) -> Option<NonNull<u8>> {
        if !self.is_valid(idx) {
            return None;
        }
        // SAFETY: idx <= count, so the offset stays inside the region.
        let ptr = unsafe { self.region.as_ptr().add(idx.get() as usize * self.buf_size) };
        NonNull::new(ptr)
    }

    /// Translate a bus address range back to a CPU pointer.
    ///
    /// The range must lie inside a single usable buffer. Used by device
    /// models to perform their side of a DMA transfer.
    pub fn translate(&self, addr: DmaAddr, len: usize) -> Option<NonNull<u8>> {
        if !self.bus.contains(addr.get(), len) {
            return None;
        }
        let offset = (addr.get() - self.bus.base) as usize;
        let idx = offset / self.buf_size;
        if idx == 0 || idx > self.count || offset % self.buf_size + len > self.buf_size {
            return None;
        }
        // SAFETY: bounds checked against the region above.
        NonNull::new(unsafe { self.region.as_ptr().add(offset) })
    }

    /// Borrow a buffer's bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the buffer under the ring protocol: no device
    /// or other thread may write it for the lifetime of the slice.
    pub unsafe fn buffer(&self, idx: BufIdx) -> Option<&[u8]> {
        let ptr = self.buffer_ptr(idx)?;
        Some(core::slice::from_raw_parts(ptr.as_ptr(), self.buf_size))
    }

    /// Borrow a buffer's bytes mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the buffer exclusively under the ring protocol
    /// for the lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_mut(&self, idx: BufIdx) -> Option<&mut [u8]> {
        let ptr = self.buffer_ptr(idx)?;
        Some(core::slice::from_raw_parts_mut(ptr.as_ptr(), self.buf_size))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: region was allocated with exactly this layout.
        unsafe { dealloc(self.region.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buf_size", &self.buf_size)
            .field("count", &self.count)
            .field("bus", &self.bus)
            .finish()
    }
}

// SAFETY: the region is only reached through handles; the free list is
// behind a spin lock, and byte access is governed by the ring protocol.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert_eq!(BufferPool::new(0, 2048).unwrap_err(), PoolError::ZeroBuffers);
        assert_eq!(
            BufferPool::new(4, 100).unwrap_err(),
            PoolError::InvalidBufferSize(100)
        );
        assert_eq!(
            BufferPool::new(4, 32).unwrap_err(),
            PoolError::InvalidBufferSize(32)
        );
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = BufferPool::new(3, 2048).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!((a, b, c), (BufIdx(1), BufIdx(2), BufIdx(3)));
        assert_eq!(pool.alloc(), Err(PoolError::OutOfBuffers));
        assert_eq!(pool.in_use(), 3);

        pool.free(b).unwrap();
        assert_eq!(pool.alloc(), Ok(b));
    }

    #[test]
    fn test_reserved_handle_never_resolves() {
        let pool = BufferPool::new(4, 2048).unwrap();
        assert!(!pool.is_valid(BufIdx::RESERVED));
        assert!(pool.map(BufIdx::RESERVED).is_err());
        assert!(pool.buffer_ptr(BufIdx::RESERVED).is_none());
        assert!(!pool.is_valid(BufIdx(5)));
    }

    #[test]
    fn test_double_free() {
        let pool = BufferPool::new(2, 2048).unwrap();
        let a = pool.alloc().unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(PoolError::DoubleFree(a)));
        assert_eq!(pool.free(BufIdx(9)), Err(PoolError::InvalidHandle(BufIdx(9))));
    }

    #[test]
    fn test_translate_matches_map() {
        let pool = BufferPool::new(8, 2048).unwrap();
        let idx = BufIdx(5);
        let addr = pool.map(idx).unwrap();
        assert_eq!(pool.translate(addr, 2048), pool.buffer_ptr(idx));

        // Crossing into the next buffer is refused.
        assert!(pool.translate(DmaAddr(addr.get() + 1), 2048).is_none());
        // The reserved buffer is not reachable either.
        assert!(pool.translate(DmaAddr(BUS_BASE), 64).is_none());
    }

    #[test]
    fn test_buffers_do_not_alias() {
        let pool = BufferPool::new(2, 64).unwrap();
        unsafe {
            pool.buffer_mut(BufIdx(1)).unwrap().fill(0xAA);
            pool.buffer_mut(BufIdx(2)).unwrap().fill(0x55);
            assert!(pool.buffer(BufIdx(1)).unwrap().iter().all(|&b| b == 0xAA));
            assert!(pool.buffer(BufIdx(2)).unwrap().iter().all(|&b| b == 0x55));
        }
    }
}
