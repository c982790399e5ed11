//! Ring slot: one consumer-visible descriptor.

use bitflags::bitflags;
use dma_pool::BufIdx;

bitflags! {
    /// Per-slot state flags set by the consumer and consumed by the reconcilers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u16 {
        /// The buffer handle changed; the DMA mapping must be reloaded.
        const BUF_CHANGED = 0x0001;
        /// Request a completion report for this slot.
        const REPORT = 0x0002;
    }
}

/// One ring entry.
///
/// The buffer handle is a weak reference into the buffer pool; the ring
/// never frees pool memory on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
    /// Packet buffer.
    pub buf_idx: BufIdx,
    /// Bytes of valid data in the buffer.
    pub len: u16,
    /// State flags.
    pub flags: SlotFlags,
}

impl Slot {
    /// Slot pointing at `buf_idx`, empty.
    pub const fn new(buf_idx: BufIdx) -> Self {
        Self {
            buf_idx,
            len: 0,
            flags: SlotFlags::empty(),
        }
    }

    /// Swap in a different buffer and flag the mapping for reload.
    pub fn set_buffer(&mut self, buf_idx: BufIdx) {
        self.buf_idx = buf_idx;
        self.flags.insert(SlotFlags::BUF_CHANGED);
    }

    /// Ask for a completion report when this slot is transmitted.
    pub fn request_report(&mut self) {
        self.flags.insert(SlotFlags::REPORT);
    }

    /// Check for a pending buffer change.
    #[inline]
    pub fn buffer_changed(&self) -> bool {
        self.flags.contains(SlotFlags::BUF_CHANGED)
    }
}
