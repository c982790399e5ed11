//! Ring reconcilers.
//!
//! [`TxKring`] and [`RxKring`] pair a [`Ring`] with the per-direction
//! driver state (`next_to_clean`, `next_to_check`) and implement the two
//! sync algorithms plus ring reinitialization. They assume the caller
//! holds the ring lock; [`crate::Adapter`] provides that.
//!
//! # Reference
//! netmap `if_em_netmap.h`: `em_netmap_txsync`, `em_netmap_rxsync`

pub mod rx;
pub mod tx;

pub use rx::{DoneDescriptors, RxKring};
pub use tx::TxKring;

use dma_pool::BufferPool;
use log::{debug, error, warn};

use crate::device::{NicDevice, QueueId};
use crate::error::{AdapterError, ReinitReason, ReinitRequired};
use crate::ring::{Ring, RingState, Slot, SlotFlags};

/// Outcome of a successful reinitialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReinitReport {
    /// Ring that was reinitialized.
    pub queue: QueueId,
    /// Slots whose handle or length had to be restored.
    pub repaired: usize,
    /// Hardware cursor after reinitialization.
    pub hw_cur: usize,
    /// Slots owned by the consumer after reinitialization.
    pub avail: usize,
    /// The hardware queue itself had to be reset.
    pub queue_reset: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Put the ring in `NeedsReinit` and build the error.
fn fail(ring: &mut Ring, queue: QueueId, reason: impl Into<ReinitReason>) -> ReinitRequired {
    let err = ReinitRequired::new(queue, reason);
    ring.request_reinit();
    error!("{}", err);
    err
}

/// Entry checks shared by both sync directions. No state is touched
/// unless the call is rejected.
fn precheck(ring: &mut Ring, queue: QueueId, cursor: usize) -> Result<(), ReinitRequired> {
    match ring.state() {
        RingState::Inactive => return Err(ReinitRequired::new(queue, ReinitReason::Inactive)),
        RingState::NeedsReinit => {
            return Err(ReinitRequired::new(queue, ReinitReason::ReinitPending))
        }
        RingState::Active => {}
    }
    if ring.reinit_requested() {
        return Err(fail(ring, queue, ReinitReason::ReinitPending));
    }
    if cursor > ring.limit() {
        let limit = ring.limit();
        return Err(fail(
            ring,
            queue,
            ReinitReason::CursorOutOfRange { cursor, limit },
        ));
    }
    Ok(())
}

/// Re-bind a slot whose buffer changed and clear the flag.
fn rebind_if_changed<D: NicDevice + ?Sized>(
    ring: &mut Ring,
    queue: QueueId,
    dev: &D,
    pool: &BufferPool,
    j: usize,
) -> Result<(), ReinitReason> {
    let slot = *ring.slot(j);
    let addr = pool.map(slot.buf_idx).map_err(|_| ReinitReason::InvalidBuffer {
        slot: j,
        buf: slot.buf_idx,
    })?;
    if slot.buffer_changed() {
        dev.bind_dma(queue, j, addr, pool.buf_size())?;
        ring.set_bound(j, slot.buf_idx);
        ring.slot_mut(j).flags.remove(SlotFlags::BUF_CHANGED);
    }
    Ok(())
}

/// Restore slots that would fail validation.
///
/// An unresolvable handle goes back to the buffer bound in hardware, an
/// oversized length becomes zero. Returns the number of slots touched.
fn repair_slots(ring: &mut Ring, pool: &BufferPool) -> usize {
    let max = pool.buf_size();
    let mut repaired = 0;
    for i in 0..ring.num_slots() {
        let bound = ring.bound(i);
        let slot = ring.slot_mut(i);
        let mut touched = false;
        if !pool.is_valid(slot.buf_idx) {
            warn!("slot {}: restoring buffer {:?} -> {:?}", i, slot.buf_idx, bound);
            slot.buf_idx = bound;
            touched = true;
        }
        if slot.len as usize > max {
            slot.len = 0;
            touched = true;
        }
        if touched {
            slot.flags.remove(SlotFlags::BUF_CHANGED | SlotFlags::REPORT);
            repaired += 1;
        }
    }
    repaired
}

/// Bind every descriptor of the queue to its slot's buffer.
fn rebind_all<D: NicDevice + ?Sized>(
    ring: &mut Ring,
    queue: QueueId,
    dev: &D,
    pool: &BufferPool,
) -> Result<(), ReinitReason> {
    for i in 0..ring.num_slots() {
        let buf = ring.slot(i).buf_idx;
        let addr = pool
            .map(buf)
            .map_err(|_| ReinitReason::InvalidBuffer { slot: i, buf })?;
        dev.bind_dma(queue, i, addr, pool.buf_size())?;
        ring.set_bound(i, buf);
        ring.slot_mut(i).flags.remove(SlotFlags::BUF_CHANGED);
    }
    Ok(())
}

/// Give every slot a fresh buffer and bind it into its descriptor.
///
/// On failure the slots populated so far keep their buffers; the caller
/// rolls back with [`release`].
fn populate<D: NicDevice + ?Sized>(
    ring: &mut Ring,
    queue: QueueId,
    dev: &D,
    pool: &BufferPool,
) -> Result<(), AdapterError> {
    for i in 0..ring.num_slots() {
        let buf = pool.alloc()?;
        *ring.slot_mut(i) = Slot::new(buf);
        let addr = pool.map(buf)?;
        dev.bind_dma(queue, i, addr, pool.buf_size())?;
        ring.set_bound(i, buf);
    }
    Ok(())
}

/// Return the ring's buffers to the pool and deactivate it.
fn release(ring: &mut Ring, pool: &BufferPool) -> usize {
    let mut freed = 0;
    for i in 0..ring.num_slots() {
        let buf = ring.slot(i).buf_idx;
        if pool.is_allocated(buf) && pool.free(buf).is_ok() {
            freed += 1;
        }
    }
    ring.deactivate();
    freed
}

/// Reset a hardware queue and re-bind every descriptor.
fn reset_hw_queue<D: NicDevice + ?Sized>(
    ring: &mut Ring,
    queue: QueueId,
    dev: &D,
    pool: &BufferPool,
) -> Result<(), ReinitReason> {
    debug!("{}: resetting hardware queue", queue);
    dev.reset_queue(queue).map_err(ReinitReason::from)?;
    rebind_all(ring, queue, dev, pool)
}

