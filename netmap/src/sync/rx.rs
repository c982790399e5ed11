//! Receive reconciler.
//!
//! # Algorithm
//!
//! 1. Ingest: walk descriptors from `next_to_check` while the device has
//!    marked them done, copying each length into its slot.
//! 2. Recycle: for slots the consumer released (`hw_cur..cursor`), re-bind
//!    swapped buffers and clear the done marker, then program the tail
//!    (RDT) to `hw_cur - 1`.
//!
//! The tail always trails `hw_cur` by one, so the device never writes into
//! a descriptor whose slot has not been recycled.

use core::sync::atomic::{fence, Ordering};

use dma_pool::BufferPool;
use log::debug;

use super::{
    fail, populate, precheck, rebind_if_changed, release, repair_slots, reset_hw_queue,
    ReinitReport,
};
use crate::device::{NicDevice, QueueId};
use crate::error::{AdapterError, ReinitReason, ReinitRequired};
use crate::ring::{Ring, RingState};

// ═══════════════════════════════════════════════════════════════════════════
// DONE DESCRIPTORS
// ═══════════════════════════════════════════════════════════════════════════

/// Lazy walk over consecutive completed receive descriptors.
///
/// Yields `(index, len)` and stops at the first descriptor the device has
/// not marked done, or after `budget` descriptors.
pub struct DoneDescriptors<'a, D: ?Sized> {
    dev: &'a D,
    queue: QueueId,
    pos: usize,
    remaining: usize,
    num_slots: usize,
}

impl<'a, D: NicDevice + ?Sized> DoneDescriptors<'a, D> {
    /// Start at `pos` on a queue of `num_slots` descriptors.
    pub fn new(dev: &'a D, queue: QueueId, pos: usize, budget: usize, num_slots: usize) -> Self {
        Self {
            dev,
            queue,
            pos,
            remaining: budget,
            num_slots,
        }
    }
}

impl<D: NicDevice + ?Sized> Iterator for DoneDescriptors<'_, D> {
    type Item = (usize, u16);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = match self.dev.descriptor_is_done(self.queue, self.pos) {
            Some(len) => len,
            None => {
                self.remaining = 0;
                return None;
            }
        };
        let i = self.pos;
        self.pos = (self.pos + 1) % self.num_slots;
        self.remaining -= 1;
        Some((i, len))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RX KRING
// ═══════════════════════════════════════════════════════════════════════════

/// Receive ring plus driver-side state.
#[derive(Debug)]
pub struct RxKring {
    ring: Ring,
    queue: QueueId,
    /// Next descriptor to test for completion.
    next_to_check: usize,
}

impl RxKring {
    /// Inactive ring of `num_slots` for `queue`.
    pub fn new(queue: QueueId, num_slots: usize) -> Self {
        Self {
            ring: Ring::new(num_slots),
            queue,
            next_to_check: 0,
        }
    }

    /// Ring state.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Mutable ring state, for the consumer side.
    pub fn ring_mut(&mut self) -> &mut Ring {
        &mut self.ring
    }

    /// Hardware queue this ring drives.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Next descriptor to test for completion.
    pub fn next_to_check(&self) -> usize {
        self.next_to_check
    }

    // ───────────────────────────────────────────────────────────────────────
    // Registration
    // ───────────────────────────────────────────────────────────────────────

    /// Populate the ring and give all but one descriptor to the device.
    pub(crate) fn attach<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
    ) -> Result<(), AdapterError> {
        dev.reset_queue(self.queue)?;
        populate(&mut self.ring, self.queue, dev, pool)?;
        self.next_to_check = 0;
        self.ring.reset_cursors(0, 0);
        dev.write_tail(self.queue, self.ring.limit())?;
        Ok(())
    }

    /// Release every buffer and go inactive.
    pub(crate) fn detach(&mut self, pool: &BufferPool) -> usize {
        self.next_to_check = 0;
        release(&mut self.ring, pool)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Sync
    // ───────────────────────────────────────────────────────────────────────

    /// Pick up received frames and give slots `hw_cur..cursor` back to the
    /// device.
    pub fn sync<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
        cursor: usize,
    ) -> Result<(), ReinitRequired> {
        precheck(&mut self.ring, self.queue, cursor)?;

        let ingested = match self.ingest(dev, pool) {
            Ok(n) => n,
            Err(reason) => return Err(fail(&mut self.ring, self.queue, reason)),
        };
        let recycled = self.recycle(dev, pool, cursor)?;
        self.ring.publish_avail();

        debug!(
            "{}: ingested {} recycled {} avail {}",
            self.queue,
            ingested,
            recycled,
            self.ring.avail()
        );
        Ok(())
    }

    /// Move completed descriptors into consumer ownership.
    ///
    /// Descriptors accepted before a bad one stay ingested.
    fn ingest<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
    ) -> Result<usize, ReinitReason> {
        let max = pool.buf_size();
        let budget = self.ring.device_owned();
        let start = self.next_to_check;
        let mut n = 0;
        let mut outcome = Ok(());

        for (i, len) in DoneDescriptors::new(dev, self.queue, start, budget, self.ring.num_slots())
        {
            if len as usize > max {
                outcome = Err(ReinitReason::OversizedLength {
                    slot: i,
                    len: len as usize,
                    max,
                });
                break;
            }
            // Payload written by the device must be visible before the slot is.
            fence(Ordering::Acquire);
            self.ring.slot_mut(i).len = len;
            n += 1;
        }

        self.next_to_check = (start + n) % self.ring.num_slots();
        self.ring.hw_avail += n;
        outcome.map(|()| n)
    }

    /// Return released slots to the device.
    fn recycle<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
        cursor: usize,
    ) -> Result<usize, ReinitRequired> {
        let span = self.ring.distance(self.ring.hw_cur, cursor);
        if span == 0 {
            return Ok(0);
        }
        if span > self.ring.hw_avail {
            let avail = self.ring.hw_avail;
            return Err(fail(
                &mut self.ring,
                self.queue,
                ReinitReason::SpanExceedsAvail { span, avail },
            ));
        }

        let mut j = self.ring.hw_cur;
        let mut recycled = 0;
        let mut outcome = Ok(());
        while j != cursor {
            let step = rebind_if_changed(&mut self.ring, self.queue, dev, pool, j)
                .and_then(|()| dev.clear_done(self.queue, j).map_err(ReinitReason::from));
            if let Err(reason) = step {
                outcome = Err(reason);
                break;
            }
            recycled += 1;
            j = self.ring.next(j);
        }

        if recycled > 0 {
            self.ring.hw_cur = j;
            self.ring.hw_avail -= recycled;
            self.ring.publish_avail();
            if let Err(e) = dev.write_tail(self.queue, self.ring.prev(j)) {
                outcome = outcome.and(Err(e.into()));
            }
        }

        match outcome {
            Ok(()) => Ok(recycled),
            Err(reason) => Err(fail(&mut self.ring, self.queue, reason)),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reinitialization
    // ───────────────────────────────────────────────────────────────────────

    /// Re-derive cursors from the completed descriptors and return to
    /// service.
    ///
    /// Everything between `hw_cur` and `next_to_check` is consumer-owned
    /// again, then outstanding done descriptors are ingested. If the device
    /// reports a length that cannot be trusted, the hardware queue is reset
    /// and refilled.
    pub fn reinitialize<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
    ) -> Result<ReinitReport, ReinitRequired> {
        if self.ring.state() == RingState::Inactive {
            return Err(ReinitRequired::new(self.queue, ReinitReason::Inactive));
        }
        let repaired = repair_slots(&mut self.ring, pool);
        self.ring.hw_avail = self.ring.distance(self.ring.hw_cur, self.next_to_check);

        let queue_reset = self.ingest(dev, pool).is_err();
        if queue_reset {
            if let Err(reason) = reset_hw_queue(&mut self.ring, self.queue, dev, pool) {
                return Err(fail(&mut self.ring, self.queue, reason));
            }
            self.ring.hw_cur = 0;
            self.ring.hw_avail = 0;
            self.next_to_check = 0;
        }

        let tail = self.ring.prev(self.ring.hw_cur);
        if let Err(e) = dev.write_tail(self.queue, tail) {
            return Err(fail(&mut self.ring, self.queue, e));
        }

        let (hw_cur, avail) = (self.ring.hw_cur, self.ring.hw_avail);
        self.ring.reset_cursors(hw_cur, avail);
        debug!(
            "{}: reinitialized hw_cur {} avail {} repaired {}{}",
            self.queue,
            hw_cur,
            avail,
            repaired,
            if queue_reset { " (queue reset)" } else { "" }
        );
        Ok(ReinitReport {
            queue: self.queue,
            repaired,
            hw_cur,
            avail,
            queue_reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dma_pool::BufIdx;

    use super::*;
    use crate::device::sim::{SimConfig, SimulatedNic};

    fn setup(n: usize) -> (SimulatedNic, Arc<BufferPool>, RxKring) {
        let pool = Arc::new(BufferPool::new(4 * n, 2048).unwrap());
        let nic = SimulatedNic::new(SimConfig::new("sim0", 1, n), pool.clone());
        let mut kring = RxKring::new(QueueId::rx(0), n);
        kring.attach(&nic, &pool).unwrap();
        (nic, pool, kring)
    }

    #[test]
    fn test_attach_gives_device_all_but_one() {
        let (nic, _pool, kring) = setup(8);
        assert_eq!(nic.tail(QueueId::rx(0)), Some(7));
        assert_eq!(nic.rx_room(0), 7);
        assert_eq!(kring.ring().avail(), 0);
    }

    #[test]
    fn test_done_descriptors_stop_at_first_gap() {
        let (nic, _pool, _kring) = setup(8);
        nic.mark_descriptor_done(0, 2, 60);
        nic.mark_descriptor_done(0, 3, 61);
        nic.mark_descriptor_done(0, 5, 62);
        let seen: Vec<_> = DoneDescriptors::new(&nic, QueueId::rx(0), 2, 7, 8).collect();
        assert_eq!(seen, vec![(2, 60), (3, 61)]);
        let bounded: Vec<_> = DoneDescriptors::new(&nic, QueueId::rx(0), 2, 1, 8).collect();
        assert_eq!(bounded, vec![(2, 60)]);
    }

    #[test]
    fn test_ingest_then_recycle() {
        let (nic, pool, mut kring) = setup(8);
        for len in [60u16, 70, 80] {
            assert!(nic.inject_rx(0, &vec![0xAB; len as usize]));
        }
        kring.sync(&nic, &pool, 0).unwrap();
        assert_eq!(kring.ring().avail(), 3);
        assert_eq!(kring.ring().slot(1).len, 70);
        assert_eq!(kring.next_to_check(), 3);

        // Release two of them.
        kring.ring_mut().advance(2);
        let cur = kring.ring().cur();
        kring.sync(&nic, &pool, cur).unwrap();
        assert_eq!(kring.ring().hw_cur(), 2);
        assert_eq!(kring.ring().avail(), 1);
        assert_eq!(nic.tail(QueueId::rx(0)), Some(1));
        assert_eq!(nic.descriptor_is_done(QueueId::rx(0), 0), None);
        assert_eq!(nic.descriptor_is_done(QueueId::rx(0), 2), Some(80));
    }

    #[test]
    fn test_device_never_overruns_unrecycled_slots() {
        let (nic, pool, mut kring) = setup(8);
        let frame = [0x11u8; 64];
        let delivered = (0..20).filter(|_| nic.inject_rx(0, &frame)).count();
        assert_eq!(delivered, 7);
        kring.sync(&nic, &pool, 0).unwrap();
        assert_eq!(kring.ring().avail(), 7);
        assert!(!nic.inject_rx(0, &frame));
    }

    #[test]
    fn test_recycle_span_beyond_avail_fails() {
        let (nic, pool, mut kring) = setup(8);
        nic.inject_rx(0, &[0u8; 64]);
        let err = kring.sync(&nic, &pool, 4).unwrap_err();
        assert_eq!(
            err.reason,
            ReinitReason::SpanExceedsAvail { span: 4, avail: 1 }
        );
        assert_eq!(kring.ring().state(), RingState::NeedsReinit);
    }

    #[test]
    fn test_oversized_device_length_resets_queue() {
        let (nic, pool, mut kring) = setup(8);
        nic.inject_rx(0, &[0u8; 64]);
        nic.mark_descriptor_done(0, 1, 4000);
        let err = kring.sync(&nic, &pool, 0).unwrap_err();
        assert!(matches!(err.reason, ReinitReason::OversizedLength { slot: 1, .. }));
        assert_eq!(kring.next_to_check(), 1);

        let report = kring.reinitialize(&nic, &pool).unwrap();
        assert!(report.queue_reset);
        assert_eq!((report.hw_cur, report.avail), (0, 0));
        assert_eq!(nic.tail(QueueId::rx(0)), Some(7));
        assert!(nic.inject_rx(0, &[1u8; 64]));
    }

    #[test]
    fn test_reinitialize_restores_bad_handle() {
        let (nic, pool, mut kring) = setup(8);
        nic.inject_rx(0, &[0u8; 64]);
        kring.sync(&nic, &pool, 0).unwrap();
        kring.ring_mut().slot_mut(0).set_buffer(BufIdx(9999));
        kring.ring_mut().advance(1);
        assert!(kring.sync(&nic, &pool, 1).is_err());

        let report = kring.reinitialize(&nic, &pool).unwrap();
        assert_eq!(report.repaired, 1);
        assert!(!report.queue_reset);
        assert_eq!((report.hw_cur, report.avail), (0, 1));
        assert_eq!(kring.ring().slot(0).buf_idx, kring.ring().bound(0));
        kring.sync(&nic, &pool, 1).unwrap();
    }
}
