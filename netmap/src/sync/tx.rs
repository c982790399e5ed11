//! Transmit reconciler.
//!
//! # Algorithm
//!
//! 1. Reclaim: read the hardware head (TDH). Every descriptor between
//!    `next_to_clean` and the head has been sent, its slot goes back to
//!    the consumer.
//! 2. Publish: write one descriptor per slot from `hw_cur` up to the
//!    requested cursor, re-binding buffers the consumer swapped, then move
//!    the tail (TDT) so the device picks them up.
//!
//! A report-status bit is set on slot 0, slot N/2 and every slot the
//! consumer flagged with `REPORT`, which bounds completion latency to
//! half a ring.

use dma_pool::BufferPool;
use log::{debug, warn};

use super::{
    fail, populate, precheck, rebind_if_changed, release, repair_slots, reset_hw_queue,
    ReinitReport,
};
use crate::device::{NicDevice, QueueId, TxCommand};
use crate::error::{AdapterError, ReinitReason, ReinitRequired};
use crate::ring::{Ring, RingState, SlotFlags};

/// Transmit ring plus driver-side state.
#[derive(Debug)]
pub struct TxKring {
    ring: Ring,
    queue: QueueId,
    /// Hardware head as of the last reclaim.
    next_to_clean: usize,
    /// Slot that always requests a status report besides slot 0.
    report_frequency: usize,
}

impl TxKring {
    /// Inactive ring of `num_slots` for `queue`.
    pub fn new(queue: QueueId, num_slots: usize) -> Self {
        Self {
            ring: Ring::new(num_slots),
            queue,
            next_to_clean: 0,
            report_frequency: num_slots / 2,
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

    /// Hardware head as of the last reclaim.
    pub fn next_to_clean(&self) -> usize {
        self.next_to_clean
    }

    /// Index of the mid-ring report slot.
    pub fn report_frequency(&self) -> usize {
        self.report_frequency
    }

    // ───────────────────────────────────────────────────────────────────────
    // Registration
    // ───────────────────────────────────────────────────────────────────────

    /// Populate the ring and hand the whole of it to the consumer.
    pub(crate) fn attach<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
    ) -> Result<(), AdapterError> {
        dev.reset_queue(self.queue)?;
        populate(&mut self.ring, self.queue, dev, pool)?;
        self.next_to_clean = 0;
        let limit = self.ring.limit();
        self.ring.reset_cursors(0, limit);
        Ok(())
    }

    /// Release every buffer and go inactive.
    pub(crate) fn detach(&mut self, pool: &BufferPool) -> usize {
        self.next_to_clean = 0;
        release(&mut self.ring, pool)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Sync
    // ───────────────────────────────────────────────────────────────────────

    /// Reconcile the ring with the device and publish slots up to `cursor`.
    ///
    /// On failure the ring is left in `NeedsReinit`. Descriptors written
    /// before a bad slot stay committed: `hw_cur` and the tail cover them.
    pub fn sync<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
        cursor: usize,
    ) -> Result<(), ReinitRequired> {
        precheck(&mut self.ring, self.queue, cursor)?;

        let reclaimed = match self.reclaim(dev) {
            Ok(n) => n,
            Err(reason) => return Err(fail(&mut self.ring, self.queue, reason)),
        };
        let published = self.publish(dev, pool, cursor)?;
        self.ring.publish_avail();

        debug!(
            "{}: reclaimed {} published {} avail {}",
            self.queue,
            reclaimed,
            published,
            self.ring.avail()
        );
        Ok(())
    }

    /// Read TDH, tolerating one wrap.
    fn read_head<D: NicDevice + ?Sized>(&self, dev: &D) -> Result<usize, ReinitReason> {
        let n = self.ring.num_slots();
        let raw = dev.read_completion_index(self.queue)?;
        let head = if raw >= n {
            warn!("{}: TDH wrap {}", self.queue, raw);
            raw - n
        } else {
            raw
        };
        if head >= n {
            return Err(ReinitReason::CompletionOutOfRange {
                index: raw,
                num_slots: n,
            });
        }
        Ok(head)
    }

    /// Return sent slots to the consumer.
    fn reclaim<D: NicDevice + ?Sized>(&mut self, dev: &D) -> Result<usize, ReinitReason> {
        let head = self.read_head(dev)?;
        let delta = self.ring.distance(self.next_to_clean, head);
        if delta == 0 {
            return Ok(0);
        }
        let in_flight = self.ring.device_owned();
        if delta > in_flight {
            return Err(ReinitReason::CompletionOverrun { delta, in_flight });
        }
        self.ring.hw_avail += delta;
        self.next_to_clean = head;
        Ok(delta)
    }

    /// Hand slots `hw_cur..cursor` to the device.
    fn publish<D: NicDevice + ?Sized>(
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
        let mut written = 0;
        let mut outcome = Ok(());
        while j != cursor {
            if let Err(reason) = self.write_slot(dev, pool, j) {
                outcome = Err(reason);
                break;
            }
            written += 1;
            j = self.ring.next(j);
        }

        if written > 0 {
            self.ring.hw_cur = j;
            self.ring.hw_avail -= written;
            self.ring.publish_avail();
            if let Err(e) = dev.write_tail(self.queue, j) {
                outcome = outcome.and(Err(e.into()));
            }
        }

        match outcome {
            Ok(()) => Ok(written),
            Err(reason) => Err(fail(&mut self.ring, self.queue, reason)),
        }
    }

    /// Validate slot `j` and write its descriptor.
    fn write_slot<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
        j: usize,
    ) -> Result<(), ReinitReason> {
        let slot = *self.ring.slot(j);
        if slot.len as usize > pool.buf_size() {
            return Err(ReinitReason::OversizedLength {
                slot: j,
                len: slot.len as usize,
                max: pool.buf_size(),
            });
        }
        rebind_if_changed(&mut self.ring, self.queue, dev, pool, j)?;

        let mut cmd = TxCommand::EOP | TxCommand::IFCS;
        if slot.flags.contains(SlotFlags::REPORT) || j == 0 || j == self.report_frequency {
            cmd |= TxCommand::RS;
        }
        dev.write_tx_descriptor(self.queue, j, cmd, slot.len)?;
        self.ring.slot_mut(j).flags.remove(SlotFlags::REPORT);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reinitialization
    // ───────────────────────────────────────────────────────────────────────

    /// Re-derive cursors from the hardware head and return to service.
    ///
    /// If the head lies outside the window of descriptors last handed to
    /// the device, the hardware queue is reset and every descriptor is
    /// re-bound.
    pub fn reinitialize<D: NicDevice + ?Sized>(
        &mut self,
        dev: &D,
        pool: &BufferPool,
    ) -> Result<ReinitReport, ReinitRequired> {
        if self.ring.state() == RingState::Inactive {
            return Err(ReinitRequired::new(self.queue, ReinitReason::Inactive));
        }
        let repaired = repair_slots(&mut self.ring, pool);
        let hw_cur = self.ring.hw_cur;
        let window = self.ring.distance(self.next_to_clean, hw_cur);

        let head = self
            .read_head(dev)
            .ok()
            .filter(|&head| self.ring.distance(self.next_to_clean, head) <= window);

        let (hw_cur, in_flight, queue_reset) = match head {
            Some(head) => {
                self.next_to_clean = head;
                (hw_cur, self.ring.distance(head, hw_cur), false)
            }
            None => {
                if let Err(reason) = reset_hw_queue(&mut self.ring, self.queue, dev, pool) {
                    return Err(fail(&mut self.ring, self.queue, reason));
                }
                self.next_to_clean = 0;
                (0, 0, true)
            }
        };

        let avail = self.ring.limit() - in_flight;
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
