//! Fixed-capacity descriptor ring.
//!
//! A ring of N slots keeps one slot of slack, so at most N-1 slots are
//! ever owned by one side and `hw_cur == cur` always means "nothing to do"
//! rather than "everything to do".
//!
//! Ownership split:
//!
//! ```text
//!        hw_cur                 hw_cur + hw_avail
//!          |---- consumer owned ----|---- device owned ----|
//! ```
//!
//! `cur` and `avail` are the consumer's view. The consumer moves `cur`
//! forward; the reconcilers move `hw_cur` up to it and recompute `avail`.

use dma_pool::BufIdx;

use super::slot::Slot;

/// Distance from `from` to `to` walking forward on a ring of `n` slots.
#[inline]
pub const fn ring_distance(from: usize, to: usize, n: usize) -> usize {
    if to >= from {
        to - from
    } else {
        to + n - from
    }
}

/// Lifecycle state of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Not registered; sync calls are rejected.
    Inactive,
    /// Registered and consistent.
    Active,
    /// A reconciler detected an inconsistency; only reinitialize helps.
    NeedsReinit,
}

/// Descriptor ring shared by a hardware queue and a consumer.
pub struct Ring {
    /// Consumer-visible slots.
    slots: Box<[Slot]>,
    /// Buffer currently programmed into each hardware descriptor.
    bound: Box<[BufIdx]>,
    /// First slot not yet handed to the device.
    pub(crate) hw_cur: usize,
    /// Slots owned by the consumer, as last reconciled.
    pub(crate) hw_avail: usize,
    /// Consumer cursor.
    cur: usize,
    /// Consumer's view of `hw_avail`.
    avail: usize,
    /// Set on validation failure, cleared by reinitialize.
    reinit_requested: bool,
    /// Lifecycle state.
    state: RingState,
}

impl Ring {
    /// Create an inactive ring of `num_slots` empty slots.
    ///
    /// # Panics
    /// Panics if `num_slots < 2`; a ring needs one slot of slack.
    pub fn new(num_slots: usize) -> Self {
        assert!(num_slots >= 2, "ring needs at least two slots");
        Self {
            slots: vec![Slot::default(); num_slots].into_boxed_slice(),
            bound: vec![BufIdx::RESERVED; num_slots].into_boxed_slice(),
            hw_cur: 0,
            hw_avail: 0,
            cur: 0,
            avail: 0,
            reinit_requested: false,
            state: RingState::Inactive,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Geometry
    // ───────────────────────────────────────────────────────────────────────

    /// Number of slots (N).
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Highest slot index, also the most slots one side can own (N-1).
    #[inline]
    pub fn limit(&self) -> usize {
        self.slots.len() - 1
    }

    /// Index after `i`.
    #[inline]
    pub fn next(&self, i: usize) -> usize {
        if i == self.limit() {
            0
        } else {
            i + 1
        }
    }

    /// Index before `i`.
    #[inline]
    pub fn prev(&self, i: usize) -> usize {
        if i == 0 {
            self.limit()
        } else {
            i - 1
        }
    }

    /// Forward distance between two indices on this ring.
    #[inline]
    pub fn distance(&self, from: usize, to: usize) -> usize {
        ring_distance(from, to, self.num_slots())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Consumer view
    // ───────────────────────────────────────────────────────────────────────

    /// Consumer cursor.
    #[inline]
    pub fn cur(&self) -> usize {
        self.cur
    }

    /// Slots owned by the consumer after the last reconciliation.
    #[inline]
    pub fn avail(&self) -> usize {
        self.avail
    }

    /// Set the consumer cursor. Validated by the next sync call.
    #[inline]
    pub fn set_cur(&mut self, cur: usize) {
        self.cur = cur;
    }

    /// Move the consumer cursor forward by up to `n` owned slots.
    ///
    /// Returns the number of slots actually advanced.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.avail);
        self.cur = (self.cur + n) % self.num_slots();
        self.avail -= n;
        n
    }

    /// Slot at `i`.
    #[inline]
    pub fn slot(&self, i: usize) -> &Slot {
        &self.slots[i]
    }

    /// Mutable slot at `i`.
    #[inline]
    pub fn slot_mut(&mut self, i: usize) -> &mut Slot {
        &mut self.slots[i]
    }

    /// All slots.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slots owned by the consumer, starting at `cur`.
    ///
    /// Each call starts over from the current cursor.
    pub fn pending(&self) -> PendingSlots<'_> {
        PendingSlots {
            ring: self,
            pos: self.cur,
            remaining: self.avail,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reconciler view
    // ───────────────────────────────────────────────────────────────────────

    /// First slot not yet handed to the device.
    #[inline]
    pub fn hw_cur(&self) -> usize {
        self.hw_cur
    }

    /// Consumer-owned slots as tracked by the reconciler.
    #[inline]
    pub fn hw_avail(&self) -> usize {
        self.hw_avail
    }

    /// Slots currently owned by the device.
    #[inline]
    pub fn device_owned(&self) -> usize {
        self.limit() - self.hw_avail
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> RingState {
        self.state
    }

    /// Check for a pending reinitialization request.
    #[inline]
    pub fn reinit_requested(&self) -> bool {
        self.reinit_requested
    }

    /// Buffer currently bound into hardware descriptor `i`.
    #[inline]
    pub fn bound(&self, i: usize) -> BufIdx {
        self.bound[i]
    }

    pub(crate) fn set_bound(&mut self, i: usize, buf: BufIdx) {
        self.bound[i] = buf;
    }

    /// Copy the reconciled cursor and count into the consumer view.
    ///
    /// After a sync the consumer cursor always equals `hw_cur`, whatever
    /// cursor the caller passed in.
    pub(crate) fn publish_avail(&mut self) {
        self.cur = self.hw_cur;
        self.avail = self.hw_avail;
    }

    /// Flag the ring as inconsistent.
    pub(crate) fn request_reinit(&mut self) {
        self.reinit_requested = true;
        self.state = RingState::NeedsReinit;
    }

    /// Reset cursors to a device-derived position and return to service.
    pub(crate) fn reset_cursors(&mut self, hw_cur: usize, hw_avail: usize) {
        debug_assert!(hw_cur <= self.limit() && hw_avail <= self.limit());
        self.hw_cur = hw_cur;
        self.hw_avail = hw_avail;
        self.cur = hw_cur;
        self.avail = hw_avail;
        self.reinit_requested = false;
        self.state = RingState::Active;
    }

    /// Take the ring out of service and forget every buffer.
    pub(crate) fn deactivate(&mut self) {
        self.slots.fill(Slot::default());
        self.bound.fill(BufIdx::RESERVED);
        self.hw_cur = 0;
        self.hw_avail = 0;
        self.cur = 0;
        self.avail = 0;
        self.reinit_requested = false;
        self.state = RingState::Inactive;
    }
}

impl core::fmt::Debug for Ring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("num_slots", &self.num_slots())
            .field("hw_cur", &self.hw_cur)
            .field("hw_avail", &self.hw_avail)
            .field("cur", &self.cur)
            .field("avail", &self.avail)
            .field("state", &self.state)
            .finish()
    }
}

/// Iterator over consumer-owned slots, see [`Ring::pending`].
pub struct PendingSlots<'a> {
    ring: &'a Ring,
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for PendingSlots<'a> {
    type Item = (usize, &'a Slot);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let i = self.pos;
        self.pos = self.ring.next(i);
        self.remaining -= 1;
        Some((i, self.ring.slot(i)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for PendingSlots<'_> {}
