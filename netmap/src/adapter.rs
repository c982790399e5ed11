//! Lock/reinit coordinator.
//!
//! An [`Adapter`] puts the queues of one interface in netmap mode and owns
//! their rings. Each ring sits behind its own spin lock; a core lock guards
//! registration. With `separate_locks` off, every ring guard also holds
//! the core lock, serializing all rings of the interface.
//!
//! Lock order is always core, then ring.
//!
//! # Ring state machine
//!
//! ```text
//! Inactive --register--> Active --sync--> Active
//!                          |  ^
//!                  failure |  | reinitialize
//!                          v  |
//!                       NeedsReinit
//! any --deregister--> Inactive
//! ```

use std::sync::Arc;

use dma_pool::{BufIdx, BufferPool};
use log::{info, warn};
use spin::{Mutex, MutexGuard};

use crate::config::AdapterConfig;
use crate::device::{NicDevice, QueueId};
use crate::error::{AdapterError, Error, ReinitRequired};
use crate::ring::{PendingSlots, Ring, RingState};
use crate::sync::{ReinitReport, RxKring, TxKring};

/// Interface-wide state behind the core lock.
#[derive(Debug, Default)]
struct CoreState {
    registered: bool,
}

/// One interface in netmap mode.
pub struct Adapter<D: NicDevice> {
    device: Arc<D>,
    pool: Arc<BufferPool>,
    config: AdapterConfig,
    core: Mutex<CoreState>,
    tx: Box<[Mutex<TxKring>]>,
    rx: Box<[Mutex<RxKring>]>,
}

impl<D: NicDevice> Adapter<D> {
    /// Build an unregistered adapter.
    ///
    /// The device must expose at least `num_queues` queue pairs with the
    /// configured descriptor counts, and the pool's buffers must be at
    /// least `buffer_size` bytes.
    pub fn new(
        device: Arc<D>,
        pool: Arc<BufferPool>,
        config: AdapterConfig,
    ) -> Result<Self, AdapterError> {
        config.validate()?;
        if device.num_queues() < config.num_queues {
            return Err(AdapterError::InvalidConfig(format!(
                "{} has {} queues, {} requested",
                device.name(),
                device.num_queues(),
                config.num_queues
            )));
        }
        if pool.buf_size() < config.buffer_size {
            return Err(AdapterError::InvalidConfig(format!(
                "pool buffers of {} bytes, {} required",
                pool.buf_size(),
                config.buffer_size
            )));
        }
        for q in 0..config.num_queues {
            for (queue, want) in [
                (QueueId::tx(q), config.num_tx_desc),
                (QueueId::rx(q), config.num_rx_desc),
            ] {
                let have = device.num_descriptors(queue)?;
                if have != want {
                    return Err(AdapterError::InvalidConfig(format!(
                        "{} has {} descriptors, {} configured",
                        queue, have, want
                    )));
                }
            }
        }

        let tx = (0..config.num_queues)
            .map(|q| Mutex::new(TxKring::new(QueueId::tx(q), config.num_tx_desc)))
            .collect();
        let rx = (0..config.num_queues)
            .map(|q| Mutex::new(RxKring::new(QueueId::rx(q), config.num_rx_desc)))
            .collect();

        Ok(Self {
            device,
            pool,
            config,
            core: Mutex::new(CoreState::default()),
            tx,
            rx,
        })
    }

    /// Build and register an adapter, ready for sync calls.
    pub fn open(
        device: Arc<D>,
        pool: Arc<BufferPool>,
        config: AdapterConfig,
    ) -> Result<Arc<Self>, AdapterError> {
        let adapter = Self::new(device, pool, config)?;
        adapter.register()?;
        Ok(Arc::new(adapter))
    }

    /// The device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Configuration the adapter was built with.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Queue pairs in use.
    pub fn num_queues(&self) -> u16 {
        self.config.num_queues
    }

    /// Check whether the interface is in netmap mode.
    pub fn is_registered(&self) -> bool {
        self.core.lock().registered
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Enter netmap mode: populate every ring and program the device.
    ///
    /// On failure everything done so far is undone and the adapter stays
    /// unregistered.
    pub fn register(&self) -> Result<(), AdapterError> {
        let mut core = self.core.lock();
        if core.registered {
            return Err(AdapterError::AlreadyActive);
        }
        let needed = self.config.buffers_needed();
        if self.pool.free_count() < needed {
            return Err(AdapterError::PoolExhausted);
        }

        if let Err(e) = self.attach_all() {
            warn!("{}: registration failed: {}", self.device.name(), e);
            self.detach_all();
            return Err(e);
        }

        core.registered = true;
        info!(
            "{}: netmap mode on, {} queue pairs, {}/{} descriptors",
            self.device.name(),
            self.config.num_queues,
            self.config.num_tx_desc,
            self.config.num_rx_desc
        );
        Ok(())
    }

    fn attach_all(&self) -> Result<(), AdapterError> {
        for kring in self.tx.iter() {
            kring.lock().attach(&*self.device, &self.pool)?;
        }
        for kring in self.rx.iter() {
            kring.lock().attach(&*self.device, &self.pool)?;
        }
        Ok(())
    }

    /// Release every ring and reset its queue. Returns buffers freed.
    fn detach_all(&self) -> usize {
        let mut freed = 0;
        for kring in self.tx.iter() {
            let mut kring = kring.lock();
            freed += kring.detach(&self.pool);
            if let Err(e) = self.device.reset_queue(kring.queue()) {
                warn!("{}: reset failed: {}", kring.queue(), e);
            }
        }
        for kring in self.rx.iter() {
            let mut kring = kring.lock();
            freed += kring.detach(&self.pool);
            if let Err(e) = self.device.reset_queue(kring.queue()) {
                warn!("{}: reset failed: {}", kring.queue(), e);
            }
        }
        freed
    }

    /// Leave netmap mode. Waits for in-flight sync calls on every ring.
    pub fn deregister(&self) -> Result<(), AdapterError> {
        let mut core = self.core.lock();
        if !core.registered {
            return Err(AdapterError::NotActive);
        }
        let freed = self.detach_all();
        core.registered = false;
        info!(
            "{}: netmap mode off, {} buffers returned",
            self.device.name(),
            freed
        );
        Ok(())
    }

    /// Same as [`Adapter::deregister`].
    pub fn close(&self) -> Result<(), AdapterError> {
        self.deregister()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCKING
    // ═══════════════════════════════════════════════════════════════════════

    fn core_guard(&self) -> Option<MutexGuard<'_, CoreState>> {
        (!self.config.separate_locks).then(|| self.core.lock())
    }

    /// Lock TX ring `ring`.
    pub fn lock_tx(&self, ring: u16) -> Result<TxRingGuard<'_, D>, AdapterError> {
        let slot = self
            .tx
            .get(ring as usize)
            .ok_or(AdapterError::NoSuchRing(QueueId::tx(ring)))?;
        let core = self.core_guard();
        Ok(TxRingGuard {
            kring: slot.lock(),
            _core: core,
            adapter: self,
        })
    }

    /// Lock RX ring `ring`.
    pub fn lock_rx(&self, ring: u16) -> Result<RxRingGuard<'_, D>, AdapterError> {
        let slot = self
            .rx
            .get(ring as usize)
            .ok_or(AdapterError::NoSuchRing(QueueId::rx(ring)))?;
        let core = self.core_guard();
        Ok(RxRingGuard {
            kring: slot.lock(),
            _core: core,
            adapter: self,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SELF-LOCKING ENTRY POINTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Lock TX ring `ring` and sync it up to `cursor`.
    pub fn sync_transmit(&self, ring: u16, cursor: usize) -> Result<(), Error> {
        let mut guard = self.lock_tx(ring)?;
        if guard.state() == RingState::Inactive {
            return Err(AdapterError::NotActive.into());
        }
        guard.sync_to(cursor)?;
        Ok(())
    }

    /// Lock RX ring `ring` and sync it up to `cursor`.
    pub fn sync_receive(&self, ring: u16, cursor: usize) -> Result<(), Error> {
        let mut guard = self.lock_rx(ring)?;
        if guard.state() == RingState::Inactive {
            return Err(AdapterError::NotActive.into());
        }
        guard.sync_to(cursor)?;
        Ok(())
    }

    /// Lock TX ring `ring` and reinitialize it.
    pub fn reinitialize_tx(&self, ring: u16) -> Result<ReinitReport, Error> {
        Ok(self.lock_tx(ring)?.reinitialize()?)
    }

    /// Lock RX ring `ring` and reinitialize it.
    pub fn reinitialize_rx(&self, ring: u16) -> Result<ReinitReport, Error> {
        Ok(self.lock_rx(ring)?.reinitialize()?)
    }
}

impl<D: NicDevice> Drop for Adapter<D> {
    fn drop(&mut self) {
        if self.core.get_mut().registered {
            if let Err(e) = self.deregister() {
                warn!("{}: deregister on drop: {}", self.device.name(), e);
            }
        }
    }
}

impl<D: NicDevice> core::fmt::Debug for Adapter<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Adapter")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RING GUARDS
// ═══════════════════════════════════════════════════════════════════════════

/// Check whether slot `i` is owned by the consumer.
fn consumer_owns(ring: &Ring, i: usize) -> bool {
    i < ring.num_slots() && ring.distance(ring.hw_cur(), i) < ring.hw_avail()
}

/// Exclusive access to one TX ring. Released on drop.
pub struct TxRingGuard<'a, D: NicDevice> {
    kring: MutexGuard<'a, TxKring>,
    _core: Option<MutexGuard<'a, CoreState>>,
    adapter: &'a Adapter<D>,
}

impl<D: NicDevice> TxRingGuard<'_, D> {
    /// Queue this ring drives.
    pub fn queue(&self) -> QueueId {
        self.kring.queue()
    }

    /// Ring state.
    pub fn ring(&self) -> &Ring {
        self.kring.ring()
    }

    /// Mutable ring state.
    pub fn ring_mut(&mut self) -> &mut Ring {
        self.kring.ring_mut()
    }

    /// Lifecycle state.
    pub fn state(&self) -> RingState {
        self.kring.ring().state()
    }

    /// Consumer cursor.
    pub fn cur(&self) -> usize {
        self.kring.ring().cur()
    }

    /// Free slots the consumer may fill.
    pub fn avail(&self) -> usize {
        self.kring.ring().avail()
    }

    /// Publish everything up to the consumer cursor.
    pub fn sync(&mut self) -> Result<(), ReinitRequired> {
        let cursor = self.cur();
        self.sync_to(cursor)
    }

    /// Publish slots up to `cursor`.
    pub fn sync_to(&mut self, cursor: usize) -> Result<(), ReinitRequired> {
        let adapter = self.adapter;
        self.kring.sync(&*adapter.device, &adapter.pool, cursor)
    }

    /// Recover from a failed sync.
    pub fn reinitialize(&mut self) -> Result<ReinitReport, ReinitRequired> {
        let adapter = self.adapter;
        self.kring.reinitialize(&*adapter.device, &adapter.pool)
    }

    /// Payload buffer of a consumer-owned slot.
    pub fn buffer_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        let ring = self.kring.ring();
        if !consumer_owns(ring, slot) {
            return None;
        }
        let buf: BufIdx = ring.slot(slot).buf_idx;
        // SAFETY: the slot is consumer-owned and the ring lock is held, so
        // neither the device nor another thread touches this buffer.
        unsafe { self.adapter.pool.buffer_mut(buf) }
    }

    /// Copy `frame` into the slot at `cur` and advance the cursor.
    ///
    /// Returns `false` if no slot is available or the frame does not fit.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        if self.avail() == 0 || frame.len() > self.adapter.pool.buf_size() {
            return false;
        }
        let cur = self.cur();
        match self.buffer_mut(cur) {
            Some(buf) => buf[..frame.len()].copy_from_slice(frame),
            None => return false,
        }
        let ring = self.kring.ring_mut();
        ring.slot_mut(cur).len = frame.len() as u16;
        ring.advance(1);
        true
    }

    /// Slots from `cur` the consumer may still fill.
    pub fn pending(&self) -> PendingSlots<'_> {
        self.kring.ring().pending()
    }

    /// Hardware head as of the last reclaim.
    pub fn next_to_clean(&self) -> usize {
        self.kring.next_to_clean()
    }
}

/// Exclusive access to one RX ring. Released on drop.
pub struct RxRingGuard<'a, D: NicDevice> {
    kring: MutexGuard<'a, RxKring>,
    _core: Option<MutexGuard<'a, CoreState>>,
    adapter: &'a Adapter<D>,
}

/// One received frame as seen through [`RxRingGuard::received`].
#[derive(Debug, Clone, Copy)]
pub struct RxFrame<'a> {
    /// Slot index.
    pub index: usize,
    /// Buffer holding the frame.
    pub buf_idx: BufIdx,
    /// Frame bytes. Empty if the slot's handle does not resolve.
    pub data: &'a [u8],
}

/// Lazy iterator over received frames, see [`RxRingGuard::received`].
pub struct ReceivedFrames<'a> {
    slots: PendingSlots<'a>,
    pool: &'a BufferPool,
}

impl<'a> Iterator for ReceivedFrames<'a> {
    type Item = RxFrame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index, slot) = self.slots.next()?;
        // SAFETY: the slot is consumer-owned and the ring lock is held for
        // the iterator's lifetime.
        let data = unsafe { self.pool.buffer(slot.buf_idx) }
            .map(|buf| &buf[..(slot.len as usize).min(buf.len())])
            .unwrap_or(&[]);
        Some(RxFrame {
            index,
            buf_idx: slot.buf_idx,
            data,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.slots.size_hint()
    }
}

impl ExactSizeIterator for ReceivedFrames<'_> {}

impl<D: NicDevice> RxRingGuard<'_, D> {
    /// Queue this ring drives.
    pub fn queue(&self) -> QueueId {
        self.kring.queue()
    }

    /// Ring state.
    pub fn ring(&self) -> &Ring {
        self.kring.ring()
    }

    /// Mutable ring state.
    pub fn ring_mut(&mut self) -> &mut Ring {
        self.kring.ring_mut()
    }

    /// Lifecycle state.
    pub fn state(&self) -> RingState {
        self.kring.ring().state()
    }

    /// Consumer cursor.
    pub fn cur(&self) -> usize {
        self.kring.ring().cur()
    }

    /// Received slots not yet released.
    pub fn avail(&self) -> usize {
        self.kring.ring().avail()
    }

    /// Ingest and recycle up to the consumer cursor.
    pub fn sync(&mut self) -> Result<(), ReinitRequired> {
        let cursor = self.cur();
        self.sync_to(cursor)
    }

    /// Ingest, then recycle slots up to `cursor`.
    pub fn sync_to(&mut self, cursor: usize) -> Result<(), ReinitRequired> {
        let adapter = self.adapter;
        self.kring.sync(&*adapter.device, &adapter.pool, cursor)
    }

    /// Recover from a failed sync.
    pub fn reinitialize(&mut self) -> Result<ReinitReport, ReinitRequired> {
        let adapter = self.adapter;
        self.kring.reinitialize(&*adapter.device, &adapter.pool)
    }

    /// Frames from `cur` onwards, oldest first.
    ///
    /// Each call starts over from the current cursor; nothing is consumed
    /// until [`RxRingGuard::release`].
    pub fn received(&self) -> ReceivedFrames<'_> {
        ReceivedFrames {
            slots: self.kring.ring().pending(),
            pool: &self.adapter.pool,
        }
    }

    /// Hand `n` received slots back. Takes effect on the next sync.
    pub fn release(&mut self, n: usize) -> usize {
        self.kring.ring_mut().advance(n)
    }

    /// Payload of a consumer-owned slot.
    pub fn buffer(&self, slot: usize) -> Option<&[u8]> {
        let ring = self.kring.ring();
        if !consumer_owns(ring, slot) {
            return None;
        }
        // SAFETY: the slot is consumer-owned and the ring lock is held.
        unsafe { self.adapter.pool.buffer(ring.slot(slot).buf_idx) }
    }

    /// Next descriptor to test for completion.
    pub fn next_to_check(&self) -> usize {
        self.kring.next_to_check()
    }
}
