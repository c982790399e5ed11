//! Simulated e1000-class NIC.
//!
//! Models the parts of the hardware the reconcilers observe: per-queue
//! descriptor arrays, head/tail registers, DMA binding against a
//! [`BufferPool`], and descriptor write-back. The "wire" side is driven
//! explicitly through [`SimulatedNic::complete_tx`] and
//! [`SimulatedNic::inject_rx`], or automatically on tail writes when
//! `auto_complete` is set.
//!
//! Fault hooks (`fail_next_bind`, `set_completion_index`,
//! `set_not_responding`) exist so tests can drive the error paths.

use std::sync::Arc;

use dma_pool::{BufferPool, DmaAddr};
use log::trace;
use spin::Mutex;

use super::{DeviceError, Direction, NicDevice, QueueId, RxStatus, TxCommand};
use crate::ring::ring_distance;

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Locally administered address used when none is configured.
pub const DEFAULT_SIM_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Simulated device configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Interface name.
    pub name: String,
    /// Number of TX/RX queue pairs.
    pub queues: u16,
    /// Descriptors per TX queue.
    pub tx_descriptors: usize,
    /// Descriptors per RX queue.
    pub rx_descriptors: usize,
    /// Station address.
    pub mac: [u8; 6],
    /// Transmit everything up to the tail as soon as the tail is written.
    pub auto_complete: bool,
    /// Deliver transmitted frames to the RX queue with the same index.
    pub loopback: bool,
}

impl SimConfig {
    /// Configuration with `queues` pairs of `descriptors` entries each.
    pub fn new(name: &str, queues: u16, descriptors: usize) -> Self {
        Self {
            name: name.to_string(),
            queues,
            tx_descriptors: descriptors,
            rx_descriptors: descriptors,
            mac: DEFAULT_SIM_MAC,
            auto_complete: false,
            loopback: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DESCRIPTORS
// ═══════════════════════════════════════════════════════════════════════════

/// Transmit descriptor as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxDescriptor {
    /// Bound buffer.
    pub addr: Option<DmaAddr>,
    /// Bound buffer size.
    pub size: usize,
    /// Command bits.
    pub cmd: TxCommand,
    /// Frame length.
    pub len: u16,
}

/// Receive descriptor as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDescriptor {
    /// Bound buffer.
    pub addr: Option<DmaAddr>,
    /// Bound buffer size.
    pub size: usize,
    /// Written-back frame length.
    pub len: u16,
    /// Written-back status.
    pub status: RxStatus,
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Frames sent or received.
    pub packets: u64,
    /// Bytes sent or received.
    pub bytes: u64,
    /// Frames lost (no descriptor, unbound buffer, bad DMA address).
    pub dropped: u64,
    /// Transmit descriptor writes by the driver.
    pub descriptor_writes: u64,
    /// Transmitted descriptors that requested a status report.
    pub reports: u64,
}

struct TxQueue {
    descs: Box<[TxDescriptor]>,
    head: usize,
    tail: usize,
    stats: QueueStats,
}

struct RxQueue {
    descs: Box<[RxDescriptor]>,
    head: usize,
    tail: usize,
    stats: QueueStats,
}

impl TxQueue {
    fn new(n: usize) -> Self {
        Self {
            descs: vec![TxDescriptor::default(); n].into_boxed_slice(),
            head: 0,
            tail: 0,
            stats: QueueStats::default(),
        }
    }
}

impl RxQueue {
    fn new(n: usize) -> Self {
        Self {
            descs: vec![RxDescriptor::default(); n].into_boxed_slice(),
            head: 0,
            tail: 0,
            stats: QueueStats::default(),
        }
    }
}

#[derive(Default)]
struct Faults {
    fail_bind: Option<QueueId>,
    not_responding: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE
// ═══════════════════════════════════════════════════════════════════════════

/// Software model of a multi-queue NIC.
pub struct SimulatedNic {
    config: SimConfig,
    pool: Arc<BufferPool>,
    tx: Box<[Mutex<TxQueue>]>,
    rx: Box<[Mutex<RxQueue>]>,
    faults: Mutex<Faults>,
}

impl SimulatedNic {
    /// Create a device whose DMA engine reaches the buffers of `pool`.
    pub fn new(config: SimConfig, pool: Arc<BufferPool>) -> Self {
        let tx = (0..config.queues)
            .map(|_| Mutex::new(TxQueue::new(config.tx_descriptors)))
            .collect();
        let rx = (0..config.queues)
            .map(|_| Mutex::new(RxQueue::new(config.rx_descriptors)))
            .collect();
        Self {
            config,
            pool,
            tx,
            rx,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Device configuration.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Buffer pool the DMA engine reads and writes.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn tx_queue(&self, queue: QueueId) -> Result<&Mutex<TxQueue>, DeviceError> {
        match queue.direction {
            Direction::Tx => self
                .tx
                .get(queue.index as usize)
                .ok_or(DeviceError::NoSuchQueue(queue)),
            Direction::Rx => Err(DeviceError::NoSuchQueue(queue)),
        }
    }

    fn rx_queue(&self, queue: QueueId) -> Result<&Mutex<RxQueue>, DeviceError> {
        match queue.direction {
            Direction::Rx => self
                .rx
                .get(queue.index as usize)
                .ok_or(DeviceError::NoSuchQueue(queue)),
            Direction::Tx => Err(DeviceError::NoSuchQueue(queue)),
        }
    }

    fn check_responding(&self) -> Result<(), DeviceError> {
        if self.faults.lock().not_responding {
            Err(DeviceError::NotResponding)
        } else {
            Ok(())
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Wire side
    // ───────────────────────────────────────────────────────────────────────

    /// Transmit up to `max` descriptors between head and tail.
    ///
    /// Returns the number of descriptors the head advanced over.
    pub fn complete_tx(&self, queue: u16, max: usize) -> usize {
        let Some(q) = self.tx.get(queue as usize) else {
            return 0;
        };
        let mut looped = Vec::new();
        let done = {
            let mut q = q.lock();
            let n = q.descs.len();
            let mut done = 0;
            while done < max && q.head != q.tail {
                let head = q.head;
                let desc = q.descs[head];
                let frame = desc
                    .addr
                    .and_then(|addr| self.pool.translate(addr, desc.len as usize));
                match frame {
                    Some(ptr) => {
                        q.stats.packets += 1;
                        q.stats.bytes += desc.len as u64;
                        if self.config.loopback {
                            // SAFETY: the descriptor is device-owned until head passes it.
                            let bytes = unsafe {
                                core::slice::from_raw_parts(ptr.as_ptr(), desc.len as usize)
                            };
                            looped.push(bytes.to_vec());
                        }
                    }
                    None => q.stats.dropped += 1,
                }
                if desc.cmd.contains(TxCommand::RS) {
                    q.stats.reports += 1;
                }
                q.head = (head + 1) % n;
                done += 1;
            }
            done
        };
        for frame in &looped {
            self.inject_rx(queue, frame);
        }
        if done > 0 {
            trace!("{}: tx{} sent {} frames", self.config.name, queue, done);
        }
        done
    }

    /// Deliver a frame from the wire into RX queue `queue`.
    ///
    /// Returns `false` when the frame is dropped because the device owns
    /// no free descriptor.
    pub fn inject_rx(&self, queue: u16, frame: &[u8]) -> bool {
        let Some(q) = self.rx.get(queue as usize) else {
            return false;
        };
        let mut q = q.lock();
        let n = q.descs.len();
        let head = q.head;
        if head == q.tail || q.descs[head].status.contains(RxStatus::DD) {
            q.stats.dropped += 1;
            return false;
        }
        let desc = q.descs[head];
        let len = frame.len().min(desc.size);
        let dst = desc.addr.and_then(|addr| self.pool.translate(addr, len));
        let Some(dst) = dst else {
            q.stats.dropped += 1;
            return false;
        };
        // SAFETY: the descriptor is device-owned (between head and tail).
        unsafe { core::ptr::copy_nonoverlapping(frame.as_ptr(), dst.as_ptr(), len) };

        let desc = &mut q.descs[head];
        desc.len = len as u16;
        desc.status = RxStatus::DD | RxStatus::EOP;
        q.head = (head + 1) % n;
        q.stats.packets += 1;
        q.stats.bytes += len as u64;
        true
    }

    /// Free descriptors the device could fill right now on RX queue `queue`.
    pub fn rx_room(&self, queue: u16) -> usize {
        self.rx.get(queue as usize).map_or(0, |q| {
            let q = q.lock();
            ring_distance(q.head, q.tail, q.descs.len())
        })
    }

    /// Descriptors queued for transmission but not yet sent.
    pub fn tx_pending(&self, queue: u16) -> usize {
        self.tx.get(queue as usize).map_or(0, |q| {
            let q = q.lock();
            ring_distance(q.head, q.tail, q.descs.len())
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Inspection and fault injection
    // ───────────────────────────────────────────────────────────────────────

    /// Mark an RX descriptor done without moving any payload.
    pub fn mark_descriptor_done(&self, queue: u16, index: usize, len: u16) -> bool {
        let Some(q) = self.rx.get(queue as usize) else {
            return false;
        };
        let mut q = q.lock();
        let Some(desc) = q.descs.get_mut(index) else {
            return false;
        };
        desc.len = len;
        desc.status = RxStatus::DD | RxStatus::EOP;
        true
    }

    /// Force the head register of a queue.
    pub fn set_completion_index(&self, queue: QueueId, index: usize) {
        match queue.direction {
            Direction::Tx => {
                if let Some(q) = self.tx.get(queue.index as usize) {
                    q.lock().head = index;
                }
            }
            Direction::Rx => {
                if let Some(q) = self.rx.get(queue.index as usize) {
                    q.lock().head = index;
                }
            }
        }
    }

    /// Make the next `bind_dma` on `queue` fail.
    pub fn fail_next_bind(&self, queue: QueueId) {
        self.faults.lock().fail_bind = Some(queue);
    }

    /// Make register access, DMA binds and queue resets fail.
    pub fn set_not_responding(&self, on: bool) {
        self.faults.lock().not_responding = on;
    }

    /// Snapshot of a TX descriptor.
    pub fn tx_descriptor(&self, queue: u16, index: usize) -> Option<TxDescriptor> {
        self.tx.get(queue as usize)?.lock().descs.get(index).copied()
    }

    /// Snapshot of an RX descriptor.
    pub fn rx_descriptor(&self, queue: u16, index: usize) -> Option<RxDescriptor> {
        self.rx.get(queue as usize)?.lock().descs.get(index).copied()
    }

    /// Current tail register of a queue.
    pub fn tail(&self, queue: QueueId) -> Option<usize> {
        match queue.direction {
            Direction::Tx => Some(self.tx.get(queue.index as usize)?.lock().tail),
            Direction::Rx => Some(self.rx.get(queue.index as usize)?.lock().tail),
        }
    }

    /// Counters of a queue.
    pub fn stats(&self, queue: QueueId) -> Option<QueueStats> {
        match queue.direction {
            Direction::Tx => Some(self.tx.get(queue.index as usize)?.lock().stats),
            Direction::Rx => Some(self.rx.get(queue.index as usize)?.lock().stats),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CAPABILITY TRAIT IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════

impl NicDevice for SimulatedNic {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn mac_address(&self) -> [u8; 6] {
        self.config.mac
    }

    fn num_queues(&self) -> u16 {
        self.config.queues
    }

    fn num_descriptors(&self, queue: QueueId) -> Result<usize, DeviceError> {
        match queue.direction {
            Direction::Tx => Ok(self.tx_queue(queue)?.lock().descs.len()),
            Direction::Rx => Ok(self.rx_queue(queue)?.lock().descs.len()),
        }
    }

    fn read_completion_index(&self, queue: QueueId) -> Result<usize, DeviceError> {
        self.check_responding()?;
        match queue.direction {
            Direction::Tx => Ok(self.tx_queue(queue)?.lock().head),
            Direction::Rx => Ok(self.rx_queue(queue)?.lock().head),
        }
    }

    fn write_tail(&self, queue: QueueId, index: usize) -> Result<(), DeviceError> {
        self.check_responding()?;
        match queue.direction {
            Direction::Tx => {
                {
                    let mut q = self.tx_queue(queue)?.lock();
                    if index >= q.descs.len() {
                        return Err(DeviceError::DescriptorOutOfRange { queue, index });
                    }
                    q.tail = index;
                }
                if self.config.auto_complete {
                    self.complete_tx(queue.index, usize::MAX);
                }
            }
            Direction::Rx => {
                let mut q = self.rx_queue(queue)?.lock();
                if index >= q.descs.len() {
                    return Err(DeviceError::DescriptorOutOfRange { queue, index });
                }
                q.tail = index;
            }
        }
        Ok(())
    }

    fn write_tx_descriptor(
        &self,
        queue: QueueId,
        index: usize,
        cmd: TxCommand,
        len: u16,
    ) -> Result<(), DeviceError> {
        let mut q = self.tx_queue(queue)?.lock();
        let desc = q
            .descs
            .get_mut(index)
            .ok_or(DeviceError::DescriptorOutOfRange { queue, index })?;
        desc.cmd = cmd;
        desc.len = len;
        q.stats.descriptor_writes += 1;
        Ok(())
    }

    fn bind_dma(
        &self,
        queue: QueueId,
        index: usize,
        addr: DmaAddr,
        size: usize,
    ) -> Result<(), DeviceError> {
        self.check_responding()?;
        {
            let mut faults = self.faults.lock();
            if faults.fail_bind == Some(queue) {
                faults.fail_bind = None;
                return Err(DeviceError::BindFailed { queue, index, addr });
            }
        }
        if self.pool.translate(addr, size).is_none() {
            return Err(DeviceError::BindFailed { queue, index, addr });
        }
        match queue.direction {
            Direction::Tx => {
                let mut q = self.tx_queue(queue)?.lock();
                let desc = q
                    .descs
                    .get_mut(index)
                    .ok_or(DeviceError::DescriptorOutOfRange { queue, index })?;
                desc.addr = Some(addr);
                desc.size = size;
            }
            Direction::Rx => {
                let mut q = self.rx_queue(queue)?.lock();
                let desc = q
                    .descs
                    .get_mut(index)
                    .ok_or(DeviceError::DescriptorOutOfRange { queue, index })?;
                desc.addr = Some(addr);
                desc.size = size;
            }
        }
        Ok(())
    }

    fn descriptor_is_done(&self, queue: QueueId, index: usize) -> Option<u16> {
        let q = self.rx_queue(queue).ok()?.lock();
        let desc = q.descs.get(index)?;
        desc.status.contains(RxStatus::DD).then_some(desc.len)
    }

    fn clear_done(&self, queue: QueueId, index: usize) -> Result<(), DeviceError> {
        let mut q = self.rx_queue(queue)?.lock();
        let desc = q
            .descs
            .get_mut(index)
            .ok_or(DeviceError::DescriptorOutOfRange { queue, index })?;
        desc.status = RxStatus::empty();
        desc.len = 0;
        Ok(())
    }

    fn reset_queue(&self, queue: QueueId) -> Result<(), DeviceError> {
        self.check_responding()?;
        match queue.direction {
            Direction::Tx => {
                let mut q = self.tx_queue(queue)?.lock();
                let n = q.descs.len();
                *q = TxQueue::new(n);
            }
            Direction::Rx => {
                let mut q = self.rx_queue(queue)?.lock();
                let n = q.descs.len();
                *q = RxQueue::new(n);
            }
        }
        Ok(())
    }
}
