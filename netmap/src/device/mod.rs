//! Device capability interface.
//!
//! The reconcilers only ever talk to hardware through [`NicDevice`]. A
//! backend maps these calls onto registers (head/tail), descriptor memory
//! and its bus's DMA map API. [`sim::SimulatedNic`] is a software model of
//! an e1000-class device used by the tests and the packet generator.

use core::fmt;

use bitflags::bitflags;
use dma_pool::DmaAddr;
use thiserror::Error;

use crate::regs::{rxd, txd};

#[cfg(feature = "sim")]
pub mod sim;

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════

/// Direction of a hardware queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Transmit.
    Tx,
    /// Receive.
    Rx,
}

/// One hardware queue of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    /// Queue direction.
    pub direction: Direction,
    /// Queue number within the direction.
    pub index: u16,
}

impl QueueId {
    /// Transmit queue `index`.
    pub const fn tx(index: u16) -> Self {
        Self {
            direction: Direction::Tx,
            index,
        }
    }

    /// Receive queue `index`.
    pub const fn rx(index: u16) -> Self {
        Self {
            direction: Direction::Rx,
            index,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Tx => write!(f, "tx{}", self.index),
            Direction::Rx => write!(f, "rx{}", self.index),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DESCRIPTOR BITS
// ═══════════════════════════════════════════════════════════════════════════

bitflags! {
    /// Transmit descriptor command bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxCommand: u8 {
        /// End of packet.
        const EOP = txd::CMD_EOP;
        /// Insert FCS.
        const IFCS = txd::CMD_IFCS;
        /// Report status when the descriptor is done.
        const RS = txd::CMD_RS;
    }
}

bitflags! {
    /// Receive descriptor status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxStatus: u8 {
        /// Descriptor done.
        const DD = rxd::STAT_DD;
        /// End of packet.
        const EOP = rxd::STAT_EOP;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Device-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Queue does not exist on this device.
    #[error("no such queue {0}")]
    NoSuchQueue(QueueId),
    /// Descriptor index beyond the queue size.
    #[error("descriptor {index} out of range on {queue}")]
    DescriptorOutOfRange {
        /// Queue.
        queue: QueueId,
        /// Offending index.
        index: usize,
    },
    /// The bus refused to map a buffer for DMA.
    #[error("DMA bind of {addr:#x} failed on {queue} descriptor {index}")]
    BindFailed {
        /// Queue.
        queue: QueueId,
        /// Descriptor index.
        index: usize,
        /// Address that failed to bind.
        addr: DmaAddr,
    },
    /// Register access failed.
    #[error("device not responding")]
    NotResponding,
}

// ═══════════════════════════════════════════════════════════════════════════
// CAPABILITY TRAIT
// ═══════════════════════════════════════════════════════════════════════════

/// Minimal hardware interface the reconcilers need.
///
/// Methods take `&self`: they model register and descriptor-memory
/// accesses, which a backend performs through interior mutability so that
/// TX and RX queues can be driven under separate locks.
///
/// # Contract
/// - No method blocks waiting for the hardware
/// - Head indices only move forward (mod queue size) until `reset_queue`
pub trait NicDevice: Send + Sync {
    /// Interface name.
    fn name(&self) -> &str;

    /// Station MAC address.
    fn mac_address(&self) -> [u8; 6];

    /// Number of queue pairs.
    fn num_queues(&self) -> u16;

    /// Descriptors in `queue`.
    fn num_descriptors(&self, queue: QueueId) -> Result<usize, DeviceError>;

    /// Hardware head: the next descriptor the device will process.
    ///
    /// For a transmit queue every descriptor before the head has been sent.
    fn read_completion_index(&self, queue: QueueId) -> Result<usize, DeviceError>;

    /// Program the tail register.
    ///
    /// The device may process descriptors from its head up to, but not
    /// including, `index`.
    fn write_tail(&self, queue: QueueId, index: usize) -> Result<(), DeviceError>;

    /// Fill the command and length words of a transmit descriptor.
    fn write_tx_descriptor(
        &self,
        queue: QueueId,
        index: usize,
        cmd: TxCommand,
        len: u16,
    ) -> Result<(), DeviceError>;

    /// Point descriptor `index` at a buffer of `size` bytes.
    fn bind_dma(
        &self,
        queue: QueueId,
        index: usize,
        addr: DmaAddr,
        size: usize,
    ) -> Result<(), DeviceError>;

    /// Received length if the device has marked the descriptor done.
    fn descriptor_is_done(&self, queue: QueueId, index: usize) -> Option<u16>;

    /// Clear the done marker so the device may reuse the descriptor.
    fn clear_done(&self, queue: QueueId, index: usize) -> Result<(), DeviceError>;

    /// Return a queue to its power-on state (head = tail = 0, nothing done).
    fn reset_queue(&self, queue: QueueId) -> Result<(), DeviceError>;
}
