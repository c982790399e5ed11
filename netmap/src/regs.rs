//! Descriptor ring geometry and descriptor bit definitions.
//!
//! Bit values follow the Intel 8254x/8257x legacy descriptor layout so
//! that a register-level backend can pass them through unchanged.

/// Default number of descriptors per queue.
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// Smallest ring the coordinator accepts.
pub const MIN_QUEUE_SIZE: usize = 8;

/// Largest ring the coordinator accepts.
pub const MAX_QUEUE_SIZE: usize = 4096;

/// Descriptor counts must be a multiple of this (128-byte ring granularity).
pub const QUEUE_SIZE_ALIGN: usize = 8;

/// Default packet buffer size (one mbuf cluster).
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Upper bound on queues per interface.
pub const MAX_QUEUES: u16 = 64;

/// Legacy transmit descriptor command bits.
pub mod txd {
    /// End of packet.
    pub const CMD_EOP: u8 = 0x01;
    /// Insert FCS.
    pub const CMD_IFCS: u8 = 0x02;
    /// Report status (request a completion write-back).
    pub const CMD_RS: u8 = 0x08;
}

/// Legacy receive descriptor status bits.
pub mod rxd {
    /// Descriptor done.
    pub const STAT_DD: u8 = 0x01;
    /// End of packet.
    pub const STAT_EOP: u8 = 0x02;
}
