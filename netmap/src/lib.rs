//! Zero-copy descriptor ring synchronization.
//!
//! A NIC queue and a consumer share a fixed ring of slots. Each slot names
//! a packet buffer in a [`dma_pool::BufferPool`]; payloads are never
//! copied between the two sides, only ownership of slots moves.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Consumer (pkt-gen, tests)                                │
//! │   lock_tx / lock_rx  ──►  ring guard: slots, cur, avail  │
//! ├──────────────────────────────────────────────────────────┤
//! │ Adapter: registration, core lock, per-ring locks         │
//! ├──────────────────────────────────────────────────────────┤
//! │ TxKring / RxKring: reclaim+publish, ingest+recycle       │
//! ├──────────────────────────────────────────────────────────┤
//! │ NicDevice trait  (SimulatedNic, or a register backend)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let adapter = Adapter::open(nic, pool, AdapterConfig::default())?;
//! let mut tx = adapter.lock_tx(0)?;
//! while tx.push(&frame) {}
//! tx.sync()?;
//! ```

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod regs;
pub mod ring;
pub mod sync;

pub use adapter::{Adapter, ReceivedFrames, RxFrame, RxRingGuard, TxRingGuard};
pub use config::AdapterConfig;
pub use device::{DeviceError, Direction, NicDevice, QueueId, RxStatus, TxCommand};
pub use error::{AdapterError, Error, ErrorKind, ReinitReason, ReinitRequired, Result};
pub use ring::{Ring, RingState, Slot, SlotFlags};
pub use sync::{ReinitReport, RxKring, TxKring};

#[cfg(feature = "sim")]
pub use device::sim::{SimConfig, SimulatedNic};

pub use dma_pool::{BufIdx, BufferPool, DmaAddr};
