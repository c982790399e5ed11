//! Multithreaded packet generator and sink.
//!
//! Each worker owns one TX or RX ring of an opened interface and moves
//! frames in bursts. The main thread only reports rates and handles
//! shutdown.
//!
//! ```text
//! ┌───────────────┐   ┌──────────────────────────────────────────┐
//! │ main          │   │ WorkerRegistry                           │
//! │  cli, report  ├──►│  worker 0 ── ring 0 ┐                    │
//! │  Ctrl-C ──────┼──►│  worker 1 ── ring 1 ├─► Adapter ─► NIC   │
//! └───────────────┘   │  ...                ┘                    │
//!                     └──────────────────────────────────────────┘
//! ```

pub mod affinity;
pub mod cli;
pub mod iface;
pub mod packet;
pub mod registry;
pub mod report;
pub mod sweep;
pub mod worker;

pub use cli::{Args, ConfigError, GenConfig, Mode};
pub use packet::{FrameBuilder, FrameError, FrameSpec};
pub use registry::{CancellationToken, Summary, WorkerRegistry, WorkerReport};
pub use sweep::{Sweep, SweepError};
