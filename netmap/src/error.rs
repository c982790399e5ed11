//! Error types.
//!
//! Sync failures are always [`ReinitRequired`]: the ring is left in
//! `NeedsReinit` and only [`crate::Adapter::reinitialize_tx`] /
//! [`crate::Adapter::reinitialize_rx`] (or the guard equivalents) bring it
//! back. Nothing in this crate retries on its own.

use dma_pool::{BufIdx, PoolError};
use thiserror::Error;

use crate::device::{DeviceError, QueueId};

pub type Result<T> = core::result::Result<T, Error>;

/// Broad class of a sync failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed slot (unmapped buffer, oversized length).
    Validation,
    /// DMA bind or register access failure.
    Device,
    /// Caller broke the protocol (bad cursor, span, or pending reinit).
    Protocol,
}

/// Why a ring needs reinitialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReinitReason {
    /// Reinitialization was already requested and has not run.
    #[error("reinitialization pending")]
    ReinitPending,
    /// Ring is not registered.
    #[error("ring is not active")]
    Inactive,
    /// Requested cursor is not a slot index.
    #[error("cursor {cursor} beyond ring limit {limit}")]
    CursorOutOfRange { cursor: usize, limit: usize },
    /// Requested span covers slots the consumer does not own.
    #[error("span of {span} slots exceeds {avail} available")]
    SpanExceedsAvail { span: usize, avail: usize },
    /// Slot buffer handle does not resolve in the pool.
    #[error("slot {slot} holds unmapped buffer {buf:?}")]
    InvalidBuffer { slot: usize, buf: BufIdx },
    /// Slot length exceeds the buffer size.
    #[error("slot {slot} length {len} exceeds buffer size {max}")]
    OversizedLength { slot: usize, len: usize, max: usize },
    /// Device reported a completion index outside the ring.
    #[error("completion index {index} outside ring of {num_slots}")]
    CompletionOutOfRange { index: usize, num_slots: usize },
    /// Device reported more completions than descriptors in flight.
    #[error("{delta} completions reported with {in_flight} in flight")]
    CompletionOverrun { delta: usize, in_flight: usize },
    /// Device-level failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ReinitReason {
    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBuffer { .. } | Self::OversizedLength { .. } => ErrorKind::Validation,
            Self::Device(_) | Self::CompletionOutOfRange { .. } | Self::CompletionOverrun { .. } => {
                ErrorKind::Device
            }
            Self::ReinitPending
            | Self::Inactive
            | Self::CursorOutOfRange { .. }
            | Self::SpanExceedsAvail { .. } => ErrorKind::Protocol,
        }
    }
}

/// A sync call failed; the ring must be reinitialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{queue}: reinitialization required: {reason}")]
pub struct ReinitRequired {
    /// Ring that failed.
    pub queue: QueueId,
    /// Failure detail.
    pub reason: ReinitReason,
}

impl ReinitRequired {
    pub(crate) fn new(queue: QueueId, reason: impl Into<ReinitReason>) -> Self {
        Self {
            queue,
            reason: reason.into(),
        }
    }

    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        self.reason.kind()
    }
}

/// Interface-level failures (open, close, registration, ring lookup).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Interface is not in netmap mode.
    #[error("interface is not registered")]
    NotActive,
    /// Interface is already in netmap mode.
    #[error("interface is already registered")]
    AlreadyActive,
    /// Ring index out of range.
    #[error("no such ring {0}")]
    NoSuchRing(QueueId),
    /// Not enough buffers to populate the rings.
    #[error("buffer pool exhausted")]
    PoolExhausted,
    /// Other buffer pool failure.
    #[error("buffer pool: {0}")]
    Pool(PoolError),
    /// Device failure during registration.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<PoolError> for AdapterError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfBuffers => Self::PoolExhausted,
            other => Self::Pool(other),
        }
    }
}

/// Any error this crate returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Reinit(#[from] ReinitRequired),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_kinds() {
        let invalid = ReinitReason::InvalidBuffer {
            slot: 3,
            buf: BufIdx(0),
        };
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert_eq!(ReinitReason::ReinitPending.kind(), ErrorKind::Protocol);
        let dev: ReinitReason = DeviceError::NotResponding.into();
        assert_eq!(dev.kind(), ErrorKind::Device);
    }

    #[test]
    fn test_pool_exhaustion_maps() {
        assert_eq!(
            AdapterError::from(PoolError::OutOfBuffers),
            AdapterError::PoolExhausted
        );
    }

    #[test]
    fn test_display_names_ring() {
        let err = ReinitRequired::new(
            QueueId::tx(1),
            ReinitReason::CursorOutOfRange {
                cursor: 9,
                limit: 7,
            },
        );
        assert_eq!(
            err.to_string(),
            "tx1: reinitialization required: cursor 9 beyond ring limit 7"
        );
    }
}
