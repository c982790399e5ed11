//! Adapter configuration.

use crate::error::AdapterError;
use crate::regs::{
    DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_SIZE, MAX_QUEUES, MAX_QUEUE_SIZE, MIN_QUEUE_SIZE,
    QUEUE_SIZE_ALIGN,
};

/// Geometry and locking mode of an [`crate::Adapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Queue pairs to put in netmap mode.
    pub num_queues: u16,
    /// Descriptors per TX ring.
    pub num_tx_desc: usize,
    /// Descriptors per RX ring.
    pub num_rx_desc: usize,
    /// Buffer size the pool must provide.
    pub buffer_size: usize,
    /// Lock each ring on its own. When false every sync also takes the
    /// interface core lock.
    pub separate_locks: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            num_queues: 1,
            num_tx_desc: DEFAULT_QUEUE_SIZE,
            num_rx_desc: DEFAULT_QUEUE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            separate_locks: true,
        }
    }
}

impl AdapterConfig {
    /// Config with `queues` pairs of `descriptors` entries each.
    pub fn new(queues: u16, descriptors: usize) -> Self {
        Self {
            num_queues: queues,
            num_tx_desc: descriptors,
            num_rx_desc: descriptors,
            ..Self::default()
        }
    }

    /// Buffers needed to populate every ring.
    pub fn buffers_needed(&self) -> usize {
        self.num_queues as usize * (self.num_tx_desc + self.num_rx_desc)
    }

    /// Check geometry limits.
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.num_queues == 0 || self.num_queues > MAX_QUEUES {
            return Err(AdapterError::InvalidConfig(format!(
                "queue count {} not in 1..={}",
                self.num_queues, MAX_QUEUES
            )));
        }
        for (what, n) in [("tx", self.num_tx_desc), ("rx", self.num_rx_desc)] {
            if !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&n) || n % QUEUE_SIZE_ALIGN != 0 {
                return Err(AdapterError::InvalidConfig(format!(
                    "{} descriptor count {} not a multiple of {} in {}..={}",
                    what, n, QUEUE_SIZE_ALIGN, MIN_QUEUE_SIZE, MAX_QUEUE_SIZE
                )));
            }
        }
        if self.buffer_size == 0 || self.buffer_size > u16::MAX as usize {
            return Err(AdapterError::InvalidConfig(format!(
                "buffer size {}",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AdapterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffers_needed(), 512);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(AdapterConfig::new(0, 256).validate().is_err());
        assert!(AdapterConfig::new(1, 4).validate().is_err());
        assert!(AdapterConfig::new(1, 100).validate().is_err());
        assert!(AdapterConfig::new(1, 8192).validate().is_err());
        assert!(AdapterConfig::new(65, 256).validate().is_err());
        assert!(AdapterConfig::new(4, 8).validate().is_ok());
    }
}
