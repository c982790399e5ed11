//! Interface lookup.
//!
//! `simN` builds a buffer pool, a [`SimulatedNic`] and a registered
//! [`Adapter`] with one queue pair per worker. Nothing else is known.

use std::sync::Arc;

use log::info;
use netmap::{
    Adapter, AdapterConfig, AdapterError, BufferPool, NicDevice, SimConfig, SimulatedNic,
};
use smoltcp::wire::EthernetAddress;
use thiserror::Error;

/// Descriptors per simulated ring.
pub const SIM_RING_SIZE: usize = 1024;
/// Packet buffer size of the simulated pool.
pub const SIM_BUF_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("unknown interface '{0}' (expected simN)")]
    UnknownInterface(String),
    #[error("{0}: {1}")]
    Adapter(String, #[source] AdapterError),
}

/// An opened, registered interface.
pub struct Interface {
    pub name: String,
    pub nic: Arc<SimulatedNic>,
    pub adapter: Arc<Adapter<SimulatedNic>>,
}

impl Interface {
    pub fn mac(&self) -> EthernetAddress {
        EthernetAddress(self.nic.mac_address())
    }

    pub fn queues(&self) -> u16 {
        self.adapter.num_queues()
    }
}

/// Number `N` of a `simN` name.
fn sim_unit(name: &str) -> Option<u8> {
    let digits = name.strip_prefix("sim")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Open `name` with `queues` TX/RX queue pairs.
pub fn open(name: &str, queues: u16) -> Result<Interface, OpenError> {
    let unit = sim_unit(name).ok_or_else(|| OpenError::UnknownInterface(name.to_string()))?;
    let wrap = |e: AdapterError| OpenError::Adapter(name.to_string(), e);

    let config = AdapterConfig {
        num_queues: queues,
        num_tx_desc: SIM_RING_SIZE,
        num_rx_desc: SIM_RING_SIZE,
        buffer_size: SIM_BUF_SIZE,
        separate_locks: true,
    };
    config.validate().map_err(wrap)?;

    let pool = BufferPool::new(config.buffers_needed(), SIM_BUF_SIZE).map_err(|e| wrap(e.into()))?;
    let pool = Arc::new(pool);
    let mut sim = SimConfig::new(name, queues, SIM_RING_SIZE);
    sim.mac = [0x02, 0x00, 0x00, 0x00, unit, 0x01];
    sim.auto_complete = true;
    let nic = Arc::new(SimulatedNic::new(sim, pool.clone()));
    let adapter = Adapter::open(nic.clone(), pool, config).map_err(wrap)?;
    info!("{}: {} queue pairs of {} slots", name, queues, SIM_RING_SIZE);

    Ok(Interface {
        name: name.to_string(),
        nic,
        adapter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_names() {
        assert_eq!(sim_unit("sim0"), Some(0));
        assert_eq!(sim_unit("sim12"), Some(12));
        assert_eq!(sim_unit("sim"), None);
        assert_eq!(sim_unit("sim-1"), None);
        assert_eq!(sim_unit("em0"), None);
    }

    #[test]
    fn test_open_sim() {
        let iface = open("sim3", 2).unwrap();
        assert_eq!(iface.queues(), 2);
        assert!(iface.adapter.is_registered());
        assert_eq!(iface.mac(), EthernetAddress([0x02, 0, 0, 0, 3, 0x01]));
    }

    #[test]
    fn test_unknown_interface() {
        assert!(matches!(open("eth0", 1), Err(OpenError::UnknownInterface(_))));
        assert!(matches!(open("sim0", 0), Err(OpenError::Adapter(..))));
    }
}
