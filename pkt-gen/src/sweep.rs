//! Address sweeps.
//!
//! An address argument is either a plain address or `base-count`, e.g.
//! `10.0.0.1-50` or `00:1b:21:00:00:01-4`. A sweep hands out `count`
//! consecutive addresses starting at `base`, then starts over.

use core::fmt;
use core::str::FromStr;

use smoltcp::wire::{EthernetAddress, Ipv4Address};
use thiserror::Error;

/// Separator between the base address and the sweep count.
pub const SWEEP_SEPARATOR: char = '-';

/// Address parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    #[error("invalid IPv4 address '{0}'")]
    BadIpv4(String),
    #[error("invalid MAC address '{0}'")]
    BadMac(String),
    #[error("invalid sweep count '{0}'")]
    BadCount(String),
}

/// Addresses that can be stepped through.
pub trait SweepAddr: Copy + fmt::Display {
    /// The address `n` steps after `self`, wrapping at the address width.
    fn offset(self, n: u32) -> Self;
}

impl SweepAddr for Ipv4Address {
    fn offset(self, n: u32) -> Self {
        let v = u32::from_be_bytes(self.0).wrapping_add(n);
        Ipv4Address(v.to_be_bytes())
    }
}

impl SweepAddr for EthernetAddress {
    fn offset(self, n: u32) -> Self {
        let mut raw = [0u8; 8];
        raw[2..].copy_from_slice(&self.0);
        let v = u64::from_be_bytes(raw).wrapping_add(n as u64) & 0xFFFF_FFFF_FFFF;
        let mut out = [0u8; 6];
        out.copy_from_slice(&v.to_be_bytes()[2..]);
        EthernetAddress(out)
    }
}

/// `count` consecutive addresses starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sweep<A> {
    base: A,
    count: u32,
}

impl<A: SweepAddr> Sweep<A> {
    /// A single fixed address.
    pub fn single(base: A) -> Self {
        Self { base, count: 1 }
    }

    /// `count` addresses from `base`. A count of zero is treated as one.
    pub fn new(base: A, count: u32) -> Self {
        Self {
            base,
            count: count.max(1),
        }
    }

    /// First address.
    pub fn base(&self) -> A {
        self.base
    }

    /// Number of distinct addresses.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Check whether the sweep covers more than one address.
    pub fn is_range(&self) -> bool {
        self.count > 1
    }

    /// Address used for the `i`-th packet.
    pub fn nth(&self, i: u64) -> A {
        self.base.offset((i % self.count as u64) as u32)
    }

    /// Endless cycle through the sweep.
    pub fn iter(&self) -> SweepIter<A> {
        SweepIter {
            sweep: *self,
            next: 0,
        }
    }
}

impl<A: SweepAddr> fmt::Display for Sweep<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_range() {
            write!(f, "{}{}{}", self.base, SWEEP_SEPARATOR, self.count)
        } else {
            write!(f, "{}", self.base)
        }
    }
}

/// Iterator returned by [`Sweep::iter`]. Never ends.
#[derive(Debug, Clone)]
pub struct SweepIter<A> {
    sweep: Sweep<A>,
    next: u64,
}

impl<A: SweepAddr> Iterator for SweepIter<A> {
    type Item = A;

    fn next(&mut self) -> Option<A> {
        let addr = self.sweep.nth(self.next);
        self.next = (self.next + 1) % self.sweep.count as u64;
        Some(addr)
    }
}

/// Split `base-count`; the count is optional.
fn split_sweep(s: &str) -> Result<(&str, u32), SweepError> {
    match s.rsplit_once(SWEEP_SEPARATOR) {
        None => Ok((s, 1)),
        Some((base, count)) => {
            let count: u32 = count
                .parse()
                .map_err(|_| SweepError::BadCount(count.to_string()))?;
            if count == 0 {
                return Err(SweepError::BadCount("0".to_string()));
            }
            Ok((base, count))
        }
    }
}

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Address, SweepError> {
    let addr: std::net::Ipv4Addr = s.parse().map_err(|_| SweepError::BadIpv4(s.to_string()))?;
    Ok(Ipv4Address(addr.octets()))
}

/// Parse a colon-separated MAC address.
pub fn parse_mac(s: &str) -> Result<EthernetAddress, SweepError> {
    let bad = || SweepError::BadMac(s.to_string());
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for byte in out.iter_mut() {
        let part = parts.next().ok_or_else(bad)?;
        if part.is_empty() || part.len() > 2 {
            return Err(bad());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| bad())?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok(EthernetAddress(out))
}

impl FromStr for Sweep<Ipv4Address> {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, SweepError> {
        let (base, count) = split_sweep(s)?;
        Ok(Self::new(parse_ipv4(base)?, count))
    }
}

impl FromStr for Sweep<EthernetAddress> {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, SweepError> {
        let (base, count) = split_sweep(s)?;
        Ok(Self::new(parse_mac(base)?, count))
    }
}
