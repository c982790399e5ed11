//! Synthetic UDP/IPv4 frames.
//!
//! ```text
//! ┌────────────────┬──────────────────┬─────────────┬──────────────────┐
//! │ Ethernet 14B   │ IPv4 20B         │ UDP 8B      │ payload          │
//! │ dst, src, 0800 │ DF, TOS 0x10     │ 1234 → 4321 │ banner repeated, │
//! │                │ TTL 64, proto 17 │ checksum 0  │ last byte NUL    │
//! └────────────────┴──────────────────┴─────────────┴──────────────────┘
//! ```
//!
//! The UDP checksum is left at zero. The IPv4 header checksum is valid and
//! recomputed whenever a sweep changes the addresses.

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Packet,
    UdpPacket,
};
use thiserror::Error;

use crate::sweep::Sweep;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Bytes in front of the payload.
pub const HEADERS_LEN: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Smallest frame that still holds all headers.
pub const MIN_FRAME_SIZE: usize = HEADERS_LEN;
/// Largest frame the generator builds.
pub const MAX_FRAME_SIZE: usize = 1536;
/// Default frame size, excluding the FCS.
pub const DEFAULT_FRAME_SIZE: usize = 60;

pub const SRC_PORT: u16 = 1234;
pub const DST_PORT: u16 = 4321;
pub const TTL: u8 = 64;
/// IPTOS_LOWDELAY.
pub const TOS_LOWDELAY: u8 = 0x10;

/// Repeated to fill the payload.
pub const PAYLOAD_BANNER: &[u8] = b"nmsync pkt-gen synthetic payload. ";

/// Frame construction and parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame size {0} outside {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}")]
    BadSize(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Addresses and size of the generated traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    pub src_mac: Sweep<EthernetAddress>,
    pub dst_mac: Sweep<EthernetAddress>,
    pub src_ip: Sweep<Ipv4Address>,
    pub dst_ip: Sweep<Ipv4Address>,
    /// Frame length without FCS.
    pub size: usize,
}

/// Fields pulled out of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub src_ip: Ipv4Address,
    pub dst_ip: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: usize,
}

/// Produces one frame per call, stepping every sweep in lock step.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    spec: FrameSpec,
    frame: Vec<u8>,
    seq: u64,
    patch: bool,
}

impl FrameBuilder {
    pub fn new(spec: FrameSpec) -> Result<Self, FrameError> {
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&spec.size) {
            return Err(FrameError::BadSize(spec.size));
        }
        let mut frame = vec![0u8; spec.size];
        write_frame(
            &mut frame,
            spec.src_mac.base(),
            spec.dst_mac.base(),
            spec.src_ip.base(),
            spec.dst_ip.base(),
        );
        let patch = spec.src_mac.is_range()
            || spec.dst_mac.is_range()
            || spec.src_ip.is_range()
            || spec.dst_ip.is_range();
        Ok(Self {
            spec,
            frame,
            seq: 0,
            patch,
        })
    }

    pub fn spec(&self) -> &FrameSpec {
        &self.spec
    }

    /// Frame size in bytes.
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Frames produced so far.
    pub fn produced(&self) -> u64 {
        self.seq
    }

    /// Next frame. Only the address fields and IPv4 checksum change
    /// between calls.
    pub fn next_frame(&mut self) -> &[u8] {
        if self.patch {
            let i = self.seq;
            let spec = &self.spec;
            {
                let mut eth = EthernetFrame::new_unchecked(&mut self.frame[..]);
                eth.set_dst_addr(spec.dst_mac.nth(i));
                eth.set_src_addr(spec.src_mac.nth(i));
            }
            let mut ip = Ipv4Packet::new_unchecked(&mut self.frame[ETH_HEADER_LEN..]);
            ip.set_src_addr(spec.src_ip.nth(i));
            ip.set_dst_addr(spec.dst_ip.nth(i));
            ip.fill_checksum();
        }
        self.seq += 1;
        &self.frame
    }
}

/// Write a complete frame into `buf`; its length is the frame size.
fn write_frame(
    buf: &mut [u8],
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
) {
    let size = buf.len();
    let mut eth = EthernetFrame::new_unchecked(buf);
    eth.set_dst_addr(dst_mac);
    eth.set_src_addr(src_mac);
    eth.set_ethertype(EthernetProtocol::Ipv4);

    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_dscp(TOS_LOWDELAY >> 2);
    ip.set_ecn(0);
    ip.set_total_len((size - ETH_HEADER_LEN) as u16);
    ip.set_ident(0);
    ip.clear_flags();
    ip.set_dont_frag(true);
    ip.set_frag_offset(0);
    ip.set_hop_limit(TTL);
    ip.set_next_header(IpProtocol::Udp);
    ip.set_src_addr(src_ip);
    ip.set_dst_addr(dst_ip);
    ip.fill_checksum();

    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp.set_src_port(SRC_PORT);
    udp.set_dst_port(DST_PORT);
    udp.set_len((size - ETH_HEADER_LEN - IPV4_HEADER_LEN) as u16);
    udp.set_checksum(0);
    fill_payload(udp.payload_mut());
}

/// Repeat the banner over `buf` and NUL-terminate it.
pub fn fill_payload(buf: &mut [u8]) {
    for (dst, src) in buf.iter_mut().zip(PAYLOAD_BANNER.iter().cycle()) {
        *dst = *src;
    }
    if let Some(last) = buf.last_mut() {
        *last = 0;
    }
}

/// Parse a generated frame and check its IPv4 header checksum.
pub fn verify_frame(frame: &[u8]) -> Result<FrameSummary, FrameError> {
    let eth = EthernetFrame::new_checked(frame).map_err(|_| FrameError::Malformed("ethernet"))?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return Err(FrameError::Malformed("not IPv4"));
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).map_err(|_| FrameError::Malformed("ipv4"))?;
    if !ip.verify_checksum() {
        return Err(FrameError::Malformed("ipv4 checksum"));
    }
    if ip.next_header() != IpProtocol::Udp {
        return Err(FrameError::Malformed("not UDP"));
    }
    let udp = UdpPacket::new_checked(ip.payload()).map_err(|_| FrameError::Malformed("udp"))?;
    Ok(FrameSummary {
        src_mac: eth.src_addr(),
        dst_mac: eth.dst_addr(),
        src_ip: ip.src_addr(),
        dst_ip: ip.dst_addr(),
        src_port: udp.src_port(),
        dst_port: udp.dst_port(),
        payload_len: udp.payload().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: usize) -> FrameSpec {
        FrameSpec {
            src_mac: Sweep::single(EthernetAddress([0x02, 0, 0, 0, 0, 1])),
            dst_mac: Sweep::single(EthernetAddress::BROADCAST),
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.1.0.1".parse().unwrap(),
            size,
        }
    }

    #[test]
    fn test_default_frame_layout() {
        let mut b = FrameBuilder::new(spec(DEFAULT_FRAME_SIZE)).unwrap();
        let frame = b.next_frame().to_vec();
        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);

        let ip = Ipv4Packet::new_checked(&frame[ETH_HEADER_LEN..]).unwrap();
        assert_eq!(ip.total_len(), 46);
        assert_eq!(ip.dscp(), TOS_LOWDELAY >> 2);
        assert!(ip.dont_frag());
        assert_eq!(ip.hop_limit(), 64);
        assert!(ip.verify_checksum());

        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.len(), 26);
        assert_eq!(udp.checksum(), 0);
        let payload = udp.payload();
        assert_eq!(payload.len(), 18);
        assert_eq!(&payload[..17], &PAYLOAD_BANNER[..17]);
        assert_eq!(payload[17], 0);
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(
            FrameBuilder::new(spec(MIN_FRAME_SIZE - 1)).unwrap_err(),
            FrameError::BadSize(41)
        );
        assert!(FrameBuilder::new(spec(MIN_FRAME_SIZE)).is_ok());
        assert!(FrameBuilder::new(spec(MAX_FRAME_SIZE)).is_ok());
        assert!(FrameBuilder::new(spec(MAX_FRAME_SIZE + 1)).is_err());
    }

    #[test]
    fn test_sweep_patches_addresses() {
        let mut s = spec(64);
        s.dst_ip = "10.1.0.1-3".parse().unwrap();
        let mut b = FrameBuilder::new(s).unwrap();
        let dsts: Vec<Ipv4Address> = (0..4)
            .map(|_| verify_frame(b.next_frame()).unwrap().dst_ip)
            .collect();
        assert_eq!(
            dsts,
            vec![
                Ipv4Address::new(10, 1, 0, 1),
                Ipv4Address::new(10, 1, 0, 2),
                Ipv4Address::new(10, 1, 0, 3),
                Ipv4Address::new(10, 1, 0, 1),
            ]
        );
        assert_eq!(b.produced(), 4);
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let mut b = FrameBuilder::new(spec(60)).unwrap();
        let mut frame = b.next_frame().to_vec();
        frame[ETH_HEADER_LEN + 8] ^= 0xFF;
        assert_eq!(
            verify_frame(&frame),
            Err(FrameError::Malformed("ipv4 checksum"))
        );
        assert!(verify_frame(&frame[..20]).is_err());
    }
}
