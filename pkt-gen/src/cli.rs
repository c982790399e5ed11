//! Command line parsing and validation.
//!
//! [`Args`] is the raw clap surface; [`GenConfig`] is what the workers run
//! with, after every range and address has been checked.

use std::time::Duration;

use clap::{ArgAction, Parser};
use smoltcp::wire::{EthernetAddress, Ipv4Address};
use thiserror::Error;

use crate::packet::{FrameSpec, DEFAULT_FRAME_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::sweep::{Sweep, SweepError};

/// Largest burst a worker moves per sync.
pub const MAX_BURST: usize = 2048;
/// Upper bound on worker threads.
pub const MAX_THREADS: usize = 64;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pkt-gen",
    version,
    about = "Packet generator and sink over netmap-style rings"
)]
pub struct Args {
    /// Interface to open (simN)
    #[arg(short = 'i', value_name = "IFNAME")]
    pub interface: String,

    /// Send PKTS packets (0 means until interrupted)
    #[arg(short = 't', value_name = "PKTS", conflicts_with = "receive")]
    pub transmit: Option<u64>,

    /// Receive; PKTS is how many frames the simulated peer injects (0 means until interrupted)
    #[arg(short = 'r', value_name = "PKTS")]
    pub receive: Option<u64>,

    /// Frame size in bytes, without FCS
    #[arg(short = 'l', value_name = "SIZE", default_value_t = DEFAULT_FRAME_SIZE)]
    pub size: usize,

    /// Destination IPv4 address, optionally base-count
    #[arg(short = 'd', value_name = "IP", default_value = "10.1.0.1")]
    pub dst_ip: String,

    /// Source IPv4 address, optionally base-count
    #[arg(short = 's', value_name = "IP", default_value = "10.0.0.1")]
    pub src_ip: String,

    /// Destination MAC address, optionally base-count
    #[arg(short = 'D', value_name = "MAC", default_value = "ff:ff:ff:ff:ff:ff")]
    pub dst_mac: String,

    /// Source MAC address, optionally base-count [default: interface MAC]
    #[arg(short = 'S', value_name = "MAC")]
    pub src_mac: Option<String>,

    /// Frames per burst
    #[arg(short = 'b', value_name = "BURST", default_value_t = 512)]
    pub burst: usize,

    /// CPUs to spread workers over (0 means all)
    #[arg(short = 'c', value_name = "CPUS", default_value_t = 1)]
    pub cpus: usize,

    /// Worker threads, one ring pair each
    #[arg(short = 'p', value_name = "THREADS", default_value_t = 1)]
    pub threads: usize,

    /// Explicit CPU list for the workers, comma separated
    #[arg(short = 'a', value_name = "CPU,...", value_delimiter = ',')]
    pub affinity: Vec<usize>,

    /// Milliseconds between rate reports
    #[arg(short = 'T', value_name = "MS", default_value_t = 1000)]
    pub report_ms: u64,

    /// Sync the TX ring after every burst
    #[arg(short = 'f')]
    pub force_txsync: bool,

    /// More output; repeat for frame checking on receive
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,
}

/// Traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Send,
    Receive,
}

/// Invalid argument combinations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("frame size {0} outside {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}")]
    BadSize(usize),
    #[error("burst {0} outside 1..={MAX_BURST}")]
    BadBurst(usize),
    #[error("thread count {0} outside 1..={MAX_THREADS}")]
    BadThreads(usize),
    #[error("{requested} cpus requested, {available} available")]
    BadCpus { requested: usize, available: usize },
    #[error("cpu {cpu} in affinity list, {available} available")]
    BadAffinity { cpu: usize, available: usize },
    #[error("report interval must be at least 1 ms")]
    BadReportInterval,
    #[error(transparent)]
    Address(#[from] SweepError),
}

/// Validated run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenConfig {
    pub ifname: String,
    pub mode: Mode,
    /// Frames to send, or frames the peer injects. Zero is unbounded.
    pub count: u64,
    pub size: usize,
    pub src_ip: Sweep<Ipv4Address>,
    pub dst_ip: Sweep<Ipv4Address>,
    pub src_mac: Option<Sweep<EthernetAddress>>,
    pub dst_mac: Sweep<EthernetAddress>,
    pub burst: usize,
    pub cpus: usize,
    pub threads: usize,
    pub affinity: Vec<usize>,
    pub report_interval: Duration,
    pub force_txsync: bool,
    pub verbose: u8,
}

impl GenConfig {
    /// Check `args` against the machine's `available_cpus`.
    pub fn from_args(args: Args, available_cpus: usize) -> Result<Self, ConfigError> {
        let (mode, count) = match (args.transmit, args.receive) {
            (Some(n), _) => (Mode::Send, n),
            (None, Some(n)) => (Mode::Receive, n),
            (None, None) => (Mode::Receive, 0),
        };

        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&args.size) {
            return Err(ConfigError::BadSize(args.size));
        }
        if !(1..=MAX_BURST).contains(&args.burst) {
            return Err(ConfigError::BadBurst(args.burst));
        }
        if !(1..=MAX_THREADS).contains(&args.threads) {
            return Err(ConfigError::BadThreads(args.threads));
        }
        let cpus = match args.cpus {
            0 => available_cpus,
            n if n > available_cpus => {
                return Err(ConfigError::BadCpus {
                    requested: n,
                    available: available_cpus,
                })
            }
            n => n,
        };
        if let Some(&cpu) = args.affinity.iter().find(|&&c| c >= available_cpus) {
            return Err(ConfigError::BadAffinity {
                cpu,
                available: available_cpus,
            });
        }
        if args.report_ms == 0 {
            return Err(ConfigError::BadReportInterval);
        }

        Ok(Self {
            ifname: args.interface,
            mode,
            count,
            size: args.size,
            src_ip: args.src_ip.parse()?,
            dst_ip: args.dst_ip.parse()?,
            src_mac: args.src_mac.as_deref().map(str::parse).transpose()?,
            dst_mac: args.dst_mac.parse()?,
            burst: args.burst,
            cpus,
            threads: args.threads,
            affinity: args.affinity,
            report_interval: Duration::from_millis(args.report_ms),
            force_txsync: args.force_txsync,
            verbose: args.verbose,
        })
    }

    /// CPU worker `i` is pinned to, if any.
    pub fn cpu_for(&self, worker: usize) -> Option<usize> {
        if !self.affinity.is_empty() {
            Some(self.affinity[worker % self.affinity.len()])
        } else if self.cpus > 0 {
            Some(worker % self.cpus)
        } else {
            None
        }
    }

    /// Frames assigned to worker `i`. The remainder goes to the first workers.
    pub fn share_of(&self, worker: usize) -> u64 {
        let threads = self.threads as u64;
        let base = self.count / threads;
        let extra = u64::from((worker as u64) < self.count % threads);
        base + extra
    }

    /// Frame layout, with `iface_mac` as the source when `-S` was not given.
    pub fn frame_spec(&self, iface_mac: EthernetAddress) -> FrameSpec {
        FrameSpec {
            src_mac: self.src_mac.unwrap_or_else(|| Sweep::single(iface_mac)),
            dst_mac: self.dst_mac,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<GenConfig, ConfigError> {
        let args = Args::try_parse_from(argv).unwrap();
        GenConfig::from_args(args, 4)
    }

    #[test]
    fn test_defaults() {
        let c = parse(&["pkt-gen", "-i", "sim0"]).unwrap();
        assert_eq!(c.mode, Mode::Receive);
        assert_eq!(c.count, 0);
        assert_eq!(c.size, 60);
        assert_eq!(c.burst, 512);
        assert_eq!(c.src_ip.to_string(), "10.0.0.1");
        assert_eq!(c.dst_ip.to_string(), "10.1.0.1");
        assert_eq!(c.dst_mac.base(), EthernetAddress::BROADCAST);
        assert_eq!(c.src_mac, None);
        assert_eq!(c.report_interval, Duration::from_secs(1));
        assert_eq!(c.cpu_for(3), Some(0));
    }

    #[test]
    fn test_send_with_sweep() {
        let c = parse(&[
            "pkt-gen", "-i", "sim0", "-t", "1000", "-d", "10.1.0.1-50", "-p", "3", "-c", "0",
        ])
        .unwrap();
        assert_eq!(c.mode, Mode::Send);
        assert_eq!(c.dst_ip.count(), 50);
        assert_eq!(c.cpus, 4);
        assert_eq!(
            (0..3).map(|i| c.share_of(i)).collect::<Vec<_>>(),
            vec![334, 333, 333]
        );
    }

    #[test]
    fn test_affinity_list() {
        let c = parse(&["pkt-gen", "-i", "sim0", "-p", "4", "-a", "2,3"]).unwrap();
        assert_eq!(
            (0..4).map(|i| c.cpu_for(i)).collect::<Vec<_>>(),
            vec![Some(2), Some(3), Some(2), Some(3)]
        );
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            parse(&["pkt-gen", "-i", "sim0", "-l", "16"]),
            Err(ConfigError::BadSize(16))
        );
        assert_eq!(
            parse(&["pkt-gen", "-i", "sim0", "-b", "0"]),
            Err(ConfigError::BadBurst(0))
        );
        assert_eq!(
            parse(&["pkt-gen", "-i", "sim0", "-c", "9"]),
            Err(ConfigError::BadCpus {
                requested: 9,
                available: 4
            })
        );
        assert!(matches!(
            parse(&["pkt-gen", "-i", "sim0", "-d", "10.1.0"]),
            Err(ConfigError::Address(SweepError::BadIpv4(_)))
        ));
        assert!(Args::try_parse_from(["pkt-gen", "-i", "sim0", "-t", "1", "-r", "1"]).is_err());
        assert!(Args::try_parse_from(["pkt-gen"]).is_err());
    }
}
