//! Worker bodies: sender, receiver and the simulated wire peer.
//!
//! ```text
//!  sender ──push──► TX ring ──sync──► NIC         counts published frames
//!  peer ──inject──► NIC ──► RX ring ──sync──► receiver   counts released frames
//! ```
//!
//! A sync failure parks the ring for one cycle; the next cycle reinitializes
//! it and carries on. Only a failed reinitialization stops the worker.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use netmap::{Adapter, NicDevice, ReinitReason, SimulatedNic};

use crate::affinity::pin_to_core;
use crate::packet::{verify_frame, FrameBuilder};
use crate::registry::{CancellationToken, WorkerContext, WorkerReport};
use crate::report::BatchHistogram;

/// Silence after which a receiver stops, once it has seen traffic or the
/// wire has gone quiet.
pub const RX_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

fn pin(worker: usize, cpu: Option<usize>) {
    let Some(core) = cpu else {
        return;
    };
    match pin_to_core(core) {
        Ok(()) => debug!("worker {} pinned to cpu {}", worker, core),
        Err(e) => warn!("worker {}: cannot pin to cpu {}: {}", worker, core, e),
    }
}

/// Transmit side of one ring.
pub struct SendJob<D: NicDevice> {
    pub adapter: Arc<Adapter<D>>,
    pub ring: u16,
    pub frames: FrameBuilder,
    /// Frames to send; zero runs until cancelled.
    pub count: u64,
    pub burst: usize,
    pub force_txsync: bool,
    pub cpu: Option<usize>,
}

/// Fill and publish bursts until `count` frames are out or the token fires.
///
/// Only frames the ring actually hands to the device are counted. Frames
/// pushed but discarded by a reinitialization are generated again.
pub fn run_sender<D: NicDevice>(mut job: SendJob<D>, ctx: WorkerContext) -> WorkerReport {
    pin(ctx.id, job.cpu);
    let mut batches = BatchHistogram::new(job.burst);
    let mut sent = 0u64;
    let mut pushed = 0u64;
    let mut completed = true;
    let mut needs_reinit = false;
    let tic = Instant::now();

    while !ctx.token.is_cancelled() && (job.count == 0 || sent < job.count) {
        let mut tx = match job.adapter.lock_tx(job.ring) {
            Ok(tx) => tx,
            Err(e) => {
                error!("worker {}: {}", ctx.id, e);
                completed = false;
                break;
            }
        };

        if needs_reinit {
            match tx.reinitialize() {
                Ok(report) => {
                    info!(
                        "{}: reinitialized, {} slots repaired, hw_cur {}, avail {}",
                        report.queue, report.repaired, report.hw_cur, report.avail
                    );
                    pushed = 0;
                    needs_reinit = false;
                }
                Err(e) => {
                    error!("worker {}: {}", ctx.id, e);
                    completed = false;
                    break;
                }
            }
        }

        let want = match job.count {
            0 => job.burst,
            n => (n - sent - pushed).min(job.burst as u64) as usize,
        };
        let room = want.min(tx.avail());
        let mut n = 0;
        while n < room && tx.push(job.frames.next_frame()) {
            n += 1;
        }
        if n > 0 {
            batches.record(n);
            pushed += n as u64;
        }

        let last = job.count != 0 && sent + pushed >= job.count;
        if job.force_txsync || tx.avail() == 0 || last {
            let before = tx.ring().hw_cur();
            let outcome = tx.sync();
            let published = tx.ring().distance(before, tx.ring().hw_cur()) as u64;
            sent += published;
            pushed = pushed.saturating_sub(published);
            ctx.stats.set_packets(sent);

            if let Err(e) = outcome {
                if e.reason == ReinitReason::Inactive {
                    error!("worker {}: {}", ctx.id, e);
                    completed = false;
                    break;
                }
                warn!("worker {}: {}", ctx.id, e);
                needs_reinit = true;
                drop(tx);
                thread::yield_now();
            }
        }
    }

    WorkerReport {
        id: ctx.id,
        packets: sent,
        span: (sent > 0).then(|| (tic, Instant::now())),
        batches,
        completed,
    }
}

/// Receive side of one ring.
pub struct RecvJob<D: NicDevice> {
    pub adapter: Arc<Adapter<D>>,
    pub ring: u16,
    pub burst: usize,
    /// Parse every frame and count the malformed ones.
    pub verify: bool,
    pub cpu: Option<usize>,
    /// Fired by the sending side once nothing more will arrive.
    pub wire_done: Option<CancellationToken>,
}

/// Drain the ring until [`RX_IDLE_TIMEOUT`] passes without traffic.
///
/// Without `wire_done` the receiver waits without limit for the first
/// frame. With it, a ring that never sees a frame stops one timeout after
/// the wire finishes. The reported span ends at the last frame, so the
/// idle second is not counted.
pub fn run_receiver<D: NicDevice>(job: RecvJob<D>, ctx: WorkerContext) -> WorkerReport {
    pin(ctx.id, job.cpu);
    let mut batches = BatchHistogram::new(job.burst);
    let mut received = 0u64;
    let mut malformed = 0u64;
    let mut completed = true;
    let mut needs_reinit = false;
    let mut first: Option<Instant> = None;
    let mut last_rx = Instant::now();
    let mut quiet_since: Option<Instant> = None;

    while !ctx.token.is_cancelled() {
        let mut rx = match job.adapter.lock_rx(job.ring) {
            Ok(rx) => rx,
            Err(e) => {
                error!("worker {}: {}", ctx.id, e);
                completed = false;
                break;
            }
        };

        if needs_reinit {
            match rx.reinitialize() {
                Ok(report) => {
                    info!(
                        "{}: reinitialized, {} slots repaired, {} frames pending",
                        report.queue, report.repaired, report.avail
                    );
                    needs_reinit = false;
                }
                Err(e) => {
                    error!("worker {}: {}", ctx.id, e);
                    completed = false;
                    break;
                }
            }
        }

        if let Err(e) = rx.sync() {
            if e.reason == ReinitReason::Inactive {
                error!("worker {}: {}", ctx.id, e);
                completed = false;
                break;
            }
            warn!("worker {}: {}", ctx.id, e);
            needs_reinit = true;
            drop(rx);
            thread::yield_now();
            continue;
        }

        let n = rx.avail().min(job.burst);
        if n == 0 {
            drop(rx);
            let wire_quiet = job.wire_done.as_ref().is_some_and(|t| t.is_cancelled());
            if quiet_since.is_none() && wire_quiet {
                quiet_since = Some(Instant::now());
            }
            let idle_from = match (first, quiet_since) {
                (Some(_), Some(quiet)) => Some(last_rx.max(quiet)),
                (Some(_), None) => Some(last_rx),
                (None, quiet) => quiet,
            };
            if idle_from.is_some_and(|t| t.elapsed() >= RX_IDLE_TIMEOUT) {
                break;
            }
            thread::yield_now();
            continue;
        }

        if job.verify {
            for frame in rx.received().take(n) {
                if let Err(e) = verify_frame(frame.data) {
                    malformed += 1;
                    debug!("{}: slot {}: {}", rx.queue(), frame.index, e);
                }
            }
        }
        rx.release(n);

        last_rx = Instant::now();
        first.get_or_insert(last_rx);
        received += n as u64;
        batches.record(n);
        ctx.stats.set_packets(received);
    }

    if malformed > 0 {
        warn!("worker {}: {} malformed frames", ctx.id, malformed);
    }
    WorkerReport {
        id: ctx.id,
        packets: received,
        span: first.map(|tic| (tic, last_rx)),
        batches,
        completed,
    }
}

/// The far end of the simulated wire in receive mode.
pub struct Peer {
    pub nic: Arc<SimulatedNic>,
    pub frames: FrameBuilder,
    /// Frames to inject; zero runs until cancelled.
    pub count: u64,
    /// Fired when the peer stops injecting.
    pub done: CancellationToken,
}

/// Inject frames round-robin over every RX queue, waiting for room rather
/// than dropping. Returns the number injected.
pub fn run_peer(mut peer: Peer, token: CancellationToken) -> u64 {
    let queues = peer.nic.config().queues;
    let mut injected = 0u64;

    while !token.is_cancelled() && (peer.count == 0 || injected < peer.count) {
        let mut progress = false;
        for q in 0..queues {
            let room = peer.nic.rx_room(q) as u64;
            let quota = match peer.count {
                0 => room,
                n => room.min(n - injected),
            };
            for _ in 0..quota {
                if !peer.nic.inject_rx(q, peer.frames.next_frame()) {
                    break;
                }
                injected += 1;
                progress = true;
            }
        }
        if !progress {
            thread::yield_now();
        }
    }
    peer.done.cancel();
    debug!("peer injected {} frames", injected);
    injected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FrameSpec;
    use crate::registry::WorkerRegistry;
    use crate::sweep::Sweep;
    use netmap::{AdapterConfig, BufferPool, QueueId, SimConfig};
    use smoltcp::wire::{EthernetAddress, Ipv4Address};

    fn frames() -> FrameBuilder {
        FrameBuilder::new(FrameSpec {
            src_mac: Sweep::single(EthernetAddress([0x02, 0, 0, 0, 0, 1])),
            dst_mac: Sweep::single(EthernetAddress::BROADCAST),
            src_ip: Sweep::single(Ipv4Address::new(10, 0, 0, 1)),
            dst_ip: "10.1.0.1-50".parse().unwrap(),
            size: 60,
        })
        .unwrap()
    }

    fn open(queues: u16) -> (Arc<SimulatedNic>, Arc<Adapter<SimulatedNic>>) {
        let pool = Arc::new(BufferPool::new(queues as usize * 128, 2048).unwrap());
        let mut sim = SimConfig::new("sim0", queues, 64);
        sim.auto_complete = true;
        let nic = Arc::new(SimulatedNic::new(sim, pool.clone()));
        let adapter = Adapter::open(nic.clone(), pool, AdapterConfig::new(queues, 64)).unwrap();
        (nic, adapter)
    }

    #[test]
    fn test_sender_sends_exact_count() {
        let (nic, adapter) = open(1);
        let mut reg = WorkerRegistry::new();
        let job = SendJob {
            adapter: adapter.clone(),
            ring: 0,
            frames: frames(),
            count: 1000,
            burst: 32,
            force_txsync: false,
            cpu: None,
        };
        reg.spawn("tx0".into(), move |ctx| run_sender(job, ctx)).unwrap();
        let reports = reg.join_all();
        assert_eq!(reports[0].packets, 1000);
        assert!(reports[0].completed);
        assert!(reports[0].batches.iter().all(|(size, _)| size <= 32));
        assert_eq!(nic.stats(QueueId::tx(0)).unwrap().packets, 1000);
    }

    #[test]
    fn test_sender_recovers_from_reinit() {
        let (nic, adapter) = open(1);
        {
            let mut tx = adapter.lock_tx(0).unwrap();
            tx.push(&[0u8; 60]);
            tx.ring_mut().slot_mut(0).buf_idx = netmap::BufIdx::RESERVED;
            tx.sync().unwrap_err();
        }
        let mut reg = WorkerRegistry::new();
        let job = SendJob {
            adapter: adapter.clone(),
            ring: 0,
            frames: frames(),
            count: 200,
            burst: 16,
            force_txsync: true,
            cpu: None,
        };
        // The first sync fails fast; the worker reinitializes and finishes.
        reg.spawn("tx0".into(), move |ctx| run_sender(job, ctx)).unwrap();
        let reports = reg.join_all();
        assert_eq!(reports[0].packets, 200);
        assert!(reports[0].completed);
        assert_eq!(nic.stats(QueueId::tx(0)).unwrap().packets, 200);
    }

    fn spawn_receivers(
        reg: &mut WorkerRegistry,
        adapter: &Arc<Adapter<SimulatedNic>>,
        rings: u16,
        wire_done: &CancellationToken,
    ) {
        for q in 0..rings {
            let job = RecvJob {
                adapter: adapter.clone(),
                ring: q,
                burst: 16,
                verify: true,
                cpu: None,
                wire_done: Some(wire_done.clone()),
            };
            reg.spawn(format!("rx{q}"), move |ctx| run_receiver(job, ctx))
                .unwrap();
        }
    }

    #[test]
    fn test_receiver_counts_peer_frames() {
        let (nic, adapter) = open(2);
        let mut reg = WorkerRegistry::new();
        let done = CancellationToken::new();
        spawn_receivers(&mut reg, &adapter, 2, &done);
        let peer = Peer {
            nic,
            frames: frames(),
            count: 500,
            done,
        };
        let token = reg.token();
        let injected = thread::spawn(move || run_peer(peer, token)).join().unwrap();
        assert_eq!(injected, 500);

        let reports = reg.join_all();
        assert_eq!(reports.iter().map(|r| r.packets).sum::<u64>(), 500);
        assert!(reports.iter().all(|r| r.completed && r.span.is_some()));
    }

    #[test]
    fn test_idle_rings_stop_after_wire_finishes() {
        let (nic, adapter) = open(2);
        let mut reg = WorkerRegistry::new();
        let done = CancellationToken::new();
        spawn_receivers(&mut reg, &adapter, 2, &done);
        // One frame lands on ring 0; ring 1 never sees traffic.
        let peer = Peer {
            nic,
            frames: frames(),
            count: 1,
            done: done.clone(),
        };
        let token = reg.token();
        let injected = thread::spawn(move || run_peer(peer, token)).join().unwrap();
        assert_eq!(injected, 1);
        assert!(done.is_cancelled());

        let started = Instant::now();
        let reports = reg.join_all();
        assert!(started.elapsed() < RX_IDLE_TIMEOUT * 5);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports.iter().map(|r| r.packets).sum::<u64>(), 1);
        assert!(reports.iter().all(|r| r.completed));
        assert_eq!(reports.iter().filter(|r| r.span.is_none()).count(), 1);
    }
}
