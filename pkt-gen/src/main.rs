//! `pkt-gen`: blast or sink UDP frames over netmap-style rings.
//!
//! ```text
//! pkt-gen -i sim0 -t 10000000 -l 60 -d 10.1.0.1-50 -p 4
//! pkt-gen -i sim0 -r 1000000
//! ```

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info, warn, LevelFilter};

use pkt_gen::affinity::available_cpus;
use pkt_gen::iface;
use pkt_gen::report::{rx_summary, tx_summary, RateMeter};
use pkt_gen::worker::{run_peer, run_receiver, run_sender, Peer, RecvJob, SendJob};
use pkt_gen::{
    Args, CancellationToken, FrameBuilder, GenConfig, Mode, Summary, WorkerRegistry,
};

/// How often the main thread checks for finished workers.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pkt-gen: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = if verbose > 0 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format_timestamp(None)
        .init();
}

/// Print the usage line before handing the error back.
fn usage_error<E: Into<anyhow::Error>>(err: E) -> anyhow::Error {
    eprintln!("{}", Args::command().render_usage());
    err.into()
}

fn run(args: Args) -> Result<()> {
    let config = GenConfig::from_args(args, available_cpus()).map_err(usage_error)?;
    let iface = iface::open(&config.ifname, config.threads as u16).map_err(usage_error)?;
    let spec = config.frame_spec(iface.mac());

    let verb = match config.mode {
        Mode::Send => "Sending on",
        Mode::Receive => "Receiving from",
    };
    println!(
        "{} {}: {} threads and {} cpus.",
        verb, iface.name, config.threads, config.cpus
    );
    println!(
        "{} -> {} ({} -> {})",
        spec.src_ip, spec.dst_ip, spec.src_mac, spec.dst_mac
    );

    let mut registry = WorkerRegistry::new();
    let token = registry.token();
    {
        let token = token.clone();
        ctrlc::set_handler(move || token.cancel()).context("installing the Ctrl-C handler")?;
    }

    // Lets receivers on rings the peer never reaches time out.
    let wire_done = CancellationToken::new();

    for i in 0..config.threads {
        let ring = i as u16;
        let cpu = config.cpu_for(i);
        let adapter = iface.adapter.clone();
        let spawned = match config.mode {
            Mode::Send => {
                let count = config.share_of(i);
                if config.count != 0 && count == 0 {
                    debug!("worker {} has nothing to send", i);
                    continue;
                }
                let job = SendJob {
                    adapter,
                    ring,
                    frames: FrameBuilder::new(spec.clone())?,
                    count,
                    burst: config.burst,
                    force_txsync: config.force_txsync,
                    cpu,
                };
                registry.spawn(format!("pkt-gen-tx{i}"), move |ctx| run_sender(job, ctx))
            }
            Mode::Receive => {
                let job = RecvJob {
                    adapter,
                    ring,
                    burst: config.burst,
                    verify: config.verbose > 1,
                    cpu,
                    wire_done: Some(wire_done.clone()),
                };
                registry.spawn(format!("pkt-gen-rx{i}"), move |ctx| run_receiver(job, ctx))
            }
        };
        spawned.with_context(|| format!("spawning worker {i}"))?;
    }

    let peer = match config.mode {
        Mode::Receive => {
            let peer = Peer {
                nic: iface.nic.clone(),
                frames: FrameBuilder::new(spec.clone())?,
                count: config.count,
                done: wire_done,
            };
            let token = token.clone();
            let handle = thread::Builder::new()
                .name("pkt-gen-peer".into())
                .spawn(move || run_peer(peer, token))
                .context("spawning the wire peer")?;
            Some(handle)
        }
        Mode::Send => None,
    };

    let mut meter = RateMeter::new(Instant::now());
    let mut next_report = Instant::now() + config.report_interval;
    while registry.active() > 0 {
        thread::sleep(POLL_INTERVAL.min(config.report_interval));
        let now = Instant::now();
        if now >= next_report {
            if let Some(pps) = meter.sample(now, registry.total_packets()) {
                info!("{} pps", pps);
            }
            next_report = now + config.report_interval;
        }
    }

    // Workers are done; stop the peer if it is still waiting for room.
    token.cancel();
    if let Some(handle) = peer {
        match handle.join() {
            Ok(n) => debug!("peer injected {} frames", n),
            Err(_) => warn!("wire peer panicked"),
        }
    }

    let reports = registry.join_all();
    let summary = Summary::collect(&reports, config.burst);
    for (size, n) in summary.batches.iter() {
        debug!("bursts of {:>5}: {}", size, n);
    }
    if summary.failed > 0 {
        warn!("{} workers stopped on an error", summary.failed);
    }

    let secs = summary.elapsed.as_secs_f64();
    match config.mode {
        Mode::Send => println!("{}", tx_summary(summary.packets, config.size, secs)),
        Mode::Receive => println!("{}", rx_summary(summary.packets, secs)),
    }

    iface.adapter.close().context("closing the interface")?;
    Ok(())
}
