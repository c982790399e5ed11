//! Worker threads and their shutdown.
//!
//! The registry owns every worker handle and a single [`CancellationToken`].
//! Ctrl-C, the report loop and `Drop` all stop workers the same way: by
//! cancelling the token, which each worker polls between bursts.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::report::BatchHistogram;

/// Shared stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters a worker publishes while it runs.
#[derive(Debug, Default)]
pub struct WorkerStats {
    packets: AtomicU64,
    running: AtomicBool,
}

impl WorkerStats {
    pub fn set_packets(&self, n: u64) {
        self.packets.store(n, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// What a worker hands back when it finishes.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: usize,
    pub packets: u64,
    /// First and last moment traffic moved.
    pub span: Option<(Instant, Instant)>,
    pub batches: BatchHistogram,
    /// False if the worker stopped on an error.
    pub completed: bool,
}

impl WorkerReport {
    pub fn elapsed(&self) -> Duration {
        self.span
            .map(|(tic, toc)| toc.saturating_duration_since(tic))
            .unwrap_or_default()
    }
}

/// Everything a worker body receives.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub id: usize,
    pub token: CancellationToken,
    pub stats: Arc<WorkerStats>,
}

/// Clears the running flag even if the body panics.
struct RunningGuard(Arc<WorkerStats>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

struct WorkerHandle {
    id: usize,
    stats: Arc<WorkerStats>,
    thread: Option<JoinHandle<WorkerReport>>,
}

/// Owns the worker threads.
pub struct WorkerRegistry {
    token: CancellationToken,
    workers: Vec<WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Token shared by every worker of this registry.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start a named worker thread running `body`.
    pub fn spawn<F>(&mut self, name: String, body: F) -> io::Result<Arc<WorkerStats>>
    where
        F: FnOnce(WorkerContext) -> WorkerReport + Send + 'static,
    {
        let id = self.workers.len();
        let stats = Arc::new(WorkerStats::default());
        stats.running.store(true, Ordering::Release);
        let ctx = WorkerContext {
            id,
            token: self.token.clone(),
            stats: stats.clone(),
        };
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let _running = RunningGuard(ctx.stats.clone());
            body(ctx)
        });
        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                stats.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        debug!("worker {} started", id);
        self.workers.push(WorkerHandle {
            id,
            stats: stats.clone(),
            thread: Some(thread),
        });
        Ok(stats)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers whose body has not returned yet.
    pub fn active(&self) -> usize {
        self.workers.iter().filter(|w| w.stats.is_running()).count()
    }

    /// Packets moved by all workers so far.
    pub fn total_packets(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.packets()).sum()
    }

    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    /// Wait for every worker. Panicked workers are logged and left out.
    pub fn join_all(&mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            match thread.join() {
                Ok(report) => reports.push(report),
                Err(_) => error!("worker {} panicked", worker.id),
            }
        }
        reports
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
        self.join_all();
    }
}

/// Totals over a set of worker reports.
#[derive(Debug, Clone)]
pub struct Summary {
    pub packets: u64,
    pub elapsed: Duration,
    pub batches: BatchHistogram,
    pub failed: usize,
}

impl Summary {
    /// Sum the counts; the time span runs from the earliest start to the
    /// latest finish.
    pub fn collect(reports: &[WorkerReport], max_burst: usize) -> Self {
        let mut batches = BatchHistogram::new(max_burst);
        let mut packets = 0;
        let mut failed = 0;
        let mut span: Option<(Instant, Instant)> = None;
        for r in reports {
            packets += r.packets;
            batches.merge(&r.batches);
            if !r.completed {
                failed += 1;
            }
            if let Some((tic, toc)) = r.span {
                span = Some(match span {
                    None => (tic, toc),
                    Some((a, b)) => (a.min(tic), b.max(toc)),
                });
            }
        }
        Self {
            packets,
            elapsed: span
                .map(|(a, b)| b.saturating_duration_since(a))
                .unwrap_or_default(),
            batches,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: usize, packets: u64) -> WorkerReport {
        WorkerReport {
            id,
            packets,
            span: None,
            batches: BatchHistogram::new(8),
            completed: true,
        }
    }

    #[test]
    fn test_cancel_stops_workers() {
        let mut reg = WorkerRegistry::new();
        for i in 0..3 {
            reg.spawn(format!("w{i}"), |ctx| {
                let mut n = 0;
                while !ctx.token.is_cancelled() {
                    n += 1;
                    ctx.stats.set_packets(n);
                    std::thread::yield_now();
                }
                report(ctx.id, n)
            })
            .unwrap();
        }
        assert_eq!(reg.len(), 3);
        while reg.total_packets() == 0 {
            std::thread::yield_now();
        }
        reg.cancel_all();
        let reports = reg.join_all();
        assert_eq!(reports.len(), 3);
        assert_eq!(reg.active(), 0);
        let mut ids: Vec<_> = reports.iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_panicked_worker_is_skipped() {
        let mut reg = WorkerRegistry::new();
        reg.spawn("ok".into(), |ctx| report(ctx.id, 5)).unwrap();
        reg.spawn("boom".into(), |_| panic!("worker failure")).unwrap();
        let reports = reg.join_all();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].packets, 5);
        assert_eq!(reg.active(), 0);
    }

    #[test]
    fn test_summary_spans_all_workers() {
        let t0 = Instant::now();
        let mut a = report(0, 10);
        a.span = Some((t0, t0 + Duration::from_millis(100)));
        let mut b = report(1, 20);
        b.span = Some((t0 + Duration::from_millis(50), t0 + Duration::from_millis(300)));
        b.completed = false;
        let s = Summary::collect(&[a, b, report(2, 0)], 8);
        assert_eq!(s.packets, 30);
        assert_eq!(s.elapsed, Duration::from_millis(300));
        assert_eq!(s.failed, 1);
    }
}
