//! Rate formatting, batch histograms and the periodic pps meter.

use std::time::{Duration, Instant};

/// SI prefixes used in the summaries.
pub const UNITS: [&str; 4] = ["", "K", "M", "G"];

/// Reports closer together than this are skipped.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(10);

/// Scale `value` down by 1000 until it is below 1000 or the prefix runs out.
pub fn scale(mut value: f64) -> (f64, &'static str) {
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    (value, UNITS[unit])
}

fn rate(count: f64, secs: f64) -> f64 {
    if secs > 0.0 {
        count / secs
    } else {
        0.0
    }
}

/// Final sender summary.
pub fn tx_summary(sent: u64, size: usize, secs: f64) -> String {
    let (pps, pps_unit) = scale(rate(sent as f64, secs));
    let (bps, bps_unit) = scale(rate(sent as f64 * size as f64 * 8.0, secs));
    format!(
        "Sent {sent} packets, {size} bytes each, in {secs:.2} seconds.\n\
         Speed: {pps:.2}{pps_unit}pps. Bandwidth: {bps:.2}{bps_unit}bps."
    )
}

/// Final receiver summary.
pub fn rx_summary(received: u64, secs: f64) -> String {
    let (pps, unit) = scale(rate(received as f64, secs));
    format!("Received {received} packets, in {secs:.2} seconds.\nSpeed: {pps:.2}{unit}pps.")
}

/// How many frames each burst actually moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHistogram {
    counts: Vec<u64>,
}

impl BatchHistogram {
    /// Histogram for bursts of up to `max_burst` frames.
    pub fn new(max_burst: usize) -> Self {
        Self {
            counts: vec![0; max_burst + 1],
        }
    }

    /// Count one burst of `n` frames. Larger bursts land in the last bucket.
    pub fn record(&mut self, n: usize) {
        let last = self.counts.len() - 1;
        self.counts[n.min(last)] += 1;
    }

    pub fn merge(&mut self, other: &BatchHistogram) {
        if other.counts.len() > self.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
    }

    /// Number of bursts recorded.
    pub fn bursts(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Frames across all bursts.
    pub fn frames(&self) -> u64 {
        self.counts
            .iter()
            .enumerate()
            .map(|(size, &n)| size as u64 * n)
            .sum()
    }

    /// `(burst size, occurrences)` for every non-empty bucket.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(size, &n)| (size, n))
    }
}

/// Turns a running packet counter into periodic pps samples.
#[derive(Debug, Clone)]
pub struct RateMeter {
    prev_count: u64,
    prev_at: Instant,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            prev_count: 0,
            prev_at: now,
        }
    }

    /// Packets per second since the previous sample, or `None` if less than
    /// [`MIN_REPORT_INTERVAL`] has passed.
    pub fn sample(&mut self, now: Instant, count: u64) -> Option<u64> {
        let elapsed = now.saturating_duration_since(self.prev_at);
        if elapsed < MIN_REPORT_INTERVAL {
            return None;
        }
        let delta = count.saturating_sub(self.prev_count);
        self.prev_count = count;
        self.prev_at = now;
        Some((delta as f64 / elapsed.as_secs_f64()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale() {
        assert_eq!(scale(999.0), (999.0, ""));
        assert_eq!(scale(14_880_000.0).1, "M");
        let (v, unit) = scale(2.5e12);
        assert_eq!(unit, "G");
        assert!((v - 2500.0).abs() < 1e-6);
    }

    #[test]
    fn test_tx_summary() {
        let text = tx_summary(1_000_000, 60, 2.0);
        assert_eq!(
            text,
            "Sent 1000000 packets, 60 bytes each, in 2.00 seconds.\n\
             Speed: 500.00Kpps. Bandwidth: 240.00Mbps."
        );
    }

    #[test]
    fn test_rx_summary_zero_time() {
        assert_eq!(
            rx_summary(0, 0.0),
            "Received 0 packets, in 0.00 seconds.\nSpeed: 0.00pps."
        );
    }

    #[test]
    fn test_histogram() {
        let mut h = BatchHistogram::new(4);
        h.record(4);
        h.record(4);
        h.record(1);
        h.record(9);
        let mut other = BatchHistogram::new(2);
        other.record(2);
        h.merge(&other);
        assert_eq!(h.bursts(), 5);
        assert_eq!(h.frames(), 4 + 4 + 1 + 4 + 2);
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![(1, 1), (2, 1), (4, 3)]);
    }

    #[test]
    fn test_rate_meter_skips_short_intervals() {
        let t0 = Instant::now();
        let mut m = RateMeter::new(t0);
        assert_eq!(m.sample(t0 + Duration::from_millis(5), 100), None);
        assert_eq!(m.sample(t0 + Duration::from_millis(500), 1000), Some(2000));
        assert_eq!(m.sample(t0 + Duration::from_millis(1500), 1000), Some(0));
    }
}
