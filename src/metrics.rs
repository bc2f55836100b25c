// src/metrics.rs
//
// Statement latency histograms shared by replay workers and the report

use hdrhistogram::Histogram;
use std::time::Duration;

use crate::constants::{LATENCY_HIST_MAX_US, LATENCY_HIST_SIGFIG};

/// Per-statement latency in microseconds
#[derive(Debug, Clone)]
pub struct LatencyHist {
    hist: Histogram<u64>,
}

impl LatencyHist {
    pub fn new() -> Self {
        Self {
            hist: Histogram::<u64>::new_with_bounds(1, LATENCY_HIST_MAX_US, LATENCY_HIST_SIGFIG)
                .expect("failed to allocate histogram"),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        let micros = (duration.as_micros() as u64).max(1);
        self.hist.saturating_record(micros);
    }

    /// Merge another histogram into this one (combining client results)
    pub fn merge(&mut self, other: &LatencyHist) {
        self.hist.add(&other.hist).ok();
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn summary(&self) -> LatencySummary {
        if self.hist.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            count: self.hist.len(),
            mean_us: self.hist.mean(),
            p50_us: self.hist.value_at_quantile(0.50),
            p99_us: self.hist.value_at_quantile(0.99),
            max_us: self.hist.max(),
        }
    }
}

impl Default for LatencyHist {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_and_merge() {
        let mut a = LatencyHist::new();
        a.record(Duration::from_micros(100));
        a.record(Duration::from_micros(300));
        let mut b = LatencyHist::new();
        b.record(Duration::from_millis(5));

        a.merge(&b);
        let s = a.summary();
        assert_eq!(s.count, 3);
        assert!(s.max_us >= 4_990 && s.max_us <= 5_010);
        assert!(s.p50_us >= 299 && s.p50_us <= 301);
    }

    #[test]
    fn test_empty_summary_is_zero() {
        assert_eq!(LatencyHist::new().summary(), LatencySummary::default());
    }

    #[test]
    fn test_sub_microsecond_counts() {
        let mut h = LatencyHist::new();
        h.record(Duration::from_nanos(10));
        assert_eq!(h.count(), 1);
    }
}
