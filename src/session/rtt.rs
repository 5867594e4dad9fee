//! Round-trip time bookkeeping for clock-sync probes

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use crate::constants::MAX_RTT_SAMPLES;

/// Network round trip from a four-timestamp exchange.
///
/// `t1` ping sent, `t2` ping received remotely, `t3` pong sent remotely,
/// `t4` pong received. Remote processing time is excluded.
pub fn round_trip(t1: f64, t2: f64, t3: f64, t4: f64) -> f64 {
    (t4 - t1) - (t3 - t2)
}

/// Sliding window of RTT samples for one remote address
#[derive(Debug, Clone)]
pub struct RttStats {
    samples: VecDeque<f64>,
    sum: f64,
    capacity: usize,
}

impl RttStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            sum: 0.0,
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, rtt: f64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(rtt);
        self.sum += rtt;
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new(MAX_RTT_SAMPLES)
    }
}

/// Averaged RTT toward one source address
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RttReport {
    pub ip: IpAddr,
    pub avg_rtt: f64,
    pub samples: usize,
}

/// RTT statistics keyed by the address the probe came back from
#[derive(Debug, Default)]
pub struct RttTable {
    stats: HashMap<IpAddr, RttStats>,
}

impl RttTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ip: IpAddr, rtt: f64) {
        self.stats.entry(ip).or_default().record(rtt);
    }

    pub fn average_for(&self, ip: IpAddr) -> Option<f64> {
        self.stats.get(&ip).filter(|s| !s.is_empty()).map(RttStats::average)
    }

    /// Snapshot of every tracked address, sorted by address
    pub fn reports(&self) -> Vec<RttReport> {
        let mut reports: Vec<RttReport> = self
            .stats
            .iter()
            .map(|(ip, stats)| RttReport {
                ip: *ip,
                avg_rtt: stats.average(),
                samples: stats.len(),
            })
            .collect();
        reports.sort_by_key(|r| r.ip);
        reports
    }

    pub fn clear(&mut self) {
        self.stats.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
