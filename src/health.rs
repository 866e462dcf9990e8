//! Link Health Aggregation

use crate::config::ThresholdConfig;
use crate::decision::quality_score;
use crate::probe::{ProbeResult, UNREACHABLE_LATENCY_MS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Health of one uplink for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkHealth {
    /// Kernel interface name
    pub interface_name: String,
    /// `connectivity_score > min_connectivity_score`
    pub online: bool,
    /// Mean RTT over reachable targets, [`UNREACHABLE_LATENCY_MS`] when none
    pub latency_ms: f64,
    /// Percentage of targets that did not answer
    pub packet_loss_pct: f64,
    /// Percentage of targets that answered
    pub connectivity_score: f64,
    /// 0 whenever offline
    pub quality_score: f64,
    /// Online but over the latency or loss threshold
    pub degraded: bool,
    /// When the probes finished
    pub measured_at: DateTime<Utc>,
}

impl LinkHealth {
    /// Placeholder for an interface that has not been measured
    pub fn unmeasured(interface_name: &str) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            online: false,
            latency_ms: UNREACHABLE_LATENCY_MS,
            packet_loss_pct: 100.0,
            connectivity_score: 0.0,
            quality_score: 0.0,
            degraded: false,
            measured_at: Utc::now(),
        }
    }
}

/// Fold one interface's probe batch into a [`LinkHealth`]
pub fn aggregate(interface_name: &str, results: &[ProbeResult], thresholds: &ThresholdConfig) -> LinkHealth {
    let total = results.len();
    let reached: Vec<&ProbeResult> = results.iter().filter(|r| r.reached).collect();

    let (connectivity_score, packet_loss_pct) = if total == 0 {
        (0.0, 100.0)
    } else {
        let reached = reached.len() as f64;
        let total = total as f64;
        (100.0 * reached / total, 100.0 * (total - reached) / total)
    };

    let latency_ms = if reached.is_empty() {
        UNREACHABLE_LATENCY_MS
    } else {
        reached.iter().map(|r| r.latency_ms).sum::<f64>() / reached.len() as f64
    };

    let online = connectivity_score > thresholds.min_connectivity_score;

    let mut health = LinkHealth {
        interface_name: interface_name.to_string(),
        online,
        latency_ms,
        packet_loss_pct,
        connectivity_score,
        quality_score: 0.0,
        degraded: online
            && (latency_ms > thresholds.max_latency_ms
                || packet_loss_pct > thresholds.max_packet_loss_pct),
        measured_at: Utc::now(),
    };
    health.quality_score = quality_score(&health);
    health
}

/// Bounded per-interface history, oldest evicted first
///
/// Kept for diagnostics and trend analysis; the decision engine does not
/// read it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthHistory {
    capacity: usize,
    entries: VecDeque<LinkHealth>,
}

impl HealthHistory {
    /// Empty ring holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a snapshot, evicting the oldest past capacity
    pub fn record(&mut self, health: LinkHealth) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(health);
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&LinkHealth> {
        self.entries.back()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &LinkHealth> {
        self.entries.iter()
    }

    /// Entries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum entries held
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
