//! Metrics and Telemetry

use crate::status::{LinkStatus, StatusSnapshot};
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Control loop counters
#[derive(Debug, Default)]
pub struct MetricsCollector {
    cycles: AtomicU64,
    cycle_failures: AtomicU64,
    route_changes: AtomicU64,
}

impl MetricsCollector {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a finished cycle
    pub fn record_cycle(&self, ok: bool) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.cycle_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an applied routing change
    pub fn record_route_change(&self) {
        self.route_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Cycles run
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cycles that ended in an error
    pub fn cycle_failures(&self) -> u64 {
        self.cycle_failures.load(Ordering::Relaxed)
    }

    /// Routing changes applied
    pub fn route_changes(&self) -> u64 {
        self.route_changes.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters
    pub fn collect(&self) -> LoopMetrics {
        LoopMetrics {
            cycles_total: self.cycles(),
            cycle_failures_total: self.cycle_failures(),
            route_changes_total: self.route_changes(),
        }
    }

    /// Export as Prometheus format
    ///
    /// Link gauges are only emitted once a snapshot exists.
    pub fn prometheus(&self, snapshot: Option<&StatusSnapshot>) -> String {
        let counters = self.collect();
        let mut output = String::new();

        if let Some(snapshot) = snapshot {
            let links = [&snapshot.wan1, &snapshot.wan2];
            gauge(&mut output, "uplink_online", "Uplink reachable (1) or not (0)", &links, |l| {
                if l.online { 1.0 } else { 0.0 }
            });
            gauge(&mut output, "uplink_latency_ms", "Mean probe RTT", &links, |l| l.latency_ms);
            gauge(&mut output, "uplink_packet_loss_pct", "Unreached probe targets", &links, |l| {
                l.packet_loss_pct
            });
            gauge(&mut output, "uplink_connectivity_score", "Reached probe targets", &links, |l| {
                l.connectivity_score
            });
            gauge(&mut output, "uplink_quality_score", "Composite latency/loss score", &links, |l| {
                l.quality_score
            });
        }

        counter(&mut output, "uplink_cycles_total", "Control cycles run", counters.cycles_total);
        counter(
            &mut output,
            "uplink_cycle_failures_total",
            "Control cycles that ended in an error",
            counters.cycle_failures_total,
        );
        counter(
            &mut output,
            "uplink_route_changes_total",
            "Routing decisions applied",
            counters.route_changes_total,
        );

        output
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopMetrics {
    /// Cycles run
    pub cycles_total: u64,
    /// Cycles that ended in an error
    pub cycle_failures_total: u64,
    /// Routing changes applied
    pub route_changes_total: u64,
}

fn gauge(out: &mut String, name: &str, help: &str, links: &[&LinkStatus], value: impl Fn(&LinkStatus) -> f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    for link in links {
        let _ = writeln!(
            out,
            "{}{{uplink=\"{}\",interface=\"{}\"}} {}",
            name,
            link.role,
            link.interface,
            value(link)
        );
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}
