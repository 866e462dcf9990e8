//! Probe Engine
//!
//! Active reachability and latency measurement through a specific uplink.
//! A probe never fails with an error: anything that goes wrong collapses
//! into an unreached result, which the aggregator folds into the link's
//! connectivity score.

use crate::exec::CommandRunner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Latency reported when nothing answered
pub const UNREACHABLE_LATENCY_MS: f64 = 9999.0;

/// Result of probing one target through one interface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Host that was pinged
    pub target: IpAddr,
    /// At least one reply came back
    pub reached: bool,
    /// Mean RTT of the replies that came back
    pub latency_ms: f64,
}

impl ProbeResult {
    /// Target answered with the given mean RTT
    pub fn reached(target: IpAddr, latency_ms: f64) -> Self {
        Self {
            target,
            reached: true,
            latency_ms,
        }
    }

    /// Target did not answer
    pub fn unreached(target: IpAddr) -> Self {
        Self {
            target,
            reached: false,
            latency_ms: UNREACHABLE_LATENCY_MS,
        }
    }
}

/// Measurement capability
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `count` echo probes to `target` egressing via `interface`
    async fn probe(&self, target: IpAddr, interface: &str, count: u32, timeout: Duration) -> ProbeResult;
}

/// Prober backed by the system `ping`
#[derive(Debug, Clone)]
pub struct PingProber {
    runner: CommandRunner,
    grace: Duration,
}

impl PingProber {
    /// Prober allowing `grace` on top of ping's own deadline
    pub fn new(grace: Duration) -> Self {
        Self {
            runner: CommandRunner::new(grace),
            grace,
        }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: IpAddr, interface: &str, count: u32, timeout: Duration) -> ProbeResult {
        let count_arg = count.max(1).to_string();
        let wait_arg = timeout.as_secs().max(1).to_string();
        let target_arg = target.to_string();
        let args = ["-n", "-c", &count_arg, "-W", &wait_arg, "-I", interface, &target_arg];

        let output = match self.runner.output_within("ping", &args, timeout + self.grace).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(%target, interface, error = %e, "probe failed");
                return ProbeResult::unreached(target);
            }
        };

        match parse_ping_output(&output.stdout) {
            Some(latency_ms) => ProbeResult::reached(target, latency_ms),
            None => {
                tracing::debug!(%target, interface, code = ?output.code, "target unreachable");
                ProbeResult::unreached(target)
            }
        }
    }
}

/// Mean RTT in milliseconds if at least one reply came back
pub fn parse_ping_output(stdout: &str) -> Option<f64> {
    let mut received = None;
    let mut summary_avg = None;
    let mut reply_times = Vec::new();

    for line in stdout.lines() {
        if line.contains("packets transmitted") {
            received = line
                .split(',')
                .map(str::trim)
                .find(|part| part.ends_with("received") || part.ends_with("packets received"))
                .and_then(|part| part.split_whitespace().next())
                .and_then(|n| n.parse::<u32>().ok());
        } else if line.contains("min/avg/max") {
            // "rtt min/avg/max/mdev = 9.8/12.3/15.0/2.1 ms" or busybox "round-trip min/avg/max = ..."
            summary_avg = line
                .split('=')
                .nth(1)
                .and_then(|values| values.trim().split('/').nth(1))
                .and_then(|avg| avg.trim().parse::<f64>().ok());
        } else if let Some(idx) = line.find("time=") {
            let value = line[idx + 5..]
                .split(|c: char| c.is_whitespace() || c == 'm')
                .next()
                .and_then(|v| v.parse::<f64>().ok());
            if let Some(v) = value {
                reply_times.push(v);
            }
        }
    }

    let received = received.unwrap_or(reply_times.len() as u32);
    if received == 0 {
        return None;
    }

    summary_avg.or_else(|| {
        if reply_times.is_empty() {
            None
        } else {
            Some(reply_times.iter().sum::<f64>() / reply_times.len() as f64)
        }
    })
    .or(Some(0.0))
}

/// Probe every target through one interface concurrently
///
/// Results come back in target order.
pub async fn probe_link(
    prober: Arc<dyn Prober>,
    interface: &str,
    targets: &[IpAddr],
    count: u32,
    timeout: Duration,
) -> Vec<ProbeResult> {
    let mut set = JoinSet::new();
    for (idx, &target) in targets.iter().enumerate() {
        let prober = prober.clone();
        let interface = interface.to_string();
        set.spawn(async move { (idx, prober.probe(target, &interface, count, timeout).await) });
    }

    let mut results: Vec<Option<ProbeResult>> = vec![None; targets.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result)) => results[idx] = Some(result),
            Err(e) => tracing::error!(interface, error = %e, "probe task panicked"),
        }
    }

    results
        .into_iter()
        .zip(targets)
        .map(|(result, &target)| result.unwrap_or_else(|| ProbeResult::unreached(target)))
        .collect()
}
