//! Control Loop Supervisor
//!
//! Owns the routing decision in force and runs the cycle
//! probe → aggregate → decide → apply (on change) → publish
//! strictly sequentially. A failed cycle is logged and followed by the
//! error backoff; it never ends the loop. Collaborators talk to the loop
//! through a cloneable [`ControlHandle`].

use crate::config::UplinkConfig;
use crate::decision::{decide, RoutingDecision};
use crate::health::{aggregate, HealthHistory, LinkHealth};
use crate::metrics::MetricsCollector;
use crate::probe::{probe_link, Prober};
use crate::routing::{MacAddr, RouteProgrammer};
use crate::status::{StatusPublisher, StatusSnapshot};
use crate::{Uplink, UplinkError};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Cycling
    Running,
    /// Stop requested, current step finishing
    ShuttingDown,
    /// Terminal
    Stopped,
}

/// History rings of both uplinks
#[derive(Debug, Clone, Serialize)]
pub struct LinkHistories {
    /// First uplink
    pub wan1: HealthHistory,
    /// Second uplink
    pub wan2: HealthHistory,
}

struct Shared {
    programmer: Arc<RouteProgrammer>,
    publisher: StatusPublisher,
    pending_override: Mutex<Option<Uplink>>,
    history: RwLock<LinkHistories>,
    /// Last successfully published snapshot
    snapshot: RwLock<Option<StatusSnapshot>>,
    state: RwLock<SupervisorState>,
    metrics: MetricsCollector,
    shutdown: watch::Sender<bool>,
}

/// Handle for collaborators of a running supervisor
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    /// Prefer `uplink` for the next decision only
    pub fn request_override(&self, uplink: Uplink) {
        tracing::info!(%uplink, "Override requested for next cycle");
        *self.shared.pending_override.lock() = Some(uplink);
    }

    /// Override waiting for the next cycle
    pub fn pending_override(&self) -> Option<Uplink> {
        *self.shared.pending_override.lock()
    }

    /// Last snapshot this process published
    pub fn snapshot(&self) -> Option<StatusSnapshot> {
        self.shared.snapshot.read().clone()
    }

    /// Snapshot as readers of the status file see it
    pub async fn published_snapshot(&self) -> Result<Option<StatusSnapshot>, UplinkError> {
        self.shared.publisher.load().await
    }

    /// Copy of both history rings
    pub fn history(&self) -> LinkHistories {
        self.shared.history.read().clone()
    }

    /// Lifecycle state
    pub fn state(&self) -> SupervisorState {
        *self.shared.state.read()
    }

    /// Loop counters
    pub fn metrics(&self) -> &MetricsCollector {
        &self.shared.metrics
    }

    /// Prometheus exposition of the last snapshot and loop counters
    pub fn prometheus(&self) -> String {
        let snapshot = self.shared.snapshot.read();
        self.shared.metrics.prometheus(snapshot.as_ref())
    }

    /// Cut a LAN client off from forwarding
    pub async fn block_client(&self, ip: IpAddr, mac: MacAddr) -> Result<(), UplinkError> {
        self.shared.programmer.block_client(ip, mac).await
    }

    /// Restore forwarding for a LAN client
    pub async fn unblock_client(&self, ip: IpAddr, mac: MacAddr) -> Result<(), UplinkError> {
        self.shared.programmer.unblock_client(ip, mac).await
    }

    /// Ask the loop to stop after the current step
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.write();
            if *state == SupervisorState::Running {
                *state = SupervisorState::ShuttingDown;
            }
        }
        self.shared.shutdown.send_replace(true);
    }

    /// Resolves once shutdown has been requested
    pub async fn stopping(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        wait_for_shutdown(&mut rx).await;
    }
}

/// Control loop supervisor
pub struct Supervisor {
    config: Arc<UplinkConfig>,
    prober: Arc<dyn Prober>,
    shared: Arc<Shared>,
    applied: Option<RoutingDecision>,
}

impl Supervisor {
    /// Supervisor with no decision applied yet
    pub fn new(
        config: Arc<UplinkConfig>,
        prober: Arc<dyn Prober>,
        programmer: Arc<RouteProgrammer>,
        publisher: StatusPublisher,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let history = LinkHistories {
            wan1: HealthHistory::new(config.history_size),
            wan2: HealthHistory::new(config.history_size),
        };
        Self {
            config,
            prober,
            shared: Arc::new(Shared {
                programmer,
                publisher,
                pending_override: Mutex::new(None),
                history: RwLock::new(history),
                snapshot: RwLock::new(None),
                state: RwLock::new(SupervisorState::Running),
                metrics: MetricsCollector::new(),
                shutdown,
            }),
            applied: None,
        }
    }

    /// Handle for the API and signal handler
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: self.shared.clone(),
        }
    }

    /// Decision currently programmed into the kernel
    pub fn applied(&self) -> Option<&RoutingDecision> {
        self.applied.as_ref()
    }

    /// Run cycles until shutdown is requested
    pub async fn run(&mut self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        tracing::info!(
            wan1 = %self.config.wan1.interface,
            wan2 = %self.config.wan2.interface,
            interval_secs = self.config.check_interval_secs,
            "Control loop started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            // Nothing has touched the kernel yet, so probing can be abandoned.
            let (wan1, wan2) = tokio::select! {
                measured = self.measure() => measured,
                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::info!("Shutdown requested while probing, abandoning cycle");
                    break;
                }
            };

            let delay = match self.evaluate(wan1, wan2).await {
                Ok(()) => self.config.check_interval(),
                Err(e) => {
                    tracing::error!(error = %e, backoff_secs = self.config.error_backoff_secs, "Control cycle failed");
                    self.config.error_backoff()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        *self.shared.state.write() = SupervisorState::Stopped;
        tracing::info!("Control loop stopped");
    }

    /// Run exactly one cycle
    pub async fn run_once(&mut self) -> Result<(), UplinkError> {
        let (wan1, wan2) = self.measure().await;
        self.evaluate(wan1, wan2).await
    }

    /// Probe both uplinks concurrently and aggregate
    async fn measure(&self) -> (LinkHealth, LinkHealth) {
        let probe = &self.config.probe;
        let (wan1, wan2) = tokio::join!(
            probe_link(
                self.prober.clone(),
                &self.config.wan1.interface,
                &probe.targets,
                probe.count,
                probe.timeout(),
            ),
            probe_link(
                self.prober.clone(),
                &self.config.wan2.interface,
                &probe.targets,
                probe.count,
                probe.timeout(),
            ),
        );

        let thresholds = &self.config.thresholds;
        (
            aggregate(&self.config.wan1.interface, &wan1, thresholds),
            aggregate(&self.config.wan2.interface, &wan2, thresholds),
        )
    }

    /// Decide, apply on change, publish what is in force
    async fn evaluate(&mut self, wan1: LinkHealth, wan2: LinkHealth) -> Result<(), UplinkError> {
        for health in [&wan1, &wan2] {
            log_health(health);
        }
        {
            let mut history = self.shared.history.write();
            history.wan1.record(wan1.clone());
            history.wan2.record(wan2.clone());
        }

        let preferred = self.shared.pending_override.lock().take();
        if let Some(uplink) = preferred {
            let health = match uplink {
                Uplink::Wan1 => &wan1,
                Uplink::Wan2 => &wan2,
            };
            if !health.online {
                tracing::warn!(%uplink, interface = %health.interface_name, "Override ignored, uplink offline");
            }
        }
        if !wan1.online && !wan2.online {
            tracing::warn!("Both uplinks offline, keeping current routing");
        }

        let desired = decide(self.applied.as_ref(), &wan1, &wan2, preferred, Utc::now());

        let applied = match desired {
            Some(decision) if self.applied.as_ref() != Some(&decision) => {
                match self.shared.programmer.apply(&decision).await {
                    Ok(()) => {
                        tracing::info!(
                            from = %self.applied.as_ref().map(|d| d.mode.to_string()).unwrap_or_else(|| "none".into()),
                            to = %decision.mode,
                            "Routing changed"
                        );
                        self.shared.metrics.record_route_change();
                        self.applied = Some(decision);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(mode = %decision.mode, error = %e, "Failed to apply routing decision");
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        };

        let published = match self
            .shared
            .publisher
            .publish(&wan1, &wan2, self.applied.as_ref())
            .await
        {
            Ok(snapshot) => {
                *self.shared.snapshot.write() = Some(snapshot);
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.shared.publisher.path().display(), error = %e, "Failed to publish status");
                Err(e)
            }
        };

        let result = applied.and(published);
        self.shared.metrics.record_cycle(result.is_ok());
        result
    }
}

fn log_health(health: &LinkHealth) {
    tracing::info!(
        interface = %health.interface_name,
        online = health.online,
        latency_ms = health.latency_ms,
        loss_pct = health.packet_loss_pct,
        connectivity = health.connectivity_score,
        quality = health.quality_score,
        "Link measured"
    );
    if health.degraded {
        tracing::warn!(
            interface = %health.interface_name,
            latency_ms = health.latency_ms,
            loss_pct = health.packet_loss_pct,
            "Link degraded"
        );
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone; nothing can request shutdown any more
            std::future::pending::<()>().await;
        }
    }
}
