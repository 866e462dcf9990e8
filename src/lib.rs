//! OpenSASE Uplink - Dual-WAN Health Monitoring and Traffic Steering
//!
//! Measures two independent internet uplinks, decides which of them carry
//! outbound traffic, and programs that decision into the kernel's routing
//! and address-translation tables.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CONTROL LOOP SUPERVISOR                         │
//! │                                                                         │
//! │   ┌──────────────┐   ┌──────────────┐                                   │
//! │   │  PROBE WAN1  │   │  PROBE WAN2  │   ping -I <iface> × targets       │
//! │   └──────┬───────┘   └──────┬───────┘                                   │
//! │          └────────┬─────────┘                                           │
//! │   ┌───────────────▼──────────────────┐                                  │
//! │   │   AGGREGATE  →  LinkHealth × 2    │   connectivity | loss | latency  │
//! │   └───────────────┬──────────────────┘                                  │
//! │   ┌───────────────▼──────────────────┐                                  │
//! │   │   DECIDE  →  RoutingDecision      │   single | balanced | override   │
//! │   └───────────────┬──────────────────┘                                  │
//! │   ┌───────────────▼──────────────────┐                                  │
//! │   │   APPLY (only when changed)       │   ip route | iptables | sysctl   │
//! │   └───────────────┬──────────────────┘                                  │
//! │   ┌───────────────▼──────────────────┐                                  │
//! │   │   PUBLISH  →  status.json         │   write temp + rename            │
//! │   └──────────────────────────────────┘                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod backend;
pub mod config;
pub mod decision;
pub mod exec;
pub mod health;
pub mod metrics;
pub mod probe;
pub mod routing;
pub mod status;
pub mod supervisor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use config::UplinkConfig;
pub use decision::{decide, quality_score, RoutingDecision, RoutingMode};
pub use health::{aggregate, HealthHistory, LinkHealth};
pub use probe::{PingProber, ProbeResult, Prober};
pub use routing::RouteProgrammer;
pub use status::{StatusPublisher, StatusSnapshot};
pub use supervisor::{ControlHandle, Supervisor, SupervisorState};

/// Uplink error types
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Configuration could not be read or is invalid
    #[error("config error: {0}")]
    Config(String),
    /// No next-hop known for an uplink
    #[error("no gateway found for interface {interface}")]
    GatewayNotFound {
        /// Uplink interface
        interface: String,
    },
    /// A kernel command failed
    #[error("{operation} failed: {source}")]
    Apply {
        /// What was being changed
        operation: String,
        /// The failed command
        #[source]
        source: exec::CommandError,
    },
    /// Filesystem or socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding error
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// Malformed client address
    #[error("invalid client: {0}")]
    InvalidClient(String),
}

impl UplinkError {
    /// Wrap a failed external command with the operation it was part of
    pub fn apply(operation: impl Into<String>, source: exec::CommandError) -> Self {
        Self::Apply {
            operation: operation.into(),
            source,
        }
    }
}

/// Logical uplink identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uplink {
    /// First WAN
    Wan1,
    /// Second WAN
    Wan2,
}

impl Uplink {
    /// Both uplinks in configuration order
    pub const ALL: [Uplink; 2] = [Uplink::Wan1, Uplink::Wan2];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Uplink::Wan1 => "wan1",
            Uplink::Wan2 => "wan2",
        }
    }
}

impl fmt::Display for Uplink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Uplink {
    type Err = UplinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wan1" => Ok(Uplink::Wan1),
            "wan2" => Ok(Uplink::Wan2),
            other => Err(UplinkError::Config(format!("unknown uplink {:?}", other))),
        }
    }
}
