//! Decision Engine
//!
//! Pure mapping from the two current link measurements (and the decision
//! currently in force) to the decision that should be in force. Nothing
//! here touches the kernel; the supervisor compares the result with what
//! it last applied and only then calls the route programmer.
//!
//! | wan1 online | wan2 online | outcome                       |
//! |-------------|-------------|-------------------------------|
//! | no          | no          | previous decision, unchanged  |
//! | yes         | no          | `Single(wan1)`                |
//! | no          | yes         | `Single(wan2)`                |
//! | yes         | yes         | `Balanced(wan1, wan2, 1, 1)`  |
//!
//! An override naming an online uplink wins for the cycle it is passed in.

use crate::health::LinkHealth;
use crate::Uplink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight given to each next-hop when both links are online
pub const BALANCED_WEIGHT: u8 = 1;

const LATENCY_WEIGHT: f64 = 0.6;
const LOSS_WEIGHT: f64 = 0.4;

/// How default-route traffic is spread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RoutingMode {
    /// All traffic via one uplink
    Single {
        /// The uplink carrying everything
        interface: String,
    },
    /// Multipath default route over both uplinks
    Balanced {
        /// First next-hop interface
        interface_a: String,
        /// Second next-hop interface
        interface_b: String,
        /// Share of `interface_a`
        weight_a: u8,
        /// Share of `interface_b`
        weight_b: u8,
    },
}

impl RoutingMode {
    /// `single` / `balanced`
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingMode::Single { .. } => "single",
            RoutingMode::Balanced { .. } => "balanced",
        }
    }

    /// Primary interface; `None` when balanced
    pub fn primary(&self) -> Option<&str> {
        match self {
            RoutingMode::Single { interface } => Some(interface.as_str()),
            RoutingMode::Balanced { .. } => None,
        }
    }

    /// Interfaces that carry traffic under this mode
    pub fn interfaces(&self) -> Vec<&str> {
        match self {
            RoutingMode::Single { interface } => vec![interface.as_str()],
            RoutingMode::Balanced {
                interface_a,
                interface_b,
                ..
            } => vec![interface_a.as_str(), interface_b.as_str()],
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingMode::Single { interface } => write!(f, "single({})", interface),
            RoutingMode::Balanced {
                interface_a,
                interface_b,
                weight_a,
                weight_b,
            } => write!(
                f,
                "balanced({}:{}, {}:{})",
                interface_a, weight_a, interface_b, weight_b
            ),
        }
    }
}

/// Routing decision in force
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// How traffic is spread
    pub mode: RoutingMode,
    /// Last time the mode or primary changed
    pub effective_since: DateTime<Utc>,
}

impl RoutingDecision {
    /// Decision taking effect at `effective_since`
    pub fn new(mode: RoutingMode, effective_since: DateTime<Utc>) -> Self {
        Self {
            mode,
            effective_since,
        }
    }
}

/// Composite link quality in [0, 100]; latency weighted over loss
pub fn quality_score(health: &LinkHealth) -> f64 {
    if !health.online {
        return 0.0;
    }
    let latency_score = bounded(100.0 - health.latency_ms / 2.0);
    let loss_score = bounded(100.0 - health.packet_loss_pct * 2.0);
    LATENCY_WEIGHT * latency_score + LOSS_WEIGHT * loss_score
}

// NaN collapses to 0.
fn bounded(score: f64) -> f64 {
    score.max(0.0).min(100.0)
}

/// Compute the decision that should be in force
///
/// `wan1`/`wan2` are this cycle's measurements. Returns `prev` untouched
/// (same `effective_since`) when the outcome does not change the mode, and
/// when neither link is online.
pub fn decide(
    prev: Option<&RoutingDecision>,
    wan1: &LinkHealth,
    wan2: &LinkHealth,
    preferred: Option<Uplink>,
    now: DateTime<Utc>,
) -> Option<RoutingDecision> {
    let link = |uplink: Uplink| match uplink {
        Uplink::Wan1 => wan1,
        Uplink::Wan2 => wan2,
    };

    let overridden = preferred.map(link).filter(|h| h.online);

    let mode = match (overridden, wan1.online, wan2.online) {
        (Some(h), _, _) => RoutingMode::Single {
            interface: h.interface_name.clone(),
        },
        (None, false, false) => return prev.cloned(),
        (None, true, false) => RoutingMode::Single {
            interface: wan1.interface_name.clone(),
        },
        (None, false, true) => RoutingMode::Single {
            interface: wan2.interface_name.clone(),
        },
        (None, true, true) => RoutingMode::Balanced {
            interface_a: wan1.interface_name.clone(),
            interface_b: wan2.interface_name.clone(),
            weight_a: BALANCED_WEIGHT,
            weight_b: BALANCED_WEIGHT,
        },
    };

    match prev {
        Some(prev) if prev.mode == mode => Some(prev.clone()),
        _ => Some(RoutingDecision::new(mode, now)),
    }
}
