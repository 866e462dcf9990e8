//! Uplink Configuration

use crate::UplinkError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Where the binary looks for its configuration by default
pub const DEFAULT_CONFIG_PATH: &str = "/etc/opensase/uplink.json";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// Per-uplink routing tables when none are configured
pub const DEFAULT_ROUTING_TABLES: [u32; 2] = [101, 102];

/// unspec, default, main, local
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

/// Uplink controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// First WAN uplink
    pub wan1: WanConfig,
    /// Second WAN uplink
    pub wan2: WanConfig,
    /// Subscriber-facing LAN
    pub lan: LanConfig,
    /// Active probing
    pub probe: ProbeConfig,
    /// Online / degraded thresholds
    pub thresholds: ThresholdConfig,
    /// Seconds between control-loop iterations
    pub check_interval_secs: u64,
    /// Seconds to wait after a failed iteration
    pub error_backoff_secs: u64,
    /// Per-link history ring capacity
    pub history_size: usize,
    /// Deadline for each routing/firewall command
    pub command_timeout_secs: u64,
    /// TCP ports accepted on INPUT for management
    pub management_ports: Vec<u16>,
    /// Where the status snapshot is published
    pub status_path: String,
    /// Local control API
    pub api: ApiConfig,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            wan1: WanConfig::named("enx1"),
            wan2: WanConfig::named("enx2"),
            lan: LanConfig::default(),
            probe: ProbeConfig::default(),
            thresholds: ThresholdConfig::default(),
            check_interval_secs: 30,
            error_backoff_secs: 5,
            history_size: 10,
            command_timeout_secs: 10,
            management_ports: vec![22, 80, 443, 5000],
            status_path: "/var/lib/opensase/uplink-status.json".into(),
            api: ApiConfig::default(),
        }
    }
}

impl UplinkConfig {
    /// Load from file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UplinkError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| UplinkError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Parse from a JSON document and validate
    pub fn from_json(content: &str) -> Result<Self, UplinkError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| UplinkError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the control loop cannot run with
    pub fn validate(&self) -> Result<(), UplinkError> {
        for (role, name) in [
            ("wan1", &self.wan1.interface),
            ("wan2", &self.wan2.interface),
            ("lan", &self.lan.interface),
        ] {
            validate_ifname(role, name)?;
        }

        if self.wan1.interface == self.wan2.interface {
            return Err(UplinkError::Config(format!(
                "wan1 and wan2 must be different interfaces (both are {})",
                self.wan1.interface
            )));
        }
        if self.lan.interface == self.wan1.interface || self.lan.interface == self.wan2.interface {
            return Err(UplinkError::Config(format!(
                "lan interface {} is also configured as a WAN uplink",
                self.lan.interface
            )));
        }

        let tables = crate::Uplink::ALL.map(|u| self.routing_table(u));
        if let Some(reserved) = tables.iter().find(|t| RESERVED_TABLES.contains(*t)) {
            return Err(UplinkError::Config(format!(
                "routing table {} is reserved by the kernel",
                reserved
            )));
        }
        if tables[0] == tables[1] {
            return Err(UplinkError::Config(format!(
                "wan1 and wan2 must use different routing tables (both are {})",
                tables[0]
            )));
        }

        let distinct: HashSet<_> = self.probe.targets.iter().collect();
        if distinct.len() < 3 {
            return Err(UplinkError::Config(format!(
                "at least 3 distinct probe targets are required, got {}",
                distinct.len()
            )));
        }
        if self.probe.count == 0 {
            return Err(UplinkError::Config("probe.count must be at least 1".into()));
        }
        if self.probe.timeout_secs == 0 {
            return Err(UplinkError::Config("probe.timeout_secs must be positive".into()));
        }

        let t = &self.thresholds;
        if !(0.0..100.0).contains(&t.min_connectivity_score) {
            return Err(UplinkError::Config(format!(
                "thresholds.min_connectivity_score must be in [0, 100), got {}",
                t.min_connectivity_score
            )));
        }
        if !(t.max_latency_ms > 0.0) {
            return Err(UplinkError::Config("thresholds.max_latency_ms must be positive".into()));
        }
        if !(0.0..=100.0).contains(&t.max_packet_loss_pct) {
            return Err(UplinkError::Config(
                "thresholds.max_packet_loss_pct must be in [0, 100]".into(),
            ));
        }

        if self.check_interval_secs == 0 {
            return Err(UplinkError::Config("check_interval_secs must be positive".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(UplinkError::Config("command_timeout_secs must be positive".into()));
        }
        if self.history_size == 0 {
            return Err(UplinkError::Config("history_size must be at least 1".into()));
        }
        if self.status_path.trim().is_empty() {
            return Err(UplinkError::Config("status_path must not be empty".into()));
        }

        Ok(())
    }

    /// Configuration for one uplink
    pub fn wan(&self, uplink: crate::Uplink) -> &WanConfig {
        match uplink {
            crate::Uplink::Wan1 => &self.wan1,
            crate::Uplink::Wan2 => &self.wan2,
        }
    }

    /// Routing table holding this uplink's own default route
    pub fn routing_table(&self, uplink: crate::Uplink) -> u32 {
        let fallback = match uplink {
            crate::Uplink::Wan1 => DEFAULT_ROUTING_TABLES[0],
            crate::Uplink::Wan2 => DEFAULT_ROUTING_TABLES[1],
        };
        self.wan(uplink).table.unwrap_or(fallback)
    }

    /// Pause between iterations
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Penalty pause after a failed iteration
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Deadline for one external command
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn validate_ifname(role: &str, name: &str) -> Result<(), UplinkError> {
    if name.is_empty() {
        return Err(UplinkError::Config(format!("{} interface name is empty", role)));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(UplinkError::Config(format!(
            "{} interface name {:?} exceeds {} characters",
            role, name, MAX_IFNAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
        return Err(UplinkError::Config(format!(
            "{} interface name {:?} contains illegal characters",
            role, name
        )));
    }
    Ok(())
}

/// WAN uplink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    /// Kernel interface name
    pub interface: String,
    /// Static next-hop; discovered from the kernel when absent
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    /// Policy routing table; 101 for wan1 and 102 for wan2 when absent
    #[serde(default)]
    pub table: Option<u32>,
}

impl WanConfig {
    fn named(interface: &str) -> Self {
        Self {
            interface: interface.into(),
            gateway: None,
            table: None,
        }
    }
}

/// LAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanConfig {
    /// Kernel interface name
    pub interface: String,
    /// Subscriber address range, source of NAT
    pub subnet: IpNetwork,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".into(),
            subnet: IpNetwork::new(IpAddr::V4(Ipv4Addr::new(192, 168, 88, 0)), 24)
                .unwrap_or_else(|_| IpNetwork::from(IpAddr::V4(Ipv4Addr::new(192, 168, 88, 0)))),
        }
    }
}

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Hosts pinged through each uplink
    pub targets: Vec<IpAddr>,
    /// Echo requests per target
    pub count: u32,
    /// Per-reply wait handed to ping
    pub timeout_secs: u64,
    /// Extra time allowed for process startup/teardown
    pub grace_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(208, 67, 222, 222)),
            ],
            count: 3,
            timeout_secs: 5,
            grace_secs: 5,
        }
    }
}

impl ProbeConfig {
    /// Per-reply wait
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Slack on top of the ping deadline
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Link thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// A link is online when its connectivity score is strictly above this
    pub min_connectivity_score: f64,
    /// Above this a link is reported degraded
    pub max_latency_ms: f64,
    /// Above this a link is reported degraded
    pub max_packet_loss_pct: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_connectivity_score: 50.0,
            max_latency_ms: 200.0,
            max_packet_loss_pct: 30.0,
        }
    }
}

/// Local API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve the API at all
    pub enabled: bool,
    /// Bind address, loopback unless overridden
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = UplinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe.targets.len(), 3);
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.lan.subnet.to_string(), "192.168.88.0/24");
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = UplinkConfig::from_json(
            r#"{ "wan1": { "interface": "eth1", "gateway": "10.0.0.1" },
                 "wan2": { "interface": "eth2" },
                 "check_interval_secs": 15 }"#,
        )
        .unwrap();

        assert_eq!(config.wan1.interface, "eth1");
        assert_eq!(config.wan1.gateway, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(config.wan2.gateway, None);
        assert_eq!(config.check_interval_secs, 15);
        assert_eq!(config.probe.count, 3);
        assert_eq!(config.thresholds.min_connectivity_score, 50.0);
    }

    #[test]
    fn test_rejects_same_wan_interfaces() {
        let mut config = UplinkConfig::default();
        config.wan2.interface = config.wan1.interface.clone();
        assert!(matches!(config.validate(), Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_rejects_lan_as_wan() {
        let mut config = UplinkConfig::default();
        config.lan.interface = "enx2".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_few_targets() {
        let mut config = UplinkConfig::default();
        let first = config.probe.targets[0];
        config.probe.targets = vec![first, first, config.probe.targets[1]];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_interface_names() {
        let mut config = UplinkConfig::default();
        config.wan1.interface = "a-very-long-interface-name".into();
        assert!(config.validate().is_err());

        config.wan1.interface = "eth 1".into();
        assert!(config.validate().is_err());

        config.wan1.interface = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_routing_tables() {
        let config = UplinkConfig::from_json(r#"{ "wan2": { "interface": "enx2", "table": 202 } }"#).unwrap();
        assert_eq!(config.routing_table(crate::Uplink::Wan1), 101);
        assert_eq!(config.routing_table(crate::Uplink::Wan2), 202);

        let mut config = UplinkConfig::default();
        config.wan1.table = Some(102);
        assert!(config.validate().is_err());

        config.wan1.table = Some(254);
        assert!(matches!(config.validate(), Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = UplinkConfig::default();
        config.thresholds.min_connectivity_score = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "lan": {{ "interface": "br0", "subnet": "10.10.0.0/16" }} }}"#).unwrap();

        let config = UplinkConfig::load(file.path()).unwrap();
        assert_eq!(config.lan.interface, "br0");
        assert_eq!(config.lan.subnet.prefix(), 16);
    }

    #[test]
    fn test_load_garbage_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(UplinkConfig::load(file.path()), Err(UplinkError::Config(_))));
    }
}
