//! Route Programming
//!
//! Turns a [`RoutingDecision`] into kernel state. Everything here is
//! idempotent: routes are compared before they are rewritten, and every
//! netfilter rule is checked before it is added.
//!
//! The main table's default route is swapped with `ip route replace` and
//! only then are leftover defaults at other metrics pruned, so a failed
//! change never leaves the host without a default route. Each uplink also
//! keeps its own default route in a dedicated table, reached through an
//! `oif` policy rule, so traffic bound to a standby interface (`ping -I`)
//! still has a way out.

use crate::backend::{DefaultRoute, FilterRule, KernelBackend, NextHop, PolicyRule, Table, MAIN_TABLE};
use crate::config::UplinkConfig;
use crate::decision::{RoutingDecision, RoutingMode};
use crate::{Uplink, UplinkError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Upper bound on repeated deletes of one rule
const MAX_RULE_DUPLICATES: usize = 16;

/// Route programmer
pub struct RouteProgrammer {
    backend: Arc<dyn KernelBackend>,
    config: Arc<UplinkConfig>,
    /// Last gateway seen per interface
    learned_gateways: RwLock<HashMap<String, IpAddr>>,
}

impl RouteProgrammer {
    /// Programmer for the uplinks in `config`
    pub fn new(backend: Arc<dyn KernelBackend>, config: Arc<UplinkConfig>) -> Self {
        Self {
            backend,
            config,
            learned_gateways: RwLock::new(HashMap::new()),
        }
    }

    /// One-time setup: forwarding, NAT for both uplinks, baseline accept
    /// rules, per-uplink routing tables
    ///
    /// Every step is attempted; the first error is returned after the rest
    /// have run.
    pub async fn initialize(&self) -> Result<(), UplinkError> {
        tracing::info!("Initializing forwarding, NAT, firewall baseline and uplink tables");
        let mut first_error = None;

        if let Err(e) = self.backend.enable_forwarding().await {
            tracing::error!(error = %e, "enable forwarding failed");
            first_error.get_or_insert(e);
        }

        for rule in self.baseline_rules() {
            if let Err(e) = self.ensure_rule(&rule, false).await {
                tracing::error!(rule = %rule, error = %e, "baseline rule failed");
                first_error.get_or_insert(e);
            }
        }

        // Learn gateways while the DHCP-installed defaults are still present.
        self.learn_gateways().await;

        if let Err(e) = self.ensure_uplink_tables().await {
            tracing::error!(error = %e, "uplink tables incomplete");
            first_error.get_or_insert(e);
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Program the default route for a decision
    ///
    /// On error the main table still holds the routes it had before.
    pub async fn apply(&self, decision: &RoutingDecision) -> Result<(), UplinkError> {
        self.learn_gateways().await;
        let desired = self.desired_route(&decision.mode).await?;

        let current = self.backend.default_routes(MAIN_TABLE).await?;
        if current.len() == 1 && current[0].same_as(&desired) {
            tracing::debug!("Default route already {}", desired);
        } else {
            self.backend.replace_default_route(MAIN_TABLE, &desired).await?;
            // The new route has the lowest metric, so stale ones no longer carry traffic
            for stale in current.iter().filter(|r| r.metric != desired.metric) {
                if let Err(e) = self.backend.delete_default_route(MAIN_TABLE, stale).await {
                    tracing::warn!(route = %stale, error = %e, "stale default route left in place");
                }
            }
            tracing::info!("Routing set to {} ({})", decision.mode, desired);
        }

        if let Err(e) = self.ensure_uplink_tables().await {
            tracing::warn!(error = %e, "uplink tables not refreshed");
        }
        Ok(())
    }

    /// Drop all forwarded traffic from a client
    pub async fn block_client(&self, ip: IpAddr, mac: MacAddr) -> Result<(), UplinkError> {
        for rule in client_rules(ip, &mac) {
            self.ensure_rule(&rule, true).await?;
        }
        tracing::info!("Blocked client: IP {}, MAC {}", ip, mac);
        Ok(())
    }

    /// Remove exactly the rules [`Self::block_client`] adds
    pub async fn unblock_client(&self, ip: IpAddr, mac: MacAddr) -> Result<(), UplinkError> {
        for rule in client_rules(ip, &mac) {
            self.remove_rule(&rule).await?;
        }
        tracing::info!("Unblocked client: IP {}, MAC {}", ip, mac);
        Ok(())
    }

    /// Current kernel default routes
    pub async fn default_routes(&self) -> Result<Vec<DefaultRoute>, UplinkError> {
        self.backend.default_routes(MAIN_TABLE).await
    }

    /// Next-hop for an interface: static config, then the main table, then
    /// the uplink's own table, then memory
    pub async fn resolve_gateway(&self, interface: &str) -> Result<IpAddr, UplinkError> {
        let uplink = Uplink::ALL
            .into_iter()
            .find(|u| self.config.wan(*u).interface == interface);
        if let Some(gw) = uplink.and_then(|u| self.config.wan(u).gateway) {
            return Ok(gw);
        }

        let mut tables = vec![MAIN_TABLE];
        tables.extend(uplink.map(|u| self.config.routing_table(u)));
        for table in tables {
            match self.backend.default_routes(table).await {
                Ok(routes) => {
                    let found = routes
                        .iter()
                        .flat_map(|r| r.nexthops.iter())
                        .find(|h| h.interface == interface)
                        .map(|h| h.gateway);
                    if let Some(gw) = found {
                        self.learned_gateways.write().insert(interface.to_string(), gw);
                        return Ok(gw);
                    }
                }
                Err(e) => tracing::warn!(interface, table, error = %e, "gateway lookup failed"),
            }
        }

        self.learned_gateways
            .read()
            .get(interface)
            .copied()
            .ok_or_else(|| UplinkError::GatewayNotFound {
                interface: interface.to_string(),
            })
    }

    /// Refresh the gateway cache for both uplinks, whatever the decision
    async fn learn_gateways(&self) {
        for uplink in Uplink::ALL {
            let interface = &self.config.wan(uplink).interface;
            match self.resolve_gateway(interface).await {
                Ok(gw) => tracing::debug!("Gateway for {} is {}", interface, gw),
                Err(e) => tracing::warn!(%uplink, %interface, error = %e, "gateway not known"),
            }
        }
    }

    /// Give each uplink with a known gateway its own table and `oif` rule
    ///
    /// Every uplink is attempted; the first error is returned.
    async fn ensure_uplink_tables(&self) -> Result<(), UplinkError> {
        let mut first_error = None;
        let installed = match self.backend.policy_rules().await {
            Ok(rules) => Some(rules),
            Err(e) => {
                first_error.get_or_insert(e);
                None
            }
        };

        for uplink in Uplink::ALL {
            let interface = &self.config.wan(uplink).interface;
            let table = self.config.routing_table(uplink);

            let gateway = self
                .config
                .wan(uplink)
                .gateway
                .or_else(|| self.learned_gateways.read().get(interface).copied());
            if let Some(gateway) = gateway {
                let route = DefaultRoute::new(vec![NextHop {
                    gateway,
                    interface: interface.clone(),
                    weight: 1,
                }]);
                if let Err(e) = self.ensure_table_route(table, &route).await {
                    tracing::error!(%uplink, table, error = %e, "uplink table route failed");
                    first_error.get_or_insert(e);
                }
            }

            let rule = PolicyRule {
                interface: interface.clone(),
                table,
            };
            if let Some(installed) = &installed {
                if !installed.contains(&rule) {
                    match self.backend.add_policy_rule(&rule).await {
                        Ok(()) => tracing::info!("Policy rule added: {}", rule),
                        Err(e) => {
                            tracing::error!(rule = %rule, error = %e, "policy rule failed");
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn ensure_table_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
        let current = self.backend.default_routes(table).await?;
        if current.len() == 1 && current[0].same_as(route) {
            return Ok(());
        }
        self.backend.replace_default_route(table, route).await?;
        for stale in current.iter().filter(|r| r.metric != route.metric) {
            self.backend.delete_default_route(table, stale).await?;
        }
        tracing::info!("Table {} default set to {}", table, route);
        Ok(())
    }

    async fn desired_route(&self, mode: &RoutingMode) -> Result<DefaultRoute, UplinkError> {
        let nexthops = match mode {
            RoutingMode::Single { interface } => vec![NextHop {
                gateway: self.resolve_gateway(interface).await?,
                interface: interface.clone(),
                weight: 1,
            }],
            RoutingMode::Balanced {
                interface_a,
                interface_b,
                weight_a,
                weight_b,
            } => vec![
                NextHop {
                    gateway: self.resolve_gateway(interface_a).await?,
                    interface: interface_a.clone(),
                    weight: *weight_a,
                },
                NextHop {
                    gateway: self.resolve_gateway(interface_b).await?,
                    interface: interface_b.clone(),
                    weight: *weight_b,
                },
            ],
        };
        Ok(DefaultRoute::new(nexthops))
    }

    fn baseline_rules(&self) -> Vec<FilterRule> {
        let lan = self.config.lan.interface.as_str();
        let subnet = self.config.lan.subnet.to_string();
        let wans = [self.config.wan1.interface.as_str(), self.config.wan2.interface.as_str()];

        let mut rules = Vec::new();
        for wan in wans {
            rules.push(FilterRule::new(
                Table::Nat,
                "POSTROUTING",
                &["-s", &subnet, "-o", wan, "-j", "MASQUERADE"],
            ));
        }
        rules.push(FilterRule::new(
            Table::Filter,
            "FORWARD",
            &["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        ));
        for wan in wans {
            rules.push(FilterRule::new(Table::Filter, "FORWARD", &["-i", lan, "-o", wan, "-j", "ACCEPT"]));
        }
        for port in &self.config.management_ports {
            let port = port.to_string();
            rules.push(FilterRule::new(
                Table::Filter,
                "INPUT",
                &["-p", "tcp", "--dport", &port, "-j", "ACCEPT"],
            ));
        }
        rules.push(FilterRule::new(Table::Filter, "INPUT", &["-i", "lo", "-j", "ACCEPT"]));
        rules.push(FilterRule::new(Table::Filter, "INPUT", &["-i", lan, "-j", "ACCEPT"]));
        rules
    }

    async fn ensure_rule(&self, rule: &FilterRule, at_head: bool) -> Result<(), UplinkError> {
        if self.backend.rule_exists(rule).await? {
            return Ok(());
        }
        if at_head {
            self.backend.insert_rule(rule).await
        } else {
            self.backend.append_rule(rule).await
        }
    }

    async fn remove_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
        for _ in 0..MAX_RULE_DUPLICATES {
            if !self.backend.rule_exists(rule).await? {
                return Ok(());
            }
            self.backend.delete_rule(rule).await?;
        }
        tracing::warn!(rule = %rule, "rule still present after {} deletes", MAX_RULE_DUPLICATES);
        Ok(())
    }
}

fn client_rules(ip: IpAddr, mac: &MacAddr) -> [FilterRule; 2] {
    let ip = ip.to_string();
    let mac = mac.to_string();
    [
        FilterRule::new(Table::Filter, "FORWARD", &["-s", &ip, "-j", "DROP"]),
        FilterRule::new(Table::Filter, "FORWARD", &["-m", "mac", "--mac-source", &mac, "-j", "DROP"]),
    ]
}

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Raw bytes
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = UplinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UplinkError::InvalidClient(format!("invalid MAC address {:?}", s));
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::FakeKernel;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn hop(gw: &str, dev: &str) -> NextHop {
        NextHop {
            gateway: gw.parse().unwrap(),
            interface: dev.into(),
            weight: 1,
        }
    }

    /// Kernel as left by DHCP on both uplinks
    fn dhcp_routes() -> Vec<DefaultRoute> {
        vec![
            DefaultRoute::new(vec![hop("192.168.1.1", "enx1")]).with_metric(100),
            DefaultRoute::new(vec![hop("10.0.0.1", "enx2")]).with_metric(200),
        ]
    }

    fn dhcp_kernel() -> Arc<FakeKernel> {
        Arc::new(FakeKernel::with_routes(dhcp_routes()))
    }

    fn programmer(kernel: Arc<FakeKernel>) -> RouteProgrammer {
        RouteProgrammer::new(kernel, Arc::new(UplinkConfig::default()))
    }

    fn single(name: &str) -> RoutingDecision {
        RoutingDecision::new(RoutingMode::Single { interface: name.into() }, Utc::now())
    }

    fn balanced() -> RoutingDecision {
        RoutingDecision::new(
            RoutingMode::Balanced {
                interface_a: "enx1".into(),
                interface_b: "enx2".into(),
                weight_a: 1,
                weight_b: 1,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_single_replaces_all_defaults() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&single("enx2")).await);

        let routes = kernel.routes.lock().clone();
        assert_eq!(routes, vec![DefaultRoute::new(vec![hop("10.0.0.1", "enx2")])]);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_routes() {
        let kernel = dhcp_kernel();
        kernel.fail_on("replace");
        let programmer = programmer(kernel.clone());

        let err = assert_err!(programmer.apply(&single("enx2")).await);
        assert!(matches!(err, UplinkError::Apply { .. }));
        assert_eq!(*kernel.routes.lock(), dhcp_routes());

        let err = assert_err!(programmer.apply(&balanced()).await);
        assert!(matches!(err, UplinkError::Apply { .. }));
        assert_eq!(*kernel.routes.lock(), dhcp_routes());
    }

    #[tokio::test]
    async fn test_failed_prune_still_switches() {
        let kernel = dhcp_kernel();
        kernel.fail_on("delete-route");
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&single("enx2")).await);
        {
            let routes = kernel.routes.lock();
            assert_eq!(routes.len(), 3);
            // Metric 0 outranks what DHCP left behind
            let best = routes.iter().min_by_key(|r| r.metric).unwrap();
            assert_eq!(best.nexthops, vec![hop("10.0.0.1", "enx2")]);
        }

        kernel.heal();
        assert_ok!(programmer.apply(&single("enx2")).await);
        assert_eq!(*kernel.routes.lock(), vec![DefaultRoute::new(vec![hop("10.0.0.1", "enx2")])]);
    }

    #[tokio::test]
    async fn test_balanced_installs_one_multipath_route() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&balanced()).await);

        let routes = kernel.routes.lock().clone();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].nexthops, vec![hop("192.168.1.1", "enx1"), hop("10.0.0.1", "enx2")]);
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&balanced()).await);
        let after_first = kernel.routes.lock().clone();
        let writes = *kernel.writes.lock();

        assert_ok!(programmer.apply(&balanced()).await);
        assert_eq!(*kernel.routes.lock(), after_first);
        assert_eq!(*kernel.writes.lock(), writes);
    }

    #[tokio::test]
    async fn test_gateways_survive_route_changes() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&balanced()).await);
        // Only enx1's default remains in the main table after this
        assert_ok!(programmer.apply(&single("enx1")).await);
        assert_eq!(kernel.routes.lock().len(), 1);

        assert_ok!(programmer.apply(&balanced()).await);
        assert_eq!(kernel.routes.lock()[0].nexthops.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_finds_standby_gateway_in_its_table() {
        let kernel = dhcp_kernel();
        assert_ok!(programmer(kernel.clone()).apply(&single("enx1")).await);

        // Fresh process: enx2 has no default in the main table any more
        let restarted = programmer(kernel.clone());
        assert_ok!(restarted.apply(&single("enx2")).await);
        assert_eq!(kernel.routes.lock()[0].nexthops, vec![hop("10.0.0.1", "enx2")]);
    }

    #[tokio::test]
    async fn test_standby_uplink_keeps_own_table() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&single("enx1")).await);

        // Main table no longer mentions enx2, yet traffic bound to it has a route
        assert!(kernel.routes.lock().iter().all(|r| r.nexthops.iter().all(|h| h.interface == "enx1")));
        assert_eq!(kernel.table(102), vec![DefaultRoute::new(vec![hop("10.0.0.1", "enx2")])]);
        assert_eq!(kernel.table(101), vec![DefaultRoute::new(vec![hop("192.168.1.1", "enx1")])]);
        assert_eq!(
            *kernel.policy.lock(),
            vec![
                PolicyRule { interface: "enx1".into(), table: 101 },
                PolicyRule { interface: "enx2".into(), table: 102 },
            ]
        );

        // Nothing is added twice
        assert_ok!(programmer.apply(&balanced()).await);
        assert_ok!(programmer.apply(&single("enx2")).await);
        assert_eq!(kernel.policy.lock().len(), 2);
        assert_eq!(kernel.table(102).len(), 1);
    }

    #[tokio::test]
    async fn test_uplink_table_failure_does_not_fail_apply() {
        let kernel = dhcp_kernel();
        kernel.fail_on("rule-add");
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.apply(&single("enx1")).await);
        assert!(kernel.policy.lock().is_empty());

        kernel.heal();
        assert_ok!(programmer.apply(&single("enx1")).await);
        assert_eq!(kernel.policy.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_learns_gateways_before_any_change() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());
        assert_ok!(programmer.initialize().await);

        assert_ok!(programmer.apply(&single("enx1")).await);
        assert_ok!(programmer.apply(&single("enx2")).await);
        assert_eq!(kernel.routes.lock()[0].nexthops, vec![hop("10.0.0.1", "enx2")]);
    }

    #[tokio::test]
    async fn test_missing_gateway_leaves_routes_untouched() {
        let kernel = Arc::new(FakeKernel::with_routes(vec![DefaultRoute::new(vec![hop("192.168.1.1", "enx1")])]));
        let programmer = programmer(kernel.clone());

        let err = programmer.apply(&balanced()).await.unwrap_err();
        assert!(matches!(err, UplinkError::GatewayNotFound { ref interface } if interface == "enx2"));
        assert_eq!(kernel.routes.lock().len(), 1);
        assert_eq!(*kernel.writes.lock(), 0);
    }

    #[tokio::test]
    async fn test_static_gateway_wins() {
        let kernel = Arc::new(FakeKernel::default());
        let mut config = UplinkConfig::default();
        config.wan2.gateway = Some("172.16.0.1".parse().unwrap());
        let programmer = RouteProgrammer::new(kernel.clone(), Arc::new(config));

        assert_ok!(programmer.apply(&single("enx2")).await);
        assert_eq!(kernel.routes.lock()[0].nexthops, vec![hop("172.16.0.1", "enx2")]);
    }

    #[tokio::test]
    async fn test_command_failure_is_apply_error() {
        let kernel = dhcp_kernel();
        kernel.fail_on("replace");
        let programmer = programmer(kernel.clone());

        let err = assert_err!(programmer.apply(&single("enx1")).await);
        assert!(matches!(err, UplinkError::Apply { .. }));

        kernel.heal();
        assert_ok!(programmer.apply(&single("enx1")).await);
        assert_eq!(kernel.routes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());

        assert_ok!(programmer.initialize().await);
        let rules = kernel.rules.lock().clone();
        assert!(*kernel.forwarding.lock());
        // 2 NAT + established + 2 LAN->WAN + 4 ports + lo + LAN input
        assert_eq!(rules.len(), 11);
        assert!(rules.iter().any(|r| r.table == Table::Nat && r.spec.contains(&"enx2".to_string())));

        assert_eq!(kernel.policy.lock().len(), 2);
        assert_eq!(kernel.table(101).len(), 1);
        assert_eq!(kernel.table(102).len(), 1);

        assert_ok!(programmer.initialize().await);
        assert_eq!(*kernel.rules.lock(), rules);
        assert_eq!(kernel.policy.lock().len(), 2);
        // Main table is left to the first decision
        assert_eq!(*kernel.routes.lock(), dhcp_routes());
    }

    #[tokio::test]
    async fn test_initialize_continues_past_failures() {
        let kernel = dhcp_kernel();
        kernel.fail_on("sysctl");
        let programmer = programmer(kernel.clone());

        assert_err!(programmer.initialize().await);
        assert_eq!(kernel.rules.lock().len(), 11);
    }

    #[tokio::test]
    async fn test_block_unblock_symmetric() {
        let kernel = dhcp_kernel();
        let programmer = programmer(kernel.clone());
        assert_ok!(programmer.initialize().await);
        let baseline = kernel.rules.lock().clone();

        let ip: IpAddr = "192.168.88.23".parse().unwrap();
        let mac: MacAddr = "AA:BB:CC:00:11:22".parse().unwrap();

        assert_ok!(programmer.block_client(ip, mac).await);
        assert_ok!(programmer.block_client(ip, mac).await);
        {
            let rules = kernel.rules.lock();
            assert_eq!(rules.len(), baseline.len() + 2);
            // Drops sit ahead of the LAN->WAN accepts
            assert!(rules[..2].iter().all(|r| r.spec.last().map(String::as_str) == Some("DROP")));
        }

        assert_ok!(programmer.unblock_client(ip, mac).await);
        assert_eq!(*kernel.rules.lock(), baseline);
    }

    #[tokio::test]
    async fn test_unblock_removes_duplicates() {
        let kernel = Arc::new(FakeKernel::default());
        let programmer = programmer(kernel.clone());
        let ip: IpAddr = "192.168.88.5".parse().unwrap();
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        for rule in client_rules(ip, &mac) {
            kernel.rules.lock().push(rule.clone());
            kernel.rules.lock().push(rule);
        }
        assert_ok!(programmer.unblock_client(ip, mac).await);
        assert!(kernel.rules.lock().is_empty());
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddr = "AA-bb-cc-00-11-22".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
        assert_eq!(mac.octets()[0], 0xaa);

        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aaa:bb:cc:dd:ee:f".parse::<MacAddr>().is_err());
    }
}
