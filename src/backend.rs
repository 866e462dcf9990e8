//! Kernel Network Configuration
//!
//! The route programmer talks to the kernel only through [`KernelBackend`].
//! [`CommandBackend`] drives the standard iproute2 / iptables / sysctl tools;
//! any other mechanism (netlink, nftables) can be slotted in behind the
//! same trait.

use crate::exec::{CommandError, CommandRunner};
use crate::UplinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// The kernel's main routing table
pub const MAIN_TABLE: u32 = 254;

/// One next-hop of a default route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHop {
    /// Next-hop router
    pub gateway: IpAddr,
    /// Outgoing interface
    pub interface: String,
    /// Multipath share
    pub weight: u8,
}

/// A default route: one next-hop, or a multipath set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRoute {
    /// Next-hops; more than one makes a multipath route
    pub nexthops: Vec<NextHop>,
    /// Route priority, lower wins
    #[serde(default)]
    pub metric: u32,
}

impl DefaultRoute {
    /// Route at metric 0
    pub fn new(nexthops: Vec<NextHop>) -> Self {
        Self { nexthops, metric: 0 }
    }

    /// The same route at another metric
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    /// `ip route` arguments after the verb
    fn to_args(&self) -> Vec<String> {
        let mut args = vec!["default".to_string()];
        match self.nexthops.as_slice() {
            [hop] => {
                args.extend(["via".into(), hop.gateway.to_string(), "dev".into(), hop.interface.clone()]);
            }
            hops => {
                for hop in hops {
                    args.extend([
                        "nexthop".into(),
                        "via".into(),
                        hop.gateway.to_string(),
                        "dev".into(),
                        hop.interface.clone(),
                        "weight".into(),
                        hop.weight.to_string(),
                    ]);
                }
            }
        }
        // Metric 0 is the kernel default, and on delete it would match any metric
        if self.metric > 0 {
            args.extend(["metric".into(), self.metric.to_string()]);
        }
        args
    }

    /// Same metric and next-hops in any order; a single next-hop's weight is ignored
    pub fn same_as(&self, other: &DefaultRoute) -> bool {
        if self.metric != other.metric || self.nexthops.len() != other.nexthops.len() {
            return false;
        }
        let single = self.nexthops.len() == 1;
        self.nexthops.iter().all(|a| {
            other.nexthops.iter().any(|b| {
                a.gateway == b.gateway && a.interface == b.interface && (single || a.weight == b.weight)
            })
        })
    }
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<String> = self
            .nexthops
            .iter()
            .map(|h| format!("{} dev {} weight {}", h.gateway, h.interface, h.weight))
            .collect();
        write!(f, "default via [{}]", hops.join(", "))?;
        if self.metric > 0 {
            write!(f, " metric {}", self.metric)?;
        }
        Ok(())
    }
}

/// Policy rule sending traffic bound to an interface to that uplink's table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Output interface matched (`oif`)
    pub interface: String,
    /// Table looked up on a match
    pub table: u32,
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oif {} lookup {}", self.interface, self.table)
    }
}

/// Netfilter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// Packet filtering
    Filter,
    /// Address translation
    Nat,
}

impl Table {
    fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// A netfilter rule: table, chain and match/target specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterRule {
    /// Table the chain lives in
    pub table: Table,
    /// Chain name
    pub chain: String,
    /// Match and target arguments
    pub spec: Vec<String>,
}

impl FilterRule {
    /// Rule from borrowed arguments
    pub fn new(table: Table, chain: &str, spec: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.to_string(),
            self.chain.clone(),
        ];
        if op == "-I" {
            args.push("1".into());
        }
        args.extend(self.spec.iter().cloned());
        args
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table.as_str(), self.chain, self.spec.join(" "))
    }
}

/// Kernel routing / forwarding / netfilter capability
#[async_trait]
pub trait KernelBackend: Send + Sync {
    /// IPv4 default routes in a routing table
    async fn default_routes(&self, table: u32) -> Result<Vec<DefaultRoute>, UplinkError>;

    /// Install a default route, atomically replacing any at the same metric
    async fn replace_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError>;

    /// Remove one default route
    async fn delete_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError>;

    /// Output-interface policy rules currently installed
    async fn policy_rules(&self) -> Result<Vec<PolicyRule>, UplinkError>;

    /// Add a policy rule
    async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<(), UplinkError>;

    /// Turn on IPv4 forwarding
    async fn enable_forwarding(&self) -> Result<(), UplinkError>;

    /// Whether an identical rule is present
    async fn rule_exists(&self, rule: &FilterRule) -> Result<bool, UplinkError>;

    /// Append at the tail of the chain
    async fn append_rule(&self, rule: &FilterRule) -> Result<(), UplinkError>;

    /// Insert at the head of the chain
    async fn insert_rule(&self, rule: &FilterRule) -> Result<(), UplinkError>;

    /// Delete one matching rule
    async fn delete_rule(&self, rule: &FilterRule) -> Result<(), UplinkError>;
}

/// Backend shelling out to `ip`, `iptables` and `sysctl`
#[derive(Debug, Clone)]
pub struct CommandBackend {
    runner: CommandRunner,
}

impl CommandBackend {
    /// Backend running every command through `runner`
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    async fn route(&self, operation: &str, verb: &str, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
        let mut args = vec!["-4".to_string(), "route".into(), verb.into()];
        args.extend(route.to_args());
        args.extend(["table".into(), table.to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ip(operation, &args).await.map(|_| ())
    }

    async fn ip(&self, operation: &str, args: &[&str]) -> Result<String, UplinkError> {
        self.runner
            .run("ip", args)
            .await
            .map_err(|e| UplinkError::apply(operation, e))
    }

    async fn iptables(&self, operation: &str, args: Vec<String>) -> Result<String, UplinkError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run("iptables", &args)
            .await
            .map_err(|e| UplinkError::apply(operation, e))
    }
}

#[async_trait]
impl KernelBackend for CommandBackend {
    async fn default_routes(&self, table: u32) -> Result<Vec<DefaultRoute>, UplinkError> {
        let table = table.to_string();
        let args = ["-4", "route", "show", "default", "table", table.as_str()];
        match self.runner.output("ip", &args).await {
            Ok(out) if out.success => Ok(parse_default_routes(&out.stdout)),
            // Newer kernels refuse to dump a table that was never populated
            Ok(out) if out.stderr.contains("table does not exist") => Ok(Vec::new()),
            Ok(out) => Err(UplinkError::apply(
                "show default routes",
                CommandError::Failed {
                    command: format!("ip {}", args.join(" ")),
                    status: format!("{:?}", out.code),
                    stderr: out.stderr,
                },
            )),
            Err(e) => Err(UplinkError::apply("show default routes", e)),
        }
    }

    async fn replace_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
        self.route("replace default route", "replace", table, route).await
    }

    async fn delete_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
        self.route("delete default route", "del", table, route).await
    }

    async fn policy_rules(&self) -> Result<Vec<PolicyRule>, UplinkError> {
        let out = self.ip("show policy rules", &["-4", "rule", "show"]).await?;
        Ok(parse_policy_rules(&out))
    }

    async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<(), UplinkError> {
        let table = rule.table.to_string();
        self.ip(
            "add policy rule",
            &["-4", "rule", "add", "oif", rule.interface.as_str(), "lookup", table.as_str()],
        )
        .await
        .map(|_| ())
    }

    async fn enable_forwarding(&self) -> Result<(), UplinkError> {
        for key in ["net.ipv4.ip_forward=1", "net.ipv4.conf.all.forwarding=1"] {
            self.runner
                .run("sysctl", &["-w", key])
                .await
                .map_err(|e| UplinkError::apply("enable forwarding", e))?;
        }
        Ok(())
    }

    async fn rule_exists(&self, rule: &FilterRule) -> Result<bool, UplinkError> {
        let args = rule.args("-C");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.runner.output("iptables", &args).await {
            // iptables -C: 0 = present, 1 = absent, anything else is a real error
            Ok(out) if out.success => Ok(true),
            Ok(out) if out.code == Some(1) => Ok(false),
            Ok(out) => Err(UplinkError::apply(
                "check rule",
                CommandError::Failed {
                    command: format!("iptables {}", args.join(" ")),
                    status: format!("{:?}", out.code),
                    stderr: out.stderr,
                },
            )),
            Err(e) => Err(UplinkError::apply("check rule", e)),
        }
    }

    async fn append_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
        self.iptables("append rule", rule.args("-A")).await.map(|_| ())
    }

    async fn insert_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
        self.iptables("insert rule", rule.args("-I")).await.map(|_| ())
    }

    async fn delete_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
        self.iptables("delete rule", rule.args("-D")).await.map(|_| ())
    }
}

/// Parse `ip -4 route show default`
///
/// Handles single-path lines (`default via G dev X ...`) and multipath
/// blocks (`default ...` followed by indented `nexthop via G dev X weight W`).
pub fn parse_default_routes(output: &str) -> Vec<DefaultRoute> {
    let mut routes: Vec<DefaultRoute> = Vec::new();

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            continue;
        };

        match first {
            "default" => {
                let nexthops = parse_hop(&tokens).into_iter().collect();
                let metric = token_after(&tokens, "metric").and_then(|m| m.parse().ok()).unwrap_or(0);
                routes.push(DefaultRoute { nexthops, metric });
            }
            "nexthop" => {
                if let (Some(route), Some(hop)) = (routes.last_mut(), parse_hop(&tokens)) {
                    route.nexthops.push(hop);
                }
            }
            _ => {}
        }
    }

    routes.retain(|r| !r.nexthops.is_empty());
    routes
}

/// Parse `ip -4 rule show`, keeping `oif` rules that look up a numbered table
///
/// Lines look like `32765:\tfrom all oif enx2 lookup 102`.
pub fn parse_policy_rules(output: &str) -> Vec<PolicyRule> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let interface = token_after(&tokens, "oif")?.to_string();
            let table = token_after(&tokens, "lookup")?.parse().ok()?;
            Some(PolicyRule { interface, table })
        })
        .collect()
}

fn token_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

fn parse_hop(tokens: &[&str]) -> Option<NextHop> {
    let gateway = token_after(tokens, "via")?.parse().ok()?;
    let interface = token_after(tokens, "dev")?.to_string();
    let weight = token_after(tokens, "weight").and_then(|w| w.parse().ok()).unwrap_or(1);
    Some(NextHop {
        gateway,
        interface,
        weight,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// In-memory kernel: routing tables, policy rules and netfilter rules
    #[derive(Default)]
    pub(crate) struct FakeKernel {
        /// Main table
        pub(crate) routes: Mutex<Vec<DefaultRoute>>,
        /// Every other table
        pub(crate) tables: Mutex<HashMap<u32, Vec<DefaultRoute>>>,
        pub(crate) policy: Mutex<Vec<PolicyRule>>,
        pub(crate) rules: Mutex<Vec<FilterRule>>,
        pub(crate) forwarding: Mutex<bool>,
        pub(crate) writes: Mutex<usize>,
        pub(crate) fail: Mutex<HashSet<&'static str>>,
    }

    impl FakeKernel {
        pub(crate) fn with_routes(routes: Vec<DefaultRoute>) -> Self {
            let kernel = Self::default();
            *kernel.routes.lock() = routes;
            kernel
        }

        pub(crate) fn table(&self, table: u32) -> Vec<DefaultRoute> {
            self.with_table(table, |routes| routes.clone())
        }

        fn with_table<R>(&self, table: u32, f: impl FnOnce(&mut Vec<DefaultRoute>) -> R) -> R {
            if table == MAIN_TABLE {
                f(&mut *self.routes.lock())
            } else {
                f(self.tables.lock().entry(table).or_default())
            }
        }

        pub(crate) fn fail_on(&self, op: &'static str) {
            self.fail.lock().insert(op);
        }

        pub(crate) fn heal(&self) {
            self.fail.lock().clear();
        }

        fn check(&self, op: &'static str) -> Result<(), UplinkError> {
            if self.fail.lock().contains(op) {
                return Err(UplinkError::apply(
                    op,
                    CommandError::Failed {
                        command: op.into(),
                        status: "status 2".into(),
                        stderr: "RTNETLINK answers: injected".into(),
                    },
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KernelBackend for FakeKernel {
        async fn default_routes(&self, table: u32) -> Result<Vec<DefaultRoute>, UplinkError> {
            self.check("show")?;
            Ok(self.table(table))
        }

        async fn replace_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
            self.check("replace")?;
            *self.writes.lock() += 1;
            self.with_table(table, |routes| {
                // One IPv4 default route per metric
                routes.retain(|r| r.metric != route.metric);
                routes.push(route.clone());
            });
            Ok(())
        }

        async fn delete_default_route(&self, table: u32, route: &DefaultRoute) -> Result<(), UplinkError> {
            self.check("delete-route")?;
            *self.writes.lock() += 1;
            self.with_table(table, |routes| {
                if let Some(pos) = routes.iter().position(|r| r.same_as(route)) {
                    routes.remove(pos);
                }
            });
            Ok(())
        }

        async fn policy_rules(&self) -> Result<Vec<PolicyRule>, UplinkError> {
            self.check("rule-show")?;
            Ok(self.policy.lock().clone())
        }

        async fn add_policy_rule(&self, rule: &PolicyRule) -> Result<(), UplinkError> {
            self.check("rule-add")?;
            self.policy.lock().push(rule.clone());
            Ok(())
        }

        async fn enable_forwarding(&self) -> Result<(), UplinkError> {
            self.check("sysctl")?;
            *self.forwarding.lock() = true;
            Ok(())
        }

        async fn rule_exists(&self, rule: &FilterRule) -> Result<bool, UplinkError> {
            self.check("check")?;
            Ok(self.rules.lock().contains(rule))
        }

        async fn append_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
            self.check("append")?;
            self.rules.lock().push(rule.clone());
            Ok(())
        }

        async fn insert_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
            self.check("insert")?;
            self.rules.lock().insert(0, rule.clone());
            Ok(())
        }

        async fn delete_rule(&self, rule: &FilterRule) -> Result<(), UplinkError> {
            self.check("delete")?;
            let mut rules = self.rules.lock();
            if let Some(pos) = rules.iter().position(|r| r == rule) {
                rules.remove(pos);
            }
            Ok(())
        }
    }

    #[test]
    fn test_parse_single_default() {
        let routes = parse_default_routes("default via 192.168.1.1 dev enx1 proto dhcp src 192.168.1.20 metric 100\n");
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0].nexthops,
            vec![NextHop {
                gateway: "192.168.1.1".parse().unwrap(),
                interface: "enx1".into(),
                weight: 1,
            }]
        );
    }

    #[test]
    fn test_parse_multipath_default() {
        let out = "default proto static metric 1024 \n\
                   \tnexthop via 192.168.1.1 dev enx1 weight 1 \n\
                   \tnexthop via 10.0.0.1 dev enx2 weight 1 \n";
        let routes = parse_default_routes(out);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].nexthops.len(), 2);
        assert_eq!(routes[0].nexthops[1].interface, "enx2");
        assert_eq!(routes[0].nexthops[1].gateway, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_multiple_defaults_and_noise() {
        let out = "default via 192.168.1.1 dev enx1 metric 100\n\
                   default via 10.0.0.1 dev enx2 metric 200\n\
                   default dev ppp0 scope link\n";
        let routes = parse_default_routes(out);
        assert_eq!(routes.len(), 2);
        assert!(parse_default_routes("").is_empty());
    }

    #[test]
    fn test_route_args() {
        let single = DefaultRoute::new(vec![NextHop {
            gateway: "192.168.1.1".parse().unwrap(),
            interface: "enx1".into(),
            weight: 1,
        }]);
        assert_eq!(single.to_args().join(" "), "default via 192.168.1.1 dev enx1");
        assert_eq!(
            single.with_metric(100).to_args().join(" "),
            "default via 192.168.1.1 dev enx1 metric 100"
        );

        let multi = DefaultRoute::new(vec![
            NextHop { gateway: "192.168.1.1".parse().unwrap(), interface: "enx1".into(), weight: 1 },
            NextHop { gateway: "10.0.0.1".parse().unwrap(), interface: "enx2".into(), weight: 1 },
        ]);
        assert_eq!(
            multi.to_args().join(" "),
            "default nexthop via 192.168.1.1 dev enx1 weight 1 nexthop via 10.0.0.1 dev enx2 weight 1"
        );
    }

    #[test]
    fn test_same_as_ignores_order() {
        let a = NextHop { gateway: "192.168.1.1".parse().unwrap(), interface: "enx1".into(), weight: 1 };
        let b = NextHop { gateway: "10.0.0.1".parse().unwrap(), interface: "enx2".into(), weight: 1 };
        let r1 = DefaultRoute::new(vec![a.clone(), b.clone()]);
        let r2 = DefaultRoute::new(vec![b, a.clone()]);
        assert!(r1.same_as(&r2));
        assert!(!r1.same_as(&DefaultRoute::new(vec![a.clone()])));
        assert!(!r1.same_as(&r2.with_metric(100)));
    }

    #[test]
    fn test_parse_metrics() {
        let routes = parse_default_routes(
            "default via 192.168.1.1 dev enx1 proto dhcp metric 100\n\
             default via 10.0.0.1 dev enx2\n",
        );
        assert_eq!(routes[0].metric, 100);
        assert_eq!(routes[1].metric, 0);
    }

    #[test]
    fn test_parse_policy_rules() {
        let out = "0:\tfrom all lookup local\n\
                   32764:\tfrom all oif enx2 lookup 102\n\
                   32765:\tfrom all oif enx1 lookup 101\n\
                   32766:\tfrom all lookup main\n\
                   32767:\tfrom all lookup default\n";
        assert_eq!(
            parse_policy_rules(out),
            vec![
                PolicyRule { interface: "enx2".into(), table: 102 },
                PolicyRule { interface: "enx1".into(), table: 101 },
            ]
        );
    }

    #[tokio::test]
    async fn test_fake_replace_keeps_other_metrics() {
        let hop = |gw: &str, dev: &str| NextHop { gateway: gw.parse().unwrap(), interface: dev.into(), weight: 1 };
        let dhcp = DefaultRoute::new(vec![hop("192.168.1.1", "enx1")]).with_metric(100);
        let kernel = FakeKernel::with_routes(vec![dhcp.clone()]);

        let ours = DefaultRoute::new(vec![hop("10.0.0.1", "enx2")]);
        kernel.replace_default_route(MAIN_TABLE, &ours).await.unwrap();
        assert_eq!(kernel.default_routes(MAIN_TABLE).await.unwrap(), vec![dhcp, ours.clone()]);

        kernel.replace_default_route(101, &ours).await.unwrap();
        assert_eq!(kernel.table(101), vec![ours]);
    }

    #[test]
    fn test_rule_args() {
        let rule = FilterRule::new(Table::Filter, "FORWARD", &["-s", "192.168.88.20", "-j", "DROP"]);
        assert_eq!(rule.args("-I").join(" "), "-w -t filter -I FORWARD 1 -s 192.168.88.20 -j DROP");
        assert_eq!(rule.args("-D").join(" "), "-w -t filter -D FORWARD -s 192.168.88.20 -j DROP");
    }
}
