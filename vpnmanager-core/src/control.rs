//! Configuration document for the manager.
//!
//! A `ManagerConfig` is immutable once loaded. A changed file produces a new
//! value that replaces the old one wholesale.

use crate::distribution::WeightedPath;
use crate::liveness::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_THRESHOLD};
use crate::nft::{BaseTable, IfName, Ipv4Cidr, Mark};
use crate::route::PolicyRoute;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

fn default_weight() -> i64 {
    1
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_threshold() -> u32 {
    DEFAULT_RECOVERY_THRESHOLD
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(4)
}

/// One outbound VPN path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnInterface {
    /// Interface name, unique across the document
    pub name: IfName,

    /// Relative share of new connections. Values below 1 count as 1.
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Mark applied to connections routed over this path
    pub mark: Mark,

    /// Routing table that receives a default route via this interface.
    ///
    /// When unset, routing of marked traffic is left to the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table: Option<u32>,
}

impl VpnInterface {
    pub fn weighted_path(&self) -> WeightedPath {
        WeightedPath::new(self.mark, self.weight)
    }

    pub fn policy_route(&self) -> Option<PolicyRoute> {
        self.route_table.map(|table| PolicyRoute {
            ifname: self.name.clone(),
            mark: self.mark,
            table,
        })
    }
}

/// Configuration for the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// LAN-facing interfaces whose ingress traffic is steered
    #[serde(default)]
    pub lan_interfaces: Vec<IfName>,

    /// Destinations that never go through a VPN path
    #[serde(default)]
    pub no_vpn_ips: Vec<Ipv4Cidr>,

    /// Hosts probed through each VPN interface. Any answer means reachable.
    #[serde(default)]
    pub probe_addresses: Vec<String>,

    /// Per-target probe timeout, also the pause between probe rounds
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Consecutive failed rounds before a path is taken out
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successful rounds before a path is put back
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    /// File with resolved bypass-domain addresses, one per line.
    ///
    /// Seeded into the domain bypass set on every start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_ip_file: Option<PathBuf>,

    /// VPN paths, in distribution order
    #[serde(default)]
    pub vpn_interfaces: Vec<VpnInterface>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            vpn_interfaces: vec![VpnInterface {
                name: IfName::unchecked("vpn"),
                weight: 1,
                mark: Mark::unchecked(0x3e9),
                route_table: None,
            }],
            lan_interfaces: vec![IfName::unchecked("br-lan")],
            no_vpn_ips: vec![Ipv4Cidr::unchecked(Ipv4Addr::new(192, 168, 0, 0), 16)],
            probe_addresses: vec!["8.8.8.8".to_string(), "cloudflare.com".to_string()],
            probe_timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            domain_ip_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate VPN interface name '{0}'")]
    DuplicateInterface(String),

    #[error("duplicate mark {mark} on '{first}' and '{second}'")]
    DuplicateMark {
        mark: Mark,
        first: String,
        second: String,
    },

    #[error("probe_timeout must be greater than zero")]
    ZeroProbeTimeout,

    #[error("{0} must be at least 1")]
    ZeroThreshold(&'static str),

    #[error("probe target must not be empty")]
    EmptyProbeTarget,
}

impl ManagerConfig {
    /// Cross-field checks that deserialization cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for iface in &self.vpn_interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(ConfigError::DuplicateInterface(iface.name.to_string()));
            }
        }

        for (i, a) in self.vpn_interfaces.iter().enumerate() {
            if let Some(b) = self.vpn_interfaces[i + 1..].iter().find(|b| b.mark == a.mark) {
                return Err(ConfigError::DuplicateMark {
                    mark: a.mark,
                    first: a.name.to_string(),
                    second: b.name.to_string(),
                });
            }
        }

        if self.probe_timeout.is_zero() {
            return Err(ConfigError::ZeroProbeTimeout);
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("failure_threshold"));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigError::ZeroThreshold("recovery_threshold"));
        }
        if self.probe_addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::EmptyProbeTarget);
        }
        Ok(())
    }

    pub fn base_table(&self) -> BaseTable {
        BaseTable {
            lan_interfaces: self.lan_interfaces.clone(),
            bypass: self.no_vpn_ips.clone(),
        }
    }

    pub fn policy_routes(&self) -> Vec<PolicyRoute> {
        self.vpn_interfaces
            .iter()
            .filter_map(VpnInterface::policy_route)
            .collect()
    }
}
