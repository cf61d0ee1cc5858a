//! Typed model of the `vpn_manager` nftables table.
//!
//! The table layout is fixed:
//!
//! ```text
//! table ip vpn_manager
//!   set no_vpn_domain_ip_set   dynamic, ipv4_addr, fed by the resolver
//!   set no_vpn_ip_set          static, ipv4_addr interval, from config
//!   chain prerouting           hook; LAN ingress -> select_export
//!   chain select_export        bypass sets return early, else -> vpn
//!   chain vpn                  reject | single mark | weighted distribution
//! ```
//!
//! Names and values are validated when the typed values are constructed, so
//! rendering can never produce a script with a malformed token in it.

use crate::command::SystemCommand;
use crate::distribution::{Distribution, DistributionTable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const NFT: &str = "nft";
pub const TABLE_FAMILY: &str = "ip";
pub const TABLE_NAME: &str = "vpn_manager";
pub const DOMAIN_IP_SET: &str = "no_vpn_domain_ip_set";
pub const BYPASS_IP_SET: &str = "no_vpn_ip_set";
pub const PREROUTING_CHAIN: &str = "prerouting";
pub const SELECT_EXPORT_CHAIN: &str = "select_export";
pub const VPN_CHAIN: &str = "vpn";

/// Maximum interface name length (IFNAMSIZ minus the trailing NUL).
const IFNAME_MAX_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("invalid mark '{0}': expected a non-zero decimal or 0x-prefixed hex u32")]
    Mark(String),

    #[error("invalid interface name '{0}': expected 1-15 characters of [A-Za-z0-9._-]")]
    IfName(String),

    #[error("invalid IPv4 network '{0}': expected a.b.c.d or a.b.c.d/len")]
    Cidr(String),
}

/// Packet/conntrack mark that selects one VPN path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mark(u32);

impl Mark {
    pub fn new(value: u32) -> Result<Self, ValueError> {
        if value == 0 {
            return Err(ValueError::Mark(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// For compile-time constants known to be non-zero.
    pub(crate) const fn unchecked(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for Mark {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => trimmed.parse::<u32>(),
        };
        parsed
            .ok()
            .filter(|v| *v != 0)
            .map(Self)
            .ok_or_else(|| ValueError::Mark(s.to_string()))
    }
}

impl TryFrom<String> for Mark {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mark> for String {
    fn from(mark: Mark) -> Self {
        mark.to_string()
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Network interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IfName(String);

impl IfName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn unchecked(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Double-quoted form used inside nft expressions.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl FromStr for IfName {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= IFNAME_MAX_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !valid {
            return Err(ValueError::IfName(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for IfName {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IfName> for String {
    fn from(name: IfName) -> Self {
        name.0
    }
}

impl fmt::Display for IfName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv4 network in prefix form. Host bits are cleared on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Result<Self, ValueError> {
        if prefix > 32 {
            return Err(ValueError::Cidr(format!("{ip}/{prefix}")));
        }
        let mask: u32 = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        let network = Ipv4Addr::from(u32::from(ip) & mask);
        Ok(Self { network, prefix })
    }

    /// For constants whose network address already has no host bits.
    pub(crate) const fn unchecked(network: Ipv4Addr, prefix: u8) -> Self {
        Self { network, prefix }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ValueError::Cidr(s.to_string());
        let (ip_s, prefix) = match s.trim().split_once('/') {
            Some((ip_s, prefix_s)) => (ip_s, prefix_s.parse::<u8>().map_err(|_| err())?),
            None => (s.trim(), 32),
        };
        let ip: Ipv4Addr = ip_s.parse().map_err(|_| err())?;
        Self::new(ip, prefix).map_err(|_| err())
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == 32 {
            write!(f, "{}", self.network)
        } else {
            write!(f, "{}/{}", self.network, self.prefix)
        }
    }
}

/// Static part of the table, installed once per configuration generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTable {
    pub lan_interfaces: Vec<IfName>,
    pub bypass: Vec<Ipv4Cidr>,
}

impl BaseTable {
    /// LAN ingress selector for the prerouting chain, if any LAN is configured.
    fn lan_selector(&self) -> Option<String> {
        match self.lan_interfaces.as_slice() {
            [] => None,
            [one] => Some(format!("iifname {} jump {SELECT_EXPORT_CHAIN}", one.quoted())),
            many => {
                let names: Vec<String> = many.iter().map(IfName::quoted).collect();
                Some(format!(
                    "iifname {{ {} }} jump {SELECT_EXPORT_CHAIN}",
                    names.join(", ")
                ))
            }
        }
    }

    /// Render the script that (re)creates the table in one transaction.
    ///
    /// `add table` followed by `delete table` makes the delete succeed even
    /// when no table exists, so a leftover table from a crashed run is
    /// replaced instead of merged into.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("add table {TABLE_FAMILY} {TABLE_NAME}\n"));
        out.push_str(&format!("delete table {TABLE_FAMILY} {TABLE_NAME}\n"));
        out.push_str(&format!("table {TABLE_FAMILY} {TABLE_NAME} {{\n"));

        out.push_str(&format!("    set {DOMAIN_IP_SET} {{\n"));
        out.push_str("        type ipv4_addr;\n");
        out.push_str("    }\n");

        out.push_str(&format!("    set {BYPASS_IP_SET} {{\n"));
        out.push_str("        type ipv4_addr; flags interval; auto-merge;\n");
        if !self.bypass.is_empty() {
            let elements: Vec<String> = self.bypass.iter().map(ToString::to_string).collect();
            out.push_str(&format!("        elements = {{ {} }}\n", elements.join(", ")));
        }
        out.push_str("    }\n");

        out.push_str(&format!("    chain {PREROUTING_CHAIN} {{\n"));
        out.push_str("        type filter hook prerouting priority 0;\n");
        if let Some(selector) = self.lan_selector() {
            out.push_str(&format!("        {selector}\n"));
        }
        out.push_str("    }\n");

        out.push_str(&format!("    chain {SELECT_EXPORT_CHAIN} {{\n"));
        out.push_str(&format!("        ip daddr @{BYPASS_IP_SET} return\n"));
        out.push_str(&format!("        ip daddr @{DOMAIN_IP_SET} return\n"));
        out.push_str(&format!("        jump {VPN_CHAIN}\n"));
        out.push_str("    }\n");

        out.push_str(&format!("    chain {VPN_CHAIN} {{\n"));
        out.push_str("        reject\n");
        out.push_str("    }\n");
        out.push_str("}\n");
        out
    }

    pub fn install_command(&self) -> SystemCommand {
        nft_script(self.render())
    }
}

/// One rule of the `vpn` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnRule {
    /// No path is available.
    Reject,
    /// Mark every packet with one path and remember it in conntrack.
    SetMark(Mark),
    /// Tracked connections keep the mark they were assigned when new.
    RestoreMark,
    /// New connections draw a bucket and remember the resulting mark.
    Distribute(DistributionTable),
}

impl VpnRule {
    pub fn render(&self) -> String {
        match self {
            Self::Reject => "reject".to_string(),
            Self::SetMark(mark) => format!("meta mark set {mark} ct mark set meta mark"),
            Self::RestoreMark => "ct state established,related meta mark set ct mark".to_string(),
            Self::Distribute(table) => format!(
                "ct state new meta mark set numgen random mod 100 map {} ct mark set meta mark",
                render_map(table)
            ),
        }
    }
}

fn render_map(table: &DistributionTable) -> String {
    let entries: Vec<String> = table
        .buckets()
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| {
            if b.start == b.end {
                format!("{} : {}", b.start, b.mark)
            } else {
                format!("{}-{} : {}", b.start, b.end, b.mark)
            }
        })
        .collect();
    format!("{{ {} }}", entries.join(", "))
}

/// Rules that implement a distribution decision, in chain order.
pub fn vpn_rules(distribution: &Distribution) -> Vec<VpnRule> {
    match distribution {
        Distribution::Reject => vec![VpnRule::Reject],
        Distribution::Single(mark) => vec![VpnRule::SetMark(*mark)],
        Distribution::Weighted(table) => {
            vec![VpnRule::RestoreMark, VpnRule::Distribute(table.clone())]
        }
    }
}

/// Script that replaces the `vpn` chain contents in a single transaction.
pub fn vpn_chain_script(distribution: &Distribution) -> String {
    let mut out = format!("flush chain {TABLE_FAMILY} {TABLE_NAME} {VPN_CHAIN}\n");
    for rule in vpn_rules(distribution) {
        out.push_str(&format!(
            "add rule {TABLE_FAMILY} {TABLE_NAME} {VPN_CHAIN} {}\n",
            rule.render()
        ));
    }
    out
}

pub fn vpn_chain_command(distribution: &Distribution) -> SystemCommand {
    nft_script(vpn_chain_script(distribution))
}

pub fn delete_table_command() -> SystemCommand {
    SystemCommand::new(NFT, ["delete", "table", TABLE_FAMILY, TABLE_NAME])
}

/// Incremental operation on the dynamic domain bypass set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOp {
    Add(Vec<Ipv4Addr>),
    Delete(Vec<Ipv4Addr>),
    Flush,
}

impl SetOp {
    /// Build the command, or `None` when there is nothing to do.
    pub fn command(&self) -> Option<SystemCommand> {
        let (verb, ips) = match self {
            Self::Flush => {
                return Some(SystemCommand::new(
                    NFT,
                    ["flush", "set", TABLE_FAMILY, TABLE_NAME, DOMAIN_IP_SET],
                ))
            }
            Self::Add(ips) => ("add", ips),
            Self::Delete(ips) => ("delete", ips),
        };
        if ips.is_empty() {
            return None;
        }
        let elements: Vec<String> = ips.iter().map(ToString::to_string).collect();
        Some(SystemCommand::new(
            NFT,
            [
                verb.to_string(),
                "element".to_string(),
                TABLE_FAMILY.to_string(),
                TABLE_NAME.to_string(),
                DOMAIN_IP_SET.to_string(),
                format!("{{ {} }}", elements.join(", ")),
            ],
        ))
    }
}

fn nft_script(script: String) -> SystemCommand {
    SystemCommand::new(NFT, ["-f", "-"]).with_stdin(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::WeightedPath;

    fn mark(s: &str) -> Mark {
        s.parse().unwrap()
    }

    #[test]
    fn test_mark_parse() {
        assert_eq!(mark("0x3e9").value(), 1001);
        assert_eq!(mark("1001").value(), 1001);
        assert_eq!(mark("0X3E9").to_string(), "0x3e9");
        assert!("0".parse::<Mark>().is_err());
        assert!("0x".parse::<Mark>().is_err());
        assert!("mark".parse::<Mark>().is_err());
        assert!("0x1ffffffff".parse::<Mark>().is_err());
    }

    #[test]
    fn test_ifname_validation() {
        assert!("br-lan".parse::<IfName>().is_ok());
        assert!("wg0.100".parse::<IfName>().is_ok());
        assert!("".parse::<IfName>().is_err());
        assert!("a-very-long-ifname".parse::<IfName>().is_err());
        assert!("eth0; drop".parse::<IfName>().is_err());
        assert!("\"eth0\"".parse::<IfName>().is_err());
    }

    #[test]
    fn test_cidr_masks_host_bits() {
        let cidr: Ipv4Cidr = "192.168.1.77/16".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(cidr.to_string(), "192.168.0.0/16");

        let host: Ipv4Cidr = "10.0.0.1".parse().unwrap();
        assert_eq!(host.prefix(), 32);
        assert_eq!(host.to_string(), "10.0.0.1");

        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Cidr>().is_err());
        assert!("::1/128".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_base_table_single_lan() {
        let table = BaseTable {
            lan_interfaces: vec!["br-lan".parse().unwrap()],
            bypass: vec!["192.168.0.0/16".parse().unwrap()],
        };
        let script = table.render();
        assert!(script.starts_with("add table ip vpn_manager\ndelete table ip vpn_manager\n"));
        assert!(script.contains("iifname \"br-lan\" jump select_export"));
        assert!(script.contains("elements = { 192.168.0.0/16 }"));
        assert!(script.contains("ip daddr @no_vpn_ip_set return"));
        assert!(script.contains("ip daddr @no_vpn_domain_ip_set return"));
        assert!(script.contains("chain vpn {\n        reject\n"));
    }

    #[test]
    fn test_base_table_lan_variants() {
        let mut table = BaseTable {
            lan_interfaces: Vec::new(),
            bypass: Vec::new(),
        };
        let script = table.render();
        assert!(!script.contains("iifname"));
        assert!(!script.contains("elements"));

        table.lan_interfaces = vec!["br-lan".parse().unwrap(), "wlan0".parse().unwrap()];
        assert!(table
            .render()
            .contains("iifname { \"br-lan\", \"wlan0\" } jump select_export"));
    }

    #[test]
    fn test_vpn_chain_reject_and_single() {
        let script = vpn_chain_script(&Distribution::Reject);
        assert_eq!(
            script,
            "flush chain ip vpn_manager vpn\nadd rule ip vpn_manager vpn reject\n"
        );

        let script = vpn_chain_script(&Distribution::Single(mark("0x3e9")));
        assert_eq!(
            script,
            "flush chain ip vpn_manager vpn\n\
             add rule ip vpn_manager vpn meta mark set 0x3e9 ct mark set meta mark\n"
        );
    }

    #[test]
    fn test_vpn_chain_weighted() {
        let dist = Distribution::compute(&[
            WeightedPath::new(mark("0x1"), 1),
            WeightedPath::new(mark("0x2"), 1),
        ]);
        let script = vpn_chain_script(&dist);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "flush chain ip vpn_manager vpn");
        assert_eq!(
            lines[1],
            "add rule ip vpn_manager vpn ct state established,related meta mark set ct mark"
        );
        assert_eq!(
            lines[2],
            "add rule ip vpn_manager vpn ct state new meta mark set numgen random mod 100 \
             map { 0-50 : 0x1, 51-99 : 0x2 } ct mark set meta mark"
        );
    }

    #[test]
    fn test_map_skips_zero_width_and_collapses_single_value() {
        let dist = Distribution::compute(&[
            WeightedPath::new(mark("0x1"), 1),
            WeightedPath::new(mark("0x2"), 1),
            WeightedPath::new(mark("0x3"), 1000),
        ]);
        let Distribution::Weighted(table) = dist else {
            panic!("expected weighted distribution");
        };
        assert_eq!(render_map(&table), "{ 0 : 0x1, 1-99 : 0x3 }");
    }

    #[test]
    fn test_set_ops() {
        let ips = vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];
        let add = SetOp::Add(ips.clone()).command().unwrap();
        assert_eq!(
            add.to_string(),
            "nft add element ip vpn_manager no_vpn_domain_ip_set { 1.1.1.1, 8.8.8.8 }"
        );
        let del = SetOp::Delete(ips).command().unwrap();
        assert_eq!(del.args[0], "delete");
        assert!(SetOp::Add(Vec::new()).command().is_none());
        assert!(SetOp::Delete(Vec::new()).command().is_none());
        assert_eq!(
            SetOp::Flush.command().unwrap().to_string(),
            "nft flush set ip vpn_manager no_vpn_domain_ip_set"
        );
    }

    #[test]
    fn test_delete_table() {
        assert_eq!(
            delete_table_command().to_string(),
            "nft delete table ip vpn_manager"
        );
    }
}
