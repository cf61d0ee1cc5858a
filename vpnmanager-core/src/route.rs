//! Policy routing for marked traffic.
//!
//! A VPN path with a routing table gets a default route through its
//! interface in that table, and an `ip rule` sending its mark there.

use crate::command::SystemCommand;
use crate::nft::{IfName, Mark};

pub const IP: &str = "ip";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRoute {
    pub ifname: IfName,
    pub mark: Mark,
    pub table: u32,
}

impl PolicyRoute {
    fn rule_args(&self, verb: &str) -> Vec<String> {
        vec![
            "rule".to_string(),
            verb.to_string(),
            "fwmark".to_string(),
            self.mark.to_string(),
            "lookup".to_string(),
            self.table.to_string(),
        ]
    }

    /// Removes a rule left behind by a previous run; allowed to fail.
    pub fn stale_rule_cleanup(&self) -> SystemCommand {
        SystemCommand::new(IP, self.rule_args("del"))
    }

    /// Commands that install the route and rule, in order.
    pub fn install(&self) -> Vec<SystemCommand> {
        vec![
            SystemCommand::new(
                IP,
                [
                    "route".to_string(),
                    "replace".to_string(),
                    "default".to_string(),
                    "dev".to_string(),
                    self.ifname.to_string(),
                    "table".to_string(),
                    self.table.to_string(),
                ],
            ),
            SystemCommand::new(IP, self.rule_args("add")),
        ]
    }

    /// Commands that undo [`PolicyRoute::install`], in order.
    pub fn teardown(&self) -> Vec<SystemCommand> {
        vec![
            SystemCommand::new(IP, self.rule_args("del")),
            SystemCommand::new(
                IP,
                [
                    "route".to_string(),
                    "flush".to_string(),
                    "table".to_string(),
                    self.table.to_string(),
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_teardown() {
        let route = PolicyRoute {
            ifname: "wg0".parse().unwrap(),
            mark: "0x3e9".parse().unwrap(),
            table: 101,
        };
        let install: Vec<String> = route.install().iter().map(ToString::to_string).collect();
        assert_eq!(
            install,
            vec![
                "ip route replace default dev wg0 table 101",
                "ip rule add fwmark 0x3e9 lookup 101",
            ]
        );
        let teardown: Vec<String> = route.teardown().iter().map(ToString::to_string).collect();
        assert_eq!(
            teardown,
            vec!["ip rule del fwmark 0x3e9 lookup 101", "ip route flush table 101"]
        );
        assert_eq!(
            route.stale_rule_cleanup().to_string(),
            "ip rule del fwmark 0x3e9 lookup 101"
        );
    }
}
