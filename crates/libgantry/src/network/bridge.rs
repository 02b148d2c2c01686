//! Host bridge and NAT setup.
//!
//! Every mutation is guarded by a side-effect-free probe so the daemon
//! can run this on each start without duplicating state.

use super::{capture, probe, run_checked, NetworkError};
use crate::config;

/// Creates the bridge, assigns the gateway address, brings it up, and
/// installs the NAT/forwarding rules. Idempotent.
pub fn ensure_bridge() -> Result<(), NetworkError> {
    if link_exists(config::BRIDGE_NAME) {
        tracing::debug!(bridge = config::BRIDGE_NAME, "bridge already exists");
    } else {
        tracing::info!(bridge = config::BRIDGE_NAME, "creating bridge");
        run_checked("ip", &["link", "add", config::BRIDGE_NAME, "type", "bridge"])?;
    }

    if !address_present(config::BRIDGE_NAME, config::BRIDGE_ADDR) {
        run_checked(
            "ip",
            &["addr", "add", config::BRIDGE_ADDR, "dev", config::BRIDGE_NAME],
        )?;
    }

    run_checked("ip", &["link", "set", config::BRIDGE_NAME, "up"])?;

    install_iptables_rules();
    Ok(())
}

pub(crate) fn link_exists(name: &str) -> bool {
    probe("ip", &["link", "show", name])
}

fn address_present(link: &str, addr: &str) -> bool {
    capture("ip", &["-4", "addr", "show", "dev", link]).contains(addr)
}

struct IptablesRule {
    table: Option<&'static str>,
    chain: &'static str,
    args: Vec<String>,
    action: &'static str,
}

impl IptablesRule {
    fn arg_vec(&self, op: &str) -> Vec<String> {
        let mut args = vec![];
        if let Some(table) = self.table {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        args.push(op.to_string());
        args.push(self.chain.to_string());
        args.extend(self.args.iter().cloned());
        args.push("-j".to_string());
        args.push(self.action.to_string());
        args
    }

    fn exists(&self) -> bool {
        let args = self.arg_vec("-C");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        probe("iptables", &args)
    }

    fn apply(&self) -> Result<(), NetworkError> {
        if self.exists() {
            return Ok(());
        }

        let args = self.arg_vec("-A");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("iptables", &args)?;
        tracing::info!(rule = %args.join(" "), "installed iptables rule");
        Ok(())
    }
}

/// MASQUERADE for traffic leaving the subnet plus the two FORWARD
/// accepts keyed on the bridge. Failures are logged, not fatal: the
/// daemon can still run local-only containers.
fn install_iptables_rules() {
    let rules = [
        IptablesRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            args: vec![
                "-s".to_string(),
                config::SUBNET_CIDR.to_string(),
                "!".to_string(),
                "-o".to_string(),
                config::BRIDGE_NAME.to_string(),
            ],
            action: "MASQUERADE",
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            args: vec!["-i".to_string(), config::BRIDGE_NAME.to_string()],
            action: "ACCEPT",
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            args: vec!["-o".to_string(), config::BRIDGE_NAME.to_string()],
            action: "ACCEPT",
        },
    ];

    for rule in rules {
        if let Err(err) = rule.apply() {
            tracing::warn!(%err, "could not install iptables rule");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_arg_rendering() {
        let rule = IptablesRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            args: vec![
                "-s".to_string(),
                "10.20.0.0/24".to_string(),
                "!".to_string(),
                "-o".to_string(),
                "gantry0".to_string(),
            ],
            action: "MASQUERADE",
        };
        assert_eq!(
            rule.arg_vec("-A"),
            vec![
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                "10.20.0.0/24",
                "!",
                "-o",
                "gantry0",
                "-j",
                "MASQUERADE"
            ]
        );

        let rule = IptablesRule {
            table: None,
            chain: "FORWARD",
            args: vec!["-i".to_string(), "gantry0".to_string()],
            action: "ACCEPT",
        };
        assert_eq!(
            rule.arg_vec("-C"),
            vec!["-C", "FORWARD", "-i", "gantry0", "-j", "ACCEPT"]
        );
    }
}
