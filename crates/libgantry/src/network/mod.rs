//! Container networking: host bridge, veth plumbing, address
//! allocation, in-container interface configuration, DNS seeding.

mod bridge;
mod dns;
mod ipam;
mod netdev;
mod veth;

pub use bridge::ensure_bridge;
pub use dns::write_resolv_conf;
pub use ipam::{Ipam, IpamError, Subnet};
pub use netdev::{configure_interface, loopback_up};
pub use veth::setup_veth;

use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("{op} failed for {name}: {source}")]
    Ioctl {
        op: &'static str,
        name: String,
        source: std::io::Error,
    },
    #[error("interface name '{0}' too long")]
    InterfaceName(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

/// Runs `program` with `args`, mapping a non-zero exit into an error
/// carrying the command line and its stderr.
pub(crate) fn run_checked(program: &str, args: &[&str]) -> Result<(), NetworkError> {
    let command = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| NetworkError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(NetworkError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Runs `program` with `args` purely as a probe; only the exit status
/// matters.
pub(crate) fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Captures stdout of `program`, empty on any failure.
pub(crate) fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).into_owned())
        .unwrap_or_default()
}
