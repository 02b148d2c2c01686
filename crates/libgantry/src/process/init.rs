//! The in-container init sequence.
//!
//! Runs as PID 1 of the new namespaces after the daemon re-executes
//! itself in init mode. Everything here happens strictly after the
//! bring-up record arrives on fd 3, which guarantees cgroup membership
//! and the veth peer are already in place.
//!
//! No SIGCHLD reaper is installed: orphans inside the container are
//! reparented to this process and cleaned up by the kernel on exit, but
//! a workload that double-forks can accumulate zombies until then. This
//! is a known limitation kept from the original design.

use std::convert::Infallible;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;

use nix::unistd;

use super::pipe::{self, PipeError};
use crate::config;
use crate::daemon::wire::RunRequest;
use crate::image::ImageStore;
use crate::network::{self, NetworkError, Subnet};
use crate::rootfs::{self, RootfsError};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Pipe(#[from] PipeError),
    #[error(transparent)]
    Rootfs(#[from] RootfsError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("failed to set hostname '{name}': {source}")]
    Hostname { name: String, source: nix::Error },
    #[error("bad address '{0}' in bring-up record")]
    Address(String),
    #[error("failed to run setup command '{command}': {source}")]
    SetupSpawn {
        command: String,
        source: std::io::Error,
    },
    #[error("setup command '{command}' exited with {code}")]
    SetupCommand { command: String, code: i32 },
    #[error("failed to exec '{command}': {source}")]
    Exec { command: String, source: nix::Error },
}

impl InitError {
    /// Exit status for the init process. Exec failure is distinct so
    /// the parent can tell "could not start the payload" from every
    /// earlier bring-up failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::Exec { .. } => 127,
            _ => 1,
        }
    }
}

/// Brings the container up and replaces this process with the payload.
/// Only returns on error.
pub fn run() -> Result<Infallible, InitError> {
    // blocks until the parent finishes external setup
    let req: RunRequest = pipe::read_bring_up()?;
    tracing::info!(
        name = %req.name,
        command = %req.command,
        "container init starting"
    );

    unistd::sethostname(&req.name).map_err(|source| InitError::Hostname {
        name: req.name.clone(),
        source,
    })?;

    let images = ImageStore::new(config::IMAGES_DIR);
    rootfs::prepare(&images, &req.image, &req.tag, &req.mount_point)?;

    network::write_resolv_conf(Path::new("/etc"))?;
    configure_network(&req)?;

    run_setup_commands(&req.init_commands)?;

    tracing::info!(command = %req.command, "executing container payload");
    exec_payload(&req.command, &req.args)
}

fn configure_network(req: &RunRequest) -> Result<(), InitError> {
    let address: Ipv4Addr = req
        .ip_address
        .parse()
        .map_err(|_| InitError::Address(req.ip_address.clone()))?;
    let gateway: Ipv4Addr = config::GATEWAY_IP
        .parse()
        .map_err(|_| InitError::Address(config::GATEWAY_IP.to_string()))?;
    let netmask = Subnet::parse(config::SUBNET_CIDR)
        .map_err(|_| InitError::Address(config::SUBNET_CIDR.to_string()))?
        .netmask();

    network::configure_interface(&req.peer_name, address, netmask, gateway)?;
    network::loopback_up()?;
    Ok(())
}

/// Runs the optional setup commands sequentially through the shell. Any
/// non-zero exit aborts bring-up, naming the command.
fn run_setup_commands(commands: &[String]) -> Result<(), InitError> {
    for (idx, line) in commands.iter().enumerate() {
        tracing::info!("setup command ({}/{}): {line}", idx + 1, commands.len());
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(line)
            .status()
            .map_err(|source| InitError::SetupSpawn {
                command: line.clone(),
                source,
            })?;
        if !status.success() {
            return Err(InitError::SetupCommand {
                command: line.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
    }
    Ok(())
}

/// execvp into the payload, searching PATH inside the new root.
fn exec_payload(command: &str, args: &[String]) -> Result<Infallible, InitError> {
    let to_cstring = |value: &str| {
        CString::new(value).map_err(|_| InitError::Exec {
            command: command.to_string(),
            source: nix::Error::EINVAL,
        })
    };

    let program = to_cstring(command)?;
    let mut argv = vec![to_cstring(command)?];
    for arg in args {
        argv.push(to_cstring(arg)?);
    }

    unistd::execvp(&program, &argv).map_err(|source| InitError::Exec {
        command: command.to_string(),
        source,
    })?;
    unreachable!("execvp returned without error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_failure_has_distinct_exit_code() {
        let exec = InitError::Exec {
            command: "/bin/sh".to_string(),
            source: nix::Error::ENOENT,
        };
        let other = InitError::Address("bogus".to_string());
        assert_eq!(exec.exit_code(), 127);
        assert_eq!(other.exit_code(), 1);
        assert_ne!(exec.exit_code(), other.exit_code());
    }

    #[test]
    fn test_setup_command_failure_names_the_command() {
        let err = run_setup_commands(&["exit 3".to_string()]).unwrap_err();
        match err {
            InitError::SetupCommand { command, code } => {
                assert_eq!(command, "exit 3");
                assert_eq!(code, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_setup_commands_run_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        let commands = vec![
            format!("echo one >> {}", marker.display()),
            format!("echo two >> {}", marker.display()),
        ];
        run_setup_commands(&commands).unwrap();
        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }
}
