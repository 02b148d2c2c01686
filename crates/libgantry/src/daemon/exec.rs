//! Exec sessions into live containers.
//!
//! An exec request takes over its connection entirely: the command runs
//! inside the container's namespaces via nsenter and the connection
//! becomes its byte stream. Errors here are logged, not answered — the
//! connection is no longer a request/response channel once handed over.

use std::fs::File;
use std::io;
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use serde_json::Value;

use super::wire::ExecRequest;
use crate::container::{ContainerStatus, Manager};

/// Handles an exec request; consumes the connection.
pub fn handle_exec(manager: &Manager, payload: Value, stream: UnixStream) {
    let request: ExecRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "invalid exec payload");
            return;
        }
    };
    if request.command.is_empty() {
        tracing::warn!("exec request carried no command");
        return;
    }

    let info = match manager.resolve(&request.container_id) {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(%err, "exec target not found");
            return;
        }
    };
    if info.status != ContainerStatus::Running || info.pid == 0 {
        tracing::warn!(id = %info.id, "exec target is not running");
        return;
    }
    if procfs::process::Process::new(info.pid).is_err() {
        tracing::warn!(id = %info.id, pid = info.pid, "exec target process is gone");
        return;
    }

    tracing::info!(id = %info.id, pid = info.pid, tty = request.tty, command = ?request.command, "starting exec session");

    let pid = info.pid.to_string();
    let mut command = Command::new("nsenter");
    command
        .arg("--preserve-credentials")
        .args(["-t", &pid])
        .args(["-m", "-u", "-n", "-i", "-p", "--"])
        .args(&request.command);

    let mut use_tty = request.tty;
    if use_tty {
        if let Err(err) = relay_tty(&mut command, &stream) {
            tracing::warn!(%err, "pty setup failed, falling back to raw mode");
            use_tty = false;
        }
    }
    if !use_tty {
        if let Err(err) = relay_raw(&mut command, &stream) {
            tracing::warn!(%err, "exec session failed");
        }
    }

    // write half first, then read half, then the connection itself
    let _ = stream.shutdown(Shutdown::Write);
    let _ = stream.shutdown(Shutdown::Read);
    tracing::info!(id = %info.id, "exec session closed");
}

/// TTY mode: the child gets the pty slave as its controlling terminal
/// and the connection is relayed byte-for-byte against the master.
fn relay_tty(command: &mut Command, stream: &UnixStream) -> io::Result<()> {
    let pty = nix::pty::openpty(None, None).map_err(io::Error::from)?;
    let master = File::from(pty.master);

    command.stdin(Stdio::from(pty.slave.try_clone()?));
    command.stdout(Stdio::from(pty.slave.try_clone()?));
    command.stderr(Stdio::from(pty.slave));
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    // clone everything before spawn so a failure cannot leave a child
    // behind for the raw-mode fallback to double up on
    let mut master_reader = master.try_clone()?;
    let mut conn_writer = stream.try_clone()?;
    let mut conn_reader = stream.try_clone()?;

    let mut child = command.spawn()?;

    let output = std::thread::spawn(move || {
        let _ = io::copy(&mut master_reader, &mut conn_writer);
    });

    let mut master_writer = master;
    let _ = io::copy(&mut conn_reader, &mut master_writer);

    let _ = child.wait();
    let _ = output.join();
    Ok(())
}

/// Raw mode: the connection itself is the child's stdin, and its write
/// half receives both stdout and stderr.
fn relay_raw(command: &mut Command, stream: &UnixStream) -> io::Result<()> {
    command.stdin(Stdio::from(OwnedFd::from(stream.try_clone()?)));
    command.stdout(Stdio::from(OwnedFd::from(stream.try_clone()?)));
    command.stderr(Stdio::from(OwnedFd::from(stream.try_clone()?)));

    let mut child = command.spawn()?;
    let _ = child.wait();
    Ok(())
}
