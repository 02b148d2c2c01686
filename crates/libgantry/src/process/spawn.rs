//! Spawning the container child.
//!
//! The child is created with clone(2) carrying the four container
//! namespaces and immediately re-executes the daemon binary in init
//! mode, with the bring-up pipe's read end at fd 3. The parent learns
//! the child pid from clone and performs cgroup and veth setup from the
//! outside while the child blocks on the pipe.

use std::ffi::CString;
use std::os::fd::RawFd;

use nix::fcntl::{FcntlArg, FdFlag};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{self, Pid};

use super::pipe::CONFIG_FD;

/// Hidden subcommand that selects init mode in the re-executed binary.
pub const INIT_ARG: &str = "init";

const SELF_EXE: &str = "/proc/self/exe";
const CHILD_STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to clone container process: {0}")]
    Clone(nix::Error),
}

/// Clones the container child. `config_fd` is the pipe read end the
/// child will find at fd 3. When `log_fd` is given, the child's stdout
/// and stderr are redirected to it before the exec.
pub fn spawn_container_process(
    config_fd: RawFd,
    log_fd: Option<RawFd>,
) -> Result<Pid, SpawnError> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET;

    // Runs in the child between clone and exec: only async-signal-safe
    // calls plus the final execv.
    let cb = Box::new(move || -> isize {
        if let Some(fd) = log_fd {
            if unistd::dup2(fd, 1).is_err() || unistd::dup2(fd, 2).is_err() {
                return 127;
            }
        }
        if config_fd == CONFIG_FD {
            // dup2 onto itself would keep CLOEXEC set; clear it instead
            if nix::fcntl::fcntl(config_fd, FcntlArg::F_SETFD(FdFlag::empty())).is_err() {
                return 127;
            }
        } else if unistd::dup2(config_fd, CONFIG_FD).is_err() {
            return 127;
        }

        let (Ok(exe), Ok(argv0), Ok(argv1)) = (
            CString::new(SELF_EXE),
            CString::new("gantryd"),
            CString::new(INIT_ARG),
        ) else {
            return 127;
        };
        let _ = unistd::execv(&exe, &[argv0, argv1]);
        // only reached when the exec itself failed
        127
    });

    let pid = unsafe { clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as libc::c_int)) }
        .map_err(SpawnError::Clone)?;

    tracing::debug!(?pid, "container process cloned");
    Ok(pid)
}
