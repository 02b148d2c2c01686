//! Pseudo filesystems inside the new root.

use std::fs;
use std::path::Path;

use nix::mount::{mount, MsFlags};

use super::{io_context, syscall_context, RootfsError};

/// Mounts /proc, /sys, and the tmpfs/devpts family the way a container
/// payload expects to find them. Must run after pivot_root with the new
/// root as the working directory.
pub fn mount_pseudo_filesystems() -> Result<(), RootfsError> {
    tracing::debug!("mounting /proc, /sys, /dev");

    ensure_dir("/proc")?;
    mount_fs(Some("proc"), "/proc", "proc", None)?;
    ensure_dir("/sys")?;
    mount_fs(Some("sysfs"), "/sys", "sysfs", None)?;

    ensure_dir("/dev")?;
    mount_fs(Some("tmpfs"), "/dev", "tmpfs", Some("mode=0755"))?;

    for dir in ["/dev/pts", "/dev/shm", "/tmp", "/run"] {
        ensure_dir(dir)?;
    }

    mount_fs(
        Some("devpts"),
        "/dev/pts",
        "devpts",
        Some("newinstance,ptmxmode=0666,mode=0620,gid=5"),
    )?;

    let _ = fs::remove_file("/dev/ptmx");
    std::os::unix::fs::symlink("pts/ptmx", "/dev/ptmx")
        .map_err(io_context("linking /dev/ptmx"))?;

    mount_fs(Some("tmpfs"), "/tmp", "tmpfs", Some("mode=1777"))?;
    mount_fs(Some("tmpfs"), "/run", "tmpfs", Some("mode=0755"))?;
    mount_fs(Some("tmpfs"), "/dev/shm", "tmpfs", Some("mode=1777"))?;

    Ok(())
}

fn ensure_dir(path: &str) -> Result<(), RootfsError> {
    fs::create_dir_all(path).map_err(io_context(format!("creating {path}")))
}

fn mount_fs(
    source: Option<&str>,
    target: &str,
    fstype: &str,
    data: Option<&str>,
) -> Result<(), RootfsError> {
    mount(source, Path::new(target), Some(fstype), MsFlags::empty(), data)
        .map_err(syscall_context(format!("mounting {fstype} at {target}")))
}
