//! Root switch via pivot_root.

use std::fs;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use super::{io_context, syscall_context, RootfsError};

const OLD_ROOT: &str = ".old_root";

/// Swaps the process root to `new_root` and detaches the old one.
///
/// The current `/` is first made recursively private so the unmounts
/// cannot propagate back to the host, and `new_root` is bind-mounted on
/// itself because pivot_root requires a mount point.
pub fn pivot_root(new_root: &Path) -> Result<(), RootfsError> {
    tracing::debug!(?new_root, "pivoting root");

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(syscall_context("making / private"))?;

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(syscall_context(format!(
        "bind mounting {} onto itself",
        new_root.display()
    )))?;

    let put_old = new_root.join(OLD_ROOT);
    fs::create_dir_all(&put_old)
        .map_err(io_context(format!("creating {}", put_old.display())))?;

    unistd::pivot_root(new_root, &put_old).map_err(syscall_context(format!(
        "pivot_root into {}",
        new_root.display()
    )))?;

    unistd::chdir("/").map_err(syscall_context("chdir to new root"))?;

    let old_root = Path::new("/").join(OLD_ROOT);
    umount2(&old_root, MntFlags::MNT_DETACH)
        .map_err(syscall_context("detaching old root"))?;
    if let Err(err) = fs::remove_dir_all(&old_root) {
        tracing::warn!(%err, "could not remove old root directory");
    }

    Ok(())
}
