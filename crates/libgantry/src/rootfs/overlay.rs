//! Overlay mount for the container root.

use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};

use super::{syscall_context, RootfsError};

/// Mounts `lower`+`upper`+`work` as an overlay at `target`.
///
/// EBUSY with an overlay already mounted at `target` is tolerated so a
/// stopped container can be started again over its existing mount. Any
/// other error is fatal to bring-up.
pub fn mount_overlay(
    lower: &Path,
    upper: &Path,
    work: &Path,
    target: &Path,
) -> Result<(), RootfsError> {
    let data = overlay_data(lower, upper, work);
    tracing::debug!(?target, %data, "mounting overlay");

    match mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    ) {
        Ok(()) => Ok(()),
        Err(Errno::EBUSY) if is_mounted_as(Path::new("/proc/mounts"), target, "overlay") => {
            tracing::info!(?target, "mount point already carries an overlay, reusing it");
            Ok(())
        }
        Err(source) => Err(syscall_context(format!(
            "mounting overlay at {}",
            target.display()
        ))(source)),
    }
}

fn overlay_data(lower: &Path, upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    )
}

/// Checks whether `mount_point` is mounted with `fstype` according to
/// the given mounts table (normally /proc/mounts).
fn is_mounted_as(proc_mounts: &Path, mount_point: &Path, fstype: &str) -> bool {
    let Ok(data) = std::fs::read_to_string(proc_mounts) else {
        return false;
    };
    for line in data.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(target), Some(kind)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if Path::new(target) == mount_point {
            return kind == fstype;
        }
    }
    false
}
