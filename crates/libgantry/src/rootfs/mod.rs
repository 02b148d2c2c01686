//! Root filesystem assembly for a starting container.
//!
//! Runs inside the child's mount namespace. The steps are strictly
//! ordered: resolve the image lowerdir, mount the overlay, pivot into
//! it, then populate the pseudo filesystems and device nodes.

mod device;
mod mount;
mod overlay;
mod pivot;

use std::fs;
use std::path::Path;

use crate::image::{ImageError, ImageStore};

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("{context}: {source}")]
    Syscall {
        context: String,
        source: nix::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[error("mount point {0} has no parent directory")]
    NoParent(std::path::PathBuf),
}

pub(crate) fn io_context(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> RootfsError {
    let context = context.into();
    |source| RootfsError::Io { context, source }
}

pub(crate) fn syscall_context(context: impl Into<String>) -> impl FnOnce(nix::Error) -> RootfsError {
    let context = context.into();
    |source| RootfsError::Syscall { context, source }
}

/// Assembles and enters the container root. After this returns, `/` is
/// the overlay and the standard pseudo filesystems and device nodes are
/// in place.
pub fn prepare(
    images: &ImageStore,
    image_name: &str,
    image_tag: &str,
    mount_point: &Path,
) -> Result<(), RootfsError> {
    let lowerdir = images.rootfs_path(image_name, image_tag)?;
    tracing::info!(image = %format!("{image_name}:{image_tag}"), ?lowerdir, "assembling rootfs");

    let base = mount_point
        .parent()
        .ok_or_else(|| RootfsError::NoParent(mount_point.to_path_buf()))?;
    let upperdir = base.join("upper");
    let workdir = base.join("work");

    for dir in [mount_point, upperdir.as_path(), workdir.as_path()] {
        fs::create_dir_all(dir).map_err(io_context(format!("creating {}", dir.display())))?;
    }

    overlay::mount_overlay(&lowerdir, &upperdir, &workdir, mount_point)?;
    pivot::pivot_root(mount_point)?;
    mount::mount_pseudo_filesystems()?;
    device::create_device_nodes()?;

    Ok(())
}
