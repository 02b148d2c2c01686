//! Daemon-boundary error kinds.
//!
//! Subsystems keep their own error enums; everything flattens into
//! [`GantryError`] where the request dispatcher turns it into an error
//! response. The first four variants are the request-validation kinds,
//! the rest wrap subsystem failures.

use crate::cgroups::CgroupError;
use crate::image::ImageError;
use crate::network::{IpamError, NetworkError};
use crate::process::pipe::PipeError;
use crate::process::spawn::SpawnError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("container process failed: {0}")]
    ChildFailed(String),
    #[error("{context}: {source}")]
    Kernel {
        context: String,
        source: nix::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Ipam(#[from] IpamError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}
