//! Shared helpers for the cgroup v2 filesystem interface.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";

#[derive(Debug, thiserror::Error)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {data} to {path}: {source}")]
    Write {
        path: PathBuf,
        data: String,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("at {path}: {source}")]
    Other {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl WrappedIoError {
    pub fn inner(&self) -> &std::io::Error {
        match self {
            WrappedIoError::Open { source, .. }
            | WrappedIoError::Write { source, .. }
            | WrappedIoError::Read { source, .. }
            | WrappedIoError::CreateDir { source, .. }
            | WrappedIoError::Other { source, .. } => source,
        }
    }
}

/// Writes `data` into an interface file that the kernel (or a test
/// fixture) has already created; cgroupfs files must not be created by
/// the writer.
#[inline]
pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    let data = data.to_string();

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| WrappedIoError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .write_all(data.as_bytes())
        .map_err(|source| WrappedIoError::Write {
            path: path.to_path_buf(),
            data,
            source,
        })?;

    Ok(())
}

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String, WrappedIoError> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|source| WrappedIoError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Attempts to rmdir `path` with backoff. Cgroup directories stay busy
/// for a moment after their last process exits.
pub fn delete_with_retry<P: AsRef<Path>>(
    path: P,
    retries: u32,
    limit_backoff: Duration,
) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    let mut attempts = 0;
    let mut delay = Duration::from_millis(10);

    while attempts < retries {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(_) => {}
        }

        std::thread::sleep(delay);
        attempts += 1;
        delay *= attempts;
        if delay > limit_backoff {
            delay = limit_backoff;
        }
    }

    Err(WrappedIoError::Other {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "could not delete"),
    })
}

#[cfg(test)]
pub(crate) fn set_fixture(
    temp_dir: &Path,
    filename: &str,
    val: &str,
) -> Result<PathBuf, std::io::Error> {
    let full_path = temp_dir.join(filename);
    std::fs::write(&full_path, val)?;
    Ok(full_path)
}
