//! Crash-tolerant on-disk state.
//!
//! Layout under the storage root:
//!
//! ```text
//! images/manifest.json            [{repoTag, imageID}]
//! images/<imageID>/rootfs/        extracted lowerdir
//! containers/<id>/config.json     container record
//! containers/<id>/rootfs/         overlay mountpoint
//! containers/<id>/upper/, work/   overlay upper and workdir
//! network/allocations.json        {containerToIP: {...}}
//! ```
//!
//! Every mutating write goes through a temp file in the same directory,
//! fsynced before the rename, so a crash leaves either the old or the
//! new content, never a torn file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::container::ContainerInfo;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {from} into place: {source}")]
    Rename {
        from: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    /// True when the underlying cause is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::Open { source, .. }
            | StoreError::Read { source, .. }
            | StoreError::Remove { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

/// Serializes `value` next to `path` and renames it into place. The temp
/// file is fsynced before the rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path).map_err(|source| StoreError::Open {
        path: tmp_path.clone(),
        source,
    })?;
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(&data).map_err(|source| StoreError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    file.sync_all().map_err(|source| StoreError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| StoreError::Rename {
        from: tmp_path,
        source,
    })?;

    Ok(())
}

/// Reads and decodes `path`, mapping a missing file to `None`.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if data.is_empty() {
        return Ok(None);
    }

    let value = serde_json::from_slice(&data).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

const RECORD_FILE: &str = "config.json";

/// Scoped persistence for container records and the shared state files.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Creates the directory skeleton the daemon expects. Called once at
    /// startup; failure here is fatal to the daemon.
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [self.containers_dir(), self.images_dir(), self.network_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|source| StoreError::CreateDir { path: dir.clone(), source })?;
        }
        Ok(())
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network")
    }

    pub fn allocations_file(&self) -> PathBuf {
        self.network_dir().join("allocations.json")
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    pub fn create_container_dir(&self, id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.container_dir(id);
        fs::create_dir_all(&dir)
            .map_err(|source| StoreError::CreateDir { path: dir.clone(), source })?;
        Ok(dir)
    }

    pub fn write_record(&self, info: &ContainerInfo) -> Result<(), StoreError> {
        let path = self.container_dir(&info.id).join(RECORD_FILE);
        write_json_atomic(&path, info)
    }

    pub fn read_record(&self, id: &str) -> Result<ContainerInfo, StoreError> {
        let path = self.container_dir(id).join(RECORD_FILE);
        let data = fs::read(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| StoreError::Decode { path, source })
    }

    /// Iterates every container record. Entries that fail to read or
    /// decode are skipped with a warning so one corrupt record cannot
    /// take down listing.
    pub fn list_records(&self) -> Result<Vec<ContainerInfo>, StoreError> {
        let dir = self.containers_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => return Err(StoreError::Read { path: dir, source }),
        };

        let mut records = vec![];
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(?err, "skipping unreadable entry in containers dir");
                    continue;
                }
            };
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.read_record(&id) {
                Ok(info) => records.push(info),
                Err(err) => {
                    tracing::warn!(%id, %err, "skipping container with unreadable record");
                }
            }
        }

        Ok(records)
    }

    pub fn remove_container_dir(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.container_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove { path: dir, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerStatus, Limits};
    use anyhow::Result;
    use chrono::Utc;

    fn sample_record(id: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            pid: 0,
            name: "web".to_string(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 1".to_string()],
            image: "alpine:latest".to_string(),
            mount_point: PathBuf::from("/var/lib/gantry/containers").join(id).join("rootfs"),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
            limits: Limits {
                memory_bytes: 104857600,
                pids_max: 100,
                cpus: 1,
            },
            requested_ip: String::new(),
            ip_address: String::new(),
        }
    }

    #[test]
    fn test_record_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::new(tmp.path());
        let info = sample_record("0123456789abcdef01234567");

        store.create_container_dir(&info.id)?;
        store.write_record(&info)?;
        let got = store.read_record(&info.id)?;

        assert_eq!(got.id, info.id);
        assert_eq!(got.name, info.name);
        assert_eq!(got.args, info.args);
        assert_eq!(got.status, info.status);
        assert_eq!(got.limits, info.limits);
        assert_eq!(got.mount_point, info.mount_point);
        assert_eq!(got.created_at.timestamp_millis(), info.created_at.timestamp_millis());
        Ok(())
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::new(tmp.path());
        let info = sample_record("aaaaaaaaaaaaaaaaaaaaaaaa");

        store.create_container_dir(&info.id)?;
        store.write_record(&info)?;
        store.write_record(&info)?;

        let leftovers: Vec<_> = fs::read_dir(store.container_dir(&info.id))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_skips_corrupt_records() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::new(tmp.path());

        let info = sample_record("bbbbbbbbbbbbbbbbbbbbbbbb");
        store.create_container_dir(&info.id)?;
        store.write_record(&info)?;

        let bad_dir = store.create_container_dir("cccccccccccccccccccccccc")?;
        fs::write(bad_dir.join(RECORD_FILE), b"{not json")?;

        let records = store.list_records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, info.id);
        Ok(())
    }

    #[test]
    fn test_list_on_missing_dir_is_empty() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::new(tmp.path().join("nonexistent"));
        assert!(store.list_records()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_read_json_opt_missing_is_none() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let got: Option<Vec<String>> = read_json_opt(&tmp.path().join("missing.json"))?;
        assert!(got.is_none());
        Ok(())
    }

    #[test]
    fn test_remove_is_idempotent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Store::new(tmp.path());
        store.create_container_dir("dddddddddddddddddddddddd")?;
        store.remove_container_dir("dddddddddddddddddddddddd")?;
        store.remove_container_dir("dddddddddddddddddddddddd")?;
        Ok(())
    }
}
