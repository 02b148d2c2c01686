//! Cgroup v2 engine.
//!
//! One group per container at `<root>/<name>/<id>/`. The daemon keeps
//! itself in the root group so it is never caught inside a per-container
//! group it is about to destroy.

pub mod common;
mod controller;
mod cpu;
mod memory;
mod pids;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;

use crate::container::Limits;
use common::{WrappedIoError, CGROUP_PROCS, CGROUP_SUBTREE_CONTROL};
use controller::Controller;
use cpu::Cpu;
use memory::Memory;
use pids::Pids;

const CONTROLLERS: &[&str] = &["cpu", "memory", "pids"];

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
    #[error("no cgroup directory for container {id}")]
    Missing { id: String },
}

/// Manages the per-container groups under `<root>/<name>/`.
#[derive(Debug, Clone)]
pub struct Manager {
    root: PathBuf,
    name: String,
}

impl Manager {
    pub fn new<P: Into<PathBuf>>(root: P, name: &str) -> Self {
        Self {
            root: root.into(),
            name: name.to_string(),
        }
    }

    fn parent_path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.parent_path().join(id)
    }

    /// Moves the calling process into the root group. Run before
    /// spawning children so the daemon never sits inside a group that
    /// `destroy` will tear down.
    pub fn move_self_to_root(&self) -> Result<(), CgroupError> {
        let procs = self.root.join(CGROUP_PROCS);
        common::write_cgroup_file(procs, nix::unistd::getpid().as_raw())?;
        Ok(())
    }

    /// Creates `<root>/<name>/` and enables the cpu/memory/pids
    /// controllers for it. A controller the kernel does not offer is
    /// logged, not fatal.
    pub fn ensure_parent(&self) -> Result<(), CgroupError> {
        let parent = self.parent_path();
        if !parent.exists() {
            fs::create_dir_all(&parent).map_err(|source| WrappedIoError::CreateDir {
                path: parent.clone(),
                source,
            })?;
            if let Ok(metadata) = fs::metadata(&parent) {
                metadata.permissions().set_mode(0o755);
            }
        }

        for path in [
            self.root.join(CGROUP_SUBTREE_CONTROL),
            parent.join(CGROUP_SUBTREE_CONTROL),
        ] {
            for controller in CONTROLLERS {
                if let Err(err) = common::write_cgroup_file(&path, format!("+{controller}")) {
                    tracing::warn!(%err, controller, "could not enable cgroup controller");
                }
            }
        }

        Ok(())
    }

    /// Creates the container's group, applies `limits`, and moves `pid`
    /// into it. On any failure the group directory is removed
    /// best-effort before the error is returned.
    pub fn create(&self, id: &str, limits: &Limits, pid: Pid) -> Result<PathBuf, CgroupError> {
        let path = self.container_path(id);
        fs::create_dir_all(&path).map_err(|source| WrappedIoError::CreateDir {
            path: path.clone(),
            source,
        })?;

        let result = self.apply_limits(limits, &path).and_then(|()| {
            common::write_cgroup_file(path.join(CGROUP_PROCS), pid.as_raw())
                .map_err(CgroupError::from)
        });

        if let Err(err) = result {
            let _ = fs::remove_dir(&path);
            return Err(err);
        }

        tracing::debug!(id, ?pid, "container cgroup created");
        Ok(path)
    }

    /// Applies the non-sentinel fields of `limits` to a running
    /// container's group. The id-named directory is preferred; a
    /// pid-named directory from older daemons is still accepted.
    pub fn adjust(&self, id: &str, pid: i32, limits: &Limits) -> Result<(), CgroupError> {
        let path = self.container_path(id);
        let path = if path.is_dir() {
            path
        } else {
            let legacy = self.parent_path().join(pid.to_string());
            if !legacy.is_dir() {
                return Err(CgroupError::Missing { id: id.to_string() });
            }
            tracing::warn!(id, pid, "using legacy pid-named cgroup directory");
            legacy
        };

        self.apply_limits(limits, &path)
    }

    /// Removes the container's group recursively. Must only be called
    /// once no process remains in it; the lifecycle manager guarantees
    /// this by destroying strictly after waitpid returns.
    pub fn destroy(&self, id: &str) -> Result<(), CgroupError> {
        let path = self.container_path(id);
        if !path.exists() {
            return Ok(());
        }

        tracing::debug!(id, "removing container cgroup");
        remove_dir_recursive(&path)?;
        Ok(())
    }

    fn apply_limits(&self, limits: &Limits, path: &Path) -> Result<(), CgroupError> {
        Cpu::apply(limits, path)?;
        Memory::apply(limits, path)?;
        Pids::apply(limits, path)?;
        Ok(())
    }
}

/// Removes a cgroup directory tree. Interface files cannot be unlinked,
/// so only directories are removed, deepest first.
fn remove_dir_recursive(path: &Path) -> Result<(), WrappedIoError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(WrappedIoError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries.flatten() {
        let child = entry.path();
        if child.is_dir() {
            remove_dir_recursive(&child)?;
        }
    }

    common::delete_with_retry(path, 4, Duration::from_millis(100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::set_fixture;

    fn fixture_manager(root: &Path) -> Manager {
        Manager::new(root, "gantry")
    }

    #[test]
    fn test_move_self_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_PROCS, "").unwrap();

        let manager = fixture_manager(tmp.path());
        manager.move_self_to_root().expect("move to root group");

        let content = std::fs::read_to_string(tmp.path().join(CGROUP_PROCS)).unwrap();
        assert_eq!(content, nix::unistd::getpid().as_raw().to_string());
    }

    #[test]
    fn test_ensure_parent_creates_group() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), CGROUP_SUBTREE_CONTROL, "").unwrap();

        let manager = fixture_manager(tmp.path());
        manager.ensure_parent().expect("ensure parent group");

        assert!(tmp.path().join("gantry").is_dir());
    }

    #[test]
    fn test_ensure_parent_tolerates_missing_controller_file() {
        let tmp = tempfile::tempdir().unwrap();

        // no subtree_control fixture anywhere: every enable fails, none fatal
        let manager = fixture_manager(tmp.path());
        manager.ensure_parent().expect("missing controllers are not fatal");
    }

    #[test]
    fn test_create_rolls_back_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());

        // cgroup.procs is never materialized on plain tmpfs, so the
        // final write fails and the group must be cleaned up again
        let limits = Limits::default();
        let err = manager.create("c1", &limits, Pid::from_raw(1234));
        assert!(err.is_err());
        assert!(!tmp.path().join("gantry").join("c1").exists());
    }

    #[test]
    fn test_adjust_prefers_id_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());
        let id_dir = tmp.path().join("gantry").join("c1");
        std::fs::create_dir_all(&id_dir).unwrap();
        set_fixture(&id_dir, "memory.max", "max").unwrap();

        let limits = Limits {
            memory_bytes: 52428800,
            ..Default::default()
        };
        manager.adjust("c1", 4321, &limits).expect("adjust by id");

        let content = std::fs::read_to_string(id_dir.join("memory.max")).unwrap();
        assert_eq!(content, "52428800");
    }

    #[test]
    fn test_adjust_accepts_legacy_pid_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());
        let pid_dir = tmp.path().join("gantry").join("4321");
        std::fs::create_dir_all(&pid_dir).unwrap();
        set_fixture(&pid_dir, "pids.max", "max").unwrap();

        let limits = Limits {
            pids_max: 50,
            ..Default::default()
        };
        manager.adjust("c1", 4321, &limits).expect("adjust by legacy pid");

        let content = std::fs::read_to_string(pid_dir.join("pids.max")).unwrap();
        assert_eq!(content, "50");
    }

    #[test]
    fn test_adjust_unknown_container() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());

        let err = manager.adjust("c1", 4321, &Limits::default()).unwrap_err();
        assert!(matches!(err, CgroupError::Missing { .. }));
    }

    #[test]
    fn test_adjust_all_sentinels_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());
        let id_dir = tmp.path().join("gantry").join("c1");
        std::fs::create_dir_all(&id_dir).unwrap();

        // no interface files exist; any write attempt would error
        manager
            .adjust("c1", 4321, &Limits::default())
            .expect("sentinel-only adjust must not write");
    }

    #[test]
    fn test_destroy_is_recursive_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fixture_manager(tmp.path());
        let nested = tmp.path().join("gantry").join("c1").join("sub");
        std::fs::create_dir_all(&nested).unwrap();

        manager.destroy("c1").expect("destroy");
        assert!(!tmp.path().join("gantry").join("c1").exists());
        manager.destroy("c1").expect("destroy again");
    }
}
