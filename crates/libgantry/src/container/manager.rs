//! Container lifecycle orchestration.
//!
//! The parent side of bring-up: spawn the namespaced child, set up its
//! cgroup and veth from the outside, then release it by writing the
//! bring-up record into the pipe. State transitions are persisted
//! around each step and unwound in strict reverse order on failure.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use super::{generate_id, ContainerInfo, ContainerStatus, Limits};
use crate::cgroups;
use crate::config;
use crate::daemon::wire::RunRequest;
use crate::error::GantryError;
use crate::image::{ImageError, ImageStore};
use crate::network::{self, Ipam};
use crate::process::pipe::{self, PipeError};
use crate::process::spawn;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct Manager {
    store: Store,
    images: ImageStore,
    cgroups: cgroups::Manager,
    ipam: Ipam,
}

impl Manager {
    pub fn new() -> Result<Self, GantryError> {
        Self::with_paths(Path::new(config::STORAGE_ROOT), Path::new(config::CGROUP_ROOT))
    }

    pub fn with_paths(storage_root: &Path, cgroup_root: &Path) -> Result<Self, GantryError> {
        let store = Store::new(storage_root);
        let gateway: Ipv4Addr = config::GATEWAY_IP
            .parse()
            .map_err(|_| GantryError::InvalidArgument(format!(
                "bad gateway address {}",
                config::GATEWAY_IP
            )))?;
        let ipam = Ipam::new(store.allocations_file(), config::SUBNET_CIDR, gateway)?;

        Ok(Self {
            images: ImageStore::new(store.images_dir()),
            store,
            cgroups: cgroups::Manager::new(cgroup_root, config::CGROUP_NAME),
            ipam,
        })
    }

    /// Checks that an image is present before any container resource is
    /// created for it.
    fn require_image(&self, name: &str, tag: &str) -> Result<(), GantryError> {
        match self.images.rootfs_path(name, tag) {
            Ok(_) => Ok(()),
            Err(err @ ImageError::NotFound(_)) => Err(GantryError::NotFound(err.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One-time host preparation: the runtime's parent cgroup with its
    /// controllers enabled. Idempotent.
    pub fn prepare_host(&self) -> Result<(), GantryError> {
        self.cgroups.ensure_parent()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ContainerInfo>, GantryError> {
        Ok(self.store.list_records()?)
    }

    /// Resolves `identifier` against full id, name, then unambiguous id
    /// prefix.
    pub fn resolve(&self, identifier: &str) -> Result<ContainerInfo, GantryError> {
        if identifier.is_empty() {
            return Err(GantryError::InvalidArgument(
                "empty container identifier".to_string(),
            ));
        }

        let records = self.store.list_records()?;

        if let Some(info) = records.iter().find(|info| info.id == identifier) {
            return Ok(info.clone());
        }
        if let Some(info) = records.iter().find(|info| info.name == identifier) {
            return Ok(info.clone());
        }

        let mut matches = records
            .into_iter()
            .filter(|info| info.id.starts_with(identifier));
        match (matches.next(), matches.next()) {
            (Some(info), None) => Ok(info),
            (Some(_), Some(_)) => Err(GantryError::InvalidArgument(format!(
                "identifier '{identifier}' is ambiguous"
            ))),
            (None, _) => Err(GantryError::NotFound(format!(
                "no container matches '{identifier}'"
            ))),
        }
    }

    /// Creates a container from `req` and runs it. Returns the new id.
    pub fn create_and_run(&self, mut req: RunRequest) -> Result<String, GantryError> {
        if req.tag.is_empty() {
            req.tag = config::DEFAULT_IMAGE_TAG.to_string();
        }
        self.require_image(&req.image, &req.tag)?;

        // never sit inside a group we may later destroy
        self.cgroups.move_self_to_root()?;

        let id = generate_id();
        if req.name.is_empty() {
            req.name = id.clone();
        }
        if req.command.is_empty() {
            req.command = config::DEFAULT_COMMAND.to_string();
        }
        tracing::info!(%id, image = %format!("{}:{}", req.image, req.tag), name = %req.name, "creating container");

        let container_dir = self.store.create_container_dir(&id)?;
        req.container_id = id.clone();
        req.mount_point = container_dir.join("rootfs");

        let ip = match self.ipam.allocate(&id, &req.requested_ip) {
            Ok(ip) => ip,
            Err(err) => {
                let _ = self.store.remove_container_dir(&id);
                return Err(err.into());
            }
        };
        req.ip_address = ip.to_string();

        let mut info = ContainerInfo {
            id: id.clone(),
            pid: 0,
            name: req.name.clone(),
            command: req.command.clone(),
            args: req.args.clone(),
            image: format!("{}:{}", req.image, req.tag),
            mount_point: req.mount_point.clone(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
            limits: req.limits,
            requested_ip: req.requested_ip.clone(),
            ip_address: req.ip_address.clone(),
        };

        let launched = self
            .store
            .write_record(&info)
            .map_err(GantryError::from)
            .and_then(|()| self.launch(&mut req, None));

        let pid = match launched {
            Ok(pid) => pid,
            Err(err) => {
                if let Err(release_err) = self.ipam.release(&id) {
                    tracing::warn!(%release_err, %id, "could not release IP during rollback");
                }
                let _ = self.store.remove_container_dir(&id);
                return Err(err);
            }
        };

        info.pid = pid.as_raw();
        info.status = ContainerStatus::Running;
        if let Err(err) = self.store.write_record(&info) {
            tracing::warn!(%err, %id, "could not persist running state");
        }

        self.spawn_waiter(id.clone(), pid);
        tracing::info!(%id, pid = pid.as_raw(), "container running");
        Ok(id)
    }

    /// Restarts a created or stopped container from its persisted
    /// record.
    pub fn start(&self, identifier: &str) -> Result<String, GantryError> {
        let mut info = self.resolve(identifier)?;
        if info.status == ContainerStatus::Running {
            return Err(GantryError::Conflict(format!(
                "container {identifier} is already running"
            )));
        }
        if !info.status.can_start() {
            return Err(GantryError::Conflict(format!(
                "cannot start container in state {}",
                info.status
            )));
        }

        let (image, tag) = info.image_parts();
        self.require_image(&image, &tag)?;

        self.cgroups.move_self_to_root()?;
        tracing::info!(id = %info.id, name = %info.name, "starting container");
        let desired_ip = if !info.ip_address.is_empty() {
            info.ip_address.clone()
        } else {
            info.requested_ip.clone()
        };
        let ip = self.ipam.allocate(&info.id, &desired_ip)?;

        // child stdout/stderr land here for diagnosis
        let log_path = self.store.container_dir(&info.id).join("init.log");
        let log_file = std::fs::File::create(&log_path).map_err(|source| {
            crate::store::StoreError::Open {
                path: log_path,
                source,
            }
        })?;

        let mut req = RunRequest {
            image,
            tag,
            name: info.name.clone(),
            command: info.command.clone(),
            args: info.args.clone(),
            limits: info.limits,
            requested_ip: info.requested_ip.clone(),
            init_commands: vec![],
            container_id: info.id.clone(),
            mount_point: info.mount_point.clone(),
            peer_name: String::new(),
            ip_address: ip.to_string(),
        };

        let pid = match self.launch(&mut req, Some(log_file.as_raw_fd())) {
            Ok(pid) => pid,
            Err(err) => {
                if let Err(release_err) = self.ipam.release(&info.id) {
                    tracing::warn!(%release_err, "could not release IP during rollback");
                }
                return Err(err);
            }
        };

        info.pid = pid.as_raw();
        info.status = ContainerStatus::Running;
        info.ip_address = ip.to_string();
        info.finished_at = None;
        if let Err(err) = self.store.write_record(&info) {
            tracing::warn!(%err, id = %info.id, "could not persist running state");
        }

        self.spawn_waiter(info.id.clone(), pid);
        Ok(info.id)
    }

    /// Sends SIGTERM to the container's init and records the stop. A pid
    /// that is already gone counts as success. The cgroup is destroyed
    /// by the waiter once the child is reaped.
    pub fn stop(&self, identifier: &str) -> Result<(), GantryError> {
        let mut info = self.resolve(identifier)?;
        if !info.status.can_stop() {
            return Err(GantryError::Conflict(format!(
                "container {identifier} is not in running state (currently {})",
                info.status
            )));
        }

        tracing::info!(id = %info.id, pid = info.pid, "stopping container");
        match kill(Pid::from_raw(info.pid), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                tracing::warn!(pid = info.pid, "process already gone, marking stopped");
            }
            Err(source) => {
                return Err(GantryError::Kernel {
                    context: format!("sending SIGTERM to pid {}", info.pid),
                    source,
                })
            }
        }

        info.status = ContainerStatus::Stopped;
        info.pid = 0;
        info.finished_at = Some(Utc::now());
        self.store.write_record(&info)?;

        if let Err(err) = self.ipam.release(&info.id) {
            tracing::warn!(%err, id = %info.id, "could not release container IP");
        }

        Ok(())
    }

    /// Stops every running container, reporting how many were stopped.
    pub fn stop_all(&self) -> Result<usize, GantryError> {
        let mut stopped = 0;
        for info in self.list()? {
            if info.status != ContainerStatus::Running {
                continue;
            }
            match self.stop(&info.id) {
                Ok(()) => stopped += 1,
                Err(err) => tracing::warn!(%err, id = %info.id, "could not stop container"),
            }
        }
        Ok(stopped)
    }

    /// Applies new limits to a running container. Sentinel fields keep
    /// their current values; an all-sentinel request is a no-op.
    pub fn adjust(&self, identifier: &str, new_limits: &Limits) -> Result<(), GantryError> {
        let mut info = self.resolve(identifier)?;
        if info.status != ContainerStatus::Running {
            return Err(GantryError::Conflict(format!(
                "container {identifier} is not in running state (currently {})",
                info.status
            )));
        }

        if new_limits.is_unset() {
            tracing::debug!(id = %info.id, "adjust carried no limits, nothing to do");
            return Ok(());
        }

        self.cgroups.adjust(&info.id, info.pid, new_limits)?;

        info.limits = info.limits.merged_with(new_limits);
        self.store.write_record(&info)?;
        tracing::info!(id = %info.id, "adjusted container limits");
        Ok(())
    }

    /// Removes a non-running container: unmounts the overlay (best
    /// effort), removes the cgroup directory, the container directory,
    /// and any IP allocation still held.
    pub fn remove(&self, identifier: &str) -> Result<(), GantryError> {
        let info = self.resolve(identifier)?;
        if !info.status.can_remove() {
            return Err(GantryError::Conflict(format!(
                "cannot remove running container {identifier}, stop it first"
            )));
        }

        tracing::info!(id = %info.id, "removing container");
        if let Err(err) = nix::mount::umount(&info.mount_point) {
            tracing::warn!(%err, mount_point = %info.mount_point.display(), "could not unmount rootfs");
        }

        self.cgroups.destroy(&info.id)?;

        if let Err(err) = self.ipam.release(&info.id) {
            tracing::warn!(%err, id = %info.id, "could not release container IP");
        }

        self.store.remove_container_dir(&info.id)?;
        Ok(())
    }

    /// Removes every non-running container.
    pub fn remove_all(&self) -> Result<usize, GantryError> {
        let mut removed = 0;
        for info in self.list()? {
            if info.status == ContainerStatus::Running {
                continue;
            }
            match self.remove(&info.id) {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(%err, id = %info.id, "could not remove container"),
            }
        }
        Ok(removed)
    }

    /// Spawn + external setup + release. The pipe write at the end is
    /// the only thing that lets the child proceed; every failure before
    /// it kills the child and unwinds what was already set up.
    fn launch(&self, req: &mut RunRequest, log_fd: Option<RawFd>) -> Result<Pid, GantryError> {
        let (reader, writer) = pipe::config_pipe()?;
        let pid = spawn::spawn_container_process(reader.raw_fd(), log_fd)?;
        drop(reader);

        if let Err(err) = self.cgroups.create(&req.container_id, &req.limits, pid) {
            kill_and_reap(pid);
            return Err(err.into());
        }

        let peer_name = match network::setup_veth(pid.as_raw()) {
            Ok(peer_name) => peer_name,
            Err(err) => {
                kill_and_reap(pid);
                if let Err(destroy_err) = self.cgroups.destroy(&req.container_id) {
                    tracing::warn!(%destroy_err, "could not destroy cgroup during rollback");
                }
                return Err(err.into());
            }
        };
        req.peer_name = peer_name;

        if let Err(err) = writer.send(req) {
            kill_and_reap(pid);
            if let Err(destroy_err) = self.cgroups.destroy(&req.container_id) {
                tracing::warn!(%destroy_err, "could not destroy cgroup during rollback");
            }
            let err = match err {
                PipeError::Write(io_err)
                    if io_err.kind() == std::io::ErrorKind::BrokenPipe =>
                {
                    GantryError::ChildFailed(
                        "init exited before receiving its configuration".to_string(),
                    )
                }
                other => other.into(),
            };
            return Err(err);
        }

        Ok(pid)
    }

    /// Detached waiter: reaps the child, records the stop, and tears
    /// down the cgroup. Errors here are logged only; the originating
    /// request has already been answered.
    fn spawn_waiter(&self, id: String, pid: Pid) {
        let store = self.store.clone();
        let cgroups = self.cgroups.clone();

        let result = std::thread::Builder::new()
            .name(format!("wait-{id}"))
            .spawn(move || {
                match waitpid(pid, None) {
                    Ok(status) => tracing::info!(%id, ?status, "container exited"),
                    Err(err) => tracing::warn!(%id, %err, "waitpid on container failed"),
                }

                match store.read_record(&id) {
                    Ok(mut info) => {
                        info.pid = 0;
                        info.status = ContainerStatus::Stopped;
                        if info.finished_at.is_none() {
                            info.finished_at = Some(Utc::now());
                        }
                        if let Err(err) = store.write_record(&info) {
                            tracing::warn!(%id, %err, "could not persist stopped state");
                        }
                    }
                    Err(err) => tracing::warn!(%id, %err, "could not load record after exit"),
                }

                if let Err(err) = cgroups.destroy(&id) {
                    tracing::warn!(%id, %err, "could not destroy container cgroup");
                }
            });
        if let Err(err) = result {
            tracing::warn!(%err, "could not spawn waiter thread");
        }
    }
}

fn kill_and_reap(pid: Pid) {
    if let Err(err) = kill(pid, Signal::SIGKILL) {
        if err != Errno::ESRCH {
            tracing::warn!(?pid, %err, "could not kill container process");
        }
    }
    let _ = waitpid(pid, None);
}
