//! Persisted container metadata.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime status of a container.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    // The runtime has created the record but the process has not started
    #[default]
    Created,
    // The container process is executing the user-specified program
    Running,
    // The container process has exited
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Stopped)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn can_remove(&self) -> bool {
        !matches!(self, ContainerStatus::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
        };

        write!(f, "{print}")
    }
}

/// Resource limits applied to a container's cgroup.
///
/// A non-positive value is the "unset" sentinel: the limit is not written
/// on create and left untouched on adjust. The sentinel is preserved in
/// the persisted record.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    #[serde(default)]
    pub memory_bytes: i64,
    #[serde(default)]
    pub pids_max: i64,
    #[serde(default)]
    pub cpus: i64,
}

impl Limits {
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_bytes > 0).then_some(self.memory_bytes)
    }

    pub fn pids_max(&self) -> Option<i64> {
        (self.pids_max > 0).then_some(self.pids_max)
    }

    pub fn cpus(&self) -> Option<i64> {
        (self.cpus > 0).then_some(self.cpus)
    }

    pub fn is_unset(&self) -> bool {
        self.memory_bytes().is_none() && self.pids_max().is_none() && self.cpus().is_none()
    }

    /// Overlays the set fields of `new` onto `self`, keeping current
    /// values where `new` carries the sentinel.
    pub fn merged_with(&self, new: &Limits) -> Limits {
        Limits {
            memory_bytes: new.memory_bytes().unwrap_or(self.memory_bytes),
            pids_max: new.pids_max().unwrap_or(self.pids_max),
            cpus: new.cpus().unwrap_or(self.cpus),
        }
    }
}

/// Container record persisted as `containers/<id>/config.json`.
///
/// The record is the authoritative source for recovery; cgroups, network
/// devices, and mounts can all be reconstructed from it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    /// Pid of the in-container init-1 process; 0 when not running.
    #[serde(default)]
    pub pid: i32,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `repo:tag` the container was created from.
    pub image: String,
    /// Where the overlay is mounted; the child's future `/`.
    pub mount_point: PathBuf,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "requestedIP", skip_serializing_if = "String::is_empty")]
    pub requested_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

impl ContainerInfo {
    /// Splits `image` into its repository and tag parts, defaulting the
    /// tag when the reference carries none.
    pub fn image_parts(&self) -> (String, String) {
        parse_image_reference(&self.image)
    }
}

pub fn parse_image_reference(reference: &str) -> (String, String) {
    match reference.split_once(':') {
        Some((repo, tag)) if !tag.is_empty() => (repo.to_string(), tag.to_string()),
        Some((repo, _)) => (repo.to_string(), crate::config::DEFAULT_IMAGE_TAG.to_string()),
        None => (
            reference.to_string(),
            crate::config::DEFAULT_IMAGE_TAG.to_string(),
        ),
    }
}
