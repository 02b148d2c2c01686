use std::path::Path;

use super::common::WrappedIoError;
use crate::container::Limits;

/// A cgroup v2 controller. Each implementation owns one interface file
/// and skips it when the corresponding limit carries the sentinel.
pub trait Controller {
    fn apply(limits: &Limits, cgroup_path: &Path) -> Result<(), WrappedIoError>;
}
