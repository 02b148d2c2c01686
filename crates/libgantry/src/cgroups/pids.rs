use std::path::Path;

use super::common::{self, WrappedIoError};
use super::controller::Controller;
use crate::container::Limits;

pub struct Pids {}

impl Controller for Pids {
    fn apply(limits: &Limits, cgroup_path: &Path) -> Result<(), WrappedIoError> {
        if let Some(max) = limits.pids_max() {
            tracing::debug!(max, "applying pids limit");
            common::write_cgroup_file(cgroup_path.join("pids.max"), max)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::common::set_fixture;

    #[test]
    fn test_set_pids_max() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "pids.max", "max").expect("set fixture for pids.max");

        let limits = Limits {
            pids_max: 100,
            ..Default::default()
        };
        Pids::apply(&limits, tmp.path()).expect("apply pids");

        let content = std::fs::read_to_string(tmp.path().join("pids.max")).expect("read pids.max");
        assert_eq!(content, "100");
    }

    #[test]
    fn test_sentinel_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let limits = Limits {
            pids_max: -1,
            ..Default::default()
        };
        Pids::apply(&limits, tmp.path()).expect("sentinel must not touch pids.max");
    }
}
