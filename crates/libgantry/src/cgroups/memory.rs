use std::path::Path;

use super::common::{self, WrappedIoError};
use super::controller::Controller;
use crate::container::Limits;

pub struct Memory {}

impl Controller for Memory {
    fn apply(limits: &Limits, cgroup_path: &Path) -> Result<(), WrappedIoError> {
        if let Some(bytes) = limits.memory_bytes() {
            tracing::debug!(bytes, "applying memory limit");
            common::write_cgroup_file(cgroup_path.join("memory.max"), bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::common::set_fixture;

    #[test]
    fn test_set_memory_max() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "memory.max", "max").expect("set fixture for memory.max");

        let limits = Limits {
            memory_bytes: 104857600,
            ..Default::default()
        };
        Memory::apply(&limits, tmp.path()).expect("apply memory");

        let content =
            std::fs::read_to_string(tmp.path().join("memory.max")).expect("read memory.max");
        assert_eq!(content, "104857600");
    }

    #[test]
    fn test_sentinel_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let limits = Limits::default();
        Memory::apply(&limits, tmp.path()).expect("sentinel must not touch memory.max");
    }
}
