use std::path::Path;

use super::common::{self, WrappedIoError};
use super::controller::Controller;
use crate::container::Limits;

/// Scheduling period for cpu.max, fixed at 100ms.
const CPU_PERIOD: i64 = 100_000;

pub struct Cpu {}

impl Controller for Cpu {
    fn apply(limits: &Limits, cgroup_path: &Path) -> Result<(), WrappedIoError> {
        if let Some(cpus) = limits.cpus() {
            tracing::debug!(cpus, "applying cpu limit");
            let quota = cpus * CPU_PERIOD;
            common::write_cgroup_file(cgroup_path.join("cpu.max"), format!("{quota} {CPU_PERIOD}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::common::set_fixture;

    #[test]
    fn test_set_cpu_max() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "cpu.max", "max 100000").expect("set fixture for cpu.max");

        let limits = Limits {
            cpus: 1,
            ..Default::default()
        };
        Cpu::apply(&limits, tmp.path()).expect("apply cpu");

        let content = std::fs::read_to_string(tmp.path().join("cpu.max")).expect("read cpu.max");
        assert_eq!(content, "100000 100000");
    }

    #[test]
    fn test_set_cpu_max_multiple_cores() {
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), "cpu.max", "max 100000").expect("set fixture for cpu.max");

        let limits = Limits {
            cpus: 4,
            ..Default::default()
        };
        Cpu::apply(&limits, tmp.path()).expect("apply cpu");

        let content = std::fs::read_to_string(tmp.path().join("cpu.max")).expect("read cpu.max");
        assert_eq!(content, "400000 100000");
    }

    #[test]
    fn test_sentinel_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();

        // no fixture file: a write attempt would fail loudly
        let limits = Limits {
            cpus: 0,
            ..Default::default()
        };
        Cpu::apply(&limits, tmp.path()).expect("sentinel must not touch cpu.max");
    }
}
