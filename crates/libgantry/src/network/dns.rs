//! DNS seeding for new containers.

use std::path::Path;

use super::NetworkError;
use crate::config;

/// Writes the configured nameserver list into `<etc_dir>/resolv.conf`.
/// Called by the in-container init after pivot_root, so `etc_dir` is the
/// new root's `/etc`.
pub fn write_resolv_conf(etc_dir: &Path) -> Result<(), NetworkError> {
    let mut content = String::new();
    for server in config::DNS_SERVERS {
        content.push_str(&format!("nameserver {server}\n"));
    }

    let path = etc_dir.join("resolv.conf");
    std::fs::write(&path, content).map_err(|source| NetworkError::Io {
        context: format!("writing {}", path.display()),
        source,
    })?;

    tracing::debug!("seeded resolv.conf");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolv_conf_content() {
        let tmp = tempfile::tempdir().unwrap();
        write_resolv_conf(tmp.path()).unwrap();

        let content = std::fs::read_to_string(tmp.path().join("resolv.conf")).unwrap();
        assert_eq!(
            content,
            "nameserver 8.8.8.8\nnameserver 1.1.1.1\nnameserver 8.8.4.4\n"
        );
    }
}
