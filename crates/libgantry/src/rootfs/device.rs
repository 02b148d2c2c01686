//! Device nodes inside the new root.

use nix::sys::stat::{makedev, mknod, umask, Mode, SFlag};

use super::RootfsError;

/// name, major, minor
const DEVICES: &[(&str, u64, u64)] = &[
    ("/dev/null", 1, 3),
    ("/dev/zero", 1, 5),
    ("/dev/full", 1, 7),
    ("/dev/random", 1, 8),
    ("/dev/urandom", 1, 9),
    ("/dev/tty", 5, 0),
];

/// Creates the standard character devices with mode 0666. The file mode
/// creation mask is cleared for the duration so the nodes come out with
/// exactly the requested permissions.
pub fn create_device_nodes() -> Result<(), RootfsError> {
    let old_mode = umask(Mode::empty());
    let result = DEVICES.iter().try_for_each(|&(path, major, minor)| {
        mknod(
            path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        )
        .map_err(|source| RootfsError::Syscall {
            context: format!("mknod {path}"),
            source,
        })
    });
    umask(old_mode);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_numbers() {
        // fixed major/minor pairs for the standard nodes
        let find = |name: &str| {
            DEVICES
                .iter()
                .find(|(path, _, _)| *path == name)
                .map(|&(_, major, minor)| (major, minor))
        };
        assert_eq!(find("/dev/null"), Some((1, 3)));
        assert_eq!(find("/dev/zero"), Some((1, 5)));
        assert_eq!(find("/dev/full"), Some((1, 7)));
        assert_eq!(find("/dev/random"), Some((1, 8)));
        assert_eq!(find("/dev/urandom"), Some((1, 9)));
        assert_eq!(find("/dev/tty"), Some((5, 0)));
    }
}
