//! Compile-time configuration shared by every subsystem.

/// Root of all on-disk state owned by the daemon.
pub const STORAGE_ROOT: &str = "/var/lib/gantry";
/// Extracted images and the image manifest live here.
pub const IMAGES_DIR: &str = "/var/lib/gantry/images";
/// One directory per container, keyed by container id.
pub const CONTAINERS_DIR: &str = "/var/lib/gantry/containers";
/// IP allocation state.
pub const NETWORK_DIR: &str = "/var/lib/gantry/network";

/// Control socket the daemon listens on.
pub const SOCKET_PATH: &str = "/run/gantryd.sock";

/// Host bridge all container veth devices are enslaved to.
pub const BRIDGE_NAME: &str = "gantry0";
/// Address assigned to the bridge; doubles as the container gateway.
pub const BRIDGE_ADDR: &str = "10.20.0.1/24";
pub const GATEWAY_IP: &str = "10.20.0.1";
/// Subnet container addresses are allocated from.
pub const SUBNET_CIDR: &str = "10.20.0.0/24";
pub const VETH_MTU: u32 = 1500;

/// Nameservers seeded into each container's /etc/resolv.conf.
pub const DNS_SERVERS: &[&str] = &["8.8.8.8", "1.1.1.1", "8.8.4.4"];

/// Mount point of the cgroup v2 unified hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
/// Name of the runtime's parent cgroup under the root.
pub const CGROUP_NAME: &str = "gantry";

/// Executed when a run request carries no command.
pub const DEFAULT_COMMAND: &str = "/bin/sh";
/// Default image tag when a reference has none.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// External helper the `pull` command delegates the registry fetch to.
pub const PULL_HELPER: &str = "gantry-pull";
