//! Veth pair plumbing between the host bridge and a container netns.

use super::{run_checked, NetworkError};
use crate::config;

/// Creates the `veth-<pid>`/`peer-<pid>` pair, enslaves the host side to
/// the bridge, brings it up, and moves the peer into the child's network
/// namespace. Returns the peer name the child will find inside.
///
/// The pair is not cleaned up explicitly; it vanishes together with the
/// child netns when the container exits.
pub fn setup_veth(pid: i32) -> Result<String, NetworkError> {
    let veth_name = format!("veth-{pid}");
    let peer_name = format!("peer-{pid}");
    let mtu = config::VETH_MTU.to_string();

    tracing::info!(pid, veth = %veth_name, "setting up container veth");

    run_checked(
        "ip",
        &[
            "link", "add", &veth_name, "mtu", &mtu, "type", "veth", "peer", "name", &peer_name,
            "mtu", &mtu,
        ],
    )?;
    run_checked(
        "ip",
        &["link", "set", &veth_name, "master", config::BRIDGE_NAME],
    )?;
    run_checked("ip", &["link", "set", &veth_name, "up"])?;
    run_checked("ip", &["link", "set", &peer_name, "netns", &pid.to_string()])?;

    Ok(peer_name)
}
