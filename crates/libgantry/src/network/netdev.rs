//! In-container interface configuration.
//!
//! Runs inside the child's network namespace after pivot_root, where no
//! userland networking tools can be assumed to exist, so everything is
//! done with AF_INET ioctls against the kernel directly.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use super::NetworkError;

/// Renames the veth peer to `eth0`, assigns the allocated address with
/// the subnet mask, brings the interface up, and installs the default
/// route via the gateway.
pub fn configure_interface(
    peer_name: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<(), NetworkError> {
    tracing::debug!(peer = peer_name, %address, "configuring container interface");

    rename_interface(peer_name, "eth0")?;
    set_address("eth0", address, libc::SIOCSIFADDR, "SIOCSIFADDR")?;
    set_address("eth0", netmask, libc::SIOCSIFNETMASK, "SIOCSIFNETMASK")?;
    bring_up("eth0")?;
    add_default_route(gateway)?;

    Ok(())
}

/// Brings up the loopback interface.
pub fn loopback_up() -> Result<(), NetworkError> {
    bring_up("lo")
}

struct InetSocket(RawFd);

impl InetSocket {
    fn open() -> Result<Self, NetworkError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(NetworkError::Ioctl {
                op: "socket",
                name: "AF_INET".to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self(fd))
    }

    fn ioctl<T>(&self, op: &'static str, request: libc::c_ulong, arg: &mut T, name: &str)
        -> Result<(), NetworkError>
    {
        if unsafe { libc::ioctl(self.0, request, arg as *mut T) } < 0 {
            return Err(NetworkError::Ioctl {
                op,
                name: name.to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for InetSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn ifreq_for(name: &str) -> Result<libc::ifreq, NetworkError> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(NetworkError::InterfaceName(name.to_string()));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            ifr.ifr_name.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
    }
    Ok(ifr)
}

fn sockaddr_in_for(addr: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    };
    unsafe { std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sin) }
}

/// The interface must be down for SIOCSIFNAME, which holds for a
/// freshly moved veth peer.
fn rename_interface(from: &str, to: &str) -> Result<(), NetworkError> {
    let to_bytes = to.as_bytes();
    if to_bytes.len() >= libc::IFNAMSIZ {
        return Err(NetworkError::InterfaceName(to.to_string()));
    }

    let socket = InetSocket::open()?;
    let mut ifr = ifreq_for(from)?;
    unsafe {
        std::ptr::copy_nonoverlapping(
            to_bytes.as_ptr(),
            ifr.ifr_ifru.ifru_newname.as_mut_ptr() as *mut u8,
            to_bytes.len(),
        );
    }
    socket.ioctl("SIOCSIFNAME", libc::SIOCSIFNAME as libc::c_ulong, &mut ifr, to)
}

fn set_address(
    name: &str,
    addr: Ipv4Addr,
    request: libc::c_ulong,
    op: &'static str,
) -> Result<(), NetworkError> {
    let socket = InetSocket::open()?;
    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_addr = sockaddr_in_for(addr);
    socket.ioctl(op, request, &mut ifr, name)
}

fn bring_up(name: &str) -> Result<(), NetworkError> {
    let socket = InetSocket::open()?;
    let mut ifr = ifreq_for(name)?;
    socket.ioctl("SIOCGIFFLAGS", libc::SIOCGIFFLAGS as libc::c_ulong, &mut ifr, name)?;
    unsafe {
        ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    socket.ioctl("SIOCSIFFLAGS", libc::SIOCSIFFLAGS as libc::c_ulong, &mut ifr, name)
}

fn add_default_route(gateway: Ipv4Addr) -> Result<(), NetworkError> {
    let socket = InetSocket::open()?;
    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    route.rt_dst = sockaddr_in_for(Ipv4Addr::UNSPECIFIED);
    route.rt_genmask = sockaddr_in_for(Ipv4Addr::UNSPECIFIED);
    route.rt_gateway = sockaddr_in_for(gateway);
    route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as libc::c_ushort;
    socket.ioctl("SIOCADDRT", libc::SIOCADDRT as libc::c_ulong, &mut route, "default")
}
