//! IPv4 allocation from the container subnet.
//!
//! A single JSON file maps container ids to their addresses. Every
//! load/modify/store cycle runs under a process-wide mutex so concurrent
//! lifecycle operations cannot hand out the same address twice.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError};

static IPAM_LOCK: Lazy<Mutex<()>> = Lazy::new(Mutex::default);

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("no available IP addresses in {0}")]
    Exhausted(String),
    #[error("invalid subnet '{0}'")]
    InvalidSubnet(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct AllocationState {
    #[serde(rename = "containerToIP", default)]
    container_to_ip: BTreeMap<String, String>,
}

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn parse(cidr: &str) -> Result<Self, IpamError> {
        let invalid = || IpamError::InvalidSubnet(cidr.to_string());
        let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }

        let mask = mask_u32(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_u32(self.prefix))
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_u32(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask_u32(self.prefix) == u32::from(self.network)
    }

    /// Host addresses, lowest first, excluding network and broadcast.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network).saturating_add(1);
        let last = u32::from(self.broadcast());
        (first..last).map(Ipv4Addr::from)
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - p),
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Persistent allocator over the configured subnet.
#[derive(Debug, Clone)]
pub struct Ipam {
    file: PathBuf,
    subnet: Subnet,
    reserved: Vec<Ipv4Addr>,
}

impl Ipam {
    pub fn new<P: Into<PathBuf>>(
        file: P,
        cidr: &str,
        gateway: Ipv4Addr,
    ) -> Result<Self, IpamError> {
        let subnet = Subnet::parse(cidr)?;
        Ok(Self {
            file: file.into(),
            subnet,
            reserved: vec![gateway],
        })
    }

    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Allocates an address for `id`. A non-empty `requested` address is
    /// tried first; when it cannot be used the allocator falls back to
    /// the first free address. Re-allocating for an id that already
    /// holds an address returns that address.
    pub fn allocate(&self, id: &str, requested: &str) -> Result<Ipv4Addr, IpamError> {
        let _guard = IPAM_LOCK.lock().unwrap();
        let mut state = self.load()?;

        if let Some(existing) = state.container_to_ip.get(id) {
            if let Ok(ip) = existing.parse() {
                return Ok(ip);
            }
        }

        let used: Vec<Ipv4Addr> = state
            .container_to_ip
            .values()
            .filter_map(|ip| ip.parse().ok())
            .collect();

        if !requested.is_empty() {
            match requested.parse::<Ipv4Addr>() {
                Ok(ip) if !self.in_usable_range(ip) => {
                    tracing::debug!(id, %ip, "requested IP outside usable range, falling back to automatic assignment");
                }
                Ok(ip) if self.reserved.contains(&ip) => {
                    tracing::debug!(id, %ip, "requested IP is reserved, falling back to automatic assignment");
                }
                Ok(ip) if used.contains(&ip) => {
                    tracing::debug!(id, %ip, "requested IP already in use, falling back to automatic assignment");
                }
                Ok(ip) => {
                    state.container_to_ip.insert(id.to_string(), ip.to_string());
                    self.save(&state)?;
                    tracing::debug!(id, %ip, "allocated requested IP");
                    return Ok(ip);
                }
                Err(_) => {
                    tracing::debug!(id, requested, "failed to parse requested IP, falling back to automatic assignment");
                }
            }
        }

        for candidate in self.subnet.hosts() {
            if self.reserved.contains(&candidate) || used.contains(&candidate) {
                continue;
            }

            state
                .container_to_ip
                .insert(id.to_string(), candidate.to_string());
            self.save(&state)?;
            tracing::debug!(id, ip = %candidate, "allocated automatic IP");
            return Ok(candidate);
        }

        Err(IpamError::Exhausted(self.subnet.to_string()))
    }

    /// Releases the address held by `id`. Safe to call when no
    /// allocation exists.
    pub fn release(&self, id: &str) -> Result<(), IpamError> {
        let _guard = IPAM_LOCK.lock().unwrap();
        let mut state = self.load()?;

        if state.container_to_ip.remove(id).is_none() {
            return Ok(());
        }
        self.save(&state)
    }

    /// The address currently held by `id`, if any.
    pub fn lookup(&self, id: &str) -> Result<Option<Ipv4Addr>, IpamError> {
        let _guard = IPAM_LOCK.lock().unwrap();
        let state = self.load()?;
        Ok(state
            .container_to_ip
            .get(id)
            .and_then(|ip| ip.parse().ok()))
    }

    fn in_usable_range(&self, ip: Ipv4Addr) -> bool {
        self.subnet.contains(ip) && ip != self.subnet.network() && ip != self.subnet.broadcast()
    }

    fn load(&self) -> Result<AllocationState, IpamError> {
        Ok(store::read_json_opt(&self.file)?.unwrap_or_default())
    }

    fn save(&self, state: &AllocationState) -> Result<(), IpamError> {
        store::write_json_atomic(&self.file, state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn fixture_ipam(dir: &std::path::Path, cidr: &str) -> Ipam {
        let gateway = Subnet::parse(cidr).unwrap().hosts().next().unwrap();
        Ipam::new(dir.join("allocations.json"), cidr, gateway).unwrap()
    }

    #[test]
    fn test_subnet_parse() -> Result<()> {
        let subnet = Subnet::parse("10.20.0.0/24")?;
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 20, 0, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 20, 0, 255));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(subnet.contains(Ipv4Addr::new(10, 20, 0, 42)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 21, 0, 42)));

        // non-canonical network address is masked down
        assert_eq!(Subnet::parse("10.20.0.1/24")?, subnet);

        assert!(Subnet::parse("10.20.0.0").is_err());
        assert!(Subnet::parse("10.20.0.0/33").is_err());
        Ok(())
    }

    #[test]
    fn test_first_allocation_skips_gateway() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let ip = ipam.allocate("c1", "")?;
        assert_eq!(ip, Ipv4Addr::new(10, 20, 0, 2));
        Ok(())
    }

    #[test]
    fn test_requested_ip_honored() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let ip = ipam.allocate("c1", "10.20.0.50")?;
        assert_eq!(ip, Ipv4Addr::new(10, 20, 0, 50));
        Ok(())
    }

    #[test]
    fn test_requested_conflict_falls_back_to_next_free() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        assert_eq!(ipam.allocate("a", "10.20.0.2")?, Ipv4Addr::new(10, 20, 0, 2));
        assert_eq!(ipam.allocate("b", "10.20.0.2")?, Ipv4Addr::new(10, 20, 0, 3));

        let a = ipam.lookup("a")?;
        let b = ipam.lookup("b")?;
        assert_eq!(a, Some(Ipv4Addr::new(10, 20, 0, 2)));
        assert_eq!(b, Some(Ipv4Addr::new(10, 20, 0, 3)));
        Ok(())
    }

    #[test]
    fn test_requested_gateway_falls_back() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let ip = ipam.allocate("c1", "10.20.0.1")?;
        assert_eq!(ip, Ipv4Addr::new(10, 20, 0, 2));
        Ok(())
    }

    #[test]
    fn test_requested_outside_subnet_falls_back() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let ip = ipam.allocate("c1", "192.168.1.5")?;
        assert_eq!(ip, Ipv4Addr::new(10, 20, 0, 2));
        Ok(())
    }

    #[test]
    fn test_reallocation_returns_held_address() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let first = ipam.allocate("c1", "")?;
        let second = ipam.allocate("c1", "")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        // /30: hosts .1 (gateway, reserved) and .2
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/30");

        assert_eq!(ipam.allocate("a", "")?, Ipv4Addr::new(10, 20, 0, 2));
        let err = ipam.allocate("b", "").unwrap_err();
        assert!(matches!(err, IpamError::Exhausted(_)));
        Ok(())
    }

    #[test]
    fn test_release_is_idempotent() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");

        let ip = ipam.allocate("c1", "")?;
        ipam.release("c1")?;
        ipam.release("c1")?;
        ipam.release("never-allocated")?;

        // the address is free again
        assert_eq!(ipam.allocate("c2", "")?, ip);
        Ok(())
    }

    #[test]
    fn test_allocations_unique_and_in_subnet() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ipam = fixture_ipam(tmp.path(), "10.20.0.0/24");
        let subnet = ipam.subnet();

        let mut seen = std::collections::HashSet::new();
        for i in 0..10 {
            let ip = ipam.allocate(&format!("c{i}"), "")?;
            assert!(subnet.contains(ip));
            assert_ne!(ip, subnet.network());
            assert_ne!(ip, subnet.broadcast());
            assert!(seen.insert(ip), "duplicate allocation {ip}");
        }
        Ok(())
    }
}
