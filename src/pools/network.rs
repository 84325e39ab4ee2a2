//! /30 subnet pool.
//!
//! A container's network is a 4-address IPv4 block: the base address, the
//! host-side IP (base + 1), the container-side IP (base + 2) and the
//! broadcast address. The pool carves consecutive /30 blocks out of a
//! configured supernet.

use crate::error::{Error, Result};
use crate::pools::SubnetAllocator;
use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Prefix length of every container subnet.
const SUBNET_PREFIX: u8 = 30;

/// Number of addresses in a /30.
const SUBNET_SIZE: u32 = 4;

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidCidr(cidr.to_string()))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;

    if prefix > 32 {
        return Err(Error::InvalidCidr(cidr.to_string()));
    }

    Ok((addr, prefix))
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

// =============================================================================
// Network
// =============================================================================

/// A /30 subnet owned by one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    base: Ipv4Addr,
}

impl Network {
    /// Creates a network from its base address.
    ///
    /// The two low bits of the base are cleared so the value always names
    /// a /30 boundary.
    pub fn new(base: Ipv4Addr) -> Self {
        Self {
            base: Ipv4Addr::from(u32::from(base) & !(SUBNET_SIZE - 1)),
        }
    }

    /// Base address of the subnet.
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Host-side IP (base + 1).
    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + 1)
    }

    /// Container-side IP (base + 2).
    pub fn container_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + 2)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, SUBNET_PREFIX)
    }
}

impl std::str::FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = parse_cidr(s)?;
        if prefix != SUBNET_PREFIX {
            return Err(Error::InvalidCidr(s.to_string()));
        }
        Ok(Self::new(addr))
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("Network", 1)?;
        record.serialize_field("ipNet", &self.to_string())?;
        record.end()
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(rename = "ipNet")]
            ip_net: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        repr.ip_net.parse().map_err(D::Error::custom)
    }
}

// =============================================================================
// NetworkPool
// =============================================================================

/// Pool of /30 subnets carved from a supernet.
pub struct NetworkPool {
    base: u32,
    prefix: u8,
    count: usize,
    free: Mutex<BTreeSet<u32>>,
}

impl NetworkPool {
    /// Creates a pool over the given supernet CIDR, e.g. `10.254.0.0/22`.
    ///
    /// The prefix must be 30 or shorter; host bits in the address are
    /// cleared.
    pub fn new(supernet: &str) -> Result<Self> {
        let (addr, prefix) = parse_cidr(supernet)?;
        if prefix > SUBNET_PREFIX {
            return Err(Error::InvalidCidr(supernet.to_string()));
        }

        let base = u32::from(addr) & mask(prefix);
        let count = 1usize << (SUBNET_PREFIX - prefix);
        let free = (0..count as u32).map(|i| base + i * SUBNET_SIZE).collect();

        Ok(Self {
            base,
            prefix,
            count,
            free: Mutex::new(free),
        })
    }

    fn contains(&self, subnet_base: u32) -> bool {
        subnet_base % SUBNET_SIZE == 0
            && subnet_base >= self.base
            && u64::from(subnet_base) < u64::from(self.base) + self.count as u64 * u64::from(SUBNET_SIZE)
    }
}

impl SubnetAllocator for NetworkPool {
    fn acquire(&self) -> Result<Network> {
        let mut free = self.free.lock().expect("network pool lock");
        let base = free
            .iter()
            .next()
            .copied()
            .ok_or(Error::PoolExhausted {
                resource: "network",
            })?;
        free.remove(&base);
        Ok(Network::new(Ipv4Addr::from(base)))
    }

    fn release(&self, network: &Network) {
        let base = u32::from(network.base());
        if self.contains(base) {
            self.free.lock().expect("network pool lock").insert(base);
        }
    }

    fn remove(&self, network: &Network) -> Result<()> {
        let base = u32::from(network.base());
        if !self.contains(base) {
            return Err(Error::NotInPool {
                value: network.to_string(),
            });
        }

        let mut free = self.free.lock().expect("network pool lock");
        if !free.remove(&base) {
            return Err(Error::AlreadyAllocated {
                value: network.to_string(),
            });
        }

        Ok(())
    }

    fn initial_size(&self) -> usize {
        self.count
    }

    fn supernet(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_addresses() {
        let network: Network = "10.254.0.0/30".parse().unwrap();
        assert_eq!(network.base(), Ipv4Addr::new(10, 254, 0, 0));
        assert_eq!(network.host_ip(), Ipv4Addr::new(10, 254, 0, 1));
        assert_eq!(network.container_ip(), Ipv4Addr::new(10, 254, 0, 2));
        assert_eq!(network.to_string(), "10.254.0.0/30");
    }

    #[test]
    fn test_network_serde_round_trip() {
        let network: Network = "1.2.0.4/30".parse().unwrap();
        let json = serde_json::to_string(&network).unwrap();
        assert_eq!(json, r#"{"ipNet":"1.2.0.4/30"}"#);

        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(back, network);
    }

    #[test]
    fn test_acquire_carves_consecutive_slash_30s() {
        let pool = NetworkPool::new("10.254.0.0/29").unwrap();
        assert_eq!(pool.initial_size(), 2);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_eq!(first.to_string(), "10.254.0.0/30");
        assert_eq!(second.to_string(), "10.254.0.4/30");
        assert!(matches!(
            pool.acquire(),
            Err(Error::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_release_and_reacquire() {
        let pool = NetworkPool::new("10.254.0.0/30").unwrap();
        let network = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());

        pool.release(&network);
        assert_eq!(pool.acquire().unwrap(), network);
    }

    #[test]
    fn test_release_of_foreign_subnet_is_a_no_op() {
        let pool = NetworkPool::new("10.254.0.0/30").unwrap();
        pool.release(&"192.168.0.0/30".parse().unwrap());
        pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn test_remove_reserves_a_specific_subnet() {
        let pool = NetworkPool::new("10.254.0.0/29").unwrap();
        pool.remove(&"10.254.0.0/30".parse().unwrap()).unwrap();

        assert_eq!(pool.acquire().unwrap().to_string(), "10.254.0.4/30");
    }

    #[test]
    fn test_remove_errors() {
        let pool = NetworkPool::new("10.254.0.0/29").unwrap();
        assert!(matches!(
            pool.remove(&"192.168.0.0/30".parse().unwrap()),
            Err(Error::NotInPool { .. })
        ));

        let network = pool.acquire().unwrap();
        assert!(matches!(
            pool.remove(&network),
            Err(Error::AlreadyAllocated { .. })
        ));
    }

    #[test]
    fn test_supernet_is_normalized() {
        let pool = NetworkPool::new("1.2.3.4/20").unwrap();
        assert_eq!(pool.supernet(), "1.2.0.0/20");
        assert_eq!(pool.initial_size(), 1024);
    }

    #[test]
    fn test_rejects_malformed_cidrs() {
        assert!(NetworkPool::new("not-a-network").is_err());
        assert!(NetworkPool::new("10.0.0.0/31").is_err());
        assert!(NetworkPool::new("10.0.0.0/33").is_err());
    }
}
