//! Finite host resource pools.
//!
//! A container is minted from three finite host resources: a user ID, a
//! /30 subnet, and (lazily, per net-in rule) host TCP ports. Each pool
//! hands out values with the same four operations:
//!
//! - `acquire`: next free value, or [`Error::PoolExhausted`]
//! - `release`: return a value to the free set (unknown values are a
//!   silent no-op)
//! - `remove`: reserve a *specific* value, used when re-acquiring exactly
//!   what a snapshot names; fails with [`Error::NotInPool`] or
//!   [`Error::AlreadyAllocated`]
//! - `initial_size`: total capacity at construction
//!
//! Acquisition order is deterministic for a given construction (lowest
//! free value first). All pools are internally synchronized and never do
//! I/O under their locks.
//!
//! [`Error::PoolExhausted`]: crate::error::Error::PoolExhausted
//! [`Error::NotInPool`]: crate::error::Error::NotInPool
//! [`Error::AlreadyAllocated`]: crate::error::Error::AlreadyAllocated

mod network;
mod port;
mod uid;

pub use network::{Network, NetworkPool};
pub use port::PortPool;
pub use uid::UidPool;

use crate::error::Result;

/// Allocator of container user IDs.
pub trait UidAllocator: Send + Sync {
    /// Acquires the next free UID.
    fn acquire(&self) -> Result<u32>;

    /// Returns a UID to the free set.
    fn release(&self, uid: u32);

    /// Reserves a specific UID, excluding it from future acquisition.
    fn remove(&self, uid: u32) -> Result<()>;

    /// Total capacity.
    fn initial_size(&self) -> usize;
}

/// Allocator of /30 subnets carved from a supernet.
pub trait SubnetAllocator: Send + Sync {
    /// Acquires the next free subnet.
    fn acquire(&self) -> Result<Network>;

    /// Returns a subnet to the free set.
    fn release(&self, network: &Network);

    /// Reserves a specific subnet.
    fn remove(&self, network: &Network) -> Result<()>;

    /// Total capacity.
    fn initial_size(&self) -> usize;

    /// CIDR form of the whole supernet the pool carves from.
    fn supernet(&self) -> String;
}

/// Allocator of host TCP port numbers.
pub trait PortAllocator: Send + Sync {
    /// Acquires the next free port.
    fn acquire(&self) -> Result<u32>;

    /// Returns a port to the free set.
    fn release(&self, port: u32);

    /// Reserves a specific port.
    fn remove(&self, port: u32) -> Result<()>;

    /// Total capacity.
    fn initial_size(&self) -> usize;
}
