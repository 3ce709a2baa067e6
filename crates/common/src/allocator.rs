//! Overlay address allocation
//!
//! Host offsets 0 (network) and 1 (hub gateway) are reserved, as is the
//! broadcast address; peers draw from the rest in ascending order. The pool
//! holds no state of its own: the next address is always recomputed from the
//! set currently in the registry, so an address freed by a delete is handed
//! out again as soon as it is the lowest gap.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

/// First host offset handed to peers
const FIRST_PEER_OFFSET: u32 = 2;

/// Fixed IPv4 block addresses are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Network,
}

impl AddressPool {
    /// Create a pool over `network`; needs room for a gateway and one peer
    pub fn new(network: Ipv4Network) -> Result<Self> {
        if network.prefix() > 30 {
            return Err(Error::InvalidConfig(format!(
                "Subnet {} is too small for a gateway and peers",
                network
            )));
        }
        // Normalise 10.8.0.7/24 to 10.8.0.0/24
        let network = Ipv4Network::new(network.network(), network.prefix())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self { network })
    }

    pub fn parse(cidr: &str) -> Result<Self> {
        let network: Ipv4Network = cidr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("Invalid subnet {:?}: {}", cidr, e)))?;
        Self::new(network)
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// Hub interface address (host offset 1)
    pub fn gateway(&self) -> Ipv4Addr {
        self.host(1)
    }

    /// Hub interface address in CIDR form, e.g. `10.8.0.1/24`
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway(), self.prefix())
    }

    /// Address in CIDR form with the pool prefix, e.g. `10.8.0.2/24`
    pub fn with_prefix(&self, address: Ipv4Addr) -> String {
        format!("{}/{}", address, self.prefix())
    }

    pub fn first_peer(&self) -> Ipv4Addr {
        self.host(FIRST_PEER_OFFSET)
    }

    pub fn last_peer(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.broadcast()) - 1)
    }

    /// Number of addresses peers can hold
    pub fn capacity(&self) -> u32 {
        u32::from(self.last_peer()) - u32::from(self.first_peer()) + 1
    }

    /// Whether `address` is one a peer may hold
    pub fn is_assignable(&self, address: Ipv4Addr) -> bool {
        let value = u32::from(address);
        value >= u32::from(self.first_peer()) && value <= u32::from(self.last_peer())
    }

    /// Lowest assignable address not in `existing`
    pub fn next_address(&self, existing: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        (u32::from(self.first_peer())..=u32::from(self.last_peer()))
            .map(Ipv4Addr::from)
            .find(|candidate| !existing.contains(candidate))
            .ok_or_else(|| Error::Exhausted {
                pool: self.network.to_string(),
            })
    }

    fn host(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()) + offset)
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}
