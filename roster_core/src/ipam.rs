use crate::error::{RosterError, RosterResult};
use crate::keys::PublicKey;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// Subnet used when none is configured.
pub const DEFAULT_SUBNET: &str = "15.0.0.0/24";

/// Prefix length the node-index addressing scheme works on.
pub const DEVICE_PREFIX_LEN: u8 = 24;

/// Host offset of the first address handed to users (`.2`).
pub const FIRST_USER_OFFSET: u32 = 2;

/// Exclusive upper bound for node indexes.
pub const NODE_INDEX_LIMIT: u16 = 255;

/// Check that `subnet` is a canonical `/24`.
pub fn validate_device_subnet(subnet: Ipv4Net) -> RosterResult<()> {
    if subnet.prefix_len() != DEVICE_PREFIX_LEN {
        return Err(RosterError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: format!("prefix must be /{DEVICE_PREFIX_LEN}"),
        });
    }
    if subnet.addr() != subnet.network() {
        return Err(RosterError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: "host bits must be zero".into(),
        });
    }
    Ok(())
}

/// Tunnel address of this node: `<subnet octets>.<node_index>/24`.
pub fn device_address(subnet: Ipv4Net, node_index: u16) -> RosterResult<Ipv4Net> {
    validate_device_subnet(subnet)?;
    if node_index >= NODE_INDEX_LIMIT {
        return Err(RosterError::InvalidNodeIndex(node_index));
    }
    let mut octets = subnet.network().octets();
    octets[3] = node_index as u8;
    Ipv4Net::new(Ipv4Addr::from(octets), DEVICE_PREFIX_LEN).map_err(|err| {
        RosterError::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: err.to_string(),
        }
    })
}

/// Lowest-free-first IPv4 allocator for user addresses.
///
/// Allocation starts at `.2` and skips reserved addresses (the device's own
/// address). Each lease remembers the key that owns it so a release by a
/// different peer cannot free an address still in use.
#[derive(Debug, Clone)]
pub struct AddressPool {
    network: Ipv4Net,
    reserved: BTreeSet<Ipv4Addr>,
    leased: BTreeMap<Ipv4Addr, PublicKey>,
}

impl AddressPool {
    pub fn new(network: Ipv4Net, reserved: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            network: network.trunc(),
            reserved: reserved.into_iter().collect(),
            leased: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        self.reserved.contains(&addr)
    }

    /// Key currently leasing `addr`, if any.
    pub fn holder(&self, addr: Ipv4Addr) -> Option<PublicKey> {
        self.leased.get(&addr).copied()
    }

    /// Lease the lowest free address to `owner`.
    pub fn allocate(&mut self, owner: PublicKey) -> RosterResult<Ipv4Addr> {
        let base = u32::from(self.network.network());
        let candidate = self
            .network
            .hosts()
            .filter(|addr| u32::from(*addr) - base >= FIRST_USER_OFFSET)
            .find(|addr| !self.reserved.contains(addr) && !self.leased.contains_key(addr))
            .ok_or(RosterError::AddressPoolExhausted(self.network))?;
        self.leased.insert(candidate, owner);
        Ok(candidate)
    }

    /// Record an address that a peer already uses. Returns false when the
    /// address is outside the pool, reserved, or leased to someone else.
    pub fn claim(&mut self, addr: Ipv4Addr, owner: PublicKey) -> bool {
        if !self.contains(addr) || self.reserved.contains(&addr) {
            return false;
        }
        match self.leased.get(&addr) {
            Some(existing) => *existing == owner,
            None => {
                self.leased.insert(addr, owner);
                true
            }
        }
    }

    /// Release every address held by `owner`.
    pub fn release_owner(&mut self, owner: &PublicKey) -> Vec<Ipv4Addr> {
        let released: Vec<Ipv4Addr> = self
            .leased
            .iter()
            .filter(|(_, held_by)| *held_by == owner)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &released {
            self.leased.remove(addr);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;

    fn subnet() -> Ipv4Net {
        DEFAULT_SUBNET.parse().unwrap()
    }

    fn owner(seed: u8) -> PublicKey {
        Key::from_bytes([seed; 32])
    }

    #[test]
    fn device_address_uses_node_index_as_last_octet() {
        let addr = device_address(subnet(), 7).unwrap();
        assert_eq!(addr.to_string(), "15.0.0.7/24");
        assert_eq!(device_address(subnet(), 0).unwrap().to_string(), "15.0.0.0/24");
        assert_eq!(device_address(subnet(), 254).unwrap().to_string(), "15.0.0.254/24");
    }

    #[test]
    fn device_address_rejects_out_of_range_index() {
        assert!(matches!(
            device_address(subnet(), 255),
            Err(RosterError::InvalidNodeIndex(255))
        ));
        assert!(matches!(
            device_address(subnet(), 1000),
            Err(RosterError::InvalidNodeIndex(1000))
        ));
    }

    #[test]
    fn device_address_requires_canonical_slash_24() {
        let wide: Ipv4Net = "15.0.0.0/16".parse().unwrap();
        assert!(matches!(
            device_address(wide, 1),
            Err(RosterError::InvalidSubnet { .. })
        ));
        let host_bits: Ipv4Net = "15.0.0.9/24".parse().unwrap();
        assert!(device_address(host_bits, 1).is_err());
    }

    #[test]
    fn allocation_starts_at_dot_two_and_skips_reserved() {
        let mut pool = AddressPool::new(subnet(), ["15.0.0.3".parse().unwrap()]);
        assert_eq!(pool.allocate(owner(1)).unwrap().to_string(), "15.0.0.2");
        assert_eq!(pool.allocate(owner(2)).unwrap().to_string(), "15.0.0.4");
    }

    #[test]
    fn released_addresses_are_reused_lowest_first() {
        let mut pool = AddressPool::new(subnet(), []);
        let a = pool.allocate(owner(1)).unwrap();
        let _b = pool.allocate(owner(2)).unwrap();
        assert_eq!(pool.release_owner(&owner(1)), vec![a]);
        assert_eq!(pool.allocate(owner(3)).unwrap(), a);
    }

    #[test]
    fn claim_respects_existing_owner() {
        let mut pool = AddressPool::new(subnet(), []);
        let addr: Ipv4Addr = "15.0.0.9".parse().unwrap();
        assert!(pool.claim(addr, owner(1)));
        assert!(pool.claim(addr, owner(1)));
        assert!(!pool.claim(addr, owner(2)));
        assert_eq!(pool.holder(addr), Some(owner(1)));
        assert!(pool.release_owner(&owner(2)).is_empty());
        assert!(!pool.claim("10.1.1.1".parse().unwrap(), owner(1)));
    }

    #[test]
    fn exhausted_pool_reports_error() {
        let tiny: Ipv4Net = "15.0.0.0/30".parse().unwrap();
        let mut pool = AddressPool::new(tiny, []);
        // hosts are .1 and .2; only .2 is past the user offset
        assert!(pool.allocate(owner(1)).is_ok());
        assert!(matches!(
            pool.allocate(owner(2)),
            Err(RosterError::AddressPoolExhausted(_))
        ));
    }
}
