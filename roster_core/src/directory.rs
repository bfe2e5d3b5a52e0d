//! In-memory peer directory: the intended peer set of the tunnel device.

use crate::error::{RosterError, RosterResult};
use crate::keys::{PresharedKey, PublicKey};
use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap};

/// Intended configuration of a single peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub public_key: PublicKey,
    pub preshared_key: Option<PresharedKey>,
    /// Ordered CIDR ranges routed to this peer. Never empty.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerRecord {
    pub fn new(
        public_key: PublicKey,
        preshared_key: Option<PresharedKey>,
        allowed_ips: Vec<IpNet>,
    ) -> Self {
        Self {
            public_key,
            preshared_key,
            allowed_ips,
        }
    }
}

/// Parse CIDR strings in order, stopping at the first malformed entry.
pub fn parse_allowed_ips<S: AsRef<str>>(entries: &[S]) -> RosterResult<Vec<IpNet>> {
    if entries.is_empty() {
        return Err(RosterError::InvalidAllowedIp {
            input: String::new(),
            reason: "at least one allowed IP range is required".into(),
        });
    }

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = entry.as_ref().trim();
        let net = raw
            .parse::<IpNet>()
            .map_err(|err| RosterError::InvalidAllowedIp {
                input: raw.to_string(),
                reason: err.to_string(),
            })?;
        parsed.push(net);
    }
    Ok(parsed)
}

/// Peer records keyed by public key, iterated in insertion order.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    index: HashMap<PublicKey, u64>,
    records: BTreeMap<u64, PeerRecord>,
    next_seq: u64,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PeerRecord) -> RosterResult<()> {
        if self.index.contains_key(&record.public_key) {
            return Err(RosterError::DuplicateKey(record.public_key));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(record.public_key, seq);
        self.records.insert(seq, record);
        Ok(())
    }

    pub fn remove(&mut self, key: &PublicKey) -> RosterResult<PeerRecord> {
        let seq = self
            .index
            .remove(key)
            .ok_or(RosterError::UnknownKey(*key))?;
        self.records
            .remove(&seq)
            .ok_or_else(|| RosterError::Invariant(format!("index entry for {key} had no record")))
    }

    pub fn lookup(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.index.get(key).and_then(|seq| self.records.get(seq))
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.index.contains_key(key)
    }

    /// Records in the order they were inserted.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;

    fn record(seed: u8, cidr: &str) -> PeerRecord {
        PeerRecord::new(
            Key::from_bytes([seed; 32]),
            None,
            vec![cidr.parse().unwrap()],
        )
    }

    #[test]
    fn insert_then_lookup() {
        let mut dir = PeerDirectory::new();
        dir.insert(record(1, "15.0.0.2/32")).unwrap();
        let found = dir.lookup(&Key::from_bytes([1; 32])).unwrap();
        assert_eq!(found.allowed_ips[0].to_string(), "15.0.0.2/32");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_rejected_and_keeps_original() {
        let mut dir = PeerDirectory::new();
        dir.insert(record(1, "15.0.0.2/32")).unwrap();
        let err = dir.insert(record(1, "15.0.0.9/32")).unwrap_err();
        assert!(matches!(err, RosterError::DuplicateKey(_)));
        assert_eq!(dir.len(), 1);
        assert_eq!(
            dir.lookup(&Key::from_bytes([1; 32])).unwrap().allowed_ips[0].to_string(),
            "15.0.0.2/32"
        );
    }

    #[test]
    fn remove_unknown_key_fails() {
        let mut dir = PeerDirectory::new();
        let err = dir.remove(&Key::from_bytes([9; 32])).unwrap_err();
        assert!(matches!(err, RosterError::UnknownKey(_)));
    }

    #[test]
    fn snapshot_keeps_insertion_order_across_removals() {
        let mut dir = PeerDirectory::new();
        dir.insert(record(3, "15.0.0.3/32")).unwrap();
        dir.insert(record(1, "15.0.0.4/32")).unwrap();
        dir.insert(record(2, "15.0.0.5/32")).unwrap();
        dir.remove(&Key::from_bytes([1; 32])).unwrap();
        dir.insert(record(1, "15.0.0.6/32")).unwrap();

        let order: Vec<u8> = dir.snapshot().iter().map(|r| r.public_key.as_bytes()[0]).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn parse_allowed_ips_accepts_v4_v6_and_catch_all() {
        let parsed = parse_allowed_ips(&["15.0.0.2/32", "0.0.0.0/0", "fd00::/64"]).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].to_string(), "0.0.0.0/0");
    }

    #[test]
    fn parse_allowed_ips_stops_at_first_bad_entry() {
        let err = parse_allowed_ips(&["15.0.0.2/32", "15.0.0.300/32", "nonsense"]).unwrap_err();
        match err {
            RosterError::InvalidAllowedIp { input, .. } => assert_eq!(input, "15.0.0.300/32"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_allowed_ips_rejects_empty_list() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            parse_allowed_ips(&empty),
            Err(RosterError::InvalidAllowedIp { .. })
        ));
        assert!(parse_allowed_ips(&["15.0.0.2"]).is_err());
    }
}
