//! Directory-facing user records.

use crate::keys::{PresharedKey, PublicKey, SecretKey};
use std::net::Ipv4Addr;

/// A provisioned user. The private key is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub public_key: PublicKey,
    pub preshared_key: PresharedKey,
    pub address: Ipv4Addr,
}

impl UserRecord {
    /// Allowed-IP entry programmed on the device for this user.
    pub fn host_route(&self) -> String {
        format!("{}/32", self.address)
    }
}

/// Returned once from `add_user`; the only place the private key surfaces.
#[derive(Debug)]
pub struct ProvisionedUser {
    pub user: UserRecord,
    pub private_key: SecretKey,
}

/// Users in provisioning order. Usernames may repeat; keys may not.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Vec<UserRecord>,
}

impl UserTable {
    pub fn push(&mut self, user: UserRecord) {
        self.users.push(user);
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<UserRecord> {
        let idx = self.users.iter().position(|user| &user.public_key == key)?;
        Some(self.users.remove(idx))
    }

    pub fn all(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;

    fn user(name: &str, seed: u8, last: u8) -> UserRecord {
        UserRecord {
            username: name.into(),
            public_key: Key::from_bytes([seed; 32]),
            preshared_key: SecretKey::from_bytes([seed; 32]),
            address: Ipv4Addr::new(15, 0, 0, last),
        }
    }

    #[test]
    fn host_route_is_slash_32() {
        assert_eq!(user("alice", 1, 2).host_route(), "15.0.0.2/32");
    }

    #[test]
    fn usernames_may_repeat() {
        let mut table = UserTable::default();
        table.push(user("alice", 1, 2));
        table.push(user("alice", 2, 3));
        assert!(table.all().iter().all(|user| user.username == "alice"));
        assert_eq!(table.len(), 2);

        let removed = table.remove(&Key::from_bytes([1; 32])).unwrap();
        assert_eq!(removed.address, Ipv4Addr::new(15, 0, 0, 2));
        assert_eq!(table.len(), 1);
        assert!(table.remove(&Key::from_bytes([1; 32])).is_none());
    }
}
