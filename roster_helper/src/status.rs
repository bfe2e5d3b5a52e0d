//! Status snapshot the helper publishes for operators.
//!
//! Written as JSON after startup provisioning and reconcile; `rosterctl status`
//! reads it back. Contains no key material beyond public keys.

use ipnet::{IpNet, Ipv4Net};
use roster_core::gateway::DeviceStatus;
use roster_core::keys::PublicKey;
use roster_core::{PeerLifecycleCoordinator, PeerRecord, UserRecord};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub public_key: PublicKey,
    pub has_preshared_key: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(record: &PeerRecord) -> Self {
        Self {
            public_key: record.public_key,
            has_preshared_key: record.preshared_key.is_some(),
            allowed_ips: record.allowed_ips.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub public_key: PublicKey,
    pub address: Ipv4Addr,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            username: user.username.clone(),
            public_key: user.public_key,
            address: user.address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub interface: String,
    pub address: Ipv4Net,
    pub public_key: PublicKey,
    pub listen_port: u16,
    /// Seconds since the Unix epoch.
    pub generated_at: u64,
    pub peers: Vec<PeerSummary>,
    pub users: Vec<UserSummary>,
    /// Live device view; `None` when the status call failed.
    #[serde(default)]
    pub device: Option<DeviceStatus>,
}

/// Identity fields of the device a snapshot describes.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub interface: String,
    pub address: Ipv4Net,
    pub public_key: PublicKey,
    pub listen_port: u16,
}

impl StatusSnapshot {
    pub async fn capture(identity: &DeviceIdentity, coordinator: &PeerLifecycleCoordinator) -> Self {
        let view = coordinator.view().await;
        let device = match view.device {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("device status unavailable: {err}");
                None
            }
        };

        Self {
            interface: identity.interface.clone(),
            address: identity.address,
            public_key: identity.public_key,
            listen_port: identity.listen_port,
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
            peers: view.peers.iter().map(PeerSummary::from).collect(),
            users: view.users.iter().map(UserSummary::from).collect(),
            device,
        }
    }

    /// Directory peers the device did not report.
    pub fn missing_on_device(&self) -> Vec<PublicKey> {
        match &self.device {
            Some(device) => self
                .peers
                .iter()
                .map(|peer| peer.public_key)
                .filter(|key| !device.has_peer(key))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, path)
    }

    pub fn read_from(path: &Path) -> io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
