//! Control-plane seam between the coordinator and the tunnel device.
//!
//! The coordinator never talks to the kernel directly. It issues
//! configuration deltas through [`TunnelDeviceGateway`] and treats every call
//! as synchronous, at-most-once and fallible. The privileged helper provides
//! the real implementation; [`InMemoryGateway`] simulates a device for tests
//! and dry runs.

use crate::directory::PeerRecord;
use crate::keys::{Key, PublicKey};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by gateway implementations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("device {interface} rejected the update: {message}")]
    Rejected { interface: String, message: String },

    #[error("device call timed out after {0:?}; device-side outcome unknown")]
    Timeout(Duration),

    #[error("I/O error talking to device: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected device status output: {0}")]
    Status(String),

    #[error("device handle is closed")]
    Closed,
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Live state of one peer as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public_key: PublicKey,
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    /// Seconds since the Unix epoch of the latest handshake, if any.
    #[serde(default)]
    pub latest_handshake: Option<u64>,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

impl PeerStatus {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            latest_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }
}

/// Device identity plus the ordered peer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub interface: String,
    pub public_key: Option<PublicKey>,
    pub listen_port: Option<u16>,
    pub peers: Vec<PeerStatus>,
}

impl DeviceStatus {
    pub fn has_peer(&self, key: &PublicKey) -> bool {
        self.peers.iter().any(|peer| &peer.public_key == key)
    }
}

/// Operations the coordinator needs from the tunnel device.
#[async_trait]
pub trait TunnelDeviceGateway: Send + Sync {
    /// Add the peer, or replace its preshared key and allowed IPs.
    async fn apply_peer_upsert(&self, peer: &PeerRecord) -> GatewayResult<()>;

    /// Remove the peer. Removing an unknown peer is not an error.
    async fn apply_peer_removal(&self, key: &PublicKey) -> GatewayResult<()>;

    /// Device identity and current peers.
    async fn current_status(&self) -> GatewayResult<DeviceStatus>;
}

/// One call observed by [`InMemoryGateway`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Upsert(PublicKey),
    Removal(PublicKey),
    Status,
}

#[derive(Debug, Default)]
struct MemoryDevice {
    peers: Vec<PeerStatus>,
    calls: Vec<GatewayCall>,
    fail_next_upsert: Option<String>,
    fail_next_removal: Option<String>,
    fail_next_status: Option<String>,
}

/// Simulated tunnel device that keeps its peer list in memory.
#[derive(Debug)]
pub struct InMemoryGateway {
    interface: String,
    public_key: Option<Key>,
    listen_port: Option<u16>,
    latency: Option<Duration>,
    device: Mutex<MemoryDevice>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            public_key: None,
            listen_port: None,
            latency: None,
            device: Mutex::new(MemoryDevice::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_identity(mut self, public_key: Key, listen_port: u16) -> Self {
        self.public_key = Some(public_key);
        self.listen_port = Some(listen_port);
        self
    }

    /// Make every call wait before touching the device, to widen race windows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_next_upsert(&self, message: impl Into<String>) {
        self.lock().fail_next_upsert = Some(message.into());
    }

    pub fn fail_next_removal(&self, message: impl Into<String>) {
        self.lock().fail_next_removal = Some(message.into());
    }

    pub fn fail_next_status(&self, message: impl Into<String>) {
        self.lock().fail_next_status = Some(message.into());
    }

    /// Put a peer on the device behind the roster's back.
    pub fn inject_device_peer(&self, status: PeerStatus) {
        let mut device = self.lock();
        device.peers.retain(|peer| peer.public_key != status.public_key);
        device.peers.push(status);
    }

    /// Drop a peer from the device behind the roster's back.
    pub fn forget_device_peer(&self, key: &PublicKey) {
        self.lock().peers.retain(|peer| &peer.public_key != key);
    }

    pub fn device_peers(&self) -> Vec<PublicKey> {
        self.lock().peers.iter().map(|peer| peer.public_key).collect()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    pub fn upsert_calls(&self) -> usize {
        self.count(|call| matches!(call, GatewayCall::Upsert(_)))
    }

    pub fn removal_calls(&self) -> usize {
        self.count(|call| matches!(call, GatewayCall::Removal(_)))
    }

    pub fn status_calls(&self) -> usize {
        self.count(|call| matches!(call, GatewayCall::Status))
    }

    /// Highest number of calls ever observed in progress at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn count(&self, pred: impl Fn(&GatewayCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| pred(call)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, call: GatewayCall) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.lock().calls.push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn rejected(&self, message: String) -> GatewayError {
        GatewayError::Rejected {
            interface: self.interface.clone(),
            message,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelDeviceGateway for InMemoryGateway {
    async fn apply_peer_upsert(&self, peer: &PeerRecord) -> GatewayResult<()> {
        let _guard = self.enter(GatewayCall::Upsert(peer.public_key)).await;
        let mut device = self.lock();
        if let Some(message) = device.fail_next_upsert.take() {
            return Err(self.rejected(message));
        }
        let position = device
            .peers
            .iter()
            .position(|existing| existing.public_key == peer.public_key);
        match position {
            Some(idx) => device.peers[idx].allowed_ips = peer.allowed_ips.clone(),
            None => {
                let mut status = PeerStatus::new(peer.public_key);
                status.allowed_ips = peer.allowed_ips.clone();
                device.peers.push(status);
            }
        }
        Ok(())
    }

    async fn apply_peer_removal(&self, key: &PublicKey) -> GatewayResult<()> {
        let _guard = self.enter(GatewayCall::Removal(*key)).await;
        let mut device = self.lock();
        if let Some(message) = device.fail_next_removal.take() {
            return Err(self.rejected(message));
        }
        device.peers.retain(|peer| &peer.public_key != key);
        Ok(())
    }

    async fn current_status(&self) -> GatewayResult<DeviceStatus> {
        let _guard = self.enter(GatewayCall::Status).await;
        let mut device = self.lock();
        if let Some(message) = device.fail_next_status.take() {
            return Err(GatewayError::Status(message));
        }
        Ok(DeviceStatus {
            interface: self.interface.clone(),
            public_key: self.public_key,
            listen_port: self.listen_port,
            peers: device.peers.clone(),
        })
    }
}
