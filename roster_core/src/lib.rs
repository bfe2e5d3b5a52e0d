//! Peer roster management for a WireGuard tunnel endpoint.
//!
//! This crate holds the key codec, the in-memory peer directory, the device
//! gateway seam and the coordinator that keeps the two in step. Nothing here
//! touches the kernel; the privileged helper supplies a real gateway.

pub mod coordinator;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod ipam;
pub mod keygen;
pub mod keys;
pub mod render;
pub mod users;

// Re-export commonly used types for convenience
pub use coordinator::{
    CoordinatorOptions, PeerLifecycleCoordinator, PeerReceipt, ReconcileReport, RosterView,
};
pub use directory::{PeerDirectory, PeerRecord};
pub use error::{ErrorKind, RosterError, RosterResult};
pub use gateway::{DeviceStatus, GatewayError, InMemoryGateway, PeerStatus, TunnelDeviceGateway};
pub use keys::{Key, KeyError, PresharedKey, PublicKey, SecretKey};
pub use users::{ProvisionedUser, UserRecord};
