//! Privileged side of wgroster.
//!
//! Owns the kernel WireGuard interface for the lifetime of the process and
//! programs the peer roster onto it through `wg(8)`.

#[cfg(not(unix))]
compile_error!("roster_helper is only supported on Unix-like systems");

pub mod daemon;
pub mod gateway;
pub mod lifecycle;
pub mod network;
pub mod status;

pub use gateway::WgCommandGateway;
pub use lifecycle::{DeviceLifecycleManager, DeviceSettings, DeviceSetupError, ManagedDevice};
pub use status::StatusSnapshot;
