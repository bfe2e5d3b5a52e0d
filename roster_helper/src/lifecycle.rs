//! Device bring-up and teardown.
//!
//! Bring-up derives the tunnel address, writes the wg-quick file once, creates
//! the link, programs the device identity and installs forwarding/NAT rules.
//! Anything created along the way is undone if a later step fails. Teardown
//! removes the rules this process installed and deletes the link.

use crate::gateway::WgCommandGateway;
use crate::network::{build_interface_manager, CommandRunner, InterfaceError, InterfaceManager, NatRule};
use ipnet::Ipv4Net;
use roster_core::gateway::GatewayError;
use roster_core::ipam::device_address;
use roster_core::keygen::public_key_for;
use roster_core::keys::{PublicKey, SecretKey};
use roster_core::render::{render_server_config, ServerConfigView};
use roster_core::RosterError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeviceSetupError {
    #[error("Invalid device addressing: {0}")]
    Addressing(#[from] RosterError),

    #[error("Interface setup failed: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Device configuration failed: {0}")]
    Device(#[from] GatewayError),

    #[error("Failed to write {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct NatSettings {
    pub enabled: bool,
    /// Falls back to the interface carrying the default route.
    pub egress_interface: Option<String>,
}

/// Everything needed to bring one tunnel device up.
#[derive(Debug)]
pub struct DeviceSettings {
    pub interface: String,
    pub private_key: SecretKey,
    pub listen_port: u16,
    pub node_index: u16,
    pub subnet: Ipv4Net,
    pub nat: NatSettings,
    /// wg-quick file written on first start; `None` skips it.
    pub config_file: Option<PathBuf>,
}

/// A device this process brought up and is responsible for tearing down.
pub struct ManagedDevice {
    interface: String,
    address: Ipv4Net,
    public_key: PublicKey,
    listen_port: u16,
    gateway: Arc<WgCommandGateway>,
    nat_rules: Vec<NatRule>,
    created: bool,
}

impl ManagedDevice {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn address(&self) -> Ipv4Net {
        self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn gateway(&self) -> Arc<WgCommandGateway> {
        self.gateway.clone()
    }

    /// Rules installed by this bring-up, in installation order.
    pub fn nat_rules(&self) -> &[NatRule] {
        &self.nat_rules
    }

    /// False when an existing link was reused.
    pub fn created_interface(&self) -> bool {
        self.created
    }
}

impl fmt::Debug for ManagedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDevice")
            .field("interface", &self.interface)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("listen_port", &self.listen_port)
            .field("nat_rules", &self.nat_rules.len())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`DeviceLifecycleManager::shut_down`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub rules_removed: usize,
    pub rules_failed: Vec<String>,
    pub interface_deleted: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.rules_failed.is_empty() && self.interface_deleted
    }
}

pub struct DeviceLifecycleManager {
    runner: Arc<dyn CommandRunner>,
    interfaces: Arc<dyn InterfaceManager>,
}

impl DeviceLifecycleManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let interfaces = build_interface_manager(runner.clone());
        Self { runner, interfaces }
    }

    pub async fn bring_up(&self, settings: DeviceSettings) -> Result<ManagedDevice, DeviceSetupError> {
        let address = device_address(settings.subnet, settings.node_index)?;
        let public_key = public_key_for(&settings.private_key);

        if let Some(path) = &settings.config_file {
            let contents = render_server_config(
                &ServerConfigView {
                    private_key: &settings.private_key,
                    address,
                    listen_port: settings.listen_port,
                },
                &[],
            );
            let written = write_config_file_if_absent(path, &contents)
                .await
                .map_err(|source| DeviceSetupError::ConfigFile {
                    path: path.clone(),
                    source,
                })?;
            if written {
                info!(path = %path.display(), "wrote wireguard config file");
            } else {
                debug!(path = %path.display(), "config file already present, leaving it alone");
            }
        }

        let exists = self.interfaces.interface_exists(&settings.interface).await?;
        if exists {
            info!(interface = %settings.interface, "reusing existing interface");
        } else {
            self.interfaces
                .create_wireguard(&settings.interface, address)
                .await?;
        }

        let mut device = ManagedDevice {
            interface: settings.interface.clone(),
            address,
            public_key,
            listen_port: settings.listen_port,
            gateway: Arc::new(WgCommandGateway::new(
                settings.interface.as_str(),
                self.runner.clone(),
            )),
            nat_rules: Vec::new(),
            created: !exists,
        };

        if let Err(err) = self.finish_bring_up(&mut device, &settings).await {
            warn!(interface = %device.interface, "bring-up failed, rolling back: {err}");
            self.roll_back(device).await;
            return Err(err);
        }

        info!(
            interface = %device.interface,
            address = %device.address,
            public_key = %device.public_key,
            listen_port = device.listen_port,
            "device is up"
        );
        Ok(device)
    }

    async fn finish_bring_up(
        &self,
        device: &mut ManagedDevice,
        settings: &DeviceSettings,
    ) -> Result<(), DeviceSetupError> {
        device
            .gateway
            .configure_device(&settings.private_key, settings.listen_port)
            .await?;

        if !settings.nat.enabled {
            return Ok(());
        }

        self.interfaces.ensure_forwarding().await?;
        let egress = match &settings.nat.egress_interface {
            Some(egress) => egress.clone(),
            None => self.interfaces.default_egress_interface().await?,
        };

        for rule in [
            NatRule::forward_in(&device.interface),
            NatRule::forward_out(&device.interface),
            NatRule::masquerade(&egress),
        ] {
            if self.interfaces.ensure_nat_rule(&rule).await? {
                device.nat_rules.push(rule);
            }
        }
        Ok(())
    }

    async fn roll_back(&self, device: ManagedDevice) {
        device.gateway.close();
        for rule in device.nat_rules.iter().rev() {
            if let Err(err) = self.interfaces.remove_nat_rule(rule).await {
                warn!(%rule, "rollback could not remove rule: {err}");
            }
        }
        if device.created {
            if let Err(err) = self.interfaces.delete_interface(&device.interface).await {
                warn!(interface = %device.interface, "rollback could not delete interface: {err}");
            }
        }
    }

    /// Close the gateway, remove installed rules in reverse order and delete
    /// the link. Every step is attempted regardless of earlier failures.
    pub async fn shut_down(&self, device: ManagedDevice) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        device.gateway.close();

        for rule in device.nat_rules.iter().rev() {
            match self.interfaces.remove_nat_rule(rule).await {
                Ok(()) => report.rules_removed += 1,
                Err(err) => report.rules_failed.push(format!("{rule}: {err}")),
            }
        }

        match self.interfaces.delete_interface(&device.interface).await {
            Ok(()) => report.interface_deleted = true,
            Err(err) => warn!(interface = %device.interface, "failed to delete interface: {err}"),
        }

        info!(
            interface = %device.interface,
            rules_removed = report.rules_removed,
            rules_failed = report.rules_failed.len(),
            "device torn down"
        );
        report
    }
}

/// Create `path` with mode 0600 holding `contents`. Returns false without
/// touching anything when the file already exists.
pub async fn write_config_file_if_absent(path: &Path, contents: &str) -> io::Result<bool> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = match options.open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    };
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(true)
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_termination() -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    Ok(())
}
