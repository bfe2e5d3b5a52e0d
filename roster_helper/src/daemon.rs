//! Helper daemon: bring the device up, provision the configured roster, wait
//! for a termination signal, tear everything down.

use crate::lifecycle::{
    wait_for_termination, DeviceLifecycleManager, DeviceSettings, ManagedDevice, NatSettings,
};
use crate::network::SystemCommandRunner;
use crate::status::{DeviceIdentity, StatusSnapshot};
use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use roster_core::gateway::{InMemoryGateway, TunnelDeviceGateway};
use roster_core::ipam::device_address;
use roster_core::keygen::public_key_for;
use roster_core::keys::{PublicKey, SecretKey};
use roster_core::render::{render_client_config, ClientConfigView, DEFAULT_PERSISTENT_KEEPALIVE};
use roster_core::{CoordinatorOptions, PeerLifecycleCoordinator, ProvisionedUser};
use shared_utils::config::Config;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Runtime switches that do not live in the config file.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Drive an in-memory device instead of the kernel.
    pub dry_run: bool,
    /// Where to publish the JSON status snapshot.
    pub status_file: Option<PathBuf>,
    /// How often the status snapshot is rewritten.
    pub status_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            status_file: None,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

/// Counts from provisioning the `[[peers]]` and `[[users]]` tables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub peers_added: usize,
    pub peers_failed: usize,
    pub users_added: usize,
    pub users_failed: usize,
}

/// Device side of a running daemon.
enum Device {
    Managed(ManagedDevice),
    Simulated,
}

pub async fn run(config: Config, options: DaemonOptions) -> Result<()> {
    let private_key = SecretKey::from_base64(&config.device.resolve_private_key()?)
        .context("device private key is not valid base64")?;
    let subnet = config.device.subnet()?;
    let address = device_address(subnet, config.device.node_index)?;
    let identity = DeviceIdentity {
        interface: config.device.interface.clone(),
        address,
        public_key: public_key_for(&private_key),
        listen_port: config.device.listen_port,
    };

    let lifecycle = DeviceLifecycleManager::new(Arc::new(SystemCommandRunner));
    let (device, gateway) = if options.dry_run {
        info!(interface = %identity.interface, "dry run: using an in-memory device");
        let gateway: Arc<dyn TunnelDeviceGateway> = Arc::new(
            InMemoryGateway::new(identity.interface.as_str())
                .with_identity(identity.public_key, identity.listen_port),
        );
        (Device::Simulated, gateway)
    } else {
        let managed = lifecycle
            .bring_up(device_settings(&config, private_key, subnet))
            .await
            .context("failed to bring up the tunnel device")?;
        let gateway: Arc<dyn TunnelDeviceGateway> = managed.gateway();
        (Device::Managed(managed), gateway)
    };

    let coordinator = PeerLifecycleCoordinator::new(
        gateway,
        coordinator_options(&config, subnet, address),
    );

    let summary = provision(&coordinator, &config, identity.public_key).await;
    info!(
        peers_added = summary.peers_added,
        peers_failed = summary.peers_failed,
        users_added = summary.users_added,
        users_failed = summary.users_failed,
        "roster provisioned"
    );

    match coordinator.reconcile().await {
        Ok(report) if report.is_converged() => info!(
            reapplied = report.reapplied.len(),
            pruned = report.pruned.len(),
            unknown = report.unknown.len(),
            "device reconciled"
        ),
        Ok(report) => warn!(failed = report.failed.len(), "device only partially reconciled"),
        Err(err) => warn!("reconcile failed: {err}"),
    }

    publish_status(&identity, &coordinator, options.status_file.as_deref()).await;

    let waited = match options.status_file.as_deref() {
        Some(path) => {
            refresh_status_until(
                &identity,
                &coordinator,
                path,
                options.status_interval,
                wait_for_termination(),
            )
            .await
        }
        None => wait_for_termination().await,
    };

    if let Device::Managed(managed) = device {
        let report = lifecycle.shut_down(managed).await;
        if !report.is_clean() {
            warn!(failed_rules = ?report.rules_failed, "teardown left state behind");
        }
    }
    if let Some(path) = &options.status_file {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), "failed to remove status file: {err}");
            }
        }
    }

    waited.context("failed to install signal handlers")?;
    info!("Helper shut down cleanly");
    Ok(())
}

fn device_settings(config: &Config, private_key: SecretKey, subnet: Ipv4Net) -> DeviceSettings {
    DeviceSettings {
        interface: config.device.interface.clone(),
        private_key,
        listen_port: config.device.listen_port,
        node_index: config.device.node_index,
        subnet,
        nat: NatSettings {
            enabled: config.nat.enabled,
            egress_interface: config.nat.egress_interface.clone(),
        },
        config_file: config
            .device
            .write_config_file
            .then(|| config.device.config_file_path()),
    }
}

pub fn coordinator_options(config: &Config, subnet: Ipv4Net, address: Ipv4Net) -> CoordinatorOptions {
    CoordinatorOptions {
        verify_after_apply: config.coordinator.verify_after_apply,
        gateway_timeout: config.coordinator.gateway_timeout(),
        prune_unknown_peers: config.coordinator.prune_unknown_peers,
        subnet,
        reserved: vec![address.addr()],
    }
}

/// Add every configured peer and user. Failures are logged and counted; one
/// bad entry does not stop the rest.
pub async fn provision(
    coordinator: &PeerLifecycleCoordinator,
    config: &Config,
    server_public_key: PublicKey,
) -> ProvisionSummary {
    let mut summary = ProvisionSummary::default();

    for peer in &config.peers {
        match coordinator
            .add_peer(&peer.public_key, peer.preshared_key.as_deref(), &peer.allowed_ips)
            .await
        {
            Ok(_) => summary.peers_added += 1,
            Err(err) => {
                summary.peers_failed += 1;
                error!(peer = %peer.public_key, kind = err.label(), "failed to add configured peer: {err}");
            }
        }
    }

    let client_dir = config.device.client_config_dir.as_deref().map(Path::new);
    for user in &config.users {
        let provisioned = match coordinator.add_user(&user.name).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                summary.users_failed += 1;
                error!(username = %user.name, kind = err.label(), "failed to provision user: {err}");
                continue;
            }
        };
        summary.users_added += 1;

        if let Some(dir) = client_dir {
            let view = ClientConfigView {
                user: &provisioned,
                server_public_key,
                endpoint: config.device.endpoint.clone(),
                allowed_ips: vec![IpNet::V4(coordinator.options().subnet)],
                persistent_keepalive: Some(DEFAULT_PERSISTENT_KEEPALIVE),
            };
            let path = client_config_path(dir, &provisioned);
            match write_client_config(&path, &render_client_config(&view)).await {
                Ok(()) => info!(username = %user.name, path = %path.display(), "wrote client config"),
                Err(err) => warn!(username = %user.name, path = %path.display(), "failed to write client config: {err}"),
            }
        }
    }

    summary
}

/// `<dir>/<username>.conf`
pub fn client_config_path(dir: &Path, provisioned: &ProvisionedUser) -> PathBuf {
    dir.join(format!("{}.conf", provisioned.user.username))
}

/// Replace `path` with `contents`, readable by the owner only.
async fn write_client_config(path: &Path, contents: &str) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await
}

async fn publish_status(
    identity: &DeviceIdentity,
    coordinator: &PeerLifecycleCoordinator,
    path: Option<&Path>,
) {
    let snapshot = StatusSnapshot::capture(identity, coordinator).await;
    info!(
        interface = %snapshot.interface,
        public_key = %snapshot.public_key,
        listen_port = snapshot.listen_port,
        peers = snapshot.peers.len(),
        users = snapshot.users.len(),
        "device status"
    );
    let missing = snapshot.missing_on_device();
    if !missing.is_empty() {
        warn!(?missing, "directory peers absent from the device");
    }

    if let Some(path) = path {
        if let Err(err) = snapshot.write_to(path) {
            warn!(path = %path.display(), "failed to write status file: {err}");
        }
    }
}

/// Rewrite the status file every `period` until `shutdown` resolves.
async fn refresh_status_until(
    identity: &DeviceIdentity,
    coordinator: &PeerLifecycleCoordinator,
    path: &Path,
    period: Duration,
    shutdown: impl Future<Output = io::Result<()>>,
) -> io::Result<()> {
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick is immediate and the startup snapshot is already on disk
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown => return result,
            _ = ticker.tick() => {
                let snapshot = StatusSnapshot::capture(identity, coordinator).await;
                match snapshot.write_to(path) {
                    Ok(()) => debug!(path = %path.display(), peers = snapshot.peers.len(), "status refreshed"),
                    Err(err) => warn!(path = %path.display(), "failed to refresh status file: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::gateway::InMemoryGateway;
    use shared_utils::config::{PeerConfig, UserConfig};

    const PEER: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    fn config_with_roster(client_dir: Option<&Path>) -> Config {
        let mut config = Config::default();
        config.device.private_key = Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string());
        config.device.endpoint = Some("vpn.example.net:51820".to_string());
        config.device.client_config_dir = client_dir.map(|dir| dir.display().to_string());
        config.peers = vec![
            PeerConfig {
                public_key: PEER.to_string(),
                preshared_key: None,
                allowed_ips: vec!["10.8.0.0/16".to_string()],
            },
            PeerConfig {
                public_key: "not-a-key".to_string(),
                preshared_key: None,
                allowed_ips: vec!["10.9.0.0/16".to_string()],
            },
        ];
        config.users = vec![
            UserConfig { name: "alice".to_string() },
            UserConfig { name: "bob".to_string() },
        ];
        config
    }

    fn coordinator(config: &Config) -> (Arc<InMemoryGateway>, PeerLifecycleCoordinator) {
        let subnet = config.device.subnet().unwrap();
        let address = device_address(subnet, config.device.node_index).unwrap();
        let gateway = Arc::new(InMemoryGateway::new("wg0"));
        let coordinator =
            PeerLifecycleCoordinator::new(gateway.clone(), coordinator_options(config, subnet, address));
        (gateway, coordinator)
    }

    #[tokio::test]
    async fn provisioning_skips_bad_entries() {
        let config = config_with_roster(None);
        let (gateway, coordinator) = coordinator(&config);

        let summary = provision(&coordinator, &config, PublicKey::from_bytes([1; 32])).await;
        assert_eq!(
            summary,
            ProvisionSummary {
                peers_added: 1,
                peers_failed: 1,
                users_added: 2,
                users_failed: 0,
            }
        );
        assert_eq!(gateway.device_peers().len(), 3);

        let users = coordinator.users().await;
        assert_eq!(users[0].address.to_string(), "15.0.0.2");
        assert_eq!(users[1].address.to_string(), "15.0.0.3");
    }

    #[tokio::test]
    async fn device_address_is_never_leased() {
        let mut config = config_with_roster(None);
        config.device.node_index = 2;
        config.peers.clear();
        let (_gateway, coordinator) = coordinator(&config);

        provision(&coordinator, &config, PublicKey::from_bytes([1; 32])).await;
        let users = coordinator.users().await;
        assert_eq!(users[0].address.to_string(), "15.0.0.3");
        assert_eq!(users[1].address.to_string(), "15.0.0.4");
    }

    #[tokio::test]
    async fn client_configs_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_roster(Some(dir.path()));
        let (_gateway, coordinator) = coordinator(&config);
        let server = PublicKey::from_bytes([7; 32]);

        provision(&coordinator, &config, server).await;

        let alice = std::fs::read_to_string(dir.path().join("alice.conf")).unwrap();
        assert!(alice.contains("Address = 15.0.0.2/32"));
        assert!(alice.contains(&format!("PublicKey = {server}")));
        assert!(alice.contains("Endpoint = vpn.example.net:51820"));
        assert!(alice.contains("AllowedIPs = 15.0.0.0/24"));
        assert!(alice.contains("PersistentKeepalive = 25"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("bob.conf"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn status_file_follows_roster_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let config = config_with_roster(None);
        let (_gateway, coordinator) = coordinator(&config);
        let coordinator = Arc::new(coordinator);
        let identity = DeviceIdentity {
            interface: "wg0".to_string(),
            address: "15.0.0.1/24".parse().unwrap(),
            public_key: PublicKey::from_bytes([7; 32]),
            listen_port: 51820,
        };
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let refresher = {
            let coordinator = coordinator.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let shutdown = async {
                    let _ = stop_rx.await;
                    Ok::<(), io::Error>(())
                };
                refresh_status_until(&identity, &coordinator, &path, Duration::from_millis(10), shutdown)
                    .await
            })
        };

        coordinator.add_peer(PEER, None, &["10.8.0.0/16"]).await.unwrap();
        let mut seen = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(snapshot) = StatusSnapshot::read_from(&path) {
                if snapshot.peers.len() == 1 {
                    seen = true;
                    break;
                }
            }
        }

        stop_tx.send(()).unwrap();
        refresher.await.unwrap().unwrap();
        assert!(seen, "status file never picked up the new peer");
    }

    #[test]
    fn settings_follow_config() {
        let mut config = config_with_roster(None);
        config.nat.egress_interface = Some("eth1".to_string());
        config.device.write_config_file = false;
        let subnet = config.device.subnet().unwrap();
        let key = SecretKey::from_bytes([5; 32]);

        let settings = device_settings(&config, key, subnet);
        assert_eq!(settings.interface, "wg0");
        assert_eq!(settings.listen_port, 51820);
        assert!(settings.config_file.is_none());
        assert_eq!(settings.nat.egress_interface.as_deref(), Some("eth1"));

        config.device.write_config_file = true;
        let settings = device_settings(&config, SecretKey::from_bytes([5; 32]), subnet);
        assert_eq!(
            settings.config_file,
            Some(PathBuf::from("/etc/wireguard/wg0.conf"))
        );
    }
}
