//! Peer lifecycle coordinator.
//!
//! All roster mutations run under one lock that stays held across the device
//! call, so peer additions and removals reach the device and the directory in
//! a single total order. The device is always updated before the directory:
//! a failed device call leaves the directory untouched, and the directory is
//! never ahead of the device.

use crate::directory::{parse_allowed_ips, PeerDirectory, PeerRecord};
use crate::error::{RosterError, RosterResult};
use crate::gateway::{DeviceStatus, GatewayError, GatewayResult, TunnelDeviceGateway};
use crate::ipam::{AddressPool, DEFAULT_SUBNET};
use crate::keygen::{generate_preshared_key, KeyPair};
use crate::keys::{Key, PublicKey, SecretKey};
use crate::users::{ProvisionedUser, UserRecord, UserTable};
use ipnet::{IpNet, Ipv4Net};
use metrics::{counter, gauge};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const METRIC_PEERS: &str = "wgroster_peers";
const METRIC_PEER_OPS_TOTAL: &str = "wgroster_peer_ops_total";

/// Tunables for [`PeerLifecycleCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Re-read device status after each addition.
    pub verify_after_apply: bool,
    /// Upper bound for a single device call. Expiry is reported as a device
    /// error with unknown outcome and is never retried.
    pub gateway_timeout: Option<Duration>,
    /// Let [`PeerLifecycleCoordinator::reconcile`] remove device peers the
    /// directory does not know about.
    pub prune_unknown_peers: bool,
    /// Subnet user addresses are allocated from.
    pub subnet: Ipv4Net,
    /// Addresses never handed to users (the device's own address).
    pub reserved: Vec<Ipv4Addr>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            verify_after_apply: true,
            gateway_timeout: None,
            prune_unknown_peers: false,
            subnet: DEFAULT_SUBNET.parse().unwrap_or_default(),
            reserved: Vec::new(),
        }
    }
}

/// Result of a successful addition.
#[derive(Debug, Clone)]
pub struct PeerReceipt {
    pub record: PeerRecord,
    /// Device status read back after the upsert; `None` when verification is
    /// disabled or the status call failed.
    pub device_status: Option<DeviceStatus>,
}

/// Outcome of [`PeerLifecycleCoordinator::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Directory peers that were missing on the device and re-applied.
    pub reapplied: Vec<PublicKey>,
    /// Device peers unknown to the directory that were removed.
    pub pruned: Vec<PublicKey>,
    /// Device peers unknown to the directory that were left in place.
    pub unknown: Vec<PublicKey>,
    /// Repairs the device refused.
    pub failed: Vec<(PublicKey, String)>,
}

impl ReconcileReport {
    /// True when the directory's peer set is a subset of the device's after
    /// this pass.
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Directory, users and device status read under one lock acquisition.
#[derive(Debug)]
pub struct RosterView {
    pub peers: Vec<PeerRecord>,
    pub users: Vec<UserRecord>,
    pub device: GatewayResult<DeviceStatus>,
}

#[derive(Debug)]
struct RosterState {
    directory: PeerDirectory,
    users: UserTable,
    pool: AddressPool,
}

/// Serializes peer roster changes against one shared tunnel device.
pub struct PeerLifecycleCoordinator {
    gateway: Arc<dyn TunnelDeviceGateway>,
    state: Mutex<RosterState>,
    options: CoordinatorOptions,
}

impl PeerLifecycleCoordinator {
    pub fn new(gateway: Arc<dyn TunnelDeviceGateway>, options: CoordinatorOptions) -> Self {
        let pool = AddressPool::new(options.subnet, options.reserved.iter().copied());
        Self {
            gateway,
            state: Mutex::new(RosterState {
                directory: PeerDirectory::new(),
                users: UserTable::default(),
                pool,
            }),
            options,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Provision a peer on the device and record it in the directory.
    ///
    /// Input is fully validated before the lock is taken, so malformed keys
    /// or ranges never reach the device.
    pub async fn add_peer<S: AsRef<str>>(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[S],
    ) -> RosterResult<PeerReceipt> {
        let result: RosterResult<PeerReceipt> = async {
            let public_key = Key::from_base64(public_key)?;
            let preshared_key = preshared_key.map(SecretKey::from_base64).transpose()?;
            let allowed_ips = parse_allowed_ips(allowed_ips)?;
            let record = PeerRecord::new(public_key, preshared_key, allowed_ips);

            let mut state = self.state.lock().await;
            self.commit_peer(&mut state, record).await
        }
        .await;
        record_outcome("add_peer", &result);
        result
    }

    /// Deprovision a peer. Unknown keys succeed with `None` once the device
    /// call has succeeded.
    pub async fn remove_peer(&self, public_key: &str) -> RosterResult<Option<PeerRecord>> {
        let result: RosterResult<Option<PeerRecord>> = async {
            let key = Key::from_base64(public_key)?;
            let mut state = self.state.lock().await;
            let (record, _) = self.retire_peer(&mut state, &key).await?;
            Ok(record)
        }
        .await;
        record_outcome("remove_peer", &result);
        result
    }

    /// Generate keys and an address for a new user and provision it.
    ///
    /// The returned private key is not kept anywhere else.
    pub async fn add_user(&self, username: &str) -> RosterResult<ProvisionedUser> {
        let result: RosterResult<ProvisionedUser> = async {
            let keypair = KeyPair::generate();
            let preshared_key = generate_preshared_key();
            let public_key = *keypair.public_key();

            let mut state = self.state.lock().await;
            if state.directory.contains(&public_key) {
                return Err(RosterError::DuplicateKey(public_key));
            }
            let address = state.pool.allocate(public_key)?;
            let record = PeerRecord::new(
                public_key,
                Some(preshared_key.clone()),
                vec![IpNet::V4(Ipv4Net::from(address))],
            );

            if let Err(err) = self.commit_peer(&mut state, record).await {
                state.pool.release_owner(&public_key);
                return Err(err);
            }

            let user = UserRecord {
                username: username.to_string(),
                public_key,
                preshared_key,
                address,
            };
            state.users.push(user.clone());
            info!(username, peer = %public_key, %address, "user provisioned");
            Ok(ProvisionedUser {
                user,
                private_key: keypair.into_private_key(),
            })
        }
        .await;
        record_outcome("add_user", &result);
        result
    }

    /// Remove a user's peer from the device and the directory.
    pub async fn remove_user(&self, public_key: &str) -> RosterResult<Option<UserRecord>> {
        let result: RosterResult<Option<UserRecord>> = async {
            let key = Key::from_base64(public_key)?;
            let mut state = self.state.lock().await;
            let (_, user) = self.retire_peer(&mut state, &key).await?;
            Ok(user)
        }
        .await;
        record_outcome("remove_user", &result);
        result
    }

    /// Explicit lookup; absence is [`RosterError::UnknownKey`].
    pub async fn peer(&self, public_key: &str) -> RosterResult<PeerRecord> {
        let key = Key::from_base64(public_key)?;
        self.lookup(&key).await.ok_or(RosterError::UnknownKey(key))
    }

    pub async fn lookup(&self, key: &PublicKey) -> Option<PeerRecord> {
        self.state.lock().await.directory.lookup(key).cloned()
    }

    /// Directory contents in insertion order.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.state.lock().await.directory.snapshot()
    }

    pub async fn users(&self) -> Vec<UserRecord> {
        self.state.lock().await.users.all().to_vec()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.directory.len()
    }

    /// Current device status, for operators. Not used for correctness.
    pub async fn status(&self) -> RosterResult<DeviceStatus> {
        let _state = self.state.lock().await;
        Ok(self.guarded(self.gateway.current_status()).await?)
    }

    /// Directory, users and device status as of one point in the mutation
    /// order.
    pub async fn view(&self) -> RosterView {
        let state = self.state.lock().await;
        let device = self.guarded(self.gateway.current_status()).await;
        RosterView {
            peers: state.directory.snapshot(),
            users: state.users.all().to_vec(),
            device,
        }
    }

    /// Compare the directory with the device and repair divergence.
    pub async fn reconcile(&self) -> RosterResult<ReconcileReport> {
        let state = self.state.lock().await;
        let status = self.guarded(self.gateway.current_status()).await?;
        let mut report = ReconcileReport::default();

        for record in state.directory.snapshot() {
            if status.has_peer(&record.public_key) {
                continue;
            }
            warn!(peer = %record.public_key, "peer missing on device, re-applying");
            match self.guarded(self.gateway.apply_peer_upsert(&record)).await {
                Ok(()) => report.reapplied.push(record.public_key),
                Err(err) => report.failed.push((record.public_key, err.to_string())),
            }
        }

        for peer in &status.peers {
            if state.directory.contains(&peer.public_key) {
                continue;
            }
            if !self.options.prune_unknown_peers {
                debug!(peer = %peer.public_key, "device peer not in directory, leaving it");
                report.unknown.push(peer.public_key);
                continue;
            }
            warn!(peer = %peer.public_key, "pruning device peer not in directory");
            match self
                .guarded(self.gateway.apply_peer_removal(&peer.public_key))
                .await
            {
                Ok(()) => report.pruned.push(peer.public_key),
                Err(err) => report.failed.push((peer.public_key, err.to_string())),
            }
        }

        info!(
            interface = %status.interface,
            reapplied = report.reapplied.len(),
            pruned = report.pruned.len(),
            unknown = report.unknown.len(),
            failed = report.failed.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    async fn commit_peer(
        &self,
        state: &mut RosterState,
        record: PeerRecord,
    ) -> RosterResult<PeerReceipt> {
        if state.directory.contains(&record.public_key) {
            return Err(RosterError::DuplicateKey(record.public_key));
        }
        check_host_routes(state, &record)?;

        self.guarded(self.gateway.apply_peer_upsert(&record))
            .await
            .map_err(|err| {
                warn!(peer = %record.public_key, "device rejected peer upsert: {err}");
                RosterError::DeviceConfig(err)
            })?;

        if let Err(err) = state.directory.insert(record.clone()) {
            error!(peer = %record.public_key, "directory insert failed after device upsert: {err}");
            return Err(RosterError::Invariant(format!(
                "directory insert failed under lock: {err}"
            )));
        }

        for net in &record.allowed_ips {
            if let IpNet::V4(v4) = net {
                if v4.prefix_len() == 32 {
                    state.pool.claim(v4.addr(), record.public_key);
                }
            }
        }
        gauge!(METRIC_PEERS, state.directory.len() as f64);
        info!(
            peer = %record.public_key,
            allowed_ips = ?record.allowed_ips,
            "peer provisioned"
        );

        let device_status = if self.options.verify_after_apply {
            self.verify_present(&record.public_key).await
        } else {
            None
        };

        Ok(PeerReceipt {
            record,
            device_status,
        })
    }

    async fn retire_peer(
        &self,
        state: &mut RosterState,
        key: &PublicKey,
    ) -> RosterResult<(Option<PeerRecord>, Option<UserRecord>)> {
        self.guarded(self.gateway.apply_peer_removal(key))
            .await
            .map_err(|err| {
                warn!(peer = %key, "device peer removal failed, device state unknown: {err}");
                RosterError::DeviceConfig(err)
            })?;

        let record = match state.directory.remove(key) {
            Ok(record) => Some(record),
            Err(RosterError::UnknownKey(_)) => {
                debug!(peer = %key, "removed peer was not in the directory");
                None
            }
            Err(err) => {
                error!(peer = %key, "directory removal failed after device removal: {err}");
                return Err(err);
            }
        };
        let user = state.users.remove(key);
        state.pool.release_owner(key);
        gauge!(METRIC_PEERS, state.directory.len() as f64);
        info!(peer = %key, known = record.is_some(), "peer removed");
        Ok((record, user))
    }

    async fn verify_present(&self, key: &PublicKey) -> Option<DeviceStatus> {
        match self.guarded(self.gateway.current_status()).await {
            Ok(status) => {
                if !status.has_peer(key) {
                    warn!(peer = %key, interface = %status.interface, "device does not list peer after upsert");
                }
                Some(status)
            }
            Err(err) => {
                warn!(peer = %key, "post-apply status check failed: {err}");
                None
            }
        }
    }

    async fn guarded<T>(
        &self,
        call: impl Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        match self.options.gateway_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| GatewayError::Timeout(limit))?,
            None => call.await,
        }
    }
}

/// Reject host routes the device would move away from another peer.
///
/// WireGuard routes an address to the last peer configured with it, so a
/// second peer holding the same host route silently steals it.
fn check_host_routes(state: &RosterState, record: &PeerRecord) -> RosterResult<()> {
    for net in record.allowed_ips.iter().filter(|net| net.prefix_len() == net.max_prefix_len()) {
        let owner = match net {
            IpNet::V4(v4) if state.pool.is_reserved(v4.addr()) => {
                return Err(RosterError::InvalidAllowedIp {
                    input: net.to_string(),
                    reason: "address reserved for the device".to_string(),
                });
            }
            IpNet::V4(v4) => state.pool.holder(v4.addr()),
            IpNet::V6(_) => None,
        };
        let owner = owner.or_else(|| {
            state
                .directory
                .snapshot()
                .into_iter()
                .find(|peer| peer.allowed_ips.contains(net))
                .map(|peer| peer.public_key)
        });
        if let Some(owner) = owner.filter(|owner| *owner != record.public_key) {
            return Err(RosterError::InvalidAllowedIp {
                input: net.to_string(),
                reason: format!("address leased to {owner}"),
            });
        }
    }
    Ok(())
}

fn record_outcome<T>(op: &'static str, result: &RosterResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.label(),
    };
    counter!(METRIC_PEER_OPS_TOTAL, 1, "op" => op, "outcome" => outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gateway::{GatewayCall, InMemoryGateway, PeerStatus};

    const ALICE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PSK: &str = "GnM6T3zWW2eW7WqD0DyXv8c5J4tRk6fjC2WkcGHE4mI=";

    fn coordinator() -> (Arc<InMemoryGateway>, PeerLifecycleCoordinator) {
        let gateway = Arc::new(InMemoryGateway::new("wg-test"));
        let coordinator = PeerLifecycleCoordinator::new(gateway.clone(), CoordinatorOptions::default());
        (gateway, coordinator)
    }

    #[tokio::test]
    async fn add_peer_records_exact_fields() {
        let (gateway, coordinator) = coordinator();
        let receipt = coordinator
            .add_peer(ALICE, Some(PSK), &["15.0.0.2/32"])
            .await
            .unwrap();
        assert!(receipt.device_status.unwrap().has_peer(&receipt.record.public_key));

        let stored = coordinator.peer(ALICE).await.unwrap();
        assert_eq!(stored.public_key.to_base64(), ALICE);
        assert_eq!(stored.preshared_key.unwrap().expose_base64(), PSK);
        assert_eq!(stored.allowed_ips, vec!["15.0.0.2/32".parse::<IpNet>().unwrap()]);
        assert_eq!(gateway.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn failed_upsert_leaves_directory_unchanged() {
        let (gateway, coordinator) = coordinator();
        gateway.fail_next_upsert("EPERM");
        let err = coordinator
            .add_peer(ALICE, None, &["15.0.0.2/32"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceConfig);
        assert_eq!(coordinator.peer_count().await, 0);

        coordinator.add_peer(ALICE, None, &["15.0.0.2/32"]).await.unwrap();
        assert_eq!(coordinator.peer_count().await, 1);
    }

    #[tokio::test]
    async fn failed_status_check_does_not_roll_back() {
        let (gateway, coordinator) = coordinator();
        gateway.fail_next_status("device busy");
        let receipt = coordinator
            .add_peer(ALICE, None, &["15.0.0.2/32"])
            .await
            .unwrap();
        assert!(receipt.device_status.is_none());
        assert_eq!(coordinator.peer_count().await, 1);
        assert_eq!(gateway.device_peers().len(), 1);
    }

    #[tokio::test]
    async fn failed_removal_keeps_directory_entry() {
        let (gateway, coordinator) = coordinator();
        coordinator.add_peer(ALICE, None, &["15.0.0.2/32"]).await.unwrap();
        gateway.fail_next_removal("EBUSY");

        let err = coordinator.remove_peer(ALICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceConfig);
        assert!(coordinator.peer(ALICE).await.is_ok());
    }

    #[tokio::test]
    async fn explicit_lookup_reports_unknown_key() {
        let (_, coordinator) = coordinator();
        let err = coordinator.peer(ALICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownKey);
    }

    #[tokio::test]
    async fn add_user_allocates_sequential_addresses_and_reuses_released() {
        let (gateway, coordinator) = coordinator();
        let alice = coordinator.add_user("alice").await.unwrap();
        let bob = coordinator.add_user("bob").await.unwrap();
        assert_eq!(alice.user.address, Ipv4Addr::new(15, 0, 0, 2));
        assert_eq!(bob.user.address, Ipv4Addr::new(15, 0, 0, 3));

        let record = coordinator.lookup(&alice.user.public_key).await.unwrap();
        assert_eq!(record.allowed_ips[0].to_string(), "15.0.0.2/32");
        assert_eq!(
            crate::keygen::public_key_for(&alice.private_key),
            alice.user.public_key
        );

        let removed = coordinator
            .remove_user(&alice.user.public_key.to_base64())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed.username, "alice");
        assert_eq!(coordinator.users().await.len(), 1);

        let carol = coordinator.add_user("carol").await.unwrap();
        assert_eq!(carol.user.address, Ipv4Addr::new(15, 0, 0, 2));
        assert_eq!(gateway.device_peers().len(), 2);
    }

    #[tokio::test]
    async fn add_user_failure_releases_address() {
        let (gateway, coordinator) = coordinator();
        gateway.fail_next_upsert("EPERM");
        assert!(coordinator.add_user("alice").await.is_err());
        assert!(coordinator.users().await.is_empty());

        let retry = coordinator.add_user("alice").await.unwrap();
        assert_eq!(retry.user.address, Ipv4Addr::new(15, 0, 0, 2));
    }

    #[tokio::test]
    async fn user_pool_skips_reserved_device_address() {
        let gateway = Arc::new(InMemoryGateway::new("wg-test"));
        let options = CoordinatorOptions {
            reserved: vec![Ipv4Addr::new(15, 0, 0, 2)],
            ..Default::default()
        };
        let coordinator = PeerLifecycleCoordinator::new(gateway, options);
        let user = coordinator.add_user("alice").await.unwrap();
        assert_eq!(user.user.address, Ipv4Addr::new(15, 0, 0, 3));
    }

    #[tokio::test]
    async fn explicit_host_route_is_not_handed_out_again() {
        let (_, coordinator) = coordinator();
        coordinator.add_peer(ALICE, None, &["15.0.0.2/32"]).await.unwrap();
        let user = coordinator.add_user("bob").await.unwrap();
        assert_eq!(user.user.address, Ipv4Addr::new(15, 0, 0, 3));
    }

    #[tokio::test]
    async fn user_address_cannot_be_taken_by_another_peer() {
        let (gateway, coordinator) = coordinator();
        let alice = coordinator.add_user("alice").await.unwrap();
        let upserts = gateway.upsert_calls();

        let stolen = format!("{}/32", alice.user.address);
        let err = coordinator
            .add_peer(ALICE, None, &[stolen.as_str()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAllowedIp);
        assert!(err.to_string().contains(&alice.user.public_key.to_base64()));
        assert_eq!(gateway.upsert_calls(), upserts);

        let holders: Vec<PeerRecord> = coordinator
            .snapshot()
            .await
            .into_iter()
            .filter(|peer| peer.allowed_ips.iter().any(|net| net.to_string() == stolen))
            .collect();
        assert_eq!(holders.len(), 1);
    }

    #[tokio::test]
    async fn host_routes_outside_the_pool_stay_exclusive() {
        let (gateway, coordinator) = coordinator();
        coordinator.add_peer(ALICE, None, &["10.1.0.7/32", "fd00::7/128"]).await.unwrap();
        let bob = Key::from_bytes([8; 32]).to_base64();

        for route in ["10.1.0.7/32", "fd00::7/128"] {
            let err = coordinator.add_peer(&bob, None, &[route]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidAllowedIp);
        }
        coordinator.add_peer(&bob, None, &["10.1.0.0/24"]).await.unwrap();
        assert_eq!(gateway.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn device_address_is_not_a_peer_route() {
        let gateway = Arc::new(InMemoryGateway::new("wg-test"));
        let options = CoordinatorOptions {
            reserved: vec![Ipv4Addr::new(15, 0, 0, 1)],
            ..Default::default()
        };
        let coordinator = PeerLifecycleCoordinator::new(gateway.clone(), options);
        let err = coordinator.add_peer(ALICE, None, &["15.0.0.1/32"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAllowedIp);
        assert_eq!(gateway.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn view_reads_roster_and_device_together() {
        let (gateway, coordinator) = coordinator();
        coordinator.add_peer(ALICE, None, &["15.0.0.2/32"]).await.unwrap();
        let bob = coordinator.add_user("bob").await.unwrap();

        let view = coordinator.view().await;
        assert_eq!(view.peers.len(), 2);
        assert_eq!(view.users.len(), 1);
        assert_eq!(view.users[0].public_key, bob.user.public_key);
        assert_eq!(view.device.unwrap().peers.len(), 2);

        gateway.fail_next_status("gone");
        assert!(coordinator.view().await.device.is_err());
    }

    #[tokio::test]
    async fn reconcile_reapplies_missing_and_reports_unknown() {
        let (gateway, coordinator) = coordinator();
        coordinator.add_peer(ALICE, None, &["15.0.0.2/32"]).await.unwrap();
        let alice = Key::from_base64(ALICE).unwrap();
        gateway.forget_device_peer(&alice);
        let stray = Key::from_bytes([42; 32]);
        gateway.inject_device_peer(PeerStatus::new(stray));

        let report = coordinator.reconcile().await.unwrap();
        assert_eq!(report.reapplied, vec![alice]);
        assert_eq!(report.unknown, vec![stray]);
        assert!(report.pruned.is_empty());
        assert!(report.is_converged());
        assert!(gateway.device_peers().contains(&alice));
    }

    #[tokio::test]
    async fn reconcile_prunes_when_enabled() {
        let gateway = Arc::new(InMemoryGateway::new("wg-test"));
        let options = CoordinatorOptions {
            prune_unknown_peers: true,
            ..Default::default()
        };
        let coordinator = PeerLifecycleCoordinator::new(gateway.clone(), options);
        let stray = Key::from_bytes([42; 32]);
        gateway.inject_device_peer(PeerStatus::new(stray));

        let report = coordinator.reconcile().await.unwrap();
        assert_eq!(report.pruned, vec![stray]);
        assert!(gateway.device_peers().is_empty());
        assert_eq!(
            gateway.calls().last(),
            Some(&GatewayCall::Removal(stray))
        );
    }

    #[tokio::test]
    async fn slow_device_call_times_out_as_device_error() {
        let gateway = Arc::new(InMemoryGateway::new("wg-test").with_latency(Duration::from_millis(200)));
        let options = CoordinatorOptions {
            gateway_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let coordinator = PeerLifecycleCoordinator::new(gateway, options);
        let err = coordinator
            .add_peer(ALICE, None, &["15.0.0.2/32"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RosterError::DeviceConfig(GatewayError::Timeout(_))
        ));
        assert_eq!(coordinator.peer_count().await, 0);
    }
}
