//! Tunnel device gateway backed by `wg(8)`.
//!
//! Peer deltas map onto `wg set`, status onto `wg show <iface> dump`. Key
//! material is written to the child's stdin and never appears in argv.

use crate::network::{args, command_line, CommandRunner, InterfaceError};
use async_trait::async_trait;
use ipnet::IpNet;
use roster_core::directory::PeerRecord;
use roster_core::gateway::{DeviceStatus, GatewayError, GatewayResult, PeerStatus, TunnelDeviceGateway};
use roster_core::keys::{Key, PublicKey, SecretKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroize;

const WG: &str = "wg";
const NONE: &str = "(none)";
const STDIN_PATH: &str = "/dev/stdin";

/// Control handle for one kernel WireGuard interface.
pub struct WgCommandGateway {
    interface: String,
    runner: Arc<dyn CommandRunner>,
    closed: AtomicBool,
}

impl WgCommandGateway {
    pub fn new(interface: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            interface: interface.into(),
            runner,
            closed: AtomicBool::new(false),
        }
    }

    /// Set the device identity. Re-applied on every bring-up.
    pub async fn configure_device(
        &self,
        private_key: &SecretKey,
        listen_port: u16,
    ) -> GatewayResult<()> {
        let port = listen_port.to_string();
        let mut secret = private_key.expose_base64();
        secret.push('\n');
        let result = self
            .wg(
                args(["set", self.interface.as_str(), "private-key", STDIN_PATH, "listen-port", port.as_str()]),
                Some(secret.as_bytes()),
            )
            .await;
        secret.zeroize();
        result.map(|_| ())
    }

    /// Refuse further calls. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn wg(&self, argv: Vec<String>, stdin: Option<&[u8]>) -> GatewayResult<String> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let output = self
            .runner
            .run(WG, &argv, stdin)
            .await
            .map_err(|err| match err {
                InterfaceError::Io(io) => GatewayError::Io(io),
                other => GatewayError::Rejected {
                    interface: self.interface.clone(),
                    message: other.to_string(),
                },
            })?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(GatewayError::Rejected {
                interface: self.interface.clone(),
                message: format!(
                    "`{}` failed: {}",
                    command_line(WG, &argv),
                    output.stderr.trim()
                ),
            })
        }
    }
}

#[async_trait]
impl TunnelDeviceGateway for WgCommandGateway {
    async fn apply_peer_upsert(&self, peer: &PeerRecord) -> GatewayResult<()> {
        let public_key = peer.public_key.to_base64();
        let mut argv = args(["set", self.interface.as_str(), "peer", public_key.as_str()]);
        let mut secret = None;
        if let Some(psk) = &peer.preshared_key {
            argv.extend(args(["preshared-key", STDIN_PATH]));
            let mut encoded = psk.expose_base64();
            encoded.push('\n');
            secret = Some(encoded);
        }
        let ranges = peer
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        argv.extend(args(["allowed-ips", ranges.as_str()]));

        debug!(interface = %self.interface, peer = %peer.public_key, "wg set peer");
        let result = self.wg(argv, secret.as_deref().map(str::as_bytes)).await;
        if let Some(mut encoded) = secret {
            encoded.zeroize();
        }
        result.map(|_| ())
    }

    async fn apply_peer_removal(&self, key: &PublicKey) -> GatewayResult<()> {
        let public_key = key.to_base64();
        debug!(interface = %self.interface, peer = %key, "wg set peer remove");
        self.wg(
            args(["set", self.interface.as_str(), "peer", public_key.as_str(), "remove"]),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn current_status(&self) -> GatewayResult<DeviceStatus> {
        let mut dump = self
            .wg(args(["show", self.interface.as_str(), "dump"]), None)
            .await?;
        let status = parse_dump(&self.interface, &dump);
        // the first line carries the device private key
        dump.zeroize();
        status
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the device (`private-key public-key listen-port
/// fwmark`), each following line a peer (`public-key preshared-key endpoint
/// allowed-ips latest-handshake rx tx keepalive`). Fields are tab separated.
pub fn parse_dump(interface: &str, dump: &str) -> GatewayResult<DeviceStatus> {
    let mut lines = dump.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| GatewayError::Status("empty dump".to_string()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 4 {
        return Err(GatewayError::Status(format!(
            "device line has {} fields, expected 4",
            fields.len()
        )));
    }

    let public_key = optional(fields[1]).map(parse_key).transpose()?;
    let listen_port = match fields[2].parse::<u16>() {
        Ok(0) => None,
        Ok(port) => Some(port),
        Err(err) => {
            return Err(GatewayError::Status(format!("listen port: {err}")));
        }
    };

    let peers = lines.map(parse_peer_line).collect::<GatewayResult<Vec<_>>>()?;

    Ok(DeviceStatus {
        interface: interface.to_string(),
        public_key,
        listen_port,
        peers,
    })
}

fn parse_peer_line(line: &str) -> GatewayResult<PeerStatus> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return Err(GatewayError::Status(format!(
            "peer line has {} fields, expected 8",
            fields.len()
        )));
    }

    let mut peer = PeerStatus::new(parse_key(fields[0])?);
    peer.endpoint = optional(fields[2])
        .map(|raw| {
            raw.parse::<SocketAddr>()
                .map_err(|err| GatewayError::Status(format!("endpoint `{raw}`: {err}")))
        })
        .transpose()?;
    if let Some(list) = optional(fields[3]) {
        peer.allowed_ips = list
            .split(',')
            .map(|raw| {
                raw.trim()
                    .parse::<IpNet>()
                    .map_err(|err| GatewayError::Status(format!("allowed ip `{raw}`: {err}")))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
    }
    peer.latest_handshake = match parse_number(fields[4])? {
        0 => None,
        secs => Some(secs),
    };
    peer.rx_bytes = parse_number(fields[5])?;
    peer.tx_bytes = parse_number(fields[6])?;
    Ok(peer)
}

fn optional(field: &str) -> Option<&str> {
    match field.trim() {
        "" | NONE => None,
        value => Some(value),
    }
}

fn parse_key(field: &str) -> GatewayResult<Key> {
    Key::from_base64(field).map_err(|err| GatewayError::Status(format!("key: {err}")))
}

fn parse_number(field: &str) -> GatewayResult<u64> {
    field
        .trim()
        .parse()
        .map_err(|err| GatewayError::Status(format!("number `{field}`: {err}")))
}
