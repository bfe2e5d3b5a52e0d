//! wg-quick configuration rendering.

use crate::directory::PeerRecord;
use crate::keys::{PublicKey, SecretKey};
use crate::users::ProvisionedUser;
use ipnet::{IpNet, Ipv4Net};
use std::fmt::Write;

/// Keepalive written into client configs, in seconds.
pub const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

/// The `[Interface]` half of the server's wg-quick file.
#[derive(Debug, Clone)]
pub struct ServerConfigView<'a> {
    pub private_key: &'a SecretKey,
    pub address: Ipv4Net,
    pub listen_port: u16,
}

/// Everything a user needs to connect to this node.
#[derive(Debug, Clone)]
pub struct ClientConfigView<'a> {
    pub user: &'a ProvisionedUser,
    pub server_public_key: PublicKey,
    /// `host:port` the client dials; omitted when unknown.
    pub endpoint: Option<String>,
    /// Ranges the client routes into the tunnel.
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

pub fn render_server_config(view: &ServerConfigView<'_>, peers: &[PeerRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", view.private_key.expose_base64());
    let _ = writeln!(out, "Address = {}", view.address);
    let _ = writeln!(out, "ListenPort = {}", view.listen_port);

    for peer in peers {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", psk.expose_base64());
        }
        let _ = writeln!(out, "AllowedIPs = {}", join_ranges(&peer.allowed_ips));
    }
    out
}

pub fn render_client_config(view: &ClientConfigView<'_>) -> String {
    let user = &view.user.user;
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", view.user.private_key.expose_base64());
    let _ = writeln!(out, "Address = {}", user.host_route());
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", view.server_public_key);
    let _ = writeln!(out, "PresharedKey = {}", user.preshared_key.expose_base64());
    if let Some(endpoint) = &view.endpoint {
        let _ = writeln!(out, "Endpoint = {endpoint}");
    }
    let _ = writeln!(out, "AllowedIPs = {}", join_ranges(&view.allowed_ips));
    if let Some(keepalive) = view.persistent_keepalive {
        let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
    }
    out
}

fn join_ranges(ranges: &[IpNet]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
