use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use roster_core::directory::parse_allowed_ips;
use roster_core::ipam::device_address;
use roster_core::keygen::{generate_preshared_key, public_key_for, KeyPair};
use roster_core::keys::{Key, SecretKey};
use roster_core::render::{render_server_config, ServerConfigView};
use roster_core::PeerRecord;
use roster_helper::status::StatusSnapshot;
use serde::Serialize;
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, LogOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  rosterctl genkey | tee server.key | rosterctl pubkey\n  rosterctl check-config --config /etc/wgroster/config.toml\n  rosterctl render --config /etc/wgroster/config.toml\n  rosterctl --output json status")]
struct Args {
    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "WGROSTER_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Emit JSON logs
    #[arg(long, env = "WGROSTER_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a private key
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
    /// Generate a preshared key
    Genpsk,
    /// Load and validate a configuration file
    CheckConfig {
        #[arg(short, long, default_value_os_t = Config::default_path())]
        config: PathBuf,
    },
    /// Print the wg-quick file for the configured device and peers
    Render {
        #[arg(short, long, default_value_os_t = Config::default_path())]
        config: PathBuf,
    },
    /// Show the status snapshot published by the helper
    Status {
        #[arg(long, default_value = "/run/wgroster/status.json")]
        status_file: PathBuf,
    },
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => {
            let msg = Message { status, detail };
            println!("{}", serde_json::to_string_pretty(&msg)?);
        }
    }
    Ok(())
}

/// Print a bare value in table mode, `{"<field>": value}` in JSON mode.
fn print_value(fmt: OutputFormat, field: &str, value: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{value}"),
        OutputFormat::Json => {
            let mut obj = serde_json::Map::new();
            obj.insert(field.to_string(), value.into());
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
    }
    Ok(())
}

fn read_private_key(mut input: impl Read) -> Result<SecretKey> {
    let mut encoded = String::new();
    input
        .read_to_string(&mut encoded)
        .context("failed to read private key from stdin")?;
    SecretKey::from_base64(&encoded).context("stdin does not hold a base64 private key")
}

/// Check the configuration and every key and range it names.
fn check_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    SecretKey::from_base64(&config.device.resolve_private_key()?)
        .context("device private key is not valid base64")?;
    device_address(config.device.subnet()?, config.device.node_index)?;
    configured_peers(&config)?;
    Ok(config)
}

fn configured_peers(config: &Config) -> Result<Vec<PeerRecord>> {
    config
        .peers
        .iter()
        .enumerate()
        .map(|(idx, peer)| {
            let public_key = Key::from_base64(&peer.public_key)
                .with_context(|| format!("peers[{idx}].public_key"))?;
            let preshared_key = peer
                .preshared_key
                .as_deref()
                .map(SecretKey::from_base64)
                .transpose()
                .with_context(|| format!("peers[{idx}].preshared_key"))?;
            let allowed_ips = parse_allowed_ips(&peer.allowed_ips)
                .with_context(|| format!("peers[{idx}].allowed_ips"))?;
            Ok(PeerRecord::new(public_key, preshared_key, allowed_ips))
        })
        .collect()
}

fn render(config: &Config) -> Result<String> {
    let private_key = SecretKey::from_base64(&config.device.resolve_private_key()?)
        .context("device private key is not valid base64")?;
    let address = device_address(config.device.subnet()?, config.device.node_index)?;
    let view = ServerConfigView {
        private_key: &private_key,
        address,
        listen_port: config.device.listen_port,
    };
    Ok(render_server_config(&view, &configured_peers(config)?))
}

/// Age of a snapshot stamped at `generated_at` (Unix seconds).
fn snapshot_age(generated_at: u64, now: SystemTime) -> String {
    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    match now.checked_sub(generated_at) {
        Some(age) => format!("{age}s ago"),
        None => "in the future (clock skew?)".to_string(),
    }
}

fn print_status(fmt: OutputFormat, snapshot: &StatusSnapshot) -> Result<()> {
    if let OutputFormat::Json = fmt {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!("interface: {}", snapshot.interface);
    println!("  public key: {}", snapshot.public_key);
    println!("  address: {}", snapshot.address);
    println!("  listening port: {}", snapshot.listen_port);
    println!("  snapshot taken: {}", snapshot_age(snapshot.generated_at, SystemTime::now()));
    for peer in &snapshot.peers {
        let user = snapshot
            .users
            .iter()
            .find(|user| user.public_key == peer.public_key);
        println!();
        match user {
            Some(user) => println!("peer: {} ({})", peer.public_key, user.username),
            None => println!("peer: {}", peer.public_key),
        }
        let ranges: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
        println!("  allowed ips: {}", ranges.join(", "));
        let live = snapshot
            .device
            .as_ref()
            .and_then(|device| device.peers.iter().find(|p| p.public_key == peer.public_key));
        match live {
            Some(live) => {
                if let Some(endpoint) = live.endpoint {
                    println!("  endpoint: {endpoint}");
                }
                if let Some(handshake) = live.latest_handshake {
                    println!("  latest handshake: {handshake}");
                }
                println!("  transfer: {} B received, {} B sent", live.rx_bytes, live.tx_bytes);
            }
            None if snapshot.device.is_some() => println!("  missing on device"),
            None => {}
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.into();
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    match args.command {
        Command::Genkey => {
            let private_key = KeyPair::generate().into_private_key();
            print_value(args.output, "private_key", &private_key.expose_base64())?;
        }
        Command::Pubkey => {
            let private_key = read_private_key(std::io::stdin().lock())?;
            print_value(args.output, "public_key", &public_key_for(&private_key).to_base64())?;
        }
        Command::Genpsk => {
            print_value(
                args.output,
                "preshared_key",
                &generate_preshared_key().expose_base64(),
            )?;
        }
        Command::CheckConfig { config } => {
            let loaded = check_config(&config)?;
            print_msg(
                args.output,
                "ok",
                &format!(
                    "{} is valid ({} peers, {} users)",
                    config.display(),
                    loaded.peers.len(),
                    loaded.users.len()
                ),
            )?;
        }
        Command::Render { config } => {
            let loaded = check_config(&config)?;
            print!("{}", render(&loaded)?);
        }
        Command::Status { status_file } => {
            let snapshot = StatusSnapshot::read_from(&status_file).with_context(|| {
                format!(
                    "no status at {}; is roster_helper running with --status-file?",
                    status_file.display()
                )
            })?;
            print_status(args.output, &snapshot)?;
        }
    }

    debug!("rosterctl command completed");
    Ok(())
}
