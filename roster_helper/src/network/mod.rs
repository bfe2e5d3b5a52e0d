//! Host network programming for the roster helper.
//!
//! Interface creation, address assignment and the forwarding/NAT rules that
//! turn the WireGuard device into a gateway. Every system call goes through a
//! [`CommandRunner`], so the exact command sequence can be recorded and
//! asserted in tests without root.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::debug;

mod linux;
pub use linux::{parse_default_route, LinuxInterfaceManager};

/// Errors surfaced by interface management operations.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System command `{command}` failed: {stderr}")]
    CommandFailure { command: String, stderr: String },

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Result alias for interface operations.
pub type InterfaceResult<T> = Result<T, InterfaceError>;

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external programs. Secrets travel through `stdin`, never argv.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> InterfaceResult<CommandOutput>;
}

/// Run a command and fail with [`InterfaceError::CommandFailure`] on a
/// non-zero exit. Returns trimmed stdout.
pub async fn run_command(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> InterfaceResult<String> {
    let output = runner.run(program, args, None).await?;
    if output.is_success() {
        Ok(output.stdout.trim().to_string())
    } else {
        Err(InterfaceError::CommandFailure {
            command: command_line(program, args),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Build an owned argument vector from string slices.
pub fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Runs commands on the host through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> InterfaceResult<CommandOutput> {
        debug!(cmd = program, ?args, "running network command");
        let mut child = TokioCommand::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// One invocation observed by [`RecordingRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub line: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct RecorderState {
    calls: Vec<RecordedCommand>,
    responses: Vec<(String, CommandOutput)>,
}

/// Runner that records every invocation and answers from a script instead
/// of touching the host. Unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    state: Mutex<RecorderState>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command line starting with `prefix` with `output`.
    /// Later registrations take precedence.
    pub fn respond(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.lock().responses.push((prefix.into(), output));
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.lock().calls.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().calls.iter().map(|call| call.line.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> InterfaceResult<CommandOutput> {
        let line = command_line(program, args);
        let mut state = self.lock();
        state.calls.push(RecordedCommand {
            line: line.clone(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        let output = state
            .responses
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::success(""));
        Ok(output)
    }
}

/// One iptables rule, independent of whether it is being checked, added or
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

impl NatRule {
    /// Accept traffic arriving from the tunnel.
    pub fn forward_in(interface: &str) -> Self {
        Self::new("filter", "FORWARD", ["-i", interface, "-j", "ACCEPT"])
    }

    /// Accept traffic leaving into the tunnel.
    pub fn forward_out(interface: &str) -> Self {
        Self::new("filter", "FORWARD", ["-o", interface, "-j", "ACCEPT"])
    }

    /// Masquerade tunnel traffic leaving through `egress`.
    pub fn masquerade(egress: &str) -> Self {
        Self::new("nat", "POSTROUTING", ["-o", egress, "-j", "MASQUERADE"])
    }

    fn new<const N: usize>(table: &str, chain: &str, spec: [&str; N]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: args(spec),
        }
    }

    /// iptables arguments for `action` (`-C`, `-A` or `-D`).
    pub fn iptables_args(&self, action: &str) -> Vec<String> {
        let mut out = args(["-t", self.table.as_str(), action, self.chain.as_str()]);
        out.extend(self.spec.iter().cloned());
        out
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Host-side operations the device lifecycle needs.
#[async_trait]
pub trait InterfaceManager: Send + Sync {
    async fn interface_exists(&self, name: &str) -> InterfaceResult<bool>;

    /// Create a WireGuard link, bring it up and assign `address`.
    async fn create_wireguard(&self, name: &str, address: Ipv4Net) -> InterfaceResult<()>;

    /// Delete the link. Missing interfaces are treated as success.
    async fn delete_interface(&self, name: &str) -> InterfaceResult<()>;

    /// Interface carrying the default route.
    async fn default_egress_interface(&self) -> InterfaceResult<String>;

    /// Ensure IPv4 forwarding is on. Returns true when it had to be enabled.
    async fn ensure_forwarding(&self) -> InterfaceResult<bool>;

    /// Install `rule` unless present. Returns true when this call added it.
    async fn ensure_nat_rule(&self, rule: &NatRule) -> InterfaceResult<bool>;

    async fn remove_nat_rule(&self, rule: &NatRule) -> InterfaceResult<()>;
}

/// Construct the interface manager backed by `runner`.
pub fn build_interface_manager(runner: Arc<dyn CommandRunner>) -> Arc<dyn InterfaceManager> {
    Arc::new(LinuxInterfaceManager::new(runner))
}
