use super::{
    args, command_line, run_command, CommandRunner, InterfaceError, InterfaceManager,
    InterfaceResult, NatRule,
};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::sync::Arc;
use tracing::{debug, info, warn};

const IPV4_FORWARD_KEY: &str = "net.ipv4.ip_forward";

/// [`InterfaceManager`] driving `ip`, `iptables` and `sysctl`.
pub struct LinuxInterfaceManager {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxInterfaceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, program: &str, args: &[String]) -> InterfaceResult<String> {
        run_command(self.runner.as_ref(), program, args).await
    }

    async fn rule_exists(&self, rule: &NatRule) -> InterfaceResult<bool> {
        let check = rule.iptables_args("-C");
        let output = self.runner.run("iptables", &check, None).await?;

        if output.is_success() {
            return Ok(true);
        }

        if output.code == Some(1) {
            return Ok(false);
        }

        Err(InterfaceError::CommandFailure {
            command: command_line("iptables", &check),
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl InterfaceManager for LinuxInterfaceManager {
    async fn interface_exists(&self, name: &str) -> InterfaceResult<bool> {
        let output = self
            .runner
            .run("ip", &args(["link", "show", "dev", name]), None)
            .await?;
        Ok(output.is_success())
    }

    async fn create_wireguard(&self, name: &str, address: Ipv4Net) -> InterfaceResult<()> {
        self.run("ip", &args(["link", "add", "dev", name, "type", "wireguard"]))
            .await?;
        self.run("ip", &args(["link", "set", name, "up"])).await?;
        let cidr = address.to_string();
        self.run("ip", &args(["addr", "add", cidr.as_str(), "dev", name]))
            .await?;
        info!(interface = name, %address, "created wireguard interface");
        Ok(())
    }

    async fn delete_interface(&self, name: &str) -> InterfaceResult<()> {
        if !self.interface_exists(name).await? {
            debug!(interface = name, "interface already gone");
            return Ok(());
        }
        self.run("ip", &args(["link", "delete", "dev", name])).await?;
        info!(interface = name, "deleted interface");
        Ok(())
    }

    async fn default_egress_interface(&self) -> InterfaceResult<String> {
        let routes = self.run("ip", &args(["route", "show", "default"])).await?;
        parse_default_route(&routes)
            .ok_or_else(|| InterfaceError::Platform("default route not found".to_string()))
    }

    async fn ensure_forwarding(&self) -> InterfaceResult<bool> {
        let current = self.run("sysctl", &args(["-n", IPV4_FORWARD_KEY])).await?;
        if current.trim() == "1" {
            return Ok(false);
        }
        let assignment = format!("{IPV4_FORWARD_KEY}=1");
        self.run("sysctl", &args(["-w", assignment.as_str()])).await?;
        info!("enabled IPv4 forwarding");
        Ok(true)
    }

    async fn ensure_nat_rule(&self, rule: &NatRule) -> InterfaceResult<bool> {
        if self.rule_exists(rule).await? {
            debug!(%rule, "iptables rule already present");
            return Ok(false);
        }
        self.run("iptables", &rule.iptables_args("-A")).await?;
        info!(%rule, "installed iptables rule");
        Ok(true)
    }

    async fn remove_nat_rule(&self, rule: &NatRule) -> InterfaceResult<()> {
        if let Err(err) = self.run("iptables", &rule.iptables_args("-D")).await {
            warn!(%rule, "failed to remove iptables rule: {err}");
            return Err(err);
        }
        Ok(())
    }
}

/// Interface name of the first `default` route in `ip route show` output.
pub fn parse_default_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("default") {
            return None;
        }
        fields
            .skip_while(|field| *field != "dev")
            .nth(1)
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CommandOutput, RecordingRunner};

    fn manager() -> (Arc<RecordingRunner>, LinuxInterfaceManager) {
        let runner = Arc::new(RecordingRunner::new());
        (runner.clone(), LinuxInterfaceManager::new(runner))
    }

    #[test]
    fn default_route_parsing() {
        let out = "default via 192.168.1.1 dev enp3s0 proto dhcp metric 100\n\
                   10.0.0.0/8 dev wg0 scope link\n";
        assert_eq!(parse_default_route(out).as_deref(), Some("enp3s0"));
        assert_eq!(
            parse_default_route("default dev ppp0 scope link").as_deref(),
            Some("ppp0")
        );
        assert_eq!(parse_default_route("10.0.0.0/8 dev wg0"), None);
        assert_eq!(parse_default_route(""), None);
    }

    #[tokio::test]
    async fn existing_rule_is_not_appended() {
        let (runner, manager) = manager();
        let installed = manager
            .ensure_nat_rule(&NatRule::forward_in("wg0"))
            .await
            .unwrap();
        assert!(!installed);
        assert_eq!(runner.lines(), vec!["iptables -t filter -C FORWARD -i wg0 -j ACCEPT"]);
    }

    #[tokio::test]
    async fn missing_rule_is_appended() {
        let (runner, manager) = manager();
        runner.respond("iptables -t nat -C", CommandOutput::failure(1, "Bad rule"));
        let installed = manager
            .ensure_nat_rule(&NatRule::masquerade("eth0"))
            .await
            .unwrap();
        assert!(installed);
        assert_eq!(
            runner.lines()[1],
            "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE"
        );
    }

    #[tokio::test]
    async fn rule_check_error_is_reported() {
        let (runner, manager) = manager();
        runner.respond("iptables", CommandOutput::failure(4, "resource problem"));
        let err = manager
            .ensure_nat_rule(&NatRule::forward_out("wg0"))
            .await
            .unwrap_err();
        assert!(matches!(err, InterfaceError::CommandFailure { .. }));
        assert_eq!(runner.lines().len(), 1);
    }

    #[tokio::test]
    async fn forwarding_enabled_only_when_off() {
        let (runner, manager) = manager();
        runner.respond("sysctl -n", CommandOutput::success("1\n"));
        assert!(!manager.ensure_forwarding().await.unwrap());

        runner.respond("sysctl -n", CommandOutput::success("0\n"));
        assert!(manager.ensure_forwarding().await.unwrap());
        assert_eq!(
            runner.lines().last().map(String::as_str),
            Some("sysctl -w net.ipv4.ip_forward=1")
        );
    }

    #[tokio::test]
    async fn delete_skips_missing_interface() {
        let (runner, manager) = manager();
        runner.respond("ip link show", CommandOutput::failure(1, "Device \"wg9\" does not exist."));
        manager.delete_interface("wg9").await.unwrap();
        assert_eq!(runner.lines(), vec!["ip link show dev wg9"]);
    }
}
