use super::{
    parse_inet_addrs, CommandOutput, ControllerError, ControllerResult, FirewallRule,
    FirewallTable, InterfaceAddress, LaunchSpec, NetworkController, RouteSpec, RulePlacement,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

const SYSCTL_IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const NETNS_ETC_DIR: &str = "/etc/netns";

/// Drives `ip`, `iptables`, `wg` and `ss` on the local host.
#[derive(Debug, Default)]
pub struct LinuxController;

impl LinuxController {
    fn command(netns: Option<&str>, program: &str) -> TokioCommand {
        match netns {
            Some(ns) => {
                let mut cmd = TokioCommand::new("ip");
                cmd.args(["netns", "exec", ns, program]);
                cmd
            }
            None => TokioCommand::new(program),
        }
    }

    fn describe(netns: Option<&str>, program: &str, args: &[&str]) -> String {
        match netns {
            Some(ns) => format!("ip netns exec {ns} {program} {}", args.join(" ")),
            None => format!("{program} {}", args.join(" ")),
        }
    }

    async fn run_command(
        &self,
        netns: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> ControllerResult<String> {
        debug!(cmd = program, netns, ?args, "running network command");
        let output = Self::command(netns, program)
            .args(args)
            .output()
            .await
            .map_err(ControllerError::from)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ControllerError::CommandFailure {
                command: Self::describe(netns, program, args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run_owned(
        &self,
        netns: Option<&str>,
        program: &str,
        args: &[String],
    ) -> ControllerResult<String> {
        let refs = args.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        self.run_command(netns, program, &refs).await
    }

    async fn link_exists(&self, netns: Option<&str>, name: &str) -> ControllerResult<bool> {
        let status = Self::command(netns, "ip")
            .args(["link", "show", "dev", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(ControllerError::from)?;
        Ok(status.success())
    }

    async fn iptables_rule_exists(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> ControllerResult<bool> {
        let args = rule.check_args();
        let output = Self::command(netns, "iptables")
            .args(&args)
            .output()
            .await
            .map_err(ControllerError::Io)?;

        if output.status.success() {
            return Ok(true);
        }

        if output.status.code() == Some(1) {
            return Ok(false);
        }

        Err(ControllerError::CommandFailure {
            command: format!("iptables {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn ensure_sysctl(path: &str) -> ControllerResult<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(existing) => {
                if existing.trim() == "1" {
                    return Ok(None);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(ControllerError::Io(err)),
        }

        fs::write(path, b"1\n").await?;
        Ok(Some(path.to_string()))
    }
}

#[async_trait]
impl NetworkController for LinuxController {
    async fn list_namespaces(&self) -> ControllerResult<Vec<String>> {
        let out = self.run_command(None, "ip", &["netns", "list"]).await?;
        Ok(parse_netns_list(&out))
    }

    async fn add_namespace(&self, name: &str) -> ControllerResult<()> {
        self.run_command(None, "ip", &["netns", "add", name]).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ControllerResult<()> {
        if self.namespace_exists(name).await? {
            self.run_command(None, "ip", &["netns", "delete", name])
                .await?;
        }

        let etc_dir = Path::new(NETNS_ETC_DIR).join(name);
        match fs::remove_dir_all(&etc_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %etc_dir.display(), "failed to remove namespace files: {err}"),
        }
        Ok(())
    }

    async fn add_veth_pair(&self, host_end: &str, peer_end: &str) -> ControllerResult<()> {
        self.run_command(
            None,
            "ip",
            &["link", "add", host_end, "type", "veth", "peer", "name", peer_end],
        )
        .await?;
        Ok(())
    }

    async fn add_wireguard_link(&self, name: &str) -> ControllerResult<()> {
        self.run_command(None, "ip", &["link", "add", name, "type", "wireguard"])
            .await?;
        Ok(())
    }

    async fn apply_wireguard_config(
        &self,
        netns: Option<&str>,
        name: &str,
        config: &str,
    ) -> ControllerResult<()> {
        let args = ["setconf", name, "/dev/stdin"];
        debug!(cmd = "wg", netns, ?args, "loading wireguard configuration");
        let mut child = Self::command(netns, "wg")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(config.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ControllerError::CommandFailure {
                command: Self::describe(netns, "wg", &args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn delete_link(&self, netns: Option<&str>, name: &str) -> ControllerResult<()> {
        if let Some(ns) = netns {
            if !self.namespace_exists(ns).await? {
                return Ok(());
            }
        }
        if !self.link_exists(netns, name).await? {
            return Ok(());
        }
        self.run_command(netns, "ip", &["link", "delete", "dev", name])
            .await?;
        Ok(())
    }

    async fn move_link(&self, name: &str, netns: &str) -> ControllerResult<()> {
        self.run_command(None, "ip", &["link", "set", name, "netns", netns])
            .await?;
        Ok(())
    }

    async fn set_link_state(
        &self,
        netns: Option<&str>,
        name: &str,
        up: bool,
    ) -> ControllerResult<()> {
        let state = if up { "up" } else { "down" };
        self.run_command(netns, "ip", &["link", "set", "dev", name, state])
            .await?;
        Ok(())
    }

    async fn link_is_up(&self, netns: Option<&str>, name: &str) -> ControllerResult<bool> {
        match self
            .run_command(netns, "ip", &["-o", "link", "show", "dev", name])
            .await
        {
            Ok(out) => Ok(link_flags_up(&out)),
            Err(ControllerError::CommandFailure { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn flush_addresses(&self, netns: Option<&str>, dev: &str) -> ControllerResult<()> {
        self.run_command(netns, "ip", &["addr", "flush", "dev", dev])
            .await?;
        Ok(())
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        dev: &str,
        cidr: &str,
    ) -> ControllerResult<()> {
        self.run_command(netns, "ip", &["addr", "add", cidr, "dev", dev])
            .await?;
        Ok(())
    }

    async fn list_addresses(
        &self,
        netns: Option<&str>,
    ) -> ControllerResult<Vec<InterfaceAddress>> {
        let out = self
            .run_command(netns, "ip", &["-o", "-4", "addr", "show"])
            .await?;
        Ok(parse_inet_addrs(&out))
    }

    async fn flush_routes(&self, netns: &str, table: &str) -> ControllerResult<()> {
        match self
            .run_command(Some(netns), "ip", &["route", "flush", "table", table])
            .await
        {
            Ok(_) => Ok(()),
            Err(ControllerError::CommandFailure { stderr, .. }) => {
                // an empty table fails to flush on older iproute2
                debug!(netns, table, "route flush reported: {stderr}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn add_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()> {
        let mut args = vec!["route".to_string(), "add".to_string()];
        args.extend(route.args());
        self.run_owned(Some(netns), "ip", &args).await?;
        Ok(())
    }

    async fn replace_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()> {
        let mut args = vec!["route".to_string(), "replace".to_string()];
        args.extend(route.args());
        self.run_owned(Some(netns), "ip", &args).await?;
        Ok(())
    }

    async fn add_fwmark_rule(&self, netns: &str, mark: u32, table: u32) -> ControllerResult<()> {
        let mark = mark.to_string();
        let table = table.to_string();
        self.run_command(
            Some(netns),
            "ip",
            &["rule", "add", "fwmark", &mark, "lookup", &table],
        )
        .await?;
        Ok(())
    }

    async fn add_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
        placement: RulePlacement,
    ) -> ControllerResult<()> {
        self.run_owned(netns, "iptables", &rule.add_args(placement))
            .await?;
        Ok(())
    }

    async fn delete_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> ControllerResult<bool> {
        if !self.iptables_rule_exists(netns, rule).await? {
            return Ok(false);
        }
        self.run_owned(netns, "iptables", &rule.delete_args())
            .await?;
        Ok(true)
    }

    async fn list_firewall_rules(
        &self,
        netns: Option<&str>,
        table: FirewallTable,
        chain: &str,
    ) -> ControllerResult<Vec<String>> {
        let out = self
            .run_command(netns, "iptables", &["-t", table.as_str(), "-S", chain])
            .await?;
        Ok(out
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(|line| line.to_string())
            .collect())
    }

    async fn enable_ip_forwarding(&self) -> ControllerResult<()> {
        if let Some(path) = Self::ensure_sysctl(SYSCTL_IPV4_FORWARD).await? {
            info!(path, "enabled IPv4 forwarding");
        }
        Ok(())
    }

    async fn write_namespace_resolv(
        &self,
        netns: &str,
        nameservers: &[String],
    ) -> ControllerResult<()> {
        let dir = Path::new(NETNS_ETC_DIR).join(netns);
        fs::create_dir_all(&dir).await?;
        let mut content = String::new();
        for server in nameservers {
            content.push_str(&format!("nameserver {server}\n"));
        }
        fs::write(dir.join("resolv.conf"), content).await?;
        Ok(())
    }

    async fn exec(&self, netns: Option<&str>, argv: &[&str]) -> ControllerResult<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ControllerError::InvalidInput("empty command".into()))?;
        let output = Self::command(netns, program).args(args).output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn launch_detached(&self, netns: &str, spec: &LaunchSpec) -> ControllerResult<u32> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let log = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&spec.log_path)
            .await?
            .into_std()
            .await;
        let log_err = log.try_clone()?;

        let child = TokioCommand::new("ip")
            .args(["netns", "exec", netns])
            .arg(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()?;

        let pid = child.id().ok_or_else(|| ControllerError::CommandFailure {
            command: format!("ip netns exec {netns} {}", spec.program.display()),
            stderr: "process exited before its pid was read".into(),
        })?;
        info!(netns, pid, program = %spec.program.display(), "launched detached process");
        Ok(pid)
    }
}

fn parse_netns_list(output: &str) -> Vec<String> {
    // `ip netns list` prints `ns-1 (id: 0)` once ids are assigned
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.to_string())
        .collect()
}

fn link_flags_up(output: &str) -> bool {
    let Some(start) = output.find('<') else {
        return false;
    };
    let Some(len) = output[start..].find('>') else {
        return false;
    };
    output[start + 1..start + len]
        .split(',')
        .any(|flag| flag == "UP")
}
