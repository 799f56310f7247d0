//! Network primitives used to build and inspect tunnel environments.
//!
//! Every mutation the provisioner, synchronizer and restore path perform goes
//! through [`NetworkController`]. The Linux implementation shells out to
//! `ip`, `iptables`, `wg` and `ss`; [`MemoryController`] keeps an in-memory
//! model of the same objects for tests and dry runs.
//!
//! A `None` namespace argument means the host's root namespace.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxController;

mod memory;
pub use memory::MemoryController;

/// Errors surfaced by network operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("System command `{command}` failed: {stderr}")]
    CommandFailure { command: String, stderr: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FirewallTable {
    Filter,
    Nat,
    Mangle,
}

impl FirewallTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallTable::Filter => "filter",
            FirewallTable::Nat => "nat",
            FirewallTable::Mangle => "mangle",
        }
    }
}

/// Where a new rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePlacement {
    Append,
    /// Insert at a 1-based position.
    Insert(u32),
}

/// One iptables rule, identified by table, chain and match/target spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FirewallRule {
    pub table: FirewallTable,
    pub chain: String,
    pub spec: Vec<String>,
}

impl FirewallRule {
    pub fn new(table: FirewallTable, chain: &str, spec: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn add_args(&self, placement: RulePlacement) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.table.as_str().to_string()];
        match placement {
            RulePlacement::Append => {
                args.push("-A".into());
                args.push(self.chain.clone());
            }
            RulePlacement::Insert(position) => {
                args.push("-I".into());
                args.push(self.chain.clone());
                args.push(position.to_string());
            }
        }
        args.extend(self.spec.iter().cloned());
        args
    }

    pub fn check_args(&self) -> Vec<String> {
        self.action_args("-C")
    }

    pub fn delete_args(&self) -> Vec<String> {
        self.action_args("-D")
    }

    /// The rule as `iptables -S` prints it.
    pub fn listing(&self) -> String {
        format!("-A {} {}", self.chain, self.spec.join(" "))
    }

    fn action_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.clone(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {}", self.table.as_str(), self.listing())
    }
}

/// A route inside a namespace, rendered as `ip route` arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSpec {
    /// `default` or a CIDR.
    pub destination: String,
    pub via: Option<Ipv4Addr>,
    pub dev: Option<String>,
    pub table: Option<u32>,
    /// Adds `proto kernel scope link src <addr>`.
    pub link_src: Option<Ipv4Addr>,
}

impl RouteSpec {
    pub fn to(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            via: None,
            dev: None,
            table: None,
            link_src: None,
        }
    }

    pub fn via(mut self, gateway: Ipv4Addr) -> Self {
        self.via = Some(gateway);
        self
    }

    pub fn dev(mut self, dev: impl Into<String>) -> Self {
        self.dev = Some(dev.into());
        self
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    pub fn link_src(mut self, src: Ipv4Addr) -> Self {
        self.link_src = Some(src);
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.destination.clone()];
        if let Some(gw) = self.via {
            args.push("via".into());
            args.push(gw.to_string());
        }
        if let Some(dev) = &self.dev {
            args.push("dev".into());
            args.push(dev.clone());
        }
        if let Some(src) = self.link_src {
            args.extend(["proto", "kernel", "scope", "link", "src"].map(String::from));
            args.push(src.to_string());
        }
        if let Some(table) = self.table {
            args.push("table".into());
            args.push(table.to_string());
        }
        args
    }
}

/// An IPv4 address assigned to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// Captured result of a command run inside a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A long-running process started inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// stdout and stderr are both redirected here.
    pub log_path: PathBuf,
    /// TCP port the process is expected to listen on.
    pub listen_port: u16,
}

/// Namespace, link, routing and firewall primitives.
#[async_trait]
pub trait NetworkController: Send + Sync {
    async fn list_namespaces(&self) -> ControllerResult<Vec<String>>;

    async fn namespace_exists(&self, name: &str) -> ControllerResult<bool> {
        Ok(self.list_namespaces().await?.iter().any(|ns| ns == name))
    }

    async fn add_namespace(&self, name: &str) -> ControllerResult<()>;

    /// Deleting a namespace that does not exist succeeds.
    async fn delete_namespace(&self, name: &str) -> ControllerResult<()>;

    /// Create a veth pair on the host.
    async fn add_veth_pair(&self, host_end: &str, peer_end: &str) -> ControllerResult<()>;

    /// Create a wireguard interface on the host.
    async fn add_wireguard_link(&self, name: &str) -> ControllerResult<()>;

    /// Load a stripped wireguard configuration body onto an interface.
    async fn apply_wireguard_config(
        &self,
        netns: Option<&str>,
        name: &str,
        config: &str,
    ) -> ControllerResult<()>;

    /// Deleting a link that does not exist succeeds.
    async fn delete_link(&self, netns: Option<&str>, name: &str) -> ControllerResult<()>;

    /// Move a host link into a namespace.
    async fn move_link(&self, name: &str, netns: &str) -> ControllerResult<()>;

    async fn set_link_state(&self, netns: Option<&str>, name: &str, up: bool)
        -> ControllerResult<()>;

    async fn link_is_up(&self, netns: Option<&str>, name: &str) -> ControllerResult<bool>;

    async fn flush_addresses(&self, netns: Option<&str>, dev: &str) -> ControllerResult<()>;

    async fn add_address(&self, netns: Option<&str>, dev: &str, cidr: &str)
        -> ControllerResult<()>;

    async fn list_addresses(&self, netns: Option<&str>) -> ControllerResult<Vec<InterfaceAddress>>;

    /// Flush a routing table (`main` or a numeric id).
    async fn flush_routes(&self, netns: &str, table: &str) -> ControllerResult<()>;

    async fn add_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()>;

    async fn replace_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()>;

    async fn add_fwmark_rule(&self, netns: &str, mark: u32, table: u32) -> ControllerResult<()>;

    async fn add_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
        placement: RulePlacement,
    ) -> ControllerResult<()>;

    /// Remove one instance of a rule. Returns `false` when it was not present.
    async fn delete_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> ControllerResult<bool>;

    /// Rules of a chain in `iptables -S` form.
    async fn list_firewall_rules(
        &self,
        netns: Option<&str>,
        table: FirewallTable,
        chain: &str,
    ) -> ControllerResult<Vec<String>>;

    async fn enable_ip_forwarding(&self) -> ControllerResult<()>;

    /// Write `/etc/netns/<ns>/resolv.conf`.
    async fn write_namespace_resolv(&self, netns: &str, nameservers: &[String])
        -> ControllerResult<()>;

    /// Run a command and capture its output. A non-zero exit is reported in
    /// [`CommandOutput::success`], not as an error.
    async fn exec(&self, netns: Option<&str>, argv: &[&str]) -> ControllerResult<CommandOutput>;

    /// Start a process detached from the caller. Returns its pid.
    async fn launch_detached(&self, netns: &str, spec: &LaunchSpec) -> ControllerResult<u32>;

    /// Pids of processes listening on a TCP port.
    async fn listening_pids(&self, netns: &str, port: u16) -> ControllerResult<Vec<u32>> {
        let output = self.exec(Some(netns), &["ss", "-ltnp"]).await?;
        Ok(parse_ss_pids(&output.stdout, port))
    }

    async fn terminate(&self, netns: &str, pids: &[u32]) -> ControllerResult<()> {
        if pids.is_empty() {
            return Ok(());
        }
        let pid_args = pids.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        let mut argv = vec!["kill"];
        argv.extend(pid_args.iter().map(|p| p.as_str()));
        self.exec(Some(netns), &argv).await?;
        Ok(())
    }

    /// Names of wireguard interfaces in a namespace.
    async fn wireguard_interfaces(&self, netns: &str) -> ControllerResult<Vec<String>> {
        let output = self.exec(Some(netns), &["wg", "show", "interfaces"]).await?;
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .split_whitespace()
            .map(|s| s.to_string())
            .collect())
    }

    async fn handshake_seen(&self, netns: &str, interface: &str) -> ControllerResult<bool> {
        let output = self.exec(Some(netns), &["wg", "show", interface]).await?;
        Ok(output.success && output.stdout.contains("latest handshake"))
    }
}

/// Extract pids from `ss -ltnp` output for sockets bound to `port`.
pub fn parse_ss_pids(output: &str, port: u16) -> Vec<u32> {
    let needle = format!(":{port} ");
    let mut pids = Vec::new();
    for line in output.lines() {
        // pad so a port at the very end of the local column still matches
        let padded = format!("{line} ");
        if !padded.contains(&needle) {
            continue;
        }
        for chunk in line.split("pid=").skip(1) {
            let digits: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse::<u32>() {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

/// Parse `ip -o -4 addr show` output.
pub fn parse_inet_addrs(output: &str) -> Vec<InterfaceAddress> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let Some(inet_pos) = fields.iter().position(|f| *f == "inet") else {
            continue;
        };
        let (Some(raw_iface), Some(cidr)) = (fields.get(1), fields.get(inet_pos + 1)) else {
            continue;
        };
        // veth ends print as `vpeer-1@if12`
        let interface = raw_iface.split('@').next().unwrap_or(raw_iface);
        let Some((addr, prefix)) = cidr.split_once('/') else {
            continue;
        };
        if let (Ok(address), Ok(prefix_len)) = (addr.parse::<Ipv4Addr>(), prefix.parse::<u8>()) {
            addrs.push(InterfaceAddress {
                interface: interface.to_string(),
                address,
                prefix_len,
            });
        }
    }
    addrs
}

/// Construct the controller for the current host.
pub fn build_network_controller() -> Box<dyn NetworkController> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxController::default())
    }

    #[cfg(not(target_os = "linux"))]
    {
        compile_error!("network namespaces require Linux");
    }
}
