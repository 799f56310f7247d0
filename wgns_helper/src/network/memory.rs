//! In-memory network model.
//!
//! Mirrors the kernel objects the Linux controller manipulates closely enough
//! that provisioning order mistakes surface as errors: links must exist before
//! they get addresses, routes need their device, duplicate objects are
//! rejected. Every mutation is appended to a journal rendered as the command
//! line the Linux controller would have run.

use super::{
    CommandOutput, ControllerError, ControllerResult, FirewallRule, FirewallTable,
    InterfaceAddress, LaunchSpec, NetworkController, RouteSpec, RulePlacement,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use tokio::sync::Mutex as AsyncMutex;

const FIRST_PID: u32 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Veth,
    Wireguard,
}

/// Snapshot of a modelled link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub name: String,
    pub netns: Option<String>,
    pub up: bool,
    pub addresses: Vec<String>,
    pub peer: Option<String>,
    pub wireguard_config: Option<String>,
    kind: LinkKind,
}

/// Snapshot of a modelled process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    pub pid: u32,
    pub netns: String,
    pub spec: LaunchSpec,
}

#[derive(Debug)]
struct Model {
    namespaces: BTreeSet<String>,
    links: Vec<LinkState>,
    routes: HashMap<String, Vec<RouteSpec>>,
    fwmark_rules: HashMap<String, Vec<(u32, u32)>>,
    firewall: HashMap<Option<String>, Vec<FirewallRule>>,
    ip_forwarding: bool,
    resolv: HashMap<String, Vec<String>>,
    processes: Vec<ProcessState>,
    launches: Vec<ProcessState>,
    next_pid: u32,
    handshakes: bool,
    failures: HashSet<String>,
    scripted: HashMap<String, CommandOutput>,
    journal: Vec<String>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            namespaces: BTreeSet::new(),
            links: Vec::new(),
            routes: HashMap::new(),
            fwmark_rules: HashMap::new(),
            firewall: HashMap::new(),
            ip_forwarding: false,
            resolv: HashMap::new(),
            processes: Vec::new(),
            launches: Vec::new(),
            next_pid: FIRST_PID,
            handshakes: true,
            failures: HashSet::new(),
            scripted: HashMap::new(),
            journal: Vec::new(),
        }
    }
}

impl Model {
    fn check(&self, op: &str, command: String) -> ControllerResult<()> {
        if self.failures.contains(op) {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn record(&mut self, netns: Option<&str>, command: String) {
        let line = match netns {
            Some(ns) => format!("ip netns exec {ns} {command}"),
            None => command,
        };
        self.journal.push(line);
    }

    fn require_namespace(&self, netns: Option<&str>, command: &str) -> ControllerResult<()> {
        match netns {
            Some(ns) if !self.namespaces.contains(ns) => Err(ControllerError::CommandFailure {
                command: command.to_string(),
                stderr: format!("Cannot open network namespace \"{ns}\": No such file or directory"),
            }),
            _ => Ok(()),
        }
    }

    fn link_index(&self, netns: Option<&str>, name: &str) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.name == name && l.netns.as_deref() == netns)
    }

    fn link_mut(
        &mut self,
        netns: Option<&str>,
        name: &str,
        command: &str,
    ) -> ControllerResult<&mut LinkState> {
        let idx = self
            .link_index(netns, name)
            .ok_or_else(|| ControllerError::CommandFailure {
                command: command.to_string(),
                stderr: format!("Cannot find device \"{name}\""),
            })?;
        Ok(&mut self.links[idx])
    }

    fn remove_link_at(&mut self, idx: usize) {
        let removed = self.links.remove(idx);
        if let Some(peer) = removed.peer {
            self.links.retain(|l| l.name != peer);
        }
    }

    fn render_ss(&self, netns: &str) -> String {
        let mut out =
            String::from("State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n");
        for proc in self.processes.iter().filter(|p| p.netns == netns) {
            let name = proc
                .spec
                .program
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push_str(&format!(
                "LISTEN 0      4096   0.0.0.0:{} 0.0.0.0:*    users:((\"{name}\",pid={},fd=3))\n",
                proc.spec.listen_port, proc.pid
            ));
        }
        out
    }

    fn simulate(&mut self, netns: Option<&str>, argv: &[&str]) -> CommandOutput {
        let key = argv.join(" ");
        if let Some(scripted) = self.scripted.get(&key) {
            return scripted.clone();
        }

        let ok = |stdout: String| CommandOutput {
            success: true,
            stdout,
            stderr: String::new(),
        };

        match (netns, argv) {
            (Some(ns), ["ss", "-ltnp"]) => ok(self.render_ss(ns)),
            (Some(ns), ["kill", pids @ ..]) => {
                let targets = pids
                    .iter()
                    .filter_map(|p| p.parse::<u32>().ok())
                    .collect::<Vec<_>>();
                self.processes
                    .retain(|p| !(p.netns == ns && targets.contains(&p.pid)));
                ok(String::new())
            }
            (_, ["wg", "show", "interfaces"]) => {
                let names = self
                    .links
                    .iter()
                    .filter(|l| l.kind == LinkKind::Wireguard && l.netns.as_deref() == netns)
                    .map(|l| l.name.clone())
                    .collect::<Vec<_>>();
                ok(names.join(" "))
            }
            (_, ["wg", "show", iface]) => match self.link_index(netns, iface) {
                Some(idx) => {
                    let link = &self.links[idx];
                    let mut out = format!("interface: {iface}\n");
                    if self.handshakes && link.up && link.wireguard_config.is_some() {
                        out.push_str("  latest handshake: 3 seconds ago\n");
                    }
                    ok(out)
                }
                None => CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "Unable to access interface: No such device\n".into(),
                },
            },
            _ => ok(String::new()),
        }
    }
}

/// [`NetworkController`] over an in-memory model.
#[derive(Debug, Default)]
pub struct MemoryController {
    model: AsyncMutex<Model>,
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of the named trait method fail.
    pub async fn fail_on(&self, op: &str) {
        self.model.lock().await.failures.insert(op.to_string());
    }

    pub async fn clear_failures(&self) {
        self.model.lock().await.failures.clear();
    }

    /// Fixed output for an `exec` command line.
    pub async fn script(&self, argv: &[&str], output: CommandOutput) {
        self.model
            .lock()
            .await
            .scripted
            .insert(argv.join(" "), output);
    }

    /// Whether configured, up wireguard interfaces report a handshake.
    pub async fn set_handshakes(&self, enabled: bool) {
        self.model.lock().await.handshakes = enabled;
    }

    pub async fn journal(&self) -> Vec<String> {
        self.model.lock().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.model.lock().await.journal.clear();
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.model.lock().await.namespaces.contains(name)
    }

    pub async fn link(&self, netns: Option<&str>, name: &str) -> Option<LinkState> {
        let model = self.model.lock().await;
        model.link_index(netns, name).map(|idx| model.links[idx].clone())
    }

    pub async fn links(&self) -> Vec<LinkState> {
        self.model.lock().await.links.clone()
    }

    pub async fn routes(&self, netns: &str) -> Vec<RouteSpec> {
        self.model
            .lock()
            .await
            .routes
            .get(netns)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn fwmark_rules(&self, netns: &str) -> Vec<(u32, u32)> {
        self.model
            .lock()
            .await
            .fwmark_rules
            .get(netns)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn firewall_rules(&self, netns: Option<&str>) -> Vec<FirewallRule> {
        self.model
            .lock()
            .await
            .firewall
            .get(&netns.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn ip_forwarding(&self) -> bool {
        self.model.lock().await.ip_forwarding
    }

    pub async fn resolv(&self, netns: &str) -> Option<Vec<String>> {
        self.model.lock().await.resolv.get(netns).cloned()
    }

    pub async fn processes(&self, netns: &str) -> Vec<ProcessState> {
        self.model
            .lock()
            .await
            .processes
            .iter()
            .filter(|p| p.netns == netns)
            .cloned()
            .collect()
    }

    /// Every launch into `netns`, including processes since terminated.
    pub async fn launches(&self, netns: &str) -> Vec<ProcessState> {
        self.model
            .lock()
            .await
            .launches
            .iter()
            .filter(|p| p.netns == netns)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NetworkController for MemoryController {
    async fn list_namespaces(&self) -> ControllerResult<Vec<String>> {
        let model = self.model.lock().await;
        model.check("list_namespaces", "ip netns list".into())?;
        Ok(model.namespaces.iter().cloned().collect())
    }

    async fn add_namespace(&self, name: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip netns add {name}");
        model.check("add_namespace", command.clone())?;
        if !model.namespaces.insert(name.to_string()) {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: format!("Cannot create namespace file \"/var/run/netns/{name}\": File exists"),
            });
        }
        model.record(None, command);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip netns delete {name}");
        model.check("delete_namespace", command.clone())?;
        if !model.namespaces.remove(name) {
            return Ok(());
        }

        // links inside die with the namespace, and a veth takes its peer along
        let doomed = model
            .links
            .iter()
            .filter(|l| l.netns.as_deref() == Some(name))
            .filter_map(|l| l.peer.clone())
            .collect::<Vec<_>>();
        model
            .links
            .retain(|l| l.netns.as_deref() != Some(name) && !doomed.contains(&l.name));
        model.routes.remove(name);
        model.fwmark_rules.remove(name);
        model.firewall.remove(&Some(name.to_string()));
        model.resolv.remove(name);
        model.processes.retain(|p| p.netns != name);
        model.record(None, command);
        Ok(())
    }

    async fn add_veth_pair(&self, host_end: &str, peer_end: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip link add {host_end} type veth peer name {peer_end}");
        model.check("add_veth_pair", command.clone())?;
        if model.link_index(None, host_end).is_some() || model.link_index(None, peer_end).is_some()
        {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        for (name, peer) in [(host_end, peer_end), (peer_end, host_end)] {
            model.links.push(LinkState {
                name: name.to_string(),
                netns: None,
                up: false,
                addresses: Vec::new(),
                peer: Some(peer.to_string()),
                wireguard_config: None,
                kind: LinkKind::Veth,
            });
        }
        model.record(None, command);
        Ok(())
    }

    async fn add_wireguard_link(&self, name: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip link add {name} type wireguard");
        model.check("add_wireguard_link", command.clone())?;
        if model.link_index(None, name).is_some() {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        model.links.push(LinkState {
            name: name.to_string(),
            netns: None,
            up: false,
            addresses: Vec::new(),
            peer: None,
            wireguard_config: None,
            kind: LinkKind::Wireguard,
        });
        model.record(None, command);
        Ok(())
    }

    async fn apply_wireguard_config(
        &self,
        netns: Option<&str>,
        name: &str,
        config: &str,
    ) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("wg setconf {name} /dev/stdin");
        model.check("apply_wireguard_config", command.clone())?;
        model.require_namespace(netns, &command)?;
        let link = model.link_mut(netns, name, &command)?;
        if link.kind != LinkKind::Wireguard {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "Unable to modify interface: Protocol not supported".into(),
            });
        }
        link.wireguard_config = Some(config.to_string());
        model.record(netns, command);
        Ok(())
    }

    async fn delete_link(&self, netns: Option<&str>, name: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip link delete dev {name}");
        model.check("delete_link", command.clone())?;
        if let Some(idx) = model.link_index(netns, name) {
            model.remove_link_at(idx);
            model.record(netns, command);
        }
        Ok(())
    }

    async fn move_link(&self, name: &str, netns: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip link set {name} netns {netns}");
        model.check("move_link", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        let link = model.link_mut(None, name, &command)?;
        link.netns = Some(netns.to_string());
        // moving resets state and addresses like the kernel does
        link.up = false;
        link.addresses.clear();
        model.record(None, command);
        Ok(())
    }

    async fn set_link_state(
        &self,
        netns: Option<&str>,
        name: &str,
        up: bool,
    ) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let state = if up { "up" } else { "down" };
        let command = format!("ip link set dev {name} {state}");
        model.check("set_link_state", command.clone())?;
        model.require_namespace(netns, &command)?;
        // loopback exists in every namespace
        if name != "lo" {
            model.link_mut(netns, name, &command)?.up = up;
        }
        model.record(netns, command);
        Ok(())
    }

    async fn link_is_up(&self, netns: Option<&str>, name: &str) -> ControllerResult<bool> {
        let model = self.model.lock().await;
        model.check("link_is_up", format!("ip -o link show dev {name}"))?;
        Ok(model
            .link_index(netns, name)
            .map(|idx| model.links[idx].up)
            .unwrap_or(false))
    }

    async fn flush_addresses(&self, netns: Option<&str>, dev: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip addr flush dev {dev}");
        model.check("flush_addresses", command.clone())?;
        model.require_namespace(netns, &command)?;
        model.link_mut(netns, dev, &command)?.addresses.clear();
        model.record(netns, command);
        Ok(())
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        dev: &str,
        cidr: &str,
    ) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip addr add {cidr} dev {dev}");
        model.check("add_address", command.clone())?;
        model.require_namespace(netns, &command)?;
        let link = model.link_mut(netns, dev, &command)?;
        if link.addresses.iter().any(|a| a == cidr) {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        link.addresses.push(cidr.to_string());
        model.record(netns, command);
        Ok(())
    }

    async fn list_addresses(
        &self,
        netns: Option<&str>,
    ) -> ControllerResult<Vec<InterfaceAddress>> {
        let model = self.model.lock().await;
        model.check("list_addresses", "ip -o -4 addr show".into())?;
        model.require_namespace(netns, "ip -o -4 addr show")?;
        let mut addrs = Vec::new();
        for link in model.links.iter().filter(|l| l.netns.as_deref() == netns) {
            for cidr in &link.addresses {
                let Some((addr, prefix)) = cidr.split_once('/') else {
                    continue;
                };
                if let (Ok(address), Ok(prefix_len)) =
                    (addr.parse::<Ipv4Addr>(), prefix.parse::<u8>())
                {
                    addrs.push(InterfaceAddress {
                        interface: link.name.clone(),
                        address,
                        prefix_len,
                    });
                }
            }
        }
        Ok(addrs)
    }

    async fn flush_routes(&self, netns: &str, table: &str) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip route flush table {table}");
        model.check("flush_routes", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        let target = table.parse::<u32>().ok();
        if let Some(routes) = model.routes.get_mut(netns) {
            routes.retain(|r| r.table != target);
        }
        model.record(Some(netns), command);
        Ok(())
    }

    async fn add_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip route add {}", route.args().join(" "));
        model.check("add_route", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        if let Some(dev) = &route.dev {
            model.link_mut(Some(netns), dev, &command)?;
        }
        let routes = model.routes.entry(netns.to_string()).or_default();
        if routes
            .iter()
            .any(|r| r.destination == route.destination && r.table == route.table)
        {
            return Err(ControllerError::CommandFailure {
                command,
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        routes.push(route.clone());
        model.record(Some(netns), command);
        Ok(())
    }

    async fn replace_route(&self, netns: &str, route: &RouteSpec) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip route replace {}", route.args().join(" "));
        model.check("replace_route", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        if let Some(dev) = &route.dev {
            model.link_mut(Some(netns), dev, &command)?;
        }
        let routes = model.routes.entry(netns.to_string()).or_default();
        routes.retain(|r| !(r.destination == route.destination && r.table == route.table));
        routes.push(route.clone());
        model.record(Some(netns), command);
        Ok(())
    }

    async fn add_fwmark_rule(&self, netns: &str, mark: u32, table: u32) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("ip rule add fwmark {mark} lookup {table}");
        model.check("add_fwmark_rule", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        model
            .fwmark_rules
            .entry(netns.to_string())
            .or_default()
            .push((mark, table));
        model.record(Some(netns), command);
        Ok(())
    }

    async fn add_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
        placement: RulePlacement,
    ) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("iptables {}", rule.add_args(placement).join(" "));
        model.check("add_firewall_rule", command.clone())?;
        model.require_namespace(netns, &command)?;
        let rules = model.firewall.entry(netns.map(str::to_string)).or_default();
        match placement {
            RulePlacement::Append => rules.push(rule.clone()),
            RulePlacement::Insert(position) => {
                // position counts within the chain, 1-based
                let chain_positions = rules
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.table == rule.table && r.chain == rule.chain)
                    .map(|(idx, _)| idx)
                    .collect::<Vec<_>>();
                let wanted = position.saturating_sub(1) as usize;
                let at = chain_positions
                    .get(wanted)
                    .copied()
                    .unwrap_or(rules.len());
                rules.insert(at, rule.clone());
            }
        }
        model.record(netns, command);
        Ok(())
    }

    async fn delete_firewall_rule(
        &self,
        netns: Option<&str>,
        rule: &FirewallRule,
    ) -> ControllerResult<bool> {
        let mut model = self.model.lock().await;
        let command = format!("iptables {}", rule.delete_args().join(" "));
        model.check("delete_firewall_rule", command.clone())?;
        let Some(rules) = model.firewall.get_mut(&netns.map(str::to_string)) else {
            return Ok(false);
        };
        let Some(idx) = rules.iter().position(|r| r == rule) else {
            return Ok(false);
        };
        rules.remove(idx);
        model.record(netns, command);
        Ok(true)
    }

    async fn list_firewall_rules(
        &self,
        netns: Option<&str>,
        table: FirewallTable,
        chain: &str,
    ) -> ControllerResult<Vec<String>> {
        let model = self.model.lock().await;
        let command = format!("iptables -t {} -S {chain}", table.as_str());
        model.check("list_firewall_rules", command.clone())?;
        model.require_namespace(netns, &command)?;
        Ok(model
            .firewall
            .get(&netns.map(str::to_string))
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.table == table && r.chain == chain)
                    .map(FirewallRule::listing)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn enable_ip_forwarding(&self) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = "sysctl -w net.ipv4.ip_forward=1".to_string();
        model.check("enable_ip_forwarding", command.clone())?;
        if !model.ip_forwarding {
            model.ip_forwarding = true;
            model.record(None, command);
        }
        Ok(())
    }

    async fn write_namespace_resolv(
        &self,
        netns: &str,
        nameservers: &[String],
    ) -> ControllerResult<()> {
        let mut model = self.model.lock().await;
        let command = format!("write /etc/netns/{netns}/resolv.conf");
        model.check("write_namespace_resolv", command.clone())?;
        model
            .resolv
            .insert(netns.to_string(), nameservers.to_vec());
        model.record(None, command);
        Ok(())
    }

    async fn exec(&self, netns: Option<&str>, argv: &[&str]) -> ControllerResult<CommandOutput> {
        let mut model = self.model.lock().await;
        let command = argv.join(" ");
        model.check("exec", command.clone())?;
        if argv.is_empty() {
            return Err(ControllerError::InvalidInput("empty command".into()));
        }
        if let Err(ControllerError::CommandFailure { stderr, .. }) =
            model.require_namespace(netns, &command)
        {
            return Ok(CommandOutput {
                success: false,
                stdout: String::new(),
                stderr,
            });
        }
        if argv[0] == "kill" {
            model.record(netns, command);
        }
        Ok(model.simulate(netns, argv))
    }

    async fn launch_detached(&self, netns: &str, spec: &LaunchSpec) -> ControllerResult<u32> {
        let mut model = self.model.lock().await;
        let command = format!(
            "{} {} > {} 2>&1 &",
            spec.program.display(),
            spec.args.join(" "),
            spec.log_path.display()
        );
        model.check("launch_detached", command.clone())?;
        model.require_namespace(Some(netns), &command)?;
        let pid = model.next_pid;
        model.next_pid += 1;
        let process = ProcessState {
            pid,
            netns: netns.to_string(),
            spec: spec.clone(),
        };
        model.processes.push(process.clone());
        model.launches.push(process);
        model.record(Some(netns), command);
        Ok(pid)
    }
}
