//! Builds and tears down one tunnel environment.
//!
//! Creation is cleanup-then-create: stale objects carrying the derived names
//! are removed first, then the namespace, veth pair, wireguard interface,
//! policy routing, NAT and forwarding rules are laid down in order. Every
//! object created on the host is pushed onto an undo list; a failure unwinds
//! that list in reverse before the error is returned, and the tunnel record is
//! only written once everything succeeded.

use crate::network::{
    ControllerError, FirewallRule, FirewallTable, NetworkController, RouteSpec, RulePlacement,
};
use crate::persistence::{StateError, StateStore};
use crate::resolver::EndpointResolver;
use crate::topology::{
    conflicting_ports, is_managed_address, is_managed_namespace, Topology, TopologyError,
    BYPASS_FWMARK, BYPASS_TABLE,
};
use crate::tunnel_config::{TunnelConfig, TunnelConfigError};
use serde::Serialize;
use shared_utils::config::NetworkConfig;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Upper bound on removing duplicate copies of one rule.
const MAX_DUPLICATE_RULES: usize = 16;
const PROTOCOLS: [&str; 2] = ["tcp", "udp"];

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    InvalidPort(#[from] TopologyError),

    #[error("port {port} shares its subnet with active port(s) {conflicting:?}")]
    SubnetInUse { port: u16, conflicting: Vec<u16> },

    #[error("failed to create namespace {namespace}: {source}")]
    NamespaceCreateFailed {
        namespace: String,
        #[source]
        source: ControllerError,
    },

    #[error("failed to create link {link}: {source}")]
    LinkCreateFailed {
        link: String,
        #[source]
        source: ControllerError,
    },

    #[error("could not resolve tunnel endpoint {host}")]
    EndpointResolutionFailed { host: String },

    #[error("failed to set up tunnel interface {interface}: {source}")]
    TunnelInterfaceCreateFailed {
        interface: String,
        #[source]
        source: ControllerError,
    },

    #[error("tunnel config {path} is invalid: {reason}")]
    TunnelConfigInvalid { path: PathBuf, reason: String },

    #[error("failed to install routing in {namespace}: {source}")]
    Routing {
        namespace: String,
        #[source]
        source: ControllerError,
    },

    #[error("failed to install firewall rules: {source}")]
    Firewall {
        #[source]
        source: ControllerError,
    },

    #[error("failed to write namespace files for {namespace}: {source}")]
    NamespaceFiles {
        namespace: String,
        #[source]
        source: ControllerError,
    },

    #[error("namespace {0} does not exist")]
    NamespaceMissing(String),

    #[error("failed to inspect host networking: {0}")]
    Query(#[source] ControllerError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<TunnelConfigError> for ProvisioningError {
    fn from(err: TunnelConfigError) -> Self {
        let path = match &err {
            TunnelConfigError::Io { path, .. } | TunnelConfigError::MissingEndpoint(path) => {
                path.clone()
            }
            TunnelConfigError::InvalidEndpoint(_) => PathBuf::new(),
        };
        ProvisioningError::TunnelConfigInvalid {
            path,
            reason: err.to_string(),
        }
    }
}

/// A provisioned tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub topology: Topology,
    pub config_path: PathBuf,
    pub endpoint_host: String,
    pub endpoint_ip: Ipv4Addr,
    pub tunnel_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The namespace already existed; nothing was touched.
    AlreadyPresent,
    Provisioned(Tunnel),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub port: u16,
    pub namespace_existed: bool,
    pub proxies_terminated: usize,
    pub rules_removed: usize,
    pub record_removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandshakeStatus {
    Established,
    NotYetEstablished,
}

/// Row of [`Provisioner::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub port: u16,
    pub namespace: String,
    pub namespace_ip: Option<Ipv4Addr>,
    pub tunnel_interface: Option<String>,
    pub tunnel_up: bool,
    pub proxy_listening: bool,
    pub config_path: Option<PathBuf>,
}

/// Host objects to remove if creation fails part way.
#[derive(Debug)]
enum Undo {
    Namespace(String),
    HostLink(String),
    HostRule(FirewallRule),
}

pub struct Provisioner {
    network: Arc<dyn NetworkController>,
    resolver: Arc<dyn EndpointResolver>,
    store: Arc<StateStore>,
    settings: NetworkConfig,
    port_locks: Mutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(
        network: Arc<dyn NetworkController>,
        resolver: Arc<dyn EndpointResolver>,
        store: Arc<StateStore>,
        settings: NetworkConfig,
    ) -> Self {
        Self {
            network,
            resolver,
            store,
            settings,
            port_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize operations on one port.
    async fn lock_port(&self, port: u16) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.port_locks.lock().await;
            locks
                .entry(port)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn create(&self, port: u16, config_path: &Path) -> Result<Tunnel, ProvisioningError> {
        let _guard = self.lock_port(port).await;
        self.create_locked(port, config_path).await
    }

    /// Like [`create`](Self::create) but a no-op success when the namespace
    /// already exists.
    pub async fn restore(
        &self,
        port: u16,
        config_path: &Path,
    ) -> Result<RestoreOutcome, ProvisioningError> {
        let _guard = self.lock_port(port).await;
        let topo = Topology::for_port(port)?;
        let exists = self
            .network
            .namespace_exists(&topo.namespace)
            .await
            .map_err(ProvisioningError::Query)?;
        if exists {
            debug!(port, namespace = %topo.namespace, "namespace present, restore skipped");
            return Ok(RestoreOutcome::AlreadyPresent);
        }
        self.create_locked(port, config_path)
            .await
            .map(RestoreOutcome::Provisioned)
    }

    async fn create_locked(
        &self,
        port: u16,
        config_path: &Path,
    ) -> Result<Tunnel, ProvisioningError> {
        let topo = Topology::for_port(port)?;
        let tunnel_config = TunnelConfig::load(config_path).await?;
        self.check_subnet(&topo).await?;

        info!(port, namespace = %topo.namespace, config = %config_path.display(), "provisioning tunnel");
        self.cleanup_stale(&topo).await;

        let endpoint_ip = self
            .resolver
            .resolve(&tunnel_config.endpoint_host)
            .await
            .ok_or_else(|| ProvisioningError::EndpointResolutionFailed {
                host: tunnel_config.endpoint_host.clone(),
            })?;

        let mut undo = Vec::new();
        if let Err(err) = self
            .build(&topo, &tunnel_config, endpoint_ip, &mut undo)
            .await
        {
            warn!(port, "provisioning failed, rolling back: {err}");
            self.rollback(undo).await;
            return Err(err);
        }

        if let Err(err) = self.store.save(port, config_path).await {
            warn!(port, "cannot persist tunnel record, rolling back: {err}");
            self.rollback(undo).await;
            return Err(err.into());
        }

        info!(port, namespace = %topo.namespace, endpoint = %endpoint_ip, "tunnel ready");
        Ok(Tunnel {
            topology: topo,
            config_path: config_path.to_path_buf(),
            endpoint_host: tunnel_config.endpoint_host,
            endpoint_ip,
            tunnel_address: tunnel_config.address,
        })
    }

    async fn check_subnet(&self, topo: &Topology) -> Result<(), ProvisioningError> {
        let active = match self.network.list_namespaces().await {
            Ok(names) => names
                .iter()
                .filter_map(|n| Topology::port_from_namespace(n))
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(port = topo.port, "cannot list namespaces for subnet check: {err}");
                return Ok(());
            }
        };
        let conflicting = conflicting_ports(topo.port, active);
        if conflicting.is_empty() {
            Ok(())
        } else {
            Err(ProvisioningError::SubnetInUse {
                port: topo.port,
                conflicting,
            })
        }
    }

    async fn cleanup_stale(&self, topo: &Topology) {
        if let Err(err) = self.network.delete_namespace(&topo.namespace).await {
            warn!(namespace = %topo.namespace, "stale namespace cleanup failed: {err}");
        }
        for link in [&topo.host_link, &topo.tunnel_interface] {
            if let Err(err) = self.network.delete_link(None, link).await {
                warn!(link = %link, "stale link cleanup failed: {err}");
            }
        }
        let mut rules = host_rules(topo)
            .into_iter()
            .map(|(rule, _)| rule)
            .collect::<Vec<_>>();
        rules.extend(log_rules(topo));
        self.remove_rules(&rules).await;
    }

    async fn build(
        &self,
        topo: &Topology,
        cfg: &TunnelConfig,
        endpoint_ip: Ipv4Addr,
        undo: &mut Vec<Undo>,
    ) -> Result<(), ProvisioningError> {
        let net = &self.network;
        let ns = topo.namespace.as_str();

        net.add_namespace(ns)
            .await
            .map_err(|source| ProvisioningError::NamespaceCreateFailed {
                namespace: ns.to_string(),
                source,
            })?;
        undo.push(Undo::Namespace(ns.to_string()));

        // veth pair
        let link_err = |link: &str| {
            let link = link.to_string();
            move |source| ProvisioningError::LinkCreateFailed { link, source }
        };
        net.add_veth_pair(&topo.host_link, &topo.ns_link)
            .await
            .map_err(link_err(&topo.host_link))?;
        undo.push(Undo::HostLink(topo.host_link.clone()));
        net.set_link_state(None, &topo.host_link, true)
            .await
            .map_err(link_err(&topo.host_link))?;
        net.flush_addresses(None, &topo.host_link)
            .await
            .map_err(link_err(&topo.host_link))?;
        net.add_address(None, &topo.host_link, &topo.host_cidr())
            .await
            .map_err(link_err(&topo.host_link))?;
        net.move_link(&topo.ns_link, ns)
            .await
            .map_err(link_err(&topo.ns_link))?;
        net.set_link_state(Some(ns), "lo", true)
            .await
            .map_err(link_err("lo"))?;
        net.set_link_state(Some(ns), &topo.ns_link, true)
            .await
            .map_err(link_err(&topo.ns_link))?;
        net.flush_addresses(Some(ns), &topo.ns_link)
            .await
            .map_err(link_err(&topo.ns_link))?;
        net.add_address(Some(ns), &topo.ns_link, &topo.ns_cidr())
            .await
            .map_err(link_err(&topo.ns_link))?;

        // tunnel interface
        let wg = topo.tunnel_interface.as_str();
        let wg_err = |source| ProvisioningError::TunnelInterfaceCreateFailed {
            interface: wg.to_string(),
            source,
        };
        net.add_wireguard_link(wg).await.map_err(wg_err)?;
        undo.push(Undo::HostLink(wg.to_string()));
        net.apply_wireguard_config(None, wg, &cfg.stripped)
            .await
            .map_err(|source| ProvisioningError::TunnelConfigInvalid {
                path: cfg.path.clone(),
                reason: source.to_string(),
            })?;
        net.move_link(wg, ns).await.map_err(wg_err)?;
        net.add_address(Some(ns), wg, &cfg.address)
            .await
            .map_err(wg_err)?;
        net.set_link_state(Some(ns), wg, true)
            .await
            .map_err(wg_err)?;

        // policy routing
        let route_err = |source| ProvisioningError::Routing {
            namespace: ns.to_string(),
            source,
        };
        net.flush_routes(ns, "main").await.map_err(route_err)?;
        net.flush_routes(ns, &BYPASS_TABLE.to_string())
            .await
            .map_err(route_err)?;
        for route in namespace_routes(topo, endpoint_ip) {
            net.add_route(ns, &route).await.map_err(route_err)?;
        }
        net.add_fwmark_rule(ns, BYPASS_FWMARK, BYPASS_TABLE)
            .await
            .map_err(route_err)?;

        // NAT and forwarding
        let fw_err = |source| ProvisioningError::Firewall { source };
        net.enable_ip_forwarding().await.map_err(fw_err)?;
        for (rule, placement) in namespace_rules(topo) {
            net.add_firewall_rule(Some(ns), &rule, placement)
                .await
                .map_err(fw_err)?;
        }
        for (rule, placement) in host_rules(topo) {
            net.add_firewall_rule(None, &rule, placement)
                .await
                .map_err(fw_err)?;
            undo.push(Undo::HostRule(rule));
        }

        net.write_namespace_resolv(ns, &self.settings.namespace_dns)
            .await
            .map_err(|source| ProvisioningError::NamespaceFiles {
                namespace: ns.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::HostRule(rule) => self
                    .network
                    .delete_firewall_rule(None, rule)
                    .await
                    .map(|_| ()),
                Undo::HostLink(name) => self.network.delete_link(None, name).await,
                Undo::Namespace(name) => self.network.delete_namespace(name).await,
            };
            if let Err(err) = result {
                warn!(?step, "rollback step failed: {err}");
            }
        }
    }

    /// Remove every copy of each rule from the host; returns how many went.
    async fn remove_rules(&self, rules: &[FirewallRule]) -> usize {
        let mut removed = 0;
        for rule in rules {
            for _ in 0..MAX_DUPLICATE_RULES {
                match self.network.delete_firewall_rule(None, rule).await {
                    Ok(true) => removed += 1,
                    Ok(false) => break,
                    Err(err) => {
                        warn!(%rule, "rule removal failed: {err}");
                        break;
                    }
                }
            }
        }
        removed
    }

    /// Best-effort teardown. Objects that are already gone are not errors.
    pub async fn delete(&self, port: u16) -> Result<DeleteReport, ProvisioningError> {
        let _guard = self.lock_port(port).await;
        let topo = Topology::for_port(port)?;
        let ns = topo.namespace.as_str();
        let mut report = DeleteReport {
            port,
            ..Default::default()
        };

        report.namespace_existed = self.network.namespace_exists(ns).await.unwrap_or_else(|err| {
            warn!(namespace = ns, "cannot query namespaces: {err}");
            false
        });
        if report.namespace_existed {
            // processes would keep the namespace alive after deletion
            match self.network.listening_pids(ns, port).await {
                Ok(pids) if !pids.is_empty() => {
                    report.proxies_terminated = pids.len();
                    if let Err(err) = self.network.terminate(ns, &pids).await {
                        warn!(namespace = ns, "failed to terminate proxy: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(namespace = ns, "cannot list listeners: {err}"),
            }
        } else {
            info!(namespace = ns, "namespace not found, cleaning up orphaned rules");
        }

        if let Err(err) = self.network.delete_namespace(ns).await {
            warn!(namespace = ns, "failed to delete namespace: {err}");
        }
        for link in [&topo.host_link, &topo.tunnel_interface] {
            if let Err(err) = self.network.delete_link(None, link).await {
                warn!(link = %link, "failed to delete link: {err}");
            }
        }

        let mut rules = host_rules(&topo)
            .into_iter()
            .map(|(rule, _)| rule)
            .collect::<Vec<_>>();
        rules.extend(log_rules(&topo));
        report.rules_removed = self.remove_rules(&rules).await;

        report.record_removed = match self.store.delete(port).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(port, "failed to remove tunnel record: {err}");
                false
            }
        };

        info!(
            port,
            namespace_existed = report.namespace_existed,
            rules_removed = report.rules_removed,
            "tunnel deleted"
        );
        Ok(report)
    }

    /// Cycle the tunnel interface, refresh routes and wait for a handshake.
    pub async fn restart_tunnel(&self, port: u16) -> Result<HandshakeStatus, ProvisioningError> {
        let _guard = self.lock_port(port).await;
        let topo = Topology::for_port(port)?;
        let ns = topo.namespace.as_str();
        let net = &self.network;

        let exists = net
            .namespace_exists(ns)
            .await
            .map_err(ProvisioningError::Query)?;
        if !exists {
            return Err(ProvisioningError::NamespaceMissing(ns.to_string()));
        }

        let wg_err = |interface: &str| {
            let interface = interface.to_string();
            move |source| ProvisioningError::TunnelInterfaceCreateFailed { interface, source }
        };
        let wg = net
            .wireguard_interfaces(ns)
            .await
            .map_err(wg_err(&topo.tunnel_interface))?
            .into_iter()
            .next()
            .unwrap_or_else(|| topo.tunnel_interface.clone());

        let endpoint_ip = self.resolve_recorded_endpoint(port).await;
        let pause = self.settings.handshake_interval();

        info!(port, interface = %wg, "restarting tunnel interface");
        net.set_link_state(Some(ns), &wg, false)
            .await
            .map_err(wg_err(&wg))?;
        tokio::time::sleep(pause).await;
        net.set_link_state(Some(ns), &wg, true)
            .await
            .map_err(wg_err(&wg))?;
        tokio::time::sleep(pause).await;

        let route_err = |source| ProvisioningError::Routing {
            namespace: ns.to_string(),
            source,
        };
        let mut routes = vec![RouteSpec::to(topo.subnet().to_string())
            .dev(&topo.ns_link)
            .link_src(topo.ns_ip)];
        if let Some(ip) = endpoint_ip {
            routes.push(
                RouteSpec::to(format!("{ip}/32"))
                    .via(topo.host_ip)
                    .dev(&topo.ns_link),
            );
        }
        routes.push(RouteSpec::to("default").dev(&wg));
        for route in &routes {
            net.replace_route(ns, route).await.map_err(route_err)?;
        }

        for attempt in 1..=self.settings.handshake_attempts {
            tokio::time::sleep(pause).await;
            match net.handshake_seen(ns, &wg).await {
                Ok(true) => {
                    info!(port, attempt, "tunnel handshake established");
                    return Ok(HandshakeStatus::Established);
                }
                Ok(false) => debug!(port, attempt, "no handshake yet"),
                Err(err) => debug!(port, attempt, "handshake check failed: {err}"),
            }
        }
        warn!(port, "tunnel restarted without a handshake");
        Ok(HandshakeStatus::NotYetEstablished)
    }

    async fn resolve_recorded_endpoint(&self, port: u16) -> Option<Ipv4Addr> {
        let record = match self.store.load(port).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                warn!(port, "cannot read tunnel record: {err}");
                return None;
            }
        };
        match TunnelConfig::load(&record.config_path).await {
            Ok(cfg) => self.resolver.resolve(&cfg.endpoint_host).await,
            Err(err) => {
                warn!(port, "cannot re-read tunnel config: {err}");
                None
            }
        }
    }

    /// Insert kernel LOG rules for the port's ingress, forward and return
    /// traffic. Returns the number of rules installed.
    pub async fn enable_packet_logging(&self, port: u16) -> Result<usize, ProvisioningError> {
        let topo = Topology::for_port(port)?;
        let rules = log_rules(&topo);
        self.remove_rules(&rules).await;
        for rule in &rules {
            self.network
                .add_firewall_rule(None, rule, RulePlacement::Insert(1))
                .await
                .map_err(|source| ProvisioningError::Firewall { source })?;
        }
        info!(port, count = rules.len(), "packet logging enabled");
        Ok(rules.len())
    }

    pub async fn disable_packet_logging(&self, port: u16) -> Result<usize, ProvisioningError> {
        let topo = Topology::for_port(port)?;
        Ok(self.remove_rules(&log_rules(&topo)).await)
    }

    /// Status of every managed namespace, ordered by port.
    pub async fn list(&self) -> Result<Vec<TunnelStatus>, ProvisioningError> {
        let net = &self.network;
        let names = net
            .list_namespaces()
            .await
            .map_err(ProvisioningError::Query)?;

        let mut rows = Vec::new();
        for name in names.into_iter().filter(|n| is_managed_namespace(n)) {
            let Some(port) = Topology::port_from_namespace(&name) else {
                continue;
            };
            let namespace_ip = net
                .list_addresses(Some(&name))
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|a| a.address)
                .find(is_managed_address);
            let tunnel_interface = net
                .wireguard_interfaces(&name)
                .await
                .unwrap_or_default()
                .into_iter()
                .next();
            let tunnel_up = match &tunnel_interface {
                Some(iface) => net.link_is_up(Some(&name), iface).await.unwrap_or(false),
                None => false,
            };
            let proxy_listening = net
                .listening_pids(&name, port)
                .await
                .map(|pids| !pids.is_empty())
                .unwrap_or(false);
            let config_path = self
                .store
                .load(port)
                .await
                .ok()
                .flatten()
                .map(|r| r.config_path);

            rows.push(TunnelStatus {
                port,
                namespace: name,
                namespace_ip,
                tunnel_interface,
                tunnel_up,
                proxy_listening,
                config_path,
            });
        }
        rows.sort_by_key(|r| r.port);
        Ok(rows)
    }
}

fn namespace_routes(topo: &Topology, endpoint_ip: Ipv4Addr) -> Vec<RouteSpec> {
    vec![
        RouteSpec::to(topo.subnet().to_string())
            .dev(&topo.ns_link)
            .link_src(topo.ns_ip),
        RouteSpec::to(format!("{endpoint_ip}/32")).via(topo.host_ip),
        RouteSpec::to("default").dev(&topo.tunnel_interface),
        RouteSpec::to("default")
            .via(topo.host_ip)
            .dev(&topo.ns_link)
            .table(BYPASS_TABLE),
    ]
}

/// Rules living inside the namespace; they vanish with it.
fn namespace_rules(topo: &Topology) -> Vec<(FirewallRule, RulePlacement)> {
    let ns_ip = topo.ns_ip.to_string();
    let mark = BYPASS_FWMARK.to_string();
    vec![
        (
            FirewallRule::new(
                FirewallTable::Mangle,
                "OUTPUT",
                &[
                    "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-s", &ns_ip, "-j",
                    "MARK", "--set-mark", &mark,
                ],
            ),
            RulePlacement::Append,
        ),
        (
            FirewallRule::new(
                FirewallTable::Nat,
                "POSTROUTING",
                &["-o", &topo.tunnel_interface, "-j", "MASQUERADE"],
            ),
            RulePlacement::Append,
        ),
    ]
}

/// Host NAT and forwarding rules for the tunnel.
pub fn host_rules(topo: &Topology) -> Vec<(FirewallRule, RulePlacement)> {
    let port = topo.port.to_string();
    let subnet = topo.subnet().to_string();
    let ns_host = format!("{}/32", topo.ns_ip);
    let target = format!("{}:{}", topo.ns_ip, topo.port);

    let mut rules = vec![(
        FirewallRule::new(
            FirewallTable::Nat,
            "POSTROUTING",
            &["-s", &subnet, "!", "-o", &topo.host_link, "-j", "MASQUERADE"],
        ),
        RulePlacement::Append,
    )];
    for proto in PROTOCOLS {
        rules.push((
            FirewallRule::new(
                FirewallTable::Nat,
                "PREROUTING",
                &["-p", proto, "--dport", &port, "-j", "DNAT", "--to-destination", &target],
            ),
            RulePlacement::Append,
        ));
        rules.push((
            FirewallRule::new(
                FirewallTable::Filter,
                "FORWARD",
                &["-p", proto, "-d", &ns_host, "--dport", &port, "-j", "ACCEPT"],
            ),
            RulePlacement::Insert(1),
        ));
        rules.push((
            FirewallRule::new(
                FirewallTable::Filter,
                "FORWARD",
                &["-p", proto, "-s", &ns_host, "-j", "ACCEPT"],
            ),
            RulePlacement::Insert(1),
        ));
    }
    rules
}

/// Kernel LOG rules with per-port prefixes.
pub fn log_rules(topo: &Topology) -> Vec<FirewallRule> {
    let port = topo.port.to_string();
    let ns_host = format!("{}/32", topo.ns_ip);
    let dnat = format!("[DNAT-{port}] ");
    let fwd = format!("[FWD-{port}] ");
    let ret = format!("[RET-{port}] ");

    let mut rules = Vec::new();
    for proto in PROTOCOLS {
        rules.push(FirewallRule::new(
            FirewallTable::Nat,
            "PREROUTING",
            &[
                "-p", proto, "--dport", &port, "-j", "LOG", "--log-prefix", &dnat, "--log-level",
                "4",
            ],
        ));
        rules.push(FirewallRule::new(
            FirewallTable::Filter,
            "FORWARD",
            &[
                "-p", proto, "-d", &ns_host, "--dport", &port, "-j", "LOG", "--log-prefix", &fwd,
                "--log-level", "4",
            ],
        ));
        rules.push(FirewallRule::new(
            FirewallTable::Filter,
            "FORWARD",
            &[
                "-p", proto, "-s", &ns_host, "-j", "LOG", "--log-prefix", &ret, "--log-level",
                "4",
            ],
        ));
    }
    rules
}

/// Log prefixes installed by [`log_rules`]; used to filter kernel output.
pub fn log_prefixes(port: u16) -> [String; 3] {
    [
        format!("[DNAT-{port}]"),
        format!("[FWD-{port}]"),
        format!("[RET-{port}]"),
    ]
}
