//! Pushes the current credential set to every managed namespace's proxy.

use crate::credentials::{
    extract, ChangeDetector, CredentialSet, CredentialSourceError, SourceLocation, SyncDecision,
};
use crate::network::{ControllerError, FirewallTable, NetworkController};
use crate::persistence::{StateError, StateStore};
use crate::proxy::ProxySupervisor;
use crate::topology::{is_managed_address, is_managed_namespace, Topology};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] CredentialSourceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot enumerate namespaces: {0}")]
    Network(#[from] ControllerError),
}

/// What happened to one namespace during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NamespaceOutcome {
    /// Proxy relaunched with the new list.
    Restarted { pid: u32 },
    /// Credential file rewritten; proxy left running.
    Recorded,
    /// No derivable address or port.
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSync {
    pub namespace: String,
    pub port: Option<u16>,
    #[serde(flatten)]
    pub outcome: NamespaceOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub credentials: usize,
    pub synced: bool,
    pub namespaces: Vec<NamespaceSync>,
}

impl SyncReport {
    pub fn restarted(&self) -> usize {
        self.namespaces
            .iter()
            .filter(|n| matches!(n.outcome, NamespaceOutcome::Restarted { .. }))
            .count()
    }
}

pub struct Synchronizer {
    network: Arc<dyn NetworkController>,
    store: Arc<StateStore>,
    detector: ChangeDetector,
    proxy: Arc<ProxySupervisor>,
}

impl Synchronizer {
    pub fn new(
        network: Arc<dyn NetworkController>,
        store: Arc<StateStore>,
        proxy: Arc<ProxySupervisor>,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(store.clone()),
            network,
            store,
            proxy,
        }
    }

    /// Extract from `source` and push the result to every namespace.
    pub async fn refresh(
        &self,
        source: &SourceLocation,
        force: bool,
    ) -> Result<SyncReport, SyncError> {
        let credentials = extract(&source.db_path).await?;
        debug!(source = %source, count = credentials.len(), "credentials extracted");
        self.sync_all(&credentials, force).await
    }

    pub async fn sync_all(
        &self,
        credentials: &CredentialSet,
        force: bool,
    ) -> Result<SyncReport, SyncError> {
        if credentials.is_empty() {
            warn!("credential set is empty, nothing to push");
            return Ok(SyncReport::default());
        }

        let source_changed = match credentials.source_modified() {
            Some(mtime) => self.detector.observe_source(Some(mtime)).await?,
            None => false,
        };
        let SyncDecision { sync, .. } = self.detector.decide(credentials, source_changed, force).await?;

        let ids = credentials.sorted_ids();
        let mut namespaces = self.network.list_namespaces().await?;
        namespaces.retain(|n| is_managed_namespace(n));
        namespaces.sort();

        let mut report = SyncReport {
            credentials: ids.len(),
            synced: sync,
            namespaces: Vec::with_capacity(namespaces.len()),
        };

        for namespace in namespaces {
            let entry = self.sync_namespace(&namespace, &ids, sync).await;
            report.namespaces.push(entry);
        }

        let failed = report
            .namespaces
            .iter()
            .filter(|n| matches!(n.outcome, NamespaceOutcome::Failed { .. }))
            .count();
        if failed > 0 {
            // Namespaces that missed this set must be pushed again next pass.
            warn!(failed, "credential sync incomplete, will retry next pass");
            self.store.clear_fingerprint_hash().await?;
        }

        if sync {
            info!(
                credentials = report.credentials,
                restarted = report.restarted(),
                "credential sync applied"
            );
        } else {
            debug!(credentials = report.credentials, "credentials unchanged");
        }
        Ok(report)
    }

    async fn sync_namespace(&self, namespace: &str, ids: &[String], sync: bool) -> NamespaceSync {
        let (ns_ip, port) = match self.locate(namespace).await {
            Ok(found) => found,
            Err(reason) => {
                warn!(namespace, %reason, "skipping namespace");
                return NamespaceSync {
                    namespace: namespace.to_string(),
                    port: None,
                    outcome: NamespaceOutcome::Skipped { reason },
                };
            }
        };

        let outcome = match self.push(namespace, port, ids, sync).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(namespace, port, %ns_ip, %reason, "proxy sync failed");
                NamespaceOutcome::Failed { reason }
            }
        };
        NamespaceSync {
            namespace: namespace.to_string(),
            port: Some(port),
            outcome,
        }
    }

    async fn push(
        &self,
        namespace: &str,
        port: u16,
        ids: &[String],
        sync: bool,
    ) -> Result<NamespaceOutcome, String> {
        self.store
            .save_credentials(port, ids)
            .await
            .map_err(|e| e.to_string())?;
        if !sync {
            return Ok(NamespaceOutcome::Recorded);
        }
        let restart = self
            .proxy
            .restart(namespace, port, ids)
            .await
            .map_err(|e| e.to_string())?;
        Ok(NamespaceOutcome::Restarted { pid: restart.pid })
    }

    /// Namespace address plus the public port forwarded to it.
    async fn locate(&self, namespace: &str) -> Result<(Ipv4Addr, u16), String> {
        let ns_ip = self
            .network
            .list_addresses(Some(namespace))
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(|a| a.address)
            .find(is_managed_address)
            .ok_or_else(|| "no managed address".to_string())?;

        let rules = self
            .network
            .list_firewall_rules(None, FirewallTable::Nat, "PREROUTING")
            .await
            .map_err(|e| e.to_string())?;
        if let Some(port) = dnat_port(&rules, ns_ip) {
            return Ok((ns_ip, port));
        }

        // Rules may have been flushed; a recorded tunnel still names its port.
        if let Some(port) = Topology::port_from_namespace(namespace) {
            if matches!(self.store.load(port).await, Ok(Some(_))) {
                debug!(namespace, port, "port taken from tunnel record");
                return Ok((ns_ip, port));
            }
        }
        Err(format!("no DNAT rule forwards to {ns_ip}"))
    }
}

/// Port of the first `--to-destination <ns_ip>:<port>` rule.
pub fn dnat_port(rules: &[String], ns_ip: Ipv4Addr) -> Option<u16> {
    rules.iter().find_map(|rule| {
        let mut tokens = rule.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "--to-destination" {
                let (ip, port) = tokens.next()?.rsplit_once(':')?;
                if ip.parse::<Ipv4Addr>().ok()? == ns_ip {
                    return port.parse::<u16>().ok();
                }
            }
        }
        None
    })
}
