//! Bring tunnels back after a reboot.
//!
//! Discovery runs in three tiers and stops at the first one that finds
//! anything:
//!
//! 1. tunnel records in the state store;
//! 2. managed namespaces that still exist, matched to config files by a set
//!    of well-known names or by the port appearing in a `.conf` filename;
//! 3. any `.conf` file that looks like a tunnel config, with the port taken
//!    from the first run of digits in its filename.
//!
//! Tiers 2 and 3 are guesses. Every match they make is logged so operators
//! can audit it. A forced credential sync always follows.

use crate::context::AppContext;
use crate::persistence::StateError;
use crate::provisioner::{ProvisioningError, RestoreOutcome};
use crate::sync::SyncReport;
use crate::topology::{is_managed_address, Topology};
use crate::tunnel_config::looks_like_tunnel_config;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

const CONFIG_EXTENSION: &str = "conf";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("tunnel config {path} for port {port} does not exist")]
    MissingConfig { port: u16, path: PathBuf },

    #[error("port {port} claimed by both {first} and {second}")]
    NameCollision {
        port: u16,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("failed to restore port {port}: {source}")]
    Provisioning {
        port: u16,
        #[source]
        source: ProvisioningError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryTier {
    StateStore,
    NamespaceIntrospection,
    FilesystemScan,
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub port: u16,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub tier: DiscoveryTier,
    pub discovered: usize,
    pub restored: Vec<u16>,
    pub already_present: Vec<u16>,
    pub failures: Vec<RestoreFailure>,
    pub sync: Option<SyncReport>,
}

impl RestoreReport {
    fn new(tier: DiscoveryTier, discovered: usize) -> Self {
        Self {
            tier,
            discovered,
            restored: Vec::new(),
            already_present: Vec::new(),
            failures: Vec::new(),
            sync: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    port: u16,
    config_path: PathBuf,
}

pub struct RestoreOrchestrator {
    ctx: Arc<AppContext>,
}

impl RestoreOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn restore_all(&self) -> Result<RestoreReport, RestoreError> {
        let (tier, candidates, mut failures) = self.discover().await?;
        let mut report = RestoreReport::new(tier, candidates.len() + failures.len());
        info!(?tier, count = report.discovered, "restoring tunnels");

        for candidate in candidates {
            match self.restore_one(&candidate).await {
                Ok(RestoreOutcome::Provisioned(_)) => report.restored.push(candidate.port),
                Ok(RestoreOutcome::AlreadyPresent) => {
                    info!(port = candidate.port, "tunnel already present");
                    report.already_present.push(candidate.port);
                }
                Err(err) => {
                    error!(port = candidate.port, "restore failed: {err}");
                    failures.push(RestoreFailure {
                        port: candidate.port,
                        error: err.to_string(),
                    });
                }
            }
        }
        report.failures = failures;

        report.sync = self.resync(&report.restored).await;
        info!(
            restored = report.restored.len(),
            already_present = report.already_present.len(),
            failed = report.failures.len(),
            "restore finished"
        );
        Ok(report)
    }

    /// Provision one tunnel from an explicit config file. An existing
    /// namespace is torn down first when `recreate` is set, otherwise left
    /// alone.
    pub async fn restore_from_file(
        &self,
        port: u16,
        config_path: &Path,
        recreate: bool,
    ) -> Result<RestoreOutcome, RestoreError> {
        let candidate = Candidate {
            port,
            config_path: config_path.to_path_buf(),
        };
        if recreate {
            let topo = Topology::for_port(port).map_err(|e| RestoreError::Provisioning {
                port,
                source: e.into(),
            })?;
            if self
                .ctx
                .network()
                .namespace_exists(&topo.namespace)
                .await
                .unwrap_or(false)
            {
                info!(port, "recreating existing tunnel");
                self.ctx
                    .provisioner()
                    .delete(port)
                    .await
                    .map_err(|source| RestoreError::Provisioning { port, source })?;
            }
        }

        let outcome = self.restore_one(&candidate).await?;
        if let RestoreOutcome::Provisioned(_) = outcome {
            self.resync(&[port]).await;
        }
        Ok(outcome)
    }

    async fn restore_one(&self, candidate: &Candidate) -> Result<RestoreOutcome, RestoreError> {
        let port = candidate.port;
        if fs::metadata(&candidate.config_path).await.is_err() {
            return Err(RestoreError::MissingConfig {
                port,
                path: candidate.config_path.clone(),
            });
        }
        self.ctx
            .provisioner()
            .restore(port, &candidate.config_path)
            .await
            .map_err(|source| RestoreError::Provisioning { port, source })
    }

    async fn discover(
        &self,
    ) -> Result<(DiscoveryTier, Vec<Candidate>, Vec<RestoreFailure>), RestoreError> {
        let records = self.ctx.store().load_all().await?;
        if !records.is_empty() {
            let candidates = records
                .into_iter()
                .map(|r| Candidate {
                    port: r.port,
                    config_path: r.config_path,
                })
                .collect();
            return Ok((DiscoveryTier::StateStore, candidates, Vec::new()));
        }

        let introspected = self.introspect_namespaces().await?;
        if !introspected.is_empty() {
            return Ok((DiscoveryTier::NamespaceIntrospection, introspected, Vec::new()));
        }

        let (scanned, collisions) = self.scan_filesystem().await;
        if !scanned.is_empty() || !collisions.is_empty() {
            return Ok((DiscoveryTier::FilesystemScan, scanned, collisions));
        }

        info!("no tunnels to restore");
        Ok((DiscoveryTier::Nothing, Vec::new(), Vec::new()))
    }

    /// Tier 2. Found configs are recorded so the next restore uses tier 1.
    async fn introspect_namespaces(&self) -> Result<Vec<Candidate>, RestoreError> {
        let network = self.ctx.network();
        let namespaces = match network.list_namespaces().await {
            Ok(names) => names,
            Err(err) => {
                warn!("cannot list namespaces: {err}");
                return Ok(Vec::new());
            }
        };

        let mut found = Vec::new();
        for namespace in namespaces {
            let Some(port) = Topology::port_from_namespace(&namespace) else {
                continue;
            };
            let has_address = network
                .list_addresses(Some(&namespace))
                .await
                .map(|addrs| addrs.iter().any(|a| is_managed_address(&a.address)))
                .unwrap_or(false);
            if !has_address {
                debug!(namespace = %namespace, "namespace has no managed address, ignored");
                continue;
            }

            match self.find_config_for_port(port).await {
                Some(path) => {
                    info!(port, namespace = %namespace, path = %path.display(), "matched running namespace to config");
                    self.ctx.store().save(port, &path).await?;
                    found.push(Candidate {
                        port,
                        config_path: path,
                    });
                }
                None => warn!(port, namespace = %namespace, "running tunnel has no config file, recreate it manually"),
            }
        }
        Ok(found)
    }

    async fn find_config_for_port(&self, port: u16) -> Option<PathBuf> {
        let dirs = &self.ctx.config().restore.search_dirs;
        for dir in dirs {
            for name in well_known_names(port) {
                let path = dir.join(name);
                if is_file(&path).await {
                    return Some(path);
                }
            }
        }

        let needle = port.to_string();
        for dir in dirs {
            for path in list_config_files(dir).await {
                let matches = path
                    .file_name()
                    .map(|n| n.to_string_lossy().contains(&needle))
                    .unwrap_or(false);
                if matches {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Tier 3.
    async fn scan_filesystem(&self) -> (Vec<Candidate>, Vec<RestoreFailure>) {
        let mut by_port: BTreeMap<u16, Candidate> = BTreeMap::new();
        let mut collisions = Vec::new();

        for dir in &self.ctx.config().restore.search_dirs {
            for path in list_config_files(dir).await {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                let Some(raw) = port_hint(&name) else {
                    continue;
                };
                let port = match Topology::for_raw_port(raw) {
                    Ok(topo) => topo.port,
                    Err(err) => {
                        warn!(path = %path.display(), "ignoring config: {err}");
                        continue;
                    }
                };
                match fs::read_to_string(&path).await {
                    Ok(text) if looks_like_tunnel_config(&text) => {}
                    _ => continue,
                }

                warn!(port, path = %path.display(), "port guessed from filename");
                if let Some(first) = by_port.get(&port) {
                    let err = RestoreError::NameCollision {
                        port,
                        first: first.config_path.clone(),
                        second: path.clone(),
                    };
                    error!("{err}");
                    collisions.push(RestoreFailure {
                        port,
                        error: err.to_string(),
                    });
                    continue;
                }
                by_port.insert(
                    port,
                    Candidate {
                        port,
                        config_path: path,
                    },
                );
            }
        }
        (by_port.into_values().collect(), collisions)
    }

    /// Forced credential sync. Without a known source the given ports'
    /// proxies are started from their recorded credential lists instead.
    pub async fn resync(&self, restored: &[u16]) -> Option<SyncReport> {
        let source = match self.ctx.resolve_source().await {
            Ok(source) => source,
            Err(err) => {
                warn!("cannot load credential source: {err}");
                None
            }
        };

        if let Some(source) = source {
            match self.ctx.synchronizer().refresh(&source, true).await {
                Ok(report) => return Some(report),
                Err(err) => warn!(source = %source, "post-restore sync failed: {err}"),
            }
        } else {
            warn!("credential source unknown, using recorded credentials");
        }

        for port in restored {
            if let Err(err) = self.ctx.proxy().regenerate(*port).await {
                warn!(port, "cannot start proxy from recorded credentials: {err}");
            }
        }
        None
    }
}

fn well_known_names(port: u16) -> [String; 4] {
    [
        format!("wg-{port}.conf"),
        format!("wg{port}.conf"),
        format!("ns-{port}.conf"),
        format!(".config/wireguard/wg-{port}.conf"),
    ]
}

/// First run of ASCII digits in a filename.
pub fn port_hint(file_name: &str) -> Option<u32> {
    let start = file_name.find(|c: char| c.is_ascii_digit())?;
    let digits = file_name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    digits.parse().ok()
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

/// `.conf` files directly inside `dir`, sorted by name.
async fn list_config_files(dir: &Path) -> Vec<PathBuf> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), "cannot read directory: {err}");
            return Vec::new();
        }
    };
    let mut paths = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_conf = path
            .extension()
            .map(|ext| ext == CONFIG_EXTENSION)
            .unwrap_or(false);
        if is_conf && is_file(&path).await {
            paths.push(path);
        }
    }
    paths.sort();
    paths
}
