//! Proxy process supervision inside tunnel namespaces.

pub mod config;

pub use config::{HttpHeader, ProxyDocument};

use crate::network::{ControllerError, LaunchSpec, NetworkController};
use crate::persistence::{replace_file, StateError, StateStore};
use crate::topology::namespace_name;
use shared_utils::config::ProxyConfig;
use shared_utils::Config;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Binary names accepted when looking for an installed proxy.
const CANDIDATE_NAMES: [&str; 2] = ["xray", "xray-linux-amd64"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy binary {0} is missing and no installed copy was found")]
    BinaryMissing(PathBuf),

    #[error("proxy file I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot render proxy config: {0}")]
    Render(#[from] serde_json::Error),

    #[error("no credentials recorded for port {0}")]
    NoCredentials(u16),

    #[error(transparent)]
    Network(#[from] ControllerError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ProxyError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ProxyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a proxy restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRestart {
    pub terminated: Vec<u32>,
    pub pid: u32,
    pub config_path: PathBuf,
}

pub struct ProxySupervisor {
    settings: ProxyConfig,
    data_dir: PathBuf,
    log_dir: PathBuf,
    network: Arc<dyn NetworkController>,
    store: Arc<StateStore>,
}

impl ProxySupervisor {
    pub fn new(
        config: &Config,
        network: Arc<dyn NetworkController>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            settings: config.proxy.clone(),
            data_dir: config.paths.data_dir.clone(),
            log_dir: config.paths.proxy_log_dir.clone(),
            network,
            store,
        }
    }

    pub fn config_path(&self, port: u16) -> PathBuf {
        self.data_dir.join(format!("xray-{port}.json"))
    }

    pub fn log_path(&self, port: u16) -> PathBuf {
        self.log_dir.join(format!("xray-{port}.log"))
    }

    /// Make sure the configured binary exists and is executable, installing a
    /// copy of an already present `xray` when it does not.
    pub async fn ensure_binary(&self) -> Result<PathBuf, ProxyError> {
        let target = &self.settings.binary;
        if is_executable(target).await {
            return Ok(target.clone());
        }

        let Some(found) = self.find_installed().await else {
            return Err(ProxyError::BinaryMissing(target.clone()));
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::io(parent, e))?;
        }
        fs::copy(&found, target)
            .await
            .map_err(|e| ProxyError::io(target, e))?;
        fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| ProxyError::io(target, e))?;
        info!(from = %found.display(), to = %target.display(), "installed proxy binary");
        Ok(target.clone())
    }

    async fn find_installed(&self) -> Option<PathBuf> {
        for dir in &self.settings.search_paths {
            for name in CANDIDATE_NAMES {
                let candidate = dir.join(name);
                if candidate != self.settings.binary && is_executable(&candidate).await {
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn http_header(&self) -> Option<HttpHeader> {
        self.settings.use_http_header.then(|| HttpHeader {
            host: self.settings.http_host.clone(),
            path: self.settings.http_path.clone(),
        })
    }

    /// Write the proxy document for `port`. An empty `ids` falls back to the
    /// port's recorded credential list.
    pub async fn write_config(&self, port: u16, ids: &[String]) -> Result<PathBuf, ProxyError> {
        let recorded;
        let ids = if ids.is_empty() {
            recorded = self.store.load_credentials(port).await?.unwrap_or_default();
            debug!(port, count = recorded.len(), "using recorded credentials");
            recorded.as_slice()
        } else {
            ids
        };

        let header = self.http_header();
        let document = ProxyDocument::vless(port, ids, header.as_ref());
        let path = self.config_path(port);
        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| ProxyError::io(&self.data_dir, e))?;
        replace_file(&path, document.to_json()?.as_bytes())
            .await
            .map_err(|e| ProxyError::io(&path, e))?;
        Ok(path)
    }

    /// Terminate whatever listens on `port` inside `netns`.
    pub async fn stop(&self, netns: &str, port: u16) -> Result<Vec<u32>, ProxyError> {
        let pids = self.network.listening_pids(netns, port).await?;
        if pids.is_empty() {
            return Ok(pids);
        }
        info!(netns, port, ?pids, "terminating proxy");
        self.network.terminate(netns, &pids).await?;
        tokio::time::sleep(self.settings.restart_grace()).await;
        Ok(pids)
    }

    /// Rewrite the config and relaunch the proxy with `ids` as its allow-list.
    pub async fn restart(
        &self,
        netns: &str,
        port: u16,
        ids: &[String],
    ) -> Result<ProxyRestart, ProxyError> {
        let binary = self.ensure_binary().await?;
        let config_path = self.write_config(port, ids).await?;
        let terminated = self.stop(netns, port).await?;

        let spec = LaunchSpec {
            program: binary,
            args: vec!["-c".to_string(), config_path.display().to_string()],
            log_path: self.log_path(port),
            listen_port: port,
        };
        let pid = self.network.launch_detached(netns, &spec).await?;
        info!(netns, port, pid, clients = ids.len(), "proxy restarted");
        Ok(ProxyRestart {
            terminated,
            pid,
            config_path,
        })
    }

    /// Restart from the port's recorded credential list without extracting.
    pub async fn regenerate(&self, port: u16) -> Result<ProxyRestart, ProxyError> {
        let ids = self
            .store
            .load_credentials(port)
            .await?
            .filter(|ids| !ids.is_empty())
            .ok_or(ProxyError::NoCredentials(port))?;
        self.restart(&namespace_name(port), port, &ids).await
    }

    pub async fn is_listening(&self, netns: &str, port: u16) -> Result<bool, ProxyError> {
        Ok(!self.network.listening_pids(netns, port).await?.is_empty())
    }

    /// Last `lines` lines of the proxy's output.
    pub async fn tail_log(&self, port: u16, lines: usize) -> Result<Vec<String>, ProxyError> {
        let path = self.log_path(port);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(port, path = %path.display(), "proxy log does not exist");
                return Ok(Vec::new());
            }
            Err(err) => return Err(ProxyError::io(&path, err)),
        };
        let all = text.lines().collect::<Vec<_>>();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|l| l.to_string()).collect())
    }
}

async fn is_executable(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryController;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        net: Arc<MemoryController>,
        store: Arc<StateStore>,
        supervisor: ProxySupervisor,
        config: Config,
    }

    fn make_executable(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.state_dir = dir.path().join("state");
        config.paths.data_dir = dir.path().join("data");
        config.paths.proxy_log_dir = dir.path().join("log");
        config.proxy.binary = dir.path().join("bin/xray-ns");
        config.proxy.search_paths = vec![dir.path().join("installed")];
        config.proxy.restart_grace_ms = 0;
        let net = Arc::new(MemoryController::new());
        let store = Arc::new(StateStore::from_config(&config));
        let supervisor = ProxySupervisor::new(&config, net.clone(), store.clone());
        Fixture {
            _dir: dir,
            net,
            store,
            supervisor,
            config,
        }
    }

    #[tokio::test]
    async fn ensure_binary_installs_found_copy() {
        let fx = fixture();
        assert!(matches!(
            fx.supervisor.ensure_binary().await,
            Err(ProxyError::BinaryMissing(_))
        ));

        let installed = fx.config.proxy.search_paths[0].join("xray");
        make_executable(&installed);
        let path = fx.supervisor.ensure_binary().await.unwrap();
        assert_eq!(path, fx.config.proxy.binary);
        assert!(is_executable(&path).await);
    }

    #[tokio::test]
    async fn restart_replaces_running_listener() {
        let fx = fixture();
        make_executable(&fx.config.proxy.binary);
        fx.net.add_namespace("ns-8443").await.unwrap();
        let ids = vec!["a".to_string(), "b".to_string()];

        let first = fx.supervisor.restart("ns-8443", 8443, &ids).await.unwrap();
        assert!(first.terminated.is_empty());
        let second = fx.supervisor.restart("ns-8443", 8443, &ids).await.unwrap();
        assert_eq!(second.terminated, vec![first.pid]);

        let running = fx.net.processes("ns-8443").await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, second.pid);
        assert_eq!(running[0].spec.log_path, fx.supervisor.log_path(8443));
    }

    #[tokio::test]
    async fn regenerate_uses_recorded_credentials() {
        let fx = fixture();
        make_executable(&fx.config.proxy.binary);
        fx.net.add_namespace("ns-2053").await.unwrap();
        assert!(matches!(
            fx.supervisor.regenerate(2053).await,
            Err(ProxyError::NoCredentials(2053))
        ));

        fx.store
            .save_credentials(2053, &["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        let restart = fx.supervisor.regenerate(2053).await.unwrap();
        let text = std::fs::read_to_string(restart.config_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value["inbounds"][0]["settings"]["clients"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn write_config_replaces_document_whole() {
        let fx = fixture();
        let first = fx.supervisor.write_config(443, &["a".to_string()]).await.unwrap();
        let second = fx
            .supervisor
            .write_config(443, &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(first, second);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&second).unwrap()).unwrap();
        assert_eq!(
            value["inbounds"][0]["settings"]["clients"][1]["id"],
            serde_json::json!("c")
        );
        let leftovers = std::fs::read_dir(second.parent().unwrap())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn tail_log_returns_last_lines() {
        let fx = fixture();
        assert!(fx.supervisor.tail_log(1, 5).await.unwrap().is_empty());
        let path = fx.supervisor.log_path(1);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        assert_eq!(fx.supervisor.tail_log(1, 2).await.unwrap(), vec!["two", "three"]);
    }
}
