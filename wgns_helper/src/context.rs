//! Shared handles for one process: configuration, the network backend, the
//! state store and the credential source currently in use.

use crate::credentials::SourceLocation;
use crate::network::{build_network_controller, NetworkController};
use crate::persistence::{StateError, StateStore};
use crate::provisioner::Provisioner;
use crate::proxy::ProxySupervisor;
use crate::resolver::{ChainResolver, EndpointResolver};
use crate::sync::Synchronizer;
use shared_utils::Config;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct AppContext {
    config: Config,
    network: Arc<dyn NetworkController>,
    store: Arc<StateStore>,
    provisioner: Arc<Provisioner>,
    proxy: Arc<ProxySupervisor>,
    synchronizer: Arc<Synchronizer>,
    source: RwLock<Option<SourceLocation>>,
}

impl AppContext {
    pub fn new(
        config: Config,
        network: Arc<dyn NetworkController>,
        resolver: Arc<dyn EndpointResolver>,
    ) -> Self {
        let store = Arc::new(StateStore::from_config(&config));
        let provisioner = Arc::new(Provisioner::new(
            network.clone(),
            resolver,
            store.clone(),
            config.network.clone(),
        ));
        let proxy = Arc::new(ProxySupervisor::new(&config, network.clone(), store.clone()));
        let synchronizer = Arc::new(Synchronizer::new(
            network.clone(),
            store.clone(),
            proxy.clone(),
        ));
        Self {
            config,
            network,
            store,
            provisioner,
            proxy,
            synchronizer,
            source: RwLock::new(None),
        }
    }

    /// Context over the live host network stack.
    pub fn for_host(config: Config) -> Self {
        let network: Arc<dyn NetworkController> = Arc::from(build_network_controller());
        let resolver = Arc::new(ChainResolver::new(config.network.resolve_timeout()));
        Self::new(config, network, resolver)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> &Arc<dyn NetworkController> {
        &self.network
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn proxy(&self) -> &Arc<ProxySupervisor> {
        &self.proxy
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    /// Current credential source: the one already known to this process, else
    /// the persisted record, else the `[panel]` config section.
    pub async fn resolve_source(&self) -> Result<Option<SourceLocation>, StateError> {
        if let Some(location) = self.source.read().await.clone() {
            return Ok(Some(location));
        }

        let found = match self.store.load_source().await? {
            Some(location) => Some(location),
            None => SourceLocation::from_config(&self.config.panel),
        };
        if let Some(location) = &found {
            *self.source.write().await = Some(location.clone());
        }
        Ok(found)
    }

    /// Remember and persist the credential source.
    pub async fn set_source(&self, location: SourceLocation) -> Result<(), StateError> {
        self.store.save_source(&location).await?;
        info!(source = %location, "credential source set");
        *self.source.write().await = Some(location);
        Ok(())
    }
}
