//! Library entry point for the wgns helper.
//!
//! Manages a fleet of isolated WireGuard tunnels, one network namespace per
//! public port, and keeps the VLESS proxy inside each namespace in step with
//! the client list of an x-ui or Marzban panel database.

pub mod context;
pub mod credentials;
pub mod network;
pub mod persistence;
pub mod provisioner;
pub mod proxy;
pub mod resolver;
pub mod restore;
pub mod sync;
pub mod topology;
pub mod tunnel_config;
pub mod watcher;

pub use context::AppContext;
pub use provisioner::{Provisioner, ProvisioningError};
pub use restore::{RestoreError, RestoreOrchestrator};
pub use sync::{SyncError, Synchronizer};
pub use topology::Topology;
pub use watcher::{Watcher, WatcherError};
