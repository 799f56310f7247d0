#![allow(dead_code)]

use rusqlite::Connection;
use shared_utils::Config;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use wgns_helper::network::MemoryController;
use wgns_helper::resolver::StaticResolver;
use wgns_helper::AppContext;

pub const ENDPOINT_HOST: &str = "vpn.example.net";
pub const ENDPOINT_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

pub struct Harness {
    pub dir: TempDir,
    pub net: Arc<MemoryController>,
    pub ctx: Arc<AppContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut config = Config::default();
        config.paths.state_dir = root.join("state");
        config.paths.data_dir = root.join("data");
        config.paths.proxy_log_dir = root.join("log");
        config.proxy.binary = root.join("bin/xray-ns");
        config.proxy.search_paths = vec![root.join("installed")];
        config.proxy.restart_grace_ms = 0;
        config.network.handshake_attempts = 2;
        config.network.handshake_interval_secs = 0;
        config.restore.search_dirs = vec![root.join("configs")];
        config.watcher.prefer_service = false;
        adjust(&mut config);

        std::fs::create_dir_all(root.join("configs")).unwrap();
        let binary = config.proxy.binary.clone();
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let net = Arc::new(MemoryController::new());
        let resolver = Arc::new(StaticResolver::new().with(ENDPOINT_HOST, ENDPOINT_IP));
        let ctx = Arc::new(AppContext::new(config, net.clone(), resolver));
        Self { dir, net, ctx }
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.dir.path().join("configs")
    }

    /// Write a tunnel config named `name` into the search directory.
    pub fn write_tunnel_config(&self, name: &str) -> PathBuf {
        let path = self.configs_dir().join(name);
        std::fs::write(&path, tunnel_config_text(ENDPOINT_HOST)).unwrap();
        path
    }

    pub fn panel_db(&self) -> PathBuf {
        self.dir.path().join("x-ui.db")
    }
}

pub fn tunnel_config_text(endpoint_host: &str) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
         Address = 10.8.0.2/32\n\
         DNS = 1.1.1.1\n\
         MTU = 1420\n\
         \n\
         [Peer]\n\
         PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
         AllowedIPs = 0.0.0.0/0\n\
         Endpoint = {endpoint_host}:51820\n\
         PersistentKeepalive = 25\n"
    )
}

/// Create or replace a Marzban-style `users` table holding `ids`.
pub fn write_users_db(path: &Path, ids: &[impl AsRef<str>]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "DROP TABLE IF EXISTS users;
         CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT, uuid TEXT);",
    )
    .unwrap();
    for (i, id) in ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO users (username, uuid) VALUES (?1, ?2)",
            (format!("user{i}"), id.as_ref()),
        )
        .unwrap();
    }
}

pub fn uuid(n: u32) -> String {
    format!("{n:08x}-1111-4222-8333-444444444444")
}
