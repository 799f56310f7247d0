mod common;

use common::{uuid, write_users_db, Harness};
use shared_utils::PanelKind;
use std::time::{Duration, SystemTime};
use wgns_helper::credentials::SourceLocation;
use wgns_helper::network::NetworkController;
use wgns_helper::provisioner::host_rules;
use wgns_helper::sync::NamespaceOutcome;
use wgns_helper::Topology;

const PORTS: [u16; 2] = [51000, 8443];

async fn fleet() -> Harness {
    let h = Harness::new();
    for port in PORTS {
        let config = h.write_tunnel_config(&format!("wg-{port}.conf"));
        h.ctx.provisioner().create(port, &config).await.unwrap();
    }
    h
}

fn touch_forward(path: &std::path::Path, secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .unwrap();
}

fn client_ids(h: &Harness, port: u16) -> Vec<String> {
    let text = std::fs::read_to_string(h.ctx.proxy().config_path(port)).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    doc["inbounds"][0]["settings"]["clients"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn unchanged_source_is_not_pushed_twice() {
    let h = fleet().await;
    let ids = [uuid(1), uuid(2), uuid(3)];
    write_users_db(&h.panel_db(), &ids);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());

    let first = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(first.synced);
    assert_eq!(first.credentials, 3);
    assert_eq!(first.restarted(), 2);

    let second = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(!second.synced);
    assert!(second
        .namespaces
        .iter()
        .all(|n| n.outcome == NamespaceOutcome::Recorded));
    for port in PORTS {
        let ns = Topology::for_port(port).unwrap().namespace;
        assert_eq!(h.net.launches(&ns).await.len(), 1);
        let recorded = h.ctx.store().load_credentials(port).await.unwrap().unwrap();
        assert_eq!(recorded.len(), 3);
    }
}

#[tokio::test]
async fn new_user_restarts_every_proxy_once() {
    let h = fleet().await;
    write_users_db(&h.panel_db(), &[&uuid(1), &uuid(2), &uuid(3)]);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());
    h.ctx.synchronizer().refresh(&source, false).await.unwrap();

    write_users_db(&h.panel_db(), &[&uuid(1), &uuid(2), &uuid(3), &uuid(4)]);
    touch_forward(&h.panel_db(), 60);

    let report = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(report.synced);
    assert_eq!(report.credentials, 4);
    assert_eq!(report.restarted(), 2);

    for port in PORTS {
        let ns = Topology::for_port(port).unwrap().namespace;
        assert_eq!(h.net.launches(&ns).await.len(), 2);
        assert_eq!(h.net.processes(&ns).await.len(), 1);
        let clients = client_ids(&h, port);
        assert_eq!(clients.len(), 4);
        assert!(clients.contains(&uuid(4)));
    }
}

#[tokio::test]
async fn forced_refresh_restarts_without_changes() {
    let h = fleet().await;
    write_users_db(&h.panel_db(), &[&uuid(1)]);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());
    h.ctx.synchronizer().refresh(&source, false).await.unwrap();

    let report = h.ctx.synchronizer().refresh(&source, true).await.unwrap();
    assert!(report.synced);
    assert_eq!(report.restarted(), 2);
}

#[tokio::test]
async fn namespace_without_address_is_skipped() {
    let h = fleet().await;
    h.net.add_namespace("ns-9999").await.unwrap();
    write_users_db(&h.panel_db(), &[&uuid(1)]);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());

    let report = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert_eq!(report.namespaces.len(), 3);
    let stray = report
        .namespaces
        .iter()
        .find(|n| n.namespace == "ns-9999")
        .unwrap();
    assert_eq!(stray.port, None);
    assert!(matches!(stray.outcome, NamespaceOutcome::Skipped { .. }));
    assert_eq!(report.restarted(), 2);
    assert!(h.net.launches("ns-9999").await.is_empty());
}

#[tokio::test]
async fn flushed_forwarding_falls_back_to_the_tunnel_record() {
    let h = fleet().await;
    let topo = Topology::for_port(8443).unwrap();
    for (rule, _) in host_rules(&topo) {
        h.net.delete_firewall_rule(None, &rule).await.unwrap();
    }
    write_users_db(&h.panel_db(), &[&uuid(1)]);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());

    let report = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    let entry = report
        .namespaces
        .iter()
        .find(|n| n.namespace == "ns-8443")
        .unwrap();
    assert_eq!(entry.port, Some(8443));
    assert!(matches!(entry.outcome, NamespaceOutcome::Restarted { .. }));

    h.ctx.store().delete(8443).await.unwrap();
    let report = h.ctx.synchronizer().refresh(&source, true).await.unwrap();
    let entry = report
        .namespaces
        .iter()
        .find(|n| n.namespace == "ns-8443")
        .unwrap();
    assert!(matches!(entry.outcome, NamespaceOutcome::Skipped { .. }));
}

#[tokio::test]
async fn missing_source_is_an_error() {
    let h = fleet().await;
    let source = SourceLocation::new(PanelKind::XUi, h.dir.path().join("absent.db"));
    assert!(h.ctx.synchronizer().refresh(&source, false).await.is_err());
    assert!(h.net.launches("ns-8443").await.is_empty());
}

#[tokio::test]
async fn failed_restart_is_retried_without_source_changes() {
    use std::os::unix::fs::PermissionsExt;

    let h = fleet().await;
    write_users_db(&h.panel_db(), &[&uuid(1), &uuid(2)]);
    let source = SourceLocation::new(PanelKind::Marzban, h.panel_db());
    let binary = h.ctx.config().proxy.binary.clone();
    std::fs::remove_file(&binary).unwrap();

    let broken = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(broken.synced);
    assert!(broken
        .namespaces
        .iter()
        .all(|n| matches!(n.outcome, NamespaceOutcome::Failed { .. })));
    assert!(h.net.launches("ns-51000").await.is_empty());

    std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let retried = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(retried.synced);
    assert_eq!(retried.restarted(), 2);
    for port in PORTS {
        let ns = Topology::for_port(port).unwrap().namespace;
        assert_eq!(h.net.launches(&ns).await.len(), 1);
    }

    let settled = h.ctx.synchronizer().refresh(&source, false).await.unwrap();
    assert!(!settled.synced);
}
