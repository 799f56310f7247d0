mod common;

use common::{uuid, write_users_db, Harness};
use shared_utils::PanelKind;
use wgns_helper::credentials::SourceLocation;
use wgns_helper::provisioner::RestoreOutcome;
use wgns_helper::restore::DiscoveryTier;
use wgns_helper::RestoreOrchestrator;

#[tokio::test]
async fn records_with_missing_configs_do_not_block_the_rest() {
    let h = Harness::new();
    let valid = h.write_tunnel_config("wg-51000.conf");
    h.ctx.store().save(51000, &valid).await.unwrap();
    h.ctx
        .store()
        .save(8443, &h.configs_dir().join("gone.conf"))
        .await
        .unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert_eq!(report.tier, DiscoveryTier::StateStore);
    assert_eq!(report.restored, vec![51000]);
    assert!(report.failures.is_empty());
    assert!(h.net.has_namespace("ns-51000").await);
    assert!(!h.net.has_namespace("ns-8443").await);
    assert_eq!(h.ctx.store().load(8443).await.unwrap(), None);
}

#[tokio::test]
async fn provisioning_failures_are_reported_per_port() {
    let h = Harness::new();
    let good = h.write_tunnel_config("wg-51000.conf");
    let bad = h.configs_dir().join("wg-8443.conf");
    std::fs::write(&bad, common::tunnel_config_text("unknown.invalid")).unwrap();
    h.ctx.store().save(51000, &good).await.unwrap();
    h.ctx.store().save(8443, &bad).await.unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.restored, vec![51000]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].port, 8443);
    assert!(report.failures[0].error.contains("unknown.invalid"));
}

#[tokio::test]
async fn running_namespaces_are_matched_to_configs() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    h.ctx.store().delete(51000).await.unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert_eq!(report.tier, DiscoveryTier::NamespaceIntrospection);
    assert_eq!(report.already_present, vec![51000]);
    let record = h.ctx.store().load(51000).await.unwrap().unwrap();
    assert_eq!(record.config_path, config);
}

#[tokio::test]
async fn filesystem_scan_guesses_ports_and_reports_collisions() {
    let h = Harness::new();
    h.write_tunnel_config("tunnel-2053.conf");
    h.write_tunnel_config("backup-443.conf");
    h.write_tunnel_config("wg-443.conf");
    std::fs::write(h.configs_dir().join("notes-99.conf"), "not a tunnel\n").unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert_eq!(report.tier, DiscoveryTier::FilesystemScan);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.restored, vec![443, 2053]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].port, 443);
    assert!(report.failures[0].error.contains("wg-443.conf"));

    let record = h.ctx.store().load(443).await.unwrap().unwrap();
    assert_eq!(record.config_path, h.configs_dir().join("backup-443.conf"));
    assert!(!h.net.has_namespace("ns-99").await);
}

#[tokio::test]
async fn nothing_to_restore() {
    let h = Harness::new();
    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert_eq!(report.tier, DiscoveryTier::Nothing);
    assert_eq!(report.discovered, 0);
    assert!(report.sync.is_none());
}

#[tokio::test]
async fn restore_forces_a_credential_sync() {
    let h = Harness::new();
    write_users_db(&h.panel_db(), &[&uuid(1), &uuid(2)]);
    h.ctx
        .set_source(SourceLocation::new(PanelKind::Marzban, h.panel_db()))
        .await
        .unwrap();
    h.ctx
        .synchronizer()
        .refresh(&SourceLocation::new(PanelKind::Marzban, h.panel_db()), false)
        .await
        .unwrap();

    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.store().save(51000, &config).await.unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    let sync = report.sync.unwrap();
    assert!(sync.synced);
    assert_eq!(sync.restarted(), 1);
    assert_eq!(h.net.launches("ns-51000").await.len(), 1);
}

#[tokio::test]
async fn unknown_source_falls_back_to_recorded_credentials() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.store().save(51000, &config).await.unwrap();
    h.ctx
        .store()
        .save_credentials(51000, &[uuid(7)])
        .await
        .unwrap();

    let report = RestoreOrchestrator::new(h.ctx.clone())
        .restore_all()
        .await
        .unwrap();
    assert!(report.sync.is_none());
    let launches = h.net.launches("ns-51000").await;
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].spec.listen_port, 51000);
}

#[tokio::test]
async fn restore_from_file_can_recreate() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    h.ctx
        .proxy()
        .restart("ns-51000", 51000, &[uuid(1)])
        .await
        .unwrap();
    let orchestrator = RestoreOrchestrator::new(h.ctx.clone());

    let outcome = orchestrator
        .restore_from_file(51000, &config, false)
        .await
        .unwrap();
    assert_eq!(outcome, RestoreOutcome::AlreadyPresent);

    let outcome = orchestrator
        .restore_from_file(51000, &config, true)
        .await
        .unwrap();
    assert!(matches!(outcome, RestoreOutcome::Provisioned(_)));
    assert!(h.net.has_namespace("ns-51000").await);
    assert_eq!(h.ctx.store().load(51000).await.unwrap().unwrap().config_path, config);
}
