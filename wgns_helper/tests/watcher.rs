//! The watcher is a per-process singleton, so these tests take turns.

mod common;

use common::{uuid, write_users_db, Harness};
use shared_utils::PanelKind;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use wgns_helper::credentials::SourceLocation;
use wgns_helper::network::CommandOutput;
use wgns_helper::watcher::{start_background, BackgroundMode, TickOutcome};
use wgns_helper::{Watcher, WatcherError};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn harness_with_tunnel(adjust: impl FnOnce(&mut shared_utils::Config)) -> Harness {
    let h = Harness::with_config(adjust);
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    write_users_db(&h.panel_db(), &[&uuid(1), &uuid(2)]);
    h
}

#[tokio::test]
async fn tick_waits_for_a_source_then_syncs() {
    let _serial = serial();
    let h = harness_with_tunnel(|_| {}).await;
    let watcher = Watcher::new(h.ctx.clone()).unwrap();

    assert!(matches!(watcher.tick().await, TickOutcome::Unconfigured));

    h.ctx
        .set_source(SourceLocation::new(PanelKind::Marzban, h.panel_db()))
        .await
        .unwrap();
    match watcher.tick().await {
        TickOutcome::Synced(report) => {
            assert!(report.synced);
            assert_eq!(report.restarted(), 1);
        }
        other => panic!("expected a sync, got {other:?}"),
    }
    match watcher.tick().await {
        TickOutcome::Synced(report) => assert!(!report.synced),
        other => panic!("expected a sync, got {other:?}"),
    }
}

#[tokio::test]
async fn vanished_source_fails_the_tick() {
    let _serial = serial();
    let h = harness_with_tunnel(|_| {}).await;
    h.ctx
        .set_source(SourceLocation::new(PanelKind::XUi, h.dir.path().join("gone.db")))
        .await
        .unwrap();
    let watcher = Watcher::new(h.ctx.clone()).unwrap();
    assert!(matches!(watcher.tick().await, TickOutcome::Failed(_)));
}

#[tokio::test]
async fn only_one_watcher_per_process() {
    let _serial = serial();
    let h = Harness::new();
    let first = Watcher::new(h.ctx.clone()).unwrap();
    assert!(Watcher::is_active());
    assert!(matches!(
        Watcher::new(h.ctx.clone()),
        Err(WatcherError::AlreadyRunning)
    ));

    drop(first);
    assert!(!Watcher::is_active());
    assert!(Watcher::new(h.ctx.clone()).is_ok());
}

#[tokio::test]
async fn trigger_forces_an_early_tick() {
    let _serial = serial();
    let h = harness_with_tunnel(|c| c.watcher.interval_secs = 3600).await;
    let watcher = Watcher::new(h.ctx.clone()).unwrap();
    let trigger = watcher.trigger();
    let cancel = watcher.cancellation_token();
    let handle = tokio::spawn(watcher.run());

    h.ctx
        .set_source(SourceLocation::new(PanelKind::Marzban, h.panel_db()))
        .await
        .unwrap();
    trigger.notify_one();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.net.launches("ns-51000").await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    handle.await.unwrap();
    assert!(!Watcher::is_active());
}

#[tokio::test]
async fn background_falls_back_to_in_process() {
    let _serial = serial();
    let h = Harness::with_config(|c| c.watcher.prefer_service = true);

    match start_background(h.ctx.clone()).await.unwrap() {
        BackgroundMode::InProcess { handle, cancel } => {
            assert!(Watcher::is_active());
            cancel.cancel();
            handle.await.unwrap();
        }
        other => panic!("expected in-process watcher, got {other:?}"),
    }
    assert!(!Watcher::is_active());
}

#[tokio::test]
async fn background_defers_to_a_running_service() {
    let _serial = serial();
    let h = Harness::with_config(|c| c.watcher.prefer_service = true);
    h.net
        .script(
            &["systemctl", "is-active", "wgns-watcher.service"],
            CommandOutput {
                success: true,
                stdout: "active\n".to_string(),
                stderr: String::new(),
            },
        )
        .await;

    match start_background(h.ctx.clone()).await.unwrap() {
        BackgroundMode::Service(unit) => assert_eq!(unit, "wgns-watcher.service"),
        other => panic!("expected service mode, got {other:?}"),
    }
    assert!(!Watcher::is_active());
}
