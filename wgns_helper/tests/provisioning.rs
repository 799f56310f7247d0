mod common;

use common::{Harness, ENDPOINT_IP};
use wgns_helper::network::{FirewallTable, RouteSpec};
use wgns_helper::provisioner::{HandshakeStatus, RestoreOutcome};
use wgns_helper::topology::{BYPASS_FWMARK, BYPASS_TABLE};
use wgns_helper::{ProvisioningError, Topology};

#[tokio::test]
async fn create_builds_the_full_environment() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");

    let tunnel = h.ctx.provisioner().create(51000, &config).await.unwrap();
    let topo = &tunnel.topology;
    assert_eq!(topo.subnet_octet, 2);
    assert_eq!(tunnel.endpoint_ip, ENDPOINT_IP);
    assert_eq!(tunnel.tunnel_address, "10.8.0.2/32");

    assert!(h.net.has_namespace("ns-51000").await);
    let host_end = h.net.link(None, "veth-51000").await.unwrap();
    assert!(host_end.up);
    assert_eq!(host_end.addresses, vec!["10.100.2.1/24".to_string()]);
    let peer_end = h.net.link(Some("ns-51000"), "vpeer-51000").await.unwrap();
    assert!(peer_end.up);
    assert_eq!(peer_end.addresses, vec!["10.100.2.2/24".to_string()]);

    let wg = h
        .net
        .link(Some("ns-51000"), &topo.tunnel_interface)
        .await
        .unwrap();
    assert!(wg.up);
    assert_eq!(wg.addresses, vec!["10.8.0.2/32".to_string()]);
    let applied = wg.wireguard_config.unwrap();
    assert!(applied.contains("PrivateKey"));
    assert!(!applied.contains("Address"));
    assert!(!applied.contains("DNS"));
    assert!(!applied.contains("MTU"));

    let routes = h.net.routes("ns-51000").await;
    assert!(routes.contains(&RouteSpec::to("203.0.113.10/32").via(topo.host_ip)));
    assert!(routes.contains(&RouteSpec::to("default").dev(&topo.tunnel_interface)));
    assert!(routes.contains(
        &RouteSpec::to("default")
            .via(topo.host_ip)
            .dev("vpeer-51000")
            .table(BYPASS_TABLE)
    ));
    assert_eq!(
        h.net.fwmark_rules("ns-51000").await,
        vec![(BYPASS_FWMARK, BYPASS_TABLE)]
    );

    let host_rules = h
        .net
        .firewall_rules(None)
        .await
        .iter()
        .map(|r| r.listing())
        .collect::<Vec<_>>();
    for proto in ["tcp", "udp"] {
        assert!(host_rules.contains(&format!(
            "-A PREROUTING -p {proto} --dport 51000 -j DNAT --to-destination 10.100.2.2:51000"
        )));
    }
    assert!(host_rules.contains(&"-A POSTROUTING -s 10.100.2.0/24 ! -o veth-51000 -j MASQUERADE".to_string()));
    assert!(h.net.ip_forwarding().await);

    let ns_rules = h.net.firewall_rules(Some("ns-51000")).await;
    assert!(ns_rules
        .iter()
        .any(|r| r.table == FirewallTable::Nat && r.listing().contains("MASQUERADE")));
    assert!(ns_rules
        .iter()
        .any(|r| r.table == FirewallTable::Mangle && r.listing().contains("--set-mark 1")));

    assert_eq!(
        h.net.resolv("ns-51000").await,
        Some(vec!["1.1.1.1".to_string()])
    );

    let record = h.ctx.store().load(51000).await.unwrap().unwrap();
    assert_eq!(record.config_path, config);
}

#[tokio::test]
async fn failed_step_rolls_back_everything() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-8443.conf");
    h.net.fail_on("add_fwmark_rule").await;

    let err = h.ctx.provisioner().create(8443, &config).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Routing { .. }), "{err}");

    assert!(!h.net.has_namespace("ns-8443").await);
    assert!(h.net.links().await.is_empty());
    assert!(h.net.firewall_rules(None).await.is_empty());
    assert_eq!(h.ctx.store().load(8443).await.unwrap(), None);
}

#[tokio::test]
async fn host_rule_failure_removes_installed_host_rules() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-8443.conf");
    h.net.fail_on("write_namespace_resolv").await;

    let err = h.ctx.provisioner().create(8443, &config).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::NamespaceFiles { .. }));
    assert!(h.net.firewall_rules(None).await.is_empty());
    assert!(!h.net.has_namespace("ns-8443").await);
}

#[tokio::test]
async fn unresolvable_endpoint_creates_nothing() {
    let h = Harness::new();
    let path = h.configs_dir().join("wg-443.conf");
    std::fs::write(&path, common::tunnel_config_text("unknown.invalid")).unwrap();

    let err = h.ctx.provisioner().create(443, &path).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::EndpointResolutionFailed { ref host } if host == "unknown.invalid"
    ));
    assert!(!h.net.has_namespace("ns-443").await);
    assert!(h.net.links().await.is_empty());
}

#[tokio::test]
async fn config_without_endpoint_is_invalid() {
    let h = Harness::new();
    let path = h.configs_dir().join("broken.conf");
    std::fs::write(&path, "[Interface]\nPrivateKey = abc\n").unwrap();

    let err = h.ctx.provisioner().create(443, &path).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::TunnelConfigInvalid { .. }));
    assert!(h.net.journal().await.is_empty());
}

#[tokio::test]
async fn ports_sharing_a_subnet_are_refused() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg.conf");
    h.ctx.provisioner().create(250, &config).await.unwrap();

    // 500 % 250 == 250 % 250; known defect of the allocation scheme
    let err = h.ctx.provisioner().create(500, &config).await.unwrap_err();
    match err {
        ProvisioningError::SubnetInUse { port, conflicting } => {
            assert_eq!(port, 500);
            assert_eq!(conflicting, vec![250]);
        }
        other => panic!("expected SubnetInUse, got {other}"),
    }
    assert!(h.net.has_namespace("ns-250").await);
}

#[tokio::test]
async fn recreating_a_port_replaces_stale_objects() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    h.ctx.provisioner().create(51000, &config).await.unwrap();

    let dnat = h
        .net
        .firewall_rules(None)
        .await
        .iter()
        .filter(|r| r.listing().contains("DNAT"))
        .count();
    assert_eq!(dnat, 2);
    assert_eq!(h.net.links().await.len(), 3);
}

#[tokio::test]
async fn restore_is_a_no_op_when_namespace_exists() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    h.net.clear_journal().await;

    let outcome = h.ctx.provisioner().restore(51000, &config).await.unwrap();
    assert_eq!(outcome, RestoreOutcome::AlreadyPresent);
    assert!(h.net.journal().await.is_empty());
}

#[tokio::test]
async fn delete_removes_everything_and_tolerates_repeats() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    h.ctx.provisioner().create(51000, &config).await.unwrap();
    h.ctx.provisioner().enable_packet_logging(51000).await.unwrap();

    let report = h.ctx.provisioner().delete(51000).await.unwrap();
    assert!(report.namespace_existed);
    assert!(report.record_removed);
    assert_eq!(report.rules_removed, 13);
    assert!(!h.net.has_namespace("ns-51000").await);
    assert!(h.net.links().await.is_empty());
    assert!(h.net.firewall_rules(None).await.is_empty());
    assert!(h.ctx.store().load_all().await.unwrap().is_empty());

    let again = h.ctx.provisioner().delete(51000).await.unwrap();
    assert!(!again.namespace_existed);
    assert!(!again.record_removed);
    assert_eq!(again.rules_removed, 0);
}

#[tokio::test]
async fn delete_stops_the_proxy_first() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-2053.conf");
    h.ctx.provisioner().create(2053, &config).await.unwrap();
    h.ctx
        .proxy()
        .restart("ns-2053", 2053, &[common::uuid(1)])
        .await
        .unwrap();

    let report = h.ctx.provisioner().delete(2053).await.unwrap();
    assert_eq!(report.proxies_terminated, 1);
}

#[tokio::test]
async fn packet_logging_rules_are_inserted_once() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-443.conf");
    h.ctx.provisioner().create(443, &config).await.unwrap();

    assert_eq!(h.ctx.provisioner().enable_packet_logging(443).await.unwrap(), 6);
    assert_eq!(h.ctx.provisioner().enable_packet_logging(443).await.unwrap(), 6);
    let logs = h
        .net
        .firewall_rules(None)
        .await
        .iter()
        .filter(|r| r.listing().contains("-j LOG"))
        .count();
    assert_eq!(logs, 6);

    assert_eq!(h.ctx.provisioner().disable_packet_logging(443).await.unwrap(), 6);
}

#[tokio::test]
async fn restart_tunnel_reports_handshake() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg-51000.conf");
    let tunnel = h.ctx.provisioner().create(51000, &config).await.unwrap();

    let status = h.ctx.provisioner().restart_tunnel(51000).await.unwrap();
    assert_eq!(status, HandshakeStatus::Established);
    let wg = h
        .net
        .link(Some("ns-51000"), &tunnel.topology.tunnel_interface)
        .await
        .unwrap();
    assert!(wg.up);

    h.net.set_handshakes(false).await;
    let status = h.ctx.provisioner().restart_tunnel(51000).await.unwrap();
    assert_eq!(status, HandshakeStatus::NotYetEstablished);
}

#[tokio::test]
async fn restart_tunnel_requires_namespace() {
    let h = Harness::new();
    let err = h.ctx.provisioner().restart_tunnel(7000).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::NamespaceMissing(ref ns) if ns == "ns-7000"));
}

#[tokio::test]
async fn list_reports_each_tunnel() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg.conf");
    h.ctx.provisioner().create(2053, &config).await.unwrap();
    h.ctx.provisioner().create(443, &config).await.unwrap();
    h.ctx
        .proxy()
        .restart("ns-443", 443, &[common::uuid(1)])
        .await
        .unwrap();

    let rows = h.ctx.provisioner().list().await.unwrap();
    assert_eq!(rows.iter().map(|r| r.port).collect::<Vec<_>>(), vec![443, 2053]);
    let first = &rows[0];
    assert_eq!(first.namespace_ip, Some(Topology::for_port(443).unwrap().ns_ip));
    assert!(first.tunnel_up);
    assert!(first.proxy_listening);
    assert_eq!(first.config_path.as_deref(), Some(config.as_path()));
    assert!(!rows[1].proxy_listening);
}

#[tokio::test]
async fn port_zero_is_rejected() {
    let h = Harness::new();
    let config = h.write_tunnel_config("wg.conf");
    let err = h.ctx.provisioner().create(0, &config).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::InvalidPort(_)));
}
