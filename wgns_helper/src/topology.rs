//! Deterministic addressing for one tunnel environment.
//!
//! Everything here is a pure function of the public port. The provisioner,
//! the restore path and the synchronizer all derive names and addresses
//! through [`Topology::for_port`] so creation and later lookup never diverge.

use ipnet::Ipv4Net;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Prefix shared by every namespace this system manages.
pub const NAMESPACE_PREFIX: &str = "ns-";

/// Private range carved into one /24 per tunnel.
pub const MANAGED_RANGE: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 100, 0, 0), 16);

/// Routing table used for marked return traffic inside a namespace.
pub const BYPASS_TABLE: u32 = 100;

/// Firewall mark that selects [`BYPASS_TABLE`].
pub const BYPASS_FWMARK: u32 = 1;

const SUBNET_MODULUS: u16 = 250;
const SUBNET_OFFSET: u16 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("port {0} is outside 1-65535")]
    InvalidPort(u32),
}

/// Names and addresses derived from a tunnel's public port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub port: u16,
    pub namespace: String,
    pub subnet_octet: u8,
    /// veth end that stays on the host.
    pub host_link: String,
    /// veth end moved into the namespace.
    pub ns_link: String,
    pub tunnel_interface: String,
    pub host_ip: Ipv4Addr,
    pub ns_ip: Ipv4Addr,
}

impl Topology {
    pub fn for_port(port: u16) -> Result<Self, TopologyError> {
        if port == 0 {
            return Err(TopologyError::InvalidPort(0));
        }

        let octet = subnet_octet(port);
        Ok(Self {
            port,
            namespace: namespace_name(port),
            subnet_octet: octet,
            host_link: format!("veth-{port}"),
            ns_link: format!("vpeer-{port}"),
            tunnel_interface: tunnel_interface_name(port),
            host_ip: Ipv4Addr::new(10, 100, octet, 1),
            ns_ip: Ipv4Addr::new(10, 100, octet, 2),
        })
    }

    /// Validate a port that arrived as a wider integer (CLI, filenames, records).
    pub fn for_raw_port(port: u32) -> Result<Self, TopologyError> {
        let narrowed = u16::try_from(port).map_err(|_| TopologyError::InvalidPort(port))?;
        Self::for_port(narrowed)
    }

    pub fn subnet(&self) -> Ipv4Net {
        Ipv4Net::new_assert(Ipv4Addr::new(10, 100, self.subnet_octet, 0), 24)
    }

    pub fn host_cidr(&self) -> String {
        format!("{}/24", self.host_ip)
    }

    pub fn ns_cidr(&self) -> String {
        format!("{}/24", self.ns_ip)
    }

    /// Recover the port from a managed namespace name (`ns-51000` -> 51000).
    pub fn port_from_namespace(name: &str) -> Option<u16> {
        name.strip_prefix(NAMESPACE_PREFIX)?
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
    }
}

pub fn namespace_name(port: u16) -> String {
    format!("{NAMESPACE_PREFIX}{port}")
}

pub fn is_managed_namespace(name: &str) -> bool {
    name.starts_with(NAMESPACE_PREFIX)
}

pub fn is_managed_address(addr: &Ipv4Addr) -> bool {
    MANAGED_RANGE.contains(addr)
}

/// Third octet of the tunnel's private /24.
///
/// Known defect: ports congruent modulo 250 share an octet (250 and 500 both
/// map to 2). Callers must check [`conflicting_ports`] before provisioning.
pub fn subnet_octet(port: u16) -> u8 {
    // (65535 % 250) + 2 == 37, always fits in u8
    ((port % SUBNET_MODULUS) + SUBNET_OFFSET) as u8
}

/// Ports among `active` whose subnet collides with `port`.
pub fn conflicting_ports(port: u16, active: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let octet = subnet_octet(port);
    active
        .into_iter()
        .filter(|other| *other != port && subnet_octet(*other) == octet)
        .collect()
}

/// `wg-` plus eight hex digits of a digest of the port; fits IFNAMSIZ.
pub fn tunnel_interface_name(port: u16) -> String {
    let digest = Sha256::digest(format!("{port}\n").as_bytes());
    let hex = format!("{digest:x}");
    format!("wg-{}", &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octet_stays_in_range_for_every_port() {
        for port in 1..=u16::MAX {
            let octet = subnet_octet(port);
            assert!((2..=251).contains(&octet), "port {port} -> {octet}");
        }
    }

    #[test]
    fn octet_collides_for_ports_congruent_mod_250() {
        // Known defect kept as-is: the allocation is not unique.
        for port in 1..=(u16::MAX - 250) {
            assert_eq!(subnet_octet(port), subnet_octet(port + 250));
        }
        assert_eq!(subnet_octet(250), 2);
        assert_eq!(subnet_octet(500), 2);
    }

    #[test]
    fn conflicting_ports_reports_collisions() {
        assert_eq!(conflicting_ports(250, [500, 501, 250]), vec![500]);
        assert!(conflicting_ports(443, [8443]).is_empty());
    }

    #[test]
    fn port_51000_layout() {
        let topo = Topology::for_port(51000).unwrap();
        assert_eq!(topo.subnet_octet, 2);
        assert_eq!(topo.namespace, "ns-51000");
        assert_eq!(topo.host_link, "veth-51000");
        assert_eq!(topo.ns_link, "vpeer-51000");
        assert_eq!(topo.host_cidr(), "10.100.2.1/24");
        assert_eq!(topo.ns_cidr(), "10.100.2.2/24");
        assert_eq!(topo.subnet().to_string(), "10.100.2.0/24");
    }

    #[test]
    fn port_zero_and_oversized_ports_are_rejected() {
        assert_eq!(Topology::for_port(0), Err(TopologyError::InvalidPort(0)));
        assert_eq!(
            Topology::for_raw_port(70000),
            Err(TopologyError::InvalidPort(70000))
        );
        assert!(Topology::for_raw_port(65535).is_ok());
    }

    #[test]
    fn namespace_round_trip() {
        assert_eq!(Topology::port_from_namespace("ns-8443"), Some(8443));
        assert_eq!(Topology::port_from_namespace("ns-0"), None);
        assert_eq!(Topology::port_from_namespace("ns-abc"), None);
        assert_eq!(Topology::port_from_namespace("nsxray"), None);
        assert!(is_managed_namespace("ns-1"));
        assert!(!is_managed_namespace("docker"));
    }

    #[test]
    fn tunnel_interface_name_is_stable_and_short() {
        let first = tunnel_interface_name(51000);
        assert_eq!(first, tunnel_interface_name(51000));
        assert_ne!(first, tunnel_interface_name(51001));
        assert!(first.starts_with("wg-"));
        assert_eq!(first.len(), 11);
    }

    #[test]
    fn managed_range() {
        assert!(is_managed_address(&Ipv4Addr::new(10, 100, 7, 2)));
        assert!(!is_managed_address(&Ipv4Addr::new(10, 101, 7, 2)));
    }
}
