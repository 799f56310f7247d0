//! Operator-supplied wireguard configuration files.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Directives this system manages itself; dropped before `wg setconf`.
pub const STRIPPED_DIRECTIVES: [&str; 8] = [
    "Address", "DNS", "Table", "MTU", "PreUp", "PostUp", "PreDown", "PostDown",
];

/// Interface address used when the file carries none.
pub const DEFAULT_ADDRESS: &str = "10.0.0.2/32";

#[derive(Debug, Error)]
pub enum TunnelConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} has no Endpoint")]
    MissingEndpoint(PathBuf),

    #[error("invalid Endpoint value `{0}`")]
    InvalidEndpoint(String),
}

/// The fields of a tunnel config this system acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub path: PathBuf,
    /// Address assigned to the tunnel interface inside the namespace.
    pub address: String,
    pub endpoint_host: String,
    pub endpoint_port: Option<u16>,
    /// File body without [`STRIPPED_DIRECTIVES`].
    pub stripped: String,
}

impl TunnelConfig {
    pub async fn load(path: &Path) -> Result<Self, TunnelConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| TunnelConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, TunnelConfigError> {
        let address = first_value(text, "address").unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let endpoint = first_value(text, "endpoint")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TunnelConfigError::MissingEndpoint(path.to_path_buf()))?;
        let (endpoint_host, endpoint_port) = split_endpoint(&endpoint)?;

        Ok(Self {
            path: path.to_path_buf(),
            address,
            endpoint_host,
            endpoint_port,
            stripped: strip_managed_directives(text),
        })
    }
}

/// Whether file content looks like a wireguard config.
pub fn looks_like_tunnel_config(text: &str) -> bool {
    text.contains("[Interface]") || text.contains("PrivateKey")
}

pub fn strip_managed_directives(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if STRIPPED_DIRECTIVES.iter().any(|d| line.starts_with(d)) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn first_value(text: &str, key: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| line.to_lowercase().starts_with(key))
        .and_then(|line| line.split_once('='))
        .map(|(_, value)| value.trim().to_string())
}

fn split_endpoint(endpoint: &str) -> Result<(String, Option<u16>), TunnelConfigError> {
    let invalid = || TunnelConfigError::InvalidEndpoint(endpoint.to_string());

    // [v6addr]:port
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match endpoint.split_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok((host.to_string(), Some(port)))
        }
        Some(_) => Err(invalid()),
        None => Ok((endpoint.to_string(), None)),
    }
}
