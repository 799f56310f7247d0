//! Endpoint hostname resolution.
//!
//! Methods are tried in order and the first IPv4 answer wins. Each external
//! lookup runs under a short timeout so a dead resolver cannot stall
//! provisioning.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::debug;

#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// `None` when no method produced an address.
    async fn resolve(&self, host: &str) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMethod {
    /// The host is already an IPv4 literal.
    Literal,
    Getent,
    Host,
    Dig,
    /// The process's own resolver via `getaddrinfo`.
    System,
}

/// Tries each [`ResolveMethod`] in turn.
#[derive(Debug, Clone)]
pub struct ChainResolver {
    methods: Vec<ResolveMethod>,
    timeout: Duration,
}

impl ChainResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            methods: vec![
                ResolveMethod::Literal,
                ResolveMethod::Getent,
                ResolveMethod::Host,
                ResolveMethod::Dig,
                ResolveMethod::System,
            ],
            timeout,
        }
    }

    pub fn with_methods(methods: Vec<ResolveMethod>, timeout: Duration) -> Self {
        Self { methods, timeout }
    }

    async fn run(&self, method: ResolveMethod, host: &str) -> Option<Ipv4Addr> {
        match method {
            ResolveMethod::Literal => host.parse().ok(),
            ResolveMethod::Getent => self
                .command_output("getent", &["ahosts", host])
                .await
                .and_then(|out| parse_getent(&out)),
            ResolveMethod::Host => self
                .command_output("host", &[host])
                .await
                .and_then(|out| parse_host(&out)),
            ResolveMethod::Dig => self
                .command_output("dig", &["+short", host])
                .await
                .and_then(|out| parse_dig(&out)),
            ResolveMethod::System => {
                let lookup = tokio::net::lookup_host((host, 0));
                match timeout(self.timeout, lookup).await {
                    Ok(Ok(addrs)) => addrs
                        .filter_map(|sa| match sa.ip() {
                            IpAddr::V4(v4) => Some(v4),
                            IpAddr::V6(_) => None,
                        })
                        .next(),
                    _ => None,
                }
            }
        }
    }

    async fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        let child = TokioCommand::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        match timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                debug!(program, "resolver command unavailable: {err}");
                None
            }
            Err(_) => {
                debug!(program, "resolver command timed out");
                None
            }
        }
    }
}

#[async_trait]
impl EndpointResolver for ChainResolver {
    async fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        for method in &self.methods {
            if let Some(ip) = self.run(*method, host).await {
                debug!(host, ?method, %ip, "resolved endpoint");
                return Some(ip);
            }
        }
        None
    }
}

/// Fixed answers; for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, ip: Ipv4Addr) -> Self {
        self.answers.insert(host.to_string(), ip);
        self
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        self.answers
            .get(host)
            .copied()
            .or_else(|| host.parse().ok())
    }
}

fn parse_getent(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find_map(|field| field.parse().ok())
}

fn parse_host(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter(|line| line.contains("has address"))
        .filter_map(|line| line.split_whitespace().nth(3))
        .find_map(|field| field.parse().ok())
}

fn parse_dig(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| line.trim().parse().ok())
}
