//! Rendering of command results as plain tables or JSON.

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write;
use wgns_helper::provisioner::TunnelStatus;
use wgns_helper::restore::RestoreReport;
use wgns_helper::sync::{NamespaceOutcome, SyncReport};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

pub fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => print_json(&Message { status, detail })?,
    }
    Ok(())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print `value` as JSON, or through `table` in table mode.
pub fn print_with<T: Serialize + ?Sized>(
    fmt: OutputFormat,
    value: &T,
    table: impl FnOnce(&T) -> String,
) -> Result<()> {
    match fmt {
        OutputFormat::Table => print!("{}", table(value)),
        OutputFormat::Json => print_json(value)?,
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn tunnel_table(rows: &[TunnelStatus]) -> String {
    if rows.is_empty() {
        return "no tunnels\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<7} {:<12} {:<15} {:<12} {:<6} {:<6} CONFIG",
        "PORT", "NAMESPACE", "ADDRESS", "TUNNEL", "UP", "PROXY"
    );
    for row in rows {
        let address = row
            .namespace_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        let config = row
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<7} {:<12} {:<15} {:<12} {:<6} {:<6} {}",
            row.port,
            row.namespace,
            address,
            row.tunnel_interface.as_deref().unwrap_or("-"),
            yes_no(row.tunnel_up),
            yes_no(row.proxy_listening),
            config
        );
    }
    out
}

pub fn sync_table(report: &SyncReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} credential(s), {}",
        report.credentials,
        if report.synced {
            "changes applied"
        } else {
            "unchanged"
        }
    );
    for entry in &report.namespaces {
        let port = entry
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let outcome = match &entry.outcome {
            NamespaceOutcome::Restarted { pid } => format!("proxy restarted (pid {pid})"),
            NamespaceOutcome::Recorded => "credentials recorded".to_string(),
            NamespaceOutcome::Skipped { reason } => format!("skipped: {reason}"),
            NamespaceOutcome::Failed { reason } => format!("failed: {reason}"),
        };
        let _ = writeln!(out, "  {:<12} {:<7} {}", entry.namespace, port, outcome);
    }
    out
}

pub fn restore_table(report: &RestoreReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "discovered {} tunnel(s) via {:?}: {} restored, {} already present, {} failed",
        report.discovered,
        report.tier,
        report.restored.len(),
        report.already_present.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        let _ = writeln!(out, "  port {}: {}", failure.port, failure.error);
    }
    if let Some(sync) = &report.sync {
        out.push_str(&sync_table(sync));
    }
    out
}
