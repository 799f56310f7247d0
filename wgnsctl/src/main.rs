mod output;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use output::{print_msg, print_with, restore_table, sync_table, tunnel_table, OutputFormat};
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, parse_level, LogFormat, LogOptions};
use shared_utils::PanelKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};
use wgns_helper::credentials::SourceLocation;
use wgns_helper::network::MemoryController;
use wgns_helper::provisioner::{log_prefixes, HandshakeStatus, RestoreOutcome};
use wgns_helper::resolver::ChainResolver;
use wgns_helper::topology::namespace_name;
use wgns_helper::watcher::{start_background, BackgroundMode, Watcher};
use wgns_helper::{AppContext, RestoreOrchestrator};

const KERNEL_LOG: &str = "/var/log/kern.log";

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PanelArg {
    #[value(name = "x-ui")]
    XUi,
    Marzban,
}

impl From<PanelArg> for PanelKind {
    fn from(arg: PanelArg) -> Self {
        match arg {
            PanelArg::XUi => PanelKind::XUi,
            PanelArg::Marzban => PanelKind::Marzban,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  wgnsctl create --port 51000 --config /root/wg-51000.conf\n  wgnsctl panel set --kind x-ui\n  wgnsctl sync --force\n  wgnsctl --dry-run create --port 8443 --config ./wg.conf")]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Log level (overrides the configured one)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Emit JSON logs
    #[arg(long, env = "WGNS_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Run against an in-memory network and print the commands instead
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a tunnel namespace for a public port
    Create {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// WireGuard config file
        #[arg(short = 'f', long = "config-file", value_name = "FILE")]
        config_file: PathBuf,
    },
    /// Tear down a tunnel and its rules
    Delete {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Show managed tunnels
    List,
    /// Restore every known tunnel (boot-time entry point)
    Restore {
        /// Print nothing; only errors are logged
        #[arg(short, long)]
        quiet: bool,
    },
    /// Restore one tunnel from an explicit config file
    RestoreFile {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        #[arg(short = 'f', long = "config-file", value_name = "FILE")]
        config_file: PathBuf,
        /// Delete an existing namespace for the port first
        #[arg(long)]
        recreate: bool,
    },
    /// Push panel credentials to every proxy
    Sync {
        /// Restart proxies even when nothing changed
        #[arg(long)]
        force: bool,
    },
    /// Run the credential watcher in the foreground
    Watch,
    /// Start the watcher under the service manager, or in the foreground
    StartWatcher,
    /// Cycle a tunnel interface and wait for a handshake
    RestartTunnel {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Install kernel LOG rules for a port
    EnableLogging {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        /// Follow matching kernel log lines until interrupted, then remove the rules
        #[arg(long)]
        follow: bool,
    },
    /// Manage the credential source
    Panel {
        #[command(subcommand)]
        action: PanelCmd,
    },
    /// Manage proxy processes
    Proxy {
        #[command(subcommand)]
        action: ProxyCmd,
    },
}

impl Command {
    fn is_long_running(&self) -> bool {
        matches!(self, Command::Watch | Command::StartWatcher)
    }
}

#[derive(Subcommand, Debug)]
enum PanelCmd {
    Set {
        #[arg(short, long, value_enum)]
        kind: PanelArg,
        /// Database path (defaults to the panel's stock location)
        #[arg(long, value_name = "FILE")]
        db: Option<PathBuf>,
    },
    Show,
}

#[derive(Subcommand, Debug)]
enum ProxyCmd {
    /// (Re)start from the recorded credential list
    Start {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    Stop {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    Logs {
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let quiet = matches!(args.command, Command::Restore { quiet: true });
    let level = match (quiet, args.log_level) {
        (true, _) => tracing::Level::ERROR,
        (false, Some(level)) => level.into(),
        (false, None) => parse_level(&config.log_level),
    };
    let mut log_options = LogOptions {
        level,
        format: if args.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..LogOptions::default()
    };
    if args.command.is_long_running() && !args.dry_run {
        log_options = log_options.with_file(&config.paths.proxy_log_dir, "wgns-watcher");
    }
    let _guard = init_logging(log_options);
    if !config_found {
        warn!(path = %args.config.display(), "config file not found, using defaults");
    }

    let memory = if args.dry_run {
        sandbox_paths(&mut config);
        Some(Arc::new(MemoryController::new()))
    } else {
        ensure_root()?;
        None
    };

    let ctx = Arc::new(match &memory {
        Some(memory) => {
            let resolver = Arc::new(ChainResolver::new(config.network.resolve_timeout()));
            AppContext::new(config, memory.clone(), resolver)
        }
        None => AppContext::for_host(config),
    });

    run(args.command, args.output, ctx).await?;

    if let Some(memory) = memory {
        for line in memory.journal().await {
            println!("{line}");
        }
    }
    debug!("wgnsctl command completed");
    Ok(())
}

async fn run(command: Command, fmt: OutputFormat, ctx: Arc<AppContext>) -> Result<()> {
    match command {
        Command::Create { port, config_file } => {
            let tunnel = ctx
                .provisioner()
                .create(port, &config_file)
                .await
                .with_context(|| format!("failed to create tunnel on port {port}"))?;
            RestoreOrchestrator::new(ctx.clone()).resync(&[port]).await;
            print_with(fmt, &tunnel, |t| {
                format!(
                    "tunnel on port {} ready in {} (endpoint {} -> {})\n",
                    t.topology.port, t.topology.namespace, t.endpoint_host, t.endpoint_ip
                )
            })?;
        }
        Command::Delete { port } => {
            let report = ctx.provisioner().delete(port).await?;
            print_with(fmt, &report, |r| {
                format!(
                    "port {} deleted (namespace existed: {}, rules removed: {}, record removed: {})\n",
                    r.port, r.namespace_existed, r.rules_removed, r.record_removed
                )
            })?;
        }
        Command::List => {
            let rows = ctx.provisioner().list().await?;
            print_with(fmt, rows.as_slice(), tunnel_table)?;
        }
        Command::Restore { quiet } => {
            let report = RestoreOrchestrator::new(ctx).restore_all().await?;
            if !quiet {
                print_with(fmt, &report, restore_table)?;
            }
        }
        Command::RestoreFile {
            port,
            config_file,
            recreate,
        } => {
            let outcome = RestoreOrchestrator::new(ctx)
                .restore_from_file(port, &config_file, recreate)
                .await?;
            match outcome {
                RestoreOutcome::Provisioned(_) => {
                    print_msg(fmt, "ok", &format!("tunnel on port {port} restored"))?
                }
                RestoreOutcome::AlreadyPresent => print_msg(
                    fmt,
                    "unchanged",
                    &format!("tunnel on port {port} already exists; pass --recreate to rebuild it"),
                )?,
            }
        }
        Command::Sync { force } => {
            let source = ctx
                .resolve_source()
                .await?
                .context("no credential source configured; run `wgnsctl panel set` first")?;
            let report = ctx.synchronizer().refresh(&source, force).await?;
            print_with(fmt, &report, sync_table)?;
        }
        Command::Watch => {
            let watcher = Watcher::new(ctx)?;
            let cancel = watcher.cancellation_token();
            let handle = tokio::spawn(watcher.run());
            wait_for_shutdown().await?;
            cancel.cancel();
            handle.await.context("watcher task panicked")?;
        }
        Command::StartWatcher => match start_background(ctx).await? {
            BackgroundMode::Service(unit) => {
                print_msg(fmt, "ok", &format!("watcher supervised by {unit}"))?
            }
            BackgroundMode::InProcess { handle, cancel } => {
                print_msg(
                    fmt,
                    "ok",
                    "service manager unavailable, watcher running in the foreground",
                )?;
                wait_for_shutdown().await?;
                cancel.cancel();
                handle.await.context("watcher task panicked")?;
            }
        },
        Command::RestartTunnel { port } => {
            let status = ctx.provisioner().restart_tunnel(port).await?;
            match status {
                HandshakeStatus::Established => {
                    print_msg(fmt, "ok", &format!("port {port}: handshake established"))?
                }
                HandshakeStatus::NotYetEstablished => print_msg(
                    fmt,
                    "pending",
                    &format!("port {port}: restarted, no handshake yet"),
                )?,
            }
        }
        Command::EnableLogging { port, follow } => {
            let count = ctx.provisioner().enable_packet_logging(port).await?;
            print_msg(fmt, "ok", &format!("{count} LOG rules installed for port {port}"))?;
            if follow {
                follow_kernel_log(port).await;
                let removed = ctx.provisioner().disable_packet_logging(port).await?;
                print_msg(fmt, "ok", &format!("{removed} LOG rules removed"))?;
            }
        }
        Command::Panel { action } => match action {
            PanelCmd::Set { kind, db } => {
                let kind = PanelKind::from(kind);
                let location = match db {
                    Some(path) => SourceLocation::new(kind, path),
                    None => SourceLocation::with_default_path(kind),
                };
                if !location.db_path.exists() {
                    warn!(path = %location.db_path.display(), "panel database does not exist yet");
                }
                ctx.set_source(location.clone()).await?;
                print_msg(fmt, "ok", &format!("credential source set to {location}"))?;
            }
            PanelCmd::Show => match ctx.resolve_source().await? {
                Some(location) => print_with(fmt, &location, |l| format!("{l}\n"))?,
                None => print_msg(fmt, "unset", "no credential source configured")?,
            },
        },
        Command::Proxy { action } => match action {
            ProxyCmd::Start { port } => {
                let restart = ctx.proxy().regenerate(port).await?;
                print_msg(
                    fmt,
                    "ok",
                    &format!("proxy on port {port} started (pid {})", restart.pid),
                )?;
            }
            ProxyCmd::Stop { port } => {
                let pids = ctx.proxy().stop(&namespace_name(port), port).await?;
                print_msg(
                    fmt,
                    "ok",
                    &format!("terminated {} process(es) on port {port}", pids.len()),
                )?;
            }
            ProxyCmd::Logs { port, lines } => {
                let lines = ctx.proxy().tail_log(port, lines).await?;
                print_with(fmt, lines.as_slice(), |l| {
                    l.iter().map(|line| format!("{line}\n")).collect()
                })?;
            }
        },
    }
    Ok(())
}

fn ensure_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("wgnsctl must run as root (use --dry-run to preview commands)");
    }
    Ok(())
}

/// Keep dry runs away from the real state, data and binary locations.
fn sandbox_paths(config: &mut Config) {
    let root = std::env::temp_dir().join(format!("wgnsctl-dry-run-{}", std::process::id()));
    config.paths.state_dir = root.join("state");
    config.paths.data_dir = root.join("data");
    config.paths.proxy_log_dir = root.join("log");
    config.proxy.binary = root.join("bin").join("xray-ns");
    info!(root = %root.display(), "dry run, state redirected");
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    Ok(())
}

/// Print kernel log lines carrying the port's LOG prefixes until interrupted.
async fn follow_kernel_log(port: u16) {
    let prefixes = log_prefixes(port);
    let child = tokio::process::Command::new("tail")
        .args(["-F", "-n", "0", KERNEL_LOG])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            warn!("cannot follow {KERNEL_LOG}: {err}");
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    let follow = async {
        while let Ok(Some(line)) = lines.next_line().await {
            if prefixes.iter().any(|p| line.contains(p.as_str())) {
                println!("{line}");
            }
        }
    };
    tokio::select! {
        _ = follow => {}
        result = wait_for_shutdown() => {
            if let Err(err) = result {
                warn!("signal handling failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn help_renders_with_examples() {
        let mut cmd = Args::command();
        let help = cmd.render_long_help().to_string();
        assert!(help.contains("Examples:"));
    }

    #[test]
    fn parses_create_with_json_output() {
        let args = Args::parse_from([
            "wgnsctl",
            "--output",
            "json",
            "create",
            "--port",
            "51000",
            "--config-file",
            "/root/wg-51000.conf",
        ]);
        assert_eq!(args.output, OutputFormat::Json);
        assert!(!args.dry_run);
        match args.command {
            Command::Create { port, config_file } => {
                assert_eq!(port, 51000);
                assert_eq!(config_file, PathBuf::from("/root/wg-51000.conf"));
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn rejects_port_zero() {
        assert!(Args::try_parse_from(["wgnsctl", "delete", "--port", "0"]).is_err());
        assert!(Args::try_parse_from(["wgnsctl", "delete", "--port", "70000"]).is_err());
    }

    #[test]
    fn parses_panel_set() {
        let args = Args::parse_from(["wgnsctl", "panel", "set", "--kind", "x-ui"]);
        match args.command {
            Command::Panel {
                action: PanelCmd::Set { kind, db },
            } => {
                assert_eq!(kind, PanelArg::XUi);
                assert!(db.is_none());
            }
            other => panic!("expected panel set, got {other:?}"),
        }
    }

    #[test]
    fn restore_quiet_and_config_default() {
        let args = Args::parse_from(["wgnsctl", "restore", "--quiet"]);
        assert!(matches!(args.command, Command::Restore { quiet: true }));
        assert_eq!(args.config, Config::default_path());
    }

    #[test]
    fn dry_run_paths_leave_system_locations() {
        let mut config = Config::default();
        sandbox_paths(&mut config);
        assert!(config.paths.state_dir.starts_with(std::env::temp_dir()));
        assert!(config.proxy.binary.starts_with(std::env::temp_dir()));
    }
}
