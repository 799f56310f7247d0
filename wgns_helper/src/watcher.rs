//! Periodic credential synchronization.
//!
//! One [`Watcher`] may exist per process. A tick resolves the credential
//! source, extracts and pushes; an unknown source or a failing tick never
//! stops the loop. After `max_consecutive_failures` failed ticks in a row
//! the next pause is doubled and the counter starts over.

use crate::context::AppContext;
use crate::sync::SyncReport;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static WATCHER_ACTIVE: AtomicBool = AtomicBool::new(false);

const REATTACH_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("a watcher is already running in this process")]
    AlreadyRunning,
}

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    Synced(SyncReport),
    /// No credential source known yet.
    Unconfigured,
    Failed(String),
}

/// Clears the process-wide flag when the watcher goes away.
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self, WatcherError> {
        WATCHER_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ActiveGuard)
            .map_err(|_| WatcherError::AlreadyRunning)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        WATCHER_ACTIVE.store(false, Ordering::Release);
    }
}

pub struct Watcher {
    ctx: Arc<AppContext>,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    _active: ActiveGuard,
}

impl Watcher {
    pub fn new(ctx: Arc<AppContext>) -> Result<Self, WatcherError> {
        let active = ActiveGuard::acquire()?;
        Ok(Self {
            ctx,
            cancel: CancellationToken::new(),
            trigger: Arc::new(Notify::new()),
            _active: active,
        })
    }

    pub fn is_active() -> bool {
        WATCHER_ACTIVE.load(Ordering::Acquire)
    }

    /// Cancelling this token ends [`run`](Self::run) after the current tick.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Notifying this forces an early tick.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub async fn tick(&self) -> TickOutcome {
        let source = match self.ctx.resolve_source().await {
            Ok(Some(source)) => source,
            Ok(None) => {
                debug!("credential source not configured yet");
                return TickOutcome::Unconfigured;
            }
            Err(err) => return TickOutcome::Failed(err.to_string()),
        };

        match self.ctx.synchronizer().refresh(&source, false).await {
            Ok(report) => TickOutcome::Synced(report),
            Err(err) => TickOutcome::Failed(err.to_string()),
        }
    }

    pub async fn run(self) {
        let settings = &self.ctx.config().watcher;
        let interval = settings.interval();
        let max_failures = settings.max_consecutive_failures;
        info!(interval_secs = settings.interval_secs, "credential watcher started");

        let follower = self.spawn_log_follower();
        let mut failures = 0u32;

        loop {
            match self.tick().await {
                TickOutcome::Failed(reason) => {
                    failures += 1;
                    warn!(failures, %reason, "watcher tick failed");
                }
                TickOutcome::Synced(_) | TickOutcome::Unconfigured => failures = 0,
            }

            let pause = next_pause(&mut failures, max_failures, interval);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.trigger.notified() => debug!("watcher triggered early"),
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Some(handle) = follower {
            if let Err(err) = handle.await {
                warn!("panel log follower ended abnormally: {err}");
            }
        }
        info!("credential watcher stopped");
    }

    fn spawn_log_follower(&self) -> Option<JoinHandle<()>> {
        let command = self.ctx.config().panel.log_command.clone();
        if command.is_empty() {
            return None;
        }
        let follower = PanelLogFollower::new(command, self.trigger.clone(), self.cancel.child_token());
        Some(tokio::spawn(follower.run()))
    }
}

/// How the background watcher ended up running.
#[derive(Debug)]
pub enum BackgroundMode {
    /// Supervised by the service manager under this unit.
    Service(String),
    InProcess {
        handle: JoinHandle<()>,
        cancel: CancellationToken,
    },
}

/// Hand the watcher to the service manager when configured and possible,
/// otherwise spawn it in this process.
pub async fn start_background(ctx: Arc<AppContext>) -> Result<BackgroundMode, WatcherError> {
    let settings = ctx.config().watcher.clone();
    if settings.prefer_service {
        let unit = settings.service_unit.as_str();
        if unit_active(&ctx, unit).await {
            info!(unit, "watcher already supervised by service manager");
            return Ok(BackgroundMode::Service(unit.to_string()));
        }
        match ctx.network().exec(None, &["systemctl", "start", unit]).await {
            Ok(out) if out.success && unit_active(&ctx, unit).await => {
                info!(unit, "watcher service started");
                return Ok(BackgroundMode::Service(unit.to_string()));
            }
            Ok(out) => debug!(unit, stderr = %out.stderr.trim(), "watcher service unavailable"),
            Err(err) => debug!(unit, "cannot reach service manager: {err}"),
        }
    }

    let watcher = Watcher::new(ctx)?;
    let cancel = watcher.cancellation_token();
    info!("running watcher in process");
    Ok(BackgroundMode::InProcess {
        handle: tokio::spawn(watcher.run()),
        cancel,
    })
}

async fn unit_active(ctx: &AppContext, unit: &str) -> bool {
    match ctx
        .network()
        .exec(None, &["systemctl", "is-active", unit])
        .await
    {
        Ok(out) => out.success && out.stdout.trim() == "active",
        Err(_) => false,
    }
}

/// Follows a panel's log stream and fires the watcher trigger when a user is
/// added, so new credentials propagate before the next scheduled tick.
pub struct PanelLogFollower {
    command: Vec<String>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    reattach_delay: Duration,
}

impl PanelLogFollower {
    pub fn new(command: Vec<String>, trigger: Arc<Notify>, cancel: CancellationToken) -> Self {
        Self {
            command,
            trigger,
            cancel,
            reattach_delay: REATTACH_DELAY,
        }
    }

    pub fn with_reattach_delay(mut self, delay: Duration) -> Self {
        self.reattach_delay = delay;
        self
    }

    pub async fn run(self) {
        let Some((program, args)) = self.command.split_first() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.follow_once(program, args) => match result {
                    Ok(()) => debug!(program = %program, "panel log stream ended"),
                    Err(err) => warn!(program = %program, "cannot follow panel log: {err}"),
                },
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reattach_delay) => {}
            }
        }
    }

    async fn follow_once(&self, program: &str, args: &[String]) -> std::io::Result<()> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let Some(stdout) = child.stdout.take() else {
            return Ok(());
        };

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if announces_new_user(&line) {
                info!("panel reported a new user, syncing early");
                self.trigger.notify_one();
            }
        }
        child.wait().await?;
        Ok(())
    }
}

pub fn announces_new_user(line: &str) -> bool {
    line.contains("New user") && line.contains("added")
}

/// Pause before the next tick. Reaching `max` consecutive failures doubles
/// it once and resets the counter.
fn next_pause(failures: &mut u32, max: u32, interval: Duration) -> Duration {
    if *failures < max {
        return interval;
    }
    error!(failures = *failures, "too many consecutive failures, backing off");
    *failures = 0;
    interval * 2
}
