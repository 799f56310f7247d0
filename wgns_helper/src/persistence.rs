//! Durable state: tunnel records, the credential source location, the last
//! applied credential fingerprint and per-port credential lists.
//!
//! Every file is replaced whole through a temp file and a rename, so readers
//! never observe a partial write. Tunnel records live one per port so a crash
//! mid-write costs at most that tunnel's record.

use crate::credentials::{Fingerprint, SourceLocation};
use serde::Serialize;
use shared_utils::{Config, PanelKind};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const RECORD_PREFIX: &str = "tunnel-";
const RECORD_SUFFIX: &str = ".state";
const SOURCE_FILE: &str = "panel.state";
const HASH_FILE: &str = "last_hash.txt";
const MTIME_FILE: &str = "last_db_mtime.txt";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One persisted tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelRecord {
    pub port: u16,
    pub config_path: PathBuf,
}

#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.state_dir, &config.paths.data_dir)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, port: u16) -> PathBuf {
        self.state_dir
            .join(format!("{RECORD_PREFIX}{port}{RECORD_SUFFIX}"))
    }

    pub fn credentials_path(&self, port: u16) -> PathBuf {
        self.data_dir.join(format!("uuids-{port}.txt"))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::io(parent, e))?;
        }
        replace_file(path, contents)
            .await
            .map_err(|e| StateError::io(path, e))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<String>, StateError> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StateError::io(path, err)),
        }
    }

    async fn remove_optional(&self, path: &Path) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StateError::io(path, err)),
        }
    }

    pub async fn save(&self, port: u16, config_path: &Path) -> Result<(), StateError> {
        let body = format!("{port}\n{}\n", config_path.display());
        self.write_atomic(&self.record_path(port), body.as_bytes())
            .await?;
        debug!(port, config = %config_path.display(), "saved tunnel record");
        Ok(())
    }

    /// Returns whether a record existed.
    pub async fn delete(&self, port: u16) -> Result<bool, StateError> {
        let removed = self.remove_optional(&self.record_path(port)).await?;
        if removed {
            debug!(port, "removed tunnel record");
        }
        Ok(removed)
    }

    /// Record for one port, without checking its config file.
    pub async fn load(&self, port: u16) -> Result<Option<TunnelRecord>, StateError> {
        let path = self.record_path(port);
        Ok(self
            .read_optional(&path)
            .await?
            .and_then(|text| parse_record(&text)))
    }

    /// Every record whose config file still exists, ordered by port.
    ///
    /// Records pointing at a vanished config are deleted; unreadable or
    /// malformed records are skipped with a log entry.
    pub async fn load_all(&self) -> Result<Vec<TunnelRecord>, StateError> {
        let mut dir = match fs::read_dir(&self.state_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StateError::io(&self.state_dir, err)),
        };

        let mut records = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StateError::io(&self.state_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(RECORD_PREFIX) || !name.ends_with(RECORD_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(err) => {
                    error!(file = %path.display(), "failed to read tunnel record: {err}");
                    continue;
                }
            };
            let Some(record) = parse_record(&text) else {
                warn!(file = %path.display(), "skipping malformed tunnel record");
                continue;
            };
            if fs::metadata(&record.config_path).await.is_err() {
                warn!(
                    port = record.port,
                    config = %record.config_path.display(),
                    "tunnel config vanished, dropping record"
                );
                self.remove_optional(&path).await?;
                continue;
            }
            records.push(record);
        }

        records.sort_by_key(|r| r.port);
        Ok(records)
    }

    pub async fn save_source(&self, location: &SourceLocation) -> Result<(), StateError> {
        let body = format!("{}\n{}\n", location.kind, location.db_path.display());
        self.write_atomic(&self.state_dir.join(SOURCE_FILE), body.as_bytes())
            .await
    }

    pub async fn load_source(&self) -> Result<Option<SourceLocation>, StateError> {
        let path = self.state_dir.join(SOURCE_FILE);
        let Some(text) = self.read_optional(&path).await? else {
            return Ok(None);
        };
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let (Some(kind), Some(db_path)) = (lines.next(), lines.next()) else {
            warn!(file = %path.display(), "ignoring incomplete source location");
            return Ok(None);
        };
        let Some(kind) = PanelKind::parse(kind) else {
            warn!(file = %path.display(), kind, "ignoring unknown panel kind");
            return Ok(None);
        };
        Ok(Some(SourceLocation::new(kind, db_path)))
    }

    pub async fn load_fingerprint(&self) -> Result<Fingerprint, StateError> {
        let hash = self
            .read_optional(&self.data_dir.join(HASH_FILE))
            .await?
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let source_mtime = self
            .read_optional(&self.data_dir.join(MTIME_FILE))
            .await?
            .and_then(|raw| parse_mtime(raw.trim()));
        Ok(Fingerprint { hash, source_mtime })
    }

    pub async fn save_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), StateError> {
        let hash = fingerprint.hash.clone().unwrap_or_default();
        self.write_atomic(&self.data_dir.join(HASH_FILE), hash.as_bytes())
            .await?;
        if let Some(mtime) = fingerprint.source_mtime.and_then(format_mtime) {
            self.write_atomic(&self.data_dir.join(MTIME_FILE), mtime.as_bytes())
                .await?;
        }
        Ok(())
    }

    /// Blank the recorded hash, keeping the mtime marker.
    pub async fn clear_fingerprint_hash(&self) -> Result<(), StateError> {
        self.write_atomic(&self.data_dir.join(HASH_FILE), b"").await
    }

    /// Write the identifiers for `port`, sorted, one per line.
    pub async fn save_credentials(&self, port: u16, ids: &[String]) -> Result<(), StateError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        let mut body = String::new();
        for id in &sorted {
            body.push_str(id);
            body.push('\n');
        }
        self.write_atomic(&self.credentials_path(port), body.as_bytes())
            .await
    }

    pub async fn load_credentials(&self, port: u16) -> Result<Option<Vec<String>>, StateError> {
        Ok(self
            .read_optional(&self.credentials_path(port))
            .await?
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            }))
    }
}

fn parse_record(text: &str) -> Option<TunnelRecord> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let port = lines.next()?.parse::<u16>().ok().filter(|p| *p != 0)?;
    let config_path = PathBuf::from(lines.next()?);
    Some(TunnelRecord { port, config_path })
}

fn format_mtime(mtime: SystemTime) -> Option<String> {
    let since = mtime.duration_since(UNIX_EPOCH).ok()?;
    Some(format!("{}.{:09}", since.as_secs(), since.subsec_nanos()))
}

fn parse_mtime(raw: &str) -> Option<SystemTime> {
    let (secs, nanos) = match raw.split_once('.') {
        Some((secs, frac)) => {
            // accept fewer than nine fractional digits
            let padded = format!("{frac:0<9}");
            (secs.parse::<u64>().ok()?, padded.get(..9)?.parse::<u32>().ok()?)
        }
        None => (raw.parse::<u64>().ok()?, 0),
    };
    UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

/// Replace `path` whole: write a sibling temp file, then rename it over the
/// target. The parent directory must exist.
pub async fn replace_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}
