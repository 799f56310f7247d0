//! Credential snapshots pulled from a panel database.

pub mod detector;
pub mod source;

pub use detector::{should_sync, ChangeDetector, Fingerprint, SyncDecision};
pub use source::{extract, CredentialSourceError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use shared_utils::config::PanelConfig;
use shared_utils::PanelKind;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// Which panel database to read credentials from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub kind: PanelKind,
    pub db_path: PathBuf,
}

impl SourceLocation {
    pub fn new(kind: PanelKind, db_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            db_path: db_path.into(),
        }
    }

    /// The panel's stock database location.
    pub fn with_default_path(kind: PanelKind) -> Self {
        Self::new(kind, kind.default_db_path())
    }

    pub fn from_config(panel: &PanelConfig) -> Option<Self> {
        let kind = panel.kind?;
        let path = panel.resolved_db_path()?;
        Some(Self::new(kind, path))
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.db_path.display())
    }
}

/// Identifiers extracted in one pass, with their order-independent digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    ids: Vec<String>,
    content_hash: String,
    source_modified: Option<SystemTime>,
}

impl CredentialSet {
    pub fn new(ids: Vec<String>, source_modified: Option<SystemTime>) -> Self {
        let content_hash = content_hash(&ids);
        Self {
            ids,
            content_hash,
            source_modified,
        }
    }

    /// Identifiers in extraction order; duplicates preserved.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn sorted_ids(&self) -> Vec<String> {
        let mut sorted = self.ids.clone();
        sorted.sort();
        sorted
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn source_modified(&self) -> Option<SystemTime> {
        self.source_modified
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Hex SHA-256 of the identifiers sorted ascending and joined by newlines.
pub fn content_hash(ids: &[String]) -> String {
    let mut sorted = ids.iter().map(String::as_str).collect::<Vec<_>>();
    sorted.sort_unstable();
    let digest = Sha256::digest(sorted.join("\n").as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn hash_ignores_order() {
        assert_eq!(content_hash(&ids(&["a", "b"])), content_hash(&ids(&["b", "a"])));
        assert_ne!(content_hash(&ids(&["a", "b"])), content_hash(&ids(&["a", "c"])));
    }

    #[test]
    fn hash_counts_duplicates() {
        assert_ne!(content_hash(&ids(&["a", "a"])), content_hash(&ids(&["a"])));
    }

    #[test]
    fn set_keeps_extraction_order() {
        let set = CredentialSet::new(ids(&["u2", "u1", "u2"]), None);
        assert_eq!(set.ids(), ["u2", "u1", "u2"]);
        assert_eq!(set.sorted_ids(), ["u1", "u2", "u2"]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn location_from_config_uses_panel_default() {
        let panel = PanelConfig {
            kind: Some(PanelKind::Marzban),
            db_path: None,
            log_command: Vec::new(),
        };
        let loc = SourceLocation::from_config(&panel).unwrap();
        assert_eq!(loc.db_path, PanelKind::Marzban.default_db_path());
        assert!(SourceLocation::from_config(&PanelConfig::default()).is_none());
    }
}
