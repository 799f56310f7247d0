//! Decides whether a freshly extracted credential set must be pushed to the
//! proxies.

use super::CredentialSet;
use crate::persistence::{StateError, StateStore};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Last applied credential digest and source modification time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: Option<String>,
    pub source_mtime: Option<SystemTime>,
}

/// True iff forced, the source changed, no prior hash exists, or the hash moved.
pub fn should_sync(
    current: &CredentialSet,
    last_hash: Option<&str>,
    source_changed: bool,
    force: bool,
) -> bool {
    force
        || source_changed
        || match last_hash {
            None => true,
            Some(last) => last != current.content_hash(),
        }
}

/// Outcome of [`ChangeDetector::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDecision {
    pub sync: bool,
    pub source_changed: bool,
    pub previous_hash: Option<String>,
}

/// [`should_sync`] over fingerprints persisted in the [`StateStore`], so a
/// process restart neither forces nor hides a resync.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    store: Arc<StateStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Compare the source's mtime with the recorded one. A change discards
    /// the recorded hash so the next decision treats the set as new.
    pub async fn observe_source(&self, mtime: Option<SystemTime>) -> Result<bool, StateError> {
        let last = self.store.load_fingerprint().await?;
        let changed = last.source_mtime.is_none() || last.source_mtime != mtime;
        if changed {
            debug!(previous = ?last.source_mtime, current = ?mtime, "credential source modified");
            self.store.clear_fingerprint_hash().await?;
        }
        Ok(changed)
    }

    /// Decide for `current` and record it as the applied fingerprint.
    pub async fn decide(
        &self,
        current: &CredentialSet,
        source_changed: bool,
        force: bool,
    ) -> Result<SyncDecision, StateError> {
        let last = self.store.load_fingerprint().await?;
        let sync = should_sync(current, last.hash.as_deref(), source_changed, force);

        let mut next = Fingerprint {
            hash: Some(current.content_hash().to_string()),
            source_mtime: last.source_mtime,
        };
        if current.source_modified().is_some() {
            next.source_mtime = current.source_modified();
        }
        self.store.save_fingerprint(&next).await?;

        debug!(
            previous = last.hash.as_deref().map(short_hash).unwrap_or("none"),
            current = short_hash(current.content_hash()),
            count = current.len(),
            source_changed,
            force,
            sync,
            "credential change decision"
        );

        Ok(SyncDecision {
            sync,
            source_changed,
            previous_hash: last.hash,
        })
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
