//! Credential extraction from panel SQLite databases.
//!
//! Known schemas are queried first: `proxies.settings` JSON (one entry per
//! VLESS proxy row, duplicates kept) and `users.uuid` (deduplicated within the
//! table). When neither yields anything the raw file bytes are scanned for
//! UUID-shaped substrings.

use super::CredentialSet;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

const UUID_PATTERN: &str =
    r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}";
const UUID_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum CredentialSourceError {
    #[error("credential database {0} does not exist")]
    Missing(PathBuf),

    #[error("cannot read credential database {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no credential identifiers found in {0}")]
    UnrecognizedSchema(PathBuf),

    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Read the current credential set from `path`.
pub async fn extract(path: &Path) -> Result<CredentialSet, CredentialSourceError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&owned))
        .await
        .map_err(|err| CredentialSourceError::Task(err.to_string()))?
}

pub fn extract_blocking(path: &Path) -> Result<CredentialSet, CredentialSourceError> {
    let metadata = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(CredentialSourceError::Missing(path.to_path_buf())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CredentialSourceError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(CredentialSourceError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let modified = metadata.modified().ok();

    let ids = match structured_ids(path) {
        Ok(ids) if !ids.is_empty() => ids,
        Ok(_) => {
            debug!(path = %path.display(), "known tables empty or absent, scanning raw bytes");
            raw_scan(path)?
        }
        Err(err) => {
            warn!(path = %path.display(), "sqlite extraction failed, scanning raw bytes: {err}");
            raw_scan(path)?
        }
    };

    if ids.is_empty() {
        return Err(CredentialSourceError::UnrecognizedSchema(path.to_path_buf()));
    }
    debug!(path = %path.display(), count = ids.len(), "extracted credentials");
    Ok(CredentialSet::new(ids, modified))
}

fn structured_ids(path: &Path) -> rusqlite::Result<Vec<String>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let tables = table_names(&conn)?;
    let mut ids = Vec::new();

    if tables.contains("proxies") && has_columns(&conn, "proxies", &["settings", "user_id"])? {
        let found = proxy_ids(&conn)?;
        debug!(count = found.len(), "identifiers from proxies table");
        ids.extend(found);
    }

    if tables.contains("users") && has_columns(&conn, "users", &["uuid"])? {
        let found = user_ids(&conn)?;
        debug!(count = found.len(), "identifiers from users table");
        ids.extend(found);
    }

    Ok(ids)
}

fn table_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn has_columns(conn: &Connection, table: &str, wanted: &[&str]) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(wanted.iter().all(|c| columns.contains(*c)))
}

fn proxy_ids(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT settings, user_id FROM \"proxies\" WHERE type = 'VLESS'")?;
    let mut rows = stmt.query([])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let has_user = match row.get_ref(1)? {
            ValueRef::Null => false,
            ValueRef::Integer(v) => v != 0,
            ValueRef::Text(t) | ValueRef::Blob(t) => !t.is_empty(),
            ValueRef::Real(v) => v != 0.0,
        };
        if !has_user {
            continue;
        }
        let settings = match row.get_ref(0)? {
            ValueRef::Text(t) | ValueRef::Blob(t) => t,
            _ => continue,
        };
        if let Some(id) = settings_id(settings) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn settings_id(raw: &[u8]) -> Option<String> {
    let value = match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!("skipping unparseable proxy settings: {err}");
            return None;
        }
    };
    let id = value.get("id")?.as_str()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn user_ids(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT uuid FROM \"users\"")?;
    let mut rows = stmt.query([])?;
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let ValueRef::Text(text) = row.get_ref(0)? else {
            continue;
        };
        let value = String::from_utf8_lossy(text).trim().to_string();
        if !value.is_empty() && seen.insert(value.clone()) {
            ids.push(value);
        }
    }
    Ok(ids)
}

/// Scan the database file bytes for UUID-shaped substrings.
pub fn raw_scan(path: &Path) -> Result<Vec<String>, CredentialSourceError> {
    let data = std::fs::read(path).map_err(|source| CredentialSourceError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let found = scan_bytes(&data);
    debug!(path = %path.display(), count = found.len(), "raw scan finished");
    Ok(found)
}

/// Unique matches, sorted.
pub fn scan_bytes(data: &[u8]) -> Vec<String> {
    let mut found = BTreeSet::new();

    if let Some(pattern) = uuid_regex() {
        let text = String::from_utf8_lossy(data);
        for m in pattern.find_iter(&text) {
            found.insert(m.as_str().to_string());
        }
    }

    // catches identifiers inside regions that break the text decode
    for window in data.windows(UUID_LEN) {
        if is_uuid_bytes(window) {
            found.insert(String::from_utf8_lossy(window).into_owned());
        }
    }

    found.into_iter().collect()
}

fn uuid_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(UUID_PATTERN).ok()).as_ref()
}

fn is_uuid_bytes(window: &[u8]) -> bool {
    window.len() == UUID_LEN
        && window.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const A: &str = "3f2b8c1e-9d4a-4b7e-8c2f-1a2b3c4d5e6f";
    const B: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

    #[test]
    fn window_scan_finds_ids_in_binary_noise() {
        let mut data = vec![0xff, 0xfe, 0x00];
        data.extend_from_slice(A.as_bytes());
        data.extend_from_slice(&[0xc3, 0x28]);
        data.extend_from_slice(B.as_bytes());
        data.extend_from_slice(A.as_bytes());
        assert_eq!(scan_bytes(&data), vec![A.to_string(), B.to_string()]);
    }

    #[test]
    fn window_scan_rejects_near_misses() {
        assert!(!is_uuid_bytes(b"3f2b8c1e-9d4a-4b7e-8c2f_1a2b3c4d5e6f"));
        assert!(!is_uuid_bytes(b"3f2b8c1e-9d4a-4b7e-8c2f-1a2b3c4d5e6"));
        assert!(is_uuid_bytes(A.as_bytes()));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempdir().unwrap();
        let err = extract_blocking(&dir.path().join("nope.db")).unwrap_err();
        assert!(matches!(err, CredentialSourceError::Missing(_)));
    }

    #[test]
    fn non_sqlite_file_falls_back_to_raw_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        std::fs::write(&path, format!("junk {A} more junk")).unwrap();
        let set = extract_blocking(&path).unwrap();
        assert_eq!(set.ids(), [A]);
    }

    #[test]
    fn file_without_ids_is_unrecognized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::write(&path, b"nothing here").unwrap();
        let err = extract_blocking(&path).unwrap_err();
        assert!(matches!(err, CredentialSourceError::UnrecognizedSchema(_)));
    }

    #[test]
    fn panel_tables_are_merged_in_order() {
        const C: &str = "11111111-2222-4333-8444-555555555555";
        const D: &str = "99999999-8888-4777-8666-555555555555";
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE proxies (id INTEGER PRIMARY KEY, user_id INTEGER, type TEXT, settings TEXT);
             CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT, uuid TEXT);",
        )
        .unwrap();
        let proxies: [(Option<i64>, &str, String); 4] = [
            (Some(1), "VLESS", format!(r#"{{"id": "{A}", "flow": ""}}"#)),
            (None, "VLESS", format!(r#"{{"id": "{C}"}}"#)),
            (Some(2), "VMess", format!(r#"{{"id": "{D}"}}"#)),
            (Some(0), "VLESS", format!(r#"{{"id": "{D}"}}"#)),
        ];
        for (user_id, kind, settings) in &proxies {
            conn.execute(
                "INSERT INTO proxies (user_id, type, settings) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, kind, settings],
            )
            .unwrap();
        }
        for (name, uuid) in [("bob", B), ("alice", A), ("bob2", B)] {
            conn.execute(
                "INSERT INTO users (username, uuid) VALUES (?1, ?2)",
                rusqlite::params![name, uuid],
            )
            .unwrap();
        }
        drop(conn);

        let set = extract_blocking(&path).unwrap();
        assert_eq!(set.ids(), [A, B, A]);
    }

    #[test]
    fn settings_id_requires_non_empty_string() {
        assert_eq!(settings_id(br#"{"id": " x "}"#), Some("x".into()));
        assert_eq!(settings_id(br#"{"id": ""}"#), None);
        assert_eq!(settings_id(br#"{"id": 5}"#), None);
        assert_eq!(settings_id(b"not json"), None);
    }
}
