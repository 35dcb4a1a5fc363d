// SQLite persistence: key-value state (token set) and the live session's
// played set.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::ledger::{Address, TrackId};

/// SQLite-backed persistence for small JSON state values and the
/// session-scoped played set.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_played (
                target    TEXT NOT NULL,
                track_id  INTEGER NOT NULL,
                played_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (target, track_id)
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock still guards a consistent connection.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a JSON value under `key`, replacing any previous value.
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn();
        let json_str = serde_json::to_string(value).context("failed to serialize state value")?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, json_str],
        )
        .context("failed to save state")?;
        Ok(())
    }

    /// Load a previously saved JSON value. `None` if the key does not exist.
    pub fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .context("failed to prepare load_state query")?;

        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .context("failed to query state")?;

        match rows.next() {
            Some(row_result) => {
                let json_str = row_result.context("failed to read state row")?;
                let value = serde_json::from_str(&json_str)
                    .context("failed to deserialize state value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn delete_state(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .context("failed to delete state")?;
        Ok(())
    }

    /// Mark a track played in the live session for `target`. Idempotent.
    pub fn record_played(&self, target: Address, id: TrackId) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO session_played (target, track_id) VALUES (?1, ?2)",
                params![target.to_string(), id.0 as i64],
            )
            .context("failed to record played track")?;
        Ok(())
    }

    /// Played set of the session for `target`, in the order tracks were played.
    pub fn load_played(&self, target: Address) -> Result<Vec<TrackId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT track_id FROM session_played WHERE target = ?1
                 ORDER BY played_at, track_id",
            )
            .context("failed to prepare load_played query")?;

        let ids = stmt
            .query_map(params![target.to_string()], |row| row.get::<_, i64>(0))
            .context("failed to query played tracks")?
            .map(|r| r.map(|id| TrackId(id as u64)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map played rows")?;

        Ok(ids)
    }

    /// Forget the played set for `target` (session ended).
    pub fn clear_played(&self, target: Address) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM session_played WHERE target = ?1",
                params![target.to_string()],
            )
            .context("failed to clear played tracks")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from_bytes(bytes)
    }

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('kv', 'session_played')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn state_save_overwrite_and_delete() {
        let db = test_db();
        assert!(db.load_state("tokens").unwrap().is_none());

        db.save_state("tokens", &json!({"access": "a"})).unwrap();
        db.save_state("tokens", &json!({"access": "b"})).unwrap();
        assert_eq!(db.load_state("tokens").unwrap(), Some(json!({"access": "b"})));

        db.delete_state("tokens").unwrap();
        assert!(db.load_state("tokens").unwrap().is_none());
    }

    #[test]
    fn played_set_is_scoped_per_target_and_idempotent() {
        let db = test_db();
        db.record_played(addr(1), TrackId(3)).unwrap();
        db.record_played(addr(1), TrackId(3)).unwrap();
        db.record_played(addr(1), TrackId(7)).unwrap();
        db.record_played(addr(2), TrackId(9)).unwrap();

        let mut played = db.load_played(addr(1)).unwrap();
        played.sort();
        assert_eq!(played, vec![TrackId(3), TrackId(7)]);
        assert_eq!(db.load_played(addr(2)).unwrap(), vec![TrackId(9)]);
    }

    #[test]
    fn clear_played_only_affects_one_target() {
        let db = test_db();
        db.record_played(addr(1), TrackId(1)).unwrap();
        db.record_played(addr(2), TrackId(2)).unwrap();
        db.clear_played(addr(1)).unwrap();
        assert!(db.load_played(addr(1)).unwrap().is_empty());
        assert_eq!(db.load_played(addr(2)).unwrap(), vec![TrackId(2)]);
    }
}
