use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use conductor_core::error::{ConductorError, Result};

/// Durable home for governance state, backed by SQLite.
///
/// Permissions, policies and rate counters live in a single versioned row.
/// Audit entries are appended one row each and trimmed to capacity.
pub struct GovernanceStore {
    conn: Mutex<Connection>,
}

impl GovernanceStore {
    /// Open or create the governance database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ConductorError::Database(format!("Failed to open governance store: {}", e)))?;
        Self::init(conn)
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ConductorError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS governance_state (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 generation INTEGER NOT NULL,
                 state_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS audit_log (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 entry_json TEXT NOT NULL,
                 recorded_at TEXT NOT NULL
             );",
        )
        .map_err(|e| {
            ConductorError::Database(format!("Failed to initialize governance schema: {}", e))
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ConductorError::Database(e.to_string()))
    }

    /// The last saved state row and its generation, if any.
    pub fn load(&self) -> Result<Option<(u64, String)>> {
        self.conn()?
            .query_row(
                "SELECT generation, state_json FROM governance_state WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
            )
            .optional()
            .map_err(|e| ConductorError::Database(format!("Failed to load state: {}", e)))
    }

    /// Replace the stored state unless a newer generation is already there.
    ///
    /// Returns whether the row was written.
    pub fn save(&self, generation: u64, state_json: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO governance_state (id, generation, state_json, updated_at)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET generation = excluded.generation,
                                               state_json = excluded.state_json,
                                               updated_at = excluded.updated_at
                 WHERE excluded.generation > governance_state.generation",
                params![generation as i64, state_json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| ConductorError::Database(format!("Failed to save state: {}", e)))?;
        Ok(changed > 0)
    }

    /// Append one audit entry, keeping only the newest `keep` rows.
    pub fn append_audit(&self, entry_json: &str, keep: usize) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (entry_json, recorded_at) VALUES (?1, ?2)",
            params![entry_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ConductorError::Database(format!("Failed to append audit entry: {}", e)))?;
        conn.execute(
            "DELETE FROM audit_log WHERE seq <= (SELECT MAX(seq) FROM audit_log) - ?1",
            params![keep as i64],
        )
        .map_err(|e| ConductorError::Database(format!("Failed to trim audit log: {}", e)))?;
        Ok(())
    }

    /// The newest `limit` audit rows, oldest first.
    pub fn load_audit(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT entry_json FROM (
                     SELECT seq, entry_json FROM audit_log ORDER BY seq DESC LIMIT ?1
                 ) ORDER BY seq ASC",
            )
            .map_err(|e| ConductorError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get(0))
            .map_err(|e| ConductorError::Database(format!("Failed to load audit log: {}", e)))?;
        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| ConductorError::Database(format!("Failed to load audit log: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_has_no_state() {
        let store = GovernanceStore::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.load_audit(10).unwrap().is_empty());
    }

    #[test]
    fn save_replaces_older_generation() {
        let store = GovernanceStore::in_memory().unwrap();
        assert!(store.save(1, r#"{"v":1}"#).unwrap());
        assert!(store.save(2, r#"{"v":2}"#).unwrap());
        assert_eq!(store.load().unwrap(), Some((2, r#"{"v":2}"#.to_string())));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let store = GovernanceStore::in_memory().unwrap();
        store.save(5, r#"{"v":5}"#).unwrap();
        assert!(!store.save(4, r#"{"v":4}"#).unwrap());
        assert_eq!(store.load().unwrap(), Some((5, r#"{"v":5}"#.to_string())));
    }

    #[test]
    fn audit_rows_are_trimmed_to_the_newest() {
        let store = GovernanceStore::in_memory().unwrap();
        for i in 0..5 {
            store.append_audit(&format!("{{\"n\":{}}}", i), 3).unwrap();
        }
        assert_eq!(
            store.load_audit(10).unwrap(),
            vec![r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#]
        );
        assert_eq!(store.load_audit(2).unwrap(), vec![r#"{"n":3}"#, r#"{"n":4}"#]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("governance.db");
        {
            let store = GovernanceStore::open(&path).unwrap();
            store.save(1, "{}").unwrap();
            store.append_audit("{}", 10).unwrap();
        }
        let store = GovernanceStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap(), Some((1, "{}".to_string())));
        assert_eq!(store.load_audit(10).unwrap().len(), 1);
    }
}
