//! SQLite session record store.
//!
//! One row per session, inserted when the session opens and mutated at most
//! twice afterwards (module correction, close-time duration). Rows are never
//! deleted; the history endpoint reads the most recent slice.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Field set captured when a session record is first inserted.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub my: &'a str,
    pub ur: &'a str,
    pub rpt1: &'a str,
    pub rpt2: &'a str,
    pub module: &'a str,
    pub protocol: &'a str,
    pub created_at: DateTime<Utc>,
}

/// A persisted session row, as served by the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub my: String,
    pub ur: String,
    pub rpt1: String,
    pub rpt2: String,
    pub module: String,
    pub protocol: String,
    pub duration: f64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories
    /// as needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// Insert a new session record and return its assigned id.
    pub fn create_session(&self, s: &NewSession<'_>) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO sessions (created_at, my, ur, rpt1, rpt2, module, protocol)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![s.created_at, s.my, s.ur, s.rpt1, s.rpt2, s.module, s.protocol],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_duration(&self, id: i64, duration: f64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET duration = ?1 WHERE id = ?2",
            rusqlite::params![duration, id],
        )?;
        Ok(())
    }

    pub fn set_module(&self, id: i64, module: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET module = ?1 WHERE id = ?2",
            rusqlite::params![module, id],
        )?;
        Ok(())
    }

    /// Most recent records, id descending.
    pub fn recent_sessions(&self, limit: u32) -> StoreResult<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, my, ur, rpt1, rpt2, module, protocol, duration
             FROM sessions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |r| {
            Ok(SessionRecord {
                id: r.get(0)?,
                created_at: r.get(1)?,
                my: r.get(2)?,
                ur: r.get(3)?,
                rpt1: r.get(4)?,
                rpt2: r.get(5)?,
                module: r.get(6)?,
                protocol: r.get(7)?,
                duration: r.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(my: &'static str, module: &'static str) -> NewSession<'static> {
        NewSession {
            my,
            ur: "CQCQCQ",
            rpt1: "",
            rpt2: "URFD A",
            module,
            protocol: "DMR",
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn create_assigns_monotonic_ids_and_round_trips_fields() {
        let store = Store::open_in_memory().expect("open");
        let first = store.create_session(&sample("W8FU", "A")).expect("insert");
        let second = store.create_session(&sample("KF8S", "B")).expect("insert");
        assert!(second > first);

        let records = store.recent_sessions(10).expect("query");
        assert_eq!(records.len(), 2);
        // id descending
        assert_eq!(records[0].id, second);
        assert_eq!(records[0].my, "KF8S");
        assert_eq!(records[1].my, "W8FU");
        assert_eq!(records[1].ur, "CQCQCQ");
        assert_eq!(records[1].duration, 0.0);
        assert_eq!(
            records[1].created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn duration_and_module_updates_target_one_row() {
        let store = Store::open_in_memory().expect("open");
        let a = store.create_session(&sample("W8FU", "A")).expect("insert");
        let b = store.create_session(&sample("K8PR", "A")).expect("insert");

        store.set_duration(a, 12.5).expect("duration");
        store.set_module(b, "B").expect("module");

        let records = store.recent_sessions(10).expect("query");
        let rec_a = records.iter().find(|r| r.id == a).unwrap();
        let rec_b = records.iter().find(|r| r.id == b).unwrap();
        assert_eq!(rec_a.duration, 12.5);
        assert_eq!(rec_a.module, "A");
        assert_eq!(rec_b.duration, 0.0);
        assert_eq!(rec_b.module, "B");
    }

    #[test]
    fn recent_sessions_honors_limit() {
        let store = Store::open_in_memory().expect("open");
        for _ in 0..5 {
            store.create_session(&sample("W8FU", "A")).expect("insert");
        }
        let records = store.recent_sessions(3).expect("query");
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("dashboard.db");
        let store = Store::open(&path).expect("open");
        store.create_session(&sample("W8FU", "A")).expect("insert");
        assert!(path.exists());
    }
}
