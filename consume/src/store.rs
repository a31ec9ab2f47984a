/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Session-scoped persistence of hits and log lines in SQLite.
//!
//! Every write goes to the live session, the one created by the most recent
//! [`Store::start_new_session`]. Reads name their session explicitly, so historical sessions
//! can be browsed while the live one keeps recording.

use std::path::Path;

use chrono::{DateTime, Local, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vigil::{Config, Hit, LogLine};

pub const DEFAULT_HIT_LIMIT: usize = 100;
pub const DEFAULT_LOG_LIMIT: usize = 1000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        start_time TEXT NOT NULL,
        name TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS hits (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        endpoint TEXT NOT NULL,
        method TEXT NOT NULL,
        status_code INTEGER,
        duration_ms REAL,
        timestamp TEXT NOT NULL,
        data TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_hits_session ON hits(session_id, timestamp);
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id, timestamp);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored hit is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored timestamp {0:?}")]
    Timestamp(String),
    #[error("session {0} is live and cannot be deleted")]
    LiveSession(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub name: String,
}

fn to_db_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

/// A handle on the event database, or a disabled stand-in that accepts every call and
/// stores nothing.
pub struct Store {
    conn: Option<Connection>,
    current_session: Option<String>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=2000; PRAGMA foreign_keys=ON;",
        )?;
        Self::migrate(&conn)?;
        debug!("Opened event store at {}", path.display());

        Ok(Store {
            conn: Some(conn),
            current_session: None,
        })
    }

    pub fn disabled() -> Self {
        Store {
            conn: None,
            current_session: None,
        }
    }

    /// Opens `db_path` when persistence is enabled. A database that cannot be opened is
    /// reported and replaced by a disabled store.
    pub fn from_config(config: &Config) -> Self {
        if !config.enable_persistence {
            return Store::disabled();
        }
        match Store::open(&config.db_path) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    "Persistence disabled, could not open {}: {e}",
                    config.db_path.display()
                );
                Store::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Creates missing tables. Tables from an incompatible layout, detected by probing for
    /// the session column, are dropped along with their rows first.
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let mut drifted = false;
        for table in ["hits", "logs"] {
            if Self::table_exists(conn, table)?
                && conn
                    .prepare(&format!("SELECT session_id FROM {table} LIMIT 1"))
                    .is_err()
            {
                drifted = true;
            }
        }

        if drifted {
            warn!("Event store schema is outdated, dropping stored hits and logs");
            conn.execute_batch("DROP TABLE IF EXISTS logs; DROP TABLE IF EXISTS hits;")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Creates a session and makes it the target of every following write.
    pub fn start_new_session(&mut self) -> Result<Option<Session>, StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(None);
        };

        let started = Local::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            start_time: started.with_timezone(&Utc),
            name: started.format("Session %Y-%m-%d %H:%M").to_string(),
        };
        conn.execute(
            "INSERT INTO sessions (id, start_time, name) VALUES (?1, ?2, ?3)",
            params![session.id, to_db_time(&session.start_time), session.name],
        )?;

        info!("Recording into {} ({})", session.name, session.id);
        self.current_session = Some(session.id.clone());
        Ok(Some(session))
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session.as_deref()
    }

    /// Inserts or replaces the hit under the live session.
    pub fn save_hit(&self, hit: &Hit) -> Result<(), StoreError> {
        let (Some(conn), Some(session)) = (&self.conn, &self.current_session) else {
            return Ok(());
        };
        let data = serde_json::to_string(hit)?;
        conn.execute(
            "INSERT OR REPLACE INTO hits
                (id, session_id, endpoint, method, status_code, duration_ms, timestamp, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                hit.id,
                session,
                hit.endpoint,
                hit.method,
                hit.status_code,
                hit.duration_ms,
                to_db_time(&hit.timestamp),
                data
            ],
        )?;
        Ok(())
    }

    pub fn save_log(&self, level: &str, message: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let (Some(conn), Some(session)) = (&self.conn, &self.current_session) else {
            return Ok(());
        };
        conn.execute(
            "INSERT INTO logs (session_id, level, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![session, level, message, to_db_time(&timestamp)],
        )?;
        Ok(())
    }

    /// Hits of `session_id`, newest first.
    pub fn get_recent_hits(&self, session_id: &str, limit: usize) -> Result<Vec<Hit>, StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT data FROM hits WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| row.get::<_, String>(0))?;

        let mut hits = Vec::new();
        for data in rows {
            hits.push(serde_json::from_str(&data?)?);
        }
        Ok(hits)
    }

    /// Log lines of `session_id`, oldest first.
    pub fn get_recent_logs(&self, session_id: &str, limit: usize) -> Result<Vec<LogLine>, StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT level, message, timestamp FROM logs
             WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut logs = Vec::new();
        for row in rows {
            let (level, message, timestamp) = row?;
            let mut line = LogLine::new(level, message);
            line.timestamp = from_db_time(&timestamp)?;
            logs.push(line);
        }
        Ok(logs)
    }

    /// Every recorded session, newest first.
    pub fn get_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare("SELECT id, start_time, name FROM sessions ORDER BY start_time DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, start_time, name) = row?;
            sessions.push(Session {
                id,
                start_time: from_db_time(&start_time)?,
                name,
            });
        }
        Ok(sessions)
    }

    /// Deletes a finished session with all of its hits and logs. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let Some(conn) = &self.conn else {
            return Ok(false);
        };
        if self.current_session.as_deref() == Some(session_id) {
            return Err(StoreError::LiveSession(session_id.to_string()));
        }
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn hit(id: &str, endpoint: &str, at: DateTime<Utc>) -> Hit {
        Hit {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            timestamp: at,
            client: "127.0.0.1".to_string(),
            request_params: None,
            request_body: None,
            request_headers: Some(BTreeMap::new()),
            response_body: None,
            status_code: None,
            duration_ms: None,
            runtime_logs: vec![],
            exceptions: vec![],
            pending: true,
        }
    }

    fn open(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("events.db")).unwrap()
    }

    #[test]
    fn disabled_store_accepts_everything() {
        let mut store = Store::disabled();
        assert!(store.start_new_session().unwrap().is_none());
        store.save_hit(&hit("a", "/a", Utc::now())).unwrap();
        store.save_log("INFO", "x", Utc::now()).unwrap();
        assert!(store.get_recent_hits("any", 10).unwrap().is_empty());
        assert!(store.get_sessions().unwrap().is_empty());
        assert!(!store.delete_session("any").unwrap());
    }

    #[test]
    fn nothing_is_written_before_a_session_starts() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.save_hit(&hit("a", "/a", Utc::now())).unwrap();
        assert!(store.get_sessions().unwrap().is_empty());
    }

    #[test]
    fn saving_twice_replaces_the_row() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let session = store.start_new_session().unwrap().unwrap();

        let mut h = hit("a", "/a", Utc::now());
        store.save_hit(&h).unwrap();
        h.pending = false;
        h.status_code = Some(201);
        h.duration_ms = Some(3.5);
        store.save_hit(&h).unwrap();

        let hits = store.get_recent_hits(&session.id, DEFAULT_HIT_LIMIT).unwrap();
        assert_eq!(hits, vec![h]);
    }

    #[test]
    fn hits_newest_first_logs_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let session = store.start_new_session().unwrap().unwrap();
        let t0 = Utc::now();

        for i in 0..5 {
            store
                .save_hit(&hit(&format!("h{i}"), "/a", t0 + chrono::Duration::seconds(i)))
                .unwrap();
            store
                .save_log("INFO", &format!("line {i}"), t0 + chrono::Duration::seconds(i))
                .unwrap();
        }

        let hits = store.get_recent_hits(&session.id, 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["h4", "h3", "h2"]);

        let logs = store.get_recent_logs(&session.id, DEFAULT_LOG_LIMIT).unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["line 0", "line 1", "line 2", "line 3", "line 4"]);
    }

    #[test]
    fn session_names_follow_start_time() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let session = store.start_new_session().unwrap().unwrap();
        assert!(session.name.starts_with("Session "));
        assert_eq!(session.name.len(), "Session 2024-01-01 00:00".len());
        assert_eq!(store.current_session_id(), Some(session.id.as_str()));
    }

    #[test]
    fn live_session_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir);
        let live = store.start_new_session().unwrap().unwrap();
        assert!(matches!(
            store.delete_session(&live.id),
            Err(StoreError::LiveSession(_))
        ));
    }
}
