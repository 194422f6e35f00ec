//! SQLite database for run state persistence

use crate::store::RunStore;
use crate::types::{Environment, Run, RunResult, RunStatus, TestCase};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // WAL lets the request layer read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Environments table
            CREATE TABLE IF NOT EXISTS environments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                base_url TEXT NOT NULL DEFAULT '',
                config TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_environments_project ON environments(project_id);

            -- Test cases table
            CREATE TABLE IF NOT EXISTS test_cases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                test_data TEXT NOT NULL DEFAULT 'null',
                created_by INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_cases_project ON test_cases(project_id);

            -- Runs table
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL,
                environment_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                start_time INTEGER,
                end_time INTEGER,
                result TEXT,
                report_path TEXT,
                created_by INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id);

            -- Stop requests queued by the request layer for the daemon
            CREATE TABLE IF NOT EXISTS stop_requests (
                run_id INTEGER PRIMARY KEY,
                requested_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Seeding (request layer)
    // ========================================================================

    /// Insert an environment and return its id
    pub fn insert_environment(
        &self,
        project_id: i64,
        name: &str,
        base_url: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO environments (project_id, name, base_url, config) VALUES (?1, ?2, ?3, ?4)",
            params![project_id, name, base_url, serde_json::to_string(config)?],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Inserted environment {} ({})", name, id);
        Ok(id)
    }

    /// Insert a test case and return its id
    pub fn insert_case(
        &self,
        project_id: i64,
        name: &str,
        kind: &str,
        test_data: &serde_json::Value,
        created_by: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO test_cases (project_id, name, kind, test_data, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                name,
                kind,
                serde_json::to_string(test_data)?,
                created_by
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Inserted test case {} ({})", name, id);
        Ok(id)
    }

    /// Create a pending run and return it
    pub fn create_run(&self, project_id: i64, environment_id: i64, created_by: i64) -> Result<Run> {
        let now = Utc::now();
        let id = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO runs (project_id, environment_id, status, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    environment_id,
                    RunStatus::Pending.as_str(),
                    created_by,
                    now.timestamp_millis()
                ],
            )?;
            conn.last_insert_rowid()
        };

        debug!("Created run {} for project {}", id, project_id);
        self.load_run(id)?
            .ok_or_else(|| Error::Internal(format!("run {} vanished after insert", id)))
    }

    /// List run ids with the given status, oldest first
    pub fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM runs WHERE status = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ========================================================================
    // Stop requests
    // ========================================================================

    /// Queue a stop request for a run
    pub fn request_stop(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO stop_requests (run_id, requested_at) VALUES (?1, ?2)",
            params![run_id, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Drain queued stop requests
    pub fn take_stop_requests(&self) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT run_id FROM stop_requests ORDER BY requested_at ASC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        tx.execute("DELETE FROM stop_requests", [])?;
        tx.commit()?;
        Ok(ids)
    }
}

impl RunStore for Database {
    fn load_run(&self, id: i64) -> Result<Option<Run>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, project_id, environment_id, status, start_time, end_time, result,
                        report_path, created_by, created_at
                 FROM runs WHERE id = ?1",
                params![id],
                RawRun::from_row,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    fn load_cases(&self, project_id: i64, ids: Option<&[i64]>) -> Result<Vec<TestCase>> {
        let conn = self.conn.lock();

        let mut sql = String::from(
            "SELECT id, project_id, name, kind, test_data, created_by FROM test_cases WHERE project_id = ?",
        );
        let mut bind: Vec<i64> = vec![project_id];
        if let Some(ids) = ids.filter(|ids| !ids.is_empty()) {
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND id IN ({})", placeholders));
            bind.extend_from_slice(ids);
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut cases = Vec::new();
        for row in rows {
            let (id, project_id, name, kind, test_data, created_by) = row?;
            cases.push(TestCase {
                id,
                project_id,
                name,
                kind,
                test_data: serde_json::from_str(&test_data)?,
                created_by,
            });
        }

        Ok(cases)
    }

    fn load_environment(&self, id: i64) -> Result<Option<Environment>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, project_id, name, base_url, config FROM environments WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, project_id, name, base_url, config)) => Ok(Some(Environment {
                id,
                project_id,
                name,
                base_url,
                config: serde_json::from_str(&config)?,
            })),
            None => Ok(None),
        }
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn.lock();
        let result = run.result.as_ref().map(serde_json::to_string).transpose()?;

        // One statement, so readers never see a half-written run
        let rows = conn.execute(
            "UPDATE runs SET status = ?1, start_time = ?2, end_time = ?3, result = ?4, report_path = ?5
             WHERE id = ?6",
            params![
                run.status.as_str(),
                run.start_time.map(|t| t.timestamp_millis()),
                run.end_time.map(|t| t.timestamp_millis()),
                result,
                run.report_path,
                run.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::not_found("run", run.id));
        }

        debug!("Saved run {} ({})", run.id, run.status);
        Ok(())
    }
}

/// Raw database row before parsing
struct RawRun {
    id: i64,
    project_id: i64,
    environment_id: i64,
    status: String,
    start_time: Option<i64>,
    end_time: Option<i64>,
    result: Option<String>,
    report_path: Option<String>,
    created_by: i64,
    created_at: i64,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRun {
            id: row.get(0)?,
            project_id: row.get(1)?,
            environment_id: row.get(2)?,
            status: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            result: row.get(6)?,
            report_path: row.get(7)?,
            created_by: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn parse(self) -> Result<Run> {
        let result: Option<RunResult> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Run {
            id: self.id,
            project_id: self.project_id,
            environment_id: self.environment_id,
            status: self.status.parse()?,
            start_time: self.start_time.map(millis_to_datetime).transpose()?,
            end_time: self.end_time.map(millis_to_datetime).transpose()?,
            result,
            report_path: self.report_path,
            created_by: self.created_by,
            created_at: millis_to_datetime(self.created_at)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Internal(format!("timestamp out of range: {}", millis)))
}
