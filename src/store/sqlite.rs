//! SQLite-backed job store.
//!
//! One connection guarded by a mutex; every call runs on tokio's blocking
//! pool. Each save is an upsert inside its own transaction. Transcript
//! pieces live in their own table, one row per appended piece.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::job::Job;
use crate::dispatch::output::{ChannelCursor, OutputGap};
use crate::dispatch::run::NodeRun;
use crate::error::{DispatchError, Result};
use crate::store::{JobStore, OutputPiece};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS dispatch_jobs (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        node_names TEXT NOT NULL,
        quorum_spec TEXT NOT NULL,
        quorum INTEGER NOT NULL,
        timeout_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_created
    ON dispatch_jobs (created_at);
    CREATE TABLE IF NOT EXISTS dispatch_node_runs (
        job_id TEXT NOT NULL,
        node_name TEXT NOT NULL,
        status TEXT NOT NULL,
        ack_time TEXT,
        end_time TEXT,
        exit_status INTEGER,
        error TEXT,
        cursors TEXT NOT NULL,
        gaps TEXT NOT NULL,
        PRIMARY KEY (job_id, node_name)
    );
    CREATE TABLE IF NOT EXISTS dispatch_run_output (
        job_id TEXT NOT NULL,
        node_name TEXT NOT NULL,
        channel TEXT NOT NULL,
        byte_offset INTEGER NOT NULL,
        bytes BLOB NOT NULL,
        PRIMARY KEY (job_id, node_name, channel, byte_offset)
    );
";

#[derive(Serialize, Deserialize)]
struct Cursors {
    stdout: ChannelCursor,
    stderr: ChannelCursor,
}

struct JobRow {
    id: String,
    command: String,
    node_names: String,
    quorum_spec: String,
    quorum: i64,
    timeout_ms: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

struct RunRow {
    job_id: String,
    node_name: String,
    status: String,
    ack_time: Option<String>,
    end_time: Option<String>,
    exit_status: Option<i32>,
    error: Option<String>,
    cursors: String,
    gaps: String,
}

struct PieceRow {
    node_name: String,
    channel: String,
    byte_offset: i64,
    bytes: Vec<u8>,
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DispatchError::storage("parse timestamp", e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DispatchError::storage("parse job id", e))
}

fn json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DispatchError::storage("encode column", e))
}

fn from_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| DispatchError::storage("decode column", e))
}

impl JobRow {
    fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.to_string(),
            command: job.command.clone(),
            node_names: json(&job.node_names)?,
            quorum_spec: job.quorum_spec.to_string(),
            quorum: job.quorum as i64,
            timeout_ms: job.timeout.as_millis() as i64,
            status: job.status.to_string(),
            created_at: timestamp(&job.created_at),
            updated_at: timestamp(&job.updated_at),
        })
    }

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command: row.get(1)?,
            node_names: row.get(2)?,
            quorum_spec: row.get(3)?,
            quorum: row.get(4)?,
            timeout_ms: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            command: self.command,
            node_names: from_json(&self.node_names)?,
            quorum_spec: self.quorum_spec.parse()?,
            quorum: self.quorum as usize,
            timeout: Duration::from_millis(self.timeout_ms as u64),
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl RunRow {
    fn from_run(run: &NodeRun) -> Result<Self> {
        Ok(Self {
            job_id: run.job_id.to_string(),
            node_name: run.node_name.clone(),
            status: run.status.to_string(),
            ack_time: run.ack_time.as_ref().map(timestamp),
            end_time: run.end_time.as_ref().map(timestamp),
            exit_status: run.exit_status,
            error: run.error.clone(),
            cursors: json(&Cursors {
                stdout: run.stdout_cursor,
                stderr: run.stderr_cursor,
            })?,
            gaps: json(&run.gaps)?,
        })
    }

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            node_name: row.get(1)?,
            status: row.get(2)?,
            ack_time: row.get(3)?,
            end_time: row.get(4)?,
            exit_status: row.get(5)?,
            error: row.get(6)?,
            cursors: row.get(7)?,
            gaps: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<NodeRun> {
        let cursors: Cursors = from_json(&self.cursors)?;
        let gaps: Vec<OutputGap> = from_json(&self.gaps)?;
        Ok(NodeRun {
            job_id: parse_uuid(&self.job_id)?,
            node_name: self.node_name,
            status: self.status.parse()?,
            ack_time: self.ack_time.as_deref().map(parse_timestamp).transpose()?,
            end_time: self.end_time.as_deref().map(parse_timestamp).transpose()?,
            exit_status: self.exit_status,
            output: Vec::new(),
            error_output: Vec::new(),
            error: self.error,
            stdout_cursor: cursors.stdout,
            stderr_cursor: cursors.stderr,
            gaps,
        })
    }
}

impl PieceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_name: row.get(0)?,
            channel: row.get(1)?,
            byte_offset: row.get(2)?,
            bytes: row.get(3)?,
        })
    }

    fn into_piece(self) -> Result<OutputPiece> {
        Ok(OutputPiece {
            channel: self.channel.parse()?,
            offset: self.byte_offset as u64,
            bytes: self.bytes,
        })
    }
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DispatchError::storage("create parent dir", e))?;
        }
        let conn = Connection::open(path).map_err(|e| DispatchError::storage("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| DispatchError::storage("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| DispatchError::storage("set synchronous", e))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DispatchError::storage("open sqlite db", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| DispatchError::storage("ensure schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| DispatchError::storage(what, "connection mutex poisoned"))?;
            f(&mut guard).map_err(|e| DispatchError::storage(what, e))
        })
        .await
        .map_err(|e| DispatchError::storage(what, e))?
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let row = JobRow::from_job(job)?;
        self.call("save job", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO dispatch_jobs
                    (id, command, node_names, quorum_spec, quorum, timeout_ms, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![
                    row.id,
                    row.command,
                    row.node_names,
                    row.quorum_spec,
                    row.quorum,
                    row.timeout_ms,
                    row.status,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            tx.commit()
        })
        .await
    }

    async fn save_node_run(&self, run: &NodeRun, appended: &[OutputPiece]) -> Result<()> {
        let row = RunRow::from_run(run)?;
        let pieces: Vec<(String, i64, Vec<u8>)> = appended
            .iter()
            .map(|p| (p.channel.to_string(), p.offset as i64, p.bytes.clone()))
            .collect();
        self.call("save node run", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO dispatch_node_runs
                    (job_id, node_name, status, ack_time, end_time, exit_status,
                     error, cursors, gaps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(job_id, node_name) DO UPDATE SET
                    status = excluded.status,
                    ack_time = excluded.ack_time,
                    end_time = excluded.end_time,
                    exit_status = excluded.exit_status,
                    error = excluded.error,
                    cursors = excluded.cursors,
                    gaps = excluded.gaps",
                params![
                    row.job_id,
                    row.node_name,
                    row.status,
                    row.ack_time,
                    row.end_time,
                    row.exit_status,
                    row.error,
                    row.cursors,
                    row.gaps
                ],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT OR IGNORE INTO dispatch_run_output
                        (job_id, node_name, channel, byte_offset, bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (channel, offset, bytes) in &pieces {
                    insert.execute(params![row.job_id, row.node_name, channel, offset, bytes])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        let id = id.to_string();
        let row = self
            .call("load job", move |conn| {
                conn.query_row(
                    "SELECT id, command, node_names, quorum_spec, quorum, timeout_ms, status,
                            created_at, updated_at
                     FROM dispatch_jobs WHERE id = ?1",
                    params![id],
                    JobRow::read,
                )
                .optional()
            })
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn load_node_runs(&self, job_id: Uuid) -> Result<Vec<NodeRun>> {
        let job_id = job_id.to_string();
        let (rows, piece_rows) = self
            .call("load node runs", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_id, node_name, status, ack_time, end_time, exit_status,
                            error, cursors, gaps
                     FROM dispatch_node_runs WHERE job_id = ?1 ORDER BY node_name",
                )?;
                let rows = stmt
                    .query_map(params![job_id], RunRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let mut stmt = conn.prepare(
                    "SELECT node_name, channel, byte_offset, bytes
                     FROM dispatch_run_output WHERE job_id = ?1
                     ORDER BY node_name, channel, byte_offset",
                )?;
                let pieces = stmt
                    .query_map(params![job_id], PieceRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((rows, pieces))
            })
            .await?;

        let mut runs: Vec<NodeRun> = rows
            .into_iter()
            .map(RunRow::into_run)
            .collect::<Result<_>>()?;
        for piece_row in piece_rows {
            let Some(run) = runs.iter_mut().find(|r| r.node_name == piece_row.node_name) else {
                continue;
            };
            piece_row.into_piece()?.restore_into(run);
        }
        Ok(runs)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = self
            .call("list jobs", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, command, node_names, quorum_spec, quorum, timeout_ms, status,
                            created_at, updated_at
                     FROM dispatch_jobs ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], JobRow::read)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }
}
