//! SQLite store
//!
//! One database file can be opened by several processes at once. Jobs live in
//! the `jobs` table, the heartbeat in the single-row `leadership` table.
//! Timestamps are stored as Unix milliseconds, arguments as a JSON array.
//!
//! Writes made through this handle notify watchers immediately. Writes made by
//! other processes are picked up by a background poll that re-evaluates every
//! live watcher once per poll interval.
//!
//! Every statement runs on the blocking thread pool. Rows that no longer decode
//! are logged and left out of query results.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::watch::WatchRegistry;
use super::{
    FindOptions, JobQuery, JobStore, JobUpdate, JobView, LeaderStore, StoreError, StoreResult,
    Subscription,
};
use crate::models::{Job, JobId, JobState, LeadershipRecord, NewJob, LEADERSHIP_RECORD_ID};

/// Default interval between polls for foreign writes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const JOB_COLUMNS: &str = "id, name, arguments, state, due, priority, created";

struct Inner {
    conn: Mutex<Connection>,
    job_watchers: WatchRegistry<Job, JobView>,
    leader_watchers: WatchRegistry<LeadershipRecord, ()>,
    poll_interval: Duration,
    poller_started: AtomicBool,
}

/// SQLite-backed job and leadership store
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>, poll_interval: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.as_ref().display(), journal_mode = %mode, "Opened SQLite store");
        Self::from_connection(conn, poll_interval)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_POLL_INTERVAL)
    }

    fn from_connection(conn: Connection, poll_interval: Duration) -> StoreResult<Self> {
        create_schema(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                job_watchers: WatchRegistry::new(),
                leader_watchers: WatchRegistry::new(),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                poller_started: AtomicBool::new(false),
            }),
        })
    }

    /// Interval between polls for foreign writes
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    fn ensure_poller(&self) {
        if self.inner.poller_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || inner.refresh()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to poll SQLite store for changes");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SQLite poll task panicked");
                    }
                }
            }
            tracing::debug!("SQLite change poller stopped");
        });
    }

    /// Run `f` with the connection locked, on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Inner, &mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.lock()?;
            f(&inner, &mut conn)
        })
        .await
        .map_err(|e| StoreError::backend(format!("SQLite task failed: {e}")))?
    }
}

impl Inner {
    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::LockPoisoned("sqlite connection"))
    }

    fn notify_jobs(&self, conn: &Connection) {
        self.job_watchers.notify(|view| evaluate(conn, view).ok());
    }

    fn refresh(&self) -> StoreResult<()> {
        let jobs_idle = self.job_watchers.is_idle();
        let leader_idle = self.leader_watchers.is_idle();
        if jobs_idle && leader_idle {
            return Ok(());
        }

        let conn = self.lock()?;
        if !jobs_idle {
            self.notify_jobs(&conn);
        }
        if !leader_idle {
            self.leader_watchers
                .notify(|_| read_leader(&conn).ok().map(|r| r.into_iter().collect()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("poll_interval", &self.inner.poll_interval)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Schema and Row Mapping
// ============================================================================

fn create_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            arguments TEXT NOT NULL,
            state TEXT NOT NULL,
            due INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_name_due_state ON jobs(name, due, state)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS leadership (
            id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL,
            date INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn millis_to_datetime(column: &str, ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::corrupt(column, format!("{ms} is out of range")))
}

type JobRow = (String, String, String, String, i64, i64, i64);

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_job(row: JobRow) -> StoreResult<Job> {
    let (id, name, arguments, state, due, priority, created) = row;
    let state = JobState::from_id(&state)
        .ok_or_else(|| StoreError::corrupt("state", format!("unknown state '{state}'")))?;

    Ok(Job {
        id: JobId::from(id),
        name,
        arguments: serde_json::from_str(&arguments)?,
        state,
        due: millis_to_datetime("due", due)?,
        priority,
        created: millis_to_datetime("created", created)?,
    })
}

/// SQL filter over the indexed columns. Argument prefixes are checked in
/// Rust after the rows are loaded.
fn where_clause(query: &JobQuery) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(ref id) = query.id {
        clauses.push("id = ?".to_string());
        values.push(SqlValue::Text(id.as_str().to_string()));
    }
    if let Some(ref names) = query.names {
        clauses.push(in_list("name", names.len()));
        values.extend(names.iter().cloned().map(SqlValue::Text));
    }
    if let Some(ref states) = query.states {
        clauses.push(in_list("state", states.len()));
        values.extend(states.iter().map(|s| SqlValue::Text(s.id().to_string())));
    }
    if let Some(due_by) = query.due_by {
        clauses.push("due <= ?".to_string());
        values.push(SqlValue::Integer(due_by.timestamp_millis()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn in_list(column: &str, len: usize) -> String {
    if len == 0 {
        return "0".to_string();
    }
    format!("{column} IN ({})", vec!["?"; len].join(", "))
}

/// Column values that SQLite returned but that do not fit the row type
fn is_unreadable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

/// Every matching job in insertion order. Undecodable rows are skipped so
/// one bad record cannot hide the rest of the table.
fn select_matching(conn: &Connection, query: &JobQuery) -> StoreResult<Vec<Job>> {
    let (filter, values) = where_clause(query);
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs{filter} ORDER BY rowid");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), read_job_row)?;

    let mut jobs = Vec::new();
    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(e) if is_unreadable(&e) => {
                tracing::warn!(error = %e, "Skipping unreadable job row");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let id = row.0.clone();
        match decode_job(row) {
            Ok(job) if query.matches(&job) => jobs.push(job),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Skipping corrupt job row");
            }
        }
    }
    Ok(jobs)
}

fn evaluate(conn: &Connection, view: &JobView) -> StoreResult<Vec<Job>> {
    Ok(view.options.apply(select_matching(conn, &view.query)?))
}

fn read_leader(conn: &Connection) -> StoreResult<Option<LeadershipRecord>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT server_id, date FROM leadership WHERE id = ?1",
            params![LEADERSHIP_RECORD_ID],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(server_id, date)| {
        Ok(LeadershipRecord {
            server_id,
            date: millis_to_datetime("date", date)?,
        })
    })
    .transpose()
}

// ============================================================================
// Store Contracts
// ============================================================================

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: NewJob) -> StoreResult<JobId> {
        let id = JobId::generate();
        let arguments = serde_json::to_string(&job.arguments)?;

        let row_id = id.clone();
        self.with_conn(move |inner, conn| {
            conn.execute(
                "INSERT INTO jobs (id, name, arguments, state, due, priority, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row_id.as_str(),
                    job.name,
                    arguments,
                    job.state.id(),
                    job.due.timestamp_millis(),
                    job.priority,
                    job.created.timestamp_millis(),
                ],
            )?;
            inner.notify_jobs(conn);
            Ok(())
        })
        .await?;

        Ok(id)
    }

    async fn find_one(&self, query: &JobQuery) -> StoreResult<Option<Job>> {
        let query = query.clone();
        self.with_conn(move |_, conn| Ok(select_matching(conn, &query)?.into_iter().next()))
            .await
    }

    async fn find(&self, query: &JobQuery, options: &FindOptions) -> StoreResult<Vec<Job>> {
        let query = query.clone();
        let options = *options;
        self.with_conn(move |_, conn| Ok(options.apply(select_matching(conn, &query)?)))
            .await
    }

    async fn count(&self, query: &JobQuery) -> StoreResult<u64> {
        let query = query.clone();
        self.with_conn(move |_, conn| {
            if query.arguments.is_empty() {
                let (filter, values) = where_clause(&query);
                let sql = format!("SELECT COUNT(*) FROM jobs{filter}");
                let count: i64 =
                    conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
                return Ok(count as u64);
            }
            Ok(select_matching(conn, &query)?.len() as u64)
        })
        .await
    }

    async fn update(&self, query: &JobQuery, update: &JobUpdate) -> StoreResult<u64> {
        let query = query.clone();
        let update = update.clone();
        self.with_conn(move |inner, conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let matched = select_matching(&tx, &query)?;
            for mut job in matched.iter().cloned() {
                update.apply(&mut job);
                tx.execute(
                    "UPDATE jobs SET state = ?1, due = ?2, priority = ?3 WHERE id = ?4",
                    params![
                        job.state.id(),
                        job.due.timestamp_millis(),
                        job.priority,
                        job.id.as_str(),
                    ],
                )?;
            }
            tx.commit()?;

            if !matched.is_empty() {
                inner.notify_jobs(conn);
            }
            Ok(matched.len() as u64)
        })
        .await
    }

    async fn remove(&self, query: &JobQuery) -> StoreResult<u64> {
        let query = query.clone();
        self.with_conn(move |inner, conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let matched = select_matching(&tx, &query)?;
            for job in &matched {
                tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id.as_str()])?;
            }
            tx.commit()?;

            if !matched.is_empty() {
                inner.notify_jobs(conn);
            }
            Ok(matched.len() as u64)
        })
        .await
    }

    async fn watch(&self, query: JobQuery, options: FindOptions) -> StoreResult<Subscription<Job>> {
        let view = JobView { query, options };
        let subscription = self
            .with_conn(move |inner, conn| {
                let initial = evaluate(conn, &view)?;
                Ok(inner.job_watchers.register(view, initial, true))
            })
            .await?;
        self.ensure_poller();
        Ok(subscription)
    }
}

#[async_trait]
impl LeaderStore for SqliteStore {
    async fn read_leader(&self) -> StoreResult<Option<LeadershipRecord>> {
        self.with_conn(|_, conn| read_leader(conn)).await
    }

    async fn upsert_leader(&self, record: &LeadershipRecord) -> StoreResult<()> {
        let record = record.clone();
        self.with_conn(move |inner, conn| {
            conn.execute(
                "INSERT INTO leadership (id, server_id, date) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET server_id = excluded.server_id, date = excluded.date",
                params![
                    LEADERSHIP_RECORD_ID,
                    record.server_id,
                    record.date.timestamp_millis()
                ],
            )?;
            inner.leader_watchers.notify(|_| Some(vec![record.clone()]));
            Ok(())
        })
        .await
    }

    async fn purge_foreign_leaders(&self) -> StoreResult<u64> {
        let removed = self
            .with_conn(|_, conn| {
                Ok(conn.execute(
                    "DELETE FROM leadership WHERE id != ?1",
                    params![LEADERSHIP_RECORD_ID],
                )?)
            })
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Removed leadership records with unexpected ids");
        }
        Ok(removed as u64)
    }

    async fn watch_leader(&self) -> StoreResult<Subscription<LeadershipRecord>> {
        let subscription = self
            .with_conn(|inner, conn| {
                let current = read_leader(conn)?.into_iter().collect();
                Ok(inner.leader_watchers.register((), current, false))
            })
            .await?;
        self.ensure_poller();
        Ok(subscription)
    }
}
