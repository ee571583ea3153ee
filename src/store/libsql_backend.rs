//! libSQL backend — durable `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Conditional updates are a
//! single `UPDATE ... WHERE <preconditions> RETURNING` statement, so the
//! precondition check and the write are one atomic step.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{Job, JobFilter, JobStatus, JobUpdate};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Job database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const JOB_COLUMNS: &str = "seq, id, job_type, status, priority, payload, result, error_message, \
    retry_count, max_retries, owner, timeout_ms, cancel_requested, lease_id, run_after, \
    created_at, started_at, leased_at, completed_at, updated_at";

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<String>) -> Value {
    match s {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    opt_text(dt.map(fmt_ts))
}

fn json_text(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row (in `JOB_COLUMNS` order) to a Job.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(1).map_err(parse)?;
    let status_str: String = row.get(3).map_err(parse)?;
    let payload_str: String = row.get(5).map_err(parse)?;
    let result_str: Option<String> = row.get::<String>(6).ok();
    let lease_str: Option<String> = row.get::<String>(13).ok();
    let created_str: String = row.get(15).map_err(parse)?;
    let updated_str: String = row.get(19).map_err(parse)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("payload of {id}: {e}")))?;
    let result = result_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("result of {id}: {e}")))?;

    Ok(Job {
        id,
        seq: row.get(0).map_err(parse)?,
        job_type: row.get(2).map_err(parse)?,
        status,
        priority: row.get::<i64>(4).map_err(parse)? as i32,
        payload,
        result,
        error_message: row.get::<String>(7).ok(),
        retry_count: row.get::<i64>(8).map_err(parse)? as u32,
        max_retries: row.get::<i64>(9).map_err(parse)? as u32,
        owner: row.get::<String>(10).ok(),
        timeout_ms: row.get::<i64>(11).ok().map(|ms| ms as u64),
        cancel_requested: row.get::<i64>(12).map_err(parse)? != 0,
        lease_id: lease_str.and_then(|s| Uuid::parse_str(&s).ok()),
        run_after: parse_optional_datetime(row.get::<String>(14).ok()),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(row.get::<String>(16).ok()),
        leased_at: parse_optional_datetime(row.get::<String>(17).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(18).ok()),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Positional parameter list that hands out `?N` placeholders.
#[derive(Default)]
struct Binds {
    values: Vec<Value>,
}

impl Binds {
    fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn into_params(self) -> Params {
        Params::Positional(self.values)
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn insert(&self, job: &Job) -> Result<Job, DatabaseError> {
        let mut binds = Binds::default();
        let placeholders = [
            binds.push(Value::Text(job.id.to_string())),
            binds.push(Value::Text(job.job_type.clone())),
            binds.push(Value::Text(job.status.as_str().to_string())),
            binds.push(Value::Integer(job.priority as i64)),
            binds.push(Value::Text(json_text(&job.payload)?)),
            binds.push(Value::Integer(job.retry_count as i64)),
            binds.push(Value::Integer(job.max_retries as i64)),
            binds.push(opt_text(job.owner.clone())),
            binds.push(match job.timeout_ms {
                Some(ms) => Value::Integer(ms as i64),
                None => Value::Null,
            }),
            binds.push(opt_ts(job.run_after)),
            binds.push(Value::Text(fmt_ts(job.created_at))),
            binds.push(Value::Text(fmt_ts(job.updated_at))),
        ];

        let sql = format!(
            "INSERT INTO jobs (id, job_type, status, priority, payload, retry_count, max_retries, \
             owner, timeout_ms, run_after, created_at, updated_at) VALUES ({}) RETURNING seq",
            placeholders.join(", ")
        );

        let mut rows = self
            .conn()
            .query(&sql, binds.into_params())
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("job {} already exists", job.id))
                } else {
                    DatabaseError::Query(format!("insert_job: {msg}"))
                }
            })?;

        let seq: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("insert_job seq: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("insert_job: no seq returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("insert_job: {e}"))),
        };

        debug!(job_id = %job.id, seq, job_type = %job.job_type, "Job inserted into DB");
        let mut stored = job.clone();
        stored.seq = seq;
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Job, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_job(&row),
            Ok(None) => Err(DatabaseError::job_not_found(id)),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn update(&self, id: Uuid, update: &JobUpdate) -> Result<Job, DatabaseError> {
        let mut binds = Binds::default();
        let mut sets = vec![format!(
            "updated_at = {}",
            binds.push(Value::Text(fmt_ts(Utc::now())))
        )];

        if let Some(status) = update.status {
            let p = binds.push(Value::Text(status.as_str().to_string()));
            sets.push(format!("status = {p}"));
        }
        if let Some(result) = &update.result {
            let p = binds.push(Value::Text(json_text(result)?));
            sets.push(format!("result = {p}"));
        }
        if let Some(message) = &update.error_message {
            let p = binds.push(Value::Text(message.clone()));
            sets.push(format!("error_message = {p}"));
        }
        if let Some(count) = update.retry_count {
            let p = binds.push(Value::Integer(count as i64));
            sets.push(format!("retry_count = {p}"));
        }
        if let Some(at) = update.started_at {
            let p = binds.push(Value::Text(fmt_ts(at)));
            sets.push(format!("started_at = COALESCE(started_at, {p})"));
        }
        if let Some(at) = update.leased_at {
            let p = binds.push(Value::Text(fmt_ts(at)));
            sets.push(format!("leased_at = {p}"));
        }
        if let Some(at) = update.completed_at {
            let p = binds.push(Value::Text(fmt_ts(at)));
            sets.push(format!("completed_at = {p}"));
        }
        if let Some(run_after) = update.run_after {
            let p = binds.push(opt_ts(run_after));
            sets.push(format!("run_after = {p}"));
        }
        if let Some(lease) = update.lease_id {
            let p = binds.push(opt_text(lease.map(|l| l.to_string())));
            sets.push(format!("lease_id = {p}"));
        }
        if let Some(flag) = update.cancel_requested {
            let p = binds.push(Value::Integer(flag as i64));
            sets.push(format!("cancel_requested = {p}"));
        }

        let mut conditions = vec![format!("id = {}", binds.push(Value::Text(id.to_string())))];
        if !update.expect_status.is_empty() {
            let statuses: Vec<String> = update
                .expect_status
                .iter()
                .map(|s| binds.push(Value::Text(s.as_str().to_string())))
                .collect();
            conditions.push(format!("status IN ({})", statuses.join(", ")));
        }
        if let Some(lease) = update.expect_lease {
            let p = binds.push(Value::Text(lease.to_string()));
            conditions.push(format!("lease_id = {p}"));
        }

        let sql = format!(
            "UPDATE jobs SET {} WHERE {} RETURNING {JOB_COLUMNS}",
            sets.join(", "),
            conditions.join(" AND ")
        );

        let mut rows = self
            .conn()
            .query(&sql, binds.into_params())
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_job(&row),
            Ok(None) => {
                // Either the job is gone or a precondition failed.
                let current = self.get(id).await?;
                let reason = update
                    .check(&current)
                    .err()
                    .unwrap_or_else(|| "concurrent update".to_string());
                Err(DatabaseError::Conflict { id, reason })
            }
            Err(e) => Err(DatabaseError::Query(format!("update_job: {e}"))),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let mut binds = Binds::default();
        let mut conditions = Vec::new();

        if let Some(owner) = &filter.owner {
            conditions.push(format!("owner = {}", binds.push(Value::Text(owner.clone()))));
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<String> = filter
                .statuses
                .iter()
                .map(|s| binds.push(Value::Text(s.as_str().to_string())))
                .collect();
            conditions.push(format!("status IN ({})", statuses.join(", ")));
        }
        if let Some(job_type) = &filter.job_type {
            conditions.push(format!(
                "job_type = {}",
                binds.push(Value::Text(job_type.clone()))
            ));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", binds.push(Value::Integer(limit as i64))));
        }

        let mut rows = self
            .conn()
            .query(&sql, binds.into_params())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_jobs: {e}"))),
            }
        }
        Ok(jobs)
    }
}
