use super::{recover_job, ClaimedJob, JobStore, StoreError, StoreResult, LEASE_GRACE_SECS};
use crate::bus::ProgressEvent;
use crate::clock::SharedClock;
use crate::job::{Job, JobState};
use crate::registry::ResourceClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite-backed job store. The job record is persisted as one JSON
/// document plus a handful of derived columns the claim query filters on;
/// the document is the source of truth.
pub struct SqliteJobStore {
    pool: SqlitePool,
    clock: SharedClock,
}

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        state            TEXT NOT NULL,
        resource_class   TEXT,
        ready_at         INTEGER,
        lease_expires_at INTEGER,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        updated_at       INTEGER NOT NULL,
        document         TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim
        ON jobs (state, resource_class, ready_at, updated_at)",
    "CREATE TABLE IF NOT EXISTS job_events (
        seq      INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id   TEXT NOT NULL,
        document TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, seq)",
];

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn encode(job: &Job) -> StoreResult<String> {
    serde_json::to_string(job).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(document: &str) -> StoreResult<Job> {
    serde_json::from_str(document).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Derived claim-filter columns, recomputed on every write.
fn index_columns(job: &Job) -> (String, Option<String>, Option<i64>, Option<i64>, i64) {
    let next_ready = job.next_ready();
    (
        job.state.as_str().to_string(),
        next_ready.map(|s| s.resource_class.as_str().to_string()),
        next_ready.map(|s| s.ready_at.map(micros).unwrap_or(0)),
        job.lease.as_ref().map(|l| micros(l.expires_at)),
        job.cancel_requested as i64,
    )
}

impl SqliteJobStore {
    pub async fn connect(url: &str, clock: SharedClock) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        Self::with_pool(pool, clock).await
    }

    /// Single-connection in-memory database, for tests and dry runs.
    pub async fn in_memory(clock: SharedClock) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, clock).await
    }

    async fn with_pool(pool: SqlitePool, clock: SharedClock) -> StoreResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, clock })
    }

    async fn write_job<'e, E>(executor: E, job: &Job, expected: Option<i64>) -> StoreResult<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let (state, class, ready_at, lease, cancel) = index_columns(job);
        let document = encode(job)?;
        let mut sql = String::from(
            "UPDATE jobs SET state = ?, resource_class = ?, ready_at = ?, \
             lease_expires_at = ?, cancel_requested = ?, updated_at = ?, document = ? \
             WHERE id = ?",
        );
        if expected.is_some() {
            sql.push_str(" AND updated_at = ?");
        }
        let mut query = sqlx::query(&sql)
            .bind(state)
            .bind(class)
            .bind(ready_at)
            .bind(lease)
            .bind(cancel)
            .bind(micros(job.updated_at))
            .bind(document)
            .bind(job.id.to_string());
        if let Some(expected) = expected {
            query = query.bind(expected);
        }
        let result = query.execute(executor).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        let (state, class, ready_at, lease, cancel) = index_columns(job);
        let document = encode(job)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs \
             (id, state, resource_class, ready_at, lease_expires_at, cancel_requested, updated_at, document) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(state)
        .bind(class)
        .bind(ready_at)
        .bind(lease)
        .bind(cancel)
        .bind(micros(job.updated_at))
        .bind(document)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Serialization(format!(
                "job {} already exists",
                job.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Job> {
        let row = sqlx::query("SELECT document FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decode(row.try_get::<String, _>("document")?.as_str()),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn list(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT document FROM jobs WHERE state = ? ORDER BY updated_at")
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT document FROM jobs ORDER BY updated_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| decode(row.try_get::<String, _>("document")?.as_str()))
            .collect()
    }

    async fn claim_ready(
        &self,
        owner: &str,
        limit: usize,
        resource_filter: Option<ResourceClass>,
    ) -> StoreResult<Vec<ClaimedJob>> {
        let now = self.clock.now();
        let now_us = micros(now);
        let class = resource_filter.map(|c| c.as_str().to_string());

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT document, updated_at FROM jobs \
             WHERE state IN ('queued', 'running') \
               AND cancel_requested = 0 \
               AND (lease_expires_at IS NULL OR lease_expires_at <= ?) \
               AND ready_at IS NOT NULL AND ready_at <= ? \
               AND (? IS NULL OR resource_class = ?) \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(now_us)
        .bind(now_us)
        .bind(class.clone())
        .bind(class)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::new();
        for row in rows {
            let expected: i64 = row.try_get("updated_at")?;
            let mut job = decode(row.try_get::<String, _>("document")?.as_str())?;
            let Some(info) = job.claim_next(owner, now, LEASE_GRACE_SECS) else {
                continue;
            };
            let affected = Self::write_job(&mut *tx, &job, Some(expected)).await?;
            if affected == 1 {
                claimed.push(ClaimedJob { job, info });
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn update(&self, job: &Job, expected_updated_at: DateTime<Utc>) -> StoreResult<()> {
        let affected =
            Self::write_job(&self.pool, job, Some(micros(expected_updated_at))).await?;
        if affected == 1 {
            return Ok(());
        }
        // Disambiguate a lost race from a missing row.
        let exists = sqlx::query("SELECT 1 AS one FROM jobs WHERE id = ?")
            .bind(job.id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::Conflict),
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT document FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        let mut job = decode(row.try_get::<String, _>("document")?.as_str())?;
        match &mut job.lease {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = until;
            }
            _ => return Err(StoreError::Conflict),
        }
        let expected = micros(job.updated_at);
        job.touch(now);
        Self::write_job(&mut *tx, &job, Some(expected)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn recover_expired(&self) -> StoreResult<Vec<Job>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT document, updated_at FROM jobs \
             WHERE state = 'running' \
               AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?",
        )
        .bind(micros(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = Vec::new();
        for row in rows {
            let expected: i64 = row.try_get("updated_at")?;
            let mut job = decode(row.try_get::<String, _>("document")?.as_str())?;
            if recover_job(&mut job, now) {
                let affected = Self::write_job(&mut *tx, &job, Some(expected)).await?;
                if affected == 1 {
                    recovered.push(job);
                }
            }
        }
        tx.commit().await?;
        Ok(recovered)
    }

    async fn append_event(&self, event: &ProgressEvent) -> StoreResult<()> {
        let document =
            serde_json::to_string(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO job_events (job_id, document) VALUES (?, ?)")
            .bind(event.job_id.to_string())
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn events(&self, job_id: Uuid) -> StoreResult<Vec<ProgressEvent>> {
        let rows =
            sqlx::query("SELECT document FROM job_events WHERE job_id = ? ORDER BY seq ASC")
                .bind(job_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                serde_json::from_str(row.try_get::<String, _>("document")?.as_str())
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}
