//! Postgres-backed job record store.
//!
//! ## Conditional updates
//!
//! `update` runs in one transaction:
//! 1. `SELECT ... FOR UPDATE` locks the row
//! 2. the precondition is checked and the update applied through the domain model
//! 3. the mutable columns are written back
//!
//! Concurrent updates of the same job serialize on the row lock, so exactly one of two
//! racing `PENDING -> RUNNING` transitions sees `PENDING`.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | RecordStoreError |
//! |------------|-----------------|------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | any other | any | `Storage` |
//!
//! ## Sync bridge
//!
//! [`JobRecordStore`] is synchronous (workers are plain threads). The store keeps the
//! Tokio runtime handle it was created on and blocks on it; call it from worker
//! threads, never from inside an async task.

use std::str::FromStr;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use annotflow_core::{ArchiveHandle, JobId, JobRecord, JobStatus, Precondition, RecordUpdate, Tier, UserId};

use super::{JobRecordStore, RecordStoreError, apply_conditionally};

const SCHEMA: &str = include_str!("../../migrations/0001_job_records.sql");

const COLUMNS: &str = "job_id, user_id, input_file_name, inputs_bucket, input_key, submit_time, \
     job_status, complete_time, results_bucket, result_key, log_key, archive_handle, email, tier";

#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: PgPool,
    runtime: tokio::runtime::Handle,
}

impl PostgresJobRecordStore {
    /// Wrap an existing pool; must be called from within a Tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, RecordStoreError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RecordStoreError::Storage(
                "PostgresJobRecordStore requires a tokio runtime".to_string(),
            )
        })?;
        Ok(Self { pool, runtime })
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool)?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), RecordStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id, user_id = %record.user_id), err)]
    pub async fn insert_record(&self, record: &JobRecord) -> Result<(), RecordStoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO job_records ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(record.job_id.as_str())
        .bind(record.user_id.as_str())
        .bind(&record.input_file_name)
        .bind(&record.inputs_bucket)
        .bind(&record.input_key)
        .bind(record.submit_time)
        .bind(record.job_status.as_str())
        .bind(record.complete_time)
        .bind(&record.results_bucket)
        .bind(&record.result_key)
        .bind(&record.log_key)
        .bind(record.archive_handle.as_ref().map(ToString::to_string))
        .bind(&record.email)
        .bind(record.tier.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(RecordStoreError::AlreadyExists(record.job_id.clone()))
            }
            Err(e) => Err(map_sqlx_error("insert_record", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn fetch_record(&self, job_id: &JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_records WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_record", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn fetch_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records WHERE user_id = $1 ORDER BY submit_time ASC, job_id ASC"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_user", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn update_record(
        &self,
        job_id: &JobId,
        update: &RecordUpdate,
        precondition: &Precondition,
    ) -> Result<JobRecord, RecordStoreError> {
        let mut tx: Transaction<'_, Postgres> = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_record", e))?
        .ok_or_else(|| RecordStoreError::NotFound(job_id.clone()))?;

        let mut record = record_from_row(&row)?;
        // Dropping `tx` on error rolls back and releases the lock.
        apply_conditionally(&mut record, update, precondition)?;

        sqlx::query(
            "UPDATE job_records SET job_status = $2, complete_time = $3, results_bucket = $4, \
             result_key = $5, log_key = $6, archive_handle = $7, tier = $8, updated_at = now() \
             WHERE job_id = $1",
        )
        .bind(record.job_id.as_str())
        .bind(record.job_status.as_str())
        .bind(record.complete_time)
        .bind(&record.results_bucket)
        .bind(&record.result_key)
        .bind(&record.log_key)
        .bind(record.archive_handle.as_ref().map(ToString::to_string))
        .bind(record.tier.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_record", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(record)
    }
}

impl JobRecordStore for PostgresJobRecordStore {
    fn create(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        self.runtime.block_on(self.insert_record(&record))
    }

    fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, RecordStoreError> {
        self.runtime.block_on(self.fetch_record(job_id))
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, RecordStoreError> {
        self.runtime.block_on(self.fetch_by_user(user_id))
    }

    fn update(
        &self,
        job_id: &JobId,
        update: RecordUpdate,
        precondition: Precondition,
    ) -> Result<JobRecord, RecordStoreError> {
        self.runtime
            .block_on(self.update_record(job_id, &update, &precondition))
    }
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, RecordStoreError> {
    let text = |column: &str| -> Result<String, RecordStoreError> {
        row.try_get::<String, _>(column)
            .map_err(|e| map_sqlx_error("decode_row", e))
    };
    let optional = |column: &str| -> Result<Option<String>, RecordStoreError> {
        row.try_get::<Option<String>, _>(column)
            .map_err(|e| map_sqlx_error("decode_row", e))
    };

    let archive_handle = optional("archive_handle")?
        .map(ArchiveHandle::try_from)
        .transpose()?;

    Ok(JobRecord {
        job_id: JobId::parse(text("job_id")?)?,
        user_id: UserId::parse(text("user_id")?)?,
        input_file_name: text("input_file_name")?,
        inputs_bucket: text("inputs_bucket")?,
        input_key: text("input_key")?,
        submit_time: row
            .try_get("submit_time")
            .map_err(|e| map_sqlx_error("decode_row", e))?,
        job_status: JobStatus::from_str(&text("job_status")?)?,
        complete_time: row
            .try_get("complete_time")
            .map_err(|e| map_sqlx_error("decode_row", e))?,
        results_bucket: optional("results_bucket")?,
        result_key: optional("result_key")?,
        log_key: optional("log_key")?,
        archive_handle,
        email: text("email")?,
        tier: Tier::from_str(&text("tier")?)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RecordStoreError {
    match err {
        sqlx::Error::Database(db_err) => RecordStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RecordStoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => RecordStoreError::Storage(format!("{operation} failed: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
