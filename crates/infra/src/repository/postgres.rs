//! Postgres-backed job repository.
//!
//! One row per job in `migration_jobs`, columns 1:1 with [`JobRecord`]. The
//! status is stored as its name next to the direction and parsed back through
//! [`JobStatus::parse`], so a row can never carry a status of the wrong
//! direction without being reported as corrupt.
//!
//! ## Sync facade
//!
//! [`JobRepository`] is synchronous (the state machine runs on request and
//! executor threads). The repository owns a runtime handle and blocks on it,
//! so it must not be called from inside an async task.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use portage_auth::{Login, OrganizationSlug, Owner};
use portage_core::{JobId, ProjectId, UserId};
use portage_migration::{
    Direction, JobRecord, JobRepository, JobStatus, MigrationJob, RepositoryError, RequestedService,
};

/// Schema applied by [`PostgresJobRepository::ensure_schema`].
pub const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Build a lazily connecting pool; no connection is opened until first use.
    pub fn connect_lazy(url: &str, runtime: Handle) -> Result<Self, RepositoryError> {
        let pool = {
            let _guard = runtime.enter();
            PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(url)
                .map_err(|e| map_sqlx_error("connect", None, e))?
        };
        Ok(Self::new(pool, runtime))
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", None, e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    pub async fn insert_record(&self, record: &JobRecord) -> Result<(), RepositoryError> {
        let row = JobRow::from_record(record)?;
        sqlx::query(
            r#"
            INSERT INTO migration_jobs (
                id,
                owner_id,
                owner_login,
                direction,
                status,
                service,
                project_ids,
                target_organization,
                user_identity_map,
                payload_file_name,
                processed_at,
                last_error,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(row.id)
        .bind(row.owner_id)
        .bind(&row.owner_login)
        .bind(&row.direction)
        .bind(&row.status)
        .bind(&row.service)
        .bind(&row.project_ids)
        .bind(&row.target_organization)
        .bind(&row.user_identity_map)
        .bind(&row.payload_file_name)
        .bind(row.processed_at)
        .bind(&row.last_error)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", Some(record.id), e))?;
        Ok(())
    }

    /// Owner, direction and creation time are immutable and never rewritten.
    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    pub async fn update_record(&self, record: &JobRecord) -> Result<(), RepositoryError> {
        let row = JobRow::from_record(record)?;
        let result = sqlx::query(
            r#"
            UPDATE migration_jobs SET
                status = $2,
                service = $3,
                project_ids = $4,
                target_organization = $5,
                user_identity_map = $6,
                payload_file_name = $7,
                processed_at = $8,
                last_error = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.status)
        .bind(&row.service)
        .bind(&row.project_ids)
        .bind(&row.target_organization)
        .bind(&row.user_identity_map)
        .bind(&row.payload_file_name)
        .bind(row.processed_at)
        .bind(&row.last_error)
        .bind(row.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", Some(record.id), e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_record(&self, id: JobId) -> Result<Option<JobRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                owner_id,
                owner_login,
                direction,
                status,
                service,
                project_ids,
                target_organization,
                user_identity_map,
                payload_file_name,
                processed_at,
                last_error,
                created_at,
                updated_at
            FROM migration_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", Some(id), e))?;

        match row {
            Some(row) => {
                let row = JobRow::from_pg_row(&row)
                    .map_err(|e| RepositoryError::Corrupt(id, format!("failed to read row: {e}")))?;
                Ok(Some(row.into_record()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn remove_record(&self, id: JobId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM migration_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", Some(id), e))?;
        Ok(result.rows_affected() > 0)
    }
}

impl JobRepository for PostgresJobRepository {
    fn insert(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        self.runtime.block_on(self.insert_record(job.record()))
    }

    fn update(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        self.runtime.block_on(self.update_record(job.record()))
    }

    fn get(&self, id: JobId) -> Result<Option<MigrationJob>, RepositoryError> {
        let record = self.runtime.block_on(self.fetch_record(id))?;
        Ok(record.map(MigrationJob::restore))
    }

    fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        self.runtime.block_on(self.remove_record(id))
    }
}

fn map_sqlx_error(operation: &str, id: Option<JobId>, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => match (db_err.code().as_deref(), id) {
            // unique violation
            (Some("23505"), Some(id)) => RepositoryError::AlreadyExists(id),
            _ => RepositoryError::Storage(format!(
                "database error in {operation}: {}",
                db_err.message()
            )),
        },
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Column-level form of a job record.
#[derive(Debug, Clone, PartialEq)]
struct JobRow {
    id: uuid::Uuid,
    owner_id: uuid::Uuid,
    owner_login: String,
    direction: String,
    status: String,
    service: String,
    project_ids: Vec<i64>,
    target_organization: Option<String>,
    user_identity_map: serde_json::Value,
    payload_file_name: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_record(record: &JobRecord) -> Result<Self, RepositoryError> {
        let user_identity_map = serde_json::to_value(&record.user_identity_map)
            .map_err(|e| RepositoryError::Corrupt(record.id, format!("user map: {e}")))?;
        Ok(Self {
            id: *record.id.as_uuid(),
            owner_id: *record.owner.user_id.as_uuid(),
            owner_login: record.owner.login.to_string(),
            direction: record.status.direction().to_string(),
            status: record.status.as_str().to_string(),
            service: record.service.as_str().to_string(),
            project_ids: record.project_ids.iter().map(|id| id.get()).collect(),
            target_organization: record.target_organization.as_ref().map(ToString::to_string),
            user_identity_map,
            payload_file_name: record.payload_file_name.clone(),
            processed_at: record.processed_at,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            owner_login: row.try_get("owner_login")?,
            direction: row.try_get("direction")?,
            status: row.try_get("status")?,
            service: row.try_get("service")?,
            project_ids: row.try_get("project_ids")?,
            target_organization: row.try_get("target_organization")?,
            user_identity_map: row.try_get("user_identity_map")?,
            payload_file_name: row.try_get("payload_file_name")?,
            processed_at: row.try_get("processed_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, RepositoryError> {
        let id = JobId::from_uuid(self.id);
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            RepositoryError::Corrupt(id, format!("{what}: {e}"))
        };

        let direction = Direction::from_str(&self.direction).map_err(|e| corrupt("direction", &e))?;
        let status = JobStatus::parse(direction, &self.status).map_err(|e| corrupt("status", &e))?;
        let user_identity_map: BTreeMap<Login, Login> =
            serde_json::from_value(self.user_identity_map).map_err(|e| corrupt("user map", &e))?;

        Ok(JobRecord {
            id,
            owner: Owner::new(UserId::from_uuid(self.owner_id), self.owner_login),
            status,
            service: RequestedService::from(self.service),
            project_ids: self.project_ids.into_iter().map(ProjectId::new).collect(),
            target_organization: self.target_organization.map(OrganizationSlug::new),
            user_identity_map,
            payload_file_name: self.payload_file_name,
            processed_at: self.processed_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
