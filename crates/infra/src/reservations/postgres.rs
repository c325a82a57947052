//! Postgres-backed job-row accessor.
//!
//! The job row is created by a separate launch-tracking process, so the
//! `job_steps` link for an invocation id may appear some time after the
//! reservation is computed.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StorageError |
//! |------------|--------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` |
//! | Anything else | `Database` |
//!
//! ## Thread Safety
//!
//! `PgJobRowAccessor` is `Send + Sync`; concurrent writers share the SQLx pool.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use jobreserve_core::{ExternalJobId, JobRowId};

use super::storage::{JobRowAccessor, StorageError};
use crate::config::ReservationConfig;

const JOB_ID_QUERY: &str = r#"
    SELECT job_id
    FROM job_steps
    WHERE external_id = $1
    LIMIT 1
"#;

const SET_MILLICORES_RESERVED: &str = r#"
    UPDATE jobs
    SET millicores_reserved = $2
    WHERE jobs.id = $1
"#;

/// Job-row accessor over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgJobRowAccessor {
    pool: Arc<PgPool>,
}

impl PgJobRowAccessor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl JobRowAccessor for PgJobRowAccessor {
    #[instrument(skip(self), fields(external_id = %external_id), err)]
    async fn find_job_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRowId>, StorageError> {
        let row = sqlx::query(JOB_ID_QUERY)
            .bind(external_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id: Uuid = row
            .try_get("job_id")
            .map_err(|e| map_sqlx_error("find_job_id", e))?;
        Ok(Some(JobRowId::from_uuid(job_id)))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn set_millicores_reserved(
        &self,
        job_id: JobRowId,
        millicores: i64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(SET_MILLICORES_RESERVED)
            .bind(job_id.as_uuid())
            .bind(millicores)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_millicores_reserved", e))?;

        debug!(rows_affected = result.rows_affected(), "updated millicores reserved");
        Ok(result.rows_affected())
    }
}

/// Open a pool sized for concurrent persistence writers.
pub async fn connect_pool(config: &ReservationConfig) -> anyhow::Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to connect to the jobs database")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(url)
        .await
        .context("failed to connect to the jobs database")?;

    tracing::info!(max_connections = config.max_db_connections, "connected to the database");
    Ok(pool)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StorageError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Io(ref e) => StorageError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::Tls(ref e) => StorageError::Unavailable(format!("{operation}: {e}")),
        other => StorageError::Database(format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("find_job_id", sqlx::Error::PoolTimedOut),
            StorageError::Unavailable(msg) if msg.starts_with("find_job_id")
        ));
        assert!(matches!(
            map_sqlx_error("find_job_id", sqlx::Error::PoolClosed),
            StorageError::Unavailable(_)
        ));
    }

    #[test]
    fn statement_errors_are_database_errors() {
        let err = map_sqlx_error(
            "set_millicores_reserved",
            sqlx::Error::ColumnNotFound("job_id".into()),
        );
        assert!(matches!(err, StorageError::Database(msg) if msg.contains("job_id")));
    }

    #[tokio::test]
    async fn connect_requires_database_url() {
        let err = connect_pool(&ReservationConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
