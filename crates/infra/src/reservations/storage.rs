//! Job-row storage access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;

use jobreserve_core::{ExternalJobId, JobRowId};

/// Storage operations the persistence writer needs.
///
/// Implementations must tolerate concurrent calls from many writer tasks.
#[async_trait]
pub trait JobRowAccessor: Send + Sync {
    /// Resolve an external job id to its job row. `Ok(None)` means the row does
    /// not exist (yet); it is the only result the writer retries on.
    async fn find_job_id(&self, external_id: &ExternalJobId)
    -> Result<Option<JobRowId>, StorageError>;

    /// Set the reserved millicores on a job row, returning the affected-row count.
    async fn set_millicores_reserved(
        &self,
        job_id: JobRowId,
        millicores: i64,
    ) -> Result<u64, StorageError>;
}

#[async_trait]
impl<T: JobRowAccessor + ?Sized> JobRowAccessor for Arc<T> {
    async fn find_job_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRowId>, StorageError> {
        (**self).find_job_id(external_id).await
    }

    async fn set_millicores_reserved(
        &self,
        job_id: JobRowId,
        millicores: i64,
    ) -> Result<u64, StorageError> {
        (**self).set_millicores_reserved(job_id, millicores).await
    }
}

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The database rejected or failed the statement.
    #[error("database error: {0}")]
    Database(String),
    /// No connection could be used (pool closed, timed out, I/O failure).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// In-memory job rows for tests/dev.
///
/// Rows and their external-id links are created separately so callers can
/// reproduce the window in which a job has been launched but its row is not
/// yet visible.
#[derive(Debug, Default)]
pub struct InMemoryJobRows {
    links: RwLock<HashMap<ExternalJobId, JobRowId>>,
    rows: RwLock<HashMap<JobRowId, Option<i64>>>,
    updates: Mutex<Vec<(JobRowId, i64)>>,
    lookups: AtomicUsize,
}

impl InMemoryJobRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a job row and link it to `external_id` in one go.
    pub fn insert_job(&self, external_id: impl Into<ExternalJobId>) -> JobRowId {
        let job_id = self.create_row();
        self.link(external_id, job_id);
        job_id
    }

    /// Create an unlinked job row.
    pub fn create_row(&self) -> JobRowId {
        let job_id = JobRowId::new();
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, None);
        job_id
    }

    /// Make `external_id` resolve to `job_id`.
    pub fn link(&self, external_id: impl Into<ExternalJobId>, job_id: JobRowId) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_id.into(), job_id);
    }

    /// Drop a row while keeping its link, so updates hit nothing.
    pub fn delete_row(&self, job_id: JobRowId) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }

    pub fn millicores_reserved(&self, job_id: JobRowId) -> Option<i64> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .copied()
            .flatten()
    }

    /// Every update received, in arrival order, including ones that matched no row.
    pub fn updates(&self) -> Vec<(JobRowId, i64)> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRowAccessor for InMemoryJobRows {
    async fn find_job_id(
        &self,
        external_id: &ExternalJobId,
    ) -> Result<Option<JobRowId>, StorageError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let links = self
            .links
            .read()
            .map_err(|_| StorageError::Unavailable("job links lock poisoned".into()))?;
        Ok(links.get(external_id).copied())
    }

    async fn set_millicores_reserved(
        &self,
        job_id: JobRowId,
        millicores: i64,
    ) -> Result<u64, StorageError> {
        self.updates
            .lock()
            .map_err(|_| StorageError::Unavailable("update log lock poisoned".into()))?
            .push((job_id, millicores));

        let mut rows = self
            .rows
            .write()
            .map_err(|_| StorageError::Unavailable("job rows lock poisoned".into()))?;
        match rows.get_mut(&job_id) {
            Some(reserved) => {
                *reserved = Some(millicores);
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
