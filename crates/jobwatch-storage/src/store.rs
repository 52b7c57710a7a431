use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{AlertRecord, Job, JobKey, JobVersion, TargetHealth};
use thiserror::Error;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer created the same `(source, source_id)` first.
    #[error("identity conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// A "still live" sighting of an unchanged job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch {
    pub job_id: Uuid,
    pub seen_at: DateTime<Utc>,
}

/// Everything one flush writes. Committed atomically or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserts: Vec<Job>,
    pub updates: Vec<Job>,
    pub touches: Vec<Touch>,
    pub versions: Vec<JobVersion>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.touches.is_empty()
            && self.versions.is_empty()
    }
}

/// Persistence contract for jobs and their version history.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError>;

    /// One round-trip lookup for many identities; missing keys are simply absent.
    async fn find_jobs(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Job>, StoreError>;

    /// Active jobs of `company` whose source differs from `exclude_source`.
    async fn find_active_by_company(
        &self,
        company: &str,
        exclude_source: &str,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError>;

    /// Applies inserts, updates, touches and version appends in one transaction.
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;

    async fn versions_for(&self, job_id: Uuid) -> Result<Vec<JobVersion>, StoreError>;

    /// Active jobs whose `last_seen_at` is older than `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Flips `is_active` off for every stale job; returns how many changed.
    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn find_target_health(
        &self,
        company: &str,
        ats_type: &str,
    ) -> Result<Option<TargetHealth>, StoreError>;

    /// Inserts or replaces the record for `(company, ats_type)`.
    async fn save_target_health(&self, health: &TargetHealth) -> Result<(), StoreError>;

    /// Every target record, worst first (most consecutive failures).
    async fn list_target_health(&self) -> Result<Vec<TargetHealth>, StoreError>;

    async fn record_alerts(&self, alerts: &[AlertRecord]) -> Result<(), StoreError>;

    /// Which of `job_ids` had a successful alert on `channel` at or after `since`.
    async fn recently_alerted(
        &self,
        channel: &str,
        job_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, StoreError>;
}
