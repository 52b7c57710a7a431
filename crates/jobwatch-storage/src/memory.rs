use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{AlertRecord, AlertStatus, Job, JobKey, JobVersion, TargetHealth};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{ChangeSet, JobStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobKey, Job>,
    ids: HashMap<Uuid, JobKey>,
    versions: Vec<JobVersion>,
    health: BTreeMap<(String, String), TargetHealth>,
    alerts: Vec<AlertRecord>,
}

/// In-process store with the same transactional contract as Postgres.
/// Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    lookups: AtomicUsize,
    commits: AtomicUsize,
    fail_commits: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lookup round-trips served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Makes the next `n` commits fail with a database error before touching state.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Inserts a row directly, bypassing commit bookkeeping. Simulates a concurrent writer.
    pub async fn seed(&self, job: Job) {
        let mut state = self.state.lock().await;
        state.ids.insert(job.id, job.key());
        state.jobs.insert(job.key(), job);
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn all_versions(&self) -> Vec<JobVersion> {
        self.state.lock().await.versions.clone()
    }

    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.state.lock().await.alerts.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.jobs.get(key).cloned())
    }

    async fn find_jobs(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Job>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.jobs.get(key).map(|job| (key.clone(), job.clone())))
            .collect())
    }

    async fn find_active_by_company(
        &self,
        company: &str,
        exclude_source: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.is_active && job.company == company && job.source != exclude_source)
            .cloned()
            .collect())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| state.ids.get(id))
            .filter_map(|key| state.jobs.get(key).cloned())
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut state = self.state.lock().await;

        // Validate everything first so a failure leaves state untouched.
        for job in &changes.inserts {
            if state.jobs.contains_key(&job.key()) {
                return Err(StoreError::Conflict(job.key().to_string()));
            }
        }
        for job in &changes.updates {
            if !state.ids.contains_key(&job.id) {
                return Err(StoreError::NotFound(job.id));
            }
        }
        for touch in &changes.touches {
            if !state.ids.contains_key(&touch.job_id) {
                return Err(StoreError::NotFound(touch.job_id));
            }
        }

        for job in changes.inserts {
            state.ids.insert(job.id, job.key());
            state.jobs.insert(job.key(), job);
        }
        for job in changes.updates {
            state.jobs.insert(job.key(), job);
        }
        for touch in changes.touches {
            if let Some(key) = state.ids.get(&touch.job_id).cloned() {
                if let Some(job) = state.jobs.get_mut(&key) {
                    job.last_seen_at = touch.seen_at;
                    job.is_active = true;
                }
            }
        }
        state.versions.extend(changes.versions);

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn versions_for(&self, job_id: Uuid) -> Result<Vec<JobVersion>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.is_active && job.last_seen_at < cutoff)
            .cloned()
            .collect())
    }

    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for job in state.jobs.values_mut() {
            if job.is_active && job.last_seen_at < cutoff {
                job.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn find_target_health(
        &self,
        company: &str,
        ats_type: &str,
    ) -> Result<Option<TargetHealth>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .health
            .get(&(company.to_string(), ats_type.to_string()))
            .cloned())
    }

    async fn save_target_health(&self, health: &TargetHealth) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .health
            .insert((health.company.clone(), health.ats_type.clone()), health.clone());
        Ok(())
    }

    async fn list_target_health(&self) -> Result<Vec<TargetHealth>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<TargetHealth> = state.health.values().cloned().collect();
        // Stable sort keeps (company, ats_type) order within equal failure counts.
        records.sort_by(|a, b| b.failure_count.cmp(&a.failure_count));
        Ok(records)
    }

    async fn record_alerts(&self, alerts: &[AlertRecord]) -> Result<(), StoreError> {
        self.state.lock().await.alerts.extend_from_slice(alerts);
        Ok(())
    }

    async fn recently_alerted(
        &self,
        channel: &str,
        job_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let wanted: HashSet<&Uuid> = job_ids.iter().collect();
        Ok(state
            .alerts
            .iter()
            .filter(|a| a.channel == channel && a.status == AlertStatus::Sent && a.sent_at >= since)
            .filter(|a| wanted.contains(&a.job_id))
            .map(|a| a.job_id)
            .collect())
    }
}
