//! Buffered upserts: one bulk lookup and one transaction per flush.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobwatch_core::{Job, JobKey, JobVersion, NormalizedJob};
use jobwatch_storage::{ChangeSet, JobStore, StoreError, Touch};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{plan_upsert, UpsertPlan, MAX_COMMIT_ATTEMPTS};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Counts for one successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Stored,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Dirty {
    Clean,
    Touched,
    Modified,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    origin: Origin,
    dirty: Dirty,
}

/// Result of planning a whole buffer against one snapshot of the store.
#[derive(Debug, Default)]
struct FlushPlan {
    changes: ChangeSet,
    new_ids: Vec<Uuid>,
    updated_ids: Vec<Uuid>,
    unchanged: usize,
}

pub struct BatchProcessor {
    store: Arc<dyn JobStore>,
    batch_size: usize,
    buffer: Vec<NormalizedJob>,
    new_ids: Vec<Uuid>,
    updated_ids: Vec<Uuid>,
    /// Set by a failed automatic flush; cleared by the next successful flush.
    auto_flush_held: bool,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn JobStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            new_ids: Vec::new(),
            updated_ids: Vec::new(),
            auto_flush_held: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Job ids created by every successful flush so far, in arrival order.
    pub fn new_job_ids(&self) -> &[Uuid] {
        &self.new_ids
    }

    /// One entry per content change, in arrival order. A job created and then
    /// changed inside one flush appears here as well as in `new_job_ids`.
    pub fn updated_job_ids(&self) -> &[Uuid] {
        &self.updated_ids
    }

    /// Buffers `job` with its final category and tags; flushes once the buffer is full.
    ///
    /// After a failed automatic flush the buffer only grows: the error is
    /// returned once and the next explicit [`flush`](Self::flush) retries everything.
    pub async fn add(
        &mut self,
        mut job: NormalizedJob,
        category: Option<String>,
        tags: Vec<String>,
    ) -> Result<(), StoreError> {
        job.category = category;
        job.tags = tags;
        self.buffer.push(job);
        if self.auto_flush_held || self.buffer.len() < self.batch_size {
            return Ok(());
        }
        if let Err(err) = self.flush().await {
            self.auto_flush_held = true;
            return Err(err);
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<FlushReport, StoreError> {
        self.flush_at(Utc::now()).await
    }

    /// Commits the buffer atomically. On error nothing is written and the
    /// buffer is kept for the caller.
    pub async fn flush_at(&mut self, now: DateTime<Utc>) -> Result<FlushReport, StoreError> {
        if self.buffer.is_empty() {
            return Ok(FlushReport::default());
        }
        let span = info_span!("flush", jobs = self.buffer.len());
        async {
            let plan = self.commit_with_retry(now).await?;
            let report = FlushReport {
                new: plan.new_ids.len(),
                updated: plan.updated_ids.len(),
                unchanged: plan.unchanged,
            };
            self.new_ids.extend(plan.new_ids);
            self.updated_ids.extend(plan.updated_ids);
            self.buffer.clear();
            self.auto_flush_held = false;
            info!(new = report.new, updated = report.updated, unchanged = report.unchanged, "flushed batch");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn commit_with_retry(&self, now: DateTime<Utc>) -> Result<FlushPlan, StoreError> {
        let mut keys: Vec<JobKey> = self.buffer.iter().map(NormalizedJob::key).collect();
        keys.sort();
        keys.dedup();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = self.store.find_jobs(&keys).await?;
            let mut plan = plan_buffer(&self.buffer, existing, now);
            let changes = std::mem::take(&mut plan.changes);
            match self.store.commit(changes).await {
                Ok(()) => return Ok(plan),
                Err(err) if err.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(error = %err, attempt, "flush lost an identity race; re-planning");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Plans every buffered job in arrival order against a working set seeded
/// from the store, so repeated identities behave like sequential upserts.
fn plan_buffer(buffer: &[NormalizedJob], existing: HashMap<JobKey, Job>, now: DateTime<Utc>) -> FlushPlan {
    let mut entries: Vec<Entry> = Vec::new();
    let mut index: HashMap<JobKey, usize> = HashMap::new();
    let mut stored = existing;
    let mut versions: Vec<JobVersion> = Vec::new();
    let mut plan = FlushPlan::default();

    for incoming in buffer {
        let key = incoming.key();
        let slot = match index.get(&key) {
            Some(&slot) => Some(slot),
            None => stored.remove(&key).map(|job| {
                entries.push(Entry {
                    job,
                    origin: Origin::Stored,
                    dirty: Dirty::Clean,
                });
                index.insert(key.clone(), entries.len() - 1);
                entries.len() - 1
            }),
        };

        match plan_upsert(slot.map(|s| &entries[s].job), incoming, now) {
            UpsertPlan::Create(job) => {
                plan.new_ids.push(job.id);
                entries.push(Entry {
                    job,
                    origin: Origin::Created,
                    dirty: Dirty::Modified,
                });
                index.insert(key, entries.len() - 1);
            }
            UpsertPlan::Touch(touch) => {
                // `slot` is always set for a touch.
                if let Some(entry) = slot.map(|s| &mut entries[s]) {
                    entry.job.last_seen_at = touch.seen_at;
                    entry.job.is_active = true;
                    entry.dirty = entry.dirty.max(Dirty::Touched);
                }
                plan.unchanged += 1;
            }
            UpsertPlan::Update { job, version } => {
                plan.updated_ids.push(job.id);
                if let Some(entry) = slot.map(|s| &mut entries[s]) {
                    entry.job = job;
                    entry.dirty = Dirty::Modified;
                }
                versions.push(version);
            }
        }
    }

    for entry in entries {
        match (entry.origin, entry.dirty) {
            (Origin::Created, _) => plan.changes.inserts.push(entry.job),
            (Origin::Stored, Dirty::Modified) => plan.changes.updates.push(entry.job),
            (Origin::Stored, Dirty::Touched) => plan.changes.touches.push(Touch {
                job_id: entry.job.id,
                seen_at: entry.job.last_seen_at,
            }),
            (Origin::Stored, Dirty::Clean) => {}
        }
    }
    plan.changes.versions = versions;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jobwatch_core::DEFAULT_COUNTRY;
    use jobwatch_storage::MemoryJobStore;

    use crate::dedup::JobDeduper;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).single().unwrap()
    }

    fn job(source_id: &str, hash_full: &str) -> NormalizedJob {
        NormalizedJob {
            source: "lever".into(),
            source_id: source_id.into(),
            company: "Two Sigma".into(),
            title: format!("Software Engineer Intern {source_id}"),
            location: Some("New York, NY".into()),
            remote: false,
            employment_type: None,
            posted_at: None,
            url: format!("https://jobs.lever.co/twosigma/{source_id}"),
            description: format!("content {hash_full}"),
            hash_stable: format!("stable-{source_id}"),
            hash_full: hash_full.into(),
            category: None,
            tags: vec![],
            country: DEFAULT_COUNTRY.into(),
            raw_payload: serde_json::Value::Null,
        }
    }

    fn processor(store: &Arc<MemoryJobStore>, batch_size: usize) -> BatchProcessor {
        BatchProcessor::new(store.clone(), batch_size)
    }

    #[tokio::test]
    async fn flush_uses_one_lookup_and_one_commit() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        for id in ["a", "b", "c"] {
            batch.add(job(id, "h1"), Some("swe".into()), vec!["internship".into()]).await.unwrap();
        }
        assert_eq!(batch.pending(), 3);
        assert_eq!(store.commit_count(), 0);

        let report = batch.flush_at(t0()).await.unwrap();
        assert_eq!(report, FlushReport { new: 3, updated: 0, unchanged: 0 });
        assert_eq!(store.lookup_count(), 1);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(batch.new_job_ids().len(), 3);

        let stored = store.jobs().await;
        assert!(stored.iter().all(|j| j.category.as_deref() == Some("swe") && j.tags == ["internship"]));
    }

    #[tokio::test]
    async fn auto_flushes_at_batch_size() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 2);
        batch.add(job("a", "h"), None, vec![]).await.unwrap();
        assert_eq!(store.commit_count(), 0);
        batch.add(job("b", "h"), None, vec![]).await.unwrap();
        assert_eq!(store.commit_count(), 1);
        assert_eq!(batch.pending(), 0);
        batch.add(job("c", "h"), None, vec![]).await.unwrap();
        batch.flush().await.unwrap();
        assert_eq!(batch.new_job_ids().len(), 3);
    }

    #[tokio::test]
    async fn repeated_identity_in_one_buffer_matches_sequential_upserts() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.add(job("a", "h2"), None, vec![]).await.unwrap();

        let report = batch.flush_at(t0()).await.unwrap();
        assert_eq!(report, FlushReport { new: 1, updated: 1, unchanged: 1 });
        assert_eq!(batch.updated_job_ids(), batch.new_job_ids());

        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].hash_full, "h2");
        assert_eq!(store.all_versions().await.len(), 1);
    }

    #[tokio::test]
    async fn existing_rows_are_touched_or_updated() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.add(job("b", "h1"), None, vec![]).await.unwrap();
        batch.flush_at(t0()).await.unwrap();

        let later = t0() + Duration::hours(6);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.add(job("b", "h2"), None, vec![]).await.unwrap();
        let report = batch.flush_at(later).await.unwrap();
        assert_eq!(report, FlushReport { new: 0, updated: 1, unchanged: 1 });
        assert_eq!(batch.updated_job_ids().len(), 1);

        let a = store.find_job(&JobKey::new("lever", "a")).await.unwrap().unwrap();
        assert_eq!(a.first_seen_at, t0());
        assert_eq!(a.last_seen_at, later);
        let b = store.find_job(&JobKey::new("lever", "b")).await.unwrap().unwrap();
        assert_eq!(b.hash_full, "h2");
        assert_eq!(store.versions_for(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_commit_keeps_buffer_and_writes_nothing() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        store.fail_next_commits(1);

        assert!(batch.flush_at(t0()).await.is_err());
        assert_eq!(batch.pending(), 1);
        assert!(store.jobs().await.is_empty());
        assert!(batch.new_job_ids().is_empty());

        batch.flush_at(t0()).await.unwrap();
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn created_then_changed_reports_like_single_upserts() {
        let single_store = Arc::new(MemoryJobStore::new());
        let deduper = JobDeduper::new(single_store.clone());
        let first = deduper.process_job_at(&job("a", "h1"), t0()).await.unwrap();
        let second = deduper.process_job_at(&job("a", "h2"), t0()).await.unwrap();
        assert!(first.is_new());
        assert!(second.is_updated());

        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.add(job("a", "h2"), None, vec![]).await.unwrap();
        batch.flush_at(t0()).await.unwrap();

        assert_eq!(batch.new_job_ids().len(), 1);
        assert_eq!(batch.updated_job_ids().len(), 1);
        assert_eq!(batch.updated_job_ids()[0], batch.new_job_ids()[0]);
    }

    #[tokio::test]
    async fn every_change_of_a_stored_job_is_reported() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        batch.add(job("a", "h1"), None, vec![]).await.unwrap();
        batch.flush_at(t0()).await.unwrap();

        batch.add(job("a", "h2"), None, vec![]).await.unwrap();
        batch.add(job("a", "h3"), None, vec![]).await.unwrap();
        let report = batch.flush_at(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.updated, 2);
        assert_eq!(store.all_versions().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_auto_flush_is_reported_once_and_held_until_explicit_flush() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 2);
        store.fail_next_commits(100);

        let mut errors = 0;
        for id in ["a", "b", "c", "d", "e"] {
            if batch.add(job(id, "h1"), None, vec![]).await.is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(store.lookup_count(), 1);
        assert_eq!(batch.pending(), 5);

        store.fail_next_commits(0);
        let report = batch.flush_at(t0()).await.unwrap();
        assert_eq!(report.new, 5);
        assert_eq!(batch.pending(), 0);

        // Automatic flushing resumes after a successful flush.
        batch.add(job("f", "h1"), None, vec![]).await.unwrap();
        batch.add(job("g", "h1"), None, vec![]).await.unwrap();
        assert_eq!(batch.pending(), 0);
        assert_eq!(batch.new_job_ids().len(), 7);
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let store = Arc::new(MemoryJobStore::new());
        let mut batch = processor(&store, 50);
        assert_eq!(batch.flush().await.unwrap(), FlushReport::default());
        assert_eq!(store.lookup_count(), 0);
    }
}
