//! Identity-keyed upsert and cross-source duplicate detection.
//!
//! `plan_upsert` is the single decision point for create / touch / update and
//! is shared by the one-job path here and the batch processor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobwatch_core::hashing::{jaccard_similarity, normalize_location, tokenize_title};
use jobwatch_core::{Job, JobVersion, NormalizedJob};
use jobwatch_storage::{ChangeSet, JobStore, StoreError, Touch};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Commit attempts made when a concurrent writer wins an identity race.
pub const MAX_COMMIT_ATTEMPTS: usize = 2;

pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.8;

/// What one sighting does to the stored row.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertPlan {
    Create(Job),
    Touch(Touch),
    Update { job: Job, version: JobVersion },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New(Uuid),
    Unchanged(Uuid),
    Updated(Uuid),
}

impl UpsertOutcome {
    pub fn job_id(&self) -> Uuid {
        match *self {
            UpsertOutcome::New(id) | UpsertOutcome::Unchanged(id) | UpsertOutcome::Updated(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::New(_))
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, UpsertOutcome::Updated(_))
    }
}

impl UpsertPlan {
    pub fn outcome(&self) -> UpsertOutcome {
        match self {
            UpsertPlan::Create(job) => UpsertOutcome::New(job.id),
            UpsertPlan::Touch(touch) => UpsertOutcome::Unchanged(touch.job_id),
            UpsertPlan::Update { job, .. } => UpsertOutcome::Updated(job.id),
        }
    }

    fn into_changes(self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        match self {
            UpsertPlan::Create(job) => changes.inserts.push(job),
            UpsertPlan::Touch(touch) => changes.touches.push(touch),
            UpsertPlan::Update { job, version } => {
                changes.updates.push(job);
                changes.versions.push(version);
            }
        }
        changes
    }
}

/// Decides the effect of `incoming` against the currently stored row, if any.
///
/// Never deactivates a job; an unchanged sighting refreshes `last_seen_at`
/// and reactivates.
pub fn plan_upsert(existing: Option<&Job>, incoming: &NormalizedJob, now: DateTime<Utc>) -> UpsertPlan {
    let Some(existing) = existing else {
        return UpsertPlan::Create(Job::from_normalized(incoming, now));
    };

    if existing.hash_full == incoming.hash_full {
        return UpsertPlan::Touch(Touch {
            job_id: existing.id,
            seen_at: now,
        });
    }

    let version = JobVersion::capture(existing, incoming, now);
    let mut job = existing.clone();
    job.apply_changes(incoming);
    job.last_seen_at = now;
    job.is_active = true;
    UpsertPlan::Update { job, version }
}

/// A same-company posting from another source whose title and location look alike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCandidate {
    pub job_id: Uuid,
    pub company: String,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub similarity: f64,
}

pub struct JobDeduper {
    store: Arc<dyn JobStore>,
}

impl JobDeduper {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn process_job(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
        self.process_job_at(job, Utc::now()).await
    }

    /// One lookup, one commit. A lost creation race is re-planned against the winner's row.
    pub async fn process_job_at(
        &self,
        job: &NormalizedJob,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = job.key();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = self.store.find_job(&key).await?;
            let plan = plan_upsert(existing.as_ref(), job, now);
            let outcome = plan.outcome();
            match self.store.commit(plan.into_changes()).await {
                Ok(()) => {
                    debug!(source = %job.source, source_id = %job.source_id, ?outcome, "upserted job");
                    return Ok(outcome);
                }
                Err(err) if err.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(source = %job.source, source_id = %job.source_id, error = %err, "identity conflict; re-planning");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Advisory only: candidates are reported, never merged.
    pub async fn find_cross_source_duplicates(
        &self,
        job: &Job,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let candidates = self.store.find_active_by_company(&job.company, &job.source).await?;
        let tokens = tokenize_title(&job.title);
        let location = job.location.as_deref().map(normalize_location);

        let mut duplicates = Vec::new();
        for candidate in candidates {
            let similarity = jaccard_similarity(&tokens, &tokenize_title(&candidate.title));
            let same_place = candidate.location.as_deref().map(normalize_location) == location
                || (job.remote && candidate.remote);
            if similarity >= threshold && same_place {
                info!(
                    job = %job.key(),
                    duplicate = %candidate.key(),
                    similarity,
                    "cross-source duplicate"
                );
                duplicates.push(DuplicateCandidate {
                    job_id: candidate.id,
                    company: candidate.company,
                    source: candidate.source,
                    source_id: candidate.source_id,
                    title: candidate.title,
                    similarity,
                });
            }
        }
        Ok(duplicates)
    }
}
