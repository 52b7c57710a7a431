//! Core domain model and identity hashing for jobwatch.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod alert;
pub mod hashing;
pub mod health;

pub use alert::{AlertKind, AlertRecord, AlertStatus};
pub use health::{HealthStatus, HealthSummary, TargetHealth};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Country tag applied when an adapter gives no locale hint.
pub const DEFAULT_COUNTRY: &str = "us";

/// Primary dedup identity of a posting: the adapter-unique `(source, source_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub source: String,
    pub source_id: String,
}

impl JobKey {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.source_id)
    }
}

/// Adapter output handed to the pipeline. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJob {
    pub source: String,
    pub source_id: String,
    pub company: String,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    pub url: String,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default)]
    pub description_text: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub raw_payload: JsonValue,
}

impl RawJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.source, &self.source_id)
    }
}

/// Canonical pipeline record: plain-text description plus identity/content hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub source: String,
    pub source_id: String,
    pub company: String,
    pub title: String,
    pub location: Option<String>,
    pub remote: bool,
    pub employment_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub url: String,
    pub description: String,
    pub hash_stable: String,
    pub hash_full: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub country: String,
    pub raw_payload: JsonValue,
}

impl NormalizedJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.source, &self.source_id)
    }
}

/// Persisted posting. Created on first sighting, never deleted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub company: String,
    pub title: String,
    pub location: Option<String>,
    pub remote: bool,
    pub employment_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub url: String,
    pub description: String,
    pub hash_stable: String,
    pub hash_full: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub country: String,
    pub raw_payload: JsonValue,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
    /// Application tracking; never written by the ingestion pipeline.
    pub application_status: Option<String>,
    pub notes: Option<String>,
}

impl Job {
    /// Builds a fresh row for a first sighting at `now`.
    pub fn from_normalized(job: &NormalizedJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: job.source.clone(),
            source_id: job.source_id.clone(),
            company: job.company.clone(),
            title: job.title.clone(),
            location: job.location.clone(),
            remote: job.remote,
            employment_type: job.employment_type.clone(),
            posted_at: job.posted_at,
            url: job.url.clone(),
            description: job.description.clone(),
            hash_stable: job.hash_stable.clone(),
            hash_full: job.hash_full.clone(),
            category: job.category.clone(),
            tags: job.tags.clone(),
            country: job.country.clone(),
            raw_payload: job.raw_payload.clone(),
            first_seen_at: now,
            last_seen_at: now,
            is_active: true,
            application_status: None,
            notes: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.source, &self.source_id)
    }

    /// Overwrites the mutable content fields from a changed sighting.
    pub fn apply_changes(&mut self, job: &NormalizedJob) {
        self.title = job.title.clone();
        self.location = job.location.clone();
        self.remote = job.remote;
        self.employment_type = job.employment_type.clone();
        self.posted_at = job.posted_at;
        self.url = job.url.clone();
        self.description = job.description.clone();
        self.hash_stable = job.hash_stable.clone();
        self.hash_full = job.hash_full.clone();
        self.category = job.category.clone();
        self.tags = job.tags.clone();
        self.raw_payload = job.raw_payload.clone();
    }
}

/// One entry of a version diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Point-in-time copy of the mutable fields after a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub title: String,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub url: String,
    pub description: String,
}

impl VersionSnapshot {
    pub fn of(job: &NormalizedJob) -> Self {
        Self {
            title: job.title.clone(),
            location: job.location.clone(),
            employment_type: job.employment_type.clone(),
            posted_at: job.posted_at,
            url: job.url.clone(),
            description: job.description.clone(),
        }
    }
}

/// Append-only history row, written exactly when a job's `hash_full` changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVersion {
    pub id: Uuid,
    pub job_id: Uuid,
    pub hash_full: String,
    pub captured_at: DateTime<Utc>,
    pub diff: BTreeMap<String, FieldChange>,
    pub snapshot: VersionSnapshot,
}

impl JobVersion {
    /// Diffs `existing` against the incoming sighting over the mutable fields.
    pub fn capture(existing: &Job, incoming: &NormalizedJob, captured_at: DateTime<Utc>) -> Self {
        let mut diff = BTreeMap::new();
        push_change(&mut diff, "title", Some(&existing.title), Some(&incoming.title));
        push_change(
            &mut diff,
            "location",
            existing.location.as_ref(),
            incoming.location.as_ref(),
        );
        push_change(
            &mut diff,
            "employment_type",
            existing.employment_type.as_ref(),
            incoming.employment_type.as_ref(),
        );
        push_change(
            &mut diff,
            "posted_at",
            existing.posted_at.map(|t| t.to_rfc3339()).as_ref(),
            incoming.posted_at.map(|t| t.to_rfc3339()).as_ref(),
        );
        push_change(&mut diff, "url", Some(&existing.url), Some(&incoming.url));
        push_change(
            &mut diff,
            "description",
            Some(&existing.description),
            Some(&incoming.description),
        );

        Self {
            id: Uuid::new_v4(),
            job_id: existing.id,
            hash_full: incoming.hash_full.clone(),
            captured_at,
            diff,
            snapshot: VersionSnapshot::of(incoming),
        }
    }
}

fn push_change(
    diff: &mut BTreeMap<String, FieldChange>,
    field: &str,
    old: Option<&String>,
    new: Option<&String>,
) {
    if old != new {
        diff.insert(
            field.to_string(),
            FieldChange {
                old: old.cloned(),
                new: new.cloned(),
            },
        );
    }
}

/// Adapter family a watchlist target is fetched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtsType {
    Greenhouse,
    Lever,
    Ashby,
    Generic,
    Fixture,
}

impl AtsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtsType::Greenhouse => "greenhouse",
            AtsType::Lever => "lever",
            AtsType::Ashby => "ashby",
            AtsType::Generic => "generic",
            AtsType::Fixture => "fixture",
        }
    }
}

impl fmt::Display for AtsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watchlist entry. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistTarget {
    pub company: String,
    pub ats_type: AtsType,
    #[serde(default)]
    pub careers_url: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WatchlistTarget {
    pub fn new(company: impl Into<String>, ats_type: AtsType) -> Self {
        Self {
            company: company.into(),
            ats_type,
            careers_url: None,
            locations: Vec::new(),
            categories: Vec::new(),
            country: None,
            enabled: true,
        }
    }

    pub fn with_careers_url(mut self, url: impl Into<String>) -> Self {
        self.careers_url = Some(url.into());
        self
    }
}

/// Aggregate counters reported back to the run trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub companies_processed: usize,
    pub jobs_fetched: usize,
    pub jobs_filtered: usize,
    pub jobs_invalid: usize,
    pub jobs_new: usize,
    pub jobs_updated: usize,
    pub duplicates_flagged: usize,
    pub notifications_sent: usize,
    pub errors: usize,
    /// Rejections per filter reason code.
    pub filter_reasons: BTreeMap<String, usize>,
}

impl RunStats {
    pub fn record_filtered(&mut self, reason: &str) {
        self.jobs_filtered += 1;
        *self.filter_reasons.entry(reason.to_string()).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_stats_tracks_reasons() {
        let mut stats = RunStats::default();
        stats.record_filtered("not_internship");
        stats.record_filtered("not_internship");
        stats.record_filtered("location_excluded");
        assert_eq!(stats.jobs_filtered, 3);
        assert_eq!(stats.filter_reasons["not_internship"], 2);
    }

    fn normalized(title: &str, location: Option<&str>) -> NormalizedJob {
        NormalizedJob {
            source: "greenhouse".into(),
            source_id: "123".into(),
            company: "Citadel".into(),
            title: title.into(),
            location: location.map(ToString::to_string),
            remote: false,
            employment_type: Some("internship".into()),
            posted_at: None,
            url: "https://boards.greenhouse.io/citadel/jobs/123".into(),
            description: "Build things.".into(),
            hash_stable: "stable".into(),
            hash_full: "full-1".into(),
            category: None,
            tags: vec![],
            country: DEFAULT_COUNTRY.into(),
            raw_payload: JsonValue::Null,
        }
    }

    #[test]
    fn version_diff_lists_only_changed_fields() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();
        let existing = Job::from_normalized(&normalized("SWE Intern", Some("New York, NY")), now);
        let mut incoming = normalized("SWE Intern", Some("Chicago, IL"));
        incoming.hash_full = "full-2".into();

        let version = JobVersion::capture(&existing, &incoming, now);
        assert_eq!(version.job_id, existing.id);
        assert_eq!(version.diff.len(), 1);
        let change = &version.diff["location"];
        assert_eq!(change.old.as_deref(), Some("New York, NY"));
        assert_eq!(change.new.as_deref(), Some("Chicago, IL"));
        assert_eq!(version.snapshot.location.as_deref(), Some("Chicago, IL"));
        assert_eq!(version.hash_full, "full-2");
    }

    #[test]
    fn apply_changes_keeps_lifecycle_and_tracking_fields() {
        let first = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();
        let mut job = Job::from_normalized(&normalized("SWE Intern", None), first);
        job.application_status = Some("applied".into());
        let mut incoming = normalized("SWE Intern II", None);
        incoming.hash_full = "full-2".into();

        job.apply_changes(&incoming);
        assert_eq!(job.title, "SWE Intern II");
        assert_eq!(job.first_seen_at, first);
        assert_eq!(job.application_status.as_deref(), Some("applied"));
    }

    #[test]
    fn watchlist_target_deserializes_with_defaults() {
        let target: WatchlistTarget =
            serde_json::from_str(r#"{"company":"Citadel","ats_type":"greenhouse"}"#).unwrap();
        assert!(target.enabled);
        assert_eq!(target.ats_type, AtsType::Greenhouse);
        assert!(target.careers_url.is_none());
        assert!(serde_json::from_str::<WatchlistTarget>(
            r#"{"company":"X","ats_type":"taleo"}"#
        )
        .is_err());
    }
}
