//! Per-run notification sinks.
//!
//! A run produces at most one `RunNotification` holding every new and updated
//! job, so subscribers get one consolidated message instead of one per posting.
//! [`AlertDispatcher`] logs every announced job per sink and drops jobs a sink
//! already announced within the cooldown window.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{AlertKind, AlertRecord, Job, RunStats};
use jobwatch_storage::JobStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RunNotification {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_jobs: Vec<Job>,
    pub updated_jobs: Vec<Job>,
    pub stats: RunStats,
}

impl RunNotification {
    pub fn is_empty(&self) -> bool {
        self.new_jobs.is_empty() && self.updated_jobs.is_empty()
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, notification: &RunNotification) -> Result<()>;
}

/// Writes one structured line per run plus one per new job.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        info!(
            run_id = %notification.run_id,
            new = notification.new_jobs.len(),
            updated = notification.updated_jobs.len(),
            "run notification"
        );
        for job in &notification.new_jobs {
            info!(
                company = %job.company,
                title = %job.title,
                location = job.location.as_deref().unwrap_or("-"),
                url = %job.url,
                "new posting"
            );
        }
        Ok(())
    }
}

pub const DEFAULT_ALERT_COOLDOWN_HOURS: u32 = 24;

/// Delivers a run notification to every sink with a per-sink alert log.
pub struct AlertDispatcher {
    store: Arc<dyn JobStore>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    cooldown: chrono::Duration,
}

impl AlertDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        sinks: Vec<Arc<dyn NotificationSink>>,
        cooldown: chrono::Duration,
    ) -> Self {
        Self { store, sinks, cooldown }
    }

    /// Returns how many sinks accepted their notification. A sink whose jobs were
    /// all announced within the cooldown is skipped and not counted.
    pub async fn dispatch(&self, notification: &RunNotification, now: DateTime<Utc>) -> usize {
        let since = now
            .checked_sub_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let ids: Vec<Uuid> = notification
            .new_jobs
            .iter()
            .chain(&notification.updated_jobs)
            .map(|job| job.id)
            .collect();

        let mut sent = 0;
        for sink in &self.sinks {
            let channel = sink.name();
            let recent = match self.store.recently_alerted(channel, &ids, since).await {
                Ok(recent) => recent,
                Err(err) => {
                    warn!(sink = channel, error = %err, "reading alert log failed; sending everything");
                    HashSet::new()
                }
            };
            let fresh = |jobs: &[Job]| -> Vec<Job> {
                jobs.iter().filter(|job| !recent.contains(&job.id)).cloned().collect()
            };
            let filtered = RunNotification {
                new_jobs: fresh(&notification.new_jobs),
                updated_jobs: fresh(&notification.updated_jobs),
                ..notification.clone()
            };
            if filtered.is_empty() {
                debug!(sink = channel, "every job already announced within cooldown");
                continue;
            }

            let result = sink.notify(&filtered).await;
            let error = result.as_ref().err().map(|err| format!("{err:#}"));
            let alerts: Vec<AlertRecord> = filtered
                .new_jobs
                .iter()
                .map(|job| (job.id, AlertKind::New))
                .chain(filtered.updated_jobs.iter().map(|job| (job.id, AlertKind::Updated)))
                .map(|(job_id, kind)| match &error {
                    None => AlertRecord::sent(job_id, kind, channel, now),
                    Some(error) => AlertRecord::failed(job_id, kind, channel, error, now),
                })
                .collect();
            match error {
                None => sent += 1,
                Some(error) => warn!(sink = channel, %error, "notification failed"),
            }
            if let Err(err) = self.store.record_alerts(&alerts).await {
                warn!(sink = channel, error = %err, "recording alerts failed");
            }
        }
        sent
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Run report directory: `summary.json`, `new_jobs.md` and a Parquet
/// snapshot of the changed jobs with a sha256 manifest.
#[derive(Debug, Clone)]
pub struct ReportSink {
    reports_dir: PathBuf,
}

impl ReportSink {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.reports_dir.join(run_id.to_string())
    }
}

#[async_trait]
impl NotificationSink for ReportSink {
    fn name(&self) -> &'static str {
        "report"
    }

    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        let run_dir = self.run_dir(notification.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let summary = serde_json::to_vec_pretty(notification).context("serializing run summary")?;
        fs::write(run_dir.join("summary.json"), summary)
            .await
            .context("writing summary.json")?;
        fs::write(run_dir.join("new_jobs.md"), render_brief(notification))
            .await
            .context("writing new_jobs.md")?;

        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;
        let jobs_path = snapshot_dir.join("jobs.parquet");
        write_jobs_parquet(&jobs_path, notification)?;

        let manifest = SnapshotManifest {
            schema_version: 1,
            files: vec![manifest_entry("jobs", &run_dir, &jobs_path)?],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(run_dir = %run_dir.display(), "wrote run report");
        Ok(())
    }
}

fn render_brief(notification: &RunNotification) -> String {
    let mut lines = vec![
        "# New internship postings".to_string(),
        String::new(),
        format!("- Run ID: `{}`", notification.run_id),
        format!("- Started: {}", notification.started_at),
        format!("- Finished: {}", notification.finished_at),
        format!("- Companies processed: {}", notification.stats.companies_processed),
        format!("- New: {}", notification.new_jobs.len()),
        format!("- Updated: {}", notification.updated_jobs.len()),
        String::new(),
    ];

    if notification.new_jobs.is_empty() {
        lines.push("_No new postings this run._".to_string());
    } else {
        lines.push("## New".to_string());
        for job in &notification.new_jobs {
            lines.push(brief_line(job));
        }
    }
    if !notification.updated_jobs.is_empty() {
        lines.push(String::new());
        lines.push("## Updated".to_string());
        for job in &notification.updated_jobs {
            lines.push(brief_line(job));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn brief_line(job: &Job) -> String {
    let location = job.location.as_deref().unwrap_or(if job.remote { "Remote" } else { "-" });
    let category = job.category.as_deref().map(|c| format!(" `{c}`")).unwrap_or_default();
    format!("- **{}** {} ({}){} <{}>", job.company, job.title, location, category, job.url)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_jobs_parquet(path: &Path, notification: &RunNotification) -> Result<()> {
    let rows: Vec<(&Job, &str)> = notification
        .new_jobs
        .iter()
        .map(|job| (job, "new"))
        .chain(notification.updated_jobs.iter().map(|job| (job, "updated")))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("job_id", DataType::Utf8, false),
        ArrowField::new("change", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("remote", DataType::Boolean, false),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("tags", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));

    let job_ids = string_column(&rows, |j| Some(j.id.to_string()));
    let changes = StringArray::from(rows.iter().map(|(_, change)| Some(*change)).collect::<Vec<_>>());
    let sources = string_column(&rows, |j| Some(j.source.clone()));
    let source_ids = string_column(&rows, |j| Some(j.source_id.clone()));
    let companies = string_column(&rows, |j| Some(j.company.clone()));
    let titles = string_column(&rows, |j| Some(j.title.clone()));
    let locations = string_column(&rows, |j| j.location.clone());
    let remotes = BooleanArray::from(rows.iter().map(|(job, _)| job.remote).collect::<Vec<_>>());
    let categories = string_column(&rows, |j| j.category.clone());
    let tags = string_column(&rows, |j| Some(j.tags.join(",")));
    let urls = string_column(&rows, |j| Some(j.url.clone()));
    let first_seen = string_column(&rows, |j| Some(j.first_seen_at.to_rfc3339()));
    let last_seen = string_column(&rows, |j| Some(j.last_seen_at.to_rfc3339()));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(job_ids),
            Arc::new(changes),
            Arc::new(sources),
            Arc::new(source_ids),
            Arc::new(companies),
            Arc::new(titles),
            Arc::new(locations),
            Arc::new(remotes),
            Arc::new(categories),
            Arc::new(tags),
            Arc::new(urls),
            Arc::new(first_seen),
            Arc::new(last_seen),
        ],
    )
    .context("building jobs record batch")?;
    write_parquet(path, batch)
}

fn string_column(rows: &[(&Job, &str)], value: impl Fn(&Job) -> Option<String>) -> StringArray {
    StringArray::from(rows.iter().map(|(job, _)| value(job)).collect::<Vec<_>>())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobwatch_core::{NormalizedJob, DEFAULT_COUNTRY};

    fn job(source_id: &str, category: Option<&str>) -> Job {
        let normalized = NormalizedJob {
            source: "greenhouse".into(),
            source_id: source_id.into(),
            company: "Hudson River Trading".into(),
            title: "Software Engineering Intern".into(),
            location: Some("New York, NY".into()),
            remote: false,
            employment_type: Some("internship".into()),
            posted_at: None,
            url: format!("https://boards.greenhouse.io/hrt/jobs/{source_id}"),
            description: "Low-latency C++.".into(),
            hash_stable: "s".into(),
            hash_full: "f".into(),
            category: category.map(ToString::to_string),
            tags: vec!["internship".into(), "swe".into()],
            country: DEFAULT_COUNTRY.into(),
            raw_payload: serde_json::Value::Null,
        };
        Job::from_normalized(&normalized, Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).single().unwrap())
    }

    fn notification(new_jobs: Vec<Job>, updated_jobs: Vec<Job>) -> RunNotification {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).single().unwrap();
        RunNotification {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            new_jobs,
            updated_jobs,
            stats: RunStats::default(),
        }
    }

    #[tokio::test]
    async fn report_sink_writes_summary_brief_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ReportSink::new(dir.path());
        let note = notification(vec![job("1", Some("swe")), job("2", None)], vec![job("3", None)]);

        sink.notify(&note).await.unwrap();

        let run_dir = sink.run_dir(note.run_id);
        let brief = std::fs::read_to_string(run_dir.join("new_jobs.md")).unwrap();
        assert!(brief.contains("**Hudson River Trading** Software Engineering Intern (New York, NY) `swe`"));
        assert!(brief.contains("## Updated"));

        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("summary.json")).unwrap()).unwrap();
        assert_eq!(summary["new_jobs"].as_array().unwrap().len(), 2);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("snapshots/manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["path"], "snapshots/jobs.parquet");
        assert_eq!(manifest["files"][0]["sha256"].as_str().unwrap().len(), 64);
        assert!(run_dir.join("snapshots/jobs.parquet").exists());
    }

    #[test]
    fn brief_mentions_quiet_runs() {
        let brief = render_brief(&notification(vec![], vec![]));
        assert!(brief.contains("No new postings"));
        assert!(!brief.contains("## Updated"));
    }

    #[tokio::test]
    async fn log_sink_never_fails() {
        assert!(LogSink.notify(&notification(vec![job("1", None)], vec![])).await.is_ok());
    }

    /// Keeps every notification it receives; fails on demand.
    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        seen: std::sync::Mutex<Vec<RunNotification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, notification: &RunNotification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.clone());
            if self.fail {
                anyhow::bail!("webhook returned 500");
            }
            Ok(())
        }
    }

    fn dispatcher(store: &Arc<jobwatch_storage::MemoryJobStore>, sink: &Arc<RecordingSink>) -> AlertDispatcher {
        AlertDispatcher::new(
            store.clone(),
            vec![sink.clone() as Arc<dyn NotificationSink>],
            chrono::Duration::hours(DEFAULT_ALERT_COOLDOWN_HOURS.into()),
        )
    }

    #[tokio::test]
    async fn dispatch_skips_jobs_announced_within_cooldown() {
        let store = Arc::new(jobwatch_storage::MemoryJobStore::new());
        let sink = Arc::new(RecordingSink::default());
        let alerts = dispatcher(&store, &sink);
        let t = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).single().unwrap();
        let (a, b) = (job("1", None), job("2", None));

        assert_eq!(alerts.dispatch(&notification(vec![a.clone()], vec![]), t).await, 1);
        assert_eq!(
            alerts
                .dispatch(&notification(vec![b.clone()], vec![a.clone()]), t + chrono::Duration::hours(1))
                .await,
            1
        );
        // Only `a` again, still inside the window: nothing to send.
        assert_eq!(
            alerts
                .dispatch(&notification(vec![], vec![a.clone()]), t + chrono::Duration::hours(2))
                .await,
            0
        );
        assert_eq!(
            alerts
                .dispatch(&notification(vec![], vec![a.clone()]), t + chrono::Duration::hours(25))
                .await,
            1
        );

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].new_jobs[0].id, b.id);
        assert!(seen[1].updated_jobs.is_empty());
        assert_eq!(seen[2].updated_jobs[0].id, a.id);

        let logged = store.alerts().await;
        assert_eq!(logged.len(), 3);
        assert_eq!(logged[2].kind, AlertKind::Updated);
    }

    #[tokio::test]
    async fn failed_delivery_is_logged_and_retried_next_time() {
        let store = Arc::new(jobwatch_storage::MemoryJobStore::new());
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let alerts = dispatcher(&store, &sink);
        let t = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).single().unwrap();
        let note = notification(vec![job("1", None)], vec![]);

        assert_eq!(alerts.dispatch(&note, t).await, 0);
        assert_eq!(alerts.dispatch(&note, t + chrono::Duration::minutes(5)).await, 0);
        assert_eq!(sink.seen.lock().unwrap().len(), 2);

        let logged = store.alerts().await;
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|a| a.status == jobwatch_core::AlertStatus::Failed));
        assert_eq!(logged[0].error.as_deref(), Some("webhook returned 500"));
    }
}
