//! Run orchestration: parallel fetch, then one sequential persist stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_adapters::{adapter_for_target, AdapterError, SourceAdapter};
use jobwatch_core::{HealthStatus, HealthSummary, RawJob, RunStats, TargetHealth, WatchlistTarget};
use jobwatch_storage::{BackoffPolicy, HttpFetcher, JobStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::BatchProcessor;
use crate::classifier::Classifier;
use crate::config::{PipelineConfig, Watchlist};
use crate::dedup::JobDeduper;
use crate::filter::JobFilter;
use crate::normalizer::Normalizer;
use crate::notify::{AlertDispatcher, NotificationSink, RunNotification};
use crate::rules::RuleSet;

/// Picks the adapter for a target.
pub type AdapterResolver = Arc<dyn Fn(&WatchlistTarget) -> Arc<dyn SourceAdapter> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fetch, normalize and filter, but persist and notify nothing.
    pub dry_run: bool,
    /// Case-insensitive substring match on the target company.
    pub company_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub stats: RunStats,
    pub new_job_ids: Vec<Uuid>,
    pub updated_job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CleanupReport {
    pub cutoff: DateTime<Utc>,
    pub stale: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub summary: HealthSummary,
    /// Worst first.
    pub targets: Vec<TargetHealth>,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
}

impl TargetError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TargetError::Adapter(err) => err.is_retryable(),
            TargetError::TimedOut(_) => true,
        }
    }
}

struct TargetFetch {
    index: usize,
    target: WatchlistTarget,
    result: Result<Vec<RawJob>, TargetError>,
}

pub struct Runner {
    config: PipelineConfig,
    rules: Arc<RuleSet>,
    http: Arc<HttpFetcher>,
    store: Arc<dyn JobStore>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    resolver: AdapterResolver,
}

impl Runner {
    pub fn new(
        config: PipelineConfig,
        rules: Arc<RuleSet>,
        http: Arc<HttpFetcher>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let fixture_root = config.workspace_root.clone();
        Self {
            config,
            rules,
            http,
            store,
            sinks: Vec::new(),
            resolver: Arc::new(move |target: &WatchlistTarget| adapter_for_target(target, &fixture_root)),
        }
    }

    /// Loads the rules file and builds the shared HTTP client. Both failures are fatal.
    pub fn from_config(config: PipelineConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let rules = RuleSet::load(config.rules_path())?;
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        Ok(Self::new(config, Arc::new(rules), Arc::new(http), store))
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_adapter_resolver(mut self, resolver: AdapterResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reloads the watchlist and runs every enabled target.
    pub async fn run_watchlist(&self, options: &RunOptions) -> Result<RunReport> {
        let watchlist = Watchlist::load(self.config.watchlist_path())?;
        let targets: Vec<WatchlistTarget> = watchlist.enabled().cloned().collect();
        Ok(self.run(&targets, options).await)
    }

    /// One full ingestion pass. Per-target and per-job failures are counted in
    /// the stats and never abort the run.
    pub async fn run(&self, targets: &[WatchlistTarget], options: &RunOptions) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id, dry_run = options.dry_run);
        async {
            let selected = select_targets(targets, options.company_filter.as_deref());
            info!(targets = selected.len(), "starting run");

            let fetched = self.fetch_all(selected).await;
            if !options.dry_run {
                self.record_health(&fetched).await;
            }
            let mut report = self.persist(run_id, started_at, fetched, options).await;
            report.finished_at = Utc::now();

            if !options.dry_run && (!report.new_job_ids.is_empty() || !report.updated_job_ids.is_empty()) {
                report.stats.notifications_sent = self.send_notifications(&report).await;
            }

            let stats = &report.stats;
            info!(
                companies = stats.companies_processed,
                fetched = stats.jobs_fetched,
                filtered = stats.jobs_filtered,
                invalid = stats.jobs_invalid,
                new = stats.jobs_new,
                updated = stats.jobs_updated,
                duplicates = stats.duplicates_flagged,
                errors = stats.errors,
                "run complete"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn fetch_all(&self, targets: Vec<WatchlistTarget>) -> Vec<TargetFetch> {
        let permits = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let timeout = self.config.fetch_timeout();
        let backoff = self.config.backoff();
        let mut tasks = JoinSet::new();

        for (index, target) in targets.into_iter().enumerate() {
            let permits = permits.clone();
            let http = self.http.clone();
            let adapter = (self.resolver)(&target);
            let span = info_span!("target", company = %target.company, ats = %target.ats_type);
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    let result = fetch_with_retry(adapter.as_ref(), &http, &target, timeout, backoff).await;
                    TargetFetch { index, target, result }
                }
                .instrument(span),
            );
        }

        let mut fetched = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(fetch) => fetched.push(fetch),
                Err(err) => error!(error = %err, "fetch task aborted"),
            }
        }
        // Persist in watchlist order regardless of completion order.
        fetched.sort_by_key(|f| f.index);
        fetched
    }

    /// Folds each fetch outcome into the stored health record for its target.
    async fn record_health(&self, fetched: &[TargetFetch]) {
        let now = Utc::now();
        for fetch in fetched {
            let target = &fetch.target;
            let ats = target.ats_type.as_str();
            let mut health = match self.store.find_target_health(&target.company, ats).await {
                Ok(Some(health)) => health,
                Ok(None) => TargetHealth::new(&target.company, ats, target.careers_url.clone(), now),
                Err(err) => {
                    warn!(company = %target.company, error = %err, "loading target health failed");
                    continue;
                }
            };
            if target.careers_url.is_some() {
                health.url = target.careers_url.clone();
            }
            match &fetch.result {
                Ok(jobs) => health.record_success(jobs.len(), now),
                Err(err) => health.record_failure(&err.to_string(), now),
            }
            if matches!(health.status, HealthStatus::Degraded | HealthStatus::Failed) {
                warn!(
                    company = %target.company,
                    ats,
                    status = %health.status,
                    failures = health.failure_count,
                    "target unhealthy"
                );
            }
            if let Err(err) = self.store.save_target_health(&health).await {
                warn!(company = %target.company, error = %err, "saving target health failed");
            }
        }
    }

    /// Stored health records with at least `min_failures` consecutive failures.
    pub async fn health(&self, min_failures: u32) -> Result<HealthReport> {
        let all = self
            .store
            .list_target_health()
            .await
            .context("listing target health")?;
        let summary = HealthSummary::from_records(&all);
        let targets = all
            .into_iter()
            .filter(|health| health.failure_count >= min_failures)
            .collect();
        Ok(HealthReport { summary, targets })
    }

    async fn persist(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        fetched: Vec<TargetFetch>,
        options: &RunOptions,
    ) -> RunReport {
        let normalizer = Normalizer::new();
        let classifier = Classifier::new(&self.rules);
        let filter = JobFilter::new(&self.rules);
        let mut batch = BatchProcessor::new(self.store.clone(), self.config.batch_size);
        let mut stats = RunStats::default();
        let mut dry_run_new = Vec::new();

        for fetch in fetched {
            let raws = match fetch.result {
                Ok(raws) => raws,
                Err(err) => {
                    stats.errors += 1;
                    warn!(company = %fetch.target.company, error = %err, "target failed");
                    continue;
                }
            };
            stats.companies_processed += 1;
            stats.jobs_fetched += raws.len();
            info!(company = %fetch.target.company, jobs = raws.len(), "fetched target");

            for raw in &raws {
                let mut job = match normalizer.normalize(raw) {
                    Ok(job) => job,
                    Err(err) => {
                        stats.jobs_invalid += 1;
                        warn!(company = %raw.company, error = %err, "skipping malformed record");
                        continue;
                    }
                };

                let category = classifier.classify(&job);
                job.category = category.clone();
                let decision = filter.should_include(&job);
                if !decision.include {
                    stats.record_filtered(decision.reason.as_str());
                    debug!(source = %job.source, source_id = %job.source_id, reason = %decision.reason, "filtered");
                    continue;
                }
                let tags = filter.add_tags(&job);

                if options.dry_run {
                    info!(company = %job.company, title = %job.title, ?category, ?tags, "dry run: would upsert");
                    dry_run_new.push(job.key());
                    continue;
                }
                if let Err(err) = batch.add(job, category, tags).await {
                    stats.errors += 1;
                    error!(error = %err, pending = batch.pending(), "batch flush failed");
                }
            }
        }

        if !options.dry_run {
            if let Err(err) = batch.flush().await {
                stats.errors += 1;
                error!(error = %err, lost = batch.pending(), "final flush failed");
            }
        }

        let new_job_ids = batch.new_job_ids().to_vec();
        let updated_job_ids = batch.updated_job_ids().to_vec();
        if options.dry_run {
            stats.jobs_new = dry_run_new.len();
        } else {
            stats.jobs_new = new_job_ids.len();
            stats.jobs_updated = updated_job_ids.len();
            self.flag_duplicates(&new_job_ids, &mut stats).await;
        }

        RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: options.dry_run,
            stats,
            new_job_ids,
            updated_job_ids,
        }
    }

    async fn flag_duplicates(&self, new_job_ids: &[Uuid], stats: &mut RunStats) {
        if new_job_ids.is_empty() {
            return;
        }
        let jobs = match self.store.find_by_ids(new_job_ids).await {
            Ok(jobs) => jobs,
            Err(err) => {
                stats.errors += 1;
                warn!(error = %err, "loading new jobs for duplicate check failed");
                return;
            }
        };
        let deduper = JobDeduper::new(self.store.clone());
        for job in &jobs {
            match deduper
                .find_cross_source_duplicates(job, self.config.duplicate_threshold)
                .await
            {
                Ok(found) if !found.is_empty() => stats.duplicates_flagged += 1,
                Ok(_) => {}
                Err(err) => {
                    stats.errors += 1;
                    warn!(job = %job.key(), error = %err, "duplicate check failed");
                }
            }
        }
    }

    /// Sends one consolidated notification per sink, minus jobs that sink
    /// announced within the cooldown; returns how many sinks accepted it.
    async fn send_notifications(&self, report: &RunReport) -> usize {
        // A job created and then changed in one run is announced as new only.
        let changed: Vec<Uuid> = report
            .updated_job_ids
            .iter()
            .filter(|id| !report.new_job_ids.contains(id))
            .copied()
            .collect();
        let (new_jobs, updated_jobs) = match (
            self.store.find_by_ids(&report.new_job_ids).await,
            self.store.find_by_ids(&changed).await,
        ) {
            (Ok(new_jobs), Ok(updated_jobs)) => (new_jobs, updated_jobs),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "loading jobs for notification failed");
                return 0;
            }
        };
        let notification = RunNotification {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            new_jobs,
            updated_jobs,
            stats: report.stats.clone(),
        };

        AlertDispatcher::new(self.store.clone(), self.sinks.clone(), self.config.alert_cooldown())
            .dispatch(&notification, Utc::now())
            .await
    }

    /// Marks jobs unseen for `days` inactive. Dry runs only count them.
    pub async fn cleanup(&self, days: i64, dry_run: bool) -> Result<CleanupReport> {
        self.cleanup_at(days, dry_run, Utc::now()).await
    }

    pub async fn cleanup_at(&self, days: i64, dry_run: bool, now: DateTime<Utc>) -> Result<CleanupReport> {
        if days < 0 {
            bail!("cleanup window must not be negative, got {days} days");
        }
        let Some(cutoff) = chrono::Duration::try_days(days).and_then(|window| now.checked_sub_signed(window)) else {
            bail!("cleanup window of {days} days is out of range");
        };
        let stale = if dry_run {
            let stale = self.store.find_stale(cutoff).await.context("listing stale jobs")?;
            for job in &stale {
                info!(job = %job.key(), last_seen_at = %job.last_seen_at, "would deactivate");
            }
            stale.len() as u64
        } else {
            self.store
                .deactivate_stale(cutoff)
                .await
                .context("deactivating stale jobs")?
        };
        info!(%cutoff, stale, dry_run, "cleanup complete");
        Ok(CleanupReport { cutoff, stale, dry_run })
    }
}

fn select_targets(targets: &[WatchlistTarget], company_filter: Option<&str>) -> Vec<WatchlistTarget> {
    let needle = company_filter.map(str::to_lowercase);
    targets
        .iter()
        .filter(|t| t.enabled)
        .filter(|t| match &needle {
            Some(needle) => t.company.to_lowercase().contains(needle.as_str()),
            None => true,
        })
        .cloned()
        .collect()
}

/// Fetches one target with a per-attempt timeout, retrying only failures that
/// could plausibly succeed on another attempt.
pub async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    target: &WatchlistTarget,
    timeout: Duration,
    backoff: BackoffPolicy,
) -> Result<Vec<RawJob>, TargetError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(timeout, adapter.fetch(http, target)).await {
            Ok(result) => result.map_err(TargetError::from),
            Err(_) => Err(TargetError::TimedOut(timeout)),
        };
        match result {
            Ok(jobs) => return Ok(jobs),
            Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, ?delay, error = %err, "fetch failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Cron-driven runs; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(runner: Arc<Runner>) -> Result<Option<JobScheduler>> {
    if !runner.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runner.config.cron.clone();
    let job = CronJob::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.run_watchlist(&RunOptions::default()).await {
                Ok(report) => info!(run_id = %report.run_id, new = report.stats.jobs_new, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures::rules;
    use async_trait::async_trait;
    use jobwatch_core::AtsType;
    use jobwatch_storage::{FailureClass, FetchError, HttpClientConfig, MemoryJobStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn raw(source_id: &str, title: &str, location: &str) -> RawJob {
        RawJob {
            source: "stub".into(),
            source_id: source_id.into(),
            company: "Jane Street".into(),
            title: title.into(),
            location: Some(location.into()),
            remote: false,
            employment_type: Some("Internship".into()),
            posted_at: None,
            url: format!("https://stub.example/{source_id}"),
            description_html: None,
            description_text: Some("OCaml all day.".into()),
            country: None,
            raw_payload: serde_json::Value::Null,
        }
    }

    /// Serves scripted responses per attempt, then repeats the last one.
    struct StubAdapter {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<Vec<RawJob>, FailureClass>>>,
    }

    impl StubAdapter {
        fn new(script: Vec<Result<Vec<RawJob>, FailureClass>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source(&self) -> &'static str {
            "stub"
        }

        async fn fetch(&self, _http: &HttpFetcher, _target: &WatchlistTarget) -> Result<Vec<RawJob>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0].clone()
                }
            };
            next.map_err(|class| {
                AdapterError::Fetch(FetchError::HttpStatus {
                    status: if class == FailureClass::NotFound { 404 } else { 503 },
                    url: "https://stub.example".into(),
                    class,
                })
            })
        }
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    fn runner_with(store: Arc<MemoryJobStore>, adapter: Arc<StubAdapter>) -> Runner {
        let resolver: AdapterResolver = Arc::new(move |_: &WatchlistTarget| adapter.clone() as Arc<dyn SourceAdapter>);
        Runner::new(PipelineConfig::default(), Arc::new(rules()), http(), store).with_adapter_resolver(resolver)
    }

    fn target(company: &str) -> WatchlistTarget {
        WatchlistTarget::new(company, AtsType::Greenhouse).with_careers_url("https://stub.example")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_succeed() {
        let adapter = StubAdapter::new(vec![
            Err(FailureClass::Transient),
            Ok(vec![raw("1", "Software Engineer Intern", "New York, NY")]),
        ]);
        let jobs = fetch_with_retry(
            adapter.as_ref(),
            &http(),
            &target("Jane Street"),
            Duration::from_secs(60),
            BackoffPolicy::default(),
        )
        .await
        .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_budget() {
        let adapter = StubAdapter::new(vec![Err(FailureClass::Transient)]);
        let err = fetch_with_retry(
            adapter.as_ref(),
            &http(),
            &target("Jane Street"),
            Duration::from_secs(60),
            BackoffPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let adapter = StubAdapter::new(vec![Err(FailureClass::NotFound)]);
        let err = fetch_with_retry(
            adapter.as_ref(),
            &http(),
            &target("Jane Street"),
            Duration::from_secs(60),
            BackoffPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_target_is_counted_and_run_continues() {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = StubAdapter::new(vec![Err(FailureClass::Blocked)]);
        let runner = runner_with(store.clone(), adapter);
        let report = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.companies_processed, 0);
        assert!(store.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn run_counts_pipeline_outcomes() {
        let store = Arc::new(MemoryJobStore::new());
        let invalid = raw("", "Broken", "New York, NY");
        let adapter = StubAdapter::new(vec![Ok(vec![
            raw("1", "Software Engineer Intern", "New York, NY"),
            raw("2", "Senior Software Engineer Intern", "New York, NY"),
            raw("3", "Software Engineer Intern", "Toronto, Canada"),
            invalid,
        ])]);
        let runner = runner_with(store.clone(), adapter);

        let report = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        let stats = &report.stats;
        assert_eq!(stats.companies_processed, 1);
        assert_eq!(stats.jobs_fetched, 4);
        assert_eq!(stats.jobs_invalid, 1);
        assert_eq!(stats.jobs_filtered, 2);
        assert_eq!(stats.filter_reasons["negative_keywords"], 1);
        assert_eq!(stats.filter_reasons["location_excluded"], 1);
        assert_eq!(stats.jobs_new, 1);

        let stored = store.jobs().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].category.as_deref(), Some("swe"));
        assert_eq!(stored[0].tags, ["internship", "swe"]);

        // Second pass sees the same content: nothing new, nothing updated.
        let again = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        assert_eq!(again.stats.jobs_new, 0);
        assert_eq!(again.stats.jobs_updated, 0);
    }

    #[tokio::test]
    async fn dry_run_persists_nothing_and_counts_passing_as_new() {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = StubAdapter::new(vec![Ok(vec![raw("1", "Software Engineer Intern", "New York, NY")])]);
        let runner = runner_with(store.clone(), adapter);
        let options = RunOptions {
            dry_run: true,
            company_filter: None,
        };
        let report = runner.run(&[target("Jane Street")], &options).await;
        assert_eq!(report.stats.jobs_new, 1);
        assert_eq!(report.stats.notifications_sent, 0);
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn company_filter_is_case_insensitive_substring() {
        let targets = [target("Jane Street"), target("Citadel Securities"), target("Citadel")];
        let selected = select_targets(&targets, Some("citadel"));
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|t| t.company.contains("Citadel")));
    }

    #[tokio::test]
    async fn cleanup_respects_dry_run() {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = StubAdapter::new(vec![Ok(vec![raw("1", "Software Engineer Intern", "New York, NY")])]);
        let runner = runner_with(store.clone(), adapter);
        runner.run(&[target("Jane Street")], &RunOptions::default()).await;

        let later = Utc::now() + chrono::Duration::days(45);
        let preview = runner.cleanup_at(30, true, later).await.unwrap();
        assert_eq!(preview.stale, 1);
        assert!(store.jobs().await[0].is_active);

        let applied = runner.cleanup_at(30, false, later).await.unwrap();
        assert_eq!(applied.stale, 1);
        assert!(!store.jobs().await[0].is_active);
    }

    #[tokio::test]
    async fn cleanup_rejects_out_of_range_windows() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = runner_with(store, StubAdapter::new(vec![Ok(vec![])]));
        assert!(runner.cleanup_at(i64::MAX, true, Utc::now()).await.is_err());
        assert!(runner.cleanup_at(-1, false, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn failed_auto_flush_counts_one_error_then_final_flush_another() {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = StubAdapter::new(vec![Ok((1..=5)
            .map(|i| raw(&i.to_string(), "Software Engineer Intern", "New York, NY"))
            .collect())]);
        let resolver: AdapterResolver = Arc::new(move |_: &WatchlistTarget| adapter.clone() as Arc<dyn SourceAdapter>);
        let config = PipelineConfig {
            batch_size: 2,
            ..PipelineConfig::default()
        };
        let runner = Runner::new(config, Arc::new(rules()), http(), store.clone()).with_adapter_resolver(resolver);
        store.fail_next_commits(100);

        let report = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        assert_eq!(report.stats.errors, 2);
        assert_eq!(report.stats.jobs_new, 0);
        // One lookup for the failed auto-flush, one for the final flush.
        assert_eq!(store.lookup_count(), 2);
        assert_eq!(store.commit_count(), 0);
        assert!(store.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_outcomes_update_target_health() {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = StubAdapter::new(vec![
            Err(FailureClass::NotFound),
            Ok(vec![raw("1", "Software Engineer Intern", "New York, NY")]),
        ]);
        let runner = runner_with(store.clone(), adapter);

        runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        let failing = store.find_target_health("Jane Street", "greenhouse").await.unwrap().unwrap();
        assert_eq!(failing.status, HealthStatus::Unstable);
        assert_eq!(failing.failure_count, 1);
        assert!(failing.last_error.is_some());
        assert_eq!(failing.url.as_deref(), Some("https://stub.example"));

        let report = runner.health(1).await.unwrap();
        assert_eq!(report.summary.degraded, 1);
        assert_eq!(report.targets.len(), 1);

        runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        let recovered = store.find_target_health("Jane Street", "greenhouse").await.unwrap().unwrap();
        assert_eq!(recovered.status, HealthStatus::Healthy);
        assert_eq!(recovered.failure_count, 0);
        assert_eq!(recovered.success_count, 1);
        assert!(runner.health(1).await.unwrap().targets.is_empty());
        assert_eq!(runner.health(0).await.unwrap().summary.healthy, 1);
    }

    #[tokio::test]
    async fn dry_run_leaves_target_health_alone() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = runner_with(store.clone(), StubAdapter::new(vec![Err(FailureClass::Blocked)]));
        let options = RunOptions {
            dry_run: true,
            company_filter: None,
        };
        runner.run(&[target("Jane Street")], &options).await;
        assert!(store.list_target_health().await.unwrap().is_empty());
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<RunNotification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, notification: &RunNotification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_announced_within_cooldown_are_not_announced_again() {
        let store = Arc::new(MemoryJobStore::new());
        let mut changed = raw("a", "Software Engineer Intern", "New York, NY");
        changed.description_text = Some("OCaml and some Rust.".into());
        let adapter = StubAdapter::new(vec![
            Ok(vec![raw("a", "Software Engineer Intern", "New York, NY")]),
            Ok(vec![changed, raw("b", "Quant Trader Intern", "New York, NY")]),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let runner = runner_with(store.clone(), adapter).with_sink(sink.clone());

        let first = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        assert_eq!(first.stats.notifications_sent, 1);

        let second = runner.run(&[target("Jane Street")], &RunOptions::default()).await;
        assert_eq!(second.stats.jobs_new, 1);
        assert_eq!(second.stats.jobs_updated, 1);
        assert_eq!(second.stats.notifications_sent, 1);

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].new_jobs[0].source_id, "a");
        assert_eq!(seen[1].new_jobs.len(), 1);
        assert_eq!(seen[1].new_jobs[0].source_id, "b");
        assert!(seen[1].updated_jobs.is_empty());
        drop(seen);

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.channel == "recording"));
    }
}
