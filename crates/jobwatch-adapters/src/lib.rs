//! Source adapter contract and the ATS / careers-page adapters behind it.
//!
//! Each adapter turns one [`WatchlistTarget`] into a list of [`RawJob`]s. Parsing
//! of source-specific payloads stays inside the adapter; callers only ever see
//! `RawJob` and a classified [`AdapterError`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use jobwatch_core::{AtsType, RawJob, WatchlistTarget};
use jobwatch_storage::{FailureClass, FetchError, HttpFetcher};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod ashby;
mod generic;
mod greenhouse;
mod lever;

pub use ashby::{parse_ashby_board, AshbyAdapter};
pub use generic::{extract_job_links, GenericCareersAdapter, JobLink, MAX_LINKS_PER_PAGE};
pub use greenhouse::{parse_greenhouse_board, GreenhouseAdapter};
pub use lever::{parse_lever_postings, LeverAdapter};

pub const CRATE_NAME: &str = "jobwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {adapter} payload: {message}")]
    Payload {
        adapter: &'static str,
        message: String,
    },
    #[error("{company} has no careers url configured")]
    MissingCareersUrl { company: String },
    #[error("fixture unavailable: {0:#}")]
    Fixture(anyhow::Error),
}

impl AdapterError {
    pub fn payload(adapter: &'static str, message: impl Into<String>) -> Self {
        AdapterError::Payload {
            adapter,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            AdapterError::Fetch(err) => err.class(),
            AdapterError::Payload { .. } => FailureClass::Malformed,
            AdapterError::MissingCareersUrl { .. } | AdapterError::Fixture(_) => {
                FailureClass::InvalidEndpoint
            }
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source name stamped on every produced `RawJob`.
    fn source(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError>;
}

/// Reads pre-captured `RawJob` records from a JSON file; used for offline runs and tests.
/// The target's `careers_url` names the file, relative to `root` unless absolute.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    root: PathBuf,
}

impl FixtureAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let rel = target
            .careers_url
            .as_deref()
            .ok_or_else(|| AdapterError::MissingCareersUrl {
                company: target.company.clone(),
            })?;
        let path = self.root.join(rel);
        let mut jobs: Vec<RawJob> = read_json_file(&path).map_err(AdapterError::Fixture)?;
        for job in &mut jobs {
            if job.country.is_none() {
                job.country = target.country.clone();
            }
        }
        Ok(jobs)
    }
}

/// Maps a target's ATS type to its adapter. `fixture_root` anchors fixture paths.
pub fn adapter_for_target(target: &WatchlistTarget, fixture_root: &Path) -> Arc<dyn SourceAdapter> {
    match target.ats_type {
        AtsType::Greenhouse => Arc::new(GreenhouseAdapter),
        AtsType::Lever => Arc::new(LeverAdapter),
        AtsType::Ashby => Arc::new(AshbyAdapter),
        AtsType::Generic => Arc::new(GenericCareersAdapter),
        AtsType::Fixture => Arc::new(FixtureAdapter::new(fixture_root)),
    }
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Board slug: last path segment of a careers URL on `host`, else derived from the
/// company name with spaces replaced by `space` and dots dropped.
pub(crate) fn board_slug(target: &WatchlistTarget, host: &str, space: &str) -> String {
    if let Some(url) = target.careers_url.as_deref().filter(|u| u.contains(host)) {
        let trimmed = url.trim_end_matches('/');
        let path = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
        if let Some(last) = path.rsplit('/').next().filter(|s| !s.is_empty()) {
            return last.to_string();
        }
    }
    target
        .company
        .to_lowercase()
        .replace(' ', space)
        .replace('.', "")
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Ids arrive as numbers on some boards and strings on others.
pub(crate) fn json_id(value: &JsonValue) -> Option<String> {
    match value.get("id")? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn mentions_remote(location: Option<&str>) -> bool {
    location
        .map(|l| l.to_lowercase().contains("remote"))
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_storage::HttpClientConfig;
    use test_support::workspace_root;

    #[test]
    fn slug_comes_from_matching_careers_url_or_company_name() {
        let target = WatchlistTarget::new("Two Sigma", AtsType::Lever)
            .with_careers_url("https://jobs.lever.co/twosigma/");
        assert_eq!(board_slug(&target, "lever.co", ""), "twosigma");

        let target = WatchlistTarget::new("Hudson River Trading", AtsType::Greenhouse);
        assert_eq!(board_slug(&target, "greenhouse.io", "-"), "hudson-river-trading");

        let target = WatchlistTarget::new("Scale.AI", AtsType::Ashby)
            .with_careers_url("https://scale.com/careers");
        assert_eq!(board_slug(&target, "ashbyhq.com", "-"), "scaleai");
    }

    #[test]
    fn error_classes_drive_retryability() {
        let blocked = AdapterError::Fetch(FetchError::HttpStatus {
            status: 403,
            url: "https://boards-api.greenhouse.io/v1/boards/x/jobs".into(),
            class: FailureClass::Blocked,
        });
        assert!(!blocked.is_retryable());

        let flaky = AdapterError::Fetch(FetchError::HttpStatus {
            status: 503,
            url: "https://api.lever.co/v0/postings/x".into(),
            class: FailureClass::Transient,
        });
        assert!(flaky.is_retryable());

        assert!(!AdapterError::payload("lever", "expected array").is_retryable());
        assert_eq!(
            AdapterError::MissingCareersUrl { company: "X".into() }.class(),
            FailureClass::InvalidEndpoint
        );
    }

    #[test]
    fn registry_covers_every_ats_type() {
        let root = workspace_root();
        for (ats, source) in [
            (AtsType::Greenhouse, "greenhouse"),
            (AtsType::Lever, "lever"),
            (AtsType::Ashby, "ashby"),
            (AtsType::Generic, "generic"),
            (AtsType::Fixture, "fixture"),
        ] {
            let adapter = adapter_for_target(&WatchlistTarget::new("Acme", ats), &root);
            assert_eq!(adapter.source(), source);
        }
    }

    #[tokio::test]
    async fn fixture_adapter_reads_raw_jobs_and_applies_country_hint() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let mut target = WatchlistTarget::new("Citadel", AtsType::Fixture)
            .with_careers_url("fixtures/sample/raw_jobs.json");
        target.country = Some("us".into());

        let adapter = FixtureAdapter::new(workspace_root());
        let jobs = adapter.fetch(&http, &target).await.unwrap();
        assert!(!jobs.is_empty());
        assert!(jobs.iter().all(|j| j.country.is_some()));
    }

    #[tokio::test]
    async fn fixture_adapter_without_path_is_not_retryable() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let target = WatchlistTarget::new("Citadel", AtsType::Fixture);
        let err = FixtureAdapter::new(workspace_root())
            .fetch(&http, &target)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
