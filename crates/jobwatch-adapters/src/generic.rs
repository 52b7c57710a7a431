use std::collections::HashSet;

use async_trait::async_trait;
use jobwatch_core::{RawJob, WatchlistTarget};
use jobwatch_storage::HttpFetcher;
use reqwest::Url;
use scraper::{Html, Selector};
use serde_json::json;
use tracing::info;

use crate::{text_or_none, AdapterError, SourceAdapter};

const SOURCE: &str = "generic";

/// Upper bound on postings taken from one careers page.
pub const MAX_LINKS_PER_PAGE: usize = 50;

const LINK_SELECTORS: [&str; 8] = [
    "a[href*=\"job\"]",
    "a[href*=\"career\"]",
    "a[href*=\"position\"]",
    "a[href*=\"opening\"]",
    ".job-listing a",
    ".job-item a",
    ".career-listing a",
    "[data-job-id] a",
];
const LINK_KEYWORDS: [&str; 4] = ["intern", "2026", "graduate", "summer"];
const SOURCE_ID_CHARS: usize = 100;

/// Heuristic scraper for static company careers pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericCareersAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLink {
    pub title: String,
    pub url: String,
}

#[async_trait]
impl SourceAdapter for GenericCareersAdapter {
    fn source(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let careers_url = target
            .careers_url
            .as_deref()
            .ok_or_else(|| AdapterError::MissingCareersUrl {
                company: target.company.clone(),
            })?;

        let page = http.get_text(SOURCE, careers_url).await?;
        let base = Url::parse(&page.final_url)
            .map_err(|e| AdapterError::payload(SOURCE, format!("final url: {e}")))?;
        let links = extract_job_links(&page.body, &base)?;
        info!(company = %target.company, count = links.len(), "careers page scanned");

        Ok(links
            .into_iter()
            .map(|link| link_to_raw_job(target, link))
            .collect())
    }
}

/// Anchors whose text looks like an early-career posting, resolved against `base`.
/// Non-http(s) links are dropped; duplicates by URL (fragment ignored) collapse to the first.
pub fn extract_job_links(html: &str, base: &Url) -> Result<Vec<JobLink>, AdapterError> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for selector in LINK_SELECTORS {
        let sel = Selector::parse(selector).map_err(|e| AdapterError::payload(SOURCE, e.to_string()))?;
        for node in document.select(&sel) {
            let Some(href) = node.value().attr("href") else {
                continue;
            };
            let Some(title) = text_or_none(&node.text().collect::<Vec<_>>().join(" ")) else {
                continue;
            };
            let lowered = title.to_lowercase();
            if !LINK_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                continue;
            }
            let Ok(mut url) = base.join(href.trim()) else {
                continue;
            };
            url.set_fragment(None);
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            if seen.insert(url.to_string()) {
                links.push(JobLink {
                    title: title.split_whitespace().collect::<Vec<_>>().join(" "),
                    url: url.to_string(),
                });
            }
        }
    }

    links.truncate(MAX_LINKS_PER_PAGE);
    Ok(links)
}

fn link_to_raw_job(target: &WatchlistTarget, link: JobLink) -> RawJob {
    RawJob {
        source: SOURCE.to_string(),
        source_id: source_id_for(&link.url),
        company: target.company.clone(),
        title: link.title.clone(),
        location: None,
        remote: false,
        employment_type: Some("internship".to_string()),
        posted_at: None,
        url: link.url.clone(),
        description_html: None,
        description_text: Some(link.title.clone()),
        country: target.country.clone(),
        raw_payload: json!({ "title": link.title, "url": link.url }),
    }
}

/// Stable id derived from the URL: non-alphanumerics become `_`, last 100 chars kept.
fn source_id_for(url: &str) -> String {
    let mapped: Vec<char> = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let start = mapped.len().saturating_sub(SOURCE_ID_CHARS);
    mapped[start..].iter().collect()
}
