use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{RawJob, WatchlistTarget};
use jobwatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{board_slug, json_id, json_str, mentions_remote, text_or_none, AdapterError, SourceAdapter};

const SOURCE: &str = "ashby";

/// Ashby public posting API.
#[derive(Debug, Clone, Copy, Default)]
pub struct AshbyAdapter;

#[async_trait]
impl SourceAdapter for AshbyAdapter {
    fn source(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let slug = board_slug(target, "ashbyhq.com", "-");
        let url = format!("https://api.ashbyhq.com/posting-api/job-board/{slug}");
        let payload: JsonValue = http.get_json(SOURCE, &url).await?;
        let jobs = parse_ashby_board(target, &payload)?;
        info!(company = %target.company, count = jobs.len(), "ashby board fetched");
        Ok(jobs)
    }
}

pub fn parse_ashby_board(
    target: &WatchlistTarget,
    payload: &JsonValue,
) -> Result<Vec<RawJob>, AdapterError> {
    let listings = payload
        .get("jobs")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::payload(SOURCE, "missing `jobs` array"))?;

    Ok(listings
        .iter()
        .filter(|item| item.get("isListed").and_then(JsonValue::as_bool).unwrap_or(true))
        .filter_map(|item| {
            let job = parse_job(target, item);
            if job.is_none() {
                warn!(company = %target.company, id = ?item.get("id"), "skipping unparseable ashby posting");
            }
            job
        })
        .collect())
}

fn parse_job(target: &WatchlistTarget, item: &JsonValue) -> Option<RawJob> {
    let source_id = json_id(item)?;
    let title = json_str(item, &["title"]).and_then(text_or_none)?;
    let location = json_str(item, &["location"]).and_then(text_or_none);
    let remote = item
        .get("isRemote")
        .and_then(JsonValue::as_bool)
        .unwrap_or_else(|| mentions_remote(location.as_deref()));
    let posted_at = json_str(item, &["publishedAt"])
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(RawJob {
        source: SOURCE.to_string(),
        source_id,
        company: target.company.clone(),
        title,
        location,
        remote,
        employment_type: json_str(item, &["employmentType"]).and_then(text_or_none),
        posted_at,
        url: json_str(item, &["jobUrl"]).unwrap_or_default().to_string(),
        description_html: json_str(item, &["descriptionHtml"]).and_then(text_or_none),
        description_text: json_str(item, &["descriptionPlain"]).and_then(text_or_none),
        country: target.country.clone(),
        raw_payload: item.clone(),
    })
}
