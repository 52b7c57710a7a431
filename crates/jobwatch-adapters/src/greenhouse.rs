use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{RawJob, WatchlistTarget};
use jobwatch_storage::HttpFetcher;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{board_slug, json_id, json_str, mentions_remote, text_or_none, AdapterError, SourceAdapter};

const SOURCE: &str = "greenhouse";

/// Greenhouse public job board API.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreenhouseAdapter;

#[async_trait]
impl SourceAdapter for GreenhouseAdapter {
    fn source(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let slug = board_slug(target, "greenhouse.io", "-");
        let url = format!("https://boards-api.greenhouse.io/v1/boards/{slug}/jobs?content=true");
        let payload: JsonValue = http.get_json(SOURCE, &url).await?;
        let jobs = parse_greenhouse_board(target, &payload)?;
        info!(company = %target.company, count = jobs.len(), "greenhouse board fetched");
        Ok(jobs)
    }
}

/// Parses a `/v1/boards/{slug}/jobs` payload. Postings missing an id or title are skipped.
pub fn parse_greenhouse_board(
    target: &WatchlistTarget,
    payload: &JsonValue,
) -> Result<Vec<RawJob>, AdapterError> {
    let listings = payload
        .get("jobs")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::payload(SOURCE, "missing `jobs` array"))?;

    Ok(listings
        .iter()
        .filter_map(|item| {
            let job = parse_job(target, item);
            if job.is_none() {
                warn!(company = %target.company, id = ?item.get("id"), "skipping unparseable greenhouse posting");
            }
            job
        })
        .collect())
}

fn parse_job(target: &WatchlistTarget, item: &JsonValue) -> Option<RawJob> {
    let source_id = json_id(item)?;
    let title = json_str(item, &["title"]).and_then(text_or_none)?;
    let location = json_str(item, &["location", "name"]).and_then(text_or_none);
    let posted_at = json_str(item, &["updated_at"])
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    Some(RawJob {
        source: SOURCE.to_string(),
        source_id,
        company: target.company.clone(),
        title,
        remote: mentions_remote(location.as_deref()),
        location,
        employment_type: None,
        posted_at,
        url: json_str(item, &["absolute_url"]).unwrap_or_default().to_string(),
        description_html: json_str(item, &["content"]).map(unescape_entities),
        description_text: None,
        country: target.country.clone(),
        raw_payload: item.clone(),
    })
}

/// Greenhouse ships `content` entity-escaped (`&lt;p&gt;`); the text of the parsed
/// fragment is the real markup.
fn unescape_entities(content: &str) -> String {
    if !content.contains("&lt;") {
        return content.to_string();
    }
    Html::parse_fragment(content).root_element().text().collect()
}
