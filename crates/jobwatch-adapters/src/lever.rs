use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{RawJob, WatchlistTarget};
use jobwatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{board_slug, json_id, json_str, mentions_remote, text_or_none, AdapterError, SourceAdapter};

const SOURCE: &str = "lever";

/// Lever postings API (`mode=json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct LeverAdapter;

#[async_trait]
impl SourceAdapter for LeverAdapter {
    fn source(&self) -> &'static str {
        SOURCE
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        target: &WatchlistTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let slug = board_slug(target, "lever.co", "");
        let url = format!("https://api.lever.co/v0/postings/{slug}?mode=json");
        let payload: JsonValue = http.get_json(SOURCE, &url).await?;
        let jobs = parse_lever_postings(target, &payload)?;
        info!(company = %target.company, count = jobs.len(), "lever postings fetched");
        Ok(jobs)
    }
}

/// Parses the top-level postings array.
pub fn parse_lever_postings(
    target: &WatchlistTarget,
    payload: &JsonValue,
) -> Result<Vec<RawJob>, AdapterError> {
    let listings = payload
        .as_array()
        .ok_or_else(|| AdapterError::payload(SOURCE, "expected a postings array"))?;

    Ok(listings
        .iter()
        .filter_map(|item| {
            let job = parse_posting(target, item);
            if job.is_none() {
                warn!(company = %target.company, id = ?item.get("id"), "skipping unparseable lever posting");
            }
            job
        })
        .collect())
}

fn parse_posting(target: &WatchlistTarget, item: &JsonValue) -> Option<RawJob> {
    let source_id = json_id(item)?;
    let title = json_str(item, &["text"]).and_then(text_or_none)?;
    let location = json_str(item, &["categories", "location"]).and_then(text_or_none);
    let remote = mentions_remote(location.as_deref())
        || json_str(item, &["workplaceType"]).is_some_and(|w| w.eq_ignore_ascii_case("remote"));
    let posted_at = item
        .get("createdAt")
        .and_then(JsonValue::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    Some(RawJob {
        source: SOURCE.to_string(),
        source_id,
        company: target.company.clone(),
        title,
        location,
        remote,
        employment_type: json_str(item, &["categories", "commitment"]).and_then(text_or_none),
        posted_at,
        url: json_str(item, &["hostedUrl"]).unwrap_or_default().to_string(),
        description_html: description_html(item),
        description_text: json_str(item, &["descriptionPlain"]).and_then(text_or_none),
        country: target.country.clone(),
        raw_payload: item.clone(),
    })
}

/// Opening description followed by each titled list section.
fn description_html(item: &JsonValue) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(intro) = json_str(item, &["description"]).and_then(text_or_none) {
        parts.push(intro);
    }
    for list in item.get("lists").and_then(JsonValue::as_array).into_iter().flatten() {
        let Some(content) = json_str(list, &["content"]).and_then(text_or_none) else {
            continue;
        };
        match json_str(list, &["text"]).and_then(text_or_none) {
            Some(heading) => parts.push(format!("<h3>{heading}</h3><ul>{content}</ul>")),
            None => parts.push(format!("<ul>{content}</ul>")),
        }
    }
    if let Some(extra) = json_str(item, &["additional"]).and_then(text_or_none) {
        parts.push(extra);
    }
    (!parts.is_empty()).then(|| parts.join("\n"))
}
