//! RawJob -> NormalizedJob: plain-text description plus identity and content hashes.

use std::sync::OnceLock;

use jobwatch_core::hashing::{description_digest, hash_full, hash_stable};
use jobwatch_core::{NormalizedJob, RawJob, DEFAULT_COUNTRY};
use regex::Regex;
use scraper::Html;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{source_name} record has an empty {field}")]
    MissingField {
        source_name: String,
        field: &'static str,
    },
}

/// Stateless; holds no configuration so it can be shared freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, raw: &RawJob) -> Result<NormalizedJob, NormalizeError> {
        let title = raw.title.trim().to_string();
        let company = raw.company.trim().to_string();
        let source_id = raw.source_id.trim().to_string();
        let url = raw.url.trim().to_string();
        for (field, value) in [("title", &title), ("source_id", &source_id), ("url", &url)] {
            if value.is_empty() {
                return Err(NormalizeError::MissingField {
                    source_name: raw.source.clone(),
                    field,
                });
            }
        }

        let description = describe(raw);
        let location = raw
            .location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string);

        let stable = hash_stable(&title, &company, location.as_deref(), &url);
        let full = hash_full(
            &stable,
            raw.employment_type.as_deref(),
            raw.posted_at,
            &description_digest(Some(&description)),
        );

        Ok(NormalizedJob {
            source: raw.source.clone(),
            source_id,
            company,
            title,
            location,
            remote: raw.remote,
            employment_type: raw.employment_type.clone(),
            posted_at: raw.posted_at,
            url,
            description,
            hash_stable: stable,
            hash_full: full,
            category: None,
            tags: Vec::new(),
            country: raw
                .country
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_lowercase)
                .unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
            raw_payload: raw.raw_payload.clone(),
        })
    }
}

fn describe(raw: &RawJob) -> String {
    let text = match (raw.description_html.as_deref(), raw.description_text.as_deref()) {
        (Some(html), _) if !html.trim().is_empty() => html_to_text(html),
        (_, Some(plain)) => plain.to_string(),
        _ => String::new(),
    };
    collapse_blank_lines(&text)
}

/// Markdown rendering of the HTML; headings, lists and links survive as text.
pub fn html_to_text(html: &str) -> String {
    let markdown = htmd::convert(html).unwrap_or_else(|_| {
        let document = Html::parse_fragment(html);
        document.root_element().text().collect::<String>()
    });
    tracking_pixel_re().replace_all(&markdown, "").into_owned()
}

/// Runs of three or more newlines become one blank line; result is trimmed.
pub fn collapse_blank_lines(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    blank_run_re().replace_all(&unified, "\n\n").trim().to_string()
}

fn tracking_pixel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)!\[[^\]]*\]\([^)]*(?:1x1|pixel|beacon|track)[^)]*\)").expect("static regex")
    })
}

fn blank_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("static regex"))
}
