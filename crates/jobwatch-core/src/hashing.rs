//! Identity and content fingerprints used for dedup and change detection.
//!
//! Everything here is a pure function of its inputs: no randomness and no
//! dependence on map iteration order, so hashes stay stable across runs.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Normalized description prefix that feeds the description digest.
pub const DESCRIPTION_DIGEST_CHARS: usize = 2000;

const US_SUFFIXES: [&str; 3] = ["united states", "usa", "us"];
const UK_SUFFIXES: [&str; 2] = ["united kingdom", "uk"];
const MARKUP_CHARS: [char; 8] = ['#', '*', '_', '`', '[', ']', '(', ')'];
const TITLE_SEPARATORS: [char; 4] = ['-', '/', '\u{2013}', '\u{2014}'];
const TITLE_NOISE: [&str; 8] = [
    "intern",
    "interns",
    "internship",
    "summer",
    "fall",
    "autumn",
    "winter",
    "spring",
];

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercases, collapses whitespace runs to one space and trims.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `normalize_text` plus trailing country suffix removal and whole-string
/// city abbreviation expansion.
pub fn normalize_location(location: &str) -> String {
    let mut normalized = normalize_text(location);
    if let Some(stripped) = strip_country_suffix(&normalized, &US_SUFFIXES) {
        normalized = stripped;
    }
    if let Some(stripped) = strip_country_suffix(&normalized, &UK_SUFFIXES) {
        normalized = stripped;
    }

    match normalized.as_str() {
        "nyc" => "new york".to_string(),
        "sf" => "san francisco".to_string(),
        "la" => "los angeles".to_string(),
        _ => normalized,
    }
}

/// Strips `, <suffix>` from the end; the comma is required so "campus" keeps its "us".
fn strip_country_suffix(location: &str, suffixes: &[&str]) -> Option<String> {
    suffixes.iter().find_map(|suffix| {
        let head = location.strip_suffix(suffix)?.trim_end();
        head.strip_suffix(',').map(ToString::to_string)
    })
}

/// Lowercased URL without query string or fragment.
pub fn normalize_url(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].trim().to_lowercase()
}

/// Identity fingerprint. Must not see description, posting date or employment type.
pub fn hash_stable(title: &str, company: &str, location: Option<&str>, url: &str) -> String {
    let combined = format!(
        "{}|{}|{}|{}",
        normalize_text(title),
        normalize_text(company),
        normalize_location(location.unwrap_or_default()),
        normalize_url(url)
    );
    sha256_hex(&combined)
}

/// Digest of the first 2000 normalized characters of a description with markup
/// punctuation removed. An absent description hashes the empty string.
pub fn description_digest(description: Option<&str>) -> String {
    let stripped: String = description
        .unwrap_or_default()
        .chars()
        .filter(|c| !MARKUP_CHARS.contains(c))
        .collect();
    let truncated: String = normalize_text(&stripped)
        .chars()
        .take(DESCRIPTION_DIGEST_CHARS)
        .collect();
    sha256_hex(&truncated)
}

/// Content fingerprint: identity plus every mutable field.
pub fn hash_full(
    hash_stable: &str,
    employment_type: Option<&str>,
    posted_at: Option<DateTime<Utc>>,
    description_digest: &str,
) -> String {
    let combined = format!(
        "{}|{}|{}|{}",
        hash_stable,
        normalize_text(employment_type.unwrap_or_default()),
        posted_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        description_digest
    );
    sha256_hex(&combined)
}

/// |A ∩ B| / |A ∪ B|; two empty sets agree fully.
pub fn jaccard_similarity<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Title tokens for cross-source similarity, with internship and season/year
/// markers removed so "ML Intern Summer 2026" and "ML Internship 2026" agree.
pub fn tokenize_title(title: &str) -> HashSet<String> {
    normalize_text(title)
        .split(|c: char| c.is_whitespace() || TITLE_SEPARATORS.contains(&c))
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|token| !is_title_noise(token))
        .filter(|token| token.chars().count() > 2)
        .map(ToString::to_string)
        .collect()
}

fn is_title_noise(token: &str) -> bool {
    TITLE_NOISE.contains(&token) || is_year(token)
}

fn is_year(token: &str) -> bool {
    token.len() == 4
        && token.chars().all(|c| c.is_ascii_digit())
        && (token.starts_with("19") || token.starts_with("20"))
}
