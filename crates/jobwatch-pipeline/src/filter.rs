//! Include/exclude decision and tag assignment.
//!
//! Checks run in a fixed order and stop at the first failure, so the reported
//! reason is always the earliest one: internship, negative keywords, location,
//! sponsorship.

use std::fmt;

use jobwatch_core::NormalizedJob;
use serde::{Deserialize, Serialize};

use crate::rules::{any_match, FilterRules, RuleSet};

pub const INTERNSHIP_TAG: &str = "internship";
pub const REMOTE_TAG: &str = "remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    Passed,
    NotInternship,
    NegativeKeywords,
    LocationExcluded,
    NoVisaSponsorship,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::Passed => "passed",
            FilterReason::NotInternship => "not_internship",
            FilterReason::NegativeKeywords => "negative_keywords",
            FilterReason::LocationExcluded => "location_excluded",
            FilterReason::NoVisaSponsorship => "no_visa_sponsorship",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDecision {
    pub include: bool,
    pub reason: FilterReason,
}

impl FilterDecision {
    fn pass() -> Self {
        Self {
            include: true,
            reason: FilterReason::Passed,
        }
    }

    fn reject(reason: FilterReason) -> Self {
        Self {
            include: false,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobFilter<'r> {
    rules: &'r FilterRules,
}

impl<'r> JobFilter<'r> {
    pub fn new(rules: &'r RuleSet) -> Self {
        Self { rules: &rules.filter }
    }

    pub fn should_include(&self, job: &NormalizedJob) -> FilterDecision {
        if !self.is_internship(job) {
            return FilterDecision::reject(FilterReason::NotInternship);
        }
        if self.has_negative_keywords(job) {
            return FilterDecision::reject(FilterReason::NegativeKeywords);
        }
        if !self.location_allowed(job) {
            return FilterDecision::reject(FilterReason::LocationExcluded);
        }
        if self.lacks_sponsorship(job) {
            return FilterDecision::reject(FilterReason::NoVisaSponsorship);
        }
        FilterDecision::pass()
    }

    /// Tags in a stable order: internship, season tags, category, remote.
    pub fn add_tags(&self, job: &NormalizedJob) -> Vec<String> {
        let mut tags = Vec::new();
        if self.is_internship(job) {
            tags.push(INTERNSHIP_TAG.to_string());
        }

        let haystack = format!("{} {}", job.title, job.description).to_lowercase();
        for season in &self.rules.season_tags {
            if season.phrases.iter().any(|p| haystack.contains(p.as_str())) && !tags.contains(&season.tag) {
                tags.push(season.tag.clone());
            }
        }

        if let Some(category) = job.category.as_ref().filter(|c| !tags.contains(c)) {
            tags.push(category.clone());
        }
        if job.remote && !tags.iter().any(|t| t == REMOTE_TAG) {
            tags.push(REMOTE_TAG.to_string());
        }
        tags
    }

    pub fn is_internship(&self, job: &NormalizedJob) -> bool {
        any_match(&self.rules.internship_title, &job.title)
            || any_match(&self.rules.internship_description, &job.description)
    }

    fn has_negative_keywords(&self, job: &NormalizedJob) -> bool {
        let title = job.title.trim();
        let rules = self.rules;
        any_match(&rules.seniority, title)
            || any_match(&rules.non_engineering, title)
            || any_match(&rules.undergrad_only, title)
            || any_match(&rules.generic_pages, title)
            || any_match(&rules.phd_title, title)
            || any_match(&rules.phd_description, &job.description)
    }

    fn location_allowed(&self, job: &NormalizedJob) -> bool {
        let rules = self.rules;
        let location = job.location.as_deref().map(str::trim).unwrap_or_default();
        let combined = format!("{} {}", job.title, location).to_lowercase();
        if any_match(&rules.location_denylist, &combined) {
            return false;
        }

        if location.is_empty() {
            // Missing location is not evidence of eligibility.
            return self.has_allow_indicator(&job.title);
        }
        if self.has_allow_indicator(location) {
            return true;
        }
        if !rules.allowed_locations.is_empty() {
            let lowered = location.to_lowercase();
            return job.remote || rules.allowed_locations.iter().any(|a| lowered.contains(a.as_str()));
        }
        true
    }

    fn has_allow_indicator(&self, text: &str) -> bool {
        any_match(&self.rules.allow_indicators, text) || contains_word(&text.to_lowercase(), REMOTE_TAG)
    }

    fn lacks_sponsorship(&self, job: &NormalizedJob) -> bool {
        match &self.rules.no_sponsorship {
            Some(patterns) => any_match(patterns, &job.title) || any_match(patterns, &job.description),
            None => false,
        }
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}
