//! Rule-driven category assignment. Categories are tried in declared order
//! and the first one whose title patterns or description hints match wins.

use jobwatch_core::NormalizedJob;

use crate::rules::{CategoryRule, RuleSet};

/// Description hints needed to classify without a title match.
pub const MIN_DESCRIPTION_HINTS: usize = 2;

/// First-match category assignment over an ordered rule list.
#[derive(Debug, Clone, Copy)]
pub struct Classifier<'r> {
    categories: &'r [CategoryRule],
}

impl<'r> Classifier<'r> {
    pub fn new(rules: &'r RuleSet) -> Self {
        Self {
            categories: &rules.categories,
        }
    }

    /// `None` is a valid outcome; uncategorized jobs keep flowing.
    pub fn classify(&self, job: &NormalizedJob) -> Option<String> {
        self.categories
            .iter()
            .find(|rule| matches_category(rule, &job.title, &job.description))
            .map(|rule| rule.name.clone())
    }
}

fn matches_category(rule: &CategoryRule, title: &str, description: &str) -> bool {
    if rule.title_any.iter().any(|re| re.is_match(title)) {
        return true;
    }
    if description.is_empty() {
        return false;
    }
    // Counts patterns, not occurrences.
    let hits = rule
        .description_hints
        .iter()
        .filter(|re| re.is_match(description))
        .count();
    hits >= MIN_DESCRIPTION_HINTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures::rules;
    use jobwatch_core::DEFAULT_COUNTRY;

    fn job(title: &str, description: &str) -> NormalizedJob {
        NormalizedJob {
            source: "lever".into(),
            source_id: "1".into(),
            company: "Acme".into(),
            title: title.into(),
            location: None,
            remote: false,
            employment_type: None,
            posted_at: None,
            url: "https://acme.dev/1".into(),
            description: description.into(),
            hash_stable: String::new(),
            hash_full: String::new(),
            category: None,
            tags: vec![],
            country: DEFAULT_COUNTRY.into(),
            raw_payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn first_title_match_in_declared_order_wins() {
        let rules = rules();
        let classifier = Classifier::new(&rules);
        // Matches both ml_ai and swe; ml_ai is declared first.
        assert_eq!(
            classifier.classify(&job("Machine Learning Software Intern", "")).as_deref(),
            Some("ml_ai")
        );
        assert_eq!(
            classifier.classify(&job("Quantitative Trading Intern", "")).as_deref(),
            Some("quant")
        );
    }

    #[test]
    fn description_needs_two_distinct_hints() {
        let rules = rules();
        let classifier = Classifier::new(&rules);
        assert_eq!(classifier.classify(&job("Research Intern", "We use PyTorch. PyTorch everywhere.")), None);
        assert_eq!(
            classifier
                .classify(&job("Research Intern", "We use PyTorch for deep learning."))
                .as_deref(),
            Some("ml_ai")
        );
    }

    #[test]
    fn unmatched_job_is_uncategorized() {
        let rules = rules();
        assert_eq!(Classifier::new(&rules).classify(&job("Office Coordinator", "")), None);
    }
}
