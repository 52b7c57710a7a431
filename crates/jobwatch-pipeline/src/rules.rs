//! Filter and classification rules, loaded once from `rules/filters.yaml`.
//!
//! Every pattern is compiled case-insensitively at load time. A missing file,
//! a bad regex or an empty internship pattern set is a startup error: the
//! pipeline never runs with undefined rules.

use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    internship: InternshipSection,
    #[serde(default)]
    negatives: NegativesSection,
    #[serde(default)]
    locations: LocationsSection,
    #[serde(default)]
    sponsorship: Option<SponsorshipSection>,
    #[serde(default)]
    season_tags: Vec<SeasonTagSection>,
    #[serde(default)]
    categories: Vec<CategorySection>,
}

#[derive(Debug, Clone, Deserialize)]
struct InternshipSection {
    #[serde(default)]
    title_patterns: Vec<String>,
    #[serde(default)]
    description_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NegativesSection {
    #[serde(default)]
    seniority: Vec<String>,
    #[serde(default)]
    non_engineering: Vec<String>,
    #[serde(default)]
    undergrad_only: Vec<String>,
    #[serde(default)]
    generic_pages: Vec<String>,
    #[serde(default)]
    phd_only: PhdSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PhdSection {
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    description: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LocationsSection {
    #[serde(default)]
    denylist: Vec<String>,
    #[serde(default)]
    allow_indicators: Vec<String>,
    #[serde(default)]
    allowed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SponsorshipSection {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    patterns: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct SeasonTagSection {
    tag: String,
    phrases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CategorySection {
    name: String,
    #[serde(default)]
    title_any: Vec<String>,
    #[serde(default)]
    description_hints: Vec<String>,
}

/// Compiled rule set shared by reference between the classifier and the filter.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub filter: FilterRules,
    pub categories: Vec<CategoryRule>,
}

#[derive(Debug, Clone)]
pub struct FilterRules {
    pub internship_title: Vec<Regex>,
    pub internship_description: Vec<Regex>,
    pub seniority: Vec<Regex>,
    pub non_engineering: Vec<Regex>,
    pub undergrad_only: Vec<Regex>,
    pub generic_pages: Vec<Regex>,
    pub phd_title: Vec<Regex>,
    pub phd_description: Vec<Regex>,
    /// Region tokens matched on word boundaries against title + location.
    pub location_denylist: Vec<Regex>,
    pub allow_indicators: Vec<Regex>,
    /// Lowercased allow-list entries; empty means default-allow.
    pub allowed_locations: Vec<String>,
    /// `None` disables the sponsorship check.
    pub no_sponsorship: Option<Vec<Regex>>,
    pub season_tags: Vec<SeasonTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonTag {
    pub tag: String,
    /// Lowercased literal phrases.
    pub phrases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub name: String,
    pub title_any: Vec<Regex>,
    pub description_hints: Vec<Regex>,
}

impl RuleSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading rules from {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(text).context("parsing rules yaml")?;
        Self::compile(file)
    }

    fn compile(file: RulesFile) -> Result<Self> {
        if file.internship.title_patterns.is_empty() && file.internship.description_patterns.is_empty() {
            bail!("internship section defines no patterns");
        }

        let sponsorship = match file.sponsorship {
            Some(section) if section.enabled => Some(compile_all("sponsorship.patterns", &section.patterns)?),
            _ => None,
        };

        let filter = FilterRules {
            internship_title: compile_all("internship.title_patterns", &file.internship.title_patterns)?,
            internship_description: compile_all(
                "internship.description_patterns",
                &file.internship.description_patterns,
            )?,
            seniority: compile_all("negatives.seniority", &file.negatives.seniority)?,
            non_engineering: compile_all("negatives.non_engineering", &file.negatives.non_engineering)?,
            undergrad_only: compile_all("negatives.undergrad_only", &file.negatives.undergrad_only)?,
            generic_pages: compile_all("negatives.generic_pages", &file.negatives.generic_pages)?,
            phd_title: compile_all("negatives.phd_only.title", &file.negatives.phd_only.title)?,
            phd_description: compile_all(
                "negatives.phd_only.description",
                &file.negatives.phd_only.description,
            )?,
            location_denylist: file
                .locations
                .denylist
                .iter()
                .map(|token| compile("locations.denylist", &format!(r"\b{}\b", regex::escape(token.trim()))))
                .collect::<Result<_>>()?,
            allow_indicators: compile_all("locations.allow_indicators", &file.locations.allow_indicators)?,
            allowed_locations: file
                .locations
                .allowed
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            no_sponsorship: sponsorship,
            season_tags: file
                .season_tags
                .into_iter()
                .map(|s| SeasonTag {
                    tag: s.tag,
                    phrases: s.phrases.iter().map(|p| p.to_lowercase()).collect(),
                })
                .collect(),
        };

        let categories = file
            .categories
            .into_iter()
            .map(|c| {
                Ok(CategoryRule {
                    title_any: compile_all(&format!("categories.{}.title_any", c.name), &c.title_any)?,
                    description_hints: compile_all(
                        &format!("categories.{}.description_hints", c.name),
                        &c.description_hints,
                    )?,
                    name: c.name,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { filter, categories })
    }
}

fn compile(section: &str, pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("invalid pattern in {section}: {pattern:?}"))
}

fn compile_all(section: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(section, p)).collect()
}

/// True when any pattern matches `text`.
pub(crate) fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::RuleSet;

    pub const RULES_YAML: &str = r#"
internship:
  title_patterns: ['\bintern(s|ships?)?\b', '\bco-?op\b', '\bgraduates?\b']
  description_patterns: ['\binternship\b', '\bgraduate program\b']
negatives:
  seniority: ['\bsenior\b', '\bsr\.?\s', '\bstaff\b', '\bprincipal\b', '\blead\b', '\bmanager\b', '\bdirector\b']
  non_engineering: ['\brecruit(er|ing)\b', '\bsales\b', '\bmarketing\b']
  undergrad_only: ['\bundergrad(uate)?\b']
  generic_pages: ['^internships?$', '^internship programs?$', 'join.*talent.*community', '^student and internship opportunities$']
  phd_only:
    title: ['\bph\.?\s?d\b', '\bdoctoral\b']
    description: ['\bph\.?d\.?\s+students?\b', '\bdoctoral\s+candidates?\b']
locations:
  denylist: [serbia, poland, canada, singapore, toronto, amsterdam, belgrade, netherlands]
  allow_indicators: ['\bnew york\b', '\bsan francisco\b', '\bchicago\b', '\bseattle\b', '\bboston\b', ',\s*(ny|ca|il|wa|ma|tx)\b', '\bunited states\b', '\busa?\b']
  allowed: []
sponsorship:
  patterns: ['\bno\s+visa\s+sponsorship\b', '\bcannot\s+sponsor\b', '\bunable\s+to\s+sponsor\b']
season_tags:
  - tag: summer-2026
    phrases: ["summer 2026", "summer '26"]
categories:
  - name: ml_ai
    title_any: ['\bmachine learning\b', '\bml\b', '\bai\b']
    description_hints: ['\bpytorch\b', '\btensorflow\b', '\bdeep learning\b', '\bllms?\b']
  - name: quant
    title_any: ['\bquant(itative)?\b', '\btrading\b']
    description_hints: ['\balpha\b', '\bstatistics\b', '\bprobability\b', '\bderivatives\b']
  - name: swe
    title_any: ['\bsoftware\b', '\bbackend\b', '\bfrontend\b', '\bfull[- ]?stack\b']
    description_hints: ['\bdistributed systems\b', '\bapis?\b', '\bmicroservices\b']
"#;

    pub fn rules() -> RuleSet {
        RuleSet::from_yaml(RULES_YAML).expect("test rules compile")
    }
}
