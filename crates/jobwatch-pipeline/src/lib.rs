//! Ingestion pipeline: rules, normalize, classify, filter, dedup/upsert, notify, run.

pub mod batch;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod filter;
pub mod normalizer;
pub mod notify;
pub mod rules;
pub mod runner;

pub use batch::{BatchProcessor, FlushReport, DEFAULT_BATCH_SIZE};
pub use classifier::Classifier;
pub use config::{PipelineConfig, Watchlist};
pub use dedup::{plan_upsert, DuplicateCandidate, JobDeduper, UpsertOutcome, UpsertPlan};
pub use filter::{FilterDecision, FilterReason, JobFilter};
pub use normalizer::{NormalizeError, Normalizer};
pub use notify::{
    AlertDispatcher, LogSink, NotificationSink, ReportSink, RunNotification, DEFAULT_ALERT_COOLDOWN_HOURS,
};
pub use rules::RuleSet;
pub use runner::{
    fetch_with_retry, maybe_build_scheduler, CleanupReport, HealthReport, RunOptions, RunReport, Runner, TargetError,
};

pub const CRATE_NAME: &str = "jobwatch-pipeline";
