//! Per-target fetch health, keyed by `(company, ats_type)`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failures after which a target counts as degraded.
pub const DEGRADED_AFTER: u32 = 3;
/// Consecutive failures after which a target counts as failed.
pub const FAILED_AFTER: u32 = 10;

const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Fetch succeeded but the board listed nothing.
    HealthyNoJobs,
    /// Failing, but fewer than [`DEGRADED_AFTER`] times in a row.
    Unstable,
    Degraded,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::HealthyNoJobs => "healthy_no_jobs",
            HealthStatus::Unstable => "unstable",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "healthy" => HealthStatus::Healthy,
            "healthy_no_jobs" => HealthStatus::HealthyNoJobs,
            "unstable" => HealthStatus::Unstable,
            "degraded" => HealthStatus::Degraded,
            "failed" => HealthStatus::Failed,
            _ => return None,
        })
    }

    fn for_failures(consecutive: u32) -> Self {
        if consecutive >= FAILED_AFTER {
            HealthStatus::Failed
        } else if consecutive >= DEGRADED_AFTER {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unstable
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running fetch record for one watchlist target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub company: String,
    pub ats_type: String,
    pub url: Option<String>,
    pub status: HealthStatus,
    pub success_count: u32,
    /// Consecutive failures; reset by the next success.
    pub failure_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TargetHealth {
    pub fn new(
        company: impl Into<String>,
        ats_type: impl Into<String>,
        url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            company: company.into(),
            ats_type: ats_type.into(),
            url,
            status: HealthStatus::Healthy,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn record_success(&mut self, jobs_found: usize, now: DateTime<Utc>) {
        self.success_count = self.success_count.saturating_add(1);
        self.failure_count = 0;
        self.last_success_at = Some(now);
        self.last_error = None;
        self.status = if jobs_found > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::HealthyNoJobs
        };
        self.updated_at = now;
    }

    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        self.last_error = Some(error.chars().take(MAX_ERROR_LEN).collect());
        self.status = HealthStatus::for_failures(self.failure_count);
        self.updated_at = now;
    }
}

/// Counts per status bucket; unstable targets count as degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
}

impl HealthSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TargetHealth>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.total += 1;
            match record.status {
                HealthStatus::Healthy | HealthStatus::HealthyNoJobs => summary.healthy += 1,
                HealthStatus::Unstable | HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
