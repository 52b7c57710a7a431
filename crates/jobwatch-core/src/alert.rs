//! Notification log entries used for the per-channel cooldown.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    New,
    Updated,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::New => "new",
            AlertKind::Updated => "updated",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Sent,
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
        }
    }
}

/// One job announced (or attempted) on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: AlertKind,
    pub channel: String,
    pub status: AlertStatus,
    pub sent_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl AlertRecord {
    pub fn sent(job_id: Uuid, kind: AlertKind, channel: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind,
            channel: channel.to_string(),
            status: AlertStatus::Sent,
            sent_at: now,
            error: None,
        }
    }

    pub fn failed(job_id: Uuid, kind: AlertKind, channel: &str, error: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: AlertStatus::Failed,
            error: Some(error.to_string()),
            ..Self::sent(job_id, kind, channel, now)
        }
    }
}
