use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{
    AlertRecord, FieldChange, HealthStatus, Job, JobKey, JobVersion, TargetHealth, VersionSnapshot,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{ChangeSet, JobStore, StoreError};

const JOB_COLUMNS: &str = "id, source, source_id, company, title, location, remote, \
     employment_type, posted_at, url, description, hash_stable, hash_full, category, tags, \
     country, raw_payload, first_seen_at, last_seen_at, is_active, application_status, notes";

/// `JobStore` backed by Postgres. `UNIQUE (source, source_id)` serializes concurrent creators.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    async fn insert_jobs(tx: &mut Transaction<'_, Postgres>, jobs: &[Job]) -> Result<(), StoreError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO jobs ({JOB_COLUMNS}) "));
        builder.push_values(jobs, |mut row, job| {
            row.push_bind(job.id)
                .push_bind(&job.source)
                .push_bind(&job.source_id)
                .push_bind(&job.company)
                .push_bind(&job.title)
                .push_bind(&job.location)
                .push_bind(job.remote)
                .push_bind(&job.employment_type)
                .push_bind(job.posted_at)
                .push_bind(&job.url)
                .push_bind(&job.description)
                .push_bind(&job.hash_stable)
                .push_bind(&job.hash_full)
                .push_bind(&job.category)
                .push_bind(&job.tags)
                .push_bind(&job.country)
                .push_bind(Json(&job.raw_payload))
                .push_bind(job.first_seen_at)
                .push_bind(job.last_seen_at)
                .push_bind(job.is_active)
                .push_bind(&job.application_status)
                .push_bind(&job.notes);
        });
        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    async fn update_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET title = $2,
                   location = $3,
                   remote = $4,
                   employment_type = $5,
                   posted_at = $6,
                   url = $7,
                   description = $8,
                   hash_stable = $9,
                   hash_full = $10,
                   category = $11,
                   tags = $12,
                   raw_payload = $13,
                   last_seen_at = $14,
                   is_active = TRUE
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.title)
        .bind(&job.location)
        .bind(job.remote)
        .bind(&job.employment_type)
        .bind(job.posted_at)
        .bind(&job.url)
        .bind(&job.description)
        .bind(&job.hash_stable)
        .bind(&job.hash_full)
        .bind(&job.category)
        .bind(&job.tags)
        .bind(Json(&job.raw_payload))
        .bind(job.last_seen_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let raw_payload: Json<serde_json::Value> = row.try_get("raw_payload")?;
    Ok(Job {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        company: row.try_get("company")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        remote: row.try_get("remote")?,
        employment_type: row.try_get("employment_type")?,
        posted_at: row.try_get("posted_at")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        hash_stable: row.try_get("hash_stable")?,
        hash_full: row.try_get("hash_full")?,
        category: row.try_get("category")?,
        tags: row.try_get("tags")?,
        country: row.try_get("country")?,
        raw_payload: raw_payload.0,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        is_active: row.try_get("is_active")?,
        application_status: row.try_get("application_status")?,
        notes: row.try_get("notes")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<JobVersion, sqlx::Error> {
    let diff: Json<BTreeMap<String, FieldChange>> = row.try_get("diff")?;
    let snapshot: Json<VersionSnapshot> = row.try_get("snapshot")?;
    Ok(JobVersion {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        hash_full: row.try_get("hash_full")?,
        captured_at: row.try_get("captured_at")?,
        diff: diff.0,
        snapshot: snapshot.0,
    })
}

const HEALTH_COLUMNS: &str = "company, ats_type, url, status, success_count, failure_count, \
     last_success_at, last_failure_at, last_error, updated_at";

fn health_from_row(row: &PgRow) -> Result<TargetHealth, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = HealthStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: format!("unknown health status {status:?}").into(),
    })?;
    let success_count: i32 = row.try_get("success_count")?;
    let failure_count: i32 = row.try_get("failure_count")?;
    Ok(TargetHealth {
        company: row.try_get("company")?,
        ats_type: row.try_get("ats_type")?,
        url: row.try_get("url")?,
        status,
        success_count: u32::try_from(success_count).unwrap_or_default(),
        failure_count: u32::try_from(failure_count).unwrap_or_default(),
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn jobs_from_rows(rows: &[PgRow]) -> Result<Vec<Job>, StoreError> {
    rows.iter()
        .map(|row| job_from_row(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_job(&self, key: &JobKey) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE source = $1 AND source_id = $2"
        ))
        .bind(&key.source)
        .bind(&key.source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose().map_err(StoreError::from)
    }

    async fn find_jobs(&self, keys: &[JobKey]) -> Result<HashMap<JobKey, Job>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let sources: Vec<&str> = keys.iter().map(|k| k.source.as_str()).collect();
        let source_ids: Vec<&str> = keys.iter().map(|k| k.source_id.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (source, source_id) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))"
        ))
        .bind(&sources)
        .bind(&source_ids)
        .fetch_all(&self.pool)
        .await?;

        let jobs = jobs_from_rows(&rows)?;
        Ok(jobs.into_iter().map(|job| (job.key(), job)).collect())
    }

    async fn find_active_by_company(
        &self,
        company: &str,
        exclude_source: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE company = $1 AND source <> $2 AND is_active"
        ))
        .bind(company)
        .bind(exclude_source)
        .fetch_all(&self.pool)
        .await?;
        jobs_from_rows(&rows)
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ANY($1) ORDER BY first_seen_at, company, title"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        jobs_from_rows(&rows)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            inserts = changes.inserts.len(),
            updates = changes.updates.len(),
            touches = changes.touches.len(),
            versions = changes.versions.len(),
            "committing change set"
        );

        // Dropping `tx` on an early return rolls the whole flush back.
        let mut tx = self.pool.begin().await?;

        Self::insert_jobs(&mut tx, &changes.inserts).await?;
        for job in &changes.updates {
            Self::update_job(&mut tx, job).await?;
        }

        if !changes.touches.is_empty() {
            let ids: Vec<Uuid> = changes.touches.iter().map(|t| t.job_id).collect();
            let seen: Vec<DateTime<Utc>> = changes.touches.iter().map(|t| t.seen_at).collect();
            sqlx::query(
                r#"
                UPDATE jobs AS j
                   SET last_seen_at = t.seen_at,
                       is_active = TRUE
                  FROM UNNEST($1::uuid[], $2::timestamptz[]) AS t(id, seen_at)
                 WHERE j.id = t.id
                "#,
            )
            .bind(&ids)
            .bind(&seen)
            .execute(&mut *tx)
            .await?;
        }

        for version in &changes.versions {
            sqlx::query(
                r#"
                INSERT INTO job_versions (id, job_id, hash_full, captured_at, diff, snapshot)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(version.id)
            .bind(version.job_id)
            .bind(&version.hash_full)
            .bind(version.captured_at)
            .bind(Json(&version.diff))
            .bind(Json(&version.snapshot))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn versions_for(&self, job_id: Uuid) -> Result<Vec<JobVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, hash_full, captured_at, diff, snapshot
              FROM job_versions
             WHERE job_id = $1
             ORDER BY captured_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| version_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE is_active AND last_seen_at < $1 ORDER BY last_seen_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        jobs_from_rows(&rows)
    }

    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE jobs SET is_active = FALSE WHERE is_active AND last_seen_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_target_health(
        &self,
        company: &str,
        ats_type: &str,
    ) -> Result<Option<TargetHealth>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {HEALTH_COLUMNS} FROM target_health WHERE company = $1 AND ats_type = $2"
        ))
        .bind(company)
        .bind(ats_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(health_from_row).transpose().map_err(StoreError::from)
    }

    async fn save_target_health(&self, health: &TargetHealth) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO target_health (company, ats_type, url, status, success_count, failure_count,
                                       last_success_at, last_failure_at, last_error, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (company, ats_type) DO UPDATE
               SET url = EXCLUDED.url,
                   status = EXCLUDED.status,
                   success_count = EXCLUDED.success_count,
                   failure_count = EXCLUDED.failure_count,
                   last_success_at = EXCLUDED.last_success_at,
                   last_failure_at = EXCLUDED.last_failure_at,
                   last_error = EXCLUDED.last_error,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&health.company)
        .bind(&health.ats_type)
        .bind(&health.url)
        .bind(health.status.as_str())
        .bind(i32::try_from(health.success_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(health.failure_count).unwrap_or(i32::MAX))
        .bind(health.last_success_at)
        .bind(health.last_failure_at)
        .bind(&health.last_error)
        .bind(health.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_target_health(&self) -> Result<Vec<TargetHealth>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {HEALTH_COLUMNS} FROM target_health ORDER BY failure_count DESC, company, ats_type"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| health_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn record_alerts(&self, alerts: &[AlertRecord]) -> Result<(), StoreError> {
        if alerts.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO alerts (id, job_id, kind, channel, status, sent_at, error) ");
        builder.push_values(alerts, |mut row, alert| {
            row.push_bind(alert.id)
                .push_bind(alert.job_id)
                .push_bind(alert.kind.as_str())
                .push_bind(&alert.channel)
                .push_bind(alert.status.as_str())
                .push_bind(alert.sent_at)
                .push_bind(&alert.error);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn recently_alerted(
        &self,
        channel: &str,
        job_ids: &[Uuid],
        since: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, StoreError> {
        if job_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT job_id
              FROM alerts
             WHERE channel = $1 AND status = 'sent' AND sent_at >= $2 AND job_id = ANY($3)
            "#,
        )
        .bind(channel)
        .bind(since)
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("job_id").map_err(StoreError::from))
            .collect()
    }
}
