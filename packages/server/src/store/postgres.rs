//! Postgres-backed `Store`. Single-writer discipline is enforced by
//! per-row `UPDATE`/`INSERT` statements; no multi-row transactions are
//! required by the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{ChangeIdSet, ExecutionRecord, ScheduledEntry, WebhookSubscription};
use super::Store;
use crate::error::CoreError;
use crate::jobs::model::{Job, JobFilter, JobStatus};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> JobStatus {
    match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Pending,
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, CoreError> {
    let definition_json: serde_json::Value = row.try_get("definition_json")?;
    let result_json: Option<serde_json::Value> = row.try_get("result_json")?;
    Ok(Job {
        definition: serde_json::from_value(definition_json)
            .map_err(|e| CoreError::Storage(e.to_string()))?,
        fingerprint: row.try_get("fingerprint")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str()),
        percent: row.try_get::<i16, _>("percent")? as u8,
        phase: row.try_get("phase")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_error: row.try_get("last_error")?,
        result: result_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoreError::Storage(e.to_string()))?,
        retry_attempt: row.try_get::<i32, _>("retry_attempt")? as u32,
        priority: row.try_get("priority")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_job(&self, job: &Job) -> Result<(), CoreError> {
        let definition_json = serde_json::to_value(&job.definition)
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO jobs (id, fingerprint, definition_json, status, percent, phase, priority)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id())
        .bind(&job.fingerprint)
        .bind(definition_json)
        .bind(status_str(job.status))
        .bind(job.percent as i16)
        .bind(&job.phase)
        .bind(job.priority)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), CoreError> {
        let result_json = job
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "UPDATE jobs SET status = $2, percent = $3, phase = $4, started_at = $5,
             completed_at = $6, last_error = $7, result_json = $8, retry_attempt = $9
             WHERE id = $1",
        )
        .bind(job.id())
        .bind(status_str(job.status))
        .bind(job.percent as i16)
        .bind(&job.phase)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.last_error)
        .bind(result_json)
        .bind(job.retry_attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, CoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows.iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()
            .map(|jobs| jobs.into_iter().filter(|j| filter.matches(j)).collect())
    }

    async fn running_or_queued_with_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Job>, CoreError> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE fingerprint = $1 AND status IN ('running', 'queued')
             LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn insert_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError> {
        let template_json =
            serde_json::to_value(&entry.template).map_err(|e| CoreError::Storage(e.to_string()))?;
        let advanced_json =
            serde_json::to_value(&entry.advanced).map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, cron, timezone, template_json, advanced_json,
             enabled, last_run, next_run, total_runs)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(&entry.cron_expression)
        .bind(&entry.timezone)
        .bind(template_json)
        .bind(advanced_json)
        .bind(entry.enabled)
        .bind(entry.last_run)
        .bind(entry.next_run)
        .bind(entry.total_runs as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError> {
        let advanced_json =
            serde_json::to_value(&entry.advanced).map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "UPDATE scheduled_jobs SET cron = $2, timezone = $3, advanced_json = $4,
             enabled = $5, last_run = $6, next_run = $7, total_runs = $8 WHERE id = $1",
        )
        .bind(entry.id)
        .bind(&entry.cron_expression)
        .bind(&entry.timezone)
        .bind(advanced_json)
        .bind(entry.enabled)
        .bind(entry.last_run)
        .bind(entry.next_run)
        .bind(entry.total_runs as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEntry>, CoreError> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    async fn load_schedules(&self) -> Result<Vec<ScheduledEntry>, CoreError> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO schedule_executions (schedule_id, job_id, executed_at, status,
             duration_ms, error) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.schedule_id)
        .bind(record.job_id)
        .bind(record.fired_at)
        .bind(record.terminal_status.map(status_str))
        .bind(record.duration_ms)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn execution_history(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM schedule_executions WHERE schedule_id = $1
             ORDER BY executed_at DESC LIMIT $2",
        )
        .bind(schedule_id)
        .bind(retention as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn prune_execution_records(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "DELETE FROM schedule_executions WHERE schedule_id = $1 AND id NOT IN (
                SELECT id FROM schedule_executions WHERE schedule_id = $1
                ORDER BY executed_at DESC LIMIT $2
             )",
        )
        .bind(schedule_id)
        .bind(retention as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn write_change_id_set(&self, set: &ChangeIdSet) -> Result<(), CoreError> {
        let json =
            serde_json::to_value(&set.disk_change_ids).map_err(|e| CoreError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO change_id_sets (vm_id, export_time, json) VALUES ($1, $2, $3)
             ON CONFLICT (vm_id, export_time) DO UPDATE SET json = EXCLUDED.json",
        )
        .bind(&set.vm_id)
        .bind(set.export_time)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn latest_change_id_set(&self, vm_id: &str) -> Result<Option<ChangeIdSet>, CoreError> {
        let row = sqlx::query(
            "SELECT * FROM change_id_sets WHERE vm_id = $1 ORDER BY export_time DESC LIMIT 1",
        )
        .bind(vm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;
        row.as_ref().map(row_to_change_id_set).transpose()
    }

    async fn clear_change_id_sets(&self, vm_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM change_id_sets WHERE vm_id = $1")
            .bind(vm_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>, CoreError> {
        let rows = sqlx::query("SELECT * FROM webhook_subscriptions WHERE enabled = true")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        rows.iter().map(row_to_webhook).collect()
    }
}

fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Result<ScheduledEntry, CoreError> {
    let template_json: serde_json::Value = row.try_get("template_json")?;
    let advanced_json: serde_json::Value = row.try_get("advanced_json")?;
    Ok(ScheduledEntry {
        id: row.try_get("id")?,
        template: serde_json::from_value(template_json)
            .map_err(|e| CoreError::Storage(e.to_string()))?,
        cron_expression: row.try_get("cron")?,
        timezone: row.try_get("timezone")?,
        enabled: row.try_get("enabled")?,
        advanced: serde_json::from_value(advanced_json)
            .map_err(|e| CoreError::Storage(e.to_string()))?,
        last_run: row.try_get("last_run")?,
        next_run: row.try_get("next_run")?,
        total_runs: row.try_get::<i64, _>("total_runs")? as u64,
    })
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, CoreError> {
    let status: Option<String> = row.try_get("status")?;
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        job_id: row.try_get("job_id")?,
        fired_at: row.try_get::<DateTime<Utc>, _>("executed_at")?,
        terminal_status: status.as_deref().map(parse_status),
        duration_ms: row.try_get("duration_ms")?,
        error: row.try_get("error")?,
    })
}

fn row_to_change_id_set(row: &sqlx::postgres::PgRow) -> Result<ChangeIdSet, CoreError> {
    let json: serde_json::Value = row.try_get("json")?;
    Ok(ChangeIdSet {
        vm_id: row.try_get("vm_id")?,
        export_time: row.try_get("export_time")?,
        disk_change_ids: serde_json::from_value(json)
            .map_err(|e| CoreError::Storage(e.to_string()))?,
    })
}

fn row_to_webhook(row: &sqlx::postgres::PgRow) -> Result<WebhookSubscription, CoreError> {
    let headers_json: serde_json::Value = row.try_get("headers_json")?;
    Ok(WebhookSubscription {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        events: row.try_get("events")?,
        headers: serde_json::from_value(headers_json)
            .map_err(|e| CoreError::Storage(e.to_string()))?,
        timeout: std::time::Duration::from_millis(row.try_get::<i64, _>("timeout_ms")? as u64),
        retry: super::models::RetryPolicySummary {
            max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        },
        enabled: row.try_get("enabled")?,
    })
}
