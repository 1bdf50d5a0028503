//! C4 Persistent Store — single-writer durable store exposing typed
//! accessors. No multi-row transactions are required by the core.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::jobs::model::{Job, JobFilter};
use models::{ChangeIdSet, ExecutionRecord, ScheduledEntry, WebhookSubscription};

#[async_trait]
pub trait Store: Send + Sync {
    // Jobs
    async fn insert_job(&self, job: &Job) -> Result<(), CoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), CoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, CoreError>;
    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError>;
    async fn running_or_queued_with_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Job>, CoreError>;

    // Scheduled entries
    async fn insert_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError>;
    async fn update_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError>;
    async fn delete_schedule(&self, id: Uuid) -> Result<bool, CoreError>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEntry>, CoreError>;
    /// Rehydrates the Scheduler on startup.
    async fn load_schedules(&self) -> Result<Vec<ScheduledEntry>, CoreError>;

    // Execution records
    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), CoreError>;
    async fn execution_history(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<Vec<ExecutionRecord>, CoreError>;
    async fn prune_execution_records(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<(), CoreError>;

    // Change-id sets
    async fn write_change_id_set(&self, set: &ChangeIdSet) -> Result<(), CoreError>;
    async fn latest_change_id_set(&self, vm_id: &str) -> Result<Option<ChangeIdSet>, CoreError>;
    async fn clear_change_id_sets(&self, vm_id: &str) -> Result<(), CoreError>;

    // Webhook subscriptions
    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>, CoreError>;
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
