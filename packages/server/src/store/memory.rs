//! In-memory `Store` used by property tests that only need in-process
//! concurrency invariants (P1-P8), not durability across restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{ChangeIdSet, ExecutionRecord, ScheduledEntry, WebhookSubscription};
use super::Store;
use crate::error::CoreError;
use crate::jobs::model::{Job, JobFilter, JobStatus};

#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    schedules: Mutex<HashMap<Uuid, ScheduledEntry>>,
    executions: Mutex<Vec<ExecutionRecord>>,
    change_ids: Mutex<HashMap<String, Vec<ChangeIdSet>>>,
    webhooks: Mutex<Vec<WebhookSubscription>>,
    next_execution_id: Mutex<i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), CoreError> {
        self.jobs.lock().unwrap().insert(job.id(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), CoreError> {
        self.jobs.lock().unwrap().insert(job.id(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, CoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, CoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn running_or_queued_with_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Job>, CoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| {
                j.fingerprint == fingerprint
                    && matches!(j.status, JobStatus::Running | JobStatus::Queued)
            })
            .cloned())
    }

    async fn insert_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError> {
        self.schedules
            .lock()
            .unwrap()
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn update_schedule(&self, entry: &ScheduledEntry) -> Result<(), CoreError> {
        self.schedules
            .lock()
            .unwrap()
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, CoreError> {
        Ok(self.schedules.lock().unwrap().remove(&id).is_some())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledEntry>, CoreError> {
        Ok(self.schedules.lock().unwrap().get(&id).cloned())
    }

    async fn load_schedules(&self) -> Result<Vec<ScheduledEntry>, CoreError> {
        Ok(self.schedules.lock().unwrap().values().cloned().collect())
    }

    async fn append_execution_record(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        let mut id = self.next_execution_id.lock().unwrap();
        *id += 1;
        let mut record = record.clone();
        record.id = *id;
        self.executions.lock().unwrap().push(record);
        Ok(())
    }

    async fn execution_history(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let mut records: Vec<_> = self
            .executions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.fired_at));
        records.truncate(retention);
        Ok(records)
    }

    async fn prune_execution_records(
        &self,
        schedule_id: Uuid,
        retention: usize,
    ) -> Result<(), CoreError> {
        let mut executions = self.executions.lock().unwrap();
        let mut for_schedule: Vec<_> = executions
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        for_schedule.sort_by_key(|r| std::cmp::Reverse(r.fired_at));
        let keep_ids: std::collections::HashSet<_> =
            for_schedule.iter().take(retention).map(|r| r.id).collect();
        executions.retain(|r| r.schedule_id != schedule_id || keep_ids.contains(&r.id));
        Ok(())
    }

    async fn write_change_id_set(&self, set: &ChangeIdSet) -> Result<(), CoreError> {
        self.change_ids
            .lock()
            .unwrap()
            .entry(set.vm_id.clone())
            .or_default()
            .push(set.clone());
        Ok(())
    }

    async fn latest_change_id_set(&self, vm_id: &str) -> Result<Option<ChangeIdSet>, CoreError> {
        Ok(self
            .change_ids
            .lock()
            .unwrap()
            .get(vm_id)
            .and_then(|sets| sets.iter().max_by_key(|s| s.export_time).cloned()))
    }

    async fn clear_change_id_sets(&self, vm_id: &str) -> Result<(), CoreError> {
        self.change_ids.lock().unwrap().remove(vm_id);
        Ok(())
    }

    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>, CoreError> {
        Ok(self.webhooks.lock().unwrap().clone())
    }
}
