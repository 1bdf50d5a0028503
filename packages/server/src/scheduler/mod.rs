//! C8 Scheduler — fires scheduled entries when due, gates firings by time
//! window and concurrency, maintains dependency ordering, applies retry
//! policies.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::fingerprint;
use crate::jobs::manager::JobManager;
use crate::jobs::model::JobStatus;
use crate::store::models::{
    ExecutionRecord, RequiredState, ScheduledEntry, SerializableRetryPolicy, TimeWindow,
};
use crate::store::Store;

const DEFAULT_HISTORY_RETENTION: usize = 100;
const DEPENDENCY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct Scheduler {
    store: Arc<dyn Store>,
    job_manager: Arc<JobManager>,
    entries: RwLock<HashMap<Uuid, ScheduledEntry>>,
    default_timezone: String,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, job_manager: Arc<JobManager>, default_timezone: String) -> Arc<Self> {
        Arc::new(Self {
            store,
            job_manager,
            entries: RwLock::new(HashMap::new()),
            default_timezone,
        })
    }

    /// Rehydrates from the Persistent Store on startup (spec §4.4).
    pub async fn load_schedules(&self) -> Result<(), CoreError> {
        let schedules = self.store.load_schedules().await?;
        let mut entries = self.entries.write().await;
        for mut entry in schedules {
            if entry.next_run.is_none() {
                entry.next_run = next_fire(&entry.cron_expression, &entry.timezone, Utc::now());
            }
            entries.insert(entry.id, entry);
        }
        Ok(())
    }

    pub async fn create_schedule(&self, mut entry: ScheduledEntry) -> Result<ScheduledEntry, CoreError> {
        if entry.timezone.is_empty() {
            entry.timezone = self.default_timezone.clone();
        }
        entry.next_run = next_fire(&entry.cron_expression, &entry.timezone, Utc::now());
        self.store.insert_schedule(&entry).await?;
        self.entries.write().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    pub async fn get_schedule(&self, id: Uuid) -> Option<ScheduledEntry> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn list_schedules(&self) -> Vec<ScheduledEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn update_schedule(&self, entry: ScheduledEntry) -> Result<(), CoreError> {
        self.store.update_schedule(&entry).await?;
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool, CoreError> {
        self.entries.write().await.remove(&id);
        self.store.delete_schedule(id).await
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<ExecutionRecord>, CoreError> {
        self.store
            .execution_history(id, DEFAULT_HISTORY_RETENTION)
            .await
    }

    /// Ticks once a second, checking every enabled entry for due firing.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    self.tick(Utc::now(), &ctx).await;
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>, now: DateTime<Utc>, ctx: &CancellationToken) {
        let due_ids: Vec<Uuid> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.enabled)
                .filter(|e| e.next_run.map(|t| t <= now).unwrap_or(false))
                .map(|e| e.id)
                .collect()
        };

        for id in due_ids {
            let entry = match self.entries.read().await.get(&id).cloned() {
                Some(e) => e,
                None => continue,
            };
            self.fire(entry, now, ctx).await;
        }
    }

    async fn fire(self: &Arc<Self>, mut entry: ScheduledEntry, now: DateTime<Utc>, ctx: &CancellationToken) {
        // Time windows: defer to the soonest window opening, not merely
        // the next cron tick.
        if !entry.advanced.time_windows.is_empty() && !window_open(&entry.advanced.time_windows, now) {
            entry.next_run = next_window_opening(&entry.advanced.time_windows, now)
                .or_else(|| next_fire(&entry.cron_expression, &entry.timezone, now));
            let _ = self.update_schedule(entry).await;
            return;
        }

        let fingerprint = fingerprint::compute(&entry.template);

        // Concurrency policy gates the fire itself, not just dedup.
        if let Ok(Some(running)) = self
            .store
            .running_or_queued_with_fingerprint(&fingerprint)
            .await
        {
            if entry.advanced.concurrency.skip_if_running
                && running.status == JobStatus::Running
            {
                info!(schedule_id = %entry.id, "tick skipped: job already running and skip_if_running set");
                entry.next_run = next_fire(&entry.cron_expression, &entry.timezone, now);
                let _ = self.update_schedule(entry).await;
                return;
            }
        }

        entry.last_run = Some(now);
        entry.total_runs += 1;
        entry.next_run = next_fire(&entry.cron_expression, &entry.timezone, now);
        let _ = self.update_schedule(entry.clone()).await;

        let scheduler = self.clone();
        let ctx = ctx.child_token();
        tokio::spawn(async move {
            scheduler.fire_with_dependencies(entry, now, ctx).await;
        });
    }

    async fn fire_with_dependencies(
        self: Arc<Self>,
        entry: ScheduledEntry,
        fired_at: DateTime<Utc>,
        ctx: CancellationToken,
    ) {
        for dep in &entry.advanced.dependencies {
            match self
                .wait_for_dependency(dep.job_id, dep.required_state, dep.wait_timeout_secs, &ctx)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {
                    self.record_dependency_failure(&entry, fired_at, "dependency-unmet")
                        .await;
                    return;
                }
                Err(_timeout) => {
                    self.record_dependency_failure(&entry, fired_at, "dependency-timeout")
                        .await;
                    return;
                }
            }
        }

        let priority = entry.advanced.priority;
        let job_id = match self
            .job_manager
            .enqueue_without_dedup_check(entry.template.clone(), priority)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(schedule_id = %entry.id, error = %e, "schedule fire failed to enqueue");
                return;
            }
        };

        self.watch_for_retry(entry, job_id, fired_at).await;
    }

    /// Returns Ok(true) if satisfied, Ok(false) if satisfied-but-mismatched
    /// terminal state, Err(()) on timeout.
    async fn wait_for_dependency(
        &self,
        dep_job_id: Uuid,
        required: RequiredState,
        timeout_secs: u64,
        ctx: &CancellationToken,
    ) -> Result<bool, ()> {
        let deadline = (timeout_secs > 0)
            .then(|| Utc::now() + ChronoDuration::seconds(timeout_secs as i64));

        loop {
            if ctx.is_cancelled() {
                return Err(());
            }
            match self.store.get_job(dep_job_id).await {
                Ok(Some(job)) if job.status.is_terminal() => {
                    return Ok(match required {
                        RequiredState::Any => true,
                        RequiredState::Completed => job.status == JobStatus::Completed,
                        RequiredState::Failed => job.status == JobStatus::Failed,
                    });
                }
                _ => {}
            }

            if let Some(deadline) = deadline {
                if Utc::now() >= deadline {
                    return Err(());
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(()),
                _ = tokio::time::sleep(DEPENDENCY_POLL_INTERVAL) => {}
            }
        }
    }

    async fn record_dependency_failure(&self, entry: &ScheduledEntry, fired_at: DateTime<Utc>, reason: &str) {
        let job_id = Uuid::new_v4();
        let mut failed = crate::jobs::model::Job::new(
            entry.template.clone(),
            fingerprint::compute(&entry.template),
            entry.advanced.priority,
        );
        failed.status = JobStatus::Failed;
        failed.phase = reason.to_string();
        failed.last_error = Some(reason.to_string());
        failed.completed_at = Some(Utc::now());
        // Preserve the generated id distinct from the template's.
        failed.definition.id = job_id;

        if self.store.insert_job(&failed).await.is_err() {
            warn!(schedule_id = %entry.id, reason, "failed to record dependency-failure job");
        }

        let _ = self
            .store
            .append_execution_record(&ExecutionRecord {
                id: 0,
                schedule_id: entry.id,
                job_id,
                fired_at,
                terminal_status: Some(JobStatus::Failed),
                duration_ms: Some(0),
                error: Some(reason.to_string()),
            })
            .await;
        let _ = self
            .store
            .prune_execution_records(entry.id, DEFAULT_HISTORY_RETENTION)
            .await;
    }

    async fn watch_for_retry(&self, entry: ScheduledEntry, job_id: Uuid, fired_at: DateTime<Utc>) {
        loop {
            match self.store.get_job(job_id).await {
                Ok(Some(job)) if job.status.is_terminal() => {
                    let duration_ms = job
                        .started_at
                        .zip(job.completed_at)
                        .map(|(s, c)| (c - s).num_milliseconds());

                    let _ = self
                        .store
                        .append_execution_record(&ExecutionRecord {
                            id: 0,
                            schedule_id: entry.id,
                            job_id,
                            fired_at,
                            terminal_status: Some(job.status),
                            duration_ms,
                            error: job.last_error.clone(),
                        })
                        .await;
                    let _ = self
                        .store
                        .prune_execution_records(entry.id, DEFAULT_HISTORY_RETENTION)
                        .await;

                    if job.status == JobStatus::Failed {
                        self.maybe_retry(&entry, &job).await;
                    }
                    return;
                }
                Ok(_) => {
                    tokio::time::sleep(DEPENDENCY_POLL_INTERVAL).await;
                }
                Err(_) => return,
            }
        }
    }

    async fn maybe_retry(&self, entry: &ScheduledEntry, job: &crate::jobs::model::Job) {
        let Some(policy) = &entry.advanced.retry_policy else {
            return;
        };
        if job.retry_attempt + 1 >= policy.max_attempts {
            return;
        }
        let retry_policy: crate::retry::RetryPolicy = policy.into();
        let delay = retry_policy.delay_for(job.retry_attempt + 1);

        let mut retried = job.definition.clone();
        retried.id = Uuid::new_v4();
        let manager = self.job_manager.clone();
        let priority = entry.advanced.priority;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = manager.enqueue_without_dedup_check(retried, priority).await;
        });
    }
}

/// Parses a standard 5-field cron expression against an IANA timezone and
/// returns the next fire time strictly after `after`.
pub fn next_fire(cron_expr: &str, timezone: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
    let normalized = normalize_cron(cron_expr);
    let schedule = Schedule::from_str(&normalized).ok()?;
    let local_after = after.with_timezone(&tz);
    schedule
        .after(&local_after)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The `cron` crate requires a leading seconds field; the spec's cron is
/// the standard 5-field `min hour dom month dow`.
fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn window_open(windows: &[TimeWindow], now: DateTime<Utc>) -> bool {
    windows.iter().any(|w| window_contains(w, now))
}

fn window_contains(window: &TimeWindow, now: DateTime<Utc>) -> bool {
    let tz: Tz = window.timezone.parse().unwrap_or(chrono_tz::UTC);
    let local = now.with_timezone(&tz);
    if !window.days_of_week.is_empty() && !window.days_of_week.contains(&local.weekday()) {
        return false;
    }
    let t = local.time();
    if window.start_of_day <= window.end_of_day {
        t >= window.start_of_day && t <= window.end_of_day
    } else {
        // window spans midnight
        t >= window.start_of_day || t <= window.end_of_day
    }
}

fn next_window_opening(windows: &[TimeWindow], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    windows
        .iter()
        .filter_map(|w| next_opening_for_window(w, after))
        .min()
}

fn next_opening_for_window(window: &TimeWindow, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = window.timezone.parse().unwrap_or(chrono_tz::UTC);
    let local = after.with_timezone(&tz);
    for day_offset in 0..8 {
        let candidate_date = local.date_naive() + ChronoDuration::days(day_offset);
        if !window.days_of_week.is_empty()
            && !window.days_of_week.contains(&candidate_date.weekday())
        {
            continue;
        }
        let candidate = candidate_date.and_time(window.start_of_day);
        let candidate_tz = tz
            .from_local_datetime(&candidate)
            .single()
            .unwrap_or_else(|| tz.from_utc_datetime(&candidate));
        let candidate_utc = candidate_tz.with_timezone(&Utc);
        if candidate_utc > after {
            return Some(candidate_utc);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::manager::JobManagerDeps;
    use crate::jobs::model::{CompressionChoice, ExportFormat, Job, JobDefinition, Provider};
    use crate::network::NetworkMonitor;
    use crate::progress::ProgressBus;
    use crate::provider::mock::MockProvider;
    use crate::provider::registry::ProviderRegistry;
    use crate::store::memory::InMemoryStore;
    use crate::store::models::{AdvancedConfig, ConcurrencyPolicy, DependencyEntry};
    use crate::webhook::WebhookDispatcher;

    #[test]
    fn next_fire_advances_past_now() {
        let now = Utc::now();
        let fire = next_fire("0 2 * * *", "UTC", now).unwrap();
        assert!(fire > now);
    }

    #[test]
    fn window_open_respects_range() {
        let window = TimeWindow {
            start_of_day: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end_of_day: chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            days_of_week: vec![],
            timezone: "UTC".to_string(),
        };
        let inside = Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 1, 1, 14, 0, 0).unwrap();
        assert!(window_contains(&window, inside));
        assert!(!window_contains(&window, outside));
    }

    fn template(name: &str) -> JobDefinition {
        JobDefinition::builder()
            .display_name(name.to_string())
            .provider(Provider::Vsphere)
            .source_id(format!("/dc/vm/{name}"))
            .destination(format!("/out/{name}"))
            .format(ExportFormat::Ova)
            .compression(CompressionChoice::Disabled)
            .build()
    }

    async fn harness() -> (Arc<Scheduler>, Arc<dyn Store>, Arc<JobManager>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new(Provider::Vsphere));
        let providers = Arc::new(ProviderRegistry::builder().register(provider).build());
        let planner = Arc::new(crate::planner::IncrementalPlanner::new(store.clone()));
        let job_manager = JobManager::new(JobManagerDeps {
            store: store.clone(),
            providers,
            pool: None,
            planner,
            progress_bus: ProgressBus::new(),
            webhooks: Arc::new(WebhookDispatcher::new(store.clone())),
            network_monitor: NetworkMonitor::new(vec![]),
            retry_defaults: crate::retry::RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            },
        });
        let scheduler = Scheduler::new(store.clone(), job_manager.clone(), "UTC".to_string());
        (scheduler, store, job_manager)
    }

    fn entry_with_dependency(dep: DependencyEntry) -> ScheduledEntry {
        ScheduledEntry {
            id: Uuid::new_v4(),
            template: template("b"),
            cron_expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            advanced: AdvancedConfig {
                dependencies: vec![dep],
                retry_policy: None,
                time_windows: vec![],
                priority: 0,
                concurrency: ConcurrencyPolicy::default(),
            },
            last_run: None,
            next_run: None,
            total_runs: 0,
        }
    }

    #[tokio::test]
    async fn dependency_completed_allows_fire() {
        let (scheduler, store, job_manager) = harness().await;

        let mut dep_job = Job::new(template("a"), "fp-a".to_string(), 0);
        dep_job.status = JobStatus::Completed;
        dep_job.completed_at = Some(Utc::now());
        let dep_job_id = dep_job.id();
        store.insert_job(&dep_job).await.unwrap();

        let entry = entry_with_dependency(DependencyEntry {
            job_id: dep_job_id,
            required_state: RequiredState::Completed,
            wait_timeout_secs: 5,
        });

        let ctx = CancellationToken::new();
        scheduler
            .clone()
            .fire_with_dependencies(entry, Utc::now(), ctx)
            .await;

        // fire_with_dependencies enqueues via the Job Manager, not the store
        // directly; the queued job should now be visible through it.
        let queued = job_manager
            .query(&crate::jobs::model::JobFilter::default())
            .await
            .unwrap();
        assert!(queued.iter().any(|j| j.display_name == "b"));
    }

    #[tokio::test]
    async fn dependency_failed_when_required_completed_marks_dependent_failed() {
        let (scheduler, store, _job_manager) = harness().await;

        let mut dep_job = Job::new(template("a"), "fp-a".to_string(), 0);
        dep_job.status = JobStatus::Failed;
        dep_job.completed_at = Some(Utc::now());
        let dep_job_id = dep_job.id();
        store.insert_job(&dep_job).await.unwrap();

        let entry = entry_with_dependency(DependencyEntry {
            job_id: dep_job_id,
            required_state: RequiredState::Completed,
            wait_timeout_secs: 5,
        });
        let schedule_id = entry.id;

        let ctx = CancellationToken::new();
        scheduler
            .clone()
            .fire_with_dependencies(entry, Utc::now(), ctx)
            .await;

        let history = scheduler.history(schedule_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error.as_deref(), Some("dependency-unmet"));
        assert_eq!(history[0].terminal_status, Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn dependency_wait_times_out_when_never_terminal() {
        let (scheduler, store, _job_manager) = harness().await;

        let mut dep_job = Job::new(template("a"), "fp-a".to_string(), 0);
        dep_job.status = JobStatus::Running;
        let dep_job_id = dep_job.id();
        store.insert_job(&dep_job).await.unwrap();

        let entry = entry_with_dependency(DependencyEntry {
            job_id: dep_job_id,
            required_state: RequiredState::Completed,
            wait_timeout_secs: 1,
        });
        let schedule_id = entry.id;

        let ctx = CancellationToken::new();
        scheduler
            .clone()
            .fire_with_dependencies(entry, Utc::now(), ctx)
            .await;

        let history = scheduler.history(schedule_id).await.unwrap();
        assert_eq!(history[0].error.as_deref(), Some("dependency-timeout"));
    }
}
