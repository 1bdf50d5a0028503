//! C7 Job Manager — the crux. Accepts submissions, enforces dedup,
//! executes jobs with controlled concurrency, surfaces progress,
//! propagates cancellation, emits lifecycle events.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::model::{Job, JobDefinition, JobFilter, JobStatus, JobSummary};
use crate::error::CoreError;
use crate::fingerprint;
use crate::network::NetworkMonitor;
use crate::planner::{IncrementalPlanner, PlanOptions, Verdict};
use crate::pool::{ConnectionPool, ReleaseOutcome};
use crate::progress::{ProgressBus, ProgressSink};
use crate::provider::registry::ProviderRegistry;
use crate::provider::ExportOptions;
use crate::retry::{self, RetryContext, RetryPolicy};
use crate::store::models::ChangeIdSet;
use crate::store::Store;
use crate::webhook::{EventData, LifecycleEvent, WebhookDispatcher};

struct QueueEntry {
    job_id: Uuid,
    fingerprint: String,
    priority: i32,
    submitted_at: chrono::DateTime<Utc>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority, then earliest submission time wins (so
        // reverse time ordering keeps FIFO semantics under BinaryHeap).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct DispatchState {
    queue: BinaryHeap<QueueEntry>,
    running_fingerprints: HashSet<String>,
}

/// Dependencies the Job Manager needs from every other component, handed
/// in at construction so the manager stays agnostic of how they're wired.
pub struct JobManagerDeps {
    pub store: Arc<dyn Store>,
    pub providers: Arc<ProviderRegistry>,
    pub pool: Option<Arc<ConnectionPool>>,
    pub planner: Arc<IncrementalPlanner>,
    pub progress_bus: ProgressBus,
    pub webhooks: Arc<WebhookDispatcher>,
    pub network_monitor: NetworkMonitor,
    pub retry_defaults: RetryPolicy,
}

pub struct JobManager {
    store: Arc<dyn Store>,
    providers: Arc<ProviderRegistry>,
    pool: Option<Arc<ConnectionPool>>,
    planner: Arc<IncrementalPlanner>,
    progress_bus: ProgressBus,
    webhooks: Arc<WebhookDispatcher>,
    network_monitor: NetworkMonitor,
    retry_defaults: RetryPolicy,

    index: RwLock<HashMap<Uuid, Job>>,
    dispatch: Mutex<DispatchState>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    dispatch_notify: Notify,
}

impl JobManager {
    pub fn new(deps: JobManagerDeps) -> Arc<Self> {
        Arc::new(Self {
            store: deps.store,
            providers: deps.providers,
            pool: deps.pool,
            planner: deps.planner,
            progress_bus: deps.progress_bus,
            webhooks: deps.webhooks,
            network_monitor: deps.network_monitor,
            retry_defaults: deps.retry_defaults,
            index: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(DispatchState {
                queue: BinaryHeap::new(),
                running_fingerprints: HashSet::new(),
            }),
            cancel_tokens: Mutex::new(HashMap::new()),
            dispatch_notify: Notify::new(),
        })
    }

    /// Queues a definition directly, bypassing the fingerprint's
    /// in-flight check — used by the Scheduler, which enforces its own
    /// concurrency policy (max_concurrent / skip_if_running) before
    /// calling this.
    pub async fn enqueue_without_dedup_check(
        self: &Arc<Self>,
        definition: JobDefinition,
        priority: i32,
    ) -> Result<Uuid, CoreError> {
        self.submit_internal(definition, priority, false).await
    }

    #[instrument(skip(self, definition), fields(display_name = %definition.display_name))]
    pub async fn submit(self: &Arc<Self>, definition: JobDefinition) -> Result<Uuid, CoreError> {
        self.submit_internal(definition, 0, true).await
    }

    async fn submit_internal(
        self: &Arc<Self>,
        definition: JobDefinition,
        priority: i32,
        check_dedup: bool,
    ) -> Result<Uuid, CoreError> {
        let fp = fingerprint::compute(&definition);

        if check_dedup {
            if let Some(existing) = self.store.running_or_queued_with_fingerprint(&fp).await? {
                return Err(CoreError::Conflict(format!(
                    "DuplicateRunning: job {} already {:?} with this fingerprint",
                    existing.id(),
                    existing.status
                )));
            }
        }

        let mut job = Job::new(definition, fp.clone(), priority);
        self.store.insert_job(&job).await?;

        job.status = JobStatus::Queued;
        job.phase = "queued".to_string();
        self.store.update_job(&job).await?;

        let job_id = job.id();
        self.index.write().await.insert(job_id, job.clone());

        {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.queue.push(QueueEntry {
                job_id,
                fingerprint: fp,
                priority,
                submitted_at: Utc::now(),
            });
        }
        self.dispatch_notify.notify_one();

        self.webhooks
            .publish(
                LifecycleEvent::JobSubmitted,
                EventData {
                    job_id,
                    job_name: job.definition.display_name.clone(),
                    source_id: job.definition.source_id.clone(),
                    duration_seconds: None,
                    result: None,
                    error: None,
                    progress: None,
                },
            )
            .await;

        Ok(job_id)
    }

    #[instrument(skip(self))]
    pub async fn cancel(self: &Arc<Self>, job_id: Uuid) -> Result<(), CoreError> {
        let mut index = self.index.write().await;
        let job = index
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;

        match job.status {
            JobStatus::Pending | JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                let snapshot = job.clone();
                drop(index);

                self.store.update_job(&snapshot).await?;
                {
                    let mut dispatch = self.dispatch.lock().await;
                    dispatch.queue.retain(|e| e.job_id != job_id);
                }
                self.webhooks
                    .publish(
                        LifecycleEvent::JobCancelled,
                        EventData {
                            job_id,
                            job_name: snapshot.definition.display_name.clone(),
                            source_id: snapshot.definition.source_id.clone(),
                            duration_seconds: None,
                            result: None,
                            error: None,
                            progress: None,
                        },
                    )
                    .await;
                Ok(())
            }
            JobStatus::Running => {
                drop(index);
                let tokens = self.cancel_tokens.lock().await;
                if let Some(token) = tokens.get(&job_id) {
                    token.cancel();
                }
                Ok(())
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => Ok(()),
        }
    }

    pub async fn query(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, CoreError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for job in self.index.read().await.values() {
            if filter.matches(job) {
                seen.insert(job.id());
                out.push(JobSummary::from(job));
            }
        }

        for job in self.store.query_jobs(filter).await? {
            if seen.insert(job.id()) {
                out.push(JobSummary::from(&job));
            }
        }

        Ok(out)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, CoreError> {
        if let Some(job) = self.index.read().await.get(&job_id) {
            return Ok(Some(job.clone()));
        }
        self.store.get_job(job_id).await
    }

    pub async fn progress_subscribe(
        &self,
        job_id: Uuid,
    ) -> tokio::sync::broadcast::Receiver<crate::progress::ProgressSnapshot> {
        self.progress_bus.subscribe(job_id).await
    }

    /// The worker-dispatch loop: repeatedly picks the highest-priority
    /// Queued job whose fingerprint is not already Running, and spawns a
    /// worker to execute it. Deterministic under a single dispatcher.
    pub async fn run_dispatcher(self: Arc<Self>, ctx: CancellationToken) {
        loop {
            if ctx.is_cancelled() {
                return;
            }

            let candidate = {
                let mut dispatch = self.dispatch.lock().await;
                let mut deferred = Vec::new();
                let mut picked = None;
                while let Some(entry) = dispatch.queue.pop() {
                    if dispatch.running_fingerprints.contains(&entry.fingerprint) {
                        deferred.push(entry);
                        continue;
                    }
                    dispatch.running_fingerprints.insert(entry.fingerprint.clone());
                    picked = Some(entry);
                    break;
                }
                for entry in deferred {
                    dispatch.queue.push(entry);
                }
                picked
            };

            match candidate {
                Some(entry) => {
                    let manager = self.clone();
                    let child_ctx = ctx.child_token();
                    tokio::spawn(async move {
                        manager.run_job(entry.job_id, entry.fingerprint, child_ctx).await;
                    });
                }
                None => {
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        _ = self.dispatch_notify.notified() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }

    #[instrument(skip(self, ctx), fields(job_id = %job_id))]
    async fn run_job(self: Arc<Self>, job_id: Uuid, fp: String, ctx: CancellationToken) {
        self.cancel_tokens.lock().await.insert(job_id, ctx.clone());

        let outcome = self.execute_job(job_id, &ctx).await;

        self.cancel_tokens.lock().await.remove(&job_id);
        {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.running_fingerprints.remove(&fp);
        }
        self.dispatch_notify.notify_one();
        self.progress_bus.drop_topic(job_id).await;

        if let Err(e) = outcome {
            warn!(job_id = %job_id, error = %e, "job execution error");
        }
    }

    async fn execute_job(
        self: &Arc<Self>,
        job_id: Uuid,
        ctx: &CancellationToken,
    ) -> Result<(), CoreError> {
        let mut job = {
            let index = self.index.read().await;
            index
                .get(&job_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?
        };

        if job.status == JobStatus::Cancelled {
            return Ok(());
        }

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.phase = "starting".to_string();
        self.persist(&job).await?;

        self.webhooks
            .publish(
                LifecycleEvent::JobStarted,
                EventData {
                    job_id,
                    job_name: job.definition.display_name.clone(),
                    source_id: job.definition.source_id.clone(),
                    duration_seconds: None,
                    result: None,
                    error: None,
                    progress: None,
                },
            )
            .await;

        let provider = self
            .providers
            .get(job.definition.provider)
            .ok_or_else(|| CoreError::Fatal(format!("provider {:?} not configured", job.definition.provider)))?;

        let conn = if self.pool.is_some() && provider.capabilities().supports_streaming {
            match self
                .pool
                .as_ref()
                .unwrap()
                .acquire(job.definition.provider.as_str(), ctx)
                .await
            {
                Ok(c) => Some(c),
                Err(e) => {
                    self.fail_job(&mut job, &e.to_string()).await?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut options = ExportOptions::from(&job.definition);
        if job.definition.incremental {
            let verdict = self
                .planner
                .plan(
                    provider.as_ref(),
                    &job.definition.source_id,
                    &PlanOptions {
                        force_full: job.definition.force_full,
                    },
                )
                .await?;
            match verdict {
                Verdict::FullRequired { reason } => {
                    info!(?reason, "planner verdict: full export required");
                    options.incremental = false;
                }
                Verdict::IncrementalPermitted { .. } => {
                    options.incremental = true;
                }
            }
        }

        let sink = ProgressSink::new(self.progress_bus.clone(), job_id);
        let retry_ctx = RetryContext {
            cancel: ctx,
            network_monitor: Some(&self.network_monitor),
        };

        let export_result = retry::execute(
            || {
                let provider = provider.clone();
                let options = options.clone();
                let sink = sink.clone();
                let source_id = job.definition.source_id.clone();
                async move { provider.export_vm(&source_id, &options, sink).await }
            },
            &self.retry_defaults,
            &retry_ctx,
        )
        .await;

        match export_result {
            Ok(result) => {
                if let Some(conn) = conn {
                    if let Some(pool) = &self.pool {
                        pool.release(conn, ReleaseOutcome::Healthy).await;
                    }
                }

                if ctx.is_cancelled() {
                    return self.cancel_job(&mut job).await;
                }

                if options.incremental || result.change_ids.is_some() {
                    if let Some(change_ids) = &result.change_ids {
                        self.store
                            .write_change_id_set(&ChangeIdSet {
                                vm_id: job.definition.source_id.clone(),
                                export_time: result.exported_at,
                                disk_change_ids: change_ids.clone(),
                            })
                            .await?;
                    }
                }

                job.status = JobStatus::Completed;
                job.percent = 100;
                job.phase = "completed".to_string();
                job.completed_at = Some(Utc::now());
                job.result = Some(crate::jobs::model::ResultArtifact {
                    path: result.artifact_path,
                    size_bytes: result.total_bytes,
                    checksum: result.checksum,
                });
                self.persist(&job).await?;

                let duration = job
                    .completed_at
                    .zip(job.started_at)
                    .map(|(c, s)| (c - s).num_milliseconds() as f64 / 1000.0);
                self.webhooks
                    .publish(
                        LifecycleEvent::JobCompleted,
                        EventData {
                            job_id,
                            job_name: job.definition.display_name.clone(),
                            source_id: job.definition.source_id.clone(),
                            duration_seconds: duration,
                            result: serde_json::to_value(&job.result).ok(),
                            error: None,
                            progress: None,
                        },
                    )
                    .await;
                Ok(())
            }
            Err(e) if matches!(e, CoreError::Cancelled) => {
                if let Some(conn) = conn {
                    if let Some(pool) = &self.pool {
                        pool.release(conn, ReleaseOutcome::Healthy).await;
                    }
                }
                self.cancel_job(&mut job).await
            }
            Err(e) => {
                if let Some(conn) = conn {
                    if let Some(pool) = &self.pool {
                        let outcome = if e.category() == crate::error::ErrorCategory::Transient
                            || e.category() == crate::error::ErrorCategory::NetworkDown
                        {
                            ReleaseOutcome::Discard
                        } else {
                            ReleaseOutcome::Healthy
                        };
                        pool.release(conn, outcome).await;
                    }
                }
                self.fail_job(&mut job, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn cancel_job(&self, job: &mut Job) -> Result<(), CoreError> {
        job.status = JobStatus::Cancelled;
        job.phase = "cancelled".to_string();
        job.completed_at = Some(Utc::now());
        self.persist(job).await?;
        self.webhooks
            .publish(
                LifecycleEvent::JobCancelled,
                EventData {
                    job_id: job.id(),
                    job_name: job.definition.display_name.clone(),
                    source_id: job.definition.source_id.clone(),
                    duration_seconds: None,
                    result: None,
                    error: None,
                    progress: None,
                },
            )
            .await;
        Ok(())
    }

    async fn fail_job(&self, job: &mut Job, error: &str) -> Result<(), CoreError> {
        job.status = JobStatus::Failed;
        job.phase = "failed".to_string();
        job.completed_at = Some(Utc::now());
        job.last_error = Some(error.to_string());
        self.persist(job).await?;
        self.webhooks
            .publish(
                LifecycleEvent::JobFailed,
                EventData {
                    job_id: job.id(),
                    job_name: job.definition.display_name.clone(),
                    source_id: job.definition.source_id.clone(),
                    duration_seconds: None,
                    result: None,
                    error: Some(error.to_string()),
                    progress: None,
                },
            )
            .await;
        Ok(())
    }

    async fn persist(&self, job: &Job) -> Result<(), CoreError> {
        self.index.write().await.insert(job.id(), job.clone());
        self.store.update_job(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{CompressionChoice, ExportFormat, Provider};
    use crate::network::NetworkMonitor;
    use crate::pool::StubProbe;
    use crate::provider::mock::MockProvider;
    use crate::provider::registry::ProviderRegistry;
    use crate::provider::{DiskInfo, VmInfo};
    use crate::store::memory::InMemoryStore;

    async fn test_manager() -> (Arc<JobManager>, Arc<MockProvider>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::new(Provider::Vsphere));
        provider.seed(VmInfo {
            id: "/dc/vm/testA".into(),
            display_name: "testA".into(),
            state: "running".into(),
            location_tag: "dc1".into(),
            disks: vec![DiskInfo {
                disk_key: "disk0".into(),
                capacity_bytes: 1024,
            }],
        });
        let providers = Arc::new(ProviderRegistry::builder().register(provider.clone()).build());
        let planner = Arc::new(IncrementalPlanner::new(store.clone()));
        let manager = JobManager::new(JobManagerDeps {
            store: store.clone(),
            providers,
            pool: None,
            planner,
            progress_bus: ProgressBus::new(),
            webhooks: Arc::new(WebhookDispatcher::new(store)),
            network_monitor: NetworkMonitor::new(vec![]),
            retry_defaults: RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            },
        });
        (manager, provider)
    }

    fn definition() -> JobDefinition {
        JobDefinition::builder()
            .display_name("testA")
            .provider(Provider::Vsphere)
            .source_id("/dc/vm/testA")
            .destination("/out/A")
            .format(ExportFormat::Ova)
            .compression(CompressionChoice::Enabled { level: 6 })
            .build()
    }

    #[tokio::test]
    async fn submit_then_duplicate_is_rejected_while_queued() {
        let (manager, _provider) = test_manager().await;
        manager.submit(definition()).await.unwrap();
        let result = manager.submit(definition()).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn dispatcher_runs_job_to_completion() {
        let (manager, _provider) = test_manager().await;
        let job_id = manager.submit(definition()).await.unwrap();

        let ctx = CancellationToken::new();
        let dispatcher_ctx = ctx.clone();
        let handle = tokio::spawn(manager.clone().run_dispatcher(dispatcher_ctx));

        let mut job = manager.get_job(job_id).await.unwrap();
        for _ in 0..200 {
            if let Some(j) = &job {
                if j.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            job = manager.get_job(job_id).await.unwrap();
        }

        ctx.cancel();
        let _ = handle.await;

        let job = job.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.percent, 100);
    }

    #[tokio::test]
    async fn cancel_pending_job_never_emits_started() {
        let (manager, _provider) = test_manager().await;
        let job_id = manager.submit(definition()).await.unwrap();
        manager.cancel(job_id).await.unwrap();
        let job = manager.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }
}
