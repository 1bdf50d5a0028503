//! C9 Webhook Dispatcher — fans events out to configured subscriptions,
//! with per-subscription retry budgets. Failures after exhaustion are
//! logged but never fatal to job execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::retry::{self, BackoffDiscipline, RetryContext, RetryPolicy};
use crate::store::models::WebhookSubscription;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobSubmitted,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::JobSubmitted => "job.submitted",
            LifecycleEvent::JobStarted => "job.started",
            LifecycleEvent::JobProgress => "job.progress",
            LifecycleEvent::JobCompleted => "job.completed",
            LifecycleEvent::JobFailed => "job.failed",
            LifecycleEvent::JobCancelled => "job.cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventData {
    pub job_id: Uuid,
    pub job_name: String,
    pub source_id: String,
    pub duration_seconds: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: &'static str,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    client: Client,
    last_progress_sent: Mutex<HashMap<(Uuid, Uuid), Instant>>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            client: Client::new(),
            last_progress_sent: Mutex::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, event: LifecycleEvent, data: EventData) {
        let subs = match self.store.list_webhook_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                error!(error = %e, "failed to load webhook subscriptions");
                return;
            }
        };

        let payload = WebhookPayload {
            event: event.name(),
            timestamp: Utc::now(),
            data: data.clone(),
        };

        for sub in subs {
            if !sub.events.iter().any(|e| e == event.name()) {
                continue;
            }

            if matches!(event, LifecycleEvent::JobProgress)
                && !self.progress_rate_ok(sub.id, data.job_id).await
            {
                continue;
            }

            self.deliver(&sub, &payload).await;
        }
    }

    async fn progress_rate_ok(&self, sub_id: Uuid, job_id: Uuid) -> bool {
        let mut last_sent = self.last_progress_sent.lock().await;
        let key = (sub_id, job_id);
        let now = Instant::now();
        match last_sent.get(&key) {
            Some(prev) if now.duration_since(*prev) < Duration::from_secs(1) => false,
            _ => {
                last_sent.insert(key, now);
                true
            }
        }
    }

    async fn deliver(&self, sub: &WebhookSubscription, payload: &WebhookPayload) {
        let policy = RetryPolicy {
            max_attempts: sub.retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            discipline: BackoffDiscipline::Exponential,
            jitter: true,
            wait_for_network: false,
            retryable_categories: Vec::new(),
        };
        let cancel = CancellationToken::new();
        let ctx = RetryContext {
            cancel: &cancel,
            network_monitor: None,
        };

        let result = retry::execute(
            || async {
                let mut request = self
                    .client
                    .post(&sub.url)
                    .timeout(sub.timeout)
                    .json(payload);
                for (k, v) in &sub.headers {
                    request = request.header(k, v);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| CoreError::Transient(e.to_string()))?;
                if response.status().is_server_error() {
                    return Err(CoreError::Transient(format!(
                        "webhook {} returned {}",
                        sub.url,
                        response.status()
                    )));
                }
                Ok(())
            },
            &policy,
            &ctx,
        )
        .await;

        if let Err(e) = result {
            warn!(url = %sub.url, error = %e, "webhook delivery exhausted retries");
        }
    }
}
