//! Records persisted by C4, beyond the Job/JobDefinition already defined
//! in `jobs::model`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::JobDefinition;
use crate::retry::{BackoffDiscipline, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredState {
    Completed,
    Failed,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEntry {
    pub job_id: Uuid,
    pub required_state: RequiredState,
    /// seconds; 0 = unbounded.
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_of_day: chrono::NaiveTime,
    pub end_of_day: chrono::NaiveTime,
    pub days_of_week: Vec<chrono::Weekday>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    pub max_concurrent: u32,
    pub skip_if_running: bool,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            skip_if_running: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdvancedConfig {
    pub dependencies: Vec<DependencyEntry>,
    pub retry_policy: Option<SerializableRetryPolicy>,
    pub time_windows: Vec<TimeWindow>,
    pub priority: i32,
    pub concurrency: ConcurrencyPolicy,
}

/// `RetryPolicy` as persisted; `BackoffDiscipline` needs serde for this to
/// round-trip through JSON columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub discipline: String,
    pub jitter: bool,
    pub wait_for_network: bool,
}

impl From<&RetryPolicy> for SerializableRetryPolicy {
    fn from(p: &RetryPolicy) -> Self {
        Self {
            max_attempts: p.max_attempts,
            initial_delay_ms: p.initial_delay.as_millis() as u64,
            max_delay_ms: p.max_delay.as_millis() as u64,
            multiplier: p.multiplier,
            discipline: match p.discipline {
                BackoffDiscipline::Linear => "linear".into(),
                BackoffDiscipline::Exponential => "exponential".into(),
                BackoffDiscipline::Fibonacci => "fibonacci".into(),
            },
            jitter: p.jitter,
            wait_for_network: p.wait_for_network,
        }
    }
}

impl From<&SerializableRetryPolicy> for RetryPolicy {
    fn from(p: &SerializableRetryPolicy) -> Self {
        Self {
            max_attempts: p.max_attempts,
            initial_delay: std::time::Duration::from_millis(p.initial_delay_ms),
            max_delay: std::time::Duration::from_millis(p.max_delay_ms),
            multiplier: p.multiplier,
            discipline: match p.discipline.as_str() {
                "linear" => BackoffDiscipline::Linear,
                "fibonacci" => BackoffDiscipline::Fibonacci,
                _ => BackoffDiscipline::Exponential,
            },
            jitter: p.jitter,
            wait_for_network: p.wait_for_network,
            retryable_categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub template: JobDefinition,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub advanced: AdvancedConfig,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub schedule_id: Uuid,
    pub job_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub terminal_status: Option<crate::jobs::model::JobStatus>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeIdSet {
    pub vm_id: String,
    pub export_time: DateTime<Utc>,
    pub disk_change_ids: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub headers: HashMap<String, String>,
    pub timeout: std::time::Duration,
    pub retry: RetryPolicySummary,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicySummary {
    pub max_attempts: u32,
}
