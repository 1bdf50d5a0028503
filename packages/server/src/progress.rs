//! C10 Progress Bus — single-process publish/subscribe over job-progress
//! snapshots. Fan-out subscribers have bounded buffers; on overflow the
//! oldest snapshot is dropped and a drop counter is incremented.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const SUBSCRIBER_BUFFER: usize = 64;
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub phase: String,
    pub percent: u8,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub eta_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

struct Topic {
    sender: broadcast::Sender<ProgressSnapshot>,
    last_emitted: Option<Instant>,
    last_percent: u8,
}

/// In-process pub/sub keyed by job id.
#[derive(Clone)]
pub struct ProgressBus {
    topics: Arc<Mutex<HashMap<Uuid, Topic>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressSnapshot> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(SUBSCRIBER_BUFFER).0,
            last_emitted: None,
            last_percent: 0,
        });
        topic.sender.subscribe()
    }

    /// Publishes unconditionally (lifecycle transitions bypass the
    /// progress rate limit; only `publish_progress` is throttled).
    pub async fn publish(&self, snapshot: ProgressSnapshot) {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(snapshot.job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(SUBSCRIBER_BUFFER).0,
            last_emitted: None,
            last_percent: 0,
        });
        topic.last_percent = snapshot.percent;
        topic.last_emitted = Some(Instant::now());
        let _ = topic.sender.send(snapshot);
    }

    /// Rate-limited to at most one emission per ~200ms per job (spec
    /// §4.7 step 4c). Percent is never allowed to decrease.
    pub async fn publish_progress(&self, mut snapshot: ProgressSnapshot) {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(snapshot.job_id).or_insert_with(|| Topic {
            sender: broadcast::channel(SUBSCRIBER_BUFFER).0,
            last_emitted: None,
            last_percent: 0,
        });

        if snapshot.percent < topic.last_percent {
            snapshot.percent = topic.last_percent;
        }

        let due = topic
            .last_emitted
            .map(|t| t.elapsed() >= MIN_EMIT_INTERVAL)
            .unwrap_or(true);
        if !due && snapshot.percent < 100 {
            return;
        }

        topic.last_percent = snapshot.percent;
        topic.last_emitted = Some(Instant::now());
        let _ = topic.sender.send(snapshot);
    }

    pub async fn drop_topic(&self, job_id: Uuid) {
        self.topics.lock().await.remove(&job_id);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to a provider's `export_vm` so it can report progress without
/// depending on the Job Manager or the HTTP layer.
#[derive(Clone)]
pub struct ProgressSink {
    bus: ProgressBus,
    job_id: Uuid,
}

impl ProgressSink {
    pub fn new(bus: ProgressBus, job_id: Uuid) -> Self {
        Self { bus, job_id }
    }

    pub async fn emit(&self, phase: &str, percent: u8, bytes_done: u64, bytes_total: u64) {
        self.bus
            .publish_progress(ProgressSnapshot {
                job_id: self.job_id,
                phase: phase.to_string(),
                percent,
                bytes_done,
                bytes_total,
                eta_seconds: None,
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn percent_never_decreases() {
        let bus = ProgressBus::new();
        let job_id = Uuid::new_v4();
        let mut rx = bus.subscribe(job_id).await;

        bus.publish_progress(ProgressSnapshot {
            job_id,
            phase: "streaming".into(),
            percent: 50,
            bytes_done: 50,
            bytes_total: 100,
            eta_seconds: None,
            timestamp: Utc::now(),
        })
        .await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.percent, 50);

        tokio::time::sleep(MIN_EMIT_INTERVAL).await;
        bus.publish_progress(ProgressSnapshot {
            job_id,
            phase: "streaming".into(),
            percent: 10,
            bytes_done: 10,
            bytes_total: 100,
            eta_seconds: None,
            timestamp: Utc::now(),
        })
        .await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percent, 50);
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let bus = ProgressBus::new();
        let job_id = Uuid::new_v4();
        let mut a = bus.subscribe(job_id).await;
        let mut b = bus.subscribe(job_id).await;
        bus.publish(ProgressSnapshot {
            job_id,
            phase: "started".into(),
            percent: 0,
            bytes_done: 0,
            bytes_total: 0,
            eta_seconds: None,
            timestamp: Utc::now(),
        })
        .await;
        assert_eq!(a.recv().await.unwrap().percent, 0);
        assert_eq!(b.recv().await.unwrap().percent, 0);
    }
}
