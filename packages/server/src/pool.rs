//! C3 Connection Pool — bounded pool of authenticated hypervisor sessions
//! with health probing and idle eviction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub provider_tag: String,
    last_used: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    Discard,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub in_use: usize,
    pub idle: usize,
}

impl PoolStats {
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

struct State {
    idle: VecDeque<Connection>,
    in_use: usize,
    created: u64,
    reused: u64,
}

/// A cheap round-trip probe; a real provider would ping the hypervisor
/// session, here it's injected so the pool stays provider-agnostic.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, conn: &Connection) -> bool;
    async fn dial(&self, provider_tag: &str) -> Result<Connection, CoreError>;
}

pub struct ConnectionPool {
    state: Mutex<State>,
    notify: Notify,
    max_connections: usize,
    idle_timeout: Duration,
    health_check_interval: Duration,
    probe: Arc<dyn HealthProbe>,
}

impl ConnectionPool {
    pub fn new(
        max_connections: usize,
        idle_timeout: Duration,
        health_check_interval: Duration,
        probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                idle: VecDeque::new(),
                in_use: 0,
                created: 0,
                reused: 0,
            }),
            notify: Notify::new(),
            max_connections,
            idle_timeout,
            health_check_interval,
            probe,
        })
    }

    pub async fn acquire(
        &self,
        provider_tag: &str,
        ctx: &CancellationToken,
    ) -> Result<Connection, CoreError> {
        loop {
            {
                let mut state = self.state.lock().await;
                while let Some(conn) = state.idle.pop_front() {
                    if conn.last_used.elapsed() > self.health_check_interval
                        && !self.probe.probe(&conn).await
                    {
                        debug!(id = %conn.id, "discarding unhealthy idle connection");
                        continue;
                    }
                    state.in_use += 1;
                    state.reused += 1;
                    return Ok(conn);
                }
                if state.in_use + state.idle.len() < self.max_connections {
                    let conn = self.probe.dial(provider_tag).await?;
                    state.in_use += 1;
                    state.created += 1;
                    return Ok(conn);
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(CoreError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    pub async fn release(&self, mut conn: Connection, outcome: ReleaseOutcome) {
        let mut state = self.state.lock().await;
        state.in_use -= 1;
        if outcome == ReleaseOutcome::Healthy {
            conn.last_used = Instant::now();
            state.idle.push_back(conn);
        }
        drop(state);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            created: state.created,
            reused: state.reused,
            in_use: state.in_use,
            idle: state.idle.len(),
        }
    }

    /// Background sweeper evicting idle connections older than
    /// `idle_timeout`.
    pub async fn run_idle_sweeper(self: Arc<Self>, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.idle_timeout.min(Duration::from_secs(30)));
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    let mut state = self.state.lock().await;
                    let before = state.idle.len();
                    state.idle.retain(|c| c.last_used.elapsed() <= self.idle_timeout);
                    let evicted = before - state.idle.len();
                    if evicted > 0 {
                        info!(evicted, "idle sweeper evicted connections");
                    }
                }
            }
        }
    }
}

pub struct StubProbe;

#[async_trait::async_trait]
impl HealthProbe for StubProbe {
    async fn probe(&self, _conn: &Connection) -> bool {
        true
    }

    async fn dial(&self, provider_tag: &str) -> Result<Connection, CoreError> {
        Ok(Connection {
            id: Uuid::new_v4(),
            provider_tag: provider_tag.to_string(),
            last_used: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_release_round_trips_in_use_count() {
        let pool = ConnectionPool::new(
            2,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(StubProbe),
        );
        let ctx = CancellationToken::new();
        let before = pool.stats().await.in_use;
        let conn = pool.acquire("vsphere", &ctx).await.unwrap();
        assert_eq!(pool.stats().await.in_use, before + 1);
        pool.release(conn, ReleaseOutcome::Healthy).await;
        assert_eq!(pool.stats().await.in_use, before);
    }

    #[tokio::test]
    async fn created_plus_reused_equals_total_acquires() {
        let pool = ConnectionPool::new(
            1,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(StubProbe),
        );
        let ctx = CancellationToken::new();
        let c1 = pool.acquire("vsphere", &ctx).await.unwrap();
        pool.release(c1, ReleaseOutcome::Healthy).await;
        let c2 = pool.acquire("vsphere", &ctx).await.unwrap();
        pool.release(c2, ReleaseOutcome::Healthy).await;
        let stats = pool.stats().await;
        assert_eq!(stats.created + stats.reused, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn discard_on_release_does_not_return_to_idle() {
        let pool = ConnectionPool::new(
            1,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Arc::new(StubProbe),
        );
        let ctx = CancellationToken::new();
        let conn = pool.acquire("vsphere", &ctx).await.unwrap();
        pool.release(conn, ReleaseOutcome::Discard).await;
        assert_eq!(pool.stats().await.idle, 0);
    }
}
