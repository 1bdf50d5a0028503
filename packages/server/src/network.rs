//! C1 Network Monitor — observes link state and fans out transitions to
//! subscribers with bounded, drop-oldest buffering.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const SUBSCRIBER_BUFFER: usize = 32;
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Up,
    Down,
    Degraded,
    Unknown,
}

struct Inner {
    state: watch::Sender<NetworkState>,
    notify: broadcast::Sender<NetworkState>,
}

/// Process-wide singleton; lifecycle = process lifetime.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
    probe_hosts: Arc<Vec<(String, u16)>>,
}

impl NetworkMonitor {
    pub fn new(probe_hosts: Vec<(String, u16)>) -> Self {
        let (state_tx, _) = watch::channel(NetworkState::Unknown);
        let (notify_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: state_tx,
                notify: notify_tx,
            }),
            probe_hosts: Arc::new(probe_hosts),
        }
    }

    pub fn state(&self) -> NetworkState {
        *self.inner.state.borrow()
    }

    /// A stream of state transitions, bounded and drop-oldest on overflow
    /// (a lagged receiver simply observes the latest state on next recv).
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
        self.inner.notify.subscribe()
    }

    /// Waits until the state is Up or Degraded (treated as Up by the retry
    /// pauser), or until `ctx` is cancelled.
    pub async fn wait_for_up(&self, ctx: &CancellationToken) -> Result<(), crate::CoreError> {
        if matches!(self.state(), NetworkState::Up | NetworkState::Degraded) {
            return Ok(());
        }
        let mut rx = self.inner.state.subscribe();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(crate::CoreError::Cancelled),
                changed = rx.changed() => {
                    changed.map_err(|_| crate::CoreError::Fatal("network monitor closed".into()))?;
                    if matches!(*rx.borrow(), NetworkState::Up | NetworkState::Degraded) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs the polling loop (and, on platforms that expose them, would
    /// subscribe to kernel link-state events; this daemon falls back to
    /// polling-only, which the contract permits at increased latency).
    pub async fn run(self, poll_interval: Duration, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("network monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let observed = self.probe().await;
                    self.transition(observed);
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> NetworkState {
        if self.probe_hosts.is_empty() {
            return NetworkState::Unknown;
        }
        let mut reachable = 0usize;
        for (host, port) in self.probe_hosts.iter() {
            let addr = format!("{host}:{port}");
            match timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => reachable += 1,
                _ => debug!(addr, "probe host unreachable"),
            }
        }
        if reachable == 0 {
            NetworkState::Down
        } else if reachable == self.probe_hosts.len() {
            NetworkState::Up
        } else {
            NetworkState::Degraded
        }
    }

    pub(crate) fn transition(&self, new_state: NetworkState) {
        let prior = self.state();
        if prior == new_state {
            return;
        }
        let _ = self.inner.state.send(new_state);
        let _ = self.inner.notify.send(new_state);
        info!(?prior, ?new_state, "network state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_unknown_and_transitions() {
        let mon = NetworkMonitor::new(vec![]);
        assert_eq!(mon.state(), NetworkState::Unknown);
        mon.transition(NetworkState::Up);
        assert_eq!(mon.state(), NetworkState::Up);
    }

    #[tokio::test]
    async fn wait_for_up_returns_immediately_when_already_up() {
        let mon = NetworkMonitor::new(vec![]);
        mon.transition(NetworkState::Up);
        let ctx = CancellationToken::new();
        mon.wait_for_up(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_up_unblocks_on_transition() {
        let mon = NetworkMonitor::new(vec![]);
        mon.transition(NetworkState::Down);
        let ctx = CancellationToken::new();
        let mon2 = mon.clone();
        let waiter = tokio::spawn(async move { mon2.wait_for_up(&ctx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mon.transition(NetworkState::Up);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_up_cancels() {
        let mon = NetworkMonitor::new(vec![]);
        mon.transition(NetworkState::Down);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = mon.wait_for_up(&ctx).await;
        assert!(matches!(result, Err(crate::CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn subscribers_see_transitions_in_order() {
        let mon = NetworkMonitor::new(vec![]);
        let mut rx = mon.subscribe();
        mon.transition(NetworkState::Up);
        mon.transition(NetworkState::Degraded);
        assert_eq!(rx.recv().await.unwrap(), NetworkState::Up);
        assert_eq!(rx.recv().await.unwrap(), NetworkState::Degraded);
    }
}
