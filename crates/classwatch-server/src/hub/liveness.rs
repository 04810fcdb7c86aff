//! Liveness Monitor
//!
//! Ping/pong sweep that finds half-open sockets. A connection still waiting
//! on the previous probe when the next sweep comes round is closed with
//! [`close_code::UNRESPONSIVE`] and deregistered, which also drops its
//! subscription.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BroadcastHub, close_code};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

pub struct LivenessMonitor {
    hub: Arc<BroadcastHub>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(hub: Arc<BroadcastHub>, interval: Duration) -> Self {
        Self { hub, interval }
    }

    /// One probe round over a snapshot of the registry. Each connection is
    /// touched on its own; no lock is held for the whole sweep.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for connection in self.hub.connections().await {
            if connection.begin_probe() {
                tracing::info!(
                    connection_id = %connection.id(),
                    user_id = connection.user_id(),
                    "Evicting unresponsive connection"
                );
                connection.close(close_code::UNRESPONSIVE, "liveness probe unanswered");
                self.hub.deregister(connection.id()).await;
                report.evicted += 1;
            } else {
                // a closed queue shows up as unanswered on the next sweep
                connection.ping();
                report.probed += 1;
            }
        }
        report
    }

    /// Run sweeps until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick fires immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("Liveness monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.sweep().await;
                        if report.evicted > 0 {
                            tracing::info!(
                                probed = report.probed,
                                evicted = report.evicted,
                                "Liveness sweep"
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::hub::tests::StaticDirectory;
    use crate::messages::ServerMessage;
    use classwatch_core::SessionStatus;

    #[tokio::test]
    async fn test_silent_connection_evicted_after_two_sweeps() {
        let hub = BroadcastHub::new();
        let dir = StaticDirectory::default().with("s1", "u", SessionStatus::Running);
        let (silent, mut rx) = hub.register("u").await;
        hub.subscribe(&silent, "s1", &dir).await.unwrap();
        let monitor = LivenessMonitor::new(Arc::clone(&hub), Duration::from_secs(30));

        let first = monitor.sweep().await;
        assert_eq!(first, SweepReport { probed: 1, evicted: 0 });
        assert_eq!(rx.recv().await, Some(Outbound::Ping));

        let second = monitor.sweep().await;
        assert_eq!(second, SweepReport { probed: 0, evicted: 1 });
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Close { code: close_code::UNRESPONSIVE, .. })
        ));

        assert_eq!(hub.stats().await.connections, 0);
        assert_eq!(hub.broadcast("s1", &ServerMessage::error("x", "TEST")).await, 0);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection() {
        let hub = BroadcastHub::new();
        let (conn, _rx) = hub.register("u").await;
        let monitor = LivenessMonitor::new(Arc::clone(&hub), Duration::from_secs(30));

        for _ in 0..3 {
            monitor.sweep().await;
            conn.mark_alive();
        }
        assert_eq!(hub.stats().await.connections, 1);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let hub = BroadcastHub::new();
        let (tx, rx) = watch::channel(false);
        let handle = LivenessMonitor::new(hub, Duration::from_millis(10)).spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
