//! Delayed write-behind of session counters.
//!
//! Ingest marks a session dirty; the flusher writes every dirty session
//! once the trailing delay after the first mark has elapsed. Reads never
//! wait on this; they go through the in-memory runtime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use classwatch_core::Storage;

use super::runtime::RuntimeTable;

enum FlushCommand {
    Mark(String),
    FlushAll(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct CounterFlusher {
    tx: mpsc::UnboundedSender<FlushCommand>,
}

impl CounterFlusher {
    pub fn spawn(
        storage: Arc<Storage>,
        runtimes: Arc<RuntimeTable>,
        delay: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(storage, runtimes, delay, rx));
        (Self { tx }, handle)
    }

    pub fn mark(&self, session_id: &str) {
        if self.tx.send(FlushCommand::Mark(session_id.to_string())).is_err() {
            tracing::warn!(session_id, "Counter flusher is gone; progress not scheduled");
        }
    }

    /// Write everything pending now. Returns how many sessions were written.
    pub async fn flush_all(&self) -> usize {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(FlushCommand::FlushAll(ack_tx)).is_err() {
            return 0;
        }
        ack_rx.await.unwrap_or(0)
    }
}

async fn run(
    storage: Arc<Storage>,
    runtimes: Arc<RuntimeTable>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<FlushCommand>,
) {
    let mut pending: HashSet<String> = HashSet::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(FlushCommand::Mark(session_id)) => {
                    pending.insert(session_id);
                    deadline.get_or_insert_with(|| Instant::now() + delay);
                }
                Some(FlushCommand::FlushAll(ack)) => {
                    let written = flush(&storage, &runtimes, &mut pending).await;
                    deadline = None;
                    let _ = ack.send(written);
                }
                None => {
                    flush(&storage, &runtimes, &mut pending).await;
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                flush(&storage, &runtimes, &mut pending).await;
                deadline = None;
            }
        }
    }
}

async fn flush(storage: &Storage, runtimes: &RuntimeTable, pending: &mut HashSet<String>) -> usize {
    let mut written = 0;
    for session_id in pending.drain() {
        // evicted runtimes were persisted on the way out
        let Some(runtime) = runtimes.get(&session_id).await else {
            continue;
        };
        let runtime = runtime.lock().await;
        match runtime.persist(storage) {
            Ok(()) => written += 1,
            Err(e) => tracing::warn!(session_id = %session_id, "Failed to flush session progress: {}", e),
        }
    }
    if written > 0 {
        tracing::debug!(sessions = written, "Flushed session progress");
    }
    written
}
