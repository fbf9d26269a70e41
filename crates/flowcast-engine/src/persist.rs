use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowcast_core::event::EventBus;
use flowcast_core::traits::SnapshotSink;
use flowcast_core::types::{EngineEvent, GraphSnapshot};

/// Debounced background writer of graph snapshots.
///
/// Every `notify` replaces the pending snapshot; the sink sees the latest
/// one after a quiet period of `debounce`. Shutdown writes whatever is still
/// pending.
pub struct Persister {
    tx: watch::Sender<Option<GraphSnapshot>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn SnapshotSink>, debounce: Duration, events: Arc<EventBus>) -> Self {
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(sink, rx, debounce, cancel.clone(), events));
        Self {
            tx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a snapshot. Transient fields are stripped here.
    pub fn notify(&self, snapshot: &GraphSnapshot) {
        self.tx.send_replace(Some(snapshot.stripped()));
    }

    /// Stop the writer after flushing the pending snapshot.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Persister task ended abnormally");
            }
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    sink: Arc<dyn SnapshotSink>,
    mut rx: watch::Receiver<Option<GraphSnapshot>>,
    debounce: Duration,
    cancel: CancellationToken,
    events: Arc<EventBus>,
) {
    debug!(debounce_ms = debounce.as_millis() as u64, "Persister started");

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }

        // Quiet period: every new snapshot restarts the timer.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        write_latest(sink.as_ref(), &mut rx, &events).await;
        if cancel.is_cancelled() {
            info!("Persister stopped");
            return;
        }
    }

    if rx.has_changed().unwrap_or(false) {
        write_latest(sink.as_ref(), &mut rx, &events).await;
    }
    info!("Persister stopped");
}

async fn write_latest(
    sink: &dyn SnapshotSink,
    rx: &mut watch::Receiver<Option<GraphSnapshot>>,
    events: &EventBus,
) {
    let pending = rx.borrow_and_update().clone();
    let Some(snapshot) = pending else { return };
    let (nodes, edges) = (snapshot.nodes.len(), snapshot.edges.len());

    match sink.persist(snapshot).await {
        Ok(()) => {
            debug!(nodes, edges, "Snapshot persisted");
            events.publish(EngineEvent::SnapshotPersisted { nodes, edges });
        }
        Err(e) => warn!(error = %e, "Failed to persist snapshot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_core::types::*;
    use flowcast_test_utils::RecordingSink;

    fn snap(n: usize) -> GraphSnapshot {
        GraphSnapshot {
            nodes: (0..n)
                .map(|i| {
                    let mut node = WorkflowNode::new(format!("n{}", i), NodeType::ImageGen);
                    node.data.loading = true;
                    node
                })
                .collect(),
            edges: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_collapse_to_latest() {
        let sink = Arc::new(RecordingSink::new());
        let persister = Persister::spawn(
            sink.clone(),
            Duration::from_millis(1500),
            Arc::new(EventBus::default()),
        );

        persister.notify(&snap(1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        persister.notify(&snap(2));
        persister.notify(&snap(3));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let written = sink.snapshots();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].nodes.len(), 3);
        assert!(written[0].nodes.iter().all(|n| !n.data.loading));

        persister.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let sink = Arc::new(RecordingSink::new());
        let persister = Persister::spawn(
            sink.clone(),
            Duration::from_secs(60),
            Arc::new(EventBus::default()),
        );
        persister.notify(&snap(2));
        persister.shutdown().await;

        assert_eq!(sink.snapshots().len(), 1);
    }
}
