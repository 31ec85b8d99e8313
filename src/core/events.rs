use crate::core::domain::{BatchId, DeviceEntry, FileId};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info};

/// Everything observable that happens in a node.
///
/// Progress events fire after every acknowledged chunk; the terminal per-file
/// events (`FileCompleted` / `FileFailed` / `FileCanceled`) fire exactly once.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    DeviceDiscovered { device: DeviceEntry },
    BatchApproved { batch_id: BatchId },
    BatchRejected { batch_id: BatchId },
    FileProgress { file_id: FileId, name: String, percent: f32 },
    BatchProgress { batch_id: BatchId, percent: f32 },
    FileCompleted { file_id: FileId, name: String },
    FileFailed { file_id: FileId, name: String, reason: String },
    FileCanceled { file_id: FileId, name: String },
    FileReceived { file_id: FileId, name: String, path: PathBuf },
    BatchCompleted { batch_id: BatchId, completed: usize, requested: usize },
}

/// Result type for event handlers
pub type EventResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Event handler trait for core events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: CoreEvent) -> EventResult;
}

/// Fans events out to registered async handlers and channel subscribers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CoreEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Channel-style subscription; the receiver sees every event published
    /// after this call. Closed receivers are pruned on the next publish.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub async fn publish(&self, event: CoreEvent) {
        // Notify all handlers. Clone Arcs first to avoid holding the lock across await.
        let handlers_snapshot = {
            let handlers = self.handlers.read().await;
            handlers.clone()
        };
        let futures = handlers_snapshot.into_iter().map(|h| {
            let ev = event.clone();
            async move { h.handle_event(ev).await }
        });
        let results = join_all(futures).await;
        for res in results {
            if let Err(e) = res {
                error!("Error in event handler: {}", e);
            }
        }

        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event handler that logs every core event
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: CoreEvent) -> EventResult {
        match &event {
            CoreEvent::DeviceDiscovered { device } => {
                info!(
                    "Device discovered: '{}' ({}) at {}",
                    device.name, device.os, device.addr
                );
            }
            CoreEvent::BatchApproved { batch_id } => {
                info!("Batch approved: {}", batch_id);
            }
            CoreEvent::BatchRejected { batch_id } => {
                info!("Batch rejected: {}", batch_id);
            }
            CoreEvent::FileProgress { name, percent, .. } => {
                info!("Progress '{}': {:.2}%", name, percent);
            }
            CoreEvent::BatchProgress { batch_id, percent } => {
                info!("Batch {} progress: {:.2}%", batch_id, percent);
            }
            CoreEvent::FileCompleted { name, .. } => {
                info!("File sent: '{}'", name);
            }
            CoreEvent::FileFailed { name, reason, .. } => {
                error!("File failed: '{}': {}", name, reason);
            }
            CoreEvent::FileCanceled { name, .. } => {
                info!("File canceled: '{}'", name);
            }
            CoreEvent::FileReceived { name, path, .. } => {
                info!("File received: '{}' -> {}", name, path.display());
            }
            CoreEvent::BatchCompleted {
                batch_id,
                completed,
                requested,
            } => {
                info!(
                    "Batch {} finished: {}/{} files completed",
                    batch_id, completed, requested
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingHandler {
        seen: Mutex<Vec<CoreEvent>>,
    }

    #[async_trait]
    impl EventHandler for CollectingHandler {
        async fn handle_event(&self, event: CoreEvent) -> EventResult {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handlers_receive_published_events() {
        let bus = EventBus::new();
        let handler = Arc::new(CollectingHandler {
            seen: Mutex::new(Vec::new()),
        });
        bus.register_handler(handler.clone()).await;

        bus.publish(CoreEvent::BatchApproved {
            batch_id: BatchId::from_string("batch-1".to_string()),
        })
        .await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            CoreEvent::BatchApproved { batch_id } => assert_eq!(batch_id.as_str(), "batch-1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::BatchRejected {
            batch_id: BatchId::from_string("batch-2".to_string()),
        })
        .await;

        let received = rx.recv().await.unwrap();
        match received {
            CoreEvent::BatchRejected { batch_id } => assert_eq!(batch_id.as_str(), "batch-2"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        // Publishing into a closed channel must not error or leak the sender.
        bus.publish(CoreEvent::BatchCompleted {
            batch_id: BatchId::new(),
            completed: 0,
            requested: 0,
        })
        .await;

        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}
