use crate::error::CoreError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    /// Our own profile was applied from synced configuration.
    ConfigurationMessageReceived { display_name: String },
    /// A fire-and-forget task failed; nothing awaited it.
    BackgroundTaskFailed { task: String, reason: String },
}

pub type EventReceiver = broadcast::Receiver<CoreEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn task_failed(&self, task: impl Into<String>, reason: impl ToString) {
        let task = task.into();
        let reason = reason.to_string();
        log::warn!("background task {} failed: {}", task, reason);
        self.publish(CoreEvent::BackgroundTaskFailed { task, reason });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Fire-and-forget tasks. Failures go to the event bus; nobody awaits the
/// result except `drain`, used on shutdown.
#[derive(Clone)]
pub struct BackgroundTasks {
    events: EventBus,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn spawn<F>(&self, task: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let task = task.into();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                events.task_failed(task, e);
            }
        });
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits for every task spawned so far.
    pub async fn drain(&self) {
        let pending: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                log::warn!("background task panicked or was cancelled: {}", e);
            }
        }
    }
}
