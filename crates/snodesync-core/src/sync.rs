use crate::time::now_ms;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushJob {
    pub id: Uuid,
    pub queued_at_ms: u64,
}

#[derive(Default)]
struct SchedulerState {
    pending: Option<PushJob>,
    queued_total: u64,
}

/// Holds at most one pending config push job.
#[derive(Clone, Default)]
pub struct ConfigSyncScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ConfigSyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a push job unless one is already waiting. Returns whether a
    /// new job was queued.
    pub async fn queue_new_job_if_needed(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.pending.is_some() {
            log::debug!("config push already pending");
            return false;
        }
        let job = PushJob {
            id: Uuid::new_v4(),
            queued_at_ms: now_ms(),
        };
        log::info!("queued config push job {}", job.id);
        state.pending = Some(job);
        state.queued_total += 1;
        true
    }

    /// Hands the pending job to the push runner.
    pub async fn take_pending(&self) -> Option<PushJob> {
        self.state.lock().await.pending.take()
    }

    pub async fn is_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    pub async fn queued_total(&self) -> u64 {
        self.state.lock().await.queued_total
    }
}
