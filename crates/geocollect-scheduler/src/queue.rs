use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use geocollect_core::{InstanceId, JobId};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::registry::Registry;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    closed: bool,
}

/// FIFO of job ids waiting for the dispatcher.
///
/// Entries are bare ids; the pipeline re-reads the job from the registry when
/// it runs. The same id may be queued more than once.
pub struct RunQueue {
    instance_id: InstanceId,
    registry: Arc<Registry>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RunQueue {
    pub fn new(instance_id: InstanceId, registry: Arc<Registry>) -> Self {
        Self {
            instance_id,
            registry,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `job_id` and wake the dispatcher.
    ///
    /// Returns `false` without queuing when the job is unknown, owned by
    /// another instance, or the queue has been closed.
    pub fn enqueue(&self, job_id: JobId) -> bool {
        match self.registry.owner_of(job_id) {
            Some(owner) if owner == self.instance_id => {}
            Some(owner) => {
                trace!(%job_id, %owner, instance_id = %self.instance_id, "foreign job not queued");
                return false;
            }
            None => {
                debug!(%job_id, "unknown job not queued");
                return false;
            }
        }

        {
            let mut state = self.state();
            if state.closed {
                debug!(%job_id, "queue closed, job not queued");
                return false;
            }
            state.pending.push_back(job_id);
        }
        self.notify.notify_one();
        debug!(%job_id, "job queued");
        true
    }

    /// Take every pending id, oldest first.
    pub fn dequeue_all(&self) -> Vec<JobId> {
        self.state().pending.drain(..).collect()
    }

    /// Drop queued entries of `job_id`. Returns how many were removed.
    pub fn purge(&self, job_id: JobId) -> usize {
        let mut state = self.state();
        let before = state.pending.len();
        state.pending.retain(|id| *id != job_id);
        before - state.pending.len()
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Refuse further enqueues and wake the dispatcher so it can observe it.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Resolves after the next enqueue or close. A notification sent while
    /// nobody waits is kept for the next caller.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
