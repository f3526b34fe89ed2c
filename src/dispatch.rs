//! The run-request FIFO (spec component C7). `Dispatcher` only owns the
//! queue and the dedup guard; the actual dispatch procedure — entering the
//! serializer, invoking the executor, rescheduling — lives on `Scheduler`,
//! since it needs the store, the trigger manager, and the executor handle
//! together.

use crate::job::JobId;
use crate::trigger::TriggerSource;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{Mutex, Notify};

/// A single queued request to run a job.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: JobId,
    pub source: TriggerSource,
    pub scheduled_at_ms: i64,
    pub force: bool,
}

struct Inner {
    queue: VecDeque<RunRequest>,
    queued_job_ids: HashSet<JobId>,
}

/// FIFO of run requests plus a dedup set. Enqueuing a job that already has a
/// queued request is a no-op; the "already running" half of the dedup rule
/// is checked by the caller against the serializer before calling
/// [`Dispatcher::enqueue`], since that requires reading job state.
pub struct Dispatcher {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued_job_ids: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a request. Returns `false` (no-op) if the job already has a
    /// queued request.
    pub async fn enqueue(&self, request: RunRequest) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.queued_job_ids.insert(request.job_id.clone()) {
            return false;
        }
        inner.queue.push_back(request);
        self.notify.notify_one();
        true
    }

    /// Pops the next request, or waits for one to arrive.
    pub async fn next(&self) -> RunRequest {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(request) = inner.queue.pop_front() {
                    inner.queued_job_ids.remove(&request.job_id);
                    return request;
                }
            }
            self.notify.notified().await;
        }
    }

    pub async fn is_queued(&self, job_id: &str) -> bool {
        self.inner.lock().await.queued_job_ids.contains(job_id)
    }

    pub async fn remove_queued(&self, job_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.queued_job_ids.remove(job_id);
        inner.queue.retain(|r| r.job_id != job_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
