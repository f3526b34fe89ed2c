//! The injected executor contract. The scheduler never knows what an
//! executor actually does beyond a success/error reply.

use crate::job::{Job, RunId};
use crate::trigger::TriggerSource;

/// Read-only context handed to the executor for a single run. The job is a
/// deep copy — the executor cannot reach back into scheduler state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job: Job,
    pub run_id: RunId,
    pub source: TriggerSource,
    pub scheduled_at_ms: i64,
}

/// Result of a single run.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

impl ExecutorOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// External collaborator invoked by the dispatcher. No dependency flows the
/// other way: the scheduler passes only the job snapshot and run metadata,
/// never a mutable reference.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> ExecutorOutcome;
}
