//! Trigger sources: absolute timers, cron ticks, manual requests, and
//! startup catch-up. Pure scheduling math lives here so it can be unit
//! tested without a running timer; the [`TriggerManager`] owns the actual
//! per-job timer/cron-handle bookkeeping.

use crate::clock::SharedClock;
use crate::cron_eval;
use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Platform timers are capped at this slice; a longer wait re-arms itself
/// and re-checks the target on each wake.
const MAX_TIMER_SLICE_MS: i64 = 24 * 60 * 60 * 1000;

/// What caused a run request to be enqueued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Timer,
    Cron,
    Manual,
    StartupCatchup,
    Retry,
}

/// Emitted by an armed timer or cron handle into the scheduler's event loop.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// A timer or cron handle came due; enqueue a run request.
    Fire { job_id: JobId, source: TriggerSource },
    /// A cron handle could not evaluate its own expression/timezone (an
    /// expression that parsed at `create` time but fails at arm time, or an
    /// expression malformed enough that `create`'s non-empty check let it
    /// through). The handle stops itself; the job must be disabled.
    ScheduleInvalid { job_id: JobId, reason: String },
}

/// Smallest `k` such that `anchor + k*every` is `>= now` (inclusive) or
/// `> now` (strict). Used both for a job's initial `nextRunAtMs` (inclusive,
/// per the data model) and for post-run rescheduling (strict, per the
/// dispatch procedure).
pub fn next_every(anchor_ms: i64, every_ms: i64, now_ms: i64, inclusive: bool) -> i64 {
    debug_assert!(every_ms > 0);
    let diff = now_ms - anchor_ms;
    if diff <= 0 {
        return anchor_ms;
    }
    let k = diff / every_ms;
    let candidate = anchor_ms + k * every_ms;
    let due = if inclusive {
        candidate >= now_ms
    } else {
        candidate > now_ms
    };
    if due {
        candidate
    } else {
        candidate + every_ms
    }
}

/// How stale an `At` job is relative to `now`. Non-negative only when the
/// target instant has already passed.
pub fn lateness_ms(at_ms: i64, now_ms: i64) -> i64 {
    (now_ms - at_ms).max(0)
}

/// Startup catch-up decision for a past-due `At` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpDecision {
    /// Still within the lateness window: fire once now.
    Fire,
    /// Too stale: disable the job instead of firing it.
    Missed,
}

pub fn classify_at_startup(at_ms: i64, now_ms: i64, max_lateness_ms: i64) -> CatchUpDecision {
    if lateness_ms(at_ms, now_ms) > max_lateness_ms {
        CatchUpDecision::Missed
    } else {
        CatchUpDecision::Fire
    }
}

/// Caps a delay to the platform timer slice.
fn clamp_to_slice(delay_ms: i64) -> i64 {
    delay_ms.clamp(0, MAX_TIMER_SLICE_MS)
}

/// Owns the per-job timer and cron-tick handles. Arming a trigger for a job
/// that already has one cancels the previous handle first (abort-before-
/// replace), which is what keeps invariant #2 (at most one armed trigger per
/// job) true without any extra bookkeeping.
pub struct TriggerManager {
    timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    cron_ticks: Mutex<HashMap<JobId, JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TriggerEvent>,
}

impl TriggerManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TriggerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: Mutex::new(HashMap::new()),
                cron_ticks: Mutex::new(HashMap::new()),
                events: tx,
            },
            rx,
        )
    }

    /// Arms an absolute timer for `job_id` targeting `target_ms`, re-arming
    /// across 24h slices as needed. On fire, re-checks the target against
    /// the clock (a spurious early wake re-arms rather than firing).
    pub async fn arm_timer(&self, job_id: JobId, target_ms: i64, clock: SharedClock) {
        self.cancel_timer(&job_id).await;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = clock.now_ms();
                let remaining = target_ms - now;
                if remaining <= 0 {
                    // Guard against a fire that raced a near-target re-arm:
                    // only proceed once we're truly at or past the target.
                    if now + 1000 < target_ms {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    let _ = events.send(TriggerEvent::Fire {
                        job_id,
                        source: TriggerSource::Timer,
                    });
                    return;
                }
                let slice = clamp_to_slice(remaining);
                tokio::time::sleep(Duration::from_millis(slice as u64)).await;
            }
        });

        self.timers.lock().await.insert(job_id, handle);
    }

    pub async fn cancel_timer(&self, job_id: &JobId) {
        if let Some(handle) = self.timers.lock().await.remove(job_id) {
            handle.abort();
        }
    }

    /// Arms a cron handle for `job_id`. Each tick re-evaluates the
    /// expression for the next instant and schedules itself again; there is
    /// no catch-up for ticks missed while the process was down.
    pub async fn arm_cron(
        &self,
        job_id: JobId,
        expr: String,
        timezone: String,
        clock: SharedClock,
    ) {
        self.cancel_cron(&job_id).await;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = clock.now_ms();
                let next = match cron_eval::next_after(&expr, &timezone, now) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "cron evaluation failed, disabling job");
                        let _ = events.send(TriggerEvent::ScheduleInvalid {
                            job_id: job_id.clone(),
                            reason: e.to_string(),
                        });
                        return;
                    }
                };

                let remaining = (next - now).max(0);
                let mut slept = 0i64;
                while slept < remaining {
                    let slice = clamp_to_slice(remaining - slept);
                    tokio::time::sleep(Duration::from_millis(slice as u64)).await;
                    slept += slice;
                }

                if events
                    .send(TriggerEvent::Fire {
                        job_id: job_id.clone(),
                        source: TriggerSource::Cron,
                    })
                    .is_err()
                {
                    return;
                }
            }
        });

        self.cron_ticks.lock().await.insert(job_id, handle);
    }

    pub async fn cancel_cron(&self, job_id: &JobId) {
        if let Some(handle) = self.cron_ticks.lock().await.remove(job_id) {
            handle.abort();
        }
    }

    pub async fn cancel_all(&self, job_id: &JobId) {
        self.cancel_timer(job_id).await;
        self.cancel_cron(job_id).await;
    }

    /// Cancels every armed trigger. Used on `stop`.
    pub async fn cancel_everything(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        let mut cron_ticks = self.cron_ticks.lock().await;
        for (_, handle) in cron_ticks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_every_inclusive_returns_now_on_exact_hit() {
        // anchor=0, every=1000, now=3000 -> k=3 candidate=3000, inclusive accepts >=now
        assert_eq!(next_every(0, 1000, 3000, true), 3000);
    }

    #[test]
    fn next_every_strict_advances_past_exact_hit() {
        assert_eq!(next_every(0, 1000, 3000, false), 4000);
    }

    #[test]
    fn next_every_handles_anchor_in_past() {
        // anchor = now-90000, every=60000: smallest k with anchor+k*every >= now
        // now=100000 -> anchor=10000, diff=90000, k=1 (60000*1=60000<90000, use 2)
        let anchor = 10_000;
        let now = 100_000;
        let every = 60_000;
        let next = next_every(anchor, every, now, true);
        assert_eq!(next, anchor + 2 * every);
    }

    #[test]
    fn next_every_handles_anchor_in_future() {
        assert_eq!(next_every(5_000, 1_000, 0, true), 5_000);
    }

    #[test]
    fn lateness_is_zero_when_not_yet_due() {
        assert_eq!(lateness_ms(1_000, 500), 0);
    }

    #[test]
    fn lateness_is_positive_when_overdue() {
        assert_eq!(lateness_ms(500, 1_500), 1_000);
    }

    #[test]
    fn classify_at_startup_within_window_fires() {
        assert_eq!(classify_at_startup(0, 1000, 5000), CatchUpDecision::Fire);
    }

    #[test]
    fn classify_at_startup_beyond_window_is_missed() {
        assert_eq!(classify_at_startup(0, 10_000, 5000), CatchUpDecision::Missed);
    }

    #[test]
    fn clamp_to_slice_caps_at_24_hours() {
        assert_eq!(clamp_to_slice(MAX_TIMER_SLICE_MS + 1), MAX_TIMER_SLICE_MS);
        assert_eq!(clamp_to_slice(1000), 1000);
        assert_eq!(clamp_to_slice(-50), 0);
    }

    #[tokio::test]
    async fn arm_timer_fires_event_near_target() {
        use crate::clock::SystemClock;
        use std::sync::Arc;

        let (manager, mut rx) = TriggerManager::new();
        let clock: SharedClock = Arc::new(SystemClock);
        let target = clock.now_ms() + 50;

        manager.arm_timer("job-1".to_string(), target, clock).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timer should fire")
            .expect("channel should stay open");
        match event {
            TriggerEvent::Fire { job_id, source } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(source, TriggerSource::Timer);
            }
            TriggerEvent::ScheduleInvalid { .. } => panic!("timer must not report schedule invalid"),
        }
    }

    #[tokio::test]
    async fn arming_twice_cancels_previous_timer() {
        use crate::clock::SystemClock;
        use std::sync::Arc;

        let (manager, mut rx) = TriggerManager::new();
        let clock: SharedClock = Arc::new(SystemClock);

        manager
            .arm_timer("job-1".to_string(), clock.now_ms() + 50, clock.clone())
            .await;
        manager
            .arm_timer("job-1".to_string(), clock.now_ms() + 10_000, clock.clone())
            .await;

        // Only one handle should be live; confirm no event arrives within
        // the window the first (now-cancelled) timer would have fired.
        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }
}
