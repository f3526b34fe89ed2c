//! The lifecycle controller (spec component C8) and dispatch procedure
//! (C7). `Scheduler` is the crate's single public entry point: it owns the
//! store, the serializer, the trigger manager, the run queue, and the
//! injected executor, and wires them together per the dispatch procedure.

use crate::clock::{SharedClock, SystemClock};
use crate::config::{RuntimeConfig, SchedulerOptions};
use crate::cron_eval;
use crate::dispatch::{Dispatcher, RunRequest};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorOutcome, RunContext};
use crate::job::{CreateInput, Job, JobId, RunId, RunStatus, Schedule};
use crate::serializer::Serializer;
use crate::store::Store;
use crate::trigger::{self, TriggerManager, TriggerSource};
use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const RUN_HISTORY_CAPACITY: usize = 20;
const STOP_DRAIN_TIMEOUT_MS: u64 = 10_000;

/// One entry in a job's in-memory (non-persisted) execution history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub source: TriggerSource,
    pub scheduled_at_ms: i64,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ServiceStatus {
    pub enabled: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub next_run_at_ms: i64,
}

struct NoopExecutor;

#[async_trait::async_trait]
impl Executor for NoopExecutor {
    async fn execute(&self, _ctx: RunContext) -> ExecutorOutcome {
        ExecutorOutcome::error("no executor configured")
    }
}

pub struct Scheduler {
    options: SchedulerOptions,
    runtime: RuntimeConfig,
    store: Store,
    serializer: Serializer,
    dispatcher: Arc<Dispatcher>,
    triggers: Arc<TriggerManager>,
    clock: SharedClock,
    executor: ArcSwap<Arc<dyn Executor>>,
    started: AtomicBool,
    stopping: AtomicBool,
    run_history: Mutex<HashMap<JobId, VecDeque<RunRecord>>>,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Arc<Self> {
        Self::new_with_clock(options, Arc::new(SystemClock))
    }

    /// Constructs a scheduler against an explicit clock, so pure scheduling
    /// math (lateness windows, backoff) can be driven deterministically in
    /// tests without real sleeps.
    pub fn new_with_clock(options: SchedulerOptions, clock: SharedClock) -> Arc<Self> {
        let store = Store::new(&options.store_path, &options.bot_name);
        let (triggers, events_rx) = TriggerManager::new();
        let runtime = RuntimeConfig::new(options.enabled, options.default_timezone.clone());

        let scheduler = Arc::new(Self {
            options,
            runtime,
            store,
            serializer: Serializer::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            triggers: Arc::new(triggers),
            clock,
            executor: ArcSwap::from_pointee(Arc::new(NoopExecutor) as Arc<dyn Executor>),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            run_history: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        // The event-consumer task outlives `new` and is torn down in `stop`.
        let weak = Arc::downgrade(&scheduler);
        let task = tokio::spawn(run_event_loop(weak, events_rx));
        // `try_lock` is safe here: nothing else can reach `tasks` before
        // `new` returns.
        scheduler
            .tasks
            .try_lock()
            .expect("scheduler not yet shared")
            .push(task);

        scheduler
    }

    // ---- read-only / config accessors ----

    pub fn is_enabled(&self) -> bool {
        self.runtime.is_enabled()
    }

    pub fn default_timezone(&self) -> String {
        self.runtime.default_timezone()
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        self.executor.store(Arc::new(executor));
    }

    // ---- lifecycle ----

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopping.store(false, Ordering::SeqCst);

        let loaded = self.store.load().await;
        self.serializer.replace_all(loaded).await;

        self.recover().await;
        self.arm_all_enabled().await;

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(run_dispatch_loop(weak, self.dispatcher.clone()));
        self.tasks.lock().await.push(task);

        tracing::info!(bot_name = %self.options.bot_name, "scheduler started");
        Ok(())
    }

    /// Recovery: any job whose `runningRunId` is non-empty means the
    /// previous process died mid-dispatch. Clear the running markers,
    /// record the crash, and repopulate `nextRunAtMs` if it went missing.
    async fn recover(&self) {
        let now = self.clock.now_ms();
        let default_tz = self.runtime.default_timezone();

        let changed = self
            .serializer
            .mutate(|jobs| {
                let mut changed = false;
                for job in jobs.values_mut() {
                    if job.state.running_run_id.take().is_some() {
                        changed = true;
                        job.state.running_at_ms = None;
                        job.state.last_status = Some(RunStatus::Error);
                        job.state.last_error =
                            Some("previous process exited during run".to_string());
                        job.state.consecutive_failures += 1;
                        job.error_count += 1;
                        job.updated_at_ms = now;
                    }

                    if job.enabled && job.state.next_run_at_ms == 0 {
                        let repopulated = match &job.schedule {
                            Schedule::At { at_ms } => Some(*at_ms),
                            Schedule::Every {
                                every_ms,
                                anchor_ms,
                            } => Some(trigger::next_every(*anchor_ms, *every_ms, now, true)),
                            Schedule::Cron { expr, timezone } => {
                                let tz = if timezone.is_empty() {
                                    &default_tz
                                } else {
                                    timezone
                                };
                                cron_eval::next_after(expr, tz, now).ok()
                            }
                        };
                        if let Some(next) = repopulated {
                            job.state.next_run_at_ms = next;
                            job.updated_at_ms = now;
                            changed = true;
                        }
                    }
                }
                changed
            })
            .await;

        self.apply_startup_catchup().await;

        if changed {
            self.persist().await;
        }
    }

    /// Startup catch-up: past-due `At` jobs beyond the lateness window are
    /// marked missed and disabled rather than fired; within the window they
    /// fire exactly once. `Every` jobs past due fire once at `now` and
    /// resume their normal cadence afterward.
    async fn apply_startup_catchup(&self) {
        let now = self.clock.now_ms();
        let mut to_enqueue = Vec::new();

        self.serializer
            .mutate(|jobs| {
                for job in jobs.values_mut() {
                    if !job.enabled {
                        continue;
                    }
                    match &job.schedule {
                        Schedule::At { at_ms } => {
                            if *at_ms <= now {
                                match trigger::classify_at_startup(
                                    *at_ms,
                                    now,
                                    job.policy.max_lateness_ms,
                                ) {
                                    trigger::CatchUpDecision::Missed => {
                                        job.enabled = false;
                                        job.state.next_run_at_ms = 0;
                                        job.state.last_status = Some(RunStatus::Missed);
                                        job.updated_at_ms = now;
                                    }
                                    trigger::CatchUpDecision::Fire => {
                                        to_enqueue.push((
                                            job.id.clone(),
                                            TriggerSource::StartupCatchup,
                                            *at_ms,
                                        ));
                                    }
                                }
                            }
                        }
                        Schedule::Every { .. } => {
                            if job.state.next_run_at_ms <= now {
                                to_enqueue.push((
                                    job.id.clone(),
                                    TriggerSource::StartupCatchup,
                                    job.state.next_run_at_ms,
                                ));
                            }
                        }
                        Schedule::Cron { .. } => {}
                    }
                }
            })
            .await;

        for (job_id, source, scheduled_at_ms) in to_enqueue {
            self.try_enqueue(job_id, source, scheduled_at_ms, false)
                .await;
        }
    }

    async fn arm_all_enabled(&self) {
        let jobs = self.serializer.all_jobs_snapshot().await;
        for job in jobs {
            if job.enabled {
                self.arm_job(&job).await;
            }
        }
    }

    async fn arm_job(&self, job: &Job) {
        match &job.schedule {
            Schedule::At { .. } | Schedule::Every { .. } => {
                if job.state.next_run_at_ms > 0 {
                    self.triggers
                        .arm_timer(job.id.clone(), job.state.next_run_at_ms, self.clock.clone())
                        .await;
                }
            }
            Schedule::Cron { expr, timezone } => {
                let timezone = if timezone.is_empty() {
                    self.runtime.default_timezone()
                } else {
                    timezone.clone()
                };
                self.triggers
                    .arm_cron(job.id.clone(), expr.clone(), timezone, self.clock.clone())
                    .await;
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopping.store(true, Ordering::SeqCst);

        self.triggers.cancel_everything().await;
        self.shutdown.notify_waiters();

        let deadline = self.clock.now_ms() + STOP_DRAIN_TIMEOUT_MS as i64;
        loop {
            let still_running = self
                .serializer
                .all_jobs_snapshot()
                .await
                .iter()
                .any(|j| j.state.running_run_id.is_some());
            if !still_running || self.clock.now_ms() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        tracing::info!(bot_name = %self.options.bot_name, "scheduler stopped");
        Ok(())
    }

    // ---- public mutation API ----

    pub async fn create(&self, input: CreateInput) -> Result<Job> {
        let tenant = input.tenant;
        let limit = self.options.max_jobs_per_chat;
        let now = self.clock.now_ms();
        let default_timezone = self.runtime.default_timezone();
        let bot_name = self.options.bot_name.clone();
        let policy_defaults = self.options.default_policy;

        // The quota check and the insert must happen under the same
        // write-lock hold: checking count and inserting in separate
        // `mutate` calls would let two concurrent `create`s for the same
        // tenant both observe `count < limit` and both insert.
        let job = self
            .serializer
            .mutate(|jobs| {
                let count = jobs.values().filter(|j| j.tenant == tenant).count();
                if count >= limit {
                    #[cfg(feature = "metrics")]
                    crate::metrics::Metrics::global()
                        .quota_rejections_total
                        .inc();
                    return Err(Error::QuotaExceeded {
                        tenant,
                        count,
                        limit,
                    });
                }

                let exists = |candidate: &str| jobs.contains_key(candidate);
                let mut job = Job::from_create(
                    input,
                    now,
                    &default_timezone,
                    &policy_defaults,
                    exists,
                )?;
                job.bot_name = bot_name;
                jobs.insert(job.id.clone(), job.clone());
                Ok::<Job, Error>(job)
            })
            .await?;

        self.persist().await;
        if job.enabled {
            self.arm_job(&job).await;
        }

        #[cfg(feature = "metrics")]
        {
            let metrics = crate::metrics::Metrics::global();
            metrics.jobs_created_total.inc();
            metrics.jobs_active.inc();
        }

        Ok(job)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .serializer
            .mutate(|jobs| jobs.remove(id).is_some())
            .await;

        if removed {
            self.triggers.cancel_all(&id.to_string()).await;
            self.dispatcher.remove_queued(id).await;
            self.run_history.lock().await.remove(id);
            self.persist().await;

            #[cfg(feature = "metrics")]
            {
                let metrics = crate::metrics::Metrics::global();
                metrics.jobs_removed_total.inc();
                metrics.jobs_active.dec();
            }
        }

        Ok(removed)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<Job>> {
        let now = self.clock.now_ms();
        let default_timezone = self.runtime.default_timezone();

        let job = self
            .serializer
            .mutate(|jobs| {
                let job = jobs.get_mut(id)?;
                job.enabled = enabled;
                job.updated_at_ms = now;
                if !enabled {
                    job.state.next_run_at_ms = 0;
                } else if job.state.next_run_at_ms == 0 {
                    job.state.next_run_at_ms = match &job.schedule {
                        Schedule::At { at_ms } => *at_ms,
                        Schedule::Every {
                            every_ms,
                            anchor_ms,
                        } => trigger::next_every(*anchor_ms, *every_ms, now, true),
                        Schedule::Cron { expr, timezone } => {
                            let tz = if timezone.is_empty() {
                                &default_timezone
                            } else {
                                timezone
                            };
                            cron_eval::next_after(expr, tz, now).unwrap_or(0)
                        }
                    };
                }
                Some(job.clone())
            })
            .await;

        let Some(job) = job else { return Ok(None) };

        if enabled {
            self.arm_job(&job).await;
        } else {
            self.triggers.cancel_all(&job.id).await;
        }
        self.persist().await;

        Ok(Some(job))
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Option<Job>> {
        let now = self.clock.now_ms();
        let job = self
            .serializer
            .mutate(|jobs| {
                let job = jobs.get_mut(id)?;
                job.name = crate::job::normalize_name(Some(name), &job.prompt, &job.id);
                job.updated_at_ms = now;
                Some(job.clone())
            })
            .await;

        if job.is_some() {
            self.persist().await;
        }
        Ok(job)
    }

    pub async fn run_now(&self, id: &str) -> Result<bool> {
        if self.serializer.get_clone(id).await.is_none() {
            return Ok(false);
        }
        let now = self.clock.now_ms();
        Ok(self
            .try_enqueue(id.to_string(), TriggerSource::Manual, now, true)
            .await)
    }

    // ---- public read API ----

    pub async fn list(&self, tenant: Option<i64>) -> Vec<Job> {
        self.serializer.list_sorted(tenant).await
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.serializer.get_clone(id).await
    }

    pub async fn status(&self, tenant: Option<i64>) -> ServiceStatus {
        let jobs = self.serializer.list_sorted(tenant).await;
        let queued = self.dispatcher.len().await;

        let running_jobs = jobs
            .iter()
            .filter(|j| j.state.running_run_id.is_some())
            .count();
        let next_run_at_ms = jobs
            .iter()
            .filter(|j| j.enabled && j.state.next_run_at_ms > 0)
            .map(|j| j.state.next_run_at_ms)
            .min()
            .unwrap_or(0);

        ServiceStatus {
            enabled: self.is_enabled(),
            total_jobs: jobs.len(),
            enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
            running_jobs,
            queued_jobs: queued,
            next_run_at_ms,
        }
    }

    pub async fn run_history(&self, id: &str) -> Vec<RunRecord> {
        self.run_history
            .lock()
            .await
            .get(id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ---- internals shared with the event loop / dispatch loop ----

    async fn try_enqueue(
        &self,
        job_id: JobId,
        source: TriggerSource,
        scheduled_at_ms: i64,
        force: bool,
    ) -> bool {
        if self.dispatcher.is_queued(&job_id).await {
            return false;
        }
        let Some(job) = self.serializer.get_clone(&job_id).await else {
            return false;
        };
        if job.state.running_run_id.is_some() {
            return false;
        }
        self.dispatcher
            .enqueue(RunRequest {
                job_id,
                source,
                scheduled_at_ms,
                force,
            })
            .await
    }

    async fn persist(&self) {
        let now = self.clock.now_ms();
        let snapshot = self.serializer.all_jobs_snapshot().await;
        if let Err(e) = self.store.save(&snapshot, now).await {
            tracing::error!(error = %e, "failed to persist job store");
            #[cfg(feature = "metrics")]
            crate::metrics::Metrics::global()
                .store_write_errors_total
                .inc();
        }
    }

    async fn on_cron_tick(&self, job_id: JobId) {
        let now = self.clock.now_ms();
        let Some(job) = self.serializer.get_clone(&job_id).await else {
            return;
        };
        if let Schedule::Cron { expr, timezone } = &job.schedule {
            let tz = if timezone.is_empty() {
                self.runtime.default_timezone()
            } else {
                timezone.clone()
            };
            let next = cron_eval::next_after(expr, &tz, now).unwrap_or(0);
            self.serializer
                .mutate(|jobs| {
                    if let Some(job) = jobs.get_mut(&job_id) {
                        job.state.next_run_at_ms = next;
                        job.updated_at_ms = now;
                    }
                })
                .await;
            self.persist().await;
        }
        self.try_enqueue(job_id, TriggerSource::Cron, now, false)
            .await;
    }

    async fn on_timer_fire(&self, job_id: JobId) {
        let now = self.clock.now_ms();
        let Some(job) = self.serializer.get_clone(&job_id).await else {
            return;
        };
        self.try_enqueue(job_id, TriggerSource::Timer, job.state.next_run_at_ms.max(now), false)
            .await;
    }

    /// A cron handle stopped itself because it could no longer evaluate its
    /// own expression or timezone. Disables the job rather than leaving it
    /// armed-looking but silently dead (spec §3/§7/§8).
    async fn on_schedule_invalid(&self, job_id: JobId, reason: String) {
        let now = self.clock.now_ms();
        let disabled = self
            .serializer
            .mutate(|jobs| {
                let job = jobs.get_mut(&job_id)?;
                job.enabled = false;
                job.state.next_run_at_ms = 0;
                job.state.last_status = Some(RunStatus::Error);
                job.state.last_error = Some(reason.clone());
                job.updated_at_ms = now;
                Some(())
            })
            .await;

        if disabled.is_some() {
            tracing::warn!(job_id = %job_id, reason = %reason, "disabling job after cron schedule became invalid");
            self.triggers.cancel_all(&job_id).await;
            self.persist().await;
        }
    }

    async fn dispatch_one(self: &Arc<Self>, request: RunRequest) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let start = self.clock.now_ms();
        let run_id = uuid::Uuid::new_v4().to_string();

        let dispatched = self
            .serializer
            .mutate(|jobs| {
                let job = jobs.get_mut(&request.job_id)?;
                if !job.enabled && !request.force {
                    return None;
                }
                if job.state.running_run_id.is_some() {
                    return None;
                }
                job.state.running_run_id = Some(run_id.clone());
                job.state.running_at_ms = Some(start);
                job.updated_at_ms = start;
                Some(job.clone())
            })
            .await;

        let Some(job) = dispatched else { return };
        self.persist().await;

        let timeout_ms = self.options.max_run_ms.max(5_000);
        let ctx = RunContext {
            job: job.clone(),
            run_id: run_id.clone(),
            source: request.source,
            scheduled_at_ms: request.scheduled_at_ms,
        };
        let executor = self.executor.load_full();

        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            executor.execute(ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ExecutorOutcome::error(format!("run timeout (>{}s)", timeout_ms / 1000)),
        };

        let finished = self.clock.now_ms();
        let applied = self
            .serializer
            .mutate(|jobs| {
                let job = jobs.get_mut(&request.job_id)?;
                if job.state.running_run_id.as_deref() != Some(run_id.as_str()) {
                    return None;
                }
                job.state.running_run_id = None;
                job.state.running_at_ms = None;
                job.state.last_run_at_ms = Some(finished);
                job.state.last_duration_ms = Some(finished - start);
                job.run_count += 1;
                job.updated_at_ms = finished;
                if outcome.ok {
                    job.state.last_status = Some(RunStatus::Ok);
                    job.state.last_error = None;
                    job.state.consecutive_failures = 0;
                } else {
                    job.state.last_status = Some(RunStatus::Error);
                    job.state.last_error = outcome.error.clone();
                    job.state.consecutive_failures += 1;
                    job.error_count += 1;
                }
                Some(())
            })
            .await;

        if !outcome.ok {
            let err = Error::RunFailed(outcome.error.clone().unwrap_or_default());
            tracing::warn!(job_id = %request.job_id, run_id = %run_id, error = %err, "run failed");
        }

        if applied.is_some() {
            self.reschedule_after_run(&request.job_id, outcome.ok).await;
        }
        self.persist().await;

        self.record_run_history(
            request.job_id,
            run_id,
            request.source,
            request.scheduled_at_ms,
            start,
            finished,
            &outcome,
        )
        .await;

        #[cfg(feature = "metrics")]
        {
            let metrics = crate::metrics::Metrics::global();
            metrics
                .runs_total
                .with_label_values(&[if outcome.ok { "ok" } else { "error" }])
                .inc();
            metrics
                .run_duration_seconds
                .observe((finished - start) as f64 / 1000.0);
        }
    }

    /// Post-run rescheduling, per schedule variant (dispatch step 4).
    async fn reschedule_after_run(&self, job_id: &str, ok: bool) {
        enum Action {
            Delete,
            ArmTimer(i64),
            None,
        }

        let now = self.clock.now_ms();
        let action = self
            .serializer
            .mutate(|jobs| -> Option<Action> {
                let job = jobs.get_mut(job_id)?;
                let action = match job.schedule.clone() {
                    Schedule::At { .. } => {
                        if ok {
                            if job.policy.delete_after_run {
                                Action::Delete
                            } else {
                                job.enabled = false;
                                job.state.next_run_at_ms = 0;
                                Action::None
                            }
                        } else if job.state.consecutive_failures <= job.policy.retry_max {
                            let exponent = job.state.consecutive_failures.saturating_sub(1);
                            let backoff = job.policy.retry_backoff_ms * 2i64.pow(exponent);
                            let next = now + backoff;
                            job.state.next_run_at_ms = next;
                            Action::ArmTimer(next)
                        } else {
                            job.enabled = false;
                            job.state.next_run_at_ms = 0;
                            job.state.last_error = Some(
                                "retry budget exhausted, job disabled".to_string(),
                            );
                            Action::None
                        }
                    }
                    Schedule::Every {
                        every_ms,
                        anchor_ms,
                    } => {
                        let next = trigger::next_every(anchor_ms, every_ms, now, false);
                        job.state.next_run_at_ms = next;
                        Action::ArmTimer(next)
                    }
                    Schedule::Cron { .. } => Action::None,
                };
                job.updated_at_ms = now;
                if matches!(action, Action::Delete) {
                    jobs.remove(job_id);
                }
                Some(action)
            })
            .await;

        match action {
            Some(Action::Delete) => {
                self.triggers.cancel_all(&job_id.to_string()).await;
                self.dispatcher.remove_queued(job_id).await;
                #[cfg(feature = "metrics")]
                {
                    let metrics = crate::metrics::Metrics::global();
                    metrics.jobs_removed_total.inc();
                    metrics.jobs_active.dec();
                }
            }
            Some(Action::ArmTimer(target)) => {
                self.triggers
                    .arm_timer(job_id.to_string(), target, self.clock.clone())
                    .await;
            }
            Some(Action::None) | None => {
                self.triggers.cancel_timer(&job_id.to_string()).await;
            }
        }
    }

    async fn record_run_history(
        &self,
        job_id: JobId,
        run_id: RunId,
        source: TriggerSource,
        scheduled_at_ms: i64,
        started_at_ms: i64,
        finished_at_ms: i64,
        outcome: &ExecutorOutcome,
    ) {
        let mut history = self.run_history.lock().await;
        let entries = history.entry(job_id).or_default();
        if entries.len() >= RUN_HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(RunRecord {
            run_id,
            source,
            scheduled_at_ms,
            started_at_ms,
            finished_at_ms,
            status: if outcome.ok {
                RunStatus::Ok
            } else {
                RunStatus::Error
            },
            error: outcome.error.clone(),
        });
    }
}

async fn run_event_loop(
    scheduler: std::sync::Weak<Scheduler>,
    mut events: mpsc::UnboundedReceiver<trigger::TriggerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        if scheduler.stopping.load(Ordering::SeqCst) {
            continue;
        }
        match event {
            trigger::TriggerEvent::Fire { job_id, source } => match source {
                TriggerSource::Timer => scheduler.on_timer_fire(job_id).await,
                TriggerSource::Cron => scheduler.on_cron_tick(job_id).await,
                _ => {}
            },
            trigger::TriggerEvent::ScheduleInvalid { job_id, reason } => {
                scheduler.on_schedule_invalid(job_id, reason).await
            }
        }
    }
}

async fn run_dispatch_loop(scheduler: std::sync::Weak<Scheduler>, dispatcher: Arc<Dispatcher>) {
    loop {
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        let shutdown = scheduler.shutdown.clone();
        tokio::select! {
            request = dispatcher.next() => {
                scheduler.dispatch_one(request).await;
            }
            _ = shutdown.notified() => {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::job::{Policy, Schedule};

    fn test_options(dir: &std::path::Path) -> SchedulerOptions {
        SchedulerOptions {
            store_path: dir.to_path_buf(),
            bot_name: "test-bot".to_string(),
            enabled: true,
            default_timezone: "UTC".to_string(),
            max_jobs_per_chat: 2,
            max_run_ms: 2_000,
            default_policy: crate::config::PolicyDefaults::default(),
        }
    }

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl Executor for AlwaysOk {
        async fn execute(&self, _ctx: RunContext) -> ExecutorOutcome {
            ExecutorOutcome::ok()
        }
    }

    struct CountingExecutor(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait::async_trait]
    impl Executor for CountingExecutor {
        async fn execute(&self, _ctx: RunContext) -> ExecutorOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            ExecutorOutcome::ok()
        }
    }

    #[tokio::test]
    async fn quota_rejects_third_job_for_same_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_options(dir.path()));
        scheduler.start().await.unwrap();

        for _ in 0..2 {
            scheduler
                .create(CreateInput {
                    tenant: 1,
                    name: None,
                    prompt: "hi".into(),
                    enabled: Some(false),
                    schedule: Schedule::At { at_ms: i64::MAX / 2 },
                    policy: None,
                    notify: None,
                })
                .await
                .unwrap();
        }

        let err = scheduler
            .create(CreateInput {
                tenant: 1,
                name: None,
                prompt: "hi".into(),
                enabled: Some(false),
                schedule: Schedule::At { at_ms: i64::MAX / 2 },
                policy: None,
                notify: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert_eq!(scheduler.list(Some(1)).await.len(), 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_deletes_after_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_options(dir.path()));
        scheduler.set_executor(Arc::new(AlwaysOk));
        scheduler.start().await.unwrap();

        let now = scheduler.clock.now_ms();
        let job = scheduler
            .create(CreateInput {
                tenant: 1,
                name: None,
                prompt: "fire soon".into(),
                enabled: Some(true),
                schedule: Schedule::At { at_ms: now + 150 },
                policy: Some(Policy {
                    max_lateness_ms: 5000,
                    retry_max: 0,
                    retry_backoff_ms: 1000,
                    delete_after_run: true,
                }),
                notify: None,
            })
            .await
            .unwrap();

        for _ in 0..40 {
            if scheduler.get(&job.id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(scheduler.get(&job.id).await.is_none());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn manual_run_now_invokes_executor_even_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_options(dir.path()));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        scheduler.set_executor(Arc::new(CountingExecutor(calls.clone())));
        scheduler.start().await.unwrap();

        let job = scheduler
            .create(CreateInput {
                tenant: 5,
                name: None,
                prompt: "manual".into(),
                enabled: Some(false),
                schedule: Schedule::At { at_ms: i64::MAX / 2 },
                policy: None,
                notify: None,
            })
            .await
            .unwrap();

        assert!(scheduler.run_now(&job.id).await.unwrap());

        for _ in 0..40 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn crash_recovery_clears_running_marker_and_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let store = Store::new(&options.store_path, &options.bot_name);

        let mut job = Job::from_create(
            CreateInput {
                tenant: 1,
                name: None,
                prompt: "was running".into(),
                enabled: Some(true),
                schedule: Schedule::Every {
                    every_ms: 10_000,
                    anchor_ms: 1,
                },
                policy: None,
                notify: None,
            },
            0,
            "UTC",
            &options.default_policy,
            |_| false,
        )
        .unwrap();
        job.state.running_run_id = Some("stale-run".to_string());
        job.state.running_at_ms = Some(0);
        store.save(&[job.clone()], 0).await.unwrap();

        let scheduler = Scheduler::new(options);
        scheduler.set_executor(Arc::new(AlwaysOk));
        scheduler.start().await.unwrap();

        let recovered = scheduler.get(&job.id).await.unwrap();
        assert!(recovered.state.running_run_id.is_none());
        assert_eq!(recovered.state.last_status, Some(RunStatus::Error));
        assert!(recovered.state.next_run_at_ms > 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn startup_catchup_disables_stale_at_job() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_options(dir.path());
        let store = Store::new(&options.store_path, &options.bot_name);

        let job = Job::from_create(
            CreateInput {
                tenant: 1,
                name: None,
                prompt: "too late".into(),
                enabled: Some(true),
                schedule: Schedule::At { at_ms: 1_000 },
                policy: Some(Policy {
                    max_lateness_ms: 1_000,
                    retry_max: 0,
                    retry_backoff_ms: 1_000,
                    delete_after_run: false,
                }),
                notify: None,
            },
            0,
            "UTC",
            &options.default_policy,
            |_| false,
        )
        .unwrap();
        store.save(&[job.clone()], 0).await.unwrap();

        let clock: SharedClock = Arc::new(FakeClock::new(1_000_000));
        let scheduler = Scheduler::new_with_clock(options, clock);

        scheduler.start().await.unwrap();

        let loaded = scheduler.get(&job.id).await.unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.state.last_status, Some(RunStatus::Missed));

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_job_counts() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(test_options(dir.path()));
        scheduler.start().await.unwrap();

        scheduler
            .create(CreateInput {
                tenant: 1,
                name: None,
                prompt: "hi".into(),
                enabled: Some(true),
                schedule: Schedule::At { at_ms: i64::MAX / 2 },
                policy: None,
                notify: None,
            })
            .await
            .unwrap();

        let status = scheduler.status(None).await;
        assert_eq!(status.total_jobs, 1);
        assert_eq!(status.enabled_jobs, 1);
        assert_eq!(status.running_jobs, 0);

        scheduler.stop().await.unwrap();
    }
}
