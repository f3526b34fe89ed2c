//! Minimal process entry point for running the scheduler as a standalone
//! service. Configuration loading, daemonization, and the conversational
//! agent integration are out of scope for this crate (see `SPEC_FULL.md`
//! §1) — this binary wires up logging and a `SchedulerOptions` from
//! environment variables, then drives the scheduler's lifecycle.

use std::sync::Arc;

use taskbeat::config::SchedulerOptions;
use taskbeat::{Executor, ExecutorOutcome, RunContext, Scheduler};

/// Placeholder executor used when no real conversational agent is wired in.
/// Logs the prompt it would have fired and reports success, so the
/// scheduler's trigger/retry/persistence machinery can be exercised
/// end-to-end without an external dependency.
struct LoggingExecutor;

#[async_trait::async_trait]
impl Executor for LoggingExecutor {
    async fn execute(&self, ctx: RunContext) -> ExecutorOutcome {
        tracing::info!(
            job_id = %ctx.job.id,
            run_id = %ctx.run_id,
            source = ?ctx.source,
            prompt = %ctx.job.prompt,
            "would dispatch prompt to conversational agent"
        );
        ExecutorOutcome::ok()
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .compact()
        .init();
}

fn options_from_env() -> SchedulerOptions {
    let defaults = SchedulerOptions::default();
    SchedulerOptions {
        store_path: std::env::var("TASKBEAT_STORE_PATH")
            .map(std::path::PathBuf::from)
            .unwrap_or(defaults.store_path),
        bot_name: std::env::var("TASKBEAT_BOT_NAME").unwrap_or(defaults.bot_name),
        enabled: std::env::var("TASKBEAT_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.enabled),
        default_timezone: std::env::var("TASKBEAT_DEFAULT_TIMEZONE")
            .unwrap_or(defaults.default_timezone),
        max_jobs_per_chat: std::env::var("TASKBEAT_MAX_JOBS_PER_CHAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_jobs_per_chat),
        max_run_ms: std::env::var("TASKBEAT_MAX_RUN_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_run_ms),
        default_policy: defaults.default_policy,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let options = options_from_env();
    tracing::info!(
        bot_name = %options.bot_name,
        store_path = %options.store_path.display(),
        "starting taskbeat scheduler"
    );

    let scheduler = Scheduler::new(options);
    scheduler.set_executor(Arc::new(LoggingExecutor));
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight runs");
    scheduler.stop().await?;

    Ok(())
}
