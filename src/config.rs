//! Scheduler configuration: construction-time options and the live-reloadable slice.

use arc_swap::ArcSwap;

/// Policy defaults applied to a job when its `create` input omits a field.
#[derive(Debug, Clone, Copy)]
pub struct PolicyDefaults {
    /// Maximum staleness (ms) an `At` job may have at startup and still fire.
    pub max_lateness_ms: i64,
    /// Number of retries after the first failed attempt, before an `At` job is disabled.
    pub retry_max: u32,
    /// Base backoff (ms) for retry scheduling; doubles per consecutive failure.
    pub retry_backoff_ms: i64,
    /// Whether a one-shot job is deleted (vs. disabled) after a successful run.
    pub delete_after_run: bool,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            max_lateness_ms: 5 * 60 * 1000,
            retry_max: 2,
            retry_backoff_ms: 2_000,
            delete_after_run: false,
        }
    }
}

/// Construction-time scheduler options (spec.md §6 "Configuration knobs").
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Root directory under which `<bot_name>/jobs.json` is stored.
    pub store_path: std::path::PathBuf,
    /// Namespace for the store file; fixed for the lifetime of the scheduler.
    pub bot_name: String,
    /// Service-level kill switch. Mirrored into `RuntimeConfig` at construction.
    pub enabled: bool,
    /// IANA timezone name used by `Cron` jobs that don't specify their own.
    pub default_timezone: String,
    /// Maximum number of jobs a single tenant may own at once.
    pub max_jobs_per_chat: usize,
    /// Hard ceiling on a single run's wall-clock duration.
    pub max_run_ms: u64,
    /// Policy defaults for jobs created without an explicit policy.
    pub default_policy: PolicyDefaults,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        let store_path = dirs::data_dir()
            .map(|d| d.join("taskbeat"))
            .unwrap_or_else(|| std::path::PathBuf::from("./data/taskbeat"));

        Self {
            store_path,
            bot_name: "default".to_string(),
            enabled: true,
            default_timezone: "UTC".to_string(),
            max_jobs_per_chat: 50,
            max_run_ms: 120_000,
            default_policy: PolicyDefaults::default(),
        }
    }
}

/// The slice of configuration that can change without restarting the scheduler.
///
/// Mirrors the teacher's `runtime_config.cron_timezone` hot-reload pattern
/// (`ArcSwap` read on every trigger, no lock contention with the serializer).
pub struct RuntimeConfig {
    enabled: ArcSwap<bool>,
    default_timezone: ArcSwap<String>,
}

impl RuntimeConfig {
    pub fn new(enabled: bool, default_timezone: String) -> Self {
        Self {
            enabled: ArcSwap::from_pointee(enabled),
            default_timezone: ArcSwap::from_pointee(default_timezone),
        }
    }

    pub fn is_enabled(&self) -> bool {
        **self.enabled.load()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(std::sync::Arc::new(enabled));
    }

    pub fn default_timezone(&self) -> String {
        (**self.default_timezone.load()).clone()
    }

    #[allow(dead_code)]
    pub fn set_default_timezone(&self, timezone: String) {
        self.default_timezone.store(std::sync::Arc::new(timezone));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_reflects_updates() {
        let config = RuntimeConfig::new(true, "UTC".to_string());
        assert!(config.is_enabled());
        config.set_enabled(false);
        assert!(!config.is_enabled());

        assert_eq!(config.default_timezone(), "UTC");
        config.set_default_timezone("America/New_York".to_string());
        assert_eq!(config.default_timezone(), "America/New_York");
    }
}
