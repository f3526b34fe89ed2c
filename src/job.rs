//! The canonical job record, its schedule variants, and input normalization.

use crate::config::PolicyDefaults;
use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type JobId = String;
pub type RunId = String;

const ID_LEN: usize = 10;
const ID_COLLISION_RETRIES: usize = 8;
const FALLBACK_ID_LEN: usize = 32;
const MAX_NAME_LEN: usize = 48;

/// Generates a short opaque job id, retrying on collision against `exists`,
/// falling back to a long random id if every short attempt collides.
pub fn generate_job_id(mut exists: impl FnMut(&str) -> bool) -> JobId {
    let mut rng = rand::rng();
    for _ in 0..=ID_COLLISION_RETRIES {
        let id = random_hex_id(&mut rng, ID_LEN);
        if !exists(&id) {
            return id;
        }
    }
    random_hex_id(&mut rng, FALLBACK_ID_LEN)
}

/// `len` hex characters, i.e. `len.div_ceil(2)` random bytes truncated to
/// an exact character count.
fn random_hex_id(rng: &mut impl Rng, len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rng.fill(bytes.as_mut_slice());
    let mut hex = hex::encode(bytes);
    hex.truncate(len);
    hex
}

/// Tagged schedule variant. Never subclass this — every consumer matches
/// exhaustively on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    At { at_ms: i64 },
    Every { every_ms: i64, anchor_ms: i64 },
    Cron { expr: String, timezone: String },
}

impl Schedule {
    fn validate(&self, default_timezone: &str) -> Result<Schedule> {
        match self {
            Schedule::At { at_ms } => {
                if *at_ms <= 0 {
                    return Err(Error::ScheduleInvalid(
                        "at.atMs must be a positive epoch-ms".into(),
                    ));
                }
                Ok(self.clone())
            }
            Schedule::Every { every_ms, anchor_ms } => {
                if *every_ms < 1000 {
                    return Err(Error::ScheduleInvalid(
                        "every.everyMs must be >= 1000".into(),
                    ));
                }
                let anchor_ms = if *anchor_ms > 0 {
                    *anchor_ms
                } else {
                    chrono::Utc::now().timestamp_millis()
                };
                Ok(Schedule::Every {
                    every_ms: *every_ms,
                    anchor_ms,
                })
            }
            Schedule::Cron { expr, timezone } => {
                if expr.trim().is_empty() {
                    return Err(Error::ScheduleInvalid("cron.expr must be non-empty".into()));
                }
                crate::cron_eval::validate(expr)?;
                let timezone = if timezone.trim().is_empty() {
                    default_timezone.to_string()
                } else {
                    timezone.clone()
                };
                if timezone.parse::<chrono_tz::Tz>().is_err() {
                    return Err(Error::ScheduleInvalid(format!(
                        "unknown timezone: {timezone}"
                    )));
                }
                Ok(Schedule::Cron {
                    expr: expr.clone(),
                    timezone,
                })
            }
        }
    }
}

/// Per-job retry/lateness/cleanup policy, clamped to sane minimums.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub max_lateness_ms: i64,
    pub retry_max: u32,
    pub retry_backoff_ms: i64,
    pub delete_after_run: bool,
}

impl Policy {
    fn clamped(input: Option<Policy>, defaults: &PolicyDefaults) -> Policy {
        let input = input.unwrap_or(Policy {
            max_lateness_ms: defaults.max_lateness_ms,
            retry_max: defaults.retry_max,
            retry_backoff_ms: defaults.retry_backoff_ms,
            delete_after_run: defaults.delete_after_run,
        });

        Policy {
            max_lateness_ms: if input.max_lateness_ms >= 0 && input.max_lateness_ms.is_finite_ms()
            {
                input.max_lateness_ms
            } else {
                defaults.max_lateness_ms
            },
            retry_max: input.retry_max,
            retry_backoff_ms: if input.retry_backoff_ms >= 1000 {
                input.retry_backoff_ms
            } else {
                defaults.retry_backoff_ms
            },
            delete_after_run: input.delete_after_run,
        }
    }
}

/// Epoch-ms values arrive as plain `i64`; this just rules out the degenerate
/// negative-overflow case a malformed client could send.
trait FiniteMs {
    fn is_finite_ms(&self) -> bool;
}

impl FiniteMs for i64 {
    fn is_finite_ms(&self) -> bool {
        *self < i64::MAX
    }
}

/// Outcome of the most recent dispatch, kept for observability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Missed,
}

/// Mutable runtime block. Only the serializer writes to this.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub next_run_at_ms: i64,
    pub running_run_id: Option<RunId>,
    pub running_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub last_duration_ms: Option<i64>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// The canonical, persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant: i64,
    pub bot_name: String,
    pub name: String,
    pub prompt: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub policy: Policy,
    pub state: JobState,
    /// Whether a successful/failed run should be delivered anywhere, or is
    /// purely observational. Passed through verbatim by the scheduler.
    #[serde(default = "default_notify")]
    pub notify: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

fn default_notify() -> bool {
    true
}

/// Input accepted by `Scheduler::create`.
#[derive(Debug, Clone)]
pub struct CreateInput {
    pub tenant: i64,
    pub name: Option<String>,
    pub prompt: String,
    pub enabled: Option<bool>,
    pub schedule: Schedule,
    pub policy: Option<Policy>,
    pub notify: Option<bool>,
}

impl Job {
    /// Validates and normalizes a `create` request into a fresh `Job`.
    ///
    /// `now_ms` is the creation timestamp; `exists` tests a candidate id
    /// against the in-memory map for collisions.
    pub fn from_create(
        input: CreateInput,
        now_ms: i64,
        default_timezone: &str,
        policy_defaults: &PolicyDefaults,
        exists: impl FnMut(&str) -> bool,
    ) -> Result<Job> {
        let prompt = input.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(Error::InvalidInput("task content empty".into()));
        }

        let schedule = input.schedule.validate(default_timezone)?;
        let policy = Policy::clamped(input.policy, policy_defaults);
        let id = generate_job_id(exists);
        let name = normalize_name(input.name.as_deref(), &prompt, &id);
        let next_run_at_ms = initial_next_run(&schedule);

        Ok(Job {
            id,
            tenant: input.tenant,
            bot_name: String::new(),
            name,
            prompt,
            enabled: input.enabled.unwrap_or(true),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            schedule,
            policy,
            state: JobState {
                next_run_at_ms,
                ..JobState::default()
            },
            notify: input.notify.unwrap_or(true),
            run_count: 0,
            error_count: 0,
        })
    }
}

/// Collapses whitespace/control characters, truncates to [`MAX_NAME_LEN`]
/// with an ellipsis marker, and falls back to a prompt-derived or id-derived
/// name when the result would otherwise be empty.
pub fn normalize_name(name: Option<&str>, prompt: &str, id: &str) -> String {
    let collapse = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };

    let candidate = name.map(collapse).filter(|s| !s.is_empty());
    let candidate = candidate.or_else(|| {
        let derived = collapse(prompt);
        let truncated: String = derived.chars().take(24).collect();
        (!truncated.is_empty()).then_some(truncated)
    });
    let candidate = candidate.unwrap_or_else(|| format!("job-{id}"));

    truncate_with_ellipsis(&candidate, MAX_NAME_LEN)
}

fn truncate_with_ellipsis(s: &str, max_len: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(1);
    let mut truncated: String = s.chars().take(keep).collect();
    truncated.push('\u{2026}');
    truncated
}

/// The `nextRunAtMs` a freshly created job should start with: `atMs` for
/// one-shots, the first `anchor + k*every >= now` for intervals (inclusive
/// bound — see [`crate::trigger::next_every`]), and 0 for cron (left for the
/// cron handle to populate on first arm).
fn initial_next_run(schedule: &Schedule) -> i64 {
    match schedule {
        Schedule::At { at_ms } => *at_ms,
        Schedule::Every {
            every_ms,
            anchor_ms,
        } => crate::trigger::next_every(*anchor_ms, *every_ms, chrono::Utc::now().timestamp_millis(), true),
        Schedule::Cron { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_prompt() {
        let input = CreateInput {
            tenant: 1,
            name: None,
            prompt: "   ".into(),
            enabled: None,
            schedule: Schedule::At { at_ms: 1 },
            policy: None,
            notify: None,
        };
        let err = Job::from_create(input, 0, "UTC", &PolicyDefaults::default(), |_| false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_sub_second_every() {
        let input = CreateInput {
            tenant: 1,
            name: None,
            prompt: "hi".into(),
            enabled: None,
            schedule: Schedule::Every {
                every_ms: 999,
                anchor_ms: 1,
            },
            policy: None,
            notify: None,
        };
        let err = Job::from_create(input, 0, "UTC", &PolicyDefaults::default(), |_| false)
            .unwrap_err();
        assert!(matches!(err, Error::ScheduleInvalid(_)));
    }

    #[test]
    fn accepts_boundary_every() {
        let input = CreateInput {
            tenant: 1,
            name: None,
            prompt: "hi".into(),
            enabled: None,
            schedule: Schedule::Every {
                every_ms: 1000,
                anchor_ms: 1,
            },
            policy: None,
            notify: None,
        };
        assert!(Job::from_create(input, 0, "UTC", &PolicyDefaults::default(), |_| false).is_ok());
    }

    #[test]
    fn name_derives_from_prompt_when_omitted() {
        let name = normalize_name(None, "remember to water the plants tomorrow morning", "abc123");
        assert_eq!(name, "remember to water the plants");
    }

    #[test]
    fn name_falls_back_to_job_id() {
        let name = normalize_name(Some("   "), "", "abc123");
        assert_eq!(name, "job-abc123");
    }

    #[test]
    fn name_truncates_with_ellipsis() {
        let long = "x".repeat(60);
        let name = normalize_name(Some(&long), "", "abc123");
        assert_eq!(name.chars().count(), MAX_NAME_LEN);
        assert!(name.ends_with('\u{2026}'));
    }

    #[test]
    fn generate_job_id_retries_on_collision() {
        let mut attempts = 0;
        let id = generate_job_id(|_| {
            attempts += 1;
            attempts <= 3
        });
        assert_eq!(id.len(), ID_LEN);
        assert_eq!(attempts, 4);
    }

    #[test]
    fn generate_job_id_falls_back_after_exhaustion() {
        let id = generate_job_id(|_| true);
        assert_eq!(id.len(), FALLBACK_ID_LEN);
    }
}
