//! The single-writer, multi-reader mutation discipline (spec component C5).
//!
//! All state-mutating operations run through [`Serializer::mutate`], which
//! holds the write side of a `RwLock` for the duration of the closure. Reads
//! (`list`, `get`, `status`) take the read side and return deep copies, so
//! they never block on each other and never observe a half-applied
//! mutation.

use crate::job::{Job, JobId};
use tokio::sync::RwLock;

pub struct Serializer {
    jobs: RwLock<std::collections::HashMap<JobId, Job>>,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Replaces the entire job map, used once at startup after the store
    /// load (and again only by tests).
    pub async fn replace_all(&self, jobs: Vec<Job>) {
        let mut guard = self.jobs.write().await;
        guard.clear();
        for job in jobs {
            guard.insert(job.id.clone(), job);
        }
    }

    /// Runs `f` with exclusive access to the job map. Every accepted
    /// mutation in the crate funnels through this one entry point.
    pub async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut std::collections::HashMap<JobId, Job>) -> R,
    {
        let mut guard = self.jobs.write().await;
        f(&mut guard)
    }

    pub async fn get_clone(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Deep-copied snapshot, optionally filtered by tenant, sorted by
    /// `(enabled desc, nextRunAtMs asc with 0 treated as +inf, createdAtMs asc)`.
    pub async fn list_sorted(&self, tenant: Option<i64>) -> Vec<Job> {
        let guard = self.jobs.read().await;
        let mut jobs: Vec<Job> = guard
            .values()
            .filter(|j| tenant.is_none_or(|t| j.tenant == t))
            .cloned()
            .collect();

        jobs.sort_by(|a, b| {
            let enabled_key = |j: &Job| std::cmp::Reverse(j.enabled);
            let next_run_key = |j: &Job| {
                if j.state.next_run_at_ms == 0 {
                    i64::MAX
                } else {
                    j.state.next_run_at_ms
                }
            };

            enabled_key(a)
                .cmp(&enabled_key(b))
                .then(next_run_key(a).cmp(&next_run_key(b)))
                .then(a.created_at_ms.cmp(&b.created_at_ms))
        });

        jobs
    }

    pub async fn all_jobs_snapshot(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, Policy, Schedule};

    fn sample(id: &str, tenant: i64, enabled: bool, next_run: i64, created: i64) -> Job {
        Job {
            id: id.to_string(),
            tenant,
            bot_name: "bot".into(),
            name: "job".into(),
            prompt: "do it".into(),
            enabled,
            created_at_ms: created,
            updated_at_ms: created,
            schedule: Schedule::At { at_ms: 1 },
            policy: Policy {
                max_lateness_ms: 1000,
                retry_max: 0,
                retry_backoff_ms: 1000,
                delete_after_run: false,
            },
            state: JobState {
                next_run_at_ms: next_run,
                ..JobState::default()
            },
            notify: true,
            run_count: 0,
            error_count: 0,
        }
    }

    #[tokio::test]
    async fn mutate_is_visible_to_subsequent_reads() {
        let serializer = Serializer::new();
        serializer
            .mutate(|jobs| {
                jobs.insert("a".into(), sample("a", 1, true, 0, 0));
            })
            .await;

        assert!(serializer.get_clone("a").await.is_some());
    }

    #[tokio::test]
    async fn list_sorted_orders_enabled_first_then_next_run_then_created() {
        let serializer = Serializer::new();
        serializer
            .replace_all(vec![
                sample("disabled", 1, false, 500, 0),
                sample("pending-cron", 1, true, 0, 10),
                sample("soonest", 1, true, 100, 20),
                sample("later", 1, true, 200, 30),
            ])
            .await;

        let ids: Vec<String> = serializer
            .list_sorted(None)
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();

        assert_eq!(ids, vec!["soonest", "later", "pending-cron", "disabled"]);
    }

    #[tokio::test]
    async fn list_sorted_filters_by_tenant() {
        let serializer = Serializer::new();
        serializer
            .replace_all(vec![sample("a", 1, true, 0, 0), sample("b", 2, true, 0, 0)])
            .await;

        let jobs = serializer.list_sorted(Some(2)).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "b");
    }
}
