//! Atomic JSON-file persistence for the job collection.
//!
//! Grounded on `replace_path_atomic`'s temp-file-then-rename discipline and
//! on a single-file JSON snapshot of a job map (write the whole map, never
//! partial updates).

use crate::error::{Result, StoreError};
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    updated_at_ms: i64,
    jobs: Vec<Job>,
}

/// A single JSON file at `<root>/<bot_name>/jobs.json`, written through a
/// temp-file-then-rename sequence and serialized behind its own lock so
/// concurrent persist calls observe snapshot order consistent with mutation
/// order.
pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn new(root: &Path, bot_name: &str) -> Self {
        Self {
            path: root.join(bot_name).join("jobs.json"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and parses the store. Fail-open: a missing file yields an
    /// empty collection; a parse failure logs and yields an empty
    /// collection rather than aborting startup. Records that individually
    /// fail normalization are skipped with a warning rather than failing
    /// the whole load.
    pub async fn load(&self) -> Vec<Job> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no existing store, starting empty");
                return Vec::new();
            }
            Err(source) => {
                let err = StoreError::Read {
                    path: self.path.display().to_string(),
                    source,
                };
                tracing::warn!(error = %err, "failed to read store, starting empty");
                return Vec::new();
            }
        };

        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = StoreError::Corrupt {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %err, "store is corrupt, treating as empty");
                return Vec::new();
            }
        };

        envelope
            .jobs
            .into_iter()
            .filter_map(|job| match validate_loaded(&job) {
                Ok(()) => Some(job),
                Err(reason) => {
                    tracing::warn!(job_id = %job.id, reason, "skipping malformed job record");
                    None
                }
            })
            .collect()
    }

    /// Serializes the full job collection and writes it atomically. Persist
    /// calls are themselves serialized: a new write always awaits any
    /// in-flight one so observed snapshot order matches mutation order.
    pub async fn save(&self, jobs: &[Job], now_ms: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: self.path.display().to_string(),
                    source,
                })?;
        }

        let envelope = Envelope {
            version: STORE_VERSION,
            updated_at_ms: now_ms,
            jobs: jobs.to_vec(),
        };
        let body = serde_json::to_string_pretty(&envelope).map_err(StoreError::from)?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|source| StoreError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;

        self.rename_with_retry(&tmp_path).await
    }

    async fn rename_with_retry(&self, tmp_path: &Path) -> Result<()> {
        match tokio::fs::rename(tmp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %first_err,
                    "atomic rename failed, removing destination and retrying once"
                );
                let _ = tokio::fs::remove_file(&self.path).await;
                tokio::fs::rename(tmp_path, &self.path)
                    .await
                    .map_err(|source| {
                        StoreError::Write {
                            path: self.path.display().to_string(),
                            source,
                        }
                        .into()
                    })
            }
        }
    }
}

/// A minimal sanity check on a record loaded from disk: invariants from the
/// data model must already hold for anything written by this crate, but a
/// hand-edited or foreign-written store could violate them.
fn validate_loaded(job: &Job) -> std::result::Result<(), &'static str> {
    if job.id.is_empty() {
        return Err("empty id");
    }
    if job.prompt.trim().is_empty() {
        return Err("empty prompt");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, Policy, Schedule};

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            tenant: 1,
            bot_name: "bot".to_string(),
            name: "job".to_string(),
            prompt: "do the thing".to_string(),
            enabled: true,
            created_at_ms: 0,
            updated_at_ms: 0,
            schedule: Schedule::At { at_ms: 1000 },
            policy: Policy {
                max_lateness_ms: 1000,
                retry_max: 0,
                retry_backoff_ms: 1000,
                delete_after_run: false,
            },
            state: JobState::default(),
            notify: true,
            run_count: 0,
            error_count: 0,
        }
    }

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "bot1");
        let jobs = vec![sample_job("aaaaaaaaaa"), sample_job("bbbbbbbbbb")];

        store.save(&jobs, 123).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, jobs[0].id);
        assert_eq!(loaded[1].id, jobs[1].id);
    }

    #[tokio::test]
    async fn missing_store_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "nonexistent");
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_store_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "bot1");
        tokio::fs::create_dir_all(store.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(store.path(), b"not json at all")
            .await
            .unwrap();

        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "bot1");
        let mut broken = sample_job("cccccccccc");
        broken.prompt = "   ".to_string();
        let jobs = vec![sample_job("aaaaaaaaaa"), broken];

        store.save(&jobs, 0).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "aaaaaaaaaa");
    }

    #[tokio::test]
    async fn save_retries_rename_when_destination_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "bot1");
        let jobs = vec![sample_job("aaaaaaaaaa")];

        store.save(&jobs, 0).await.unwrap();
        // Destination already exists from the first save; a second save
        // must still succeed via the remove-then-retry path.
        store.save(&jobs, 1).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
    }
}
