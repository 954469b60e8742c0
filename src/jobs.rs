//! Job coordination.
//!
//! One-shot CRUD against the engine's job API plus a cancellable poll loop
//! that watches a single job to completion. Job status is only ever written
//! by the engine; this module observes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::client::EngineClient;
use crate::error::{CoreError, Result};
use crate::events::CoreSignal;
use crate::types::{Job, JobStatus};

/// Interval between polls of the actively watched job.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ─── JobManager ──────────────────────────────────────────────────────────────

/// Creates, lists, and deletes jobs; watches at most one job at a time.
pub struct JobManager {
    client: EngineClient,
    signals: mpsc::Sender<CoreSignal>,
    /// Last-seen job records, keyed by id. Updated by every fetch.
    cache: Arc<DashMap<String, Job>>,
    /// Bumped on every `start_polling`/`stop_polling`; a loop that no longer
    /// matches the counter is superseded and must never fire a callback.
    poll_generation: Arc<AtomicU64>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    active_job: Arc<StdMutex<Option<String>>>,
}

impl JobManager {
    pub(crate) fn new(client: EngineClient, signals: mpsc::Sender<CoreSignal>) -> Self {
        Self {
            client,
            signals,
            cache: Arc::new(DashMap::new()),
            poll_generation: Arc::new(AtomicU64::new(0)),
            poll_task: StdMutex::new(None),
            active_job: Arc::new(StdMutex::new(None)),
        }
    }

    /// Create a synthesis job on the engine.
    pub async fn create_job(&self, text: &str, voice_id: Option<&str>) -> Result<Job> {
        let job = self.client.create_job(text, voice_id).await?;
        log::info!("[Jobs] Created job {} ({} chars)", job.id, text.len());
        self.cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Fetch all jobs, most recent first.
    pub async fn fetch_jobs(&self) -> Result<Vec<Job>> {
        let jobs = self.client.list_jobs().await?;
        for job in &jobs {
            self.cache.insert(job.id.clone(), job.clone());
        }
        Ok(jobs)
    }

    /// Fetch a single job by id.
    pub async fn fetch_job(&self, id: &str) -> Result<Job> {
        let job = self.client.get_job(id).await?;
        self.cache.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Delete a job. Cancels the active poll if it watches this job.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.client.delete_job(id).await?;
        self.cache.remove(id);
        let watching = self
            .active_job
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_deref()
            == Some(id);
        if watching {
            self.stop_polling();
        }
        Ok(())
    }

    /// Delete every job on the engine and clear local state.
    pub async fn delete_all_jobs(&self) -> Result<()> {
        self.client.delete_all_jobs().await?;
        self.cache.clear();
        self.stop_polling();
        Ok(())
    }

    /// Fetch the rendered audio bytes for a completed job.
    pub async fn fetch_audio(&self, id: &str) -> Result<Vec<u8>> {
        self.client.fetch_audio(id).await
    }

    /// Last-seen job records without a round-trip, most recent first.
    pub fn cached_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.cache.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// The id of the job currently being watched, if any.
    pub fn active_job(&self) -> Option<String> {
        self.active_job
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // ─── Polling ─────────────────────────────────────────────────────────────

    /// Watch a job until it reaches a terminal status.
    ///
    /// Supersedes any previous watch: only the most recently started poll can
    /// ever report an outcome. Transient transport errors are retried on the
    /// next tick; a 404 means the job was deleted locally and ends the watch
    /// without a callback.
    pub fn start_polling(&self, job_id: &str) {
        let generation = self.poll_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        *self.active_job.lock().unwrap_or_else(|p| p.into_inner()) = Some(job_id.to_string());

        log::info!("[Jobs] Watching job {}", job_id);

        let client = self.client.clone();
        let signals = self.signals.clone();
        let cache = Arc::clone(&self.cache);
        let poll_generation = Arc::clone(&self.poll_generation);
        let active_job = Arc::clone(&self.active_job);
        let id = job_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = interval(JOB_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if poll_generation.load(Ordering::SeqCst) != generation {
                    break;
                }

                match client.get_job(&id).await {
                    Ok(job) => {
                        cache.insert(job.id.clone(), job.clone());
                        if !job.status.is_terminal() {
                            continue;
                        }
                        // Re-check after the fetch: a watch started meanwhile
                        // owns the outcome, this one stays silent.
                        if poll_generation.load(Ordering::SeqCst) != generation {
                            break;
                        }
                        *active_job.lock().unwrap_or_else(|p| p.into_inner()) = None;
                        log::info!("[Jobs] Job {} finished: {:?}", id, job.status);
                        let signal = match job.status {
                            JobStatus::Failed => CoreSignal::JobFailed(job),
                            _ => CoreSignal::JobDone(job),
                        };
                        let _ = signals.send(signal).await;
                        break;
                    }
                    Err(CoreError::JobNotFound(_)) => {
                        log::warn!("[Jobs] Job {} disappeared while polling", id);
                        *active_job.lock().unwrap_or_else(|p| p.into_inner()) = None;
                        break;
                    }
                    Err(e) => {
                        log::warn!("[Jobs] Poll failed for {} (will retry): {}", id, e);
                    }
                }
            }
        });

        *self.poll_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }

    /// Cancel the active watch, if any. Idempotent.
    pub fn stop_polling(&self) {
        self.poll_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        *self.active_job.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_jobs() -> JobManager {
        let (tx, _rx) = mpsc::channel(16);
        // Nothing listens on this port; loops only see transport errors.
        JobManager::new(EngineClient::new(59230), tx)
    }

    #[tokio::test]
    async fn stop_polling_without_active_watch_is_idempotent() {
        let jobs = test_jobs();
        jobs.stop_polling();
        jobs.stop_polling();
        assert!(jobs.active_job().is_none());
    }

    #[tokio::test]
    async fn start_polling_tracks_active_job_and_stop_clears_it() {
        let jobs = test_jobs();
        jobs.start_polling("job_a");
        assert_eq!(jobs.active_job().as_deref(), Some("job_a"));

        jobs.start_polling("job_b");
        assert_eq!(jobs.active_job().as_deref(), Some("job_b"));

        jobs.stop_polling();
        assert!(jobs.active_job().is_none());
    }

    #[tokio::test]
    async fn cached_jobs_orders_newest_first() {
        let jobs = test_jobs();
        let mk = |id: &str, ts: &str| -> Job {
            serde_json::from_value(serde_json::json!({
                "id": id,
                "text": "hi",
                "voice_id": null,
                "status": "pending",
                "created_at": ts,
            }))
            .unwrap()
        };
        jobs.cache.insert("old".into(), mk("old", "2026-08-06T10:00:00"));
        jobs.cache.insert("new".into(), mk("new", "2026-08-06T11:00:00"));

        let cached = jobs.cached_jobs();
        assert_eq!(cached[0].id, "new");
        assert_eq!(cached[1].id, "old");
    }
}
