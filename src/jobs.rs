//! In-memory registry of asynchronous transcription jobs.
//!
//! The map itself sits behind one `RwLock` used only for inserting and
//! removing entries. Each job carries its own mutex for field updates, so
//! a worker writing progress never contends with lookups of other jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::TranscriptionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    pub result: Option<TranscriptionResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    progress: f64,
    message: String,
    result: Option<TranscriptionResult>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

/// One job; all field updates go through its lock
#[derive(Debug)]
pub struct Job {
    id: String,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

impl Job {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                progress: 0.0,
                message: "Job created".to_string(),
                result: None,
                error: None,
                updated_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        // a panicked writer leaves plain data behind; keep serving it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    /// Record progress. Values are clamped to [0, 100] and never move
    /// backwards; updates after a terminal status are ignored.
    pub fn update_progress(&self, percent: f64, message: impl Into<String>) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }

        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        state.progress = state.progress.max(percent);
        let message = message.into();
        if !message.is_empty() {
            state.message = message;
        }
        state.updated_at = Utc::now();
        true
    }

    pub fn mark_processing(&self, message: impl Into<String>) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        state.status = JobStatus::Processing;
        state.message = message.into();
        state.updated_at = Utc::now();
        true
    }

    pub fn complete(&self, result: TranscriptionResult) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        state.status = JobStatus::Completed;
        state.progress = 100.0;
        state.message = "Transcription completed".to_string();
        state.result = Some(result);
        state.updated_at = Utc::now();
        true
    }

    pub fn fail(&self, error: impl Into<String>) -> bool {
        let mut state = self.state();
        if state.status.is_terminal() {
            return false;
        }
        let error = error.into();
        state.status = JobStatus::Failed;
        state.message = error.clone();
        state.error = Some(error);
        state.updated_at = Utc::now();
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            job_id: self.id.clone(),
            status: state.status,
            progress: state.progress,
            message: state.message.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Thread-safe job store
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh PENDING job
    pub async fn create(&self) -> Arc<Job> {
        let job = Arc::new(Job::new(Uuid::new_v4().to_string()));
        self.jobs.write().await.insert(job.id.clone(), Arc::clone(&job));
        debug!("🆕 Created job {}", job.id);
        job
    }

    pub async fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.get(job_id).await.map(|job| job.snapshot())
    }

    pub async fn delete(&self, job_id: &str) -> bool {
        self.jobs.write().await.remove(job_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Delete jobs created more than `retention` ago; returns how many
    pub async fn sweep(&self, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        {
            Some(cutoff) => cutoff,
            // retention reaches past the representable range
            None => return 0,
        };

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at >= cutoff);
        let removed = before - jobs.len();

        if removed > 0 {
            info!("🧹 Reaped {} expired job(s), {} remaining", removed, jobs.len());
        }
        removed
    }
}

/// Periodically sweep `registry` until the task is aborted
pub fn spawn_reaper(registry: Arc<JobRegistry>, retention: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.sweep(retention).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> TranscriptionResult {
        TranscriptionResult {
            text: "hello".to_string(),
            language: Some("en".to_string()),
            language_probability: None,
            duration: 1.0,
            segments: Vec::new(),
            confidence: None,
            model_used: "tiny".to_string(),
            processing_time: 0.1,
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let registry = JobRegistry::new();
        let job = registry.create().await;

        let snapshot = registry.snapshot(job.id()).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.progress, 0.0);
        assert!(Uuid::parse_str(&snapshot.job_id).is_ok());

        assert!(registry.delete(job.id()).await);
        assert!(registry.get(job.id()).await.is_none());
        assert!(!registry.delete(job.id()).await);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let job = Job::new("job".to_string());
        job.update_progress(30.0, "a");
        job.update_progress(10.0, "b");
        assert_eq!(job.snapshot().progress, 30.0);
        assert_eq!(job.snapshot().message, "b");

        job.update_progress(250.0, "c");
        assert_eq!(job.snapshot().progress, 100.0);
        job.update_progress(f64::NAN, "d");
        assert_eq!(job.snapshot().progress, 100.0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let job = Job::new("job".to_string());
        job.mark_processing("Starting");
        job.update_progress(50.0, "halfway");
        assert!(job.complete(result()));

        assert!(!job.fail("late failure"));
        assert!(!job.update_progress(10.0, "late progress"));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.progress, 100.0);
        assert!(snapshot.result.is_some());
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_failure_carries_error_without_result() {
        let job = Job::new("job".to_string());
        job.update_progress(20.0, "working");
        assert!(job.fail("Unsupported media format: txt"));

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.progress, 20.0);
        assert!(snapshot.result.is_none());
        assert_eq!(snapshot.error.as_deref(), Some("Unsupported media format: txt"));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_jobs() {
        let registry = JobRegistry::new();
        let old = registry.create().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = registry.create().await;

        assert_eq!(registry.sweep(Duration::from_millis(30)).await, 1);
        assert!(registry.get(old.id()).await.is_none());
        assert!(registry.get(fresh.id()).await.is_some());
        assert_eq!(registry.sweep(Duration::from_secs(3600)).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_readers() {
        let registry = Arc::new(JobRegistry::new());
        let job = registry.create().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let job = Arc::clone(&job);
            handles.push(tokio::spawn(async move {
                for step in 0..50 {
                    job.update_progress((i * 50 + step) as f64 / 4.0, format!("step {}", step));
                }
            }));
        }
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let id = job.id().to_string();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let snapshot = registry.snapshot(&id).await.unwrap();
                    assert!((0.0..=100.0).contains(&snapshot.progress));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(job.snapshot().progress, 99.75);
    }

    #[tokio::test]
    async fn test_reaper_task_sweeps() {
        let registry = Arc::new(JobRegistry::new());
        registry.create().await;

        let reaper = spawn_reaper(Arc::clone(&registry), Duration::ZERO, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        reaper.abort();

        assert!(registry.is_empty().await);
    }
}
