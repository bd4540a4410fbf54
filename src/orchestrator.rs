//! Top-level entry points: synchronous transcription, job submission,
//! progress queries and health.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::{LoadOutcome, Task, TranscriptionEngine, TranscriptionRequest, TranscriptionResult};
use crate::error::{Result, ServiceError};
use crate::jobs::{spawn_reaper, JobRegistry, JobSnapshot, JobStatus};
use crate::progress::{ProgressReporter, StageProgress};
use crate::scratch::{ScratchFile, ScratchSpace};

/// Client-selectable transcription options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeOptions {
    pub model_size: Option<String>,
    pub language: Option<String>,
    pub temperature: f64,
    pub task: Task,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            model_size: None,
            language: None,
            temperature: 0.0,
            task: Task::Transcribe,
        }
    }
}

impl TranscribeOptions {
    fn request_for(&self, path: &Path) -> TranscriptionRequest {
        TranscriptionRequest {
            path: path.to_path_buf(),
            model_size: self.model_size.clone(),
            language: self.language.clone(),
            temperature: self.temperature,
            task: self.task,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy` with a loaded model, otherwise `degraded`
    pub status: String,
    pub model_loaded: bool,
    pub model_size: Option<String>,
    /// Seconds
    pub uptime: f64,
    pub active_transcriptions: usize,
    pub tracked_jobs: usize,
}

pub struct Orchestrator {
    config: Arc<Config>,
    engine: Arc<TranscriptionEngine>,
    jobs: Arc<JobRegistry>,
    scratch: ScratchSpace,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, engine: Arc<TranscriptionEngine>) -> Self {
        let scratch = ScratchSpace::new(config.upload.scratch_dir.clone());
        Self {
            config,
            engine,
            jobs: Arc::new(JobRegistry::new()),
            scratch,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<TranscriptionEngine> {
        &self.engine
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Load the configured model and start the job reaper
    pub async fn start(&self) -> Result<LoadOutcome> {
        let outcome = self.engine.load_model(None).await?;

        let retention = Duration::from_secs(self.config.jobs.retention_seconds);
        let interval = Duration::from_secs(self.config.jobs.cleanup_interval_seconds);
        let handle = spawn_reaper(Arc::clone(&self.jobs), retention, interval);
        if let Some(previous) = self.reaper_slot().replace(handle) {
            previous.abort();
        }

        info!(
            "🚀 Orchestrator started (model {}, job cleanup every {}s)",
            outcome.model_size,
            interval.as_secs()
        );
        Ok(outcome)
    }

    fn reaper_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn admit(&self, size: u64) -> Result<()> {
        if !self.engine.is_model_loaded().await {
            return Err(ServiceError::ModelNotLoaded(
                "Transcription model is not loaded. Please wait for the service to initialize.".to_string(),
            ));
        }

        let max_size = self.config.upload.max_file_size_bytes();
        if size > max_size {
            return Err(ServiceError::FileTooLarge { size, max_size });
        }
        Ok(())
    }

    /// Transcribe a file the caller owns
    pub async fn transcribe_file(
        &self,
        path: &Path,
        options: &TranscribeOptions,
        progress: &ProgressReporter,
    ) -> Result<TranscriptionResult> {
        self.engine.transcribe(options.request_for(path), progress).await
    }

    /// Persist an upload, transcribe it and remove it again
    pub async fn transcribe_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        options: &TranscribeOptions,
    ) -> Result<TranscriptionResult> {
        self.admit(bytes.len() as u64).await?;

        let upload = self.scratch.persist_upload(filename, bytes).await?;
        let result = self
            .transcribe_file(upload.path(), options, &ProgressReporter::silent())
            .await;

        if let Err(e) = &result {
            error!("❌ Transcription of {} failed: {}", filename, e);
        }
        result
    }

    /// Persist an upload and transcribe it in the background
    pub async fn submit_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        options: &TranscribeOptions,
    ) -> Result<JobSubmission> {
        self.admit(bytes.len() as u64).await?;

        let job = self.jobs.create().await;
        let upload = match self.scratch.persist_upload(filename, bytes).await {
            Ok(upload) => upload,
            Err(e) => {
                self.jobs.delete(job.id()).await;
                return Err(e);
            }
        };

        let engine = Arc::clone(&self.engine);
        let request = options.request_for(upload.path());
        let worker_job = Arc::clone(&job);

        tokio::spawn(async move {
            // the upload lives exactly as long as the job's work
            let _upload: ScratchFile = upload;

            worker_job.mark_processing("Starting transcription...");
            let sink_job = Arc::clone(&worker_job);
            let reporter = ProgressReporter::new(Arc::new(move |p: StageProgress| {
                sink_job.update_progress(p.percent, p.message);
            }));

            match engine.transcribe(request, &reporter).await {
                Ok(result) => {
                    info!("✅ Job {} completed", worker_job.id());
                    worker_job.complete(result);
                }
                Err(e) => {
                    error!("❌ Job {} failed: {}", worker_job.id(), e);
                    worker_job.fail(format!("Transcription failed: {}", e));
                }
            }
        });

        info!("📥 Job {} submitted for {}", job.id(), filename);
        Ok(JobSubmission {
            job_id: job.id().to_string(),
            status: JobStatus::Pending,
            message: "Job submitted successfully".to_string(),
        })
    }

    pub async fn job_progress(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.snapshot(job_id).await
    }

    pub async fn health(&self) -> HealthReport {
        let info = self.engine.model_info().await;
        HealthReport {
            status: if info.is_loaded { "healthy" } else { "degraded" }.to_string(),
            model_loaded: info.is_loaded,
            model_size: info.model_size,
            uptime: (info.uptime_seconds * 100.0).round() / 100.0,
            active_transcriptions: info.active_transcriptions,
            tracked_jobs: self.jobs.len().await,
        }
    }

    /// Stop the reaper, then drain and unload the engine
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper_slot().take() {
            reaper.abort();
        }
        if self.engine.active_transcriptions() > 0 {
            warn!(
                "⏳ Waiting for {} active transcription(s) before shutdown",
                self.engine.active_transcriptions()
            );
        }
        self.engine.shutdown().await;
    }
}
