//! Whisperrr transcription service
//!
//! Accepts uploaded audio or video, normalises it into a canonical
//! waveform and runs it through a Whisper model, either synchronously or
//! as a background job with live progress.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod media;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod scratch;
pub mod validation;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for easy access
pub use crate::config::{Config, ConfigBuilder};
pub use crate::engine::{TranscriptionEngine, TranscriptionRequest, TranscriptionResult, WhisperCliLoader};
pub use crate::error::{ErrorKind, Result, ServiceError};
pub use crate::jobs::{JobRegistry, JobSnapshot, JobStatus};
pub use crate::orchestrator::{HealthReport, JobSubmission, Orchestrator, TranscribeOptions};
pub use crate::pipeline::{PipelineState, PreprocessedAudio, Preprocessor};
pub use crate::progress::{ProgressReporter, StageProgress};
pub use crate::validation::{validate_media, MediaReport};
