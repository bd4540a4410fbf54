//! Error taxonomy shared by the pipeline, the engine and the job layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Machine-readable error kind exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidAudioFormat,
    FileTooLarge,
    FileSystemError,
    AudioProcessingError,
    ModelNotLoaded,
    ModelLoadFailed,
    TranscriptionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAudioFormat => "INVALID_AUDIO_FORMAT",
            ErrorKind::FileTooLarge => "FILE_TOO_LARGE",
            ErrorKind::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorKind::AudioProcessingError => "AUDIO_PROCESSING_ERROR",
            ErrorKind::ModelNotLoaded => "MODEL_NOT_LOADED",
            ErrorKind::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorKind::TranscriptionFailed => "TRANSCRIPTION_FAILED",
        }
    }

    /// Coarse category a client can branch on
    pub fn category(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAudioFormat => "unsupported_format",
            ErrorKind::FileTooLarge => "too_large",
            ErrorKind::ModelNotLoaded => "service_not_ready",
            ErrorKind::FileSystemError
            | ErrorKind::AudioProcessingError
            | ErrorKind::ModelLoadFailed
            | ErrorKind::TranscriptionFailed => "processing_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Unsupported media format: {format}")]
    InvalidFormat {
        format: String,
        supported: Vec<String>,
    },

    #[error("File too large: {size} bytes (maximum {max_size} bytes)")]
    FileTooLarge { size: u64, max_size: u64 },

    #[error("File system error during {operation}: {message}")]
    FileSystem {
        operation: String,
        path: Option<PathBuf>,
        message: String,
    },

    #[error("{message} (step: {step})")]
    AudioProcessing {
        step: String,
        message: String,
        detail: Option<String>,
    },

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Failed to load model {model}: {reason}")]
    ModelLoadFailed { model: String, reason: String },

    #[error("Transcription failed: {message}")]
    TranscriptionFailed {
        message: String,
        detail: Option<String>,
    },
}

impl ServiceError {
    pub fn audio(step: impl Into<String>, message: impl Into<String>, detail: Option<String>) -> Self {
        ServiceError::AudioProcessing {
            step: step.into(),
            message: message.into(),
            detail,
        }
    }

    pub fn file_system(operation: &str, path: Option<PathBuf>, err: impl std::fmt::Display) -> Self {
        ServiceError::FileSystem {
            operation: operation.to_string(),
            path,
            message: err.to_string(),
        }
    }

    pub fn transcription(message: impl Into<String>, detail: Option<String>) -> Self {
        ServiceError::TranscriptionFailed {
            message: message.into(),
            detail,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidFormat { .. } => ErrorKind::InvalidAudioFormat,
            ServiceError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            ServiceError::FileSystem { .. } => ErrorKind::FileSystemError,
            ServiceError::AudioProcessing { .. } => ErrorKind::AudioProcessingError,
            ServiceError::ModelNotLoaded(_) => ErrorKind::ModelNotLoaded,
            ServiceError::ModelLoadFailed { .. } => ErrorKind::ModelLoadFailed,
            ServiceError::TranscriptionFailed { .. } => ErrorKind::TranscriptionFailed,
        }
    }

    /// Processing step for audio errors
    pub fn step(&self) -> Option<&str> {
        match self {
            ServiceError::AudioProcessing { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Structured detail payload for error responses
    pub fn details(&self) -> Value {
        match self {
            ServiceError::InvalidFormat { format, supported } => json!({
                "file_format": format,
                "supported_formats": supported,
            }),
            ServiceError::FileTooLarge { size, max_size } => json!({
                "file_size": size,
                "max_size": max_size,
            }),
            ServiceError::FileSystem { operation, path, message } => json!({
                "operation": operation,
                "file_path": path.as_ref().map(|p| p.display().to_string()),
                "original_error": message,
            }),
            ServiceError::AudioProcessing { step, detail, .. } => json!({
                "processing_step": step,
                "original_error": detail,
            }),
            ServiceError::ModelNotLoaded(_) => json!({}),
            ServiceError::ModelLoadFailed { model, reason } => json!({
                "model_size": model,
                "original_error": reason,
            }),
            ServiceError::TranscriptionFailed { detail, .. } => json!({
                "original_error": detail,
            }),
        }
    }
}

/// Cut tool diagnostics down to a bounded length on a char boundary
pub fn truncate_diagnostic(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_stable_categories() {
        let too_large = ServiceError::FileTooLarge { size: 10, max_size: 5 };
        assert_eq!(too_large.kind().as_str(), "FILE_TOO_LARGE");
        assert_eq!(too_large.kind().category(), "too_large");

        let not_ready = ServiceError::ModelNotLoaded("no model".into());
        assert_eq!(not_ready.kind().category(), "service_not_ready");

        let invalid = ServiceError::InvalidFormat {
            format: "txt".into(),
            supported: vec!["wav".into()],
        };
        assert_eq!(invalid.kind().category(), "unsupported_format");
        assert_eq!(invalid.details()["file_format"], "txt");
    }

    #[test]
    fn test_audio_error_carries_step() {
        let err = ServiceError::audio("extract", "ffmpeg not found", None);
        assert_eq!(err.step(), Some("extract"));
        assert_eq!(err.kind(), ErrorKind::AudioProcessingError);
        assert!(err.to_string().contains("ffmpeg not found"));
    }

    #[test]
    fn test_truncate_diagnostic() {
        assert_eq!(truncate_diagnostic("  short  ", 200), "short");
        let long = "x".repeat(300);
        let cut = truncate_diagnostic(&long, 200);
        assert_eq!(cut.len(), 203);
        assert!(cut.ends_with("..."));
        // multi-byte input must not panic
        let _ = truncate_diagnostic(&"é".repeat(10), 3);
    }
}
