//! Stage-local progress and its rescaling into a caller's range.
//!
//! Every component reports percentages on its own 0-100 scale. The caller
//! hands down a [`ProgressReporter`] whose [`StageRange`] says where that
//! local scale lands in the caller's own scale, so nesting is resolved one
//! level at a time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A (percentage, message) checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub percent: f64,
    pub message: String,
}

/// Sub-range `[start, end]` of a parent 0-100 scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRange {
    pub start: f64,
    pub end: f64,
}

impl StageRange {
    pub const FULL: StageRange = StageRange { start: 0.0, end: 100.0 };

    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 100.0);
        let end = end.clamp(start, 100.0);
        Self { start, end }
    }

    /// Map a local 0-100 percentage into this range
    pub fn map(&self, local: f64) -> f64 {
        let local = if local.is_finite() { local.clamp(0.0, 100.0) } else { 0.0 };
        self.start + (self.end - self.start) * local / 100.0
    }

    /// Compose: a sub-range of this range, expressed in this range's local scale
    pub fn within(&self, inner: StageRange) -> StageRange {
        StageRange {
            start: self.map(inner.start),
            end: self.map(inner.end),
        }
    }
}

/// Receiver of job-global progress
pub type ProgressSink = Arc<dyn Fn(StageProgress) + Send + Sync>;

/// Reports local progress into a sub-range of a sink
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<ProgressSink>,
    range: StageRange,
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            sink: Some(sink),
            range: StageRange::FULL,
        }
    }

    /// Reporter that discards everything
    pub fn silent() -> Self {
        Self {
            sink: None,
            range: StageRange::FULL,
        }
    }

    /// Child reporter whose 0-100 lands in `[start, end]` of this reporter's scale
    pub fn child(&self, start: f64, end: f64) -> Self {
        Self {
            sink: self.sink.clone(),
            range: self.range.within(StageRange::new(start, end)),
        }
    }

    pub fn range(&self) -> StageRange {
        self.range
    }

    pub fn report(&self, local_percent: f64, message: impl Into<String>) {
        if let Some(sink) = &self.sink {
            let message = message.into();
            let percent = self.range.map(local_percent);
            tracing::debug!("📈 {:.1}% {}", percent, message);
            sink(StageProgress { percent, message });
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("range", &self.range)
            .field("attached", &self.sink.is_some())
            .finish()
    }
}
