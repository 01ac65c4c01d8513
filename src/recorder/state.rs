use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::session::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
    Failed(String),
}

impl RecordingState {
    /// A capture is open (possibly paused).
    pub fn is_capturing(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

/// Observable view of the recorder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    pub elapsed_seconds: f64,
    /// Normalized input level in `[0, 1]`; 0 whenever not recording.
    pub level: f32,
    pub file_path: Option<PathBuf>,
}

impl Default for RecordingSnapshot {
    fn default() -> Self {
        Self {
            state: RecordingState::Idle,
            elapsed_seconds: 0.0,
            level: 0.0,
            file_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("recording failed: {0}")]
    RecordingFailed(String),
    #[error("operation not valid in state {0:?}")]
    InvalidState(RecordingState),
    #[error(transparent)]
    Session(SessionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<SessionError> for RecordingError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::PermissionDenied => RecordingError::PermissionDenied,
            other => RecordingError::Session(other),
        }
    }
}

/// Recording time with pauses excluded. Shared with the handle so elapsed time
/// can be read between level ticks.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ElapsedClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl ElapsedClock {
    pub(crate) fn start(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = Some(Instant::now());
    }

    pub(crate) fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub(crate) fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }
}
