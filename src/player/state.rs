use serde::Serialize;
use thiserror::Error;

use crate::session::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    Failed(String),
}

impl PlaybackState {
    /// A clip is loaded into the output.
    pub fn has_output(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused)
    }
}

/// Observable view of the player.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub state: PlaybackState,
    /// Always within `[0, duration_seconds]`.
    pub position_seconds: f64,
    /// Known once the clip is decoded.
    pub duration_seconds: Option<f64>,
    /// Always within `[MIN_RATE, MAX_RATE]`.
    pub rate: f32,
    pub source: Option<String>,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position_seconds: 0.0,
            duration_seconds: None,
            rate: 1.0,
            source: None,
        }
    }
}

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 2.0;

pub(crate) fn clamp_rate(rate: f32) -> f32 {
    if rate.is_nan() {
        return 1.0;
    }
    rate.clamp(MIN_RATE, MAX_RATE)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("failed to load audio: {0}")]
    LoadFailed(String),
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
    #[error("no active playback")]
    NoActivePlayback,
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("audio data is empty")]
    InvalidData,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_clamped() {
        assert_eq!(clamp_rate(0.1), MIN_RATE);
        assert_eq!(clamp_rate(3.0), MAX_RATE);
        assert_eq!(clamp_rate(1.25), 1.25);
        assert_eq!(clamp_rate(f32::NAN), 1.0);
        assert_eq!(clamp_rate(f32::INFINITY), MAX_RATE);
    }
}
