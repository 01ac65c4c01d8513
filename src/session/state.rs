use serde::Serialize;
use thiserror::Error;

use crate::hardware::RouteChangeReason;

/// Named hardware configurations, ordered by what they need from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SessionMode {
    #[default]
    Idle,
    Recording,
    Playback,
    RecordingAndPlayback,
}

impl SessionMode {
    pub fn includes_recording(self) -> bool {
        matches!(self, SessionMode::Recording | SessionMode::RecordingAndPlayback)
    }

    pub fn includes_playback(self) -> bool {
        matches!(self, SessionMode::Playback | SessionMode::RecordingAndPlayback)
    }

    /// Smallest mode that satisfies both `self` and `other`.
    pub fn merge(self, other: SessionMode) -> SessionMode {
        let records = self.includes_recording() || other.includes_recording();
        let plays = self.includes_playback() || other.includes_playback();
        match (records, plays) {
            (true, true) => SessionMode::RecordingAndPlayback,
            (true, false) => SessionMode::Recording,
            (false, true) => SessionMode::Playback,
            (false, false) => SessionMode::Idle,
        }
    }
}

/// Process-wide hardware session state. Only the coordinator writes it.
///
/// Invariant: `!is_active` implies `mode == SessionMode::Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub mode: SessionMode,
    pub is_active: bool,
    pub current_route_name: String,
    pub has_external_output: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            mode: SessionMode::Idle,
            is_active: false,
            current_route_name: "Unknown".to_string(),
            has_external_output: false,
        }
    }
}

/// Components that can hold a lease on the hardware session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionClient {
    Recorder,
    Player,
    /// Direct callers of `SessionCoordinator::configure`.
    External,
}

/// Events republished by the coordinator for recorder, player and UI layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    InterruptionBegan,
    InterruptionEnded { should_resume: bool },
    RouteChanged {
        reason: RouteChangeReason,
        route_name: String,
        has_external_output: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("audio session configuration failed: {0}")]
    ConfigurationFailed(String),
    #[error("audio session activation failed: {0}")]
    ActivationFailed(String),
    #[error("audio session deactivation failed: {0}")]
    DeactivationFailed(String),
    #[error("microphone permission denied")]
    PermissionDenied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_a_union_of_capabilities() {
        use SessionMode::*;
        assert_eq!(Idle.merge(Idle), Idle);
        assert_eq!(Idle.merge(Recording), Recording);
        assert_eq!(Playback.merge(Idle), Playback);
        assert_eq!(Recording.merge(Playback), RecordingAndPlayback);
        assert_eq!(Playback.merge(Recording), RecordingAndPlayback);
        assert_eq!(RecordingAndPlayback.merge(Playback), RecordingAndPlayback);
        assert_eq!(Recording.merge(Recording), Recording);
    }

    #[test]
    fn default_state_is_inactive_idle() {
        let state = SessionState::default();
        assert!(!state.is_active);
        assert_eq!(state.mode, SessionMode::Idle);
    }
}
