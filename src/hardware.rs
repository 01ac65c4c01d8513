//! Platform seam for the audio hardware.
//!
//! The coordinator, recorder and player never talk to a sound API directly;
//! they consume these traits. `audio::AlsaAudioSystem` implements them on Linux
//! and `audio::SimulatedAudioSystem` implements them without any device.
//!
//! Implementations deliver asynchronous notifications (interruptions, route
//! changes, capture failures, end of playback) as messages on channels handed
//! to them by the owning component. They must never call back into component
//! state directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::audio::DecodedClip;
use crate::config::AudioConfig;
use crate::session::SessionMode;

// ======================== Session configuration ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionCategory {
    /// Non-exclusive output, mixes with other applications.
    Ambient,
    Record,
    Playback,
    PlayAndRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CategoryOptions {
    pub default_to_speaker: bool,
    pub allow_bluetooth: bool,
    pub mix_with_others: bool,
}

/// A named hardware configuration derived from a [`SessionMode`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfiguration {
    pub mode: SessionMode,
    pub category: SessionCategory,
    pub options: CategoryOptions,
    pub preferred_sample_rate: u32,
    /// Only set when the mode captures audio.
    pub preferred_io_buffer_duration: Option<Duration>,
    pub preferred_input: Option<PortKind>,
}

impl SessionConfiguration {
    pub fn for_mode(mode: SessionMode, config: &AudioConfig) -> Self {
        let (category, options) = match mode {
            SessionMode::Idle => (
                SessionCategory::Ambient,
                CategoryOptions {
                    mix_with_others: true,
                    ..Default::default()
                },
            ),
            SessionMode::Recording => (SessionCategory::Record, CategoryOptions::default()),
            SessionMode::Playback => (SessionCategory::Playback, CategoryOptions::default()),
            SessionMode::RecordingAndPlayback => (
                SessionCategory::PlayAndRecord,
                CategoryOptions {
                    default_to_speaker: true,
                    allow_bluetooth: true,
                    mix_with_others: false,
                },
            ),
        };

        let records = mode.includes_recording();
        Self {
            mode,
            category,
            options,
            preferred_sample_rate: config.sample_rate,
            preferred_io_buffer_duration: records
                .then(|| Duration::from_millis(config.io_buffer_duration_ms as u64)),
            preferred_input: records.then_some(PortKind::BuiltInMic),
        }
    }

    pub fn captures(&self) -> bool {
        matches!(
            self.category,
            SessionCategory::Record | SessionCategory::PlayAndRecord
        )
    }

    pub fn plays(&self) -> bool {
        !matches!(self.category, SessionCategory::Record)
    }
}

// ======================== Routes ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortKind {
    BuiltInMic,
    BuiltInSpeaker,
    BuiltInReceiver,
    HeadsetMic,
    Headphones,
    BluetoothA2dp,
    BluetoothHfp,
    BluetoothLe,
    Usb,
    LineOut,
    Hdmi,
    Other,
}

impl PortKind {
    /// Headphone-class outputs: audio is private to the listener.
    pub fn is_external_output(self) -> bool {
        matches!(
            self,
            PortKind::Headphones
                | PortKind::BluetoothA2dp
                | PortKind::BluetoothHfp
                | PortKind::BluetoothLe
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutePort {
    pub name: String,
    pub kind: PortKind,
}

impl RoutePort {
    pub fn new(name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AudioRoute {
    pub inputs: Vec<RoutePort>,
    pub outputs: Vec<RoutePort>,
}

impl AudioRoute {
    pub fn name(&self) -> String {
        self.outputs
            .first()
            .map(|port| port.name.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn has_external_output(&self) -> bool {
        self.outputs.iter().any(|port| port.kind.is_external_output())
    }
}

// ======================== Permission & events ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordPermission {
    Undetermined,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterruptionPhase {
    Began,
    Ended { should_resume: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteChangeReason {
    NewDeviceAvailable,
    OldDeviceUnavailable,
    CategoryChange,
    Override,
    WakeFromSleep,
    NoSuitableRouteForCategory,
    RouteConfigurationChange,
    Unknown,
}

/// Notifications raised by the platform on its own threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEvent {
    Interruption(InterruptionPhase),
    RouteChanged(RouteChangeReason),
}

/// Session-level primitives of the platform audio stack.
#[async_trait]
pub trait AudioHardware: Send + Sync {
    /// Apply category, options and preferences. Does not activate.
    async fn apply(&self, configuration: &SessionConfiguration) -> Result<()>;

    /// Engage or release the hardware. Releasing notifies other
    /// applications that they may resume.
    async fn set_active(&self, active: bool) -> Result<()>;

    fn current_route(&self) -> AudioRoute;

    fn record_permission(&self) -> RecordPermission;

    /// Show the system prompt and wait for the answer.
    async fn request_record_permission(&self) -> bool;
}

// ======================== Capture ========================

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl CaptureRequest {
    pub fn new(path: PathBuf, config: &AudioConfig) -> Self {
        Self {
            path,
            sample_rate: config.sample_rate,
            channels: config.channels,
            bits_per_sample: config.bits_per_sample,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Unrecoverable engine error. The file written so far is finalized.
    Failed(String),
}

pub trait CaptureEngine: Send + Sync {
    /// Start writing microphone input to `request.path`.
    fn start(
        &self,
        request: &CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureStream>>;
}

pub trait CaptureStream: Send {
    fn pause(&mut self);
    fn resume(&mut self);
    /// RMS amplitude of the latest captured block, linear scale.
    fn level(&self) -> f32;
    /// Stop capturing and finalize the file. Blocks until the capture thread exits.
    fn finish(self: Box<Self>) -> Result<()>;
    /// Stop capturing without reporting finalization errors.
    fn abort(self: Box<Self>);
}

// ======================== Output ========================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// The cursor reached the end of the clip.
    Finished,
    Failed(String),
}

pub trait OutputEngine: Send + Sync {
    /// Prepare `clip` for playback. The returned stream starts paused.
    fn open(
        &self,
        clip: Arc<DecodedClip>,
        rate: f32,
        events: mpsc::Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>>;
}

pub trait OutputStream: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, seconds: f64);
    fn set_rate(&mut self, rate: f32);
    fn position(&self) -> f64;
    fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_modes_request_low_latency_input() {
        let config = AudioConfig::default();
        let recording = SessionConfiguration::for_mode(SessionMode::Recording, &config);
        assert_eq!(recording.category, SessionCategory::Record);
        assert_eq!(
            recording.preferred_io_buffer_duration,
            Some(Duration::from_millis(config.io_buffer_duration_ms as u64))
        );
        assert_eq!(recording.preferred_input, Some(PortKind::BuiltInMic));
        assert!(recording.captures());
        assert!(!recording.plays());

        let playback = SessionConfiguration::for_mode(SessionMode::Playback, &config);
        assert_eq!(playback.preferred_io_buffer_duration, None);
        assert!(playback.plays());
        assert!(!playback.captures());

        let duplex = SessionConfiguration::for_mode(SessionMode::RecordingAndPlayback, &config);
        assert_eq!(duplex.category, SessionCategory::PlayAndRecord);
        assert!(duplex.options.default_to_speaker);
        assert!(duplex.options.allow_bluetooth);
        assert!(duplex.captures() && duplex.plays());
    }

    #[test]
    fn route_reports_headphone_class_outputs() {
        let speaker = AudioRoute {
            inputs: vec![RoutePort::new("Microphone", PortKind::BuiltInMic)],
            outputs: vec![RoutePort::new("Speaker", PortKind::BuiltInSpeaker)],
        };
        assert_eq!(speaker.name(), "Speaker");
        assert!(!speaker.has_external_output());

        let buds = AudioRoute {
            inputs: vec![],
            outputs: vec![RoutePort::new("Buds", PortKind::BluetoothA2dp)],
        };
        assert!(buds.has_external_output());

        let hdmi = AudioRoute {
            inputs: vec![],
            outputs: vec![RoutePort::new("TV", PortKind::Hdmi)],
        };
        assert!(!hdmi.has_external_output());
        assert_eq!(AudioRoute::default().name(), "Unknown");
    }
}
