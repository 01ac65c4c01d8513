//! Audio session coordination with a microphone recorder and a clip player.
//!
//! A [`SessionCoordinator`] owns the platform audio session and merges the
//! needs of its clients into one hardware mode. [`Recorder`] and [`Player`]
//! lease the session while they use it and observe interruptions and route
//! changes through it. Hardware is reached through the traits in [`hardware`],
//! implemented for ALSA and for a scriptable simulation.

pub mod audio;
pub mod config;
pub mod hardware;
pub mod player;
pub mod recorder;
pub mod session;

pub use config::AudioConfig;
pub use player::{PlaybackCompletion, PlaybackError, PlaybackSource, Player};
pub use recorder::{RecordingError, Recorder};
pub use session::{SessionCoordinator, SessionError, SessionMode};
