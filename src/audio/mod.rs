//! audio - Platform backends, decoding, metering and WAV output.
//!
//! Uses ALSA for device I/O, Symphonia for decoding and hound for writing
//! recordings. `SimulatedAudioSystem` provides the same surface without a
//! sound card.

mod alsa_device;
mod audio_system;
mod cursor;
mod decoder;
mod level;
mod play;
mod record;
mod simulated;
mod wav;

pub use alsa_device::CardInfo;
pub use audio_system::AlsaAudioSystem;
pub use cursor::ClipCursor;
pub use decoder::{DecodedClip, decode};
pub use level::{normalize_level, rms_i16};
pub use simulated::SimulatedAudioSystem;
