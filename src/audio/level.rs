//! Input metering.

use std::sync::atomic::{AtomicU32, Ordering};

/// RMS of a block of signed 16-bit samples, linear in `[0, 1]`.
pub fn rms_i16(block: &[i16]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f64 = block
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / block.len() as f64).sqrt() as f32
}

/// Map a linear RMS amplitude onto a `[0, 1]` meter with a dB floor.
///
/// Anything at or below `floor_db` reads 0, full scale reads 1.
pub fn normalize_level(rms: f32, floor_db: f32) -> f32 {
    if !rms.is_finite() || rms <= 0.0 || floor_db >= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    let level = (db - floor_db) / -floor_db;
    if level.is_nan() {
        return 0.0;
    }
    level.clamp(0.0, 1.0)
}

/// Lock-free holder for the latest block RMS, shared with the audio thread.
#[derive(Debug, Default)]
pub struct LevelMeter(AtomicU32);

impl LevelMeter {
    pub fn store(&self, rms: f32) {
        self.0.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}
