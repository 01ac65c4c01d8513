//! Shared playback cursor over a decoded clip.
//!
//! The output thread pulls frames from the cursor while the player actor reads
//! the position and issues transport commands; both sides go through the same
//! `parking_lot::Mutex`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::decoder::DecodedClip;
use crate::hardware::OutputStream;

#[derive(Debug)]
pub struct ClipCursor {
    clip: Arc<DecodedClip>,
    /// Fractional source frame.
    frame: f64,
    rate: f32,
    playing: bool,
    finished: bool,
}

impl ClipCursor {
    pub fn new(clip: Arc<DecodedClip>, rate: f32) -> Self {
        Self {
            clip,
            frame: 0.0,
            rate,
            playing: false,
            finished: false,
        }
    }

    fn total_frames(&self) -> f64 {
        self.clip.frames() as f64
    }

    pub fn duration(&self) -> f64 {
        self.clip.duration()
    }

    pub fn position(&self) -> f64 {
        if self.clip.sample_rate == 0 {
            return 0.0;
        }
        (self.frame / self.clip.sample_rate as f64).clamp(0.0, self.duration())
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn play(&mut self) {
        if !self.finished {
            self.playing = true;
        }
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    /// Halt and rewind.
    pub fn stop(&mut self) {
        self.playing = false;
        self.frame = 0.0;
        self.finished = false;
    }

    pub fn seek(&mut self, seconds: f64) {
        let seconds = if seconds.is_finite() { seconds } else { 0.0 };
        let seconds = seconds.clamp(0.0, self.duration());
        self.frame = seconds * self.clip.sample_rate as f64;
        self.finished = false;
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
    }

    fn mark_finished(&mut self) -> bool {
        self.frame = self.total_frames();
        self.playing = false;
        let first = !self.finished;
        self.finished = true;
        first
    }

    /// Move forward by wall-clock time. Returns `true` the first time the end
    /// of the clip is reached.
    pub fn advance(&mut self, elapsed: Duration) -> bool {
        if !self.playing {
            return false;
        }
        self.frame += elapsed.as_secs_f64() * self.clip.sample_rate as f64 * self.rate as f64;
        if self.frame >= self.total_frames() {
            return self.mark_finished();
        }
        false
    }

    /// Render interleaved S16 frames for a device running at `out_rate` with
    /// `out_channels`. Returns the number of frames written; fewer than
    /// requested means the clip ended (or the cursor is paused).
    pub fn fill_i16(&mut self, out: &mut [i16], out_channels: u16, out_rate: u32) -> usize {
        let out_channels = out_channels.max(1) as usize;
        let src_channels = self.clip.channels.max(1) as usize;
        let capacity = out.len() / out_channels;
        if !self.playing || out_rate == 0 {
            return 0;
        }

        let step = self.clip.sample_rate as f64 * self.rate as f64 / out_rate as f64;
        let total = self.clip.frames();
        let mut written = 0;

        while written < capacity {
            let index = self.frame as usize;
            if index >= total {
                self.mark_finished();
                break;
            }
            let src = &self.clip.samples[index * src_channels..(index + 1) * src_channels];
            let dst = &mut out[written * out_channels..(written + 1) * out_channels];
            if out_channels == 1 && src_channels > 1 {
                let mixed = src.iter().sum::<f32>() / src_channels as f32;
                dst[0] = to_i16(mixed);
            } else {
                for (ch, sample) in dst.iter_mut().enumerate() {
                    *sample = to_i16(src[ch % src_channels]);
                }
            }
            self.frame += step;
            written += 1;
        }
        written
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Upper bound on waiting for the device thread to release its PCM handle.
const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);

/// [`OutputStream`] backed by a cursor and a device thread that consumes it.
pub(crate) struct CursorStream {
    cursor: Arc<Mutex<ClipCursor>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CursorStream {
    pub(crate) fn new(
        cursor: Arc<Mutex<ClipCursor>>,
        running: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            cursor,
            running,
            handle: Some(handle),
        }
    }

    /// Signal the device thread and join it so the next `open` finds the
    /// device free. A thread stuck past `SHUTDOWN_WAIT` is left detached.
    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("Output thread did not stop within {:?}", SHUTDOWN_WAIT);
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        if handle.join().is_err() {
            log::error!("Output thread panicked");
        }
    }
}

impl OutputStream for CursorStream {
    fn play(&mut self) {
        self.cursor.lock().play();
    }

    fn pause(&mut self) {
        self.cursor.lock().pause();
    }

    fn seek(&mut self, seconds: f64) {
        self.cursor.lock().seek(seconds);
    }

    fn set_rate(&mut self, rate: f32) {
        self.cursor.lock().set_rate(rate);
    }

    fn position(&self) -> f64 {
        self.cursor.lock().position()
    }

    fn stop(&mut self) {
        self.cursor.lock().stop();
        self.shutdown();
    }
}

impl Drop for CursorStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
