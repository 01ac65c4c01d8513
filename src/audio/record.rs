//! Capture threads: a device (or generator) loop writing WAV on a dedicated
//! OS thread, controlled through atomics from the recorder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;

use super::alsa_device::AlsaParams;
use super::level::{LevelMeter, rms_i16};
use super::wav::RecordingWriter;
use crate::hardware::{CaptureEvent, CaptureStream};

/// Consecutive device errors tolerated before the capture is declared dead.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// Flags shared between a capture thread and its [`CaptureThread`] handle.
#[derive(Clone, Default)]
pub(crate) struct CaptureControl {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    meter: Arc<LevelMeter>,
}

impl CaptureControl {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub(crate) fn set_level(&self, rms: f32) {
        self.meter.store(rms);
    }
}

/// Handle to a running capture thread.
pub(crate) struct CaptureThread {
    control: CaptureControl,
    handle: Option<JoinHandle<Result<()>>>,
}

impl CaptureThread {
    /// Run `body` on a named thread. An error returned while the capture was
    /// still wanted is reported once as [`CaptureEvent::Failed`].
    pub(crate) fn spawn<F>(name: &str, events: mpsc::Sender<CaptureEvent>, body: F) -> Result<Self>
    where
        F: FnOnce(&CaptureControl) -> Result<()> + Send + 'static,
    {
        let control = CaptureControl::default();
        control.running.store(true, Ordering::SeqCst);

        let handle = {
            let control = control.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    let result = body(&control);
                    if let Err(e) = &result {
                        if control.is_running() {
                            log::error!("Capture thread error: {:#}", e);
                            let _ = events.blocking_send(CaptureEvent::Failed(format!("{:#}", e)));
                        }
                    }
                    control.set_level(0.0);
                    result
                })
                .context("Failed to spawn capture thread")?
        };

        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    fn join(&mut self) -> Result<()> {
        self.control.running.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Capture thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl CaptureStream for CaptureThread {
    fn pause(&mut self) {
        self.control.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.control.paused.store(false, Ordering::SeqCst);
    }

    fn level(&self) -> f32 {
        if self.control.is_paused() {
            return 0.0;
        }
        self.control.meter.load()
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.join()
    }

    fn abort(mut self: Box<Self>) {
        if let Err(e) = self.join() {
            log::debug!("Aborted capture ended with: {:#}", e);
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
    }
}

// ======================== ALSA capture loop ========================

/// Read periods from `pcm` into `writer` until stopped. The file is finalized
/// on every exit path.
pub(super) fn alsa_capture_loop(
    pcm: PCM,
    params: AlsaParams,
    mut writer: RecordingWriter,
    control: &CaptureControl,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let mut read_buf = vec![0i16; params.period_size.max(1) * channels];

    log::info!(
        "Recording started: file={}, rate={}, ch={}, period={}",
        writer.path().display(),
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    let result = (|| -> Result<()> {
        let io = pcm.io_i16()?;
        let mut retry_count = 0u32;

        while control.is_running() {
            match io.readi(&mut read_buf) {
                Ok(frames) => {
                    retry_count = 0;
                    let block = &read_buf[..frames * channels];
                    if control.is_paused() {
                        // Keep draining the device so it doesn't overrun.
                        continue;
                    }
                    control.set_level(rms_i16(block));
                    writer.write_block(block)?;
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    retry_count += 1;

                    pcm.prepare()
                        .with_context(|| format!("Failed to recover PCM capture after: {}", e))?;

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        return Err(anyhow!(
                            "Capture device failed {} times in a row: {}",
                            retry_count,
                            e
                        ));
                    }
                }
            }
        }
        Ok(())
    })();

    let frames = writer.frames();
    let finalized = writer.finalize();
    log::info!("Recording stopped after {} frames", frames);
    result.and(finalized)
}
