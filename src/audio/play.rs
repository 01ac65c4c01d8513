use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::alsa_device;
use super::cursor::{ClipCursor, CursorStream};
use super::decoder::DecodedClip;
use crate::hardware::OutputEvent;

/// Consecutive write failures tolerated before a period is dropped.
const MAX_RECOVERY_RETRIES: u32 = 3;
/// How long the output thread sleeps while the cursor is paused.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Open the playback device for `clip` and start the output thread. The
/// cursor starts paused.
pub(super) fn open(
    device: &str,
    clip: Arc<DecodedClip>,
    rate: f32,
    events: mpsc::Sender<OutputEvent>,
) -> Result<CursorStream> {
    let (pcm, params) = alsa_device::open_playback(
        device,
        clip.sample_rate,
        clip.channels as u32,
        None,
    )?;

    let cursor = Arc::new(Mutex::new(ClipCursor::new(clip, rate)));
    let running = Arc::new(AtomicBool::new(true));

    let handle = {
        let cursor = cursor.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                if let Err(e) = play_thread(pcm, params, &cursor, &running, &events) {
                    log::error!("Playback thread error: {:#}", e);
                    let _ = events.blocking_send(OutputEvent::Failed(format!("{:#}", e)));
                }
            })
            .context("Failed to spawn playback thread")?
    };

    Ok(CursorStream::new(cursor, running, handle))
}

fn play_thread(
    pcm: alsa::pcm::PCM,
    params: alsa_device::AlsaParams,
    cursor: &Mutex<ClipCursor>,
    running: &AtomicBool,
    events: &mpsc::Sender<OutputEvent>,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let mut pcm_data = vec![0i16; params.period_size.max(1) * channels];
    let io = pcm.io_i16()?;

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        let (total_frames, finished) = {
            let mut cursor = cursor.lock();
            if !cursor.is_playing() {
                (0, false)
            } else {
                let frames =
                    cursor.fill_i16(&mut pcm_data, params.channels as u16, params.sample_rate);
                (frames, cursor.is_finished())
            }
        };

        if total_frames == 0 && !finished {
            thread::sleep(IDLE_WAIT);
            continue;
        }

        // Short writes and XRUNs are retried without losing frames, up to the
        // circuit breaker.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm_data[offset..total_frames * channels]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    pcm.prepare()
                        .with_context(|| format!("Failed to recover PCM playback after: {}", e))?;

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }

        if finished {
            if let Err(e) = pcm.drain() {
                log::warn!("Failed to drain playback device: {}", e);
            }
            log::info!("Playback reached end of clip");
            if events.blocking_send(OutputEvent::Finished).is_err() {
                break;
            }
            // Drain leaves the device stopped; ready it for a seek-and-replay.
            pcm.prepare().context("Failed to re-prepare PCM playback")?;
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
