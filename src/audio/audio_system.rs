//! ALSA implementation of the hardware seam.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O and for the
//! sound card watcher, so device calls never stall the async runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use alsa::Direction;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::alsa_device::{self, CardInfo};
use super::decoder::DecodedClip;
use super::play;
use super::record::{CaptureThread, alsa_capture_loop};
use super::wav::RecordingWriter;
use crate::config::AudioConfig;
use crate::hardware::{
    AudioHardware, AudioRoute, CaptureEngine, CaptureEvent, CaptureRequest, CaptureStream,
    HardwareEvent, OutputEngine, OutputEvent, OutputStream, RecordPermission, RouteChangeReason,
    SessionConfiguration,
};

const EVENT_QUEUE: usize = 16;

#[derive(Debug, Default)]
struct SessionBookkeeping {
    active: bool,
    configuration: Option<SessionConfiguration>,
    capture_verified: bool,
    playback_verified: bool,
}

/// Linux audio hardware driven through ALSA.
///
/// Linux has no per-application microphone prompt: permission resolves to
/// `Granted` unless the capture device refuses access (`EACCES`/`EPERM`).
/// Route changes come from a watcher thread that polls the sound card list.
/// ALSA has no interruption concept, so none are ever raised.
pub struct AlsaAudioSystem {
    config: AudioConfig,
    session: Mutex<SessionBookkeeping>,
    permission: Mutex<RecordPermission>,
    route: Arc<Mutex<AudioRoute>>,
    watcher_running: Arc<AtomicBool>,
}

impl AlsaAudioSystem {
    /// Enumerate devices and start the route watcher.
    pub fn start(config: &AudioConfig) -> Result<(Arc<Self>, mpsc::Receiver<HardwareEvent>)> {
        let cards = alsa_device::list_cards();
        let route = Arc::new(Mutex::new(alsa_device::route_from_cards(&cards)));
        let watcher_running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);

        log::info!(
            "AlsaAudioSystem starting: capture=\"{}\", playback=\"{}\", rate={}Hz, ch={}, cards={}",
            config.capture_device,
            config.playback_device,
            config.sample_rate,
            config.channels,
            cards.len(),
        );

        {
            let route = route.clone();
            let running = watcher_running.clone();
            let interval = config.route_poll_interval();
            thread::Builder::new()
                .name("audio-route".into())
                .spawn(move || route_watcher(cards, route, running, interval, tx))
                .context("Failed to spawn route watcher thread")?;
        }

        let system = Arc::new(Self {
            config: config.clone(),
            session: Mutex::new(SessionBookkeeping::default()),
            permission: Mutex::new(RecordPermission::Undetermined),
            route,
            watcher_running,
        });
        Ok((system, rx))
    }

    /// Sound cards currently known to the kernel.
    pub fn devices() -> Vec<CardInfo> {
        alsa_device::list_cards()
    }

    fn capture_period(&self) -> Option<usize> {
        let session = self.session.lock();
        let buffer = session
            .configuration
            .as_ref()
            .and_then(|c| c.preferred_io_buffer_duration)?;
        let frames = self.config.sample_rate as u128 * buffer.as_micros() / 1_000_000;
        Some((frames as usize).max(32))
    }

    async fn probe_capture(&self) -> Result<()> {
        let result = probe_blocking(self.config.capture_device.clone(), Direction::Capture).await;
        match &result {
            Ok(()) => self.note_permission(RecordPermission::Granted),
            Err(e) if alsa_device::is_access_denied(e) => {
                self.note_permission(RecordPermission::Denied)
            }
            Err(_) => {}
        }
        result
    }

    fn note_permission(&self, answer: RecordPermission) {
        let mut permission = self.permission.lock();
        if *permission != answer {
            log::info!("Microphone access: {:?}", answer);
            *permission = answer;
        }
    }
}

impl Drop for AlsaAudioSystem {
    fn drop(&mut self) {
        self.watcher_running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioHardware for AlsaAudioSystem {
    async fn apply(&self, configuration: &SessionConfiguration) -> Result<()> {
        let (need_capture, need_playback) = {
            let session = self.session.lock();
            (
                configuration.captures() && !session.capture_verified,
                configuration.plays() && !session.playback_verified,
            )
        };

        // Our own streams may already hold the device, so each direction is
        // only probed the first time it's needed during an activation.
        if need_capture {
            self.probe_capture().await?;
        }
        if need_playback {
            probe_blocking(self.config.playback_device.clone(), Direction::Playback).await?;
        }

        let mut session = self.session.lock();
        session.capture_verified |= need_capture;
        session.playback_verified |= need_playback;
        session.configuration = Some(configuration.clone());
        log::debug!("ALSA session configured: {:?}", configuration);
        Ok(())
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        let mut session = self.session.lock();
        if session.active == active {
            return Ok(());
        }
        session.active = active;
        log::debug!("ALSA session active={}", active);
        if !active {
            session.capture_verified = false;
            session.playback_verified = false;
            session.configuration = None;
        }
        Ok(())
    }

    fn current_route(&self) -> AudioRoute {
        self.route.lock().clone()
    }

    fn record_permission(&self) -> RecordPermission {
        *self.permission.lock()
    }

    async fn request_record_permission(&self) -> bool {
        self.probe_capture().await.is_ok()
    }
}

impl CaptureEngine for AlsaAudioSystem {
    fn start(
        &self,
        request: &CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureStream>> {
        let opened = alsa_device::open_capture(
            &self.config.capture_device,
            request.sample_rate,
            request.channels as u32,
            self.capture_period(),
        );
        let (pcm, params) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if alsa_device::is_access_denied(&e) {
                    self.note_permission(RecordPermission::Denied);
                }
                return Err(e);
            }
        };

        // Record what the device actually delivers.
        let negotiated = CaptureRequest {
            sample_rate: params.sample_rate,
            channels: params.channels as u16,
            ..request.clone()
        };
        let writer = RecordingWriter::create(&negotiated)?;

        let capture = CaptureThread::spawn("audio-record", events, move |control| {
            alsa_capture_loop(pcm, params, writer, control)
        })?;
        Ok(Box::new(capture))
    }
}

impl OutputEngine for AlsaAudioSystem {
    fn open(
        &self,
        clip: Arc<DecodedClip>,
        rate: f32,
        events: mpsc::Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let stream = play::open(&self.config.playback_device, clip, rate, events)?;
        Ok(Box::new(stream))
    }
}

async fn probe_blocking(device: String, direction: Direction) -> Result<()> {
    tokio::task::spawn_blocking(move || alsa_device::probe(&device, direction))
        .await
        .context("Device probe task failed")?
}

// ======================== Route watcher ========================

fn route_watcher(
    mut known: Vec<CardInfo>,
    route: Arc<Mutex<AudioRoute>>,
    running: Arc<AtomicBool>,
    interval: Duration,
    tx: mpsc::Sender<HardwareEvent>,
) {
    while running.load(Ordering::Relaxed) && !tx.is_closed() {
        thread::sleep(interval);

        let cards = alsa_device::list_cards();
        let Some(reason) = diff_cards(&known, &cards) else {
            continue;
        };

        *route.lock() = alsa_device::route_from_cards(&cards);
        known = cards;
        log::debug!("Sound card set changed: {:?}", reason);
        if tx.blocking_send(HardwareEvent::RouteChanged(reason)).is_err() {
            break;
        }
    }
    log::debug!("Route watcher stopped");
}

/// Classify a change in the card list. Removal wins over addition: losing the
/// active output is what listeners must react to.
fn diff_cards(before: &[CardInfo], after: &[CardInfo]) -> Option<RouteChangeReason> {
    let removed = before.iter().any(|card| !after.contains(card));
    let added = after.iter().any(|card| !before.contains(card));
    if removed {
        Some(RouteChangeReason::OldDeviceUnavailable)
    } else if added {
        Some(RouteChangeReason::NewDeviceAvailable)
    } else {
        None
    }
}
