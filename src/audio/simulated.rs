//! Device-free implementation of the hardware seam.
//!
//! Capture synthesizes a tone into a real WAV file at real-time pace and
//! output advances a cursor by wall clock, so the whole stack runs on hosts
//! without a sound card. Every hardware outcome can be scripted.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::cursor::{ClipCursor, CursorStream};
use super::decoder::DecodedClip;
use super::level::rms_i16;
use super::record::CaptureThread;
use super::wav::RecordingWriter;
use crate::config::AudioConfig;
use crate::hardware::{
    AudioHardware, AudioRoute, CaptureEngine, CaptureEvent, CaptureRequest, CaptureStream,
    HardwareEvent, InterruptionPhase, OutputEngine, OutputEvent, OutputStream, PortKind,
    RecordPermission, RouteChangeReason, RoutePort, SessionConfiguration,
};

const EVENT_QUEUE: usize = 64;
const TICK: Duration = Duration::from_millis(10);
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.3;

struct Script {
    permission: RecordPermission,
    prompt_answer: bool,
    prompt_delay: Duration,

    fail_apply: bool,
    fail_activation: bool,
    fail_deactivation: bool,
    fail_capture_start: bool,
    fail_capture_after: Option<Duration>,
    fail_output_open: bool,
    fail_output_after: Option<Duration>,

    active: bool,
    applied: Vec<SessionConfiguration>,
    activations: usize,
    deactivations: usize,
    route: AudioRoute,
}

struct Inner {
    script: Mutex<Script>,
    events: mpsc::Sender<HardwareEvent>,
    prompts: AtomicUsize,
}

/// Scriptable stand-in for the platform audio stack.
#[derive(Clone)]
pub struct SimulatedAudioSystem {
    inner: Arc<Inner>,
}

impl SimulatedAudioSystem {
    /// Permission starts `Granted` and every operation succeeds until told otherwise.
    pub fn new(config: &AudioConfig) -> (Self, mpsc::Receiver<HardwareEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let route = AudioRoute {
            inputs: vec![RoutePort::new("Microphone", PortKind::BuiltInMic)],
            outputs: vec![RoutePort::new(
                config.simulated_route_name.clone(),
                PortKind::BuiltInSpeaker,
            )],
        };
        let script = Script {
            permission: RecordPermission::Granted,
            prompt_answer: true,
            prompt_delay: Duration::ZERO,
            fail_apply: false,
            fail_activation: false,
            fail_deactivation: false,
            fail_capture_start: false,
            fail_capture_after: None,
            fail_output_open: false,
            fail_output_after: None,
            active: false,
            applied: Vec::new(),
            activations: 0,
            deactivations: 0,
            route,
        };
        let system = Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script),
                events: tx,
                prompts: AtomicUsize::new(0),
            }),
        };
        (system, rx)
    }

    // ====== 权限 ======

    pub fn set_permission(&self, permission: RecordPermission) {
        self.inner.script.lock().permission = permission;
    }

    /// What the user answers to the next prompt, and how long they take.
    pub fn set_prompt_answer(&self, granted: bool, delay: Duration) {
        let mut script = self.inner.script.lock();
        script.prompt_answer = granted;
        script.prompt_delay = delay;
    }

    pub fn prompt_count(&self) -> usize {
        self.inner.prompts.load(Ordering::SeqCst)
    }

    // ====== 故障注入 ======

    pub fn fail_apply(&self, fail: bool) {
        self.inner.script.lock().fail_apply = fail;
    }

    pub fn fail_activation(&self, fail: bool) {
        self.inner.script.lock().fail_activation = fail;
    }

    pub fn fail_deactivation(&self, fail: bool) {
        self.inner.script.lock().fail_deactivation = fail;
    }

    pub fn fail_capture_start(&self, fail: bool) {
        self.inner.script.lock().fail_capture_start = fail;
    }

    /// Make captures started from now on die after running for `after`.
    pub fn fail_capture_after(&self, after: Option<Duration>) {
        self.inner.script.lock().fail_capture_after = after;
    }

    pub fn fail_output_open(&self, fail: bool) {
        self.inner.script.lock().fail_output_open = fail;
    }

    /// Make outputs opened from now on fail after playing for `after`.
    pub fn fail_output_after(&self, after: Option<Duration>) {
        self.inner.script.lock().fail_output_after = after;
    }

    // ====== 会话记录 ======

    pub fn is_active(&self) -> bool {
        self.inner.script.lock().active
    }

    pub fn activation_count(&self) -> usize {
        self.inner.script.lock().activations
    }

    pub fn deactivation_count(&self) -> usize {
        self.inner.script.lock().deactivations
    }

    /// Every configuration applied so far, oldest first.
    pub fn applied(&self) -> Vec<SessionConfiguration> {
        self.inner.script.lock().applied.clone()
    }

    // ====== 事件注入 ======

    pub fn emit(&self, event: HardwareEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            log::warn!("Dropped simulated hardware event: {}", e);
        }
    }

    pub fn set_route(&self, route: AudioRoute, reason: RouteChangeReason) {
        self.inner.script.lock().route = route;
        self.emit(HardwareEvent::RouteChanged(reason));
    }

    pub fn plug_headphones(&self, name: &str) {
        let mut route = self.current_route();
        route
            .outputs
            .insert(0, RoutePort::new(name, PortKind::Headphones));
        self.set_route(route, RouteChangeReason::NewDeviceAvailable);
    }

    pub fn unplug_headphones(&self) {
        let mut route = self.current_route();
        route.outputs.retain(|port| !port.kind.is_external_output());
        self.set_route(route, RouteChangeReason::OldDeviceUnavailable);
    }

    /// Another client takes the hardware; our session is deactivated underneath us.
    pub fn begin_interruption(&self) {
        self.inner.script.lock().active = false;
        self.emit(HardwareEvent::Interruption(InterruptionPhase::Began));
    }

    pub fn end_interruption(&self, should_resume: bool) {
        self.emit(HardwareEvent::Interruption(InterruptionPhase::Ended {
            should_resume,
        }));
    }
}

#[async_trait]
impl AudioHardware for SimulatedAudioSystem {
    async fn apply(&self, configuration: &SessionConfiguration) -> Result<()> {
        let mut script = self.inner.script.lock();
        if script.fail_apply {
            bail!("simulated hardware rejected category {:?}", configuration.category);
        }
        script.applied.push(configuration.clone());
        Ok(())
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        let mut script = self.inner.script.lock();
        if active {
            if script.fail_activation {
                bail!("simulated hardware is busy");
            }
            script.activations += 1;
        } else {
            if script.fail_deactivation {
                bail!("simulated hardware refused to release the session");
            }
            script.deactivations += 1;
        }
        script.active = active;
        Ok(())
    }

    fn current_route(&self) -> AudioRoute {
        self.inner.script.lock().route.clone()
    }

    fn record_permission(&self) -> RecordPermission {
        self.inner.script.lock().permission
    }

    async fn request_record_permission(&self) -> bool {
        self.inner.prompts.fetch_add(1, Ordering::SeqCst);
        let (answer, delay) = {
            let script = self.inner.script.lock();
            (script.prompt_answer, script.prompt_delay)
        };
        tokio::time::sleep(delay).await;

        let mut script = self.inner.script.lock();
        script.permission = if answer {
            RecordPermission::Granted
        } else {
            RecordPermission::Denied
        };
        answer
    }
}

// ======================== Capture ========================

impl CaptureEngine for SimulatedAudioSystem {
    fn start(
        &self,
        request: &CaptureRequest,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureStream>> {
        let fail_after = {
            let script = self.inner.script.lock();
            if script.fail_capture_start {
                bail!("simulated capture device unavailable");
            }
            script.fail_capture_after
        };

        let writer = RecordingWriter::create(request)?;
        let sample_rate = request.sample_rate;
        let channels = request.channels.max(1) as usize;

        let capture = CaptureThread::spawn("sim-record", events, move |control| {
            let mut writer = writer;
            let started = Instant::now();
            let mut frames_due: u64 = 0;
            let mut phase: f32 = 0.0;
            let step = TAU * TONE_HZ / sample_rate as f32;

            let result = (|| -> Result<()> {
                while control.is_running() {
                    thread::sleep(TICK);
                    if fail_after.is_some_and(|after| started.elapsed() >= after) {
                        return Err(anyhow!("simulated capture device failure"));
                    }

                    let target = (started.elapsed().as_secs_f64() * sample_rate as f64) as u64;
                    let frames = (target - frames_due) as usize;
                    frames_due = target;
                    if control.is_paused() || frames == 0 {
                        continue;
                    }

                    let mut block = Vec::with_capacity(frames * channels);
                    for _ in 0..frames {
                        let sample = (phase.sin() * TONE_AMPLITUDE * i16::MAX as f32) as i16;
                        phase = (phase + step) % TAU;
                        block.extend(std::iter::repeat_n(sample, channels));
                    }
                    control.set_level(rms_i16(&block));
                    writer.write_block(&block)?;
                }
                Ok(())
            })();

            let finalized = writer.finalize();
            result.and(finalized)
        })?;
        Ok(Box::new(capture))
    }
}

// ======================== Output ========================

impl OutputEngine for SimulatedAudioSystem {
    fn open(
        &self,
        clip: Arc<DecodedClip>,
        rate: f32,
        events: mpsc::Sender<OutputEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let fail_after = {
            let script = self.inner.script.lock();
            if script.fail_output_open {
                bail!("simulated output device unavailable");
            }
            script.fail_output_after
        };

        let cursor = Arc::new(Mutex::new(ClipCursor::new(clip, rate)));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let cursor = cursor.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("sim-play".into())
                .spawn(move || output_clock(&cursor, &running, fail_after, &events))
                .context("Failed to spawn simulated output thread")?
        };

        Ok(Box::new(CursorStream::new(cursor, running, handle)))
    }
}

fn output_clock(
    cursor: &Mutex<ClipCursor>,
    running: &AtomicBool,
    fail_after: Option<Duration>,
    events: &mpsc::Sender<OutputEvent>,
) {
    let mut last = Instant::now();
    let mut played = Duration::ZERO;

    while running.load(Ordering::Relaxed) {
        thread::sleep(TICK);
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let (was_playing, finished) = {
            let mut cursor = cursor.lock();
            let was_playing = cursor.is_playing();
            (was_playing, cursor.advance(elapsed))
        };

        if was_playing {
            played += elapsed;
            if fail_after.is_some_and(|after| played >= after) {
                let _ = events.blocking_send(OutputEvent::Failed(
                    "simulated output device failure".to_string(),
                ));
                return;
            }
        }

        if finished && events.blocking_send(OutputEvent::Finished).is_err() {
            return;
        }
    }
}
