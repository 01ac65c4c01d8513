use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};

use super::state::{ElapsedClock, RecordingError, RecordingSnapshot, RecordingState};
use super::store::RecordingStore;
use crate::audio::normalize_level;
use crate::config::AudioConfig;
use crate::hardware::{CaptureEngine, CaptureEvent, CaptureRequest, CaptureStream};
use crate::session::{SessionClient, SessionCoordinator, SessionEvent, SessionMode};

const CAPTURE_EVENT_QUEUE: usize = 4;

pub(super) enum RecorderCommand {
    Start {
        reply: oneshot::Sender<Result<(), RecordingError>>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<Result<PathBuf, RecordingError>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// The capture in progress. Dropping it stops level sampling.
struct ActiveCapture {
    stream: Box<dyn CaptureStream>,
    path: PathBuf,
    events: mpsc::Receiver<CaptureEvent>,
    /// Present only while Recording.
    ticker: Option<Interval>,
}

enum Activity {
    Tick,
    Capture(CaptureEvent),
}

pub(super) struct RecorderActor {
    config: AudioConfig,
    session: SessionCoordinator,
    engine: Arc<dyn CaptureEngine>,
    store: RecordingStore,
    commands: mpsc::Receiver<RecorderCommand>,
    session_events: broadcast::Receiver<SessionEvent>,
    snapshot: watch::Sender<RecordingSnapshot>,
    clock: Arc<Mutex<ElapsedClock>>,
    active: Option<ActiveCapture>,
    leased: bool,
    /// Paused by an interruption rather than by the caller.
    interrupted: bool,
}

impl RecorderActor {
    pub(super) fn new(
        config: &AudioConfig,
        session: SessionCoordinator,
        engine: Arc<dyn CaptureEngine>,
        store: RecordingStore,
        commands: mpsc::Receiver<RecorderCommand>,
        snapshot: watch::Sender<RecordingSnapshot>,
        clock: Arc<Mutex<ElapsedClock>>,
    ) -> Self {
        Self {
            config: config.clone(),
            session_events: session.subscribe(),
            session,
            engine,
            store,
            commands,
            snapshot,
            clock,
            active: None,
            leased: false,
            interrupted: false,
        }
    }

    pub(super) async fn run(mut self) {
        let mut session_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                activity = next_activity(&mut self.active) => self.handle_activity(activity).await,
                event = self.session_events.recv(), if session_open => match event {
                    Ok(event) => self.handle_session_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Recorder missed {} session events", skipped);
                    }
                    Err(RecvError::Closed) => session_open = false,
                },
            }
        }

        // Handle dropped: don't leave a capture thread writing forever.
        if self.active.is_some() {
            self.cancel().await;
        }
        log::debug!("Recorder stopped");
    }

    fn state(&self) -> RecordingState {
        self.snapshot.borrow().state.clone()
    }

    async fn handle_command(&mut self, command: RecorderCommand) {
        match command {
            RecorderCommand::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            RecorderCommand::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            RecorderCommand::Resume { reply } => {
                self.resume().await;
                let _ = reply.send(());
            }
            RecorderCommand::Stop { reply } => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            RecorderCommand::Cancel { reply } => {
                let state = self.state();
                if state.is_capturing() {
                    self.cancel().await;
                } else {
                    log::warn!("cancel_recording ignored in state {:?}", state);
                }
                let _ = reply.send(());
            }
            RecorderCommand::Reset { reply } => {
                self.reset().await;
                let _ = reply.send(());
            }
        }
    }

    // ====== 状态迁移 ======

    async fn start(&mut self) -> Result<(), RecordingError> {
        let state = self.state();
        if !matches!(state, RecordingState::Idle | RecordingState::Stopped) {
            return Err(RecordingError::InvalidState(state));
        }
        if !self.session.has_microphone_permission() {
            return Err(RecordingError::PermissionDenied);
        }

        self.session
            .configure_for(SessionClient::Recorder, SessionMode::Recording)
            .await?;
        self.leased = true;

        if let Err(e) = self.store.ensure_dir() {
            self.release().await;
            return Err(RecordingError::Io(e));
        }

        let path = self.store.allocate_path();
        let request = CaptureRequest::new(path.clone(), &self.config);
        let (events_tx, events_rx) = mpsc::channel(CAPTURE_EVENT_QUEUE);
        let engine = self.engine.clone();
        let started = tokio::task::spawn_blocking(move || engine.start(&request, events_tx)).await;

        let stream = match started {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.abandon_start(&path, format!("{:#}", e)).await),
            Err(e) => return Err(self.abandon_start(&path, e.to_string()).await),
        };

        self.clock.lock().start();
        self.interrupted = false;
        self.active = Some(ActiveCapture {
            stream,
            path: path.clone(),
            events: events_rx,
            ticker: Some(self.level_ticker()),
        });
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = RecordingState::Recording;
            snapshot.elapsed_seconds = 0.0;
            snapshot.level = 0.0;
            snapshot.file_path = Some(path.clone());
        });
        log::info!("Recording started: {}", path.display());
        Ok(())
    }

    async fn abandon_start(&mut self, path: &Path, reason: String) -> RecordingError {
        log::error!("Capture engine failed to start: {}", reason);
        if let Err(e) = RecordingStore::delete(path) {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
        self.release().await;
        RecordingError::RecordingFailed(reason)
    }

    fn pause(&mut self) {
        let state = self.state();
        let Some(active) = self.active.as_mut().filter(|_| state == RecordingState::Recording)
        else {
            log::warn!("pause_recording ignored in state {:?}", state);
            return;
        };

        active.stream.pause();
        active.ticker = None;
        let elapsed = {
            let mut clock = self.clock.lock();
            clock.pause();
            clock.elapsed().as_secs_f64()
        };
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = RecordingState::Paused;
            snapshot.level = 0.0;
            snapshot.elapsed_seconds = elapsed;
        });
        log::info!("Recording paused at {:.1}s", elapsed);
    }

    async fn resume(&mut self) {
        let state = self.state();
        if state != RecordingState::Paused || self.active.is_none() {
            log::warn!("resume_recording ignored in state {:?}", state);
            return;
        }

        if !self.leased {
            match self
                .session
                .configure_for(SessionClient::Recorder, SessionMode::Recording)
                .await
            {
                Ok(()) => self.leased = true,
                Err(e) => {
                    log::error!("Cannot resume recording, session unavailable: {}", e);
                    return;
                }
            }
        }

        let ticker = self.level_ticker();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.stream.resume();
        active.ticker = Some(ticker);
        self.clock.lock().resume();
        self.interrupted = false;
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = RecordingState::Recording;
        });
        log::info!("Recording resumed");
    }

    async fn stop(&mut self) -> Result<PathBuf, RecordingError> {
        let state = self.state();
        if !state.is_capturing() {
            return Err(RecordingError::InvalidState(state));
        }
        let Some(ActiveCapture { stream, path, .. }) = self.active.take() else {
            return Err(RecordingError::InvalidState(state));
        };

        let elapsed = {
            let mut clock = self.clock.lock();
            clock.pause();
            clock.elapsed().as_secs_f64()
        };

        let finished = tokio::task::spawn_blocking(move || stream.finish()).await;
        let failure = match finished {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            log::error!("Failed to finalize {}: {}", path.display(), reason);
            self.snapshot.send_modify(|snapshot| {
                snapshot.state = RecordingState::Failed(reason.clone());
                snapshot.level = 0.0;
                snapshot.elapsed_seconds = elapsed;
            });
            self.release().await;
            return Err(RecordingError::RecordingFailed(reason));
        }

        self.snapshot.send_modify(|snapshot| {
            snapshot.state = RecordingState::Stopped;
            snapshot.level = 0.0;
            snapshot.elapsed_seconds = elapsed;
        });
        log::info!("Recording stopped: {} ({:.1}s)", path.display(), elapsed);
        self.release().await;
        Ok(path)
    }

    async fn cancel(&mut self) {
        if let Some(ActiveCapture { stream, path, .. }) = self.active.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || stream.abort()).await {
                log::warn!("Capture shutdown task failed: {}", e);
            }
            if let Err(e) = RecordingStore::delete(&path) {
                log::error!("Failed to delete cancelled recording {}: {}", path.display(), e);
            }
            log::info!("Recording cancelled: {}", path.display());
        }
        self.clock.lock().reset();
        self.interrupted = false;
        self.snapshot.send_replace(RecordingSnapshot::default());
        self.release().await;
    }

    async fn reset(&mut self) {
        if self.active.is_some() {
            self.cancel().await;
            return;
        }
        self.clock.lock().reset();
        self.interrupted = false;
        self.snapshot.send_replace(RecordingSnapshot::default());
    }

    async fn fail(&mut self, reason: String) {
        log::error!("Recording failed: {}", reason);
        if let Some(ActiveCapture { stream, path, .. }) = self.active.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || stream.abort()).await {
                log::warn!("Capture shutdown task failed: {}", e);
            }
            log::info!("Partial recording kept at {}", path.display());
        }
        let elapsed = {
            let mut clock = self.clock.lock();
            clock.pause();
            clock.elapsed().as_secs_f64()
        };
        self.interrupted = false;
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = RecordingState::Failed(reason);
            snapshot.level = 0.0;
            snapshot.elapsed_seconds = elapsed;
        });
        self.release().await;
    }

    /// Best-effort lease return; failures never mask the caller's result.
    async fn release(&mut self) {
        if !self.leased {
            return;
        }
        self.leased = false;
        if let Err(e) = self.session.deactivate_for(SessionClient::Recorder).await {
            log::warn!("Failed to release audio session after recording: {}", e);
        }
    }

    // ====== 采样与事件 ======

    fn level_ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.level_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn handle_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Tick => {
                let Some(active) = self.active.as_ref() else {
                    return;
                };
                let level = normalize_level(active.stream.level(), self.config.level_floor_db);
                let elapsed = self.clock.lock().elapsed().as_secs_f64();
                self.snapshot.send_modify(|snapshot| {
                    snapshot.level = level;
                    snapshot.elapsed_seconds = elapsed;
                });
            }
            Activity::Capture(CaptureEvent::Failed(reason)) => {
                if self.state().is_capturing() {
                    self.fail(reason).await;
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::InterruptionBegan => {
                // The coordinator voided every lease.
                self.leased = false;
                if self.state() == RecordingState::Recording {
                    log::info!("Pausing recording for interruption");
                    self.pause();
                    self.interrupted = true;
                }
            }
            SessionEvent::InterruptionEnded { should_resume } => {
                if self.interrupted && self.state() == RecordingState::Paused {
                    self.interrupted = false;
                    if should_resume {
                        log::info!("Resuming recording after interruption");
                        self.resume().await;
                    }
                }
            }
            SessionEvent::RouteChanged { .. } => {}
        }
    }
}

async fn next_activity(active: &mut Option<ActiveCapture>) -> Activity {
    let Some(active) = active.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = active.events.recv() => Activity::Capture(event),
        _ = tick(&mut active.ticker) => Activity::Tick,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
