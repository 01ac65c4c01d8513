use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};

use super::PlaybackCompletion;
use super::source::{PlaybackSource, SourceFetcher};
use super::state::{PlaybackError, PlaybackSnapshot, PlaybackState, clamp_rate};
use crate::audio::{DecodedClip, decode};
use crate::config::AudioConfig;
use crate::hardware::{OutputEngine, OutputEvent, OutputStream};
use crate::session::{SessionClient, SessionCoordinator, SessionEvent, SessionMode, is_output_lost};

const OUTPUT_EVENT_QUEUE: usize = 4;
const LOAD_QUEUE: usize = 4;

pub(super) enum PlayerCommand {
    Play {
        source: PlaybackSource,
        reply: oneshot::Sender<Result<PlaybackCompletion, PlaybackError>>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Seek {
        seconds: f64,
        reply: oneshot::Sender<()>,
    },
    SetRate {
        rate: f32,
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Position {
        reply: oneshot::Sender<Result<f64, PlaybackError>>,
    },
}

/// Result of a background load, tagged with the request it belongs to.
pub(super) struct Loaded {
    generation: u64,
    result: Result<Arc<DecodedClip>, PlaybackError>,
}

struct PendingLoad {
    generation: u64,
    reply: oneshot::Sender<Result<PlaybackCompletion, PlaybackError>>,
}

/// The clip in the output. Dropping it stops position polling and silently
/// discards the completion.
struct ActivePlayback {
    stream: Box<dyn OutputStream>,
    events: mpsc::Receiver<OutputEvent>,
    /// Present only while Playing.
    ticker: Option<Interval>,
    duration: f64,
    completion: oneshot::Sender<()>,
}

enum Activity {
    Tick,
    Output(OutputEvent),
}

pub(super) struct PlayerActor {
    config: AudioConfig,
    session: SessionCoordinator,
    output: Arc<dyn OutputEngine>,
    fetcher: SourceFetcher,
    commands: mpsc::Receiver<PlayerCommand>,
    session_events: broadcast::Receiver<SessionEvent>,
    loaded_tx: mpsc::Sender<Loaded>,
    loaded_rx: mpsc::Receiver<Loaded>,
    snapshot: watch::Sender<PlaybackSnapshot>,
    generation: u64,
    pending: Option<PendingLoad>,
    active: Option<ActivePlayback>,
    rate: f32,
    leased: bool,
    /// Paused by an interruption rather than by the caller.
    interrupted: bool,
    /// The clip being loaded must open paused and wait for the caller.
    hold_on_load: bool,
}

impl PlayerActor {
    pub(super) fn new(
        config: &AudioConfig,
        session: SessionCoordinator,
        output: Arc<dyn OutputEngine>,
        fetcher: SourceFetcher,
        commands: mpsc::Receiver<PlayerCommand>,
        snapshot: watch::Sender<PlaybackSnapshot>,
    ) -> Self {
        let (loaded_tx, loaded_rx) = mpsc::channel(LOAD_QUEUE);
        Self {
            config: config.clone(),
            session_events: session.subscribe(),
            session,
            output,
            fetcher,
            commands,
            loaded_tx,
            loaded_rx,
            snapshot,
            generation: 0,
            pending: None,
            active: None,
            rate: 1.0,
            leased: false,
            interrupted: false,
            hold_on_load: false,
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
                Some(loaded) = self.loaded_rx.recv() => self.handle_loaded(loaded).await,
                activity = next_activity(&mut self.active) => self.handle_activity(activity).await,
                event = self.session_events.recv(), if session_open => match event {
                    Ok(event) => self.handle_session_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Player missed {} session events", skipped);
                    }
                    Err(RecvError::Closed) => session_open = false,
                },
            }
        }

        self.active = None;
        self.release().await;
        log::debug!("Player stopped");
    }

    fn state(&self) -> PlaybackState {
        self.snapshot.borrow().state.clone()
    }

    async fn handle_command(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Play { source, reply } => self.play(source, reply).await,
            PlayerCommand::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            PlayerCommand::Resume { reply } => {
                self.resume().await;
                let _ = reply.send(());
            }
            PlayerCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            PlayerCommand::Seek { seconds, reply } => {
                self.seek(seconds);
                let _ = reply.send(());
            }
            PlayerCommand::SetRate { rate, reply } => {
                self.set_rate(rate);
                let _ = reply.send(());
            }
            PlayerCommand::Reset { reply } => {
                self.reset().await;
                let _ = reply.send(());
            }
            PlayerCommand::Position { reply } => {
                let position = self
                    .active
                    .as_ref()
                    .map(|active| active.stream.position())
                    .ok_or(PlaybackError::NoActivePlayback);
                let _ = reply.send(position);
            }
        }
    }

    // ====== 加载 ======

    async fn play(
        &mut self,
        source: PlaybackSource,
        reply: oneshot::Sender<Result<PlaybackCompletion, PlaybackError>>,
    ) {
        if matches!(&source, PlaybackSource::Bytes(bytes) if bytes.is_empty()) {
            let _ = reply.send(Err(PlaybackError::InvalidData));
            return;
        }

        // A new request replaces whatever is loading or playing.
        self.supersede_pending("superseded by a newer play request");
        if self.active.take().is_some() {
            log::info!("Replacing current playback");
        }
        self.interrupted = false;
        self.hold_on_load = false;
        self.generation += 1;
        let generation = self.generation;

        let description = source.describe();
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = PlaybackState::Loading;
            snapshot.position_seconds = 0.0;
            snapshot.duration_seconds = None;
            snapshot.source = Some(description.clone());
        });
        log::info!("Loading {}", description);

        if let Err(e) = self
            .session
            .configure_for(SessionClient::Player, SessionMode::Playback)
            .await
        {
            self.set_failed(e.to_string());
            let _ = reply.send(Err(PlaybackError::Session(e)));
            return;
        }
        self.leased = true;

        self.pending = Some(PendingLoad { generation, reply });
        let fetcher = self.fetcher.clone();
        let loaded_tx = self.loaded_tx.clone();
        tokio::spawn(async move {
            let result = load_clip(&fetcher, &source).await;
            let _ = loaded_tx.send(Loaded { generation, result }).await;
        });
    }

    async fn handle_loaded(&mut self, loaded: Loaded) {
        if self
            .pending
            .as_ref()
            .is_none_or(|pending| pending.generation != loaded.generation)
        {
            log::debug!("Ignoring stale load #{}", loaded.generation);
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        let clip = match loaded.result {
            Ok(clip) => clip,
            Err(e) => {
                log::error!("Failed to load audio: {}", e);
                self.set_failed(e.to_string());
                self.release().await;
                let _ = pending.reply.send(Err(e));
                return;
            }
        };

        // A held clip opens paused; otherwise a lease voided while loading is taken again.
        let hold = self.interrupted || self.hold_on_load;
        self.hold_on_load = false;
        if !hold && !self.leased {
            if let Err(e) = self
                .session
                .configure_for(SessionClient::Player, SessionMode::Playback)
                .await
            {
                log::error!("Session unavailable after loading: {}", e);
                self.set_failed(e.to_string());
                let _ = pending.reply.send(Err(PlaybackError::Session(e)));
                return;
            }
            self.leased = true;
        }

        let duration = clip.duration();
        let (events_tx, events_rx) = mpsc::channel(OUTPUT_EVENT_QUEUE);
        let output = self.output.clone();
        let rate = self.rate;
        let opened = tokio::task::spawn_blocking(move || output.open(clip, rate, events_tx)).await;
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.abandon_load(pending, format!("{:#}", e)).await,
            Err(e) => return self.abandon_load(pending, e.to_string()).await,
        };

        let (state, ticker) = if hold {
            log::info!("Loaded {:.2}s clip, holding paused", duration);
            (PlaybackState::Paused, None)
        } else {
            stream.play();
            log::info!("Playing {:.2}s clip at {}x", duration, rate);
            (PlaybackState::Playing, Some(self.position_ticker()))
        };
        let (completion_tx, completion_rx) = oneshot::channel();
        self.active = Some(ActivePlayback {
            stream,
            events: events_rx,
            ticker,
            duration,
            completion: completion_tx,
        });
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = state;
            snapshot.position_seconds = 0.0;
            snapshot.duration_seconds = Some(duration);
            snapshot.rate = rate;
        });
        let _ = pending.reply.send(Ok(PlaybackCompletion::new(completion_rx)));
    }

    async fn abandon_load(&mut self, pending: PendingLoad, reason: String) {
        log::error!("Failed to open audio output: {}", reason);
        self.set_failed(reason.clone());
        self.release().await;
        let _ = pending.reply.send(Err(PlaybackError::PlaybackFailed(reason)));
    }

    fn supersede_pending(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            let _ = pending
                .reply
                .send(Err(PlaybackError::LoadFailed(reason.to_string())));
        }
    }

    // ====== 播放控制 ======

    fn pause(&mut self) {
        let state = self.state();
        let Some(active) = self.active.as_mut().filter(|_| state == PlaybackState::Playing) else {
            log::warn!("pause ignored in state {:?}", state);
            return;
        };
        active.stream.pause();
        active.ticker = None;
        let position = active.stream.position();
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = PlaybackState::Paused;
            snapshot.position_seconds = position;
        });
        log::info!("Playback paused at {:.1}s", position);
    }

    async fn resume(&mut self) {
        let state = self.state();
        if state != PlaybackState::Paused || self.active.is_none() {
            log::warn!("resume ignored in state {:?}", state);
            return;
        }

        if !self.leased {
            match self
                .session
                .configure_for(SessionClient::Player, SessionMode::Playback)
                .await
            {
                Ok(()) => self.leased = true,
                Err(e) => {
                    log::error!("Cannot resume playback, session unavailable: {}", e);
                    return;
                }
            }
        }

        let ticker = self.position_ticker();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.stream.play();
        active.ticker = Some(ticker);
        self.interrupted = false;
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = PlaybackState::Playing;
        });
        log::info!("Playback resumed");
    }

    async fn stop(&mut self) {
        let state = self.state();
        if !state.has_output() {
            log::warn!("stop ignored in state {:?}", state);
            return;
        }
        if let Some(mut active) = self.active.take() {
            active.stream.stop();
        }
        self.interrupted = false;
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = PlaybackState::Stopped;
            snapshot.position_seconds = 0.0;
        });
        log::info!("Playback stopped");
        self.release().await;
    }

    fn seek(&mut self, seconds: f64) {
        let Some(active) = self.active.as_mut() else {
            log::warn!("seek ignored: nothing loaded");
            return;
        };
        let target = if seconds.is_finite() { seconds } else { 0.0 };
        let target = target.clamp(0.0, active.duration);
        active.stream.seek(target);
        let position = active.stream.position();
        self.snapshot.send_modify(|snapshot| {
            snapshot.position_seconds = position;
        });
    }

    fn set_rate(&mut self, rate: f32) {
        let rate = clamp_rate(rate);
        self.rate = rate;
        if let Some(active) = self.active.as_mut() {
            active.stream.set_rate(rate);
        }
        self.snapshot.send_modify(|snapshot| {
            snapshot.rate = rate;
        });
    }

    async fn reset(&mut self) {
        // Invalidate any in-flight load.
        self.generation += 1;
        self.supersede_pending("player reset");
        self.active = None;
        self.interrupted = false;
        self.hold_on_load = false;
        let rate = self.rate;
        self.snapshot.send_replace(PlaybackSnapshot {
            rate,
            ..PlaybackSnapshot::default()
        });
        self.release().await;
    }

    fn set_failed(&mut self, reason: String) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = PlaybackState::Failed(reason);
            snapshot.position_seconds = 0.0;
        });
    }

    /// Best-effort lease return; failures never mask the caller's result.
    async fn release(&mut self) {
        if !self.leased {
            return;
        }
        self.leased = false;
        if let Err(e) = self.session.deactivate_for(SessionClient::Player).await {
            log::warn!("Failed to release audio session after playback: {}", e);
        }
    }

    // ====== 进度与事件 ======

    fn position_ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.position_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    async fn handle_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Tick => {
                let Some(active) = self.active.as_ref() else {
                    return;
                };
                let position = active.stream.position().clamp(0.0, active.duration);
                self.snapshot.send_if_modified(|snapshot| {
                    if snapshot.position_seconds == position {
                        return false;
                    }
                    snapshot.position_seconds = position;
                    true
                });
            }
            Activity::Output(OutputEvent::Finished) => {
                let Some(active) = self.active.take() else {
                    return;
                };
                let ActivePlayback {
                    duration,
                    completion,
                    ..
                } = active;
                self.snapshot.send_modify(|snapshot| {
                    snapshot.state = PlaybackState::Stopped;
                    snapshot.position_seconds = duration;
                });
                log::info!("Playback finished");
                self.release().await;
                let _ = completion.send(());
            }
            Activity::Output(OutputEvent::Failed(reason)) => {
                if self.active.take().is_some() {
                    log::error!("Playback failed: {}", reason);
                    self.set_failed(reason);
                    self.release().await;
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::InterruptionBegan => {
                self.leased = false;
                match self.state() {
                    PlaybackState::Playing => {
                        log::info!("Pausing playback for interruption");
                        self.pause();
                        self.interrupted = true;
                    }
                    PlaybackState::Loading => {
                        log::info!("Interrupted while loading; clip will open paused");
                        self.interrupted = true;
                    }
                    _ => {}
                }
            }
            SessionEvent::InterruptionEnded { should_resume }
                if self.state() == PlaybackState::Loading =>
            {
                if self.interrupted {
                    self.interrupted = false;
                    self.hold_on_load |= !should_resume;
                }
            }
            SessionEvent::InterruptionEnded { should_resume } => {
                if self.interrupted && self.state() == PlaybackState::Paused {
                    self.interrupted = false;
                    if should_resume {
                        log::info!("Resuming playback after interruption");
                        self.resume().await;
                    }
                }
            }
            SessionEvent::RouteChanged { reason, .. } if is_output_lost(reason) => {
                match self.state() {
                    PlaybackState::Playing => {
                        log::info!("Output device went away ({:?}), pausing", reason);
                        self.pause();
                    }
                    PlaybackState::Loading => {
                        log::info!("Output device went away ({:?}) while loading", reason);
                        self.hold_on_load = true;
                    }
                    _ => {}
                }
            }
            SessionEvent::RouteChanged { .. } => {}
        }
    }
}

async fn load_clip(
    fetcher: &SourceFetcher,
    source: &PlaybackSource,
) -> Result<Arc<DecodedClip>, PlaybackError> {
    let data = fetcher.load(source).await?;
    let hint = source.format_hint();
    tokio::task::spawn_blocking(move || decode(data, hint.as_deref()))
        .await
        .map_err(|e| PlaybackError::PlaybackFailed(e.to_string()))?
        .map(Arc::new)
        .map_err(|e| PlaybackError::PlaybackFailed(format!("{:#}", e)))
}

async fn next_activity(active: &mut Option<ActivePlayback>) -> Activity {
    let Some(active) = active.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = active.events.recv() => Activity::Output(event),
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
