//! Playback of local files, remote URLs and in-memory data.

mod actor;
mod source;
mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::AudioConfig;
use crate::hardware::OutputEngine;
use crate::session::SessionCoordinator;
use actor::{PlayerActor, PlayerCommand};
use source::SourceFetcher;

pub use source::PlaybackSource;
pub use state::{MAX_RATE, MIN_RATE, PlaybackError, PlaybackSnapshot, PlaybackState};

const COMMAND_QUEUE: usize = 16;

/// Resolves when a playback started by [`Player::play`] ends.
///
/// Fires at most once, and only for a natural end of the clip. Stop, reset,
/// failure or a newer `play` resolve it as not finished.
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<()>,
}

impl PlaybackCompletion {
    fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// `true` if the clip played to its end.
    pub async fn finished(self) -> bool {
        self.rx.await.is_ok()
    }

    /// Run `f` once the clip plays to its end. `f` is dropped otherwise.
    pub fn on_complete<F>(self, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        tokio::spawn(async move {
            if self.finished().await {
                f();
            }
        })
    }
}

/// Handle to the player actor. Cheap to clone.
#[derive(Clone)]
pub struct Player {
    commands: mpsc::Sender<PlayerCommand>,
    snapshot: watch::Receiver<PlaybackSnapshot>,
}

impl Player {
    /// Start the player task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: &AudioConfig,
        session: SessionCoordinator,
        output: Arc<dyn OutputEngine>,
    ) -> anyhow::Result<Self> {
        let fetcher = SourceFetcher::new(config)?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(PlaybackSnapshot::default());

        let actor = PlayerActor::new(config, session, output, fetcher, commands_rx, snapshot_tx);
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PlayerCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Load `source` and start playing it, replacing anything already loaded.
    ///
    /// Returns once playback has started; the returned completion resolves
    /// when it ends.
    pub async fn play(
        &self,
        source: impl Into<PlaybackSource>,
    ) -> Result<PlaybackCompletion, PlaybackError> {
        let source = source.into();
        self.request(|reply| PlayerCommand::Play { source, reply })
            .await
            .unwrap_or_else(|| Err(stopped()))
    }

    /// [`Player::play`] for user input such as a path or an http(s) URL.
    pub async fn play_str(&self, input: &str) -> Result<PlaybackCompletion, PlaybackError> {
        self.play(PlaybackSource::parse(input)?).await
    }

    pub async fn pause(&self) {
        self.request(|reply| PlayerCommand::Pause { reply }).await;
    }

    pub async fn resume(&self) {
        self.request(|reply| PlayerCommand::Resume { reply }).await;
    }

    /// Stop and rewind. The pending completion never fires.
    pub async fn stop(&self) {
        self.request(|reply| PlayerCommand::Stop { reply }).await;
    }

    /// Jump to `seconds`, clamped to the clip.
    pub async fn seek(&self, seconds: f64) {
        self.request(|reply| PlayerCommand::Seek { seconds, reply })
            .await;
    }

    /// Clamped to `[MIN_RATE, MAX_RATE]`. Kept for the next clip when idle.
    pub async fn set_playback_rate(&self, rate: f32) {
        self.request(|reply| PlayerCommand::SetRate { rate, reply })
            .await;
    }

    pub async fn reset(&self) {
        self.request(|reply| PlayerCommand::Reset { reply }).await;
    }

    /// Position read from the output itself.
    pub async fn current_position(&self) -> Result<f64, PlaybackError> {
        self.request(|reply| PlayerCommand::Position { reply })
            .await
            .unwrap_or_else(|| Err(stopped()))
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot.clone()
    }
}

fn stopped() -> PlaybackError {
    PlaybackError::PlaybackFailed("player stopped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedAudioSystem;
    use crate::session::SessionMode;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::time::Duration;

    struct Rig {
        player: Player,
        session: SessionCoordinator,
        system: SimulatedAudioSystem,
    }

    fn rig() -> Rig {
        let config = AudioConfig::default().with_position_interval(Duration::from_millis(20));
        let (system, events) = SimulatedAudioSystem::new(&config);
        let session = SessionCoordinator::spawn(&config, Arc::new(system.clone()), events);
        let player = Player::spawn(&config, session.clone(), Arc::new(system.clone())).unwrap();
        Rig {
            player,
            session,
            system,
        }
    }

    fn wav(seconds: f64) -> Bytes {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut data = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut data, spec).unwrap();
            for i in 0..(seconds * 8000.0) as usize {
                writer.write_sample(((i % 64) as i16 - 32) * 200).unwrap();
            }
            writer.finalize().unwrap();
        }
        Bytes::from(data.into_inner())
    }

    async fn wait_for_state(player: &Player, wanted: impl Fn(&PlaybackState) -> bool) {
        let mut rx = player.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| wanted(&s.state)))
            .await
            .expect("timed out waiting for player state")
            .unwrap();
    }

    #[tokio::test]
    async fn plays_to_the_end_once() {
        let rig = rig();
        let completion = rig.player.play(wav(0.25)).await.unwrap();
        let snapshot = rig.player.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.duration_seconds, Some(0.25));
        assert_eq!(rig.session.state().mode, SessionMode::Playback);

        let finished = tokio::time::timeout(Duration::from_secs(3), completion.finished())
            .await
            .unwrap();
        assert!(finished);
        let snapshot = rig.player.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Stopped);
        assert_eq!(snapshot.position_seconds, 0.25);
        assert!(!rig.session.state().is_active);
    }

    #[tokio::test]
    async fn empty_data_is_rejected_up_front() {
        let rig = rig();
        let err = rig.player.play(Bytes::new()).await.err().unwrap();
        assert_eq!(err, PlaybackError::InvalidData);
        assert_eq!(rig.player.snapshot().state, PlaybackState::Idle);
        assert!(!rig.session.state().is_active);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let rig = rig();
        let err = rig.player.play_str("gopher://example.com/a.wav").await.err().unwrap();
        assert!(matches!(err, PlaybackError::InvalidUrl(_)));
        assert_eq!(rig.player.snapshot().state, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn undecodable_data_fails_playback() {
        let rig = rig();
        let err = rig
            .player
            .play(Bytes::from_static(b"this is not audio at all"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::PlaybackFailed(_)));
        assert!(matches!(rig.player.snapshot().state, PlaybackState::Failed(_)));
        assert!(!rig.session.state().is_active);
    }

    #[tokio::test]
    async fn missing_file_fails_to_load() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let err = rig
            .player
            .play(dir.path().join("nothing.wav"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlaybackError::LoadFailed(_)));
        assert!(matches!(rig.player.snapshot().state, PlaybackState::Failed(_)));
    }

    #[tokio::test]
    async fn output_open_failure_is_reported() {
        let rig = rig();
        rig.system.fail_output_open(true);
        let err = rig.player.play(wav(0.2)).await.err().unwrap();
        assert!(matches!(err, PlaybackError::PlaybackFailed(_)));
        assert!(!rig.session.state().is_active);
    }

    #[tokio::test]
    async fn output_failure_mid_clip_never_completes() {
        let rig = rig();
        rig.system.fail_output_after(Some(Duration::from_millis(100)));
        let completion = rig.player.play(wav(2.0)).await.unwrap();
        wait_for_state(&rig.player, |s| matches!(s, PlaybackState::Failed(_))).await;
        assert!(!completion.finished().await);
        assert!(!rig.session.state().is_active);
    }

    #[tokio::test]
    async fn stop_rewinds_and_drops_completion() {
        let rig = rig();
        let completion = rig.player.play(wav(2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        rig.player.stop().await;
        let snapshot = rig.player.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Stopped);
        assert_eq!(snapshot.position_seconds, 0.0);
        assert!(!completion.finished().await);
        assert!(!rig.session.state().is_active);

        // A second stop changes nothing.
        rig.player.stop().await;
        assert_eq!(rig.player.snapshot(), snapshot);
        assert_eq!(
            rig.player.current_position().await,
            Err(PlaybackError::NoActivePlayback)
        );
    }

    #[tokio::test]
    async fn pause_freezes_position_and_seek_clamps() {
        let rig = rig();
        let _completion = rig.player.play(wav(2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        rig.player.pause().await;
        assert_eq!(rig.player.snapshot().state, PlaybackState::Paused);
        let paused_at = rig.player.current_position().await.unwrap();
        assert!(paused_at > 0.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.player.current_position().await.unwrap(), paused_at);

        rig.player.seek(100.0).await;
        assert_eq!(rig.player.snapshot().position_seconds, 2.0);
        rig.player.seek(-3.0).await;
        assert_eq!(rig.player.snapshot().position_seconds, 0.0);
        rig.player.seek(0.5).await;
        assert_eq!(rig.player.current_position().await.unwrap(), 0.5);

        rig.player.resume().await;
        assert_eq!(rig.player.snapshot().state, PlaybackState::Playing);
        rig.player.stop().await;
    }

    #[tokio::test]
    async fn controls_without_a_clip_are_noops() {
        let rig = rig();
        rig.player.pause().await;
        rig.player.resume().await;
        rig.player.stop().await;
        rig.player.seek(1.0).await;
        assert_eq!(rig.player.snapshot(), PlaybackSnapshot::default());
        assert_eq!(
            rig.player.current_position().await,
            Err(PlaybackError::NoActivePlayback)
        );
    }

    #[tokio::test]
    async fn rate_is_clamped_and_kept_for_the_next_clip() {
        let rig = rig();
        rig.player.set_playback_rate(5.0).await;
        assert_eq!(rig.player.snapshot().rate, MAX_RATE);
        rig.player.set_playback_rate(0.1).await;
        assert_eq!(rig.player.snapshot().rate, MIN_RATE);

        rig.player.set_playback_rate(2.0).await;
        let _completion = rig.player.play(wav(2.0)).await.unwrap();
        assert_eq!(rig.player.snapshot().rate, 2.0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Double speed covers more than the wall-clock time.
        assert!(rig.player.current_position().await.unwrap() > 0.25);

        rig.player.reset().await;
        let snapshot = rig.player.snapshot();
        assert_eq!(snapshot.state, PlaybackState::Idle);
        assert_eq!(snapshot.source, None);
        assert_eq!(snapshot.rate, 2.0);
    }

    #[tokio::test]
    async fn newer_play_supersedes_the_current_clip() {
        let rig = rig();
        let first = rig.player.play(wav(2.0)).await.unwrap();
        let second = rig.player.play(wav(0.2)).await.unwrap();
        assert!(!first.finished().await);
        let finished = tokio::time::timeout(Duration::from_secs(3), second.finished())
            .await
            .unwrap();
        assert!(finished);
    }

    #[tokio::test]
    async fn on_complete_runs_once() {
        let rig = rig();
        let (tx, rx) = oneshot::channel();
        let completion = rig.player.play(wav(0.2)).await.unwrap();
        completion
            .on_complete(move || {
                let _ = tx.send(());
            })
            .await
            .unwrap();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn interruption_pauses_until_told_to_resume() {
        let rig = rig();
        let _completion = rig.player.play(wav(3.0)).await.unwrap();

        rig.system.begin_interruption();
        wait_for_state(&rig.player, |s| *s == PlaybackState::Paused).await;
        rig.system.end_interruption(true);
        wait_for_state(&rig.player, |s| *s == PlaybackState::Playing).await;
        assert!(rig.session.state().is_active);
        rig.player.stop().await;
    }

    #[tokio::test]
    async fn losing_the_output_device_pauses() {
        let rig = rig();
        rig.system.plug_headphones("Headphones");
        let _completion = rig.player.play(wav(3.0)).await.unwrap();

        rig.system.unplug_headphones();
        wait_for_state(&rig.player, |s| *s == PlaybackState::Paused).await;
        // No resume without the caller asking.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.player.snapshot().state, PlaybackState::Paused);
        rig.player.resume().await;
        assert_eq!(rig.player.snapshot().state, PlaybackState::Playing);
        rig.player.stop().await;
    }
}
