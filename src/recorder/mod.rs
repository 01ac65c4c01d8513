//! Microphone capture to file through an explicit state machine.

mod actor;
mod state;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::AudioConfig;
use crate::hardware::CaptureEngine;
use crate::session::SessionCoordinator;
use actor::{RecorderActor, RecorderCommand};
use state::ElapsedClock;

pub use state::{RecordingError, RecordingSnapshot, RecordingState};
pub use store::{RecordingInfo, RecordingStore};

const COMMAND_QUEUE: usize = 16;

/// Handle to the recorder actor. Cheap to clone.
///
/// `Idle → Recording → {Paused ⇄ Recording} → Stopped`; capturing states go
/// back to `Idle` on cancel, and any state can fail, after which only
/// [`Recorder::reset`] is accepted.
#[derive(Clone)]
pub struct Recorder {
    commands: mpsc::Sender<RecorderCommand>,
    snapshot: watch::Receiver<RecordingSnapshot>,
    clock: Arc<Mutex<ElapsedClock>>,
    store: RecordingStore,
}

impl Recorder {
    /// Start the recorder task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: &AudioConfig,
        session: SessionCoordinator,
        engine: Arc<dyn CaptureEngine>,
    ) -> Self {
        let store = RecordingStore::new(config.resolved_recordings_dir());
        let clock = Arc::new(Mutex::new(ElapsedClock::default()));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(RecordingSnapshot::default());

        let actor = RecorderActor::new(
            config,
            session,
            engine,
            store.clone(),
            commands_rx,
            snapshot_tx,
            clock.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            clock,
            store,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Begin capturing to a fresh file. Requires microphone permission and an
    /// `Idle` or `Stopped` recorder.
    pub async fn start_recording(&self) -> Result<(), RecordingError> {
        self.request(|reply| RecorderCommand::Start { reply })
            .await
            .unwrap_or_else(|| Err(stopped()))
    }

    pub async fn pause_recording(&self) {
        self.request(|reply| RecorderCommand::Pause { reply }).await;
    }

    pub async fn resume_recording(&self) {
        self.request(|reply| RecorderCommand::Resume { reply }).await;
    }

    /// Finalize the file and return its path.
    pub async fn stop_recording(&self) -> Result<PathBuf, RecordingError> {
        self.request(|reply| RecorderCommand::Stop { reply })
            .await
            .unwrap_or_else(|| Err(stopped()))
    }

    /// Abandon the capture and delete the partial file.
    pub async fn cancel_recording(&self) {
        self.request(|reply| RecorderCommand::Cancel { reply }).await;
    }

    /// Return to `Idle` from any state. An open capture is cancelled.
    pub async fn reset(&self) {
        self.request(|reply| RecorderCommand::Reset { reply }).await;
    }

    /// Delete a finished recording. Succeeds if the file is already gone.
    pub fn delete_recording(&self, path: &Path) -> Result<(), RecordingError> {
        let snapshot = self.snapshot.borrow().clone();
        if snapshot.state.is_capturing() && snapshot.file_path.as_deref() == Some(path) {
            return Err(RecordingError::InvalidState(snapshot.state));
        }
        RecordingStore::delete(path).map_err(RecordingError::Io)
    }

    pub fn list_recordings(&self) -> Result<Vec<RecordingInfo>, RecordingError> {
        Ok(self.store.list()?)
    }

    pub fn recordings_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Recorded time excluding pauses, read live rather than at the last tick.
    pub fn elapsed_seconds(&self) -> f64 {
        self.clock.lock().elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingSnapshot> {
        self.snapshot.clone()
    }
}

fn stopped() -> RecordingError {
    RecordingError::RecordingFailed("recorder stopped".to_string())
}
