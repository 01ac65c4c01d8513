//! End-to-end behaviour of the three services on the simulated backend.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use audio_session::audio::SimulatedAudioSystem;
use audio_session::config::AudioConfig;
use audio_session::hardware::RecordPermission;
use audio_session::player::{PlaybackError, PlaybackState, Player};
use audio_session::recorder::{Recorder, RecordingError, RecordingState};
use audio_session::session::{SessionCoordinator, SessionError, SessionMode};
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct Stack {
    session: SessionCoordinator,
    recorder: Recorder,
    player: Player,
    system: SimulatedAudioSystem,
    _dir: TempDir,
}

fn stack_with(configure: impl FnOnce(AudioConfig) -> AudioConfig) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let config = configure(AudioConfig::default().with_recordings_dir(dir.path()));
    let (system, events) = SimulatedAudioSystem::new(&config);
    let session = SessionCoordinator::spawn(&config, Arc::new(system.clone()), events);
    let recorder = Recorder::spawn(&config, session.clone(), Arc::new(system.clone()));
    let player = Player::spawn(&config, session.clone(), Arc::new(system.clone())).unwrap();
    Stack {
        session,
        recorder,
        player,
        system,
        _dir: dir,
    }
}

fn stack() -> Stack {
    stack_with(|config| config)
}

fn wav(seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut data = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut data, spec).unwrap();
        for i in 0..(seconds * 16000.0) as usize {
            let t = i as f32 / 16000.0;
            let sample = (t * 330.0 * std::f32::consts::TAU).sin() * 8000.0;
            writer.write_sample(sample as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    data.into_inner()
}

fn http_response(status: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Serve `response` to every request. `None` accepts and never answers.
async fn serve(response: Option<Vec<u8>>) -> String {
    serve_after(Duration::ZERO, response).await
}

/// Like [`serve`], answering each request only after `delay`.
async fn serve_after(delay: Duration, response: Option<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let response = response.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                tokio::time::sleep(delay).await;
                match response {
                    Some(response) => {
                        let _ = socket.write_all(&response).await;
                        let _ = socket.shutdown().await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(30)).await,
                }
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn remote_404_is_a_download_failure() {
    let stack = stack();
    let base = serve(Some(http_response("404 Not Found", b"missing"))).await;

    let err = stack
        .player
        .play_str(&format!("{}/clip.wav", base))
        .await
        .err()
        .unwrap();
    assert!(
        matches!(&err, PlaybackError::DownloadFailed(reason) if reason.contains("404")),
        "{:?}",
        err
    );
    assert!(matches!(stack.player.snapshot().state, PlaybackState::Failed(_)));
    assert!(!stack.session.state().is_active);
}

#[tokio::test]
async fn remote_clip_plays_to_completion_once() {
    let stack = stack();
    let base = serve(Some(http_response("200 OK", &wav(0.5)))).await;

    let completion = stack
        .player
        .play_str(&format!("{}/clip.wav", base))
        .await
        .unwrap();
    let snapshot = stack.player.snapshot();
    assert_eq!(snapshot.state, PlaybackState::Playing);
    assert_eq!(snapshot.duration_seconds, Some(0.5));
    assert!(snapshot.source.unwrap().ends_with("/clip.wav"));

    let finished = tokio::time::timeout(Duration::from_secs(5), completion.finished())
        .await
        .unwrap();
    assert!(finished);
    assert_eq!(stack.player.snapshot().state, PlaybackState::Stopped);
    assert!(!stack.session.state().is_active);
}

#[tokio::test]
async fn oversized_download_is_refused() {
    let stack = stack_with(|mut config| {
        config.max_download_bytes = 1024;
        config
    });
    let base = serve(Some(http_response("200 OK", &wav(0.5)))).await;

    let err = stack
        .player
        .play_str(&format!("{}/big.wav", base))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PlaybackError::DownloadFailed(_)));
}

#[tokio::test]
async fn silent_server_times_out() {
    let stack = stack_with(|config| {
        config.with_download_timeouts(Duration::from_secs(2), Duration::from_millis(300))
    });
    let base = serve(None).await;

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        stack.player.play_str(&format!("{}/slow.wav", base)),
    )
    .await
    .unwrap()
    .err()
    .unwrap();
    assert!(matches!(err, PlaybackError::DownloadFailed(_)));
    assert!(matches!(stack.player.snapshot().state, PlaybackState::Failed(_)));
}

#[tokio::test]
async fn two_second_recording_lands_on_disk() {
    let stack = stack();
    stack.recorder.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(stack.recorder.elapsed_seconds() >= 1.9);

    let path = stack.recorder.stop_recording().await.unwrap();
    assert!(path.starts_with(stack.recorder.recordings_dir()));
    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 44100);
    assert!(reader.duration() as f64 / 44100.0 > 1.5);
    drop(reader);

    let listed = stack.recorder.list_recordings().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, path);

    stack.recorder.delete_recording(&path).unwrap();
    assert!(!path.exists());
    stack.recorder.delete_recording(&path).unwrap();
}

#[tokio::test]
async fn recording_and_playback_share_the_session() {
    let stack = stack();
    stack.recorder.start_recording().await.unwrap();
    assert_eq!(stack.session.state().mode, SessionMode::Recording);

    let completion = stack.player.play(Bytes::from(wav(0.6))).await.unwrap();
    let state = stack.session.state();
    assert!(state.is_active);
    assert_eq!(state.mode, SessionMode::RecordingAndPlayback);
    assert_eq!(stack.system.deactivation_count(), 0);

    let before = stack.recorder.elapsed_seconds();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(stack.recorder.elapsed_seconds() > before);
    assert_eq!(stack.recorder.snapshot().state, RecordingState::Recording);

    assert!(completion.finished().await);
    // The player's lease is gone but the recorder keeps the hardware as it was.
    let state = stack.session.state();
    assert!(state.is_active);
    assert_eq!(state.mode, SessionMode::RecordingAndPlayback);
    assert_eq!(stack.recorder.snapshot().state, RecordingState::Recording);

    stack.recorder.stop_recording().await.unwrap();
    let state = stack.session.state();
    assert!(!state.is_active);
    assert_eq!(state.mode, SessionMode::Idle);
}

#[tokio::test]
async fn concurrent_permission_requests_prompt_once() {
    let stack = stack();
    stack.system.set_permission(RecordPermission::Undetermined);
    stack.system.set_prompt_answer(true, Duration::from_millis(200));

    let (a, b) = tokio::join!(
        stack.session.request_microphone_permission(),
        stack.session.request_microphone_permission()
    );
    assert!(a && b);
    assert_eq!(stack.system.prompt_count(), 1);
    assert!(stack.session.has_microphone_permission());

    stack.recorder.start_recording().await.unwrap();
    stack.recorder.cancel_recording().await;
}

#[tokio::test]
async fn denied_permission_blocks_recording() {
    let stack = stack();
    stack.system.set_permission(RecordPermission::Undetermined);
    stack.system.set_prompt_answer(false, Duration::ZERO);

    assert_eq!(
        stack.session.ensure_microphone_permission().await,
        Err(SessionError::PermissionDenied)
    );
    assert!(matches!(
        stack.recorder.start_recording().await,
        Err(RecordingError::PermissionDenied)
    ));
    // Denial is remembered; no second prompt.
    assert!(!stack.session.request_microphone_permission().await);
    assert_eq!(stack.system.prompt_count(), 1);
}

#[tokio::test]
async fn stop_and_seek_edges() {
    let stack = stack();
    stack.player.stop().await;
    assert_eq!(stack.player.snapshot().state, PlaybackState::Idle);

    let _completion = stack.player.play(Bytes::from(wav(1.0))).await.unwrap();
    stack.player.pause().await;
    stack.player.seek(-10.0).await;
    assert_eq!(stack.player.snapshot().position_seconds, 0.0);
    stack.player.seek(10.0).await;
    assert_eq!(stack.player.snapshot().position_seconds, 1.0);

    stack.player.stop().await;
    stack.player.stop().await;
    let snapshot = stack.player.snapshot();
    assert_eq!(snapshot.state, PlaybackState::Stopped);
    assert_eq!(snapshot.position_seconds, 0.0);
}

#[tokio::test]
async fn local_file_plays_to_completion() {
    let stack = stack();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three_seconds.wav");
    std::fs::write(&path, wav(3.0)).unwrap();

    let completion = stack.player.play(path.clone()).await.unwrap();
    let snapshot = stack.player.snapshot();
    assert_eq!(snapshot.state, PlaybackState::Playing);
    assert!((snapshot.duration_seconds.unwrap() - 3.0).abs() < 1e-6);
    assert_eq!(snapshot.source, Some(path.display().to_string()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let done = completion.on_complete(move || {
        let _ = tx.send(());
    });
    tokio::time::timeout(Duration::from_secs(6), done)
        .await
        .unwrap()
        .unwrap();

    let snapshot = stack.player.snapshot();
    assert_eq!(snapshot.state, PlaybackState::Stopped);
    assert_eq!(Some(snapshot.position_seconds), snapshot.duration_seconds);
    assert!(rx.recv().await.is_some());
    // The sender went away with the callback: it ran exactly once.
    assert!(rx.recv().await.is_none());
    assert!(!stack.session.state().is_active);
}

#[tokio::test]
async fn interruption_while_loading_opens_paused() {
    let stack = stack();
    let late_clip = http_response("200 OK", &wav(1.0));
    let base = serve_after(Duration::from_millis(300), Some(late_clip)).await;

    let url = format!("{}/late.wav", base);
    let (played, ()) = tokio::join!(
        stack.player.play_str(&url),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(stack.player.snapshot().state, PlaybackState::Loading);
            stack.system.begin_interruption();
        }
    );
    let _completion = played.unwrap();
    assert_eq!(stack.player.snapshot().state, PlaybackState::Paused);
    assert!(!stack.session.state().is_active);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stack.player.current_position().await.unwrap(), 0.0);

    stack.system.end_interruption(true);
    let mut rx = stack.player.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.state == PlaybackState::Playing),
    )
    .await
    .unwrap()
    .unwrap();
    let state = stack.session.state();
    assert!(state.is_active);
    assert_eq!(state.mode, SessionMode::Playback);
    stack.player.stop().await;
}

#[tokio::test]
async fn interruption_that_ends_while_loading_keeps_the_lease() {
    let stack = stack();
    let late_clip = http_response("200 OK", &wav(1.0));
    let base = serve_after(Duration::from_millis(300), Some(late_clip)).await;

    let url = format!("{}/late.wav", base);
    let (played, ()) = tokio::join!(
        stack.player.play_str(&url),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stack.system.begin_interruption();
            tokio::time::sleep(Duration::from_millis(50)).await;
            stack.system.end_interruption(true);
        }
    );
    let _completion = played.unwrap();
    assert_eq!(stack.player.snapshot().state, PlaybackState::Playing);
    let state = stack.session.state();
    assert!(state.is_active);
    assert_eq!(state.mode, SessionMode::Playback);
    stack.player.stop().await;
}

#[tokio::test]
async fn output_loss_while_loading_opens_paused() {
    let stack = stack();
    stack.system.plug_headphones("Headphones");
    let late_clip = http_response("200 OK", &wav(1.0));
    let base = serve_after(Duration::from_millis(300), Some(late_clip)).await;

    let url = format!("{}/late.wav", base);
    let (played, ()) = tokio::join!(
        stack.player.play_str(&url),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(stack.player.snapshot().state, PlaybackState::Loading);
            stack.system.unplug_headphones();
        }
    );
    let _completion = played.unwrap();
    assert_eq!(stack.player.snapshot().state, PlaybackState::Paused);
    // Route loss leaves the lease in place; only the caller resumes.
    assert!(stack.session.state().is_active);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stack.player.snapshot().state, PlaybackState::Paused);

    stack.player.resume().await;
    assert_eq!(stack.player.snapshot().state, PlaybackState::Playing);
    stack.player.stop().await;
}
