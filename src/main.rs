mod cli;

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use audio_session::audio::{AlsaAudioSystem, SimulatedAudioSystem};
use audio_session::config::AudioConfig;
use audio_session::hardware::{AudioHardware, CaptureEngine, HardwareEvent, OutputEngine};
use audio_session::player::{PlaybackState, Player};
use audio_session::recorder::{Recorder, RecordingState};
use audio_session::session::SessionCoordinator;
use clap::Parser;
use cli::{Args, Command};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;

/// The three services wired to one backend.
struct Services {
    session: SessionCoordinator,
    recorder: Recorder,
    player: Player,
}

impl Services {
    fn start(config: &AudioConfig, simulated: bool) -> anyhow::Result<Self> {
        if simulated {
            log::info!("Using simulated audio backend");
            let (system, events) = SimulatedAudioSystem::new(config);
            let system = Arc::new(system);
            Self::wire(config, system.clone(), system.clone(), system, events)
        } else {
            let (system, events) =
                AlsaAudioSystem::start(config).context("Failed to start ALSA backend")?;
            Self::wire(config, system.clone(), system.clone(), system, events)
        }
    }

    fn wire(
        config: &AudioConfig,
        hardware: Arc<dyn AudioHardware>,
        capture: Arc<dyn CaptureEngine>,
        output: Arc<dyn OutputEngine>,
        events: mpsc::Receiver<HardwareEvent>,
    ) -> anyhow::Result<Self> {
        let session = SessionCoordinator::spawn(config, hardware, events);
        let recorder = Recorder::spawn(config, session.clone(), capture);
        let player = Player::spawn(config, session.clone(), output)?;
        Ok(Self {
            session,
            recorder,
            player,
        })
    }
}

/// 每个快照一行JSON，方便其他进程解析
fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => log::warn!("Failed to serialize snapshot: {}", e),
    }
}

async fn sleep_or_forever(seconds: Option<f64>) {
    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await,
        None => pending().await,
    }
}

// ====== 录音 ======

async fn record(services: &Services, seconds: Option<f64>) -> anyhow::Result<()> {
    if !services.session.request_microphone_permission().await {
        bail!("Microphone access denied");
    }
    services.recorder.start_recording().await?;

    let mut snapshots = services.recorder.subscribe();
    let deadline = sleep_or_forever(seconds);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, finishing recording");
                break;
            }
            _ = &mut deadline => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    bail!("Recorder stopped unexpectedly");
                }
                let snapshot = snapshots.borrow_and_update().clone();
                emit(&snapshot);
                if let RecordingState::Failed(reason) = snapshot.state {
                    services.recorder.reset().await;
                    bail!("Recording failed: {}", reason);
                }
            }
        }
    }

    let path = services.recorder.stop_recording().await?;
    println!("{}", path.display());
    Ok(())
}

// ====== 播放 ======

async fn play(services: &Services, source: &str, rate: f32) -> anyhow::Result<()> {
    services.player.set_playback_rate(rate).await;
    let completion = services.player.play_str(source).await?;

    let mut snapshots = services.player.subscribe();
    let finished = completion.finished();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, stopping playback");
                services.player.stop().await;
                break;
            }
            done = &mut finished => {
                emit(&services.player.snapshot());
                if !done {
                    if let PlaybackState::Failed(reason) = services.player.snapshot().state {
                        bail!("Playback failed: {}", reason);
                    }
                }
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    bail!("Player stopped unexpectedly");
                }
                emit(&*snapshots.borrow_and_update());
            }
        }
    }
    Ok(())
}

// ====== 边录边播 ======

async fn duplex(services: &Services, source: &str) -> anyhow::Result<()> {
    if !services.session.request_microphone_permission().await {
        bail!("Microphone access denied");
    }
    services.recorder.start_recording().await?;

    let played = async {
        let completion = services.player.play_str(source).await?;
        emit(&services.session.state());
        Ok::<bool, anyhow::Error>(completion.finished().await)
    };

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, stopping");
            services.player.stop().await;
            Ok(false)
        }
        result = played => result,
    };

    let path = services.recorder.stop_recording().await;
    emit(&services.session.state());
    let path = path?;
    println!("{}", path.display());
    if outcome? {
        log::info!("Clip finished while recording");
    }
    Ok(())
}

// ====== 设备与录音文件 ======

fn devices(services: &Services, simulated: bool) {
    if !simulated {
        for card in AlsaAudioSystem::devices() {
            println!(
                "card {}: {} [{}] {:?}",
                card.index,
                card.name,
                card.long_name,
                card.port_kind()
            );
        }
    }
    emit(&services.session.state());
}

fn list(services: &Services) -> anyhow::Result<()> {
    for info in services.recorder.list_recordings()? {
        println!(
            "{}\t{} bytes\t{}",
            info.path.display(),
            info.size_bytes,
            info.modified.to_rfc3339()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::init_logging(&args);

    // 加载配置
    let mut config = AudioConfig::new().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    if let Some(dir) = &args.recordings_dir {
        config = config.with_recordings_dir(dir);
    }
    log::info!("{} {} starting", config.app_name, config.app_version);

    let services = Services::start(&config, args.simulated)?;

    match &args.command {
        Command::Record { seconds } => record(&services, *seconds).await?,
        Command::Play { source, rate } => play(&services, source, *rate).await?,
        Command::Duplex { source } => duplex(&services, source).await?,
        Command::Devices => devices(&services, args.simulated),
        Command::List => list(&services)?,
        Command::Delete { path } => services.recorder.delete_recording(path)?,
    }
    Ok(())
}
