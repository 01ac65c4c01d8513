use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    metering: Metering,
    network: Network,
    route: Route,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    io_buffer_duration_ms: u32,
    recordings_dir: String,
}

#[derive(Deserialize)]
struct Metering {
    level_interval_ms: u64,
    level_floor_db: f32,
    position_interval_ms: u64,
}

#[derive(Deserialize)]
struct Network {
    connect_timeout_secs: u64,
    transfer_timeout_secs: u64,
    max_download_bytes: u64,
}

#[derive(Deserialize)]
struct Route {
    poll_interval_ms: u64,
    simulated_route_name: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=BITS_PER_SAMPLE={}", config.audio.bits_per_sample);
    println!("cargo:rustc-env=IO_BUFFER_DURATION_MS={}", config.audio.io_buffer_duration_ms);
    println!("cargo:rustc-env=RECORDINGS_DIR={}", config.audio.recordings_dir);

    // 电平与进度采样
    println!("cargo:rustc-env=LEVEL_INTERVAL_MS={}", config.metering.level_interval_ms);
    println!("cargo:rustc-env=LEVEL_FLOOR_DB={}", config.metering.level_floor_db);
    println!("cargo:rustc-env=POSITION_INTERVAL_MS={}", config.metering.position_interval_ms);

    // 网络配置
    println!("cargo:rustc-env=CONNECT_TIMEOUT_SECS={}", config.network.connect_timeout_secs);
    println!("cargo:rustc-env=TRANSFER_TIMEOUT_SECS={}", config.network.transfer_timeout_secs);
    println!("cargo:rustc-env=MAX_DOWNLOAD_BYTES={}", config.network.max_download_bytes);

    // 路由监听
    println!("cargo:rustc-env=ROUTE_POLL_INTERVAL_MS={}", config.route.poll_interval_ms);
    println!("cargo:rustc-env=SIMULATED_ROUTE_NAME={}", config.route.simulated_route_name);
}
