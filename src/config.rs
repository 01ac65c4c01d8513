use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Serialize, Clone)]
pub struct AudioConfig {
    // 应用信息
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备与录音格式
    pub capture_device: String,
    pub playback_device: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub io_buffer_duration_ms: u32,

    /// Directory recordings are written to. `None` resolves to the per-user data dir.
    pub recordings_dir: Option<PathBuf>,

    // 电平与进度采样
    pub level_interval_ms: u64,
    pub level_floor_db: f32,
    pub position_interval_ms: u64,

    // 网络下载
    pub connect_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub max_download_bytes: u64,

    // 路由
    pub route_poll_interval_ms: u64,
    pub simulated_route_name: String,
}

impl AudioConfig {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let recordings_dir = env!("RECORDINGS_DIR");
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            sample_rate: env!("SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            channels: env!("CHANNELS").parse()
                .map_err(|_| "Failed to parse CHANNELS")?,
            bits_per_sample: env!("BITS_PER_SAMPLE").parse()
                .map_err(|_| "Failed to parse BITS_PER_SAMPLE")?,
            io_buffer_duration_ms: env!("IO_BUFFER_DURATION_MS").parse()
                .map_err(|_| "Failed to parse IO_BUFFER_DURATION_MS")?,
            recordings_dir: if recordings_dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(recordings_dir))
            },

            level_interval_ms: env!("LEVEL_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse LEVEL_INTERVAL_MS")?,
            level_floor_db: env!("LEVEL_FLOOR_DB").parse()
                .map_err(|_| "Failed to parse LEVEL_FLOOR_DB")?,
            position_interval_ms: env!("POSITION_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse POSITION_INTERVAL_MS")?,

            connect_timeout_ms: env!("CONNECT_TIMEOUT_SECS").parse::<u64>()
                .map_err(|_| "Failed to parse CONNECT_TIMEOUT_SECS")? * 1000,
            transfer_timeout_ms: env!("TRANSFER_TIMEOUT_SECS").parse::<u64>()
                .map_err(|_| "Failed to parse TRANSFER_TIMEOUT_SECS")? * 1000,
            max_download_bytes: env!("MAX_DOWNLOAD_BYTES").parse()
                .map_err(|_| "Failed to parse MAX_DOWNLOAD_BYTES")?,

            route_poll_interval_ms: env!("ROUTE_POLL_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse ROUTE_POLL_INTERVAL_MS")?,
            simulated_route_name: env!("SIMULATED_ROUTE_NAME").to_string(),
        })
    }

    /// Set the recordings directory
    pub fn with_recordings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recordings_dir = Some(dir.into());
        self
    }

    pub fn with_level_interval(mut self, interval: Duration) -> Self {
        self.level_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_position_interval(mut self, interval: Duration) -> Self {
        self.position_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_download_timeouts(mut self, connect: Duration, transfer: Duration) -> Self {
        self.connect_timeout_ms = connect.as_millis() as u64;
        self.transfer_timeout_ms = transfer.as_millis() as u64;
        self
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.level_interval_ms.max(1))
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms.max(1))
    }

    pub fn route_poll_interval(&self) -> Duration {
        Duration::from_millis(self.route_poll_interval_ms.max(10))
    }

    /// Resolved recordings directory: the configured one, or
    /// `<data_local_dir>/<app_name>/recordings`.
    pub fn resolved_recordings_dir(&self) -> PathBuf {
        match &self.recordings_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(self.app_name)
                .join("recordings"),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create default AudioConfig from build-time environment variables")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_defaults_parse() {
        let config = AudioConfig::new().unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 1);
        assert_eq!(config.level_interval(), Duration::from_millis(100));
        assert_eq!(config.position_interval(), Duration::from_millis(100));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn recordings_dir_override_wins() {
        let config = AudioConfig::default().with_recordings_dir("/tmp/recs");
        assert_eq!(config.resolved_recordings_dir(), PathBuf::from("/tmp/recs"));
    }

    #[test]
    fn default_recordings_dir_is_namespaced() {
        let mut config = AudioConfig::default();
        config.recordings_dir = None;
        let dir = config.resolved_recordings_dir();
        assert!(dir.ends_with(PathBuf::from(config.app_name).join("recordings")));
    }
}
