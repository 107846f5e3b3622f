use crate::processing::ProcessingConfig;
use crate::stages::Stage;
use crate::stream::DeviceType;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EyecapConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    /// Device address (IP, host:port or full URL)
    #[serde(default = "default_device_address")]
    pub address: String,

    /// Device role, used to add an mDNS fallback candidate
    #[serde(default)]
    pub device_type: DeviceType,

    /// Path segment appended to path-less addresses as a second candidate
    #[serde(default = "default_stream_path")]
    pub default_path: String,

    /// Bound on each candidate's connect handshake, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds without a frame before the watchdog warns
    #[serde(default = "default_watchdog_silence_secs")]
    pub watchdog_silence_secs: u64,

    /// How often the watchdog looks at the last frame time, in seconds
    #[serde(default = "default_watchdog_check_secs")]
    pub watchdog_check_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconnectConfig {
    /// Reconnect attempts allowed during an active recording
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_attempts: u32,

    /// Fixed delay before each reconnect attempt, in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Directory under which session folders and archives are created
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// JPEG quality for saved frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Minimum spacing between saved frames in single mode (0 saves every frame)
    #[serde(default)]
    pub capture_interval_ms: u64,

    /// Optional rotation / crop / resize applied before saving
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StagesConfig {
    /// How long each guidance message stays up, in milliseconds
    #[serde(default = "default_guidance_dwell_ms")]
    pub guidance_dwell_ms: u64,

    /// Countdown ticks (one per second) before capture begins
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,

    /// Pause after a stage completes before the next one is announced
    #[serde(default = "default_completion_pause_ms")]
    pub completion_pause_ms: u64,

    /// Ring the terminal bell on cues
    #[serde(default = "default_audible_cues")]
    pub audible_cues: bool,

    /// Custom stage plan; the built-in eye capture plan is used when absent
    #[serde(default)]
    pub plan: Option<Vec<Stage>>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl EyecapConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("eyecap.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("device.address", default_device_address())?
            .set_default("device.device_type", "unknown")?
            .set_default("device.default_path", default_stream_path())?
            .set_default("device.connect_timeout_secs", default_connect_timeout_secs())?
            .set_default("device.watchdog_silence_secs", default_watchdog_silence_secs())?
            .set_default("device.watchdog_check_secs", default_watchdog_check_secs())?
            .set_default("reconnect.max_attempts", default_max_reconnect_attempts())?
            .set_default("reconnect.backoff_ms", default_reconnect_backoff_ms())?
            .set_default("recording.output_dir", default_output_dir())?
            .set_default("recording.jpeg_quality", default_jpeg_quality() as u64)?
            .set_default("recording.capture_interval_ms", 0u64)?
            .set_default("stages.guidance_dwell_ms", default_guidance_dwell_ms())?
            .set_default("stages.countdown_secs", default_countdown_secs())?
            .set_default("stages.completion_pause_ms", default_completion_pause_ms())?
            .set_default("stages.audible_cues", default_audible_cues())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // EYECAP_DEVICE__ADDRESS=... style overrides
            .add_source(
                Environment::with_prefix("EYECAP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: EyecapConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.connect_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Device connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.device.watchdog_check_secs == 0 {
            return Err(ConfigError::Message(
                "Device watchdog_check_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.backoff_ms == 0 {
            return Err(ConfigError::Message(
                "Reconnect backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.recording.output_dir.trim().is_empty() {
            return Err(ConfigError::Message(
                "Recording output_dir cannot be empty".to_string(),
            ));
        }

        if !(1..=100).contains(&self.recording.jpeg_quality) {
            return Err(ConfigError::Message(
                "Recording jpeg_quality must be between 1 and 100".to_string(),
            ));
        }

        if let Some((width, height)) = self.recording.processing.target_size {
            if width == 0 || height == 0 {
                return Err(ConfigError::Message(
                    "Processing target_size must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(plan) = &self.stages.plan {
            crate::stages::StagePlan::new(plan.clone())
                .map_err(|e| ConfigError::Message(e.to_string()))?;
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn watchdog_silence(&self) -> Duration {
        Duration::from_secs(self.watchdog_silence_secs)
    }

    pub fn watchdog_check_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_check_secs)
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_device_address(),
            device_type: DeviceType::default(),
            default_path: default_stream_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
            watchdog_silence_secs: default_watchdog_silence_secs(),
            watchdog_check_secs: default_watchdog_check_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_reconnect_attempts(),
            backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            jpeg_quality: default_jpeg_quality(),
            capture_interval_ms: 0,
            processing: ProcessingConfig::default(),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            guidance_dwell_ms: default_guidance_dwell_ms(),
            countdown_secs: default_countdown_secs(),
            completion_pause_ms: default_completion_pause_ms(),
            audible_cues: default_audible_cues(),
            plan: None,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

// Default value functions
fn default_device_address() -> String {
    "192.168.1.100:8080".to_string()
}
fn default_stream_path() -> String {
    "ws".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_watchdog_silence_secs() -> u64 {
    60
}
fn default_watchdog_check_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_backoff_ms() -> u64 {
    5000
}

fn default_output_dir() -> String {
    "./recordings".to_string()
}
fn default_jpeg_quality() -> u8 {
    95
}

fn default_guidance_dwell_ms() -> u64 {
    2000
}
fn default_countdown_secs() -> u32 {
    5
}
fn default_completion_pause_ms() -> u64 {
    2000
}
fn default_audible_cues() -> bool {
    true
}

fn default_event_bus_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EyecapConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.device.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.backoff(), Duration::from_millis(5000));
        assert_eq!(config.recording.jpeg_quality, 95);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EyecapConfig::default();
        config.recording.jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.recording.jpeg_quality = 90;
        assert!(config.validate().is_ok());

        config.device.connect_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_stage_plan_rejected() {
        let mut config = EyecapConfig::default();
        config.stages.plan = Some(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("eyecap.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[device]
address = "10.0.0.7"
device_type = "left_eye"

[reconnect]
max_attempts = 2

[[stages.plan]]
name = "center"
description = "Look at the lens"
interval_ms = 200
target_count = 10
guidance_messages = ["Look straight at the camera"]
"#
        )
        .unwrap();

        let config = EyecapConfig::load_from_file(&path).unwrap();
        assert_eq!(config.device.address, "10.0.0.7");
        assert_eq!(config.device.device_type, DeviceType::LeftEye);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.backoff_ms, 5000);

        let plan = config.stages.plan.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target_count, 10);
    }
}
