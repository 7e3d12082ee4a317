use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::quality::QualityPreset;
use crate::retry::{Backoff, RetrySchedule};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamlinkConfig {
    pub store: StoreConfig,
    pub liveness: LivenessConfig,
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub transport: TransportConfig,
    pub server: ServerConfig,
    pub actuator: ActuatorConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// Directory holding the flat state slots
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LivenessConfig {
    /// Telemetry age after which the camera is considered offline
    #[serde(default = "default_offline_threshold_ms")]
    pub offline_threshold_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// How often the owning client rewrites the session slot
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeats older than this belong to an abandoned session
    #[serde(default = "default_session_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Status/session polling cadence
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often a live viewer checks for a new frame
    #[serde(default = "default_frame_refresh_interval_ms")]
    pub frame_refresh_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_fast_poll_interval_ms")]
    pub fast_poll_interval_ms: u64,

    #[serde(default = "default_fast_poll_attempts")]
    pub fast_poll_attempts: u32,

    #[serde(default = "default_slow_poll_interval_ms")]
    pub slow_poll_interval_ms: u64,

    /// Completion bound when waiting on push events
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,

    /// Completion bound when polling for a result
    #[serde(default = "default_polling_timeout_ms")]
    pub polling_timeout_ms: u64,

    /// Pause between a terminal capture and resuming live view
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Hub-side bound on a single actuator capture
    #[serde(default = "default_actuator_timeout_ms")]
    pub actuator_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransportConfig {
    /// Base URL of the camera hub
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Consecutive event-channel failures before falling back to polling
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time spent on polling before the event channel is retried
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// How often the hub broadcasts a status event
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ActuatorConfig {
    /// External command producing one capture; the output path is appended
    pub capture_command: Option<String>,

    /// Directory receiving capture results
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,

    /// Telemetry cadence of the simulated actuator
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_quality_preset")]
    pub default_preset: QualityPreset,
}

impl CamlinkConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camlink.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("store.path", default_store_path())?
            .set_default(
                "liveness.offline_threshold_ms",
                default_offline_threshold_ms(),
            )?
            .set_default(
                "session.heartbeat_interval_ms",
                default_heartbeat_interval_ms(),
            )?
            .set_default("session.stale_after_ms", default_session_stale_after_ms())?
            .set_default("session.poll_interval_ms", default_poll_interval_ms())?
            .set_default(
                "session.frame_refresh_interval_ms",
                default_frame_refresh_interval_ms(),
            )?
            .set_default(
                "capture.fast_poll_interval_ms",
                default_fast_poll_interval_ms(),
            )?
            .set_default("capture.fast_poll_attempts", default_fast_poll_attempts())?
            .set_default(
                "capture.slow_poll_interval_ms",
                default_slow_poll_interval_ms(),
            )?
            .set_default("capture.event_timeout_ms", default_event_timeout_ms())?
            .set_default("capture.polling_timeout_ms", default_polling_timeout_ms())?
            .set_default("capture.settle_delay_ms", default_settle_delay_ms())?
            .set_default("capture.actuator_timeout_ms", default_actuator_timeout_ms())?
            .set_default("transport.hub_url", default_hub_url())?
            .set_default("transport.failure_threshold", default_failure_threshold())?
            .set_default("transport.cooldown_ms", default_cooldown_ms())?
            .set_default("transport.connect_timeout_ms", default_connect_timeout_ms())?
            .set_default("transport.backoff_base_ms", default_backoff_base_ms())?
            .set_default("transport.backoff_max_ms", default_backoff_max_ms())?
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port())?
            .set_default("server.status_interval_ms", default_status_interval_ms())?
            .set_default("actuator.capture_dir", default_capture_dir())?
            .set_default(
                "actuator.telemetry_interval_ms",
                default_telemetry_interval_ms(),
            )?
            .set_default("quality.default_preset", "medium")?
            .add_source(File::with_name(&path_str).required(false))
            // Environment variables with CAMLINK_ prefix, e.g. CAMLINK_SERVER__PORT
            .add_source(Environment::with_prefix("CAMLINK").separator("__"))
            .build()?;

        let config: CamlinkConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Render as a TOML file that `load_from_file` reads back unchanged
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Message(format!("Cannot render configuration: {}", e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness.offline_threshold_ms == 0 {
            return Err(ConfigError::Message(
                "Liveness offline_threshold_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.heartbeat_interval_ms == 0
            || self.session.poll_interval_ms == 0
            || self.session.frame_refresh_interval_ms == 0
        {
            return Err(ConfigError::Message(
                "Session intervals must be greater than 0".to_string(),
            ));
        }

        if self.session.stale_after_ms <= self.session.heartbeat_interval_ms {
            return Err(ConfigError::Message(
                "Session stale_after_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }

        if self.capture.fast_poll_interval_ms == 0 || self.capture.slow_poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Capture poll intervals must be greater than 0".to_string(),
            ));
        }

        if self.capture.event_timeout_ms == 0 || self.capture.polling_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Capture timeouts must be greater than 0".to_string(),
            ));
        }

        if self.transport.failure_threshold == 0 {
            return Err(ConfigError::Message(
                "Transport failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.transport.backoff_base_ms > self.transport.backoff_max_ms {
            return Err(ConfigError::Message(
                "Transport backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }

        if self.server.status_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Server status_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl LivenessConfig {
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_threshold_ms)
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.frame_refresh_interval_ms)
    }
}

impl CaptureConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn actuator_timeout(&self) -> Duration {
        Duration::from_millis(self.actuator_timeout_ms)
    }

    /// Result polling cadence used when captures complete over the polling channel
    pub fn polling_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            fast_interval: Duration::from_millis(self.fast_poll_interval_ms),
            fast_attempts: self.fast_poll_attempts,
            slow_interval: Duration::from_millis(self.slow_poll_interval_ms),
            timeout: Duration::from_millis(self.polling_timeout_ms),
        }
    }
}

impl TransportConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl ServerConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl ActuatorConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

impl Default for CamlinkConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                path: default_store_path(),
            },
            liveness: LivenessConfig {
                offline_threshold_ms: default_offline_threshold_ms(),
            },
            session: SessionConfig {
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                stale_after_ms: default_session_stale_after_ms(),
                poll_interval_ms: default_poll_interval_ms(),
                frame_refresh_interval_ms: default_frame_refresh_interval_ms(),
            },
            capture: CaptureConfig {
                fast_poll_interval_ms: default_fast_poll_interval_ms(),
                fast_poll_attempts: default_fast_poll_attempts(),
                slow_poll_interval_ms: default_slow_poll_interval_ms(),
                event_timeout_ms: default_event_timeout_ms(),
                polling_timeout_ms: default_polling_timeout_ms(),
                settle_delay_ms: default_settle_delay_ms(),
                actuator_timeout_ms: default_actuator_timeout_ms(),
            },
            transport: TransportConfig {
                hub_url: default_hub_url(),
                failure_threshold: default_failure_threshold(),
                cooldown_ms: default_cooldown_ms(),
                connect_timeout_ms: default_connect_timeout_ms(),
                backoff_base_ms: default_backoff_base_ms(),
                backoff_max_ms: default_backoff_max_ms(),
            },
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
                status_interval_ms: default_status_interval_ms(),
            },
            actuator: ActuatorConfig {
                capture_command: None,
                capture_dir: default_capture_dir(),
                telemetry_interval_ms: default_telemetry_interval_ms(),
            },
            quality: QualityConfig {
                default_preset: default_quality_preset(),
            },
        }
    }
}

// Default value functions
fn default_store_path() -> String {
    "./state".to_string()
}

fn default_offline_threshold_ms() -> u64 {
    7_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_session_stale_after_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_frame_refresh_interval_ms() -> u64 {
    1_000
}

fn default_fast_poll_interval_ms() -> u64 {
    50
}
fn default_fast_poll_attempts() -> u32 {
    40
}
fn default_slow_poll_interval_ms() -> u64 {
    500
}
fn default_event_timeout_ms() -> u64 {
    15_000
}
fn default_polling_timeout_ms() -> u64 {
    10_000
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_actuator_timeout_ms() -> u64 {
    15_000
}

fn default_hub_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    60_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8080
}
fn default_status_interval_ms() -> u64 {
    2_000
}

fn default_capture_dir() -> String {
    "./captures".to_string()
}
fn default_telemetry_interval_ms() -> u64 {
    2_000
}

fn default_quality_preset() -> QualityPreset {
    QualityPreset::Medium
}
