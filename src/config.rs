//! Configuration loading using Figment.
//!
//! Configuration is layered:
//! 1. A TOML file (e.g. `config/reacher.toml`)
//! 2. Environment variables prefixed with `REACHER_`, with `__` separating
//!    nested keys (`REACHER_SESSION__QUEUE_CAPACITY=8192`)
//!
//! Durations use humantime notation (`"250ms"`, `"2s"`, `"30m"`).
//!
//! # Example
//! ```no_run
//! use reacher_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/reacher.toml")?;
//! config.validate()?;
//! println!("Queue capacity: {}", config.session.queue_capacity);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AcquisitionError, AcquisitionResult};
use crate::session::limits::LimitConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default serial baud rate of the acquisition firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Longest accepted read/push timeout and link settle delay. The reader only
/// notices a stop between reads, so these bound how long a stop can take.
pub const MAX_PIPELINE_WAIT: Duration = Duration::from_secs(60);

/// Longest accepted reconnect backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where session data is written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Defaults applied to every session
    #[serde(default)]
    pub session: SessionConfig,
    /// Known devices
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for session folders (default `~/REACHER/DATA`)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Behavior file name (default: start timestamp)
    #[serde(default)]
    pub filename: Option<String>,
}

/// Reconnect policy for transport faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-open attempts before the session is stopped with a fault
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles per attempt
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Per-session acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Event queue capacity in lines
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Bounded wait for one transport read
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bounded wait for queue room before saturation is reported
    #[serde(default = "default_push_timeout", with = "humantime_serde")]
    pub push_timeout: Duration,
    /// Delay between opening the port and sending `LINK` (boards reset on open)
    #[serde(default = "default_link_settle", with = "humantime_serde")]
    pub link_settle: Duration,
    /// Reconnect policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Stop the session on the first sink error
    #[serde(default)]
    pub fail_fast_on_sink_error: bool,
    /// Automatic stop conditions
    #[serde(default)]
    pub limits: Option<LimitConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            queue_capacity: default_queue_capacity(),
            read_timeout: default_read_timeout(),
            push_timeout: default_push_timeout(),
            link_settle: default_link_settle(),
            retry: RetryPolicy::default(),
            fail_fast_on_sink_error: false,
            limits: None,
        }
    }
}

impl SessionConfig {
    /// Check values that would stall or break the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baud_rate must be > 0".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".to_string());
        }
        if self.read_timeout.is_zero() {
            return Err("read_timeout must be > 0".to_string());
        }
        if self.push_timeout.is_zero() {
            return Err("push_timeout must be > 0".to_string());
        }
        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("push_timeout", self.push_timeout),
            ("link_settle", self.link_settle),
        ] {
            if value > MAX_PIPELINE_WAIT {
                return Err(format!(
                    "{name} ({}) exceeds {}",
                    humantime::format_duration(value),
                    humantime::format_duration(MAX_PIPELINE_WAIT)
                ));
            }
        }
        if self.retry.max_backoff > MAX_BACKOFF {
            return Err(format!(
                "retry.max_backoff ({}) exceeds {}",
                humantime::format_duration(self.retry.max_backoff),
                humantime::format_duration(MAX_BACKOFF)
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(format!(
                "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.initial_backoff, self.retry.max_backoff
            ));
        }
        if let Some(limits) = &self.limits {
            limits.validate()?;
        }
        Ok(())
    }
}

/// A device entry in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Serial port name
    pub port: String,
    /// Overrides `session.baud_rate`
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Whether the device is used by `run` without explicit ports
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_name() -> String {
    "REACHER".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_push_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_link_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(8)
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file and `REACHER_` environment variables.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcquisitionResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Load from environment variables and defaults only.
    pub fn load_env() -> AcquisitionResult<Self> {
        Ok(Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Env::prefixed("REACHER_").split("__"))
            .extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("REACHER_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AcquisitionResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AcquisitionError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.session
            .validate()
            .map_err(|msg| AcquisitionError::Config(format!("session: {msg}")))?;

        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(AcquisitionError::Config(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
            if !ports.insert(&device.port) {
                return Err(AcquisitionError::Config(format!(
                    "Port '{}' assigned to more than one device",
                    device.port
                )));
            }
            if device.baud_rate == Some(0) {
                return Err(AcquisitionError::Config(format!(
                    "Device '{}' has baud_rate 0",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled).collect()
    }

    /// Session settings for one device, applying its overrides.
    pub fn session_for(&self, device: &DeviceDefinition) -> SessionConfig {
        let mut session = self.session.clone();
        if let Some(baud_rate) = device.baud_rate {
            session.baud_rate = baud_rate;
        }
        session
    }
}
