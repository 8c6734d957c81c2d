//! Everything tunable about a tuning session, read once from a RON file and
//! then handed around read-only.
//!
//! A config file only needs the fields it wants to change:
//!
//! ```text
//! (
//!     serial: (port: "/dev/ttyACM0"),
//!     trial: (duration_s: 15.0, onboard_scoring: true),
//!     scoring: (oscillation_ceiling_deg: 12.0),
//! )
//! ```

use crate::link::{LinkSettings, SerialConnector};
use crate::params::{ParameterSet, DEFAULT_TOLERANCE, PARAM_FIELDS};
use crate::protocol::BASE_TELEMETRY_COLUMNS;
use crate::score::ScoringConfig;
use crate::trial::TrialSettings;
use crate::verify::VerifySettings;

use serde::{Deserialize, Serialize};
use std::{fmt, fs, io, path::Path, time::Duration};

/// Where the robot is plugged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path
    pub port: String,
    /// Baud rate
    pub baud: u32,
    /// How long one read blocks before the reader checks for a stop
    pub read_timeout_ms: u64,
    /// Wait before reopening after a disconnect
    pub reconnect_backoff_ms: u64,
    /// Wait before reopening after a failed reopen
    pub reconnect_backoff_repeat_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_owned(),
            baud: 115200,
            read_timeout_ms: 1000,
            reconnect_backoff_ms: 2000,
            reconnect_backoff_repeat_ms: 3000,
        }
    }
}

/// How we talk to the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Columns per telemetry line
    pub telemetry_arity: usize,
    /// Absolute tolerance when checking an echo
    pub tolerance: f64,
    /// Total sends per verification
    pub max_retries: u32,
    /// Wait for an echo after each send
    pub attempt_timeout_ms: u64,
    /// Pause between lines of one burst
    pub inter_write_pause_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            telemetry_arity: BASE_TELEMETRY_COLUMNS,
            tolerance: DEFAULT_TOLERANCE,
            max_retries: 3,
            attempt_timeout_ms: 2000,
            inter_write_pause_ms: 50,
        }
    }
}

/// How trials are run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    /// Tilt, in degrees, at which the robot counts as fallen
    pub fallen_threshold_deg: f64,
    /// Length of a scheduled trial
    pub duration_s: f64,
    /// Wait for the robot's own score after a trial
    pub score_watchdog_ms: u64,
    /// Let the robot score the trial instead of scoring it here
    pub onboard_scoring: bool,
    /// Rest between two jobs of a sweep
    pub inter_job_pause_ms: u64,
    /// Largest expected gap between samples
    pub loop_warning_ms: f64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            fallen_threshold_deg: 30.0,
            duration_s: 20.0,
            score_watchdog_ms: 5000,
            onboard_scoring: false,
            inter_job_pause_ms: 1000,
            loop_warning_ms: 16.0,
        }
    }
}

/// The whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Serial endpoint
    pub serial: SerialConfig,
    /// Line protocol
    pub protocol: ProtocolConfig,
    /// Trial timing
    pub trial: TrialConfig,
    /// Scoring coefficients
    pub scoring: ScoringConfig,
    /// Parameters used when nothing better is known
    pub defaults: ParameterSet,
}

/// A config file that could not be used.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read
    Io(io::Error),
    /// The file is not valid RON for a config
    Ron(ron::de::SpannedError),
    /// The values make no sense together
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(error) => write!(f, "io error: {}", error),
            ConfigError::Ron(error) => write!(f, "ron error: {}", error),
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl TunerConfig {
    /// Reads and validates a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_ron(&text)
    }

    /// Parses and validates a config from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: TunerConfig = ron::from_str(text).map_err(ConfigError::Ron)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that would make a session meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_owned()));

        if self.protocol.tolerance <= 0.0 {
            return invalid("protocol.tolerance must be positive");
        }
        if self.protocol.max_retries == 0 {
            return invalid("protocol.max_retries must be at least 1");
        }
        // A verification burst is every field plus `print`, with a pause
        // between each line, and has to go out inside one attempt.
        let burst_ms = self
            .protocol
            .inter_write_pause_ms
            .saturating_mul(PARAM_FIELDS.len() as u64);
        if burst_ms >= self.protocol.attempt_timeout_ms {
            return invalid("protocol.attempt_timeout_ms is too short to write a whole burst");
        }
        if self.protocol.telemetry_arity < BASE_TELEMETRY_COLUMNS {
            return invalid("protocol.telemetry_arity is below the 8 base columns");
        }
        if self.scoring.oscillation_ceiling_deg > self.trial.fallen_threshold_deg {
            return invalid("scoring.oscillation_ceiling_deg is above trial.fallen_threshold_deg");
        }
        if self.scoring.analysis_window_s <= 0.0 {
            return invalid("scoring.analysis_window_s must be positive");
        }
        Ok(())
    }

    /// Opens the configured serial port.
    pub fn serial_connector(&self) -> SerialConnector {
        SerialConnector::new(
            &self.serial.port,
            self.serial.baud,
            Duration::from_millis(self.serial.read_timeout_ms),
        )
    }

    /// Link timing and decoding.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            telemetry_arity: self.protocol.telemetry_arity,
            reconnect_backoff: Duration::from_millis(self.serial.reconnect_backoff_ms),
            reconnect_backoff_repeat: Duration::from_millis(self.serial.reconnect_backoff_repeat_ms),
            inter_write_pause: Duration::from_millis(self.protocol.inter_write_pause_ms),
        }
    }

    /// Verification retry bound, timeout and tolerance.
    pub fn verify_settings(&self) -> VerifySettings {
        VerifySettings {
            max_retries: self.protocol.max_retries,
            attempt_timeout: Duration::from_millis(self.protocol.attempt_timeout_ms),
            tolerance: self.protocol.tolerance,
        }
    }

    /// Trial thresholds.
    pub fn trial_settings(&self) -> TrialSettings {
        TrialSettings {
            fallen_threshold_deg: self.trial.fallen_threshold_deg,
            onboard_scoring: self.trial.onboard_scoring,
            loop_warning_ms: self.trial.loop_warning_ms,
        }
    }

    /// Length of a scheduled trial.
    pub fn trial_duration(&self) -> Duration {
        Duration::from_secs_f64(self.trial.duration_s.max(0.0))
    }

    /// Wait for an onboard score.
    pub fn score_watchdog(&self) -> Duration {
        Duration::from_millis(self.trial.score_watchdog_ms)
    }

    /// Rest between jobs.
    pub fn inter_job_pause(&self) -> Duration {
        Duration::from_millis(self.trial.inter_job_pause_ms)
    }
}
