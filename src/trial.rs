//! Timed telemetry capture.
//!
//! The controller opens a trial with [`TrialController::start`], feeds
//! it samples as they arrive and eventually gets a [`ClosedTrial`] back,
//! either from an explicit [`TrialController::stop`] or because the robot
//! fell over. At most one trial is running at any time.

use crate::link::CommandSink;
use crate::protocol::{Command, RawSample};

use log::{info, warn};
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Thresholds a trial is run with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSettings {
    /// Tilt magnitude, in degrees, past which the robot is considered down
    pub fallen_threshold_deg: f64,
    /// Also run the robot's own scoring alongside the telemetry stream
    pub onboard_scoring: bool,
    /// Gap between consecutive samples, in device milliseconds, above which
    /// the robot's control loop is running late
    pub loop_warning_ms: f64,
}

/// Why a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Tilt past the fallen threshold, or the robot said so
    Fallen,
    /// The configured duration ran out
    DurationElapsed,
    /// Stopped by hand
    Operator,
    /// The sweep was cancelled
    Cancelled,
}

impl StopReason {
    /// Short lowercase name used in logs and result files.
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Fallen => "fallen",
            StopReason::DurationElapsed => "duration",
            StopReason::Operator => "operator",
            StopReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a trial could not be started.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialError {
    /// A trial is already running
    AlreadyRunning,
    /// The link is down
    NotConnected,
    /// The sweep was cancelled before the trial could run
    Cancelled,
}

impl fmt::Display for TrialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialError::AlreadyRunning => write!(f, "a trial is already running"),
            TrialError::NotConnected => write!(f, "not connected"),
            TrialError::Cancelled => write!(f, "trial cancelled"),
        }
    }
}

impl std::error::Error for TrialError {}

/// A running trial. Samples are only ever appended.
#[derive(Debug, Clone)]
struct Trial {
    started: Instant,
    samples: Vec<RawSample>,
    late_samples: usize,
}

impl Trial {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            samples: Vec::new(),
            late_samples: 0,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A finished trial, ready to be scored and recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrial {
    /// Every sample, in arrival order
    pub samples: Vec<RawSample>,
    /// What ended it
    pub reason: StopReason,
    /// Samples that arrived later than the loop warning allows
    pub late_samples: usize,
    /// Host time the trial was open
    pub wall_duration: Duration,
}

/// Opens, feeds and closes trials.
#[derive(Debug, Clone)]
pub struct TrialController {
    settings: TrialSettings,
    running: Option<Trial>,
}

impl TrialController {
    /// Instantiates a controller with no trial running.
    pub fn new(settings: TrialSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }

    /// True while a trial is open.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Opens a trial and turns the telemetry stream on. Nothing changes if
    /// this is refused.
    pub fn start<S: CommandSink + ?Sized>(&mut self, sink: &S) -> Result<(), TrialError> {
        if self.running.is_some() {
            return Err(TrialError::AlreadyRunning);
        }
        if !sink.is_connected() {
            return Err(TrialError::NotConnected);
        }

        let mut burst = vec![Command::CsvOn];
        if self.settings.onboard_scoring {
            burst.push(Command::ScoreStart);
        }
        if let Err(error) = sink.send_burst(&burst) {
            warn!("could not start trial: {}", error);
            return Err(TrialError::NotConnected);
        }

        info!("trial started");
        self.running = Some(Trial::new());
        Ok(())
    }

    /// Appends a sample to the open trial. Returns the closed trial if
    /// this sample shows the robot has fallen.
    pub fn on_sample<S: CommandSink + ?Sized>(
        &mut self,
        sink: &S,
        sample: RawSample,
    ) -> Option<ClosedTrial> {
        let trial = self.running.as_mut()?;

        if let Some(previous) = trial.samples.last() {
            let gap = sample.time_ms - previous.time_ms;
            if gap > self.settings.loop_warning_ms {
                warn!("control loop late: {:.0} ms between samples", gap);
                trial.late_samples += 1;
            }
        }
        trial.samples.push(sample);

        if sample.pitch.abs() > self.settings.fallen_threshold_deg {
            info!("pitch {:.1} past fallen threshold", sample.pitch);
            return self.stop(sink, StopReason::Fallen);
        }
        None
    }

    /// The robot reported that it fell.
    pub fn on_fallen<S: CommandSink + ?Sized>(&mut self, sink: &S) -> Option<ClosedTrial> {
        self.stop(sink, StopReason::Fallen)
    }

    /// Turns the stream off and closes the open trial. Does nothing if no
    /// trial is open.
    pub fn stop<S: CommandSink + ?Sized>(
        &mut self,
        sink: &S,
        reason: StopReason,
    ) -> Option<ClosedTrial> {
        let trial = self.running.take()?;

        let mut burst = vec![Command::CsvOff];
        if self.settings.onboard_scoring {
            burst.push(Command::ScoreStop);
        }
        if let Err(error) = sink.send_burst(&burst) {
            warn!("could not stop the stream: {}", error);
        }

        info!(
            "trial stopped ({}) with {} samples",
            reason,
            trial.samples.len()
        );
        Some(ClosedTrial {
            wall_duration: trial.elapsed(),
            samples: trial.samples,
            reason,
            late_samples: trial.late_samples,
        })
    }
}
