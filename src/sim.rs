//! A pretend balancing robot that speaks the wire protocol.
//!
//! It is a noisy inverted pendulum held up by the same PID the firmware
//! runs, stepped on its own thread. Low gains let it fall over, sensible
//! ones keep it wobbling gently, so a sweep against it gives scores with
//! some shape to them. Plug it in through [`SimulatedRobot::port`], which
//! is both the [`Port`] and the [`Connector`] the link wants.

use crate::link::{Connector, LinkError, Port};
use crate::params::{ParamField, ParameterSet, PARAM_FIELDS};
use crate::protocol::{RawSample, TAG_ERROR, TAG_FALLEN, TAG_INFO, TAG_SCORE_RESULT};
use crate::score::{ScoringConfig, ScoringEngine};

use log::debug;
use rand::prelude::*;
use std::collections::VecDeque;
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
};
use std::thread;
use std::time::Duration;

/// How the pretend robot behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    /// Device time between samples
    pub sample_period_ms: f64,
    /// Samples produced per wall clock period, to run faster than life
    pub speedup: u32,
    /// Tilt at which the robot gives up
    pub fallen_threshold_deg: f64,
    /// Random kick per sample, in degrees per second squared
    pub noise: f64,
    /// Tilt the robot starts each trial at
    pub initial_pitch_deg: f64,
    /// Used when asked to score onboard
    pub scoring: ScoringConfig,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            sample_period_ms: 10.0,
            speedup: 1,
            fallen_threshold_deg: 30.0,
            noise: 40.0,
            initial_pitch_deg: 2.0,
            scoring: ScoringConfig::default(),
        }
    }
}

/// Gravity's pull on the pendulum per degree of tilt, in 1/s^2.
const TOPPLE: f64 = 40.0;
/// Angular acceleration per unit of controller output.
const AUTHORITY: f64 = 20.0;

#[derive(Debug, Default)]
struct Robot {
    staged: ParameterSet,
    saved: Option<ParameterSet>,
    streaming: bool,
    scoring: bool,
    time_ms: f64,
    pitch: f64,
    rate: f64,
    integral: f64,
    recorded: Vec<RawSample>,
}

struct Core {
    settings: SimSettings,
    robot: Mutex<Robot>,
    outbox: Mutex<VecDeque<u8>>,
    ready: Condvar,
    inbox: Mutex<Vec<u8>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Core {
    fn emit(&self, line: &str) {
        let mut outbox = lock(&self.outbox);
        outbox.extend(line.as_bytes());
        outbox.push_back(b'\n');
        self.ready.notify_all();
    }

    /// Advances the pendulum one sample period.
    fn tick(&self, rng: &mut impl Rng) {
        let mut robot = lock(&self.robot);
        if !robot.streaming {
            return;
        }
        let dt = self.settings.sample_period_ms / 1000.0;
        let params = robot.staged;

        let error = robot.pitch + params.init_balance;
        robot.integral += error * dt;
        let p_term = params.kp * error;
        let i_term = params.ki * robot.integral;
        let d_term = params.kd * robot.rate;
        let output = p_term + i_term + d_term;
        let scale = if params.power_gain > 0.0 {
            params.power_gain
        } else {
            1.0
        };
        let scaled_output = output * scale;

        let kick = if self.settings.noise > 0.0 {
            rng.gen_range(-self.settings.noise..self.settings.noise)
        } else {
            0.0
        };
        let accel = TOPPLE * robot.pitch - AUTHORITY * scaled_output + kick;
        robot.rate += accel * dt;
        robot.pitch += robot.rate * dt;
        robot.time_ms += self.settings.sample_period_ms;

        let sample = RawSample {
            time_ms: robot.time_ms,
            pitch: robot.pitch,
            pitch_rate: robot.rate,
            balance_cmd: output,
            p_term,
            i_term,
            d_term,
            scaled_output,
            position: None,
        };
        if robot.scoring {
            robot.recorded.push(sample);
        }
        self.emit(&sample.to_wire());

        if robot.pitch.abs() > self.settings.fallen_threshold_deg {
            robot.streaming = false;
            self.emit(TAG_FALLEN);
        }
    }

    fn command(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        debug!("sim got {:?}", line);
        let mut robot = lock(&self.robot);

        if let Some((key, value)) = line.split_once('=') {
            let field = PARAM_FIELDS.iter().find(|f| f.wire_key() == key.trim());
            match (field, value.trim().parse::<f64>()) {
                (Some(ParamField::Kp), Ok(v)) => robot.staged.kp = v,
                (Some(ParamField::Ki), Ok(v)) => robot.staged.ki = v,
                (Some(ParamField::Kd), Ok(v)) => robot.staged.kd = v,
                (Some(ParamField::InitBalance), Ok(v)) => robot.staged.init_balance = v,
                (Some(ParamField::PowerGain), Ok(v)) => robot.staged.power_gain = v,
                _ => self.emit(&format!("{} bad setting {}", TAG_ERROR, line)),
            }
            return;
        }

        match line {
            "print" => {
                let p = robot.staged;
                self.emit(&format!(
                    "{} KP={:.4} KI={:.4} KD={:.4} INIT_BALANCE={:.4} POWER_GAIN={:.4}",
                    TAG_INFO, p.kp, p.ki, p.kd, p.init_balance, p.power_gain
                ));
            }
            "save" => {
                robot.saved = Some(robot.staged);
                self.emit(&format!("{} parameters saved", TAG_INFO));
            }
            "status" => {
                self.emit(&format!(
                    "{} streaming={} scoring={} t={:.0}",
                    TAG_INFO, robot.streaming, robot.scoring, robot.time_ms
                ));
            }
            "csv_on" => {
                robot.time_ms = 0.0;
                robot.pitch = self.settings.initial_pitch_deg;
                robot.rate = 0.0;
                robot.integral = 0.0;
                robot.streaming = true;
            }
            "csv_off" => robot.streaming = false,
            "score_start" => {
                robot.scoring = true;
                robot.recorded.clear();
            }
            "score_stop" => {
                robot.scoring = false;
                let result = ScoringEngine::new(self.settings.scoring.clone()).score(&robot.recorded);
                self.emit(&format!(
                    "{}score={:.2},valid_time={:.3},total_duration={:.3},amplitude_rms={:.4},frequency={:.4},degradation={:.4}",
                    TAG_SCORE_RESULT,
                    result.score,
                    result.valid_time,
                    result.total_duration,
                    result.metrics.amplitude_rms,
                    result.metrics.frequency,
                    result.metrics.degradation
                ));
            }
            _ => self.emit(&format!("{} unknown command {}", TAG_ERROR, line)),
        }
    }
}

/// The pretend robot. Runs until [`SimulatedRobot::stop`].
pub struct SimulatedRobot {
    handle: Option<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    core: Arc<Core>,
}

impl SimulatedRobot {
    /// Powers the robot on.
    pub fn new(settings: SimSettings) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let period = Duration::from_secs_f64(settings.sample_period_ms / 1000.0);
        let speedup = settings.speedup.max(1);
        let core = Arc::new(Core {
            settings,
            robot: Mutex::new(Robot::default()),
            outbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            inbox: Mutex::new(Vec::new()),
        });
        let th_core = Arc::clone(&core);
        let th_running = Arc::clone(&running);

        let handle = thread::spawn(move || {
            let mut rng = thread_rng();
            while th_running.load(Ordering::SeqCst) {
                for _ in 0..speedup {
                    th_core.tick(&mut rng);
                }
                thread::sleep(period);
            }
        });

        Self {
            handle: Some(handle),
            running,
            core,
        }
    }

    /// The robot's serial port.
    pub fn port(&self) -> SimPort {
        SimPort {
            core: Arc::clone(&self.core),
        }
    }

    /// The parameters the robot is running with right now.
    pub fn active_params(&self) -> ParameterSet {
        lock(&self.core.robot).staged
    }

    /// The parameters last written to flash with `save`.
    pub fn saved_params(&self) -> Option<ParameterSet> {
        lock(&self.core.robot).saved
    }

    /// Powers the robot off.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                log::warn!("simulated robot panicked");
            }
        }
    }
}

/// The serial side of a [`SimulatedRobot`].
#[derive(Clone)]
pub struct SimPort {
    core: Arc<Core>,
}

impl Port for SimPort {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let outbox = lock(&self.core.outbox);
        let (mut outbox, _) = self
            .core
            .ready
            .wait_timeout_while(outbox, Duration::from_millis(50), |q| q.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if outbox.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(outbox.len());
        for (slot, byte) in buf.iter_mut().zip(outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let lines = {
            let mut inbox = lock(&self.core.inbox);
            inbox.extend_from_slice(bytes);
            let mut lines = Vec::new();
            while let Some(end) = inbox.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = inbox.drain(..=end).collect();
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
            lines
        };
        for line in lines {
            self.core.command(&line);
        }
        Ok(())
    }
}

impl Connector for SimPort {
    fn connect(&self) -> Result<Arc<dyn Port>, LinkError> {
        Ok(Arc::new(self.clone()))
    }

    fn describe(&self) -> String {
        "simulated robot".to_owned()
    }
}
