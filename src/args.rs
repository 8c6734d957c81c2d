// Commandline argument parser using clap for the balance tuner

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tune a balancing robot's PID gains over its serial link
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct TunerArgs {
    #[command(subcommand)]
    /// Which task to perform against the robot
    pub command: TunerCommand,

    /// RON config file; built-in defaults are used if omitted
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Serial device, overrides the config file
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Baud rate, overrides the config file
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,

    /// Where the last confirmed and best parameters are kept
    #[arg(long = "store", default_value = "tuner_params.ron")]
    pub store: PathBuf,
}

/// What `tuner` should do
#[derive(Debug, Subcommand, Clone)]
pub enum TunerCommand {
    /// Try every combination of three gain ranges and score each one
    #[command(about)]
    Sweep(SweepCommand),

    /// Push one parameter set and wait for the robot to confirm it
    #[command(about)]
    Apply(ApplyCommand),

    /// Run and score a single trial with whatever the robot has now
    #[command(about)]
    Trial(TrialCommand),

    /// Print the parameters the robot is running with
    #[command(about)]
    Read,

    /// Send one raw line, e.g. `save` or `status`
    #[command(about)]
    Send(SendCommand),

    /// List serial ports
    #[command(about)]
    Ports,
}

/// Score every combination of three gain ranges
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SweepCommand {
    /// Proportional range: start end step
    #[arg(long = "kp", required = true, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub kp: Vec<f64>,

    /// Integral range: start end step
    #[arg(long = "ki", required = true, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub ki: Vec<f64>,

    /// Derivative range: start end step
    #[arg(long = "kd", required = true, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub kd: Vec<f64>,

    /// Trial length in seconds, overrides the config file
    #[arg(short = 'd', long = "duration")]
    pub duration: Option<f64>,

    /// Directory for result files
    #[arg(short = 'l', long = "log", default_value = "tuning_logs")]
    pub log_dir: PathBuf,
}

/// Push one parameter set to the robot
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ApplyCommand {
    /// Proportional gain
    #[arg(long = "kp")]
    pub kp: f64,

    /// Integral gain
    #[arg(long = "ki")]
    pub ki: f64,

    /// Derivative gain
    #[arg(long = "kd")]
    pub kd: f64,

    /// Initial balance trim, in degrees
    #[arg(long = "init-balance")]
    pub init_balance: Option<f64>,

    /// Power gain multiplier
    #[arg(long = "power-gain")]
    pub power_gain: Option<f64>,

    /// Also write the parameters to the robot's flash once confirmed
    #[arg(long = "save")]
    pub save: bool,
}

/// Run one trial with the active parameters
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct TrialCommand {
    /// Trial length in seconds, overrides the config file
    #[arg(short = 'd', long = "duration")]
    pub duration: Option<f64>,
}

/// Send one raw line to the robot
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SendCommand {
    /// The line to send, without the newline
    pub line: String,
}

/// Run a small gain sweep against a simulated robot
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct DryRunArgs {
    /// Values per gain axis
    #[arg(short = 'n', long = "jobs-per-axis", default_value_t = 2)]
    pub jobs_per_axis: u32,

    /// How much faster than real time the simulated robot runs
    #[arg(short = 's', long = "speedup", default_value_t = 10)]
    pub speedup: u32,

    /// Directory for result files; nothing is written if omitted
    #[arg(short = 'l', long = "log")]
    pub log_dir: Option<PathBuf>,
}
