//! The robot's line protocol: what we send, and how every line we receive
//! gets sorted into telemetry, signals, echoes and score reports.
//!
//! There is no framing layer on the wire. Every inbound line is classified
//! on its own by [`classify`], which looks at the literal tag prefix first
//! and falls back to scanning for a parameter echo.

use crate::params::{EchoedParams, ParamField, ParameterSet};
use crate::score::{Metrics, ScoreResult, FAILURE_SCORE};

use nom::{
    bytes::complete::{take_till, take_while1},
    character::complete::{char, one_of, space0},
    combinator::{all_consuming, map_res},
    multi::separated_list0,
    number::complete::recognize_float,
    sequence::{delimited, separated_pair, tuple},
    Finish, IResult,
};

use std::fmt;

/// Prefix of a telemetry sample line.
pub const TAG_CSV: &str = "TAG_CSV:";
/// Prefix of the robot's "I fell over" signal.
pub const TAG_FALLEN: &str = "TAG_FALLEN";
/// Prefix of an informational line.
pub const TAG_INFO: &str = "TAG_INFO:";
/// Prefix of an error line.
pub const TAG_ERROR: &str = "TAG_ERROR:";
/// Prefix of a score the robot computed itself.
pub const TAG_SCORE_RESULT: &str = "TAG_SCORE_RESULT:";

/// Number of leading telemetry columns every sample carries. A column past
/// these is read as the position channel.
pub const BASE_TELEMETRY_COLUMNS: usize = 8;

/// Something we can write to the robot.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `<key>=<value>`
    Set(ParamField, f64),
    /// Persist the active parameters in the robot's flash
    Save,
    /// Ask the robot to echo its active parameters
    Print,
    /// Start streaming telemetry
    CsvOn,
    /// Stop streaming telemetry
    CsvOff,
    /// Start the robot's onboard scoring
    ScoreStart,
    /// Stop the robot's onboard scoring and have it report
    ScoreStop,
    /// Ask for a status line
    Status,
    /// Anything an operator typed in
    Raw(String),
}

impl Command {
    /// One `Set` per field of `set`, in field-table order.
    pub fn set_all(set: &ParameterSet) -> Vec<Command> {
        crate::params::PARAM_FIELDS
            .iter()
            .map(|&field| Command::Set(field, set.get(field)))
            .collect()
    }

    /// The text written to the wire, without the trailing newline.
    pub fn wire(&self) -> String {
        match self {
            Command::Set(field, value) => format!("{}={:.4}", field.wire_key(), value),
            Command::Save => "save".to_owned(),
            Command::Print => "print".to_owned(),
            Command::CsvOn => "csv_on".to_owned(),
            Command::CsvOff => "csv_off".to_owned(),
            Command::ScoreStart => "score_start".to_owned(),
            Command::ScoreStop => "score_stop".to_owned(),
            Command::Status => "status".to_owned(),
            Command::Raw(text) => text.trim().to_owned(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// One decoded telemetry line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// The robot's monotonic clock, in milliseconds
    pub time_ms: f64,
    /// Tilt angle, in degrees
    pub pitch: f64,
    /// Tilt rate, in degrees per second
    pub pitch_rate: f64,
    /// Commanded balance output
    pub balance_cmd: f64,
    /// Proportional contribution
    pub p_term: f64,
    /// Integral contribution
    pub i_term: f64,
    /// Derivative contribution
    pub d_term: f64,
    /// Output after the power gain scaling
    pub scaled_output: f64,
    /// Position/displacement, when the firmware streams it
    pub position: Option<f64>,
}

impl RawSample {
    /// A sample with only a timestamp and a tilt angle, the rest zeroed.
    pub fn at(time_ms: f64, pitch: f64) -> Self {
        Self {
            time_ms,
            pitch,
            pitch_rate: 0.0,
            balance_cmd: 0.0,
            p_term: 0.0,
            i_term: 0.0,
            d_term: 0.0,
            scaled_output: 0.0,
            position: None,
        }
    }

    fn from_columns(cols: &[f64]) -> Self {
        Self {
            time_ms: cols[0],
            pitch: cols[1],
            pitch_rate: cols[2],
            balance_cmd: cols[3],
            p_term: cols[4],
            i_term: cols[5],
            d_term: cols[6],
            scaled_output: cols[7],
            position: cols.get(BASE_TELEMETRY_COLUMNS).copied(),
        }
    }

    /// The sample formatted the way the firmware sends it.
    pub fn to_wire(&self) -> String {
        let mut line = format!(
            "{}{:.0},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3}",
            TAG_CSV,
            self.time_ms,
            self.pitch,
            self.pitch_rate,
            self.balance_cmd,
            self.p_term,
            self.i_term,
            self.d_term,
            self.scaled_output
        );
        if let Some(position) = self.position {
            line.push_str(&format!(",{:.3}", position));
        }
        line
    }
}

/// What a received line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLine {
    /// A telemetry sample
    Telemetry(RawSample),
    /// The robot reports it fell over
    Fallen,
    /// Informational text
    Info(String),
    /// Error text from the robot
    Error(String),
    /// The robot restating its active parameters
    ParameterEcho(EchoedParams),
    /// A score the robot computed in onboard scoring mode
    ScoreResult(ScoreResult),
    /// None of the above
    Unrecognized(String),
}

/// A line that looked like one of ours but could not be decoded. These are
/// logged and dropped, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// A telemetry line with the wrong number of columns
    WrongArity {
        /// Columns we were configured for
        expected: usize,
        /// Columns the line had
        found: usize,
    },
    /// A column or field that is not a number
    BadNumber(String),
    /// A score report missing `score` or `valid_time`
    BadScoreResult(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::WrongArity { expected, found } => {
                write!(f, "expected {} telemetry columns, found {}", expected, found)
            }
            DecodeError::BadNumber(text) => write!(f, "not a number: {:?}", text),
            DecodeError::BadScoreResult(text) => write!(f, "bad score report: {}", text),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Sorts one received line. `arity` is the configured number of telemetry
/// columns.
///
/// A telemetry or score line that fails to decode comes back as `Err`; the
/// caller logs and drops it. A parameter echo with an unparsable number is
/// not an error, it simply is not an echo and comes back as
/// [`DeviceLine::Unrecognized`].
pub fn classify(line: &str, arity: usize) -> Result<DeviceLine, DecodeError> {
    let line = line.trim();

    if let Some(payload) = line.strip_prefix(TAG_CSV) {
        return parse_telemetry(payload, arity).map(DeviceLine::Telemetry);
    }
    if let Some(payload) = line.strip_prefix(TAG_SCORE_RESULT) {
        return parse_score_result(payload).map(DeviceLine::ScoreResult);
    }
    if line.starts_with(TAG_FALLEN) {
        return Ok(DeviceLine::Fallen);
    }
    if let Some(text) = line.strip_prefix(TAG_ERROR) {
        return Ok(DeviceLine::Error(text.trim().to_owned()));
    }
    // The firmware prints its parameters both bare and inside info lines,
    // so the echo scan goes before the info tag.
    if let Some(echo) = parse_echo(line) {
        return Ok(DeviceLine::ParameterEcho(echo));
    }
    if let Some(text) = line.strip_prefix(TAG_INFO) {
        return Ok(DeviceLine::Info(text.trim().to_owned()));
    }
    Ok(DeviceLine::Unrecognized(line.to_owned()))
}

fn number(s: &str) -> IResult<&str, f64> {
    map_res(recognize_float, str::parse::<f64>)(s)
}

fn column(s: &str) -> Result<f64, DecodeError> {
    all_consuming(delimited(space0, number, space0))(s)
        .finish()
        .map(|(_, value)| value)
        .map_err(|_| DecodeError::BadNumber(s.trim().to_owned()))
}

fn parse_telemetry(payload: &str, arity: usize) -> Result<RawSample, DecodeError> {
    let parts: Vec<&str> = payload.trim().split(',').collect();
    if parts.len() != arity || arity < BASE_TELEMETRY_COLUMNS {
        return Err(DecodeError::WrongArity {
            expected: arity,
            found: parts.len(),
        });
    }
    let cols = parts
        .into_iter()
        .map(column)
        .collect::<Result<Vec<f64>, DecodeError>>()?;
    Ok(RawSample::from_columns(&cols))
}

/// `=` or `:`, with optional blanks either side.
fn separator(s: &str) -> IResult<&str, char> {
    delimited(space0, one_of("=:"), space0)(s)
}

/// Finds the first `<label><sep><value>` for any of `labels` in `upper`
/// (the line already upper-cased). `None` if no label is followed by a
/// separator, `Some(Err(()))` if one is but the value is not a number.
fn labelled_value(upper: &str, labels: &[&str]) -> Option<Result<f64, ()>> {
    for label in labels {
        for (idx, _) in upper.match_indices(label) {
            let rest = &upper[idx + label.len()..];
            if let Ok((after_sep, _)) = separator(rest) {
                return Some(number(after_sep).map(|(_, v)| v).map_err(|_| ()));
            }
        }
    }
    None
}

fn parse_echo(line: &str) -> Option<EchoedParams> {
    let upper = line.to_ascii_uppercase();
    let mut echo = EchoedParams {
        kp: 0.0,
        ki: 0.0,
        kd: 0.0,
        init_balance: None,
        power_gain: None,
    };

    for field in crate::params::PARAM_FIELDS {
        let value = match labelled_value(&upper, field.echo_labels()) {
            Some(Ok(v)) => Some(v),
            // A label with garbage after it spoils the whole echo.
            Some(Err(())) => return None,
            None if field.is_mandatory() => return None,
            None => None,
        };
        match field {
            ParamField::Kp => echo.kp = value?,
            ParamField::Ki => echo.ki = value?,
            ParamField::Kd => echo.kd = value?,
            ParamField::InitBalance => echo.init_balance = value,
            ParamField::PowerGain => echo.power_gain = value,
        }
    }
    Some(echo)
}

fn key_value(s: &str) -> IResult<&str, (&str, &str)> {
    let key = delimited(
        space0,
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        space0,
    );
    separated_pair(key, char('='), take_till(|c| c == ','))(s)
}

fn parse_score_result(payload: &str) -> Result<ScoreResult, DecodeError> {
    let (_, pairs) = all_consuming(tuple((
        separated_list0(char(','), key_value),
        space0,
    )))(payload.trim())
    .finish()
    .map(|(rest, (pairs, _))| (rest, pairs))
    .map_err(|_| DecodeError::BadScoreResult(payload.trim().to_owned()))?;

    let lookup = |names: &[&str]| -> Option<&str> {
        pairs
            .iter()
            .find(|(k, _)| names.iter().any(|n| k.eq_ignore_ascii_case(n)))
            .map(|(_, v)| v.trim())
    };

    if let Some(status) = lookup(&["status"]) {
        if status.eq_ignore_ascii_case("fail") || status.eq_ignore_ascii_case("error") {
            return Ok(ScoreResult::failure());
        }
    }

    let required = |names: &[&str]| -> Result<f64, DecodeError> {
        let text = lookup(names)
            .ok_or_else(|| DecodeError::BadScoreResult(format!("missing {}", names[0])))?;
        column(text)
    };
    let optional = |names: &[&str]| -> Result<Option<f64>, DecodeError> {
        lookup(names).map(column).transpose()
    };

    let score = required(&["score"])?;
    let valid_time = required(&["valid_time"])?;
    let total_duration = optional(&["total_duration", "total_time"])?.unwrap_or(valid_time);
    let metrics = Metrics {
        amplitude_rms: optional(&["amplitude_rms", "rms"])?.unwrap_or(0.0),
        frequency: optional(&["frequency", "freq"])?.unwrap_or(0.0),
        degradation: optional(&["degradation"])?.unwrap_or(0.0),
        position_rmse: optional(&["position_rmse"])?.unwrap_or(0.0),
    };

    Ok(ScoreResult {
        score: score.clamp(FAILURE_SCORE, -FAILURE_SCORE),
        valid_time,
        total_duration,
        metrics,
    })
}
