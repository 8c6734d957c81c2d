//! The sweep: every combination of three gain ranges, handed out one job at
//! a time.

use crate::params::ParameterSet;

use std::fmt;

/// Slack when deciding whether the end of a range is reachable by whole
/// steps, so `0.1 + 0.1 + 0.1` still reaches `0.3`.
const STEP_EPSILON: f64 = 1e-9;

/// Which gain a range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Proportional
    Kp,
    /// Integral
    Ki,
    /// Derivative
    Kd,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::Kp => "kp",
            Axis::Ki => "ki",
            Axis::Kd => "kd",
        };
        write!(f, "{}", name)
    }
}

/// A `start..=end` range walked in `step`s. The end is included if it is
/// reachable by whole steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRange {
    /// First value
    pub start: f64,
    /// Last value, if reachable
    pub end: f64,
    /// Increment between values
    pub step: f64,
}

impl GainRange {
    /// Instantiates a range.
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    /// A range holding only `value`.
    pub fn single(value: f64) -> Self {
        Self::new(value, value, 1.0)
    }

    fn validate(&self, axis: Axis) -> Result<(), SweepError> {
        let invalid = |reason: &str| SweepError::InvalidRange {
            axis,
            reason: reason.to_owned(),
        };
        if !(self.start.is_finite() && self.end.is_finite() && self.step.is_finite()) {
            return Err(invalid("values must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be positive"));
        }
        if self.end < self.start {
            return Err(invalid("end is below start"));
        }
        Ok(())
    }

    /// The values of the range in ascending order.
    pub fn values(&self) -> Vec<f64> {
        let count = ((self.end - self.start) / self.step + STEP_EPSILON).floor() as usize + 1;
        (0..count)
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }
}

/// A malformed sweep request.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepError {
    /// One of the ranges makes no sense
    InvalidRange {
        /// The axis at fault
        axis: Axis,
        /// Why
        reason: String,
    },
    /// The sweep has no jobs
    Empty,
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepError::InvalidRange { axis, reason } => {
                write!(f, "invalid {} range: {}", axis, reason)
            }
            SweepError::Empty => write!(f, "the sweep has no jobs"),
        }
    }
}

impl std::error::Error for SweepError {}

/// One parameter set to try, and its place in the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Job {
    /// Zero-based position in the sweep
    pub index: usize,
    /// What to send
    pub params: ParameterSet,
}

/// The full Cartesian product of three gain ranges with a cursor. The
/// cursor only moves forward.
#[derive(Debug, Clone)]
pub struct Sweep {
    jobs: Vec<Job>,
    cursor: usize,
}

impl Sweep {
    /// Builds every combination, proportional outermost, then derivative,
    /// then integral. Auxiliary fields are copied from `base`.
    pub fn new(
        kp: GainRange,
        ki: GainRange,
        kd: GainRange,
        base: &ParameterSet,
    ) -> Result<Self, SweepError> {
        kp.validate(Axis::Kp)?;
        ki.validate(Axis::Ki)?;
        kd.validate(Axis::Kd)?;

        let (ki_values, kd_values) = (ki.values(), kd.values());
        let mut jobs = Vec::new();
        for p in kp.values() {
            for &d in &kd_values {
                for &i in &ki_values {
                    jobs.push(Job {
                        index: jobs.len(),
                        params: ParameterSet::gains(p, i, d).with_aux_from(base),
                    });
                }
            }
        }

        if jobs.is_empty() {
            return Err(SweepError::Empty);
        }
        Ok(Self { jobs, cursor: 0 })
    }

    /// Number of jobs the sweep was built with.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Always false; an empty sweep cannot be built.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Every job in order, consumed or not.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Jobs handed out so far.
    pub fn consumed(&self) -> usize {
        self.cursor
    }

    /// True once every job has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.jobs.len()
    }

    /// Hands out the next job, `None` once the sweep is exhausted.
    pub fn next_job(&mut self) -> Option<Job> {
        let job = self.jobs.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(job)
    }

    /// `"i/n"` for the job most recently handed out.
    pub fn progress(&self) -> String {
        format!("{}/{}", self.cursor, self.jobs.len())
    }
}
