//! The parameter verification handshake.
//!
//! [`Session`] is a plain state machine with no I/O of its own. Whoever
//! drives it sends the commands it hands back, tells it when the sending
//! starts, and feeds it echoes and the clock. Only one handshake can be in flight;
//! [`Session::begin`] refuses to start another until the current one has
//! been collected with [`Session::finish`].

use crate::params::{EchoedParams, ParameterSet};
use crate::protocol::Command;

use log::{debug, warn};
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Retry bound, per-attempt timeout and match tolerance for a handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifySettings {
    /// Total number of sends before giving up
    pub max_retries: u32,
    /// How long to wait for an echo after each send
    pub attempt_timeout: Duration,
    /// Absolute tolerance per field
    pub tolerance: f64,
}

/// One send of a parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    /// What was sent
    pub params: ParameterSet,
    /// 1 for the first send, counting up with each retry
    pub number: u32,
}

/// Where a handshake is.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Nothing in flight
    Idle,
    /// Commands handed out, not yet written
    Sending(Attempt),
    /// Written, waiting for the robot to echo
    AwaitingEcho {
        /// The attempt in flight
        attempt: Attempt,
        /// When this attempt times out
        deadline: Instant,
    },
    /// Resend handed out after a timeout or mismatch, not yet written
    Retrying(Attempt),
    /// The robot echoed the set back
    Confirmed(Attempt),
    /// Out of retries
    Failed {
        /// The last attempt
        attempt: Attempt,
        /// What went wrong on it
        reason: String,
    },
}

/// What the driver should do after feeding the session something.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Keep waiting
    Pending,
    /// The input had nothing to do with this session
    Ignored,
    /// Call [`Session::armed`], then write these commands
    Resend(Vec<Command>),
    /// Done, the set is active
    Confirmed,
    /// Done, the set could not be confirmed
    Failed(String),
}

/// Why a handshake did not confirm.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// The link is down, nothing was sent
    NotConnected,
    /// Another handshake is still in flight
    AlreadyPending,
    /// Every attempt timed out or mismatched
    Exhausted {
        /// Sends made
        attempts: u32,
        /// What went wrong on the last one
        reason: String,
    },
    /// Stopped by the operator
    Cancelled,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::NotConnected => write!(f, "not connected"),
            VerifyError::AlreadyPending => write!(f, "a verification is already pending"),
            VerifyError::Exhausted { attempts, reason } => {
                write!(f, "not confirmed after {} attempts: {}", attempts, reason)
            }
            VerifyError::Cancelled => write!(f, "verification cancelled"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// The commands for one attempt: every field, then the echo request.
fn burst_for(params: &ParameterSet) -> Vec<Command> {
    let mut burst = Command::set_all(params);
    burst.push(Command::Print);
    burst
}

/// The handshake state machine.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    settings: VerifySettings,
}

impl Session {
    /// Instantiates an idle session.
    pub fn new(settings: VerifySettings) -> Self {
        Self {
            state: SessionState::Idle,
            settings,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True while a handshake is in flight and not yet terminal.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SessionState::Sending(_)
                | SessionState::AwaitingEcho { .. }
                | SessionState::Retrying(_)
        )
    }

    /// Deadline of the attempt being waited on.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::AwaitingEcho { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Starts a handshake for `params` and returns the first burst to
    /// write. Refused while another one has not been finished.
    pub fn begin(&mut self, params: ParameterSet) -> Result<Vec<Command>, VerifyError> {
        if !matches!(self.state, SessionState::Idle) {
            return Err(VerifyError::AlreadyPending);
        }
        debug!("verifying {}", params);
        self.state = SessionState::Sending(Attempt { params, number: 1 });
        Ok(burst_for(&params))
    }

    /// Starts the clock on the last burst handed out. Call it right before
    /// the burst is written, so the writing counts against the attempt.
    pub fn armed(&mut self, now: Instant) {
        if let SessionState::Sending(attempt) | SessionState::Retrying(attempt) = self.state {
            self.state = SessionState::AwaitingEcho {
                attempt,
                deadline: now + self.settings.attempt_timeout,
            };
        }
    }

    /// Compares an echo against the set in flight.
    pub fn on_echo(&mut self, echo: &EchoedParams) -> Transition {
        let attempt = match self.state {
            SessionState::AwaitingEcho { attempt, .. } => attempt,
            _ => return Transition::Ignored,
        };

        let wrong = echo.discrepancies(&attempt.params, self.settings.tolerance);
        if wrong.is_empty() {
            debug!("confirmed on attempt {}", attempt.number);
            self.state = SessionState::Confirmed(attempt);
            return Transition::Confirmed;
        }

        let listed = wrong
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        warn!("attempt {} mismatched: {}", attempt.number, listed);
        self.retry_or_fail(attempt, format!("mismatch: {}", listed))
    }

    /// Checks the clock against the current deadline.
    pub fn poll_deadline(&mut self, now: Instant) -> Transition {
        match self.state {
            SessionState::AwaitingEcho { attempt, deadline } if now >= deadline => {
                warn!("attempt {} got no echo in time", attempt.number);
                let reason = format!("no echo within {:?}", self.settings.attempt_timeout);
                self.retry_or_fail(attempt, reason)
            }
            SessionState::AwaitingEcho { .. } => Transition::Pending,
            _ => Transition::Ignored,
        }
    }

    /// Ends the current attempt early, as if it had timed out.
    pub fn expire(&mut self, reason: &str) -> Transition {
        match self.state {
            SessionState::Sending(attempt)
            | SessionState::Retrying(attempt)
            | SessionState::AwaitingEcho { attempt, .. } => {
                self.retry_or_fail(attempt, reason.to_owned())
            }
            _ => Transition::Ignored,
        }
    }

    /// Drops the handshake in flight without retrying.
    pub fn abandon(&mut self) {
        self.state = SessionState::Idle;
    }

    /// Collects the outcome of a terminal handshake and returns to idle.
    /// Yields `None` while still pending, so an outcome is handed out at
    /// most once.
    pub fn finish(&mut self) -> Option<Result<ParameterSet, VerifyError>> {
        let outcome = match &self.state {
            SessionState::Confirmed(attempt) => Ok(attempt.params),
            SessionState::Failed { attempt, reason } => Err(VerifyError::Exhausted {
                attempts: attempt.number,
                reason: reason.clone(),
            }),
            _ => return None,
        };
        self.state = SessionState::Idle;
        Some(outcome)
    }

    fn retry_or_fail(&mut self, attempt: Attempt, reason: String) -> Transition {
        if attempt.number < self.settings.max_retries {
            let next = Attempt {
                number: attempt.number + 1,
                ..attempt
            };
            debug!("retrying, attempt {}", next.number);
            self.state = SessionState::Retrying(next);
            Transition::Resend(burst_for(&next.params))
        } else {
            self.state = SessionState::Failed {
                attempt,
                reason: reason.clone(),
            };
            Transition::Failed(reason)
        }
    }
}
