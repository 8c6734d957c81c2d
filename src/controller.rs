//! The single controller context.
//!
//! Everything that reacts to the robot runs here, on whichever thread owns
//! the [`Controller`]: the verification handshake, the running trial, the
//! wait for an onboard score. Each of those is a blocking call that pulls
//! classified lines off the link's queue in arrival order until it is done,
//! so no two of them can ever touch shared state at the same time.
//!
//! Lines that the current call is not interested in still go through
//! [`Controller::handle_line`], so an error line or a stray fallen signal
//! is never lost just because we happened to be verifying.

use crate::config::TunerConfig;
use crate::link::{CommandSink, LinkError};
use crate::params::{EchoedParams, ParameterSet};
use crate::protocol::{Command, DeviceLine};
use crate::score::ScoreResult;
use crate::trial::{ClosedTrial, StopReason, TrialController, TrialError};
use crate::verify::{Session, Transition, VerifyError};

use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};

/// How long [`Controller::read_params`] waits for an echo.
pub const READ_PARAMS_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a blocking wait goes without checking for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// What happened to one received line.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Nothing further to do
    Consumed,
    /// The line closed the running trial
    TrialClosed(ClosedTrial),
}

/// Owns the robot's line queue and every piece of state that reacts to it.
pub struct Controller<S: CommandSink> {
    sink: S,
    inbox: Receiver<DeviceLine>,
    session: Session,
    trials: TrialController,
    pending_score: Option<ScoreResult>,
    last_echo: Option<EchoedParams>,
    cancel: Arc<AtomicBool>,
}

impl<S: CommandSink> Controller<S> {
    /// Instantiates a controller writing to `sink` and reading the lines
    /// the link classified from `inbox`.
    pub fn new(sink: S, inbox: Receiver<DeviceLine>, config: &TunerConfig) -> Self {
        Self {
            sink,
            inbox,
            session: Session::new(config.verify_settings()),
            trials: TrialController::new(config.trial_settings()),
            pending_score: None,
            last_echo: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The write side.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Setting this flag makes every blocking call wind down at its next
    /// poll, and any running trial stop.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// True once the cancel token has been set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// True while a trial is open.
    pub fn trial_running(&self) -> bool {
        self.trials.is_running()
    }

    /// The most recent parameter echo, solicited or not.
    pub fn last_echo(&self) -> Option<EchoedParams> {
        self.last_echo
    }

    /// Sends one command outside of any handshake, e.g. from the operator.
    pub fn send(&self, command: Command) -> Result<(), LinkError> {
        self.sink.send(command)
    }

    /// Pushes `params` to the robot and blocks until it has echoed them
    /// back, or every attempt has failed.
    pub fn verify(&mut self, params: ParameterSet) -> Result<ParameterSet, VerifyError> {
        if self.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }
        if !self.sink.is_connected() {
            return Err(VerifyError::NotConnected);
        }
        self.drain();

        let mut outgoing = Some(self.session.begin(params)?);
        loop {
            if let Some(burst) = outgoing.take() {
                self.session.armed(Instant::now());
                // A failed write is left to run into the attempt deadline,
                // the link may well be back by the retry.
                let sent = match self.session.deadline() {
                    Some(deadline) => self.sink.send_burst_by(&burst, deadline),
                    None => self.sink.send_burst(&burst),
                };
                if let Err(error) = sent {
                    warn!("verification write failed: {}", error);
                }
            }

            if self.is_cancelled() {
                self.session.abandon();
                return Err(VerifyError::Cancelled);
            }

            let wait = self
                .session
                .deadline()
                .map_or(CANCEL_POLL, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                })
                .min(CANCEL_POLL);

            let transition = match self.inbox.recv_timeout(wait) {
                Ok(DeviceLine::ParameterEcho(echo)) => {
                    self.last_echo = Some(echo);
                    self.session.on_echo(&echo)
                }
                Ok(line) => {
                    self.handle_line(line);
                    Transition::Pending
                }
                Err(RecvTimeoutError::Timeout) => self.session.poll_deadline(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => {
                    self.session.expire("the link reader is gone")
                }
            };

            match transition {
                Transition::Resend(burst) => outgoing = Some(burst),
                Transition::Confirmed | Transition::Failed(_) => {
                    return match self.session.finish() {
                        Some(outcome) => outcome,
                        None => Err(VerifyError::Cancelled),
                    };
                }
                Transition::Pending | Transition::Ignored => {}
            }
        }
    }

    /// Opens a trial without waiting on it. Samples are collected by
    /// whatever call pulls lines next.
    pub fn start_trial(&mut self) -> Result<(), TrialError> {
        self.pending_score = None;
        self.trials.start(&self.sink)
    }

    /// Closes the running trial, if any.
    pub fn stop_trial(&mut self, reason: StopReason) -> Option<ClosedTrial> {
        self.trials.stop(&self.sink, reason)
    }

    /// Runs a trial for at most `duration`, stopping early if the robot
    /// falls or the controller is cancelled.
    pub fn run_trial(&mut self, duration: Duration) -> Result<ClosedTrial, TrialError> {
        if self.is_cancelled() {
            return Err(TrialError::Cancelled);
        }
        self.start_trial()?;

        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return self
                    .stop_trial(StopReason::Cancelled)
                    .ok_or(TrialError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return self
                    .stop_trial(StopReason::DurationElapsed)
                    .ok_or(TrialError::Cancelled);
            }

            match self.inbox.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(line) => {
                    if let Handled::TrialClosed(closed) = self.handle_line(line) {
                        return Ok(closed);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("link reader gone mid trial");
                    return self
                        .stop_trial(StopReason::Cancelled)
                        .ok_or(TrialError::Cancelled);
                }
            }
        }
    }

    /// Waits up to `watchdog` for the robot's own score of the last trial.
    pub fn await_device_score(&mut self, watchdog: Duration) -> Option<ScoreResult> {
        let deadline = Instant::now() + watchdog;
        loop {
            if let Some(result) = self.pending_score.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                return None;
            }
            match self.inbox.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(line) => {
                    self.handle_line(line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Asks the robot for its active parameters and waits for the echo.
    /// `Ok(None)` if none came within `timeout`.
    pub fn read_params(&mut self, timeout: Duration) -> Result<Option<EchoedParams>, LinkError> {
        self.drain();
        self.sink.send(Command::Print)?;

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                return Ok(None);
            }
            match self.inbox.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(DeviceLine::ParameterEcho(echo)) => {
                    self.last_echo = Some(echo);
                    return Ok(Some(echo));
                }
                Ok(line) => {
                    self.handle_line(line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Reacts to one line that no blocking call claimed.
    pub fn handle_line(&mut self, line: DeviceLine) -> Handled {
        let closed = match line {
            DeviceLine::Telemetry(sample) => self.trials.on_sample(&self.sink, sample),
            DeviceLine::Fallen => {
                if !self.trials.is_running() {
                    info!("robot reports it fell");
                }
                self.trials.on_fallen(&self.sink)
            }
            DeviceLine::Info(text) => {
                info!("robot: {}", text);
                None
            }
            DeviceLine::Error(text) => {
                error!("robot: {}", text);
                None
            }
            DeviceLine::ParameterEcho(echo) => {
                debug!("unsolicited echo: kp={} ki={} kd={}", echo.kp, echo.ki, echo.kd);
                self.last_echo = Some(echo);
                None
            }
            DeviceLine::ScoreResult(result) => {
                info!("robot scored the trial {:.1}", result.score);
                self.pending_score = Some(result);
                None
            }
            DeviceLine::Unrecognized(text) => {
                debug!("unrecognized: {}", text);
                None
            }
        };
        match closed {
            Some(trial) => Handled::TrialClosed(trial),
            None => Handled::Consumed,
        }
    }

    /// Handles lines for `window` and hands back everything that arrived.
    pub fn listen(&mut self, window: Duration) -> Vec<DeviceLine> {
        let deadline = Instant::now() + window;
        let mut heard = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_cancelled() {
                return heard;
            }
            match self.inbox.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(line) => {
                    heard.push(line.clone());
                    self.handle_line(line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return heard,
            }
        }
    }

    /// Blocks until the link is up, for at most `timeout`.
    pub fn wait_for_link(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.sink.is_connected() {
            if Instant::now() >= deadline || self.is_cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Handles every line already queued without blocking.
    pub fn drain(&mut self) {
        while let Ok(line) = self.inbox.try_recv() {
            self.handle_line(line);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::tests::MemoryPort;
    use crate::link::{Connector, Link, LinkHandle, LinkSettings, Port};
    use crate::params::ParamField;
    use crate::protocol::RawSample;
    use std::sync::mpsc::{channel, Sender};
    use std::sync::Mutex;

    /// A scripted robot: remembers what it was told and answers `print`
    /// and `csv_on` the way the firmware would, straight into the
    /// controller's queue.
    pub struct FakeRobot {
        pub lines: Sender<DeviceLine>,
        pub sent: Mutex<Vec<Command>>,
        pub connected: bool,
        /// Echo `print` only if the staged kp is one of these
        pub echo_for_kp: Option<Vec<f64>>,
        /// Samples pushed on `csv_on`
        pub on_csv: Vec<DeviceLine>,
        staged: Mutex<ParameterSet>,
    }

    impl FakeRobot {
        pub fn new(lines: Sender<DeviceLine>) -> Self {
            Self {
                lines,
                sent: Mutex::new(Vec::new()),
                connected: true,
                echo_for_kp: None,
                on_csv: Vec::new(),
                staged: Mutex::new(ParameterSet::default()),
            }
        }

        pub fn count(&self, command: &Command) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c == command)
                .count()
        }
    }

    impl CommandSink for FakeRobot {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send_burst(&self, commands: &[Command]) -> Result<(), LinkError> {
            if !self.connected {
                return Err(LinkError::NotConnected);
            }
            for command in commands {
                self.sent.lock().unwrap().push(command.clone());
                let mut staged = self.staged.lock().unwrap();
                match command {
                    Command::Set(ParamField::Kp, v) => staged.kp = *v,
                    Command::Set(ParamField::Ki, v) => staged.ki = *v,
                    Command::Set(ParamField::Kd, v) => staged.kd = *v,
                    Command::Set(ParamField::InitBalance, v) => staged.init_balance = *v,
                    Command::Set(ParamField::PowerGain, v) => staged.power_gain = *v,
                    Command::Print => {
                        let answer = match &self.echo_for_kp {
                            Some(kps) => kps.iter().any(|kp| (kp - staged.kp).abs() < 1e-9),
                            None => true,
                        };
                        if answer {
                            let _ = self.lines.send(DeviceLine::ParameterEcho(EchoedParams {
                                kp: staged.kp,
                                ki: staged.ki,
                                kd: staged.kd,
                                init_balance: None,
                                power_gain: None,
                            }));
                        }
                    }
                    Command::CsvOn => {
                        for line in &self.on_csv {
                            let _ = self.lines.send(line.clone());
                        }
                    }
                    _ => {}
                }
            }
            Ok(())
        }
    }

    pub fn fast_config() -> TunerConfig {
        let mut config = TunerConfig::default();
        config.protocol.attempt_timeout_ms = 50;
        config.protocol.inter_write_pause_ms = 0;
        config.trial.score_watchdog_ms = 50;
        config.trial.inter_job_pause_ms = 0;
        config
    }

    #[test]
    fn test_verify_confirms_on_echo() {
        let (tx, rx) = channel();
        let robot = FakeRobot::new(tx);
        let mut controller = Controller::new(robot, rx, &fast_config());

        let set = ParameterSet::gains(2.5, 0.1, 0.3);
        assert_eq!(controller.verify(set), Ok(set));
        assert_eq!(controller.sink().count(&Command::Print), 1);
    }

    #[test]
    fn test_verify_fails_after_max_retries_without_echo() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.echo_for_kp = Some(vec![]);
        let mut controller = Controller::new(robot, rx, &fast_config());

        let started = Instant::now();
        let outcome = controller.verify(ParameterSet::gains(2.5, 0.1, 0.3));
        let took = started.elapsed();

        assert!(matches!(outcome, Err(VerifyError::Exhausted { attempts: 3, .. })));
        assert_eq!(controller.sink().count(&Command::Print), 3);
        assert_eq!(controller.sink().count(&Command::Set(ParamField::Kp, 2.5)), 3);
        assert!(took >= Duration::from_millis(150));
        assert!(took < Duration::from_millis(150 + 100), "took {:?}", took);
    }

    #[test]
    fn test_verify_rejected_when_offline() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.connected = false;
        let mut controller = Controller::new(robot, rx, &fast_config());
        assert_eq!(
            controller.verify(ParameterSet::default()),
            Err(VerifyError::NotConnected)
        );
        assert!(controller.sink().sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stale_echo_is_not_attributed() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx.clone());
        robot.echo_for_kp = Some(vec![]);
        let mut controller = Controller::new(robot, rx, &fast_config());

        // An echo queued before the handshake began is drained while idle.
        let set = ParameterSet::gains(1.0, 0.0, 0.0);
        tx.send(DeviceLine::ParameterEcho(EchoedParams {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            init_balance: None,
            power_gain: None,
        }))
        .unwrap();
        assert!(matches!(
            controller.verify(set),
            Err(VerifyError::Exhausted { .. })
        ));
        assert!(controller.last_echo().is_some());
    }

    #[test]
    fn test_run_trial_stops_when_robot_falls() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![
            DeviceLine::Telemetry(RawSample::at(0.0, 1.0)),
            DeviceLine::Info("balancing".to_owned()),
            DeviceLine::Telemetry(RawSample::at(10.0, 2.0)),
            DeviceLine::Fallen,
            DeviceLine::Telemetry(RawSample::at(20.0, 3.0)),
        ];
        let mut controller = Controller::new(robot, rx, &fast_config());

        let closed = controller.run_trial(Duration::from_secs(5)).unwrap();
        assert_eq!(closed.reason, StopReason::Fallen);
        assert_eq!(closed.samples.len(), 2);
        assert!(!controller.trial_running());
        assert_eq!(controller.sink().count(&Command::CsvOff), 1);
    }

    #[test]
    fn test_run_trial_times_out() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![DeviceLine::Telemetry(RawSample::at(0.0, 1.0))];
        let mut controller = Controller::new(robot, rx, &fast_config());

        let closed = controller.run_trial(Duration::from_millis(30)).unwrap();
        assert_eq!(closed.reason, StopReason::DurationElapsed);
        assert_eq!(closed.samples.len(), 1);
    }

    #[test]
    fn test_cancelled_before_trial() {
        let (tx, rx) = channel();
        let mut controller = Controller::new(FakeRobot::new(tx), rx, &fast_config());
        controller.cancel_token().store(true, Ordering::SeqCst);
        assert_eq!(
            controller.run_trial(Duration::from_secs(1)),
            Err(TrialError::Cancelled)
        );
        assert_eq!(
            controller.verify(ParameterSet::default()),
            Err(VerifyError::Cancelled)
        );
    }

    #[test]
    fn test_cancel_while_trial_runs() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![DeviceLine::Telemetry(RawSample::at(0.0, 1.0))];
        let mut controller = Controller::new(robot, rx, &fast_config());

        let token = controller.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let closed = controller.run_trial(Duration::from_secs(10)).unwrap();
        let took = started.elapsed();
        canceller.join().unwrap();

        assert_eq!(closed.reason, StopReason::Cancelled);
        assert_eq!(closed.samples.len(), 1);
        assert!(took < Duration::from_millis(100 + 200), "took {:?}", took);
        assert!(!controller.trial_running());
        assert_eq!(controller.sink().count(&Command::CsvOff), 1);
    }

    #[test]
    fn test_device_score_and_watchdog() {
        let (tx, rx) = channel();
        let mut controller = Controller::new(FakeRobot::new(tx.clone()), rx, &fast_config());

        assert_eq!(controller.await_device_score(Duration::from_millis(20)), None);

        let result = ScoreResult {
            score: 812.0,
            valid_time: 18.0,
            ..ScoreResult::neutral()
        };
        tx.send(DeviceLine::ScoreResult(result)).unwrap();
        assert_eq!(
            controller.await_device_score(Duration::from_millis(200)),
            Some(result)
        );
    }

    #[test]
    fn test_listen_collects_replies() {
        let (tx, rx) = channel();
        let mut controller = Controller::new(FakeRobot::new(tx.clone()), rx, &fast_config());
        assert!(controller.wait_for_link(Duration::from_millis(10)));

        tx.send(DeviceLine::Info("parameters saved".to_owned())).unwrap();
        tx.send(DeviceLine::Error("unknown command".to_owned())).unwrap();
        let heard = controller.listen(Duration::from_millis(30));
        assert_eq!(heard.len(), 2);
        assert_eq!(heard[1], DeviceLine::Error("unknown command".to_owned()));
    }

    #[test]
    fn test_read_params() {
        let (tx, rx) = channel();
        let mut controller = Controller::new(FakeRobot::new(tx), rx, &fast_config());
        let echo = controller.read_params(Duration::from_millis(200)).unwrap();
        assert_eq!(echo.map(|e| e.kp), Some(ParameterSet::default().kp));

        let mut offline = FakeRobot::new(channel().0);
        offline.connected = false;
        let mut controller = Controller::new(offline, channel().1, &fast_config());
        assert!(controller.read_params(Duration::from_millis(20)).is_err());
    }

    struct Fixed(Arc<MemoryPort>);

    impl Connector for Fixed {
        fn connect(&self) -> Result<Arc<dyn Port>, LinkError> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "memory".to_owned()
        }
    }

    /// A real link over an in-memory port, already connected.
    fn memory_link(pause: Duration) -> (Link, Arc<MemoryPort>, LinkHandle, Receiver<DeviceLine>) {
        let port = Arc::new(MemoryPort::default());
        let (tx, rx) = channel();
        let settings = LinkSettings {
            telemetry_arity: 8,
            reconnect_backoff: Duration::from_millis(10),
            reconnect_backoff_repeat: Duration::from_millis(10),
            inter_write_pause: pause,
        };
        let link = Link::start(Fixed(port.clone()), settings, tx);
        let handle = link.handle();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_connected() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        (link, port, handle, rx)
    }

    #[test]
    fn test_verify_bound_includes_write_pauses() {
        // The port never answers; each attempt writes six lines 10 ms apart.
        let (mut link, port, handle, rx) = memory_link(Duration::from_millis(10));
        let mut config = fast_config();
        config.protocol.attempt_timeout_ms = 100;
        let mut controller = Controller::new(handle, rx, &config);

        let started = Instant::now();
        let outcome = controller.verify(ParameterSet::gains(2.5, 0.1, 0.3));
        let took = started.elapsed();

        assert!(matches!(outcome, Err(VerifyError::Exhausted { attempts: 3, .. })));
        assert!(took >= Duration::from_millis(300));
        assert!(took < Duration::from_millis(300 + 80), "took {:?}", took);
        let prints = port.written_lines().iter().filter(|l| *l == "print").count();
        assert_eq!(prints, 3);
        link.stop();
    }

    #[test]
    fn test_malformed_line_between_samples_is_dropped() {
        let (mut link, port, handle, rx) = memory_link(Duration::ZERO);
        let mut controller = Controller::new(handle, rx, &fast_config());
        controller.start_trial().unwrap();
        port.feed("TAG_CSV:0,1,0,0,0,0,0,0\nTAG_CSV:5,1,0\nTAG_CSV:10,2,0,0,0,0,0,0\n");
        port.feed("TAG_INFO:end\n");

        // Pull lines until the marker arrives.
        loop {
            match controller.inbox.recv_timeout(Duration::from_secs(1)).unwrap() {
                DeviceLine::Info(_) => break,
                line => {
                    controller.handle_line(line);
                }
            }
        }
        let closed = controller.stop_trial(StopReason::Operator).unwrap();
        assert_eq!(closed.samples.len(), 2);
        assert_eq!(port.written_lines(), vec!["csv_on", "csv_off"]);
        link.stop();
    }
}
