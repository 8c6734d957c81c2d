//! Walks a [`Sweep`] one job at a time: verify, run, score, record, next.
//!
//! Nothing a single job does can stop the sweep. A set the robot will not
//! confirm, a trial that cannot start or a robot that never reports its
//! score all end up as a [`FAILURE_SCORE`] for that job, and the scheduler
//! moves on. Only cancellation ends a sweep early.

use crate::config::TunerConfig;
use crate::controller::Controller;
use crate::link::CommandSink;
use crate::params::ParameterSet;
use crate::score::{ScoreResult, ScoringEngine, FAILURE_SCORE};
use crate::sweep::{Job, Sweep};
use crate::trial::{ClosedTrial, StopReason, TrialError};
use crate::verify::VerifyError;

use log::{info, warn};
use std::{error::Error, fmt, thread, time::Duration};

/// Who scores a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSource {
    /// Score the samples here with the [`ScoringEngine`]
    Host,
    /// Wait for the robot's `TAG_SCORE_RESULT` line
    Device,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Ran and was scored
    Scored,
    /// The robot never confirmed the parameters
    VerifyFailed(String),
    /// The trial could not be started
    TrialFailed(String),
    /// The robot did not report a score before the watchdog fired
    NoDeviceScore,
}

impl JobOutcome {
    /// Short label for result files.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Scored => "scored",
            JobOutcome::VerifyFailed(_) => "verify_failed",
            JobOutcome::TrialFailed(_) => "trial_failed",
            JobOutcome::NoDeviceScore => "no_device_score",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::VerifyFailed(reason) | JobOutcome::TrialFailed(reason) => {
                write!(f, "{}: {}", self.label(), reason)
            }
            _ => write!(f, "{}", self.label()),
        }
    }
}

/// The record of one finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// The job
    pub job: Job,
    /// Its score, [`FAILURE_SCORE`] unless it was scored
    pub result: ScoreResult,
    /// How it ended
    pub outcome: JobOutcome,
    /// Why the trial stopped, if one ran
    pub stop_reason: Option<StopReason>,
}

/// Where finished jobs and trials get written. Failures are logged by the
/// scheduler and never stop the sweep.
pub trait RunRecorder {
    /// Stores the samples of a trial that just closed.
    fn record_trial(&mut self, job: &Job, trial: &ClosedTrial) -> Result<(), Box<dyn Error>>;

    /// Stores the result of a finished job.
    fn record_job(&mut self, result: &JobResult) -> Result<(), Box<dyn Error>>;
}

/// A recorder that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecorder;

impl RunRecorder for NoRecorder {
    fn record_trial(&mut self, _: &Job, _: &ClosedTrial) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    fn record_job(&mut self, _: &JobResult) -> Result<(), Box<dyn Error>> {
        Ok(())
    }
}

/// Where the scheduler is.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    /// No job taken yet
    NotStarted,
    /// Pushing a job's parameters
    VerifyParams(Job),
    /// Running a job's trial
    TrialRunning(Job),
    /// A job has its score
    Scored(Job, ScoreResult),
    /// Every job has been run
    Done,
    /// Stopped before the end
    Cancelled,
}

impl SchedulerState {
    /// True for `Done` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Done | SchedulerState::Cancelled)
    }
}

/// Drives a sweep through a [`Controller`].
pub struct Scheduler {
    sweep: Sweep,
    engine: ScoringEngine,
    source: ScoreSource,
    trial_duration: Duration,
    score_watchdog: Duration,
    inter_job_pause: Duration,
    state: SchedulerState,
    results: Vec<JobResult>,
}

impl Scheduler {
    /// Instantiates a scheduler for `sweep` with the trial timing and
    /// scoring from `config`.
    pub fn new(sweep: Sweep, config: &TunerConfig) -> Self {
        let source = if config.trial.onboard_scoring {
            ScoreSource::Device
        } else {
            ScoreSource::Host
        };
        Self {
            sweep,
            engine: ScoringEngine::new(config.scoring.clone()),
            source,
            trial_duration: config.trial_duration(),
            score_watchdog: config.score_watchdog(),
            inter_job_pause: config.inter_job_pause(),
            state: SchedulerState::NotStarted,
            results: Vec::new(),
        }
    }

    /// Overrides the configured trial length.
    pub fn with_trial_duration(mut self, duration: Duration) -> Self {
        self.trial_duration = duration;
        self
    }

    /// Current state.
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Every finished job so far, in order.
    pub fn results(&self) -> &[JobResult] {
        &self.results
    }

    /// Jobs taken from the sweep so far.
    pub fn advances(&self) -> usize {
        self.sweep.consumed()
    }

    /// Jobs in the sweep.
    pub fn total_jobs(&self) -> usize {
        self.sweep.len()
    }

    /// The highest scoring parameters so far.
    pub fn best(&self) -> Option<(ParameterSet, f64)> {
        self.results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Scored)
            .max_by(|a, b| a.result.score.total_cmp(&b.result.score))
            .map(|r| (r.job.params, r.result.score))
    }

    /// Runs every remaining job.
    pub fn run<S: CommandSink, R: RunRecorder>(
        &mut self,
        controller: &mut Controller<S>,
        recorder: &mut R,
    ) -> &[JobResult] {
        while !self.state.is_terminal() {
            self.step(controller, recorder);
        }
        info!(
            "sweep {:?} after {}/{} jobs",
            self.state,
            self.advances(),
            self.total_jobs()
        );
        &self.results
    }

    /// Makes one transition.
    pub fn step<S: CommandSink, R: RunRecorder>(
        &mut self,
        controller: &mut Controller<S>,
        recorder: &mut R,
    ) -> &SchedulerState {
        let state = std::mem::replace(&mut self.state, SchedulerState::Cancelled);
        self.state = match state {
            SchedulerState::NotStarted | SchedulerState::Scored(..) => {
                if controller.is_cancelled() {
                    SchedulerState::Cancelled
                } else {
                    let rest = matches!(state, SchedulerState::Scored(..));
                    self.next_job(rest)
                }
            }
            SchedulerState::VerifyParams(job) => match controller.verify(job.params) {
                Ok(_) => SchedulerState::TrialRunning(job),
                Err(VerifyError::Cancelled) => SchedulerState::Cancelled,
                Err(error) => {
                    warn!("job {} skipped: {}", self.sweep.progress(), error);
                    self.finish(
                        recorder,
                        job,
                        ScoreResult::failure(),
                        JobOutcome::VerifyFailed(error.to_string()),
                        None,
                    )
                }
            },
            SchedulerState::TrialRunning(job) => match controller.run_trial(self.trial_duration) {
                Ok(trial) if trial.reason == StopReason::Cancelled => SchedulerState::Cancelled,
                Ok(trial) => {
                    if let Err(error) = recorder.record_trial(&job, &trial) {
                        warn!("could not record trial: {}", error);
                    }
                    let (result, outcome) = self.score(controller, &trial);
                    self.finish(recorder, job, result, outcome, Some(trial.reason))
                }
                Err(TrialError::Cancelled) => SchedulerState::Cancelled,
                Err(error) => {
                    warn!("job {} trial failed: {}", self.sweep.progress(), error);
                    self.finish(
                        recorder,
                        job,
                        ScoreResult::failure(),
                        JobOutcome::TrialFailed(error.to_string()),
                        None,
                    )
                }
            },
            terminal => terminal,
        };
        &self.state
    }

    fn next_job(&mut self, rest: bool) -> SchedulerState {
        match self.sweep.next_job() {
            Some(job) => {
                if rest && !self.inter_job_pause.is_zero() {
                    thread::sleep(self.inter_job_pause);
                }
                info!("job {}: {}", self.sweep.progress(), job.params);
                SchedulerState::VerifyParams(job)
            }
            None => SchedulerState::Done,
        }
    }

    fn score<S: CommandSink>(
        &self,
        controller: &mut Controller<S>,
        trial: &ClosedTrial,
    ) -> (ScoreResult, JobOutcome) {
        match self.source {
            ScoreSource::Host => (self.engine.score(&trial.samples), JobOutcome::Scored),
            ScoreSource::Device => match controller.await_device_score(self.score_watchdog) {
                Some(result) => (result, JobOutcome::Scored),
                None => {
                    warn!("no score from the robot within {:?}", self.score_watchdog);
                    (ScoreResult::failure(), JobOutcome::NoDeviceScore)
                }
            },
        }
    }

    fn finish<R: RunRecorder>(
        &mut self,
        recorder: &mut R,
        job: Job,
        result: ScoreResult,
        outcome: JobOutcome,
        stop_reason: Option<StopReason>,
    ) -> SchedulerState {
        info!(
            "job {} scored {:.1} ({})",
            self.sweep.progress(),
            result.score,
            outcome
        );
        debug_assert!(outcome == JobOutcome::Scored || result.score == FAILURE_SCORE);

        let record = JobResult {
            job,
            result,
            outcome,
            stop_reason,
        };
        if let Err(error) = recorder.record_job(&record) {
            warn!("could not record job: {}", error);
        }
        self.results.push(record);
        SchedulerState::Scored(job, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{fast_config, FakeRobot};
    use crate::protocol::{Command, DeviceLine, RawSample};
    use crate::sweep::GainRange;
    use std::f64::consts::PI;
    use std::time::Instant;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::channel;

    #[derive(Default)]
    struct Collected {
        trials: usize,
        jobs: Vec<JobResult>,
    }

    impl RunRecorder for Collected {
        fn record_trial(&mut self, _: &Job, _: &ClosedTrial) -> Result<(), Box<dyn Error>> {
            self.trials += 1;
            Ok(())
        }

        fn record_job(&mut self, result: &JobResult) -> Result<(), Box<dyn Error>> {
            self.jobs.push(result.clone());
            Ok(())
        }
    }

    fn two_job_sweep() -> Sweep {
        Sweep::new(
            GainRange::new(1.0, 2.0, 1.0),
            GainRange::single(0.0),
            GainRange::single(0.0),
            &ParameterSet::default(),
        )
        .unwrap()
    }

    /// 20 s of gentle oscillation at 100 Hz.
    fn gentle_run() -> Vec<RawSample> {
        (0..=2000)
            .map(|i| {
                let t = i as f64 * 10.0;
                RawSample::at(t, 0.5 * (2.0 * PI * 0.8 * t / 1000.0).sin())
            })
            .collect()
    }

    #[test]
    fn test_failed_verification_is_skipped() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.echo_for_kp = Some(vec![2.0]);
        robot.on_csv = gentle_run().into_iter().map(DeviceLine::Telemetry).collect();
        let mut controller = Controller::new(robot, rx, &fast_config());

        let mut scheduler = Scheduler::new(two_job_sweep(), &fast_config())
            .with_trial_duration(Duration::from_millis(500));
        let mut recorder = Collected::default();
        let results = scheduler.run(&mut controller, &mut recorder).to_vec();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].result.score, FAILURE_SCORE);
        assert!(matches!(results[0].outcome, JobOutcome::VerifyFailed(_)));

        let expected = ScoringEngine::default().score(&gentle_run());
        assert_eq!(results[1].outcome, JobOutcome::Scored);
        assert_eq!(results[1].result, expected);
        assert!(results[1].result.score > 0.0);

        assert_eq!(scheduler.state(), &SchedulerState::Done);
        assert_eq!(scheduler.advances(), 2);
        assert_eq!(recorder.trials, 1);
        assert_eq!(recorder.jobs, results);
        assert_eq!(scheduler.best().map(|(p, _)| p.kp), Some(2.0));
    }

    #[test]
    fn test_silent_robot_trips_the_watchdog() {
        let mut config = fast_config();
        config.trial.onboard_scoring = true;

        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![DeviceLine::Telemetry(RawSample::at(0.0, 0.0))];
        let mut controller = Controller::new(robot, rx, &config);

        let mut scheduler =
            Scheduler::new(two_job_sweep(), &config).with_trial_duration(Duration::from_millis(20));
        let results = scheduler.run(&mut controller, &mut NoRecorder);

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.outcome == JobOutcome::NoDeviceScore && r.result.score == FAILURE_SCORE));
        assert_eq!(scheduler.state(), &SchedulerState::Done);
        assert_eq!(scheduler.best(), None);
    }

    #[test]
    fn test_device_score_is_used() {
        let mut config = fast_config();
        config.trial.onboard_scoring = true;

        let reported = ScoreResult {
            score: 640.0,
            valid_time: 19.5,
            total_duration: 20.0,
            ..ScoreResult::neutral()
        };
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![
            DeviceLine::Telemetry(RawSample::at(0.0, 0.0)),
            DeviceLine::ScoreResult(reported),
        ];
        let mut controller = Controller::new(robot, rx, &config);

        let sweep = Sweep::new(
            GainRange::single(1.0),
            GainRange::single(0.0),
            GainRange::single(0.0),
            &ParameterSet::default(),
        )
        .unwrap();
        let mut scheduler = Scheduler::new(sweep, &config).with_trial_duration(Duration::from_millis(20));
        let results = scheduler.run(&mut controller, &mut NoRecorder);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, reported);
    }

    #[test]
    fn test_cancel_stops_the_sweep() {
        let (tx, rx) = channel();
        let mut controller = Controller::new(FakeRobot::new(tx), rx, &fast_config());
        let mut scheduler = Scheduler::new(two_job_sweep(), &fast_config());

        assert!(matches!(
            scheduler.step(&mut controller, &mut NoRecorder),
            SchedulerState::VerifyParams(_)
        ));
        controller.cancel_token().store(true, Ordering::SeqCst);
        scheduler.run(&mut controller, &mut NoRecorder);

        assert_eq!(scheduler.state(), &SchedulerState::Cancelled);
        assert!(scheduler.results().is_empty());
        assert_eq!(scheduler.advances(), 1);
    }

    #[test]
    fn test_cancel_during_trial() {
        let (tx, rx) = channel();
        let mut robot = FakeRobot::new(tx);
        robot.on_csv = vec![DeviceLine::Telemetry(RawSample::at(0.0, 0.5))];
        let mut controller = Controller::new(robot, rx, &fast_config());
        let mut scheduler =
            Scheduler::new(two_job_sweep(), &fast_config()).with_trial_duration(Duration::from_secs(10));

        let token = controller.cancel_token();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            token.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        scheduler.run(&mut controller, &mut NoRecorder);
        let took = started.elapsed();
        canceller.join().unwrap();

        assert!(took < Duration::from_secs(1), "took {:?}", took);
        assert_eq!(scheduler.state(), &SchedulerState::Cancelled);
        assert!(scheduler.results().is_empty());
        assert!(!controller.trial_running());
        assert_eq!(controller.sink().count(&Command::CsvOn), 1);
        assert_eq!(controller.sink().count(&Command::CsvOff), 1);
    }
}
