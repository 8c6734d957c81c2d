//! Result files for a sweep: one `results.csv` with a row per job, and one
//! CSV per trial with every sample it recorded.

use crate::protocol::RawSample;
use crate::scheduler::{JobResult, RunRecorder};
use crate::sweep::Job;
use crate::trial::ClosedTrial;

use csv::{Writer, WriterBuilder};
use log::debug;
use serde::Serialize;
use std::{
    error::Error,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// One line of `results.csv`.
#[derive(Debug, Serialize)]
struct JobRow {
    timestamp: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    init_balance: f64,
    power_gain: f64,
    score: f64,
    valid_time: f64,
    total_duration: f64,
    outcome: &'static str,
}

/// One line of a per-trial sample file. A missing position is an empty field.
#[derive(Debug, Serialize)]
struct SampleRow {
    time_ms: f64,
    pitch: f64,
    pitch_rate: f64,
    balance_cmd: f64,
    p_term: f64,
    i_term: f64,
    d_term: f64,
    scaled_output: f64,
    position: Option<f64>,
}

impl From<&RawSample> for SampleRow {
    fn from(s: &RawSample) -> Self {
        Self {
            time_ms: s.time_ms,
            pitch: s.pitch,
            pitch_rate: s.pitch_rate,
            balance_cmd: s.balance_cmd,
            p_term: s.p_term,
            i_term: s.i_term,
            d_term: s.d_term,
            scaled_output: s.scaled_output,
            position: s.position,
        }
    }
}

/// Writes sweep results under one directory.
#[derive(Debug)]
pub struct CsvRunLog {
    dir: PathBuf,
    results: Writer<File>,
}

impl CsvRunLog {
    /// Opens (or creates) `dir/results.csv` for appending. The header row is
    /// only written when the file is new.
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join("results.csv");
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let results = WriterBuilder::new().has_headers(fresh).from_writer(file);
        Ok(Self { dir, results })
    }

    /// Where the files go.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The sample file name for `job`.
    pub fn trial_path(&self, job: &Job) -> PathBuf {
        let p = &job.params;
        self.dir.join(format!(
            "trial_{:03}_kp{:.3}_ki{:.3}_kd{:.3}.csv",
            job.index, p.kp, p.ki, p.kd
        ))
    }
}

impl RunRecorder for CsvRunLog {
    fn record_trial(&mut self, job: &Job, trial: &ClosedTrial) -> Result<(), Box<dyn Error>> {
        let path = self.trial_path(job);
        let mut out = Writer::from_path(&path)?;
        for sample in &trial.samples {
            out.serialize(SampleRow::from(sample))?;
        }
        out.flush()?;
        debug!("wrote {} samples to {}", trial.samples.len(), path.display());
        Ok(())
    }

    fn record_job(&mut self, result: &JobResult) -> Result<(), Box<dyn Error>> {
        let p = &result.job.params;
        let r = &result.result;
        self.results.serialize(JobRow {
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64(),
            kp: p.kp,
            ki: p.ki,
            kd: p.kd,
            init_balance: p.init_balance,
            power_gain: p.power_gain,
            score: r.score,
            valid_time: r.valid_time,
            total_duration: r.total_duration,
            outcome: result.outcome.label(),
        })?;
        self.results.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterSet;
    use crate::scheduler::JobOutcome;
    use crate::score::ScoreResult;
    use crate::trial::StopReason;
    use std::time::Duration;
    use tempfile::tempdir;

    fn job() -> Job {
        Job {
            index: 4,
            params: ParameterSet::gains(1.5, 0.0, 0.25),
        }
    }

    #[test]
    fn test_results_rows_append() {
        let dir = tempdir().unwrap();
        let result = JobResult {
            job: job(),
            result: ScoreResult::failure(),
            outcome: JobOutcome::VerifyFailed("no echo".to_owned()),
            stop_reason: None,
        };
        {
            let mut log = CsvRunLog::create(dir.path()).unwrap();
            log.record_job(&result).unwrap();
        }
        {
            let mut log = CsvRunLog::create(dir.path()).unwrap();
            log.record_job(&result).unwrap();
        }

        let text = fs::read_to_string(dir.path().join("results.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "timestamp,kp,ki,kd,init_balance,power_gain,score,valid_time,total_duration,outcome"
        );
        assert!(lines[1].ends_with(",1.5,0.0,0.25,0.0,0.0,-1000.0,0.0,0.0,verify_failed"));
        assert!(!lines[2].starts_with("timestamp"));
    }

    #[test]
    fn test_trial_samples_written() {
        let dir = tempdir().unwrap();
        let mut log = CsvRunLog::create(dir.path().join("run")).unwrap();
        let mut last = RawSample::at(10.0, -2.5);
        last.position = Some(0.75);
        let trial = ClosedTrial {
            samples: vec![RawSample::at(0.0, 1.0), last],
            reason: StopReason::Fallen,
            late_samples: 0,
            wall_duration: Duration::from_millis(10),
        };
        log.record_trial(&job(), &trial).unwrap();

        let path = log.trial_path(&job());
        assert!(path.ends_with("trial_004_kp1.500_ki0.000_kd0.250.csv"));
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "time_ms,pitch,pitch_rate,balance_cmd,p_term,i_term,d_term,scaled_output,position"
        );
        assert_eq!(lines[1], "0.0,1.0,0.0,0.0,0.0,0.0,0.0,0.0,");
        assert_eq!(lines[2], "10.0,-2.5,0.0,0.0,0.0,0.0,0.0,0.0,0.75");
    }
}
