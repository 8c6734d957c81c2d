//! Turns one closed trial into a single comparable number.
//!
//! The trace is first cut at the point where the robot's tilt first goes
//! past the oscillation ceiling; only what came before counts. Over that
//! valid window we measure how large the oscillation is, how fast it is,
//! whether it grew over the run and, when the firmware streams it, how far
//! the robot wandered. Each term is weighted by a coefficient in
//! [`ScoringConfig`] and subtracted from a base score.

use crate::protocol::RawSample;
use serde::{Deserialize, Serialize};

/// Score recorded for a job that never produced a usable trial.
pub const FAILURE_SCORE: f64 = -1000.0;

/// Every coefficient and threshold the scorer uses. None of these carry
/// meaning beyond "what worked on our robot", so they all live here rather
/// than inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Seconds dropped from the front of the trace before analysis
    pub settling_window_s: f64,
    /// Tilt magnitude, in degrees, that ends the valid window
    pub oscillation_ceiling_deg: f64,
    /// Valid windows shorter than this get `too_short_score`
    pub min_valid_duration_s: f64,
    /// Fixed score for a run that did not last long enough
    pub too_short_score: f64,
    /// Size of the first/last windows compared for degradation
    pub analysis_window_s: f64,
    /// Tilt magnitude a local extremum needs to count as a peak
    pub peak_height_deg: f64,
    /// Score a perfect run starts from
    pub base_score: f64,
    /// Penalty per degree of RMS tilt
    pub amplitude_penalty: f64,
    /// Oscillation frequency that goes unpunished
    pub free_frequency_hz: f64,
    /// Penalty per Hz above `free_frequency_hz`
    pub frequency_penalty: f64,
    /// Penalty per degree of RMS growth between first and last window
    pub degradation_penalty: f64,
    /// Penalty per unit of RMS position error
    pub position_penalty: f64,
    /// RMS tilt below which `low_amplitude_bonus` is awarded
    pub low_amplitude_deg: f64,
    /// Bonus for a very quiet run
    pub low_amplitude_bonus: f64,
    /// Frequency below which `low_frequency_bonus` is awarded
    pub low_frequency_hz: f64,
    /// Bonus for a slow, lazy oscillation
    pub low_frequency_bonus: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            settling_window_s: 0.0,
            oscillation_ceiling_deg: 15.0,
            min_valid_duration_s: 10.0,
            too_short_score: -500.0,
            analysis_window_s: 2.0,
            peak_height_deg: 0.5,
            base_score: 1000.0,
            amplitude_penalty: 30.0,
            free_frequency_hz: 1.0,
            frequency_penalty: 50.0,
            degradation_penalty: 50.0,
            position_penalty: 20.0,
            low_amplitude_deg: 1.0,
            low_amplitude_bonus: 50.0,
            low_frequency_hz: 0.5,
            low_frequency_bonus: 25.0,
        }
    }
}

/// Diagnostics behind a score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// RMS tilt over the valid window, in degrees
    pub amplitude_rms: f64,
    /// Dominant oscillation frequency, in Hz
    pub frequency: f64,
    /// RMS growth from the first to the last analysis window, in degrees
    pub degradation: f64,
    /// RMS of the position channel, zero when there is none
    pub position_rmse: f64,
}

/// The outcome of scoring one trial. Built once and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// The score, always within [-1000, 1000]
    pub score: f64,
    /// Seconds of the trial before the oscillation ceiling was crossed
    pub valid_time: f64,
    /// Seconds the trial recorded in total
    pub total_duration: f64,
    /// What the score was made of
    pub metrics: Metrics,
}

impl ScoreResult {
    /// The result for a trial without any samples.
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            valid_time: 0.0,
            total_duration: 0.0,
            metrics: Metrics::default(),
        }
    }

    /// The result recorded when a job could not be run or scored.
    pub fn failure() -> Self {
        Self {
            score: FAILURE_SCORE,
            ..Self::neutral()
        }
    }
}

/// The scoring algorithm, bound to one immutable configuration.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    /// Instantiates a scorer with the given coefficients.
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// The coefficients in use.
    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Scores a trial's samples, in arrival order.
    pub fn score(&self, samples: &[RawSample]) -> ScoreResult {
        let cfg = &self.config;
        let (first, last) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return ScoreResult::neutral(),
        };

        let t0 = first.time_ms;
        let rel = |s: &RawSample| (s.time_ms - t0) / 1000.0;
        let total_duration = rel(last);

        let settled = samples
            .iter()
            .position(|s| rel(s) >= cfg.settling_window_s)
            .unwrap_or(samples.len());
        let analysis = &samples[settled..];

        let cutoff = analysis
            .iter()
            .position(|s| s.pitch.abs() > cfg.oscillation_ceiling_deg)
            .unwrap_or(analysis.len());
        let window = &analysis[..cutoff];

        let valid_time = match (analysis.first(), analysis.get(cutoff), analysis.last()) {
            (Some(start), Some(cut), _) => rel(cut) - rel(start),
            (Some(start), None, Some(end)) => rel(end) - rel(start),
            _ => 0.0,
        };

        if window.is_empty() || valid_time < cfg.min_valid_duration_s {
            return ScoreResult {
                score: cfg.too_short_score.clamp(FAILURE_SCORE, -FAILURE_SCORE),
                valid_time,
                total_duration,
                metrics: Metrics::default(),
            };
        }

        let times: Vec<f64> = window.iter().map(rel).collect();
        let pitches: Vec<f64> = window.iter().map(|s| s.pitch).collect();
        let positions: Vec<f64> = window.iter().filter_map(|s| s.position).collect();

        let metrics = Metrics {
            amplitude_rms: rms(&pitches),
            frequency: dominant_frequency(&times, &pitches, cfg.peak_height_deg),
            degradation: degradation(&times, &pitches, cfg.analysis_window_s),
            position_rmse: rms(&positions),
        };

        ScoreResult {
            score: self.combine(&metrics),
            valid_time,
            total_duration,
            metrics,
        }
    }

    fn combine(&self, m: &Metrics) -> f64 {
        let cfg = &self.config;
        let mut score = cfg.base_score
            - m.amplitude_rms * cfg.amplitude_penalty
            - (m.frequency - cfg.free_frequency_hz).max(0.0) * cfg.frequency_penalty
            - m.degradation * cfg.degradation_penalty
            - m.position_rmse * cfg.position_penalty;

        if m.amplitude_rms < cfg.low_amplitude_deg {
            score += cfg.low_amplitude_bonus;
        }
        if m.frequency < cfg.low_frequency_hz {
            score += cfg.low_frequency_bonus;
        }
        score.clamp(FAILURE_SCORE, -FAILURE_SCORE)
    }
}

/// Root mean square, zero for an empty slice.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Frequency estimate from the spacing of tilt peaks. Peaks of both signs
/// are collected, so consecutive peaks are half a period apart. Zero if
/// fewer than two peaks stand out above `height`.
pub fn dominant_frequency(times: &[f64], pitches: &[f64], height: f64) -> f64 {
    if pitches.len() < 3 {
        return 0.0;
    }
    let peak_times: Vec<f64> = (1..pitches.len() - 1)
        .filter(|&i| {
            let (prev, p, next) = (pitches[i - 1], pitches[i], pitches[i + 1]);
            (p > height && p >= prev && p > next) || (p < -height && p <= prev && p < next)
        })
        .map(|i| times[i])
        .collect();

    if peak_times.len() < 2 {
        return 0.0;
    }
    let span = peak_times[peak_times.len() - 1] - peak_times[0];
    let mean_interval = span / (peak_times.len() - 1) as f64;
    if mean_interval <= 0.0 {
        return 0.0;
    }
    0.5 / mean_interval
}

/// How much the RMS tilt of the last `window_s` seconds exceeds that of the
/// first. Zero if the trace cannot hold two non-overlapping windows, or if
/// the robot calmed down rather than got worse.
pub fn degradation(times: &[f64], pitches: &[f64], window_s: f64) -> f64 {
    let (start, end) = match (times.first(), times.last()) {
        (Some(&start), Some(&end)) => (start, end),
        _ => return 0.0,
    };
    if window_s <= 0.0 || end - start < 2.0 * window_s {
        return 0.0;
    }

    let first: Vec<f64> = times
        .iter()
        .zip(pitches)
        .filter(|(t, _)| **t - start < window_s)
        .map(|(_, &p)| p)
        .collect();
    let last: Vec<f64> = times
        .iter()
        .zip(pitches)
        .filter(|(t, _)| end - **t < window_s)
        .map(|(_, &p)| p)
        .collect();

    (rms(&last) - rms(&first)).max(0.0)
}

/// Aggregates over several runs with the same parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    /// Number of runs
    pub num_runs: usize,
    /// Mean score
    pub avg_score: f64,
    /// Best score
    pub max_score: f64,
    /// Worst score
    pub min_score: f64,
    /// Mean valid time
    pub avg_valid_time: f64,
    /// Mean recorded duration
    pub avg_total_duration: f64,
    /// Mean RMS tilt
    pub avg_amplitude_rms: f64,
    /// Mean oscillation frequency
    pub avg_frequency: f64,
    /// Mean degradation
    pub avg_degradation: f64,
}

impl SessionStats {
    /// `None` for an empty session.
    pub fn from_results(results: &[ScoreResult]) -> Option<Self> {
        if results.is_empty() {
            return None;
        }
        let n = results.len() as f64;
        let mean = |f: fn(&ScoreResult) -> f64| results.iter().map(f).sum::<f64>() / n;

        Some(Self {
            num_runs: results.len(),
            avg_score: mean(|r| r.score),
            max_score: results.iter().map(|r| r.score).fold(f64::MIN, f64::max),
            min_score: results.iter().map(|r| r.score).fold(f64::MAX, f64::min),
            avg_valid_time: mean(|r| r.valid_time),
            avg_total_duration: mean(|r| r.total_duration),
            avg_amplitude_rms: mean(|r| r.metrics.amplitude_rms),
            avg_frequency: mean(|r| r.metrics.frequency),
            avg_degradation: mean(|r| r.metrics.degradation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const STEP_MS: f64 = 15.0;

    /// A trace of `secs` seconds sampled every 15 ms, tilt given by `f(t)`.
    fn trace(secs: f64, f: impl Fn(f64) -> f64) -> Vec<RawSample> {
        let n = (secs * 1000.0 / STEP_MS) as usize + 1;
        (0..n)
            .map(|i| {
                let t_ms = 5000.0 + i as f64 * STEP_MS;
                RawSample::at(t_ms, f((t_ms - 5000.0) / 1000.0))
            })
            .collect()
    }

    fn sine(amplitude: f64, hz: f64) -> impl Fn(f64) -> f64 {
        move |t| amplitude * (2.0 * PI * hz * t).sin()
    }

    #[test]
    fn test_empty_trial_is_neutral() {
        let res = ScoringEngine::default().score(&[]);
        assert_eq!(res.score, 0.0);
        assert_eq!(res.valid_time, 0.0);
        assert_eq!(res.total_duration, 0.0);
    }

    #[test]
    fn test_still_beats_oscillating() {
        let engine = ScoringEngine::default();
        let still = engine.score(&trace(20.0, |_| 0.0));
        let wobbly = engine.score(&trace(20.0, sine(5.0, 1.0)));

        assert!(still.valid_time >= 19.9);
        assert!(wobbly.valid_time >= 19.9);
        assert!(still.score > wobbly.score);
        assert_eq!(still.score, 1000.0);
        assert!((wobbly.metrics.amplitude_rms - 5.0 / 2f64.sqrt()).abs() < 0.1);
    }

    #[test]
    fn test_frequency_estimate() {
        let times: Vec<f64> = (0..2000).map(|i| i as f64 * 0.005).collect();
        let pitches: Vec<f64> = times.iter().map(|&t| sine(3.0, 2.0)(t)).collect();
        let hz = dominant_frequency(&times, &pitches, 0.5);
        assert!((hz - 2.0).abs() < 0.05, "got {hz}");

        let quiet: Vec<f64> = times.iter().map(|&t| sine(0.2, 2.0)(t)).collect();
        assert_eq!(dominant_frequency(&times, &quiet, 0.5), 0.0);
    }

    #[test]
    fn test_cutoff_shortens_valid_time_only() {
        let engine = ScoringEngine::default();
        // Fine for 12 s, then tips past the 15 degree ceiling.
        let samples = trace(20.0, |t| if t < 12.0 { 0.0 } else { 20.0 });
        let res = engine.score(&samples);
        assert!((res.valid_time - 12.0).abs() < 0.02, "got {}", res.valid_time);
        assert!((res.total_duration - 20.0).abs() < 0.02);
        assert!(res.score > 900.0);
    }

    #[test]
    fn test_too_short_gets_fixed_penalty() {
        let engine = ScoringEngine::default();
        let samples = trace(20.0, |t| if t < 4.0 { 0.0 } else { 18.0 });
        let res = engine.score(&samples);
        assert_eq!(res.score, engine.config().too_short_score);
        assert!(res.valid_time < 4.1);
        assert_eq!(res.metrics, Metrics::default());
    }

    #[test]
    fn test_settling_window_is_skipped() {
        let engine = ScoringEngine::new(ScoringConfig {
            settling_window_s: 3.0,
            ..ScoringConfig::default()
        });
        // Violent start that would otherwise cut the run at t=0.
        let samples = trace(20.0, |t| if t < 2.5 { 25.0 } else { 0.0 });
        let res = engine.score(&samples);
        assert!((res.total_duration - 20.0).abs() < 0.02);
        assert!((res.valid_time - 17.0).abs() < 0.05);
        assert_eq!(res.score, 1000.0);
    }

    #[test]
    fn test_degradation() {
        let times: Vec<f64> = (0..2000).map(|i| i as f64 * 0.01).collect();
        let growing: Vec<f64> = times
            .iter()
            .map(|&t| (0.5 + t * 0.25) * (2.0 * PI * t).sin())
            .collect();
        assert!(degradation(&times, &growing, 2.0) > 1.0);

        let calming: Vec<f64> = growing.iter().rev().copied().collect();
        assert_eq!(degradation(&times, &calming, 2.0), 0.0);

        assert_eq!(degradation(&times[..300], &growing[..300], 2.0), 0.0);
    }

    #[test]
    fn test_position_penalty() {
        let engine = ScoringEngine::default();
        let mut samples = trace(15.0, |_| 0.0);
        let base = engine.score(&samples);
        for s in samples.iter_mut() {
            s.position = Some(5.0);
        }
        let drifting = engine.score(&samples);
        assert!((drifting.metrics.position_rmse - 5.0).abs() < 1e-9);
        assert!(drifting.score < base.score);
    }

    #[test]
    fn test_score_is_clamped() {
        let engine = ScoringEngine::new(ScoringConfig {
            amplitude_penalty: 10_000.0,
            ..ScoringConfig::default()
        });
        let res = engine.score(&trace(15.0, sine(5.0, 1.0)));
        assert_eq!(res.score, FAILURE_SCORE);
    }

    #[test]
    fn test_session_stats() {
        assert_eq!(SessionStats::from_results(&[]), None);
        let a = ScoreResult {
            score: 800.0,
            valid_time: 20.0,
            total_duration: 20.0,
            metrics: Metrics::default(),
        };
        let b = ScoreResult {
            score: 400.0,
            valid_time: 10.0,
            ..a
        };
        let stats = SessionStats::from_results(&[a, b]).unwrap();
        assert_eq!(stats.num_runs, 2);
        assert_eq!(stats.avg_score, 600.0);
        assert_eq!(stats.max_score, 800.0);
        assert_eq!(stats.min_score, 400.0);
        assert_eq!(stats.avg_valid_time, 15.0);
    }
}
