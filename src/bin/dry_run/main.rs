//! Runs a small sweep against the simulated robot, end to end through the
//! same link, controller and scheduler a real session uses.

use balance_tuner::{
    args::DryRunArgs,
    config::TunerConfig,
    controller::Controller,
    link::{CommandSink, Link},
    params::ParameterSet,
    record::CsvRunLog,
    scheduler::{JobResult, NoRecorder, RunRecorder, Scheduler},
    score::SessionStats,
    sim::{SimSettings, SimulatedRobot},
    sweep::{GainRange, Sweep},
};

use clap::Parser;
use std::{error::Error, sync::mpsc, time::Duration};

fn axis(low: f64, high: f64, count: u32) -> GainRange {
    if count <= 1 {
        GainRange::single(low)
    } else {
        GainRange::new(low, high, (high - low) / (count - 1) as f64)
    }
}

fn sweep_with<S: CommandSink, R: RunRecorder>(
    scheduler: &mut Scheduler,
    controller: &mut Controller<S>,
    recorder: &mut R,
) -> Vec<JobResult> {
    scheduler.run(controller, recorder).to_vec()
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = DryRunArgs::parse();
    let speedup = args.speedup.max(1);

    let mut config = TunerConfig::default();
    config.protocol.inter_write_pause_ms = 5;
    config.trial.inter_job_pause_ms = 100;
    config.validate()?;

    let mut robot = SimulatedRobot::new(SimSettings {
        speedup,
        fallen_threshold_deg: config.trial.fallen_threshold_deg,
        scoring: config.scoring.clone(),
        ..SimSettings::default()
    });

    let (tx, rx) = mpsc::channel();
    let mut link = Link::start(robot.port(), config.link_settings(), tx);
    let mut controller = Controller::new(link.handle(), rx, &config);
    if !controller.wait_for_link(Duration::from_secs(1)) {
        return Err("the simulated robot never came up".into());
    }

    let n = args.jobs_per_axis;
    let sweep = Sweep::new(
        axis(1.0, 4.0, n),
        axis(0.0, 0.2, n),
        axis(0.1, 0.4, n),
        &ParameterSet::default(),
    )?;
    println!("dry run: {} jobs at {}x speed", sweep.len(), speedup);

    let mut scheduler =
        Scheduler::new(sweep, &config).with_trial_duration(config.trial_duration() / speedup);
    let results = match &args.log_dir {
        Some(dir) => sweep_with(&mut scheduler, &mut controller, &mut CsvRunLog::create(dir)?),
        None => sweep_with(&mut scheduler, &mut controller, &mut NoRecorder),
    };

    for r in &results {
        let reason = r.stop_reason.map_or("-", |reason| reason.as_str());
        println!(
            "{:>4}  {}  {:>8.1}  {:>6.2}s  {:<9} {}",
            r.job.index, r.job.params, r.result.score, r.result.valid_time, reason, r.outcome
        );
    }
    let scores: Vec<_> = results.iter().map(|r| r.result).collect();
    if let Some(stats) = SessionStats::from_results(&scores) {
        println!(
            "{} runs: avg {:.1}, best {:.1}, worst {:.1}",
            stats.num_runs, stats.avg_score, stats.max_score, stats.min_score
        );
    }
    if let Some((best, score)) = scheduler.best() {
        println!("best: {} scoring {:.1}", best, score);
    }

    link.stop();
    robot.stop();
    Ok(())
}
