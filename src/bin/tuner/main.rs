//! Operator front end for tuning a real robot over a serial port.

use balance_tuner::{
    args::{ApplyCommand, SweepCommand, TunerArgs, TunerCommand},
    config::TunerConfig,
    controller::{Controller, READ_PARAMS_TIMEOUT},
    link::{available_ports, Link, LinkHandle},
    params::ParameterSet,
    protocol::Command,
    record::CsvRunLog,
    scheduler::{JobOutcome, Scheduler},
    score::{ScoringEngine, SessionStats},
    store::ParamStore,
    sweep::{GainRange, Sweep},
};

use clap::Parser;
use log::{info, warn};
use std::{error::Error, sync::mpsc, time::Duration};

// Example:
// cargo run --bin tuner --
//                       --port /dev/ttyUSB0 sweep
//                       --kp   2.0 4.0 0.5
//                       --ki   0.0 0.0 1.0
//                       --kd   0.1 0.3 0.1
//                       --log  tuning_logs

/// How long to wait for the port to open before giving up.
const CONNECT_WAIT: Duration = Duration::from_secs(5);

/// How long to print replies after a raw command.
const REPLY_WINDOW: Duration = Duration::from_secs(1);

type Tuner = Controller<LinkHandle>;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = TunerArgs::parse();

    if let TunerCommand::Ports = args.command {
        println!("Available devices:");
        for port in available_ports()? {
            println!("\t{}", port.to_string_lossy());
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => TunerConfig::from_path(path)?,
        None => TunerConfig::default(),
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud = baud;
    }
    config.validate()?;

    let mut store = ParamStore::open(&args.store)?;

    let (tx, rx) = mpsc::channel();
    let mut link = Link::start(config.serial_connector(), config.link_settings(), tx);
    let mut tuner = Controller::new(link.handle(), rx, &config);

    let outcome = if tuner.wait_for_link(CONNECT_WAIT) {
        run(args.command, &config, &mut tuner, &mut store)
    } else {
        Err(format!("could not open {} within {:?}", config.serial.port, CONNECT_WAIT).into())
    };

    link.stop();
    outcome
}

fn run(
    command: TunerCommand,
    config: &TunerConfig,
    tuner: &mut Tuner,
    store: &mut ParamStore,
) -> Result<(), Box<dyn Error>> {
    match command {
        TunerCommand::Sweep(sweep) => run_sweep(sweep, config, tuner, store),
        TunerCommand::Apply(apply) => run_apply(apply, config, tuner, store),
        TunerCommand::Trial(trial) => {
            let duration = trial
                .duration
                .map_or_else(|| config.trial_duration(), Duration::from_secs_f64);
            let closed = tuner.run_trial(duration)?;
            let result = if config.trial.onboard_scoring {
                tuner
                    .await_device_score(config.score_watchdog())
                    .ok_or("the robot did not report a score")?
            } else {
                ScoringEngine::new(config.scoring.clone()).score(&closed.samples)
            };
            println!(
                "{} samples, stopped by {}, {} late",
                closed.samples.len(),
                closed.reason,
                closed.late_samples
            );
            println!(
                "score {:.1}, valid {:.2}s of {:.2}s, rms {:.3}, freq {:.3}Hz, degradation {:.3}",
                result.score,
                result.valid_time,
                result.total_duration,
                result.metrics.amplitude_rms,
                result.metrics.frequency,
                result.metrics.degradation
            );
            Ok(())
        }
        TunerCommand::Read => {
            match tuner.read_params(READ_PARAMS_TIMEOUT)? {
                Some(echo) => println!("{}", echo.to_set(&config.defaults)),
                None => warn!("the robot did not echo its parameters"),
            }
            Ok(())
        }
        TunerCommand::Send(send) => {
            tuner.send(Command::Raw(send.line))?;
            for line in tuner.listen(REPLY_WINDOW) {
                println!("{:?}", line);
            }
            Ok(())
        }
        TunerCommand::Ports => Ok(()),
    }
}

fn range(values: &[f64]) -> Result<GainRange, Box<dyn Error>> {
    match values {
        [start, end, step] => Ok(GainRange::new(*start, *end, *step)),
        _ => Err("a range needs exactly START END STEP".into()),
    }
}

fn run_sweep(
    args: SweepCommand,
    config: &TunerConfig,
    tuner: &mut Tuner,
    store: &mut ParamStore,
) -> Result<(), Box<dyn Error>> {
    let base = store.last_known_good_or(config.defaults);
    let sweep = Sweep::new(range(&args.kp)?, range(&args.ki)?, range(&args.kd)?, &base)?;
    info!("sweeping {} combinations", sweep.len());

    let mut scheduler = Scheduler::new(sweep, config);
    if let Some(secs) = args.duration {
        scheduler = scheduler.with_trial_duration(Duration::from_secs_f64(secs));
    }
    let mut log = CsvRunLog::create(&args.log_dir)?;
    let results = scheduler.run(tuner, &mut log).to_vec();

    for r in &results {
        println!("{:>4}  {}  {:>8.1}  {}", r.job.index, r.job.params, r.result.score, r.outcome);
    }
    let scored: Vec<_> = results
        .iter()
        .filter(|r| r.outcome == JobOutcome::Scored)
        .map(|r| r.result)
        .collect();
    if let Some(stats) = SessionStats::from_results(&scored) {
        println!(
            "{} scored runs: avg {:.1}, best {:.1}, worst {:.1}, avg valid {:.2}s",
            stats.num_runs, stats.avg_score, stats.max_score, stats.min_score, stats.avg_valid_time
        );
    }

    if let Some(confirmed) = results
        .iter()
        .rev()
        .find(|r| !matches!(r.outcome, JobOutcome::VerifyFailed(_)))
    {
        store.set_last_known_good(confirmed.job.params)?;
    }

    if let Some((best, score)) = scheduler.best() {
        println!("best: {} scoring {:.1}", best, score);
        store.offer_best(best, score)?;
        // Leave the robot on the winner.
        let applied = tuner.verify(best)?;
        store.set_last_known_good(applied)?;
    }
    println!("results written to {}", log.dir().display());
    Ok(())
}

fn run_apply(
    args: ApplyCommand,
    config: &TunerConfig,
    tuner: &mut Tuner,
    store: &mut ParamStore,
) -> Result<(), Box<dyn Error>> {
    let base = store.last_known_good_or(config.defaults);
    let params = ParameterSet {
        kp: args.kp,
        ki: args.ki,
        kd: args.kd,
        init_balance: args.init_balance.unwrap_or(base.init_balance),
        power_gain: args.power_gain.unwrap_or(base.power_gain),
    };

    let confirmed = tuner.verify(params)?;
    println!("confirmed {}", confirmed);
    store.set_last_known_good(confirmed)?;

    if args.save {
        tuner.send(Command::Save)?;
        for line in tuner.listen(REPLY_WINDOW) {
            println!("{:?}", line);
        }
    }
    Ok(())
}
