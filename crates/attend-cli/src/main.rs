use anyhow::{bail, Context, Result};
use attend_lib::{
    config::{read_config, ExperimentConfig},
    io::read_sink,
    recorder::Recorder,
    source::{EegSource, GazeSource, StreamSource, SyntheticEeg, SyntheticGaze, TcpGazeTransport},
};
use attend_run::{
    controller::{DeviceOpener, TrialController},
    plan::read_trials,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use serde_json::json;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Parser)]
#[command(
    name = "attend",
    version,
    about = "Synchronized EEG and eye-tracking recorder for auditory attention trials"
)]
struct Cli {
    /// Logging verbosity (e.g., debug, info, warn)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trials of a plan, recording every enabled stream during playback
    Record {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        trials: PathBuf,
        /// Run only this trial number
        #[arg(long)]
        trial: Option<usize>,
        /// Overrides `recorder.save_dir`
        #[arg(long)]
        out: Option<PathBuf>,
        /// Use simulated EEG and gaze providers and headless playback
        #[arg(long)]
        synthetic: bool,
    },
    /// Record synthetic streams for a fixed time and print the session report as JSON
    Simulate {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 500)]
        duration_ms: u64,
        #[arg(long, default_value_t = 8)]
        channels: usize,
        #[arg(long, default_value_t = 512)]
        sr: u32,
        #[arg(long)]
        no_gaze: bool,
    },
    /// Print the records of a stream file as JSON lines
    Dump {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List audio output devices in playback index order
    Devices,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();
    match cli.command {
        Commands::Record {
            config,
            trials,
            trial,
            out,
            synthetic,
        } => cmd_record(&config, &trials, trial, out, synthetic)?,
        Commands::Simulate {
            out,
            duration_ms,
            channels,
            sr,
            no_gaze,
        } => cmd_simulate(&out, duration_ms, channels, sr, no_gaze)?,
        Commands::Dump { input, limit } => cmd_dump(&input, limit)?,
        Commands::Devices => cmd_devices()?,
    }
    Ok(())
}

fn build_sources(
    config: &ExperimentConfig,
    synthetic: bool,
    seed: u64,
) -> Result<Vec<Box<dyn StreamSource>>> {
    let mut sources: Vec<Box<dyn StreamSource>> = Vec::new();
    if config.eeg.enabled {
        if synthetic {
            let mut eeg = SyntheticEeg::new(8, f64::from(config.recorder.sr_eeg));
            eeg.seed = seed;
            sources.push(Box::new(EegSource::new(
                eeg,
                config.eeg.clone(),
                &config.recorder,
            )));
        } else {
            sources.push(live_eeg(config)?);
        }
    }
    if config.gaze.enabled {
        let verbose = config.recorder.verbose;
        if synthetic {
            sources.push(Box::new(GazeSource::new(
                SyntheticGaze::new(100.0, seed),
                &config.gaze,
                verbose,
            )));
        } else {
            sources.push(Box::new(GazeSource::new(
                TcpGazeTransport::from_config(&config.gaze),
                &config.gaze,
                verbose,
            )));
        }
    }
    Ok(sources)
}

#[cfg(feature = "lsl")]
fn live_eeg(config: &ExperimentConfig) -> Result<Box<dyn StreamSource>> {
    Ok(Box::new(EegSource::new(
        attend_lib::source::LslResolver::new(),
        config.eeg.clone(),
        &config.recorder,
    )))
}

#[cfg(not(feature = "lsl"))]
fn live_eeg(_config: &ExperimentConfig) -> Result<Box<dyn StreamSource>> {
    bail!("this build has no LSL support; rebuild with `--features lsl` or pass --synthetic")
}

#[cfg(feature = "audio")]
fn output_devices(synthetic: bool) -> Option<DeviceOpener> {
    use attend_run::playback::{CpalDevice, OutputDevice};
    if synthetic {
        return None;
    }
    Some(Box::new(|index| {
        Ok(Box::new(CpalDevice::open(index)?) as Box<dyn OutputDevice>)
    }))
}

#[cfg(not(feature = "audio"))]
fn output_devices(synthetic: bool) -> Option<DeviceOpener> {
    if !synthetic {
        warn!("built without the `audio` feature; stimuli are timed but not played");
    }
    None
}

fn cmd_record(
    config_path: &Path,
    trials_path: &Path,
    only: Option<usize>,
    out: Option<PathBuf>,
    synthetic: bool,
) -> Result<()> {
    let config = read_config(config_path)?;
    let mut trials = read_trials(trials_path)?;
    if let Some(number) = only {
        trials.retain(|trial| trial.trial == number);
        if trials.is_empty() {
            bail!("trial {number} is not in {}", trials_path.display());
        }
    }
    let root = out.unwrap_or_else(|| config.recorder.save_dir.clone());
    let mut controller = TrialController::new(Recorder::new(config.recorder.clone()), root)
        .with_slots(config.playback.devices.clone());
    if let Some(devices) = output_devices(synthetic) {
        controller = controller.with_devices(devices);
    }

    let mut lost = 0;
    for trial in &trials {
        let sources = build_sources(&config, synthetic, trial.trial as u64)?;
        let outcome = controller
            .run_trial(trial, sources)
            .with_context(|| format!("trial {}", trial.trial))?;
        if outcome.manifest.stop_error.is_some() {
            lost += 1;
        } else if !outcome.is_clean() {
            warn!("trial {} finished degraded; see {}", trial.trial, outcome.dir.display());
        }
        println!("{}", serde_json::to_string(&outcome.manifest)?);
    }
    if lost > 0 {
        bail!("{lost} of {} trials did not stop cleanly", trials.len());
    }
    info!("{} trial(s) recorded under {}", trials.len(), controller.root().display());
    Ok(())
}

fn cmd_simulate(
    out: &Path,
    duration_ms: u64,
    channels: usize,
    sr: u32,
    no_gaze: bool,
) -> Result<()> {
    let mut config = ExperimentConfig::default();
    config.recorder.sr_eeg = sr;
    config.recorder.verbose = false;
    config.recorder.validate()?;

    let mut eeg = SyntheticEeg::new(channels, f64::from(sr));
    eeg.seed = 1;
    let mut sources: Vec<Box<dyn StreamSource>> = vec![Box::new(EegSource::new(
        eeg,
        config.eeg.clone(),
        &config.recorder,
    ))];
    if !no_gaze {
        sources.push(Box::new(GazeSource::new(
            SyntheticGaze::new(100.0, 1),
            &config.gaze,
            false,
        )));
    }

    let recorder = Recorder::new(config.recorder.clone());
    let session = recorder.begin(out, sources)?;
    std::thread::sleep(Duration::from_millis(duration_ms));
    let report = recorder.stop(session)?;
    let failures: Vec<_> = report
        .failures
        .iter()
        .map(|failure| {
            json!({
                "kind": failure.kind,
                "source": failure.source,
                "error": failure.error.to_string(),
            })
        })
        .collect();
    let summary = json!({
        "dir": report.output_dir,
        "degraded": report.degraded(),
        "streams": report.loops,
        "failures": failures,
    });
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_dump(input: &Path, limit: Option<usize>) -> Result<()> {
    let samples = read_sink(input)?;
    let take = limit.unwrap_or(samples.len());
    for sample in samples.iter().take(take) {
        println!("{}", serde_json::to_string(sample)?);
    }
    Ok(())
}

#[cfg(feature = "audio")]
fn cmd_devices() -> Result<()> {
    for (index, name) in attend_run::playback::list_output_devices()?
        .iter()
        .enumerate()
    {
        println!("{index}\t{name}");
    }
    Ok(())
}

#[cfg(not(feature = "audio"))]
fn cmd_devices() -> Result<()> {
    bail!("this build has no audio output; rebuild with `--features audio`")
}
