use std::process::ExitCode;

use alarm_rust::config::{self, AlarmConfig, BackendKind};
use alarm_rust::logging;
use alarm_rust::schedule;
use alarm_rust::sound::{CpalBackend, NullBackend, PlaybackWorker};
use alarm_rust::threading::CancelToken;
use alarm_rust::Cli;
use anyhow::{Context, Result};
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.log_level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = logging::init(level, cli.log_file.as_deref()) {
        eprintln!("{:#}", e);
        return ExitCode::from(2);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let options = config::load_env().context("Failed to read configuration from environment")?;
    let options = cli.merge_into_options(options)?;
    let config = AlarmConfig::from_options(options)?;

    log::info!("Configuration:");
    log::info!("  Alarm: {}", config.alarm);
    log::info!("  Sound: {}", config.sound_path.display());
    log::info!("  Duration: {} s", config.duration_secs);
    log::info!("  Device: {} ({:?})", config.device_name, config.backend);

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_cancel.cancel()) {
        log::warn!("can't install Ctrl-C handler: {}", e);
    }

    if !config.skip_wait && !schedule::wait_for_alarm(config.alarm, &cancel) {
        log::info!("interrupted before the alarm went off");
        return Ok(());
    }

    let worker = spawn_worker(&config, cancel).context("Failed to start playback")?;
    println!("{}", config.message);

    let report = worker
        .join()
        .context("Playback thread failed")?
        .context("Alarm playback failed")?;
    if report.cancelled {
        log::info!("alarm silenced");
    }
    if report.underruns > 0 || report.write_errors > 0 {
        log::warn!(
            "playback finished with {} underruns and {} write errors",
            report.underruns,
            report.write_errors
        );
    }
    Ok(())
}

fn spawn_worker(config: &AlarmConfig, cancel: CancelToken) -> Result<PlaybackWorker> {
    let request = config.playback_request();
    let worker = match config.backend {
        BackendKind::Cpal => PlaybackWorker::spawn_with_cancel(
            CpalBackend {
                preferred_period_frames: config.period_frames,
                ..CpalBackend::default()
            },
            request,
            cancel,
        )?,
        BackendKind::Null => PlaybackWorker::spawn_with_cancel(
            NullBackend {
                period_frames: config.period_frames,
                realtime: true,
            },
            request,
            cancel,
        )?,
    };
    Ok(worker)
}
