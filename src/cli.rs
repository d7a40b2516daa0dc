use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{
    parse_backend, parse_hour, parse_minute, parse_period_frames, parse_seconds, Options,
};
use crate::logging::LogLevel;

/// Play a WAV file through the sound card at a given time of day
///
/// Settings come from HOUR, MIN, MSG, ALARM_SOUND, ALARM_SECONDS,
/// ALARM_DEVICE and ALARM_BACKEND; command-line flags take precedence.
#[derive(Parser, Debug, Default)]
#[command(name = "alarm")]
#[command(version)]
#[command(about = "Wall-clock alarm with WAV playback", long_about = None)]
pub struct Cli {
    /// Alarm hour (0-23)
    #[arg(long, value_name = "HOUR")]
    pub hour: Option<String>,

    /// Alarm minute (0-59)
    #[arg(short, long, value_name = "MIN")]
    pub minute: Option<String>,

    /// Message printed when the alarm goes off
    #[arg(long, value_name = "TEXT")]
    pub message: Option<String>,

    /// 16-bit PCM WAV file to play
    #[arg(short, long, value_name = "FILE")]
    pub sound: Option<PathBuf>,

    /// How long to play, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub seconds: Option<String>,

    /// Output device name ("default" for the system default)
    #[arg(short, long, value_name = "NAME")]
    pub device: Option<String>,

    /// Audio backend (cpal, null)
    #[arg(short, long, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Preferred frames per device period
    #[arg(long, value_name = "FRAMES")]
    pub period_frames: Option<String>,

    /// Ring immediately instead of waiting for the alarm time
    #[arg(long)]
    pub now: bool,

    /// Log level (nothing, user, error, warning, info, debug, all)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Also append log output to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Merge CLI arguments into the options struct
    pub fn merge_into_options(&self, mut opts: Options) -> Result<Options> {
        if let Some(ref hour) = self.hour {
            opts.hour = Some(parse_hour(hour).context("Invalid --hour")?);
        }

        if let Some(ref minute) = self.minute {
            opts.minute = Some(parse_minute(minute).context("Invalid --minute")?);
        }

        if let Some(ref message) = self.message {
            opts.message = Some(message.clone());
        }

        if let Some(ref sound) = self.sound {
            opts.sound_path = Some(sound.clone());
        }

        if let Some(ref seconds) = self.seconds {
            opts.duration_secs = Some(parse_seconds(seconds).context("Invalid --seconds")?);
        }

        if let Some(ref device) = self.device {
            opts.device_name = Some(device.clone());
        }

        if let Some(ref backend) = self.backend {
            opts.backend = Some(parse_backend(backend)?);
        }

        if let Some(ref frames) = self.period_frames {
            opts.period_frames =
                Some(parse_period_frames(frames).context("Invalid --period-frames")?);
        }

        if self.now {
            opts.skip_wait = true;
        }

        Ok(opts)
    }

    /// Requested log level, `Info` if none was given
    pub fn log_level(&self) -> Result<LogLevel> {
        match self.log_level {
            Some(ref name) => Self::parse_log_level(name),
            None => Ok(LogLevel::Info),
        }
    }

    fn parse_log_level(s: &str) -> Result<LogLevel> {
        if let Ok(n) = s.parse::<i32>() {
            return Ok(LogLevel::from_i32(n));
        }
        LogLevel::from_name(s).with_context(|| {
            format!(
                "Invalid log level: {}. Valid options: nothing, user, error, warning, info, debug, all",
                s
            )
        })
    }
}
