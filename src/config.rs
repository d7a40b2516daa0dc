use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::schedule::AlarmTime;
use crate::sound::device::DEFAULT_DEVICE_NAME;
use crate::sound::session::PlaybackRequest;

pub const ENV_HOUR: &str = "HOUR";
pub const ENV_MINUTE: &str = "MIN";
pub const ENV_MESSAGE: &str = "MSG";
pub const ENV_SOUND: &str = "ALARM_SOUND";
pub const ENV_SECONDS: &str = "ALARM_SECONDS";
pub const ENV_DEVICE: &str = "ALARM_DEVICE";
pub const ENV_BACKEND: &str = "ALARM_BACKEND";

pub const DEFAULT_MESSAGE: &str = "!!! ALARM !!!";
pub const DEFAULT_SOUND_PATH: &str = "assets/alarm.wav";
pub const DEFAULT_DURATION_SECS: u32 = 10;
pub const DEFAULT_PERIOD_FRAMES: usize = 1024;

/// Options that can be set via environment or CLI
///
/// Every field is optional here; `AlarmConfig::from_options` fills in
/// defaults and rejects a missing alarm time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub message: Option<String>,
    pub sound_path: Option<PathBuf>,
    pub duration_secs: Option<u32>,
    pub device_name: Option<String>,
    pub backend: Option<BackendKind>,

    // Commandline-only options
    pub period_frames: Option<usize>,
    pub skip_wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Host audio through cpal
    #[default]
    Cpal,
    /// Discard samples, keep timing
    Null,
}

/// Fully resolved, immutable alarm configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmConfig {
    pub alarm: AlarmTime,
    pub message: String,
    pub sound_path: PathBuf,
    pub duration_secs: u32,
    pub device_name: String,
    pub backend: BackendKind,
    pub period_frames: usize,
    pub skip_wait: bool,
}

impl AlarmConfig {
    /// Apply defaults to `opts`.
    ///
    /// # Errors
    /// Fails if the hour or minute was never set.
    pub fn from_options(opts: Options) -> Result<Self> {
        let hour = opts
            .hour
            .with_context(|| format!("alarm hour not set ({} or --hour)", ENV_HOUR))?;
        let minute = opts
            .minute
            .with_context(|| format!("alarm minute not set ({} or --minute)", ENV_MINUTE))?;

        Ok(Self {
            alarm: AlarmTime { hour, minute },
            message: opts.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            sound_path: opts
                .sound_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOUND_PATH)),
            duration_secs: opts.duration_secs.unwrap_or(DEFAULT_DURATION_SECS),
            device_name: opts
                .device_name
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            backend: opts.backend.unwrap_or_default(),
            period_frames: opts.period_frames.unwrap_or(DEFAULT_PERIOD_FRAMES),
            skip_wait: opts.skip_wait,
        })
    }

    pub fn playback_request(&self) -> PlaybackRequest {
        PlaybackRequest {
            sound_path: self.sound_path.clone(),
            duration_secs: self.duration_secs,
            device_name: self.device_name.clone(),
        }
    }
}

/// Load options from the process environment
pub fn load_env() -> Result<Options> {
    load_env_with(|key| env::var(key).ok())
}

/// Load options through `lookup`; unset and blank variables are skipped.
pub fn load_env_with<F>(lookup: F) -> Result<Options>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut opts = Options::default();

    if let Some(v) = get(ENV_HOUR) {
        opts.hour = Some(parse_hour(&v).with_context(|| format!("Invalid {}", ENV_HOUR))?);
    }
    if let Some(v) = get(ENV_MINUTE) {
        opts.minute = Some(parse_minute(&v).with_context(|| format!("Invalid {}", ENV_MINUTE))?);
    }
    // the message is taken verbatim
    opts.message = lookup(ENV_MESSAGE).filter(|v| !v.is_empty());
    opts.sound_path = get(ENV_SOUND).map(PathBuf::from);
    if let Some(v) = get(ENV_SECONDS) {
        opts.duration_secs =
            Some(parse_seconds(&v).with_context(|| format!("Invalid {}", ENV_SECONDS))?);
    }
    opts.device_name = get(ENV_DEVICE);
    if let Some(v) = get(ENV_BACKEND) {
        opts.backend = Some(parse_backend(&v).with_context(|| format!("Invalid {}", ENV_BACKEND))?);
    }

    Ok(opts)
}

/// Parse an hour of the day (0-23)
pub fn parse_hour(s: &str) -> Result<u32> {
    let hour: u32 = s.trim().parse().context("Invalid hour value")?;
    if hour > 23 {
        anyhow::bail!("Hour out of range (0 to 23): {}", hour);
    }
    Ok(hour)
}

/// Parse a minute of the hour (0-59)
pub fn parse_minute(s: &str) -> Result<u32> {
    let minute: u32 = s.trim().parse().context("Invalid minute value")?;
    if minute > 59 {
        anyhow::bail!("Minute out of range (0 to 59): {}", minute);
    }
    Ok(minute)
}

/// Parse a playback duration in seconds
pub fn parse_seconds(s: &str) -> Result<u32> {
    let secs: u32 = s.trim().parse().context("Invalid duration value")?;
    if secs == 0 {
        anyhow::bail!("Duration must be at least one second");
    }
    Ok(secs)
}

pub fn parse_period_frames(s: &str) -> Result<usize> {
    let frames: usize = s.trim().parse().context("Invalid period size")?;
    if frames == 0 {
        anyhow::bail!("Period size must be positive");
    }
    Ok(frames)
}

pub fn parse_backend(s: &str) -> Result<BackendKind> {
    match s.trim().to_lowercase().as_str() {
        "cpal" => Ok(BackendKind::Cpal),
        "null" | "none" => Ok(BackendKind::Null),
        _ => anyhow::bail!("Invalid audio backend: {}. Valid options: cpal, null", s),
    }
}
