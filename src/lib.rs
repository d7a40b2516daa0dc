// Alarm clock with WAV playback over a PCM output device

pub mod cli;
pub mod config;
pub mod logging;
pub mod schedule;
pub mod sound;
pub mod threading;

pub use cli::Cli;
pub use config::{AlarmConfig, BackendKind, Options};
pub use logging::LogLevel;
pub use schedule::AlarmTime;
