//! PCM output device abstraction and parameter negotiation
//!
//! A `PcmDevice` exposes the hardware-parameter steps of a blocking PCM
//! playback interface (access mode, sample format, channels, nearest rate,
//! commit) plus interleaved writes and underrun recovery. `negotiate` drives
//! those steps in order and reports the parameters the device actually
//! granted. Backends (`cpal_backend`, `null`) implement `PcmBackend` to open
//! devices by name.

use std::fmt;

use thiserror::Error;

/// Bytes per sample for the only supported sample format
pub const BYTES_PER_SAMPLE: usize = 2;

/// Device name that selects the backend's default output
pub const DEFAULT_DEVICE_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Samples for each frame stored channel after channel
    Interleaved,
    /// One block per channel
    NonInterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian
    S16Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => BYTES_PER_SAMPLE,
        }
    }
}

/// Negotiation step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    Access,
    Format,
    Channels,
    Rate,
    Commit,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStage::Access => "access mode",
            NegotiationStage::Format => "sample format",
            NegotiationStage::Channels => "channel count",
            NegotiationStage::Rate => "sample rate",
            NegotiationStage::Commit => "hardware parameters",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("can't open \"{name}\" PCM device: {reason}")]
    OpenFailed { name: String, reason: String },
    #[error("can't set {stage}: {reason}")]
    NegotiationFailed {
        stage: NegotiationStage,
        reason: String,
    },
    #[error("PCM device error: {0}")]
    Backend(String),
}

impl DeviceError {
    pub fn open_failed(name: &str, reason: impl fmt::Display) -> Self {
        DeviceError::OpenFailed {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn negotiation(stage: NegotiationStage, reason: impl fmt::Display) -> Self {
        DeviceError::NegotiationFailed {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result of a single interleaved write
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The device ran dry before the write arrived (XRUN)
    #[error("buffer underrun")]
    Underrun,
    #[error("can't write to PCM device: {0}")]
    Device(String),
}

/// Period configuration reported by the device after commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub period_frames: usize,
    pub period_time_micros: u32,
}

impl HwConfig {
    /// Derive the period time from a frame count and rate, rounded to the
    /// nearest microsecond.
    pub fn from_frames(period_frames: usize, rate: u32) -> Self {
        let micros = if rate == 0 {
            0
        } else {
            (period_frames as u64 * 1_000_000 + rate as u64 / 2) / rate as u64
        };
        Self {
            period_frames,
            period_time_micros: micros.min(u32::MAX as u64) as u32,
        }
    }
}

/// What the caller asks the device for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwRequest {
    pub access: AccessMode,
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

impl HwRequest {
    /// Interleaved S16LE with the stream's channel count and rate
    pub fn s16_interleaved(channels: u16, sample_rate: u32) -> Self {
        Self {
            access: AccessMode::Interleaved,
            format: SampleFormat::S16Le,
            channels,
            sample_rate,
        }
    }
}

/// Parameters the device actually granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedDeviceParams {
    pub access: AccessMode,
    pub format: SampleFormat,
    pub channels: u16,
    pub granted_rate: u32,
    pub period_frames: usize,
    pub period_time_micros: u32,
}

impl NegotiatedDeviceParams {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// Size of one period's worth of interleaved samples
    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.bytes_per_frame()
    }
}

/// A PCM playback device.
///
/// The hardware-parameter setters are called in order by `negotiate` before
/// `commit`. Implementations are used from a single thread and need not be
/// `Send`.
pub trait PcmDevice {
    /// Name the device was opened with
    fn name(&self) -> &str;

    fn set_access(&mut self, access: AccessMode) -> Result<(), DeviceError>;

    fn set_format(&mut self, format: SampleFormat) -> Result<(), DeviceError>;

    fn set_channels(&mut self, channels: u16) -> Result<(), DeviceError>;

    /// Request a rate; the device picks the nearest it supports and returns it.
    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError>;

    /// Apply the parameters and start the stream.
    fn commit(&mut self) -> Result<HwConfig, DeviceError>;

    /// Write `frames` interleaved frames from `buf`.
    ///
    /// Returns the number of frames accepted.
    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, WriteError>;

    /// Re-prepare the stream after `WriteError::Underrun`.
    fn recover_from_underrun(&mut self) -> Result<(), DeviceError>;

    /// Block until everything written so far has been played.
    fn drain(&mut self) -> Result<(), DeviceError>;

    /// Discard anything written but not yet played.
    fn drop_pending(&mut self) -> Result<(), DeviceError>;

    /// Release the device. Called exactly once per opened device.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens devices by name
pub trait PcmBackend {
    type Device: PcmDevice;

    fn open(&self, name: &str) -> Result<Self::Device, DeviceError>;
}

/// Negotiate `request` against `device` and return the granted parameters.
pub fn negotiate<D: PcmDevice + ?Sized>(
    device: &mut D,
    request: &HwRequest,
) -> Result<NegotiatedDeviceParams, DeviceError> {
    device.set_access(request.access)?;
    device.set_format(request.format)?;
    device.set_channels(request.channels)?;
    let granted_rate = device.set_rate_near(request.sample_rate)?;
    if granted_rate != request.sample_rate {
        log::info!(
            "{}: requested {} Hz, device granted {} Hz",
            device.name(),
            request.sample_rate,
            granted_rate
        );
    }
    let hw = device.commit()?;

    if hw.period_frames == 0 {
        return Err(DeviceError::negotiation(
            NegotiationStage::Commit,
            "device reported an empty period",
        ));
    }

    let params = NegotiatedDeviceParams {
        access: request.access,
        format: request.format,
        channels: request.channels,
        granted_rate,
        period_frames: hw.period_frames,
        period_time_micros: hw.period_time_micros,
    };
    log::info!(
        "{}: channels={} ({}) rate={} Hz period={} frames / {} us",
        device.name(),
        params.channels,
        match params.channels {
            1 => "mono",
            2 => "stereo",
            _ => "multichannel",
        },
        params.granted_rate,
        params.period_frames,
        params.period_time_micros
    );
    Ok(params)
}
