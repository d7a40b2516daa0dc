//! Null (silent) output device
//!
//! Accepts any parameters and discards every sample. With `realtime` set,
//! each write sleeps for one period so the playback loop takes as long as it
//! would on real hardware. Used for dry runs (`--backend null`) and on
//! machines without an audio device.

use std::thread;
use std::time::Duration;

use super::device::{
    AccessMode, DeviceError, HwConfig, NegotiationStage, PcmBackend, PcmDevice, SampleFormat,
    WriteError,
};

/// Silent device that discards all audio
pub struct NullDevice {
    /// Name the device was opened under
    name: String,
    /// Frames per period reported at commit
    period_frames: usize,
    /// Sleep one period per write
    realtime: bool,
    channels: u16,
    rate: u32,
    /// Set by commit; writes before that are rejected
    committed: bool,
    /// Total frames accepted
    frames_written: u64,
    closed: bool,
}

impl NullDevice {
    pub fn new(name: &str, period_frames: usize, realtime: bool) -> Self {
        Self {
            name: name.to_string(),
            period_frames,
            realtime,
            channels: 0,
            rate: 0,
            committed: false,
            frames_written: 0,
            closed: false,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PcmDevice for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_access(&mut self, access: AccessMode) -> Result<(), DeviceError> {
        match access {
            AccessMode::Interleaved => Ok(()),
            AccessMode::NonInterleaved => Err(DeviceError::negotiation(
                NegotiationStage::Access,
                "only interleaved access is supported",
            )),
        }
    }

    fn set_format(&mut self, _format: SampleFormat) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_channels(&mut self, channels: u16) -> Result<(), DeviceError> {
        if channels == 0 {
            return Err(DeviceError::negotiation(
                NegotiationStage::Channels,
                "zero channels",
            ));
        }
        self.channels = channels;
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
        if rate == 0 {
            return Err(DeviceError::negotiation(NegotiationStage::Rate, "zero rate"));
        }
        self.rate = rate;
        Ok(rate)
    }

    fn commit(&mut self) -> Result<HwConfig, DeviceError> {
        if self.channels == 0 || self.rate == 0 {
            return Err(DeviceError::negotiation(
                NegotiationStage::Commit,
                "channels and rate must be set before commit",
            ));
        }
        self.committed = true;
        Ok(HwConfig::from_frames(self.period_frames, self.rate))
    }

    fn write_interleaved(&mut self, _buf: &[u8], frames: usize) -> Result<usize, WriteError> {
        if !self.committed || self.closed {
            return Err(WriteError::Device("device not prepared".to_string()));
        }
        if self.realtime && self.rate > 0 {
            let micros = frames as u64 * 1_000_000 / self.rate as u64;
            thread::sleep(Duration::from_micros(micros));
        }
        self.frames_written += frames as u64;
        Ok(frames)
    }

    fn recover_from_underrun(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        self.committed = false;
        Ok(())
    }
}

/// Backend that hands out `NullDevice`s under any name
#[derive(Debug, Clone, Copy)]
pub struct NullBackend {
    pub period_frames: usize,
    pub realtime: bool,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self {
            period_frames: 1024,
            realtime: true,
        }
    }
}

impl PcmBackend for NullBackend {
    type Device = NullDevice;

    fn open(&self, name: &str) -> Result<NullDevice, DeviceError> {
        log::debug!("opening null PCM device \"{}\"", name);
        Ok(NullDevice::new(name, self.period_frames, self.realtime))
    }
}
