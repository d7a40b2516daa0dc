//! Period-by-period streaming of PCM data to a negotiated device
//!
//! The loop runs a fixed number of iterations derived from the requested
//! duration and the device's period time, so wall-clock duration is kept even
//! when the source runs dry: a short read is padded with silence and still
//! counts as a full period.

use std::io::{self, Read};

use thiserror::Error;

use super::device::{NegotiatedDeviceParams, PcmDevice, WriteError};
use super::read_full;
use crate::threading::CancelToken;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to read alarm sound stream: {0}")]
    SourceIo(#[source] io::Error),
    #[error("device reported a zero period time")]
    InvalidPeriod,
}

/// Counters for one run of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Periods written (or attempted)
    pub iterations: u64,
    /// Underruns recovered
    pub underruns: u64,
    /// Non-fatal write failures
    pub write_errors: u64,
    /// Periods that were padded with silence
    pub short_reads: u64,
    /// Stopped early by the cancellation token
    pub cancelled: bool,
}

/// Number of periods needed to cover `duration_secs`.
///
/// Integer division; a partial trailing period is dropped.
pub fn loop_count(duration_secs: u32, period_time_micros: u32) -> Result<u64, PlaybackError> {
    if period_time_micros == 0 {
        return Err(PlaybackError::InvalidPeriod);
    }
    Ok(duration_secs as u64 * 1_000_000 / period_time_micros as u64)
}

/// One period of interleaved samples, reused every iteration
#[derive(Debug)]
pub struct PeriodBuffer {
    bytes: Vec<u8>,
}

impl PeriodBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fill the whole buffer from `source`.
    ///
    /// Returns the number of bytes actually read; anything past that is
    /// zeroed (silence). Stops early only at end of stream.
    pub fn fill_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let filled = read_full(source, &mut self.bytes)?;
        self.bytes[filled..].fill(0);
        Ok(filled)
    }
}

/// Streams a source to a device for a fixed number of periods
pub struct PlaybackLoop {
    params: NegotiatedDeviceParams,
    buffer: PeriodBuffer,
}

impl PlaybackLoop {
    pub fn new(params: NegotiatedDeviceParams) -> Self {
        Self {
            buffer: PeriodBuffer::new(params.period_bytes()),
            params,
        }
    }

    /// Play `duration_secs` worth of periods from `source` on `device`.
    ///
    /// Underruns are recovered and counted; other write errors are logged and
    /// counted. A source read error aborts the loop. `cancel` is checked
    /// before every period.
    pub fn run<D, R>(
        &mut self,
        device: &mut D,
        source: &mut R,
        duration_secs: u32,
        cancel: &CancelToken,
    ) -> Result<PlaybackReport, PlaybackError>
    where
        D: PcmDevice + ?Sized,
        R: Read + ?Sized,
    {
        let loops = loop_count(duration_secs, self.params.period_time_micros)?;
        let frames = self.params.period_frames;
        let mut report = PlaybackReport::default();

        log::debug!(
            "playing {} s as {} periods of {} frames on {}",
            duration_secs,
            loops,
            frames,
            device.name()
        );

        for _ in 0..loops {
            if cancel.is_cancelled() {
                log::info!(
                    "playback cancelled after {} of {} periods",
                    report.iterations,
                    loops
                );
                report.cancelled = true;
                break;
            }

            let read = self
                .buffer
                .fill_from(source)
                .map_err(PlaybackError::SourceIo)?;
            if read < self.buffer.len() {
                report.short_reads += 1;
            }

            match device.write_interleaved(self.buffer.as_bytes(), frames) {
                Ok(written) if written < frames => {
                    log::debug!("short write: {} of {} frames", written, frames);
                }
                Ok(_) => {}
                Err(WriteError::Underrun) => {
                    log::warn!("XRUN on {}", device.name());
                    report.underruns += 1;
                    if let Err(e) = device.recover_from_underrun() {
                        log::warn!("underrun recovery failed: {}", e);
                    }
                }
                Err(e) => {
                    log::error!("{}", e);
                    report.write_errors += 1;
                }
            }
            report.iterations += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sound::device::{AccessMode, DeviceError, HwConfig, SampleFormat};
    use std::io::Cursor;

    /// Records writes; fails individual writes on request.
    #[derive(Default)]
    struct ScriptedDevice {
        writes: Vec<Vec<u8>>,
        underrun_on: Vec<usize>,
        fail_on: Vec<usize>,
        recoveries: usize,
    }

    impl PcmDevice for ScriptedDevice {
        fn name(&self) -> &str {
            "scripted"
        }
        fn set_access(&mut self, _access: AccessMode) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_format(&mut self, _format: SampleFormat) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_channels(&mut self, _channels: u16) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
            Ok(rate)
        }
        fn commit(&mut self) -> Result<HwConfig, DeviceError> {
            Ok(HwConfig::from_frames(4, 4000))
        }
        fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, WriteError> {
            let index = self.writes.len();
            self.writes.push(buf.to_vec());
            if self.underrun_on.contains(&index) {
                return Err(WriteError::Underrun);
            }
            if self.fail_on.contains(&index) {
                return Err(WriteError::Device("Input/output error".to_string()));
            }
            Ok(frames)
        }
        fn recover_from_underrun(&mut self) -> Result<(), DeviceError> {
            self.recoveries += 1;
            Ok(())
        }
        fn drain(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn drop_pending(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// 4 frames, mono, 1 ms periods
    fn params() -> NegotiatedDeviceParams {
        NegotiatedDeviceParams {
            access: AccessMode::Interleaved,
            format: SampleFormat::S16Le,
            channels: 1,
            granted_rate: 4000,
            period_frames: 4,
            period_time_micros: 1000,
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn test_loop_count() {
        assert_eq!(loop_count(10, 1000).unwrap(), 10_000);
        assert_eq!(loop_count(10, 21333).unwrap(), 468);
        assert_eq!(loop_count(0, 1000).unwrap(), 0);
        assert_eq!(loop_count(u32::MAX, 1).unwrap(), u32::MAX as u64 * 1_000_000);
        assert!(matches!(loop_count(10, 0), Err(PlaybackError::InvalidPeriod)));
    }

    #[test]
    fn test_runs_computed_iterations() {
        let mut device = ScriptedDevice::default();
        let mut source = io::repeat(0x55);
        let mut playback = PlaybackLoop::new(params());

        let report = playback
            .run(&mut device, &mut source, 10, &CancelToken::new())
            .unwrap();

        assert_eq!(report.iterations, 10_000);
        assert_eq!(device.writes.len(), 10_000);
        assert_eq!(report.short_reads, 0);
        assert!(device.writes.iter().all(|w| w == &[0x55; 8]));
    }

    #[test]
    fn test_underrun_recovered_once() {
        let mut device = ScriptedDevice {
            underrun_on: vec![3],
            ..Default::default()
        };
        let mut source = io::repeat(1);
        let mut playback = PlaybackLoop::new(params());

        let report = playback
            .run(&mut device, &mut source, 1, &CancelToken::new())
            .unwrap();

        assert_eq!(device.recoveries, 1);
        assert_eq!(report.underruns, 1);
        assert_eq!(report.iterations, 1000);
        assert_eq!(device.writes.len(), 1000);
    }

    #[test]
    fn test_write_errors_are_not_fatal() {
        let mut device = ScriptedDevice {
            fail_on: vec![0, 5],
            ..Default::default()
        };
        let mut source = io::repeat(1);
        let mut playback = PlaybackLoop::new(params());

        let report = playback
            .run(&mut device, &mut source, 1, &CancelToken::new())
            .unwrap();

        assert_eq!(report.write_errors, 2);
        assert_eq!(report.iterations, 1000);
        assert_eq!(device.recoveries, 0);
    }

    #[test]
    fn test_short_read_padded_with_silence() {
        let mut device = ScriptedDevice::default();
        // one full period plus three bytes
        let mut source = Cursor::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        let mut playback = PlaybackLoop::new(params());

        let report = playback
            .run(&mut device, &mut source, 0, &CancelToken::new())
            .unwrap();
        assert_eq!(report.iterations, 0);

        let mut playback = PlaybackLoop::new(NegotiatedDeviceParams {
            period_time_micros: 250_000,
            ..params()
        });
        let report = playback
            .run(&mut device, &mut source, 1, &CancelToken::new())
            .unwrap();

        assert_eq!(report.iterations, 4);
        assert_eq!(report.short_reads, 3);
        assert_eq!(device.writes[0], vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(device.writes[1], vec![9, 10, 11, 0, 0, 0, 0, 0]);
        assert_eq!(device.writes[2], vec![0; 8]);
        assert_eq!(device.writes[3], vec![0; 8]);
    }

    #[test]
    fn test_source_error_aborts() {
        let mut device = ScriptedDevice::default();
        let mut playback = PlaybackLoop::new(params());

        let result = playback.run(&mut device, &mut FailingReader, 10, &CancelToken::new());

        assert!(matches!(result, Err(PlaybackError::SourceIo(_))));
        assert!(device.writes.is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut device = ScriptedDevice::default();
        let mut source = io::repeat(0);
        let mut playback = PlaybackLoop::new(params());
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = playback.run(&mut device, &mut source, 10, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.iterations, 0);
        assert!(device.writes.is_empty());
    }

    #[test]
    fn test_cancelled_mid_run() {
        struct CancellingReader {
            cancel: CancelToken,
            reads: usize,
        }

        impl Read for CancellingReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.reads += 1;
                if self.reads == 5 {
                    self.cancel.cancel();
                }
                buf.fill(7);
                Ok(buf.len())
            }
        }

        let cancel = CancelToken::new();
        let mut source = CancellingReader {
            cancel: cancel.clone(),
            reads: 0,
        };
        let mut device = ScriptedDevice::default();
        let mut playback = PlaybackLoop::new(params());

        let report = playback.run(&mut device, &mut source, 10, &cancel).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.iterations, 5);
    }

    #[test]
    fn test_period_buffer_fill() {
        let mut buffer = PeriodBuffer::new(6);
        let mut source = Cursor::new(vec![9u8; 10]);

        assert_eq!(buffer.fill_from(&mut source).unwrap(), 6);
        assert_eq!(buffer.as_bytes(), &[9; 6]);
        assert_eq!(buffer.fill_from(&mut source).unwrap(), 4);
        assert_eq!(buffer.as_bytes(), &[9, 9, 9, 9, 0, 0]);
        assert_eq!(buffer.fill_from(&mut source).unwrap(), 0);
        assert_eq!(buffer.as_bytes(), &[0; 6]);
    }
}
