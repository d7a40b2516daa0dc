//! One playback attempt, from sound file to released device
//!
//! A session opens the sound file, validates its header, opens and
//! negotiates the PCM device, runs the playback loop and releases
//! everything again. The device lives inside a `DeviceGuard` so it is
//! closed exactly once whichever way the attempt ends.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use thiserror::Error;

use super::device::{negotiate, DeviceError, HwRequest, PcmBackend, PcmDevice};
use super::playback::{PlaybackError, PlaybackLoop, PlaybackReport};
use super::wav::{parse_header, HeaderError};
use crate::threading::CancelToken;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("can't open alarm sound {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

/// What to play, where, and for how long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub sound_path: PathBuf,
    pub duration_secs: u32,
    pub device_name: String,
}

/// Owns an open device until it is released.
///
/// `finish` drains queued audio and closes. Dropping an unfinished guard
/// discards queued audio and closes. Either way `close` runs once.
pub struct DeviceGuard<D: PcmDevice> {
    device: D,
    released: bool,
}

impl<D: PcmDevice> DeviceGuard<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            released: false,
        }
    }

    /// Let queued audio play out, then close.
    pub fn finish(mut self) -> Result<(), DeviceError> {
        self.released = true;
        let drained = self.device.drain();
        let closed = self.device.close();
        drained.and(closed)
    }
}

impl<D: PcmDevice> Deref for DeviceGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D: PcmDevice> DerefMut for DeviceGuard<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: PcmDevice> Drop for DeviceGuard<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.device.drop_pending() {
            log::warn!("{}: discarding queued audio failed: {}", self.device.name(), e);
        }
        if let Err(e) = self.device.close() {
            log::warn!("{}: close failed: {}", self.device.name(), e);
        }
    }
}

/// A single-use playback attempt
pub struct PlaybackSession<B: PcmBackend> {
    backend: B,
    request: PlaybackRequest,
    cancel: CancelToken,
}

impl<B: PcmBackend> PlaybackSession<B> {
    pub fn new(backend: B, request: PlaybackRequest, cancel: CancelToken) -> Self {
        Self {
            backend,
            request,
            cancel,
        }
    }

    /// Play the requested file and release the device.
    ///
    /// Header problems are reported before the device is touched. Errors
    /// while draining or closing after a good run are logged, not returned.
    pub fn run(self) -> Result<PlaybackReport, SessionError> {
        let sound_path = &self.request.sound_path;
        let file = File::open(sound_path).map_err(|source| SessionError::Open {
            path: sound_path.clone(),
            source,
        })?;
        self.run_source(BufReader::new(file))
    }

    /// Play an already opened WAV stream, header included.
    ///
    /// The device is released before `source` is dropped, on every path.
    pub fn run_source<R: Read>(self, mut source: R) -> Result<PlaybackReport, SessionError> {
        let PlaybackRequest {
            sound_path,
            duration_secs,
            device_name,
        } = &self.request;

        let header = parse_header(&mut source)?;
        let spec = header.pcm_spec()?;
        log::info!(
            "{}: {} ch, {} Hz, {} frames of 16-bit PCM",
            sound_path.display(),
            spec.channels,
            spec.sample_rate,
            spec.data_len as usize / spec.bytes_per_frame()
        );

        // trailing chunks after the sample data are not audio
        let mut samples = source.take(spec.data_len as u64);

        // declared after `samples`, so dropped (and closed) first
        let mut device = DeviceGuard::new(self.backend.open(device_name)?);
        let params = negotiate(
            &mut *device,
            &HwRequest::s16_interleaved(spec.channels, spec.sample_rate),
        )?;
        if params.granted_rate != spec.sample_rate {
            log::warn!(
                "{}: asked for {} Hz, playing at {} Hz",
                device.name(),
                spec.sample_rate,
                params.granted_rate
            );
        }

        let report = PlaybackLoop::new(params).run(
            &mut *device,
            &mut samples,
            *duration_secs,
            &self.cancel,
        )?;

        if report.cancelled {
            log::info!("playback cancelled after {} periods", report.iterations);
            drop(device);
        } else if let Err(e) = device.finish() {
            log::warn!("releasing PCM device: {}", e);
        }
        drop(samples);

        log::info!(
            "played {} periods ({} underruns, {} write errors, {} padded)",
            report.iterations,
            report.underruns,
            report.write_errors,
            report.short_reads
        );
        Ok(report)
    }
}
