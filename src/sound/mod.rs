//! Alarm sound playback
//!
//! Streams a 16-bit PCM WAV file to an output device for a fixed duration.
//!
//! # Architecture
//!
//! - `wav` parses and validates the fixed 44-byte header
//! - `device` defines the `PcmDevice`/`PcmBackend` traits and parameter negotiation
//! - `cpal_backend` and `null` provide concrete devices
//! - `playback` runs the period-by-period write loop with underrun recovery
//! - `session` ties file, header, device and loop into one attempt
//! - `worker` runs a session on its own thread

pub mod cpal_backend;
pub mod device;
pub mod null;
pub mod playback;
pub mod session;
pub mod wav;
pub mod worker;

pub use cpal_backend::CpalBackend;
pub use device::{
    negotiate, DeviceError, NegotiatedDeviceParams, PcmBackend, PcmDevice, WriteError,
};
pub use null::{NullBackend, NullDevice};
pub use playback::{PlaybackError, PlaybackLoop, PlaybackReport};
pub use session::{PlaybackRequest, PlaybackSession, SessionError};
pub use wav::{parse_header, HeaderError, WavHeader};
pub use worker::PlaybackWorker;

use std::io::{self, Read};

/// Fill `buf` from `stream`, stopping early only at end of stream.
///
/// Returns the number of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
