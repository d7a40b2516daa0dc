//! End-to-end playback session tests
//!
//! A WAV file is written to a temp dir and played through a scripted device
//! that records every call, so the tests can check what the session asked
//! for and that the device is released exactly once on every path.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use alarm_rust::sound::device::{
    AccessMode, DeviceError, HwConfig, NegotiationStage, PcmBackend, PcmDevice, SampleFormat,
    WriteError,
};
use alarm_rust::sound::wav::HeaderField;
use alarm_rust::sound::{
    HeaderError, PlaybackError, PlaybackRequest, PlaybackSession, PlaybackWorker, SessionError,
    WavHeader,
};
use alarm_rust::threading::CancelToken;

/// Calls observed by the scripted device
#[derive(Debug, Default)]
struct DeviceLog {
    opened: Vec<String>,
    channels: Option<u16>,
    requested_rate: Option<u32>,
    frames_written: u64,
    writes: u64,
    recoveries: u64,
    drains: u64,
    drops: u64,
    closes: u64,
    /// Whether the watched file was still open when `close` ran
    file_open_at_close: Option<bool>,
}

#[derive(Clone, Default)]
struct Script {
    /// Stage whose setter fails
    fail_stage: Option<NegotiationStage>,
    /// Rate handed back by set_rate_near, if different from the request
    granted_rate: Option<u32>,
    period_frames: usize,
    /// Override the reported period time
    period_time_micros: Option<u32>,
    /// Write numbers (0-based) that report an underrun
    underrun_writes: Vec<u64>,
    /// File whose open state is sampled inside `close`
    watch_path: Option<PathBuf>,
}

#[derive(Clone)]
struct ScriptedBackend {
    script: Script,
    log: Arc<Mutex<DeviceLog>>,
}

struct ScriptedDevice {
    name: String,
    script: Script,
    rate: u32,
    log: Arc<Mutex<DeviceLog>>,
}

impl ScriptedDevice {
    fn check(&self, stage: NegotiationStage) -> Result<(), DeviceError> {
        if self.script.fail_stage == Some(stage) {
            Err(DeviceError::negotiation(stage, "scripted failure"))
        } else {
            Ok(())
        }
    }
}

impl PcmDevice for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_access(&mut self, _access: AccessMode) -> Result<(), DeviceError> {
        self.check(NegotiationStage::Access)
    }

    fn set_format(&mut self, _format: SampleFormat) -> Result<(), DeviceError> {
        self.check(NegotiationStage::Format)
    }

    fn set_channels(&mut self, channels: u16) -> Result<(), DeviceError> {
        self.check(NegotiationStage::Channels)?;
        self.log.lock().channels = Some(channels);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
        self.check(NegotiationStage::Rate)?;
        self.log.lock().requested_rate = Some(rate);
        self.rate = self.script.granted_rate.unwrap_or(rate);
        Ok(self.rate)
    }

    fn commit(&mut self) -> Result<HwConfig, DeviceError> {
        self.check(NegotiationStage::Commit)?;
        let mut hw = HwConfig::from_frames(self.script.period_frames, self.rate);
        if let Some(micros) = self.script.period_time_micros {
            hw.period_time_micros = micros;
        }
        Ok(hw)
    }

    fn write_interleaved(&mut self, _buf: &[u8], frames: usize) -> Result<usize, WriteError> {
        let mut log = self.log.lock();
        let n = log.writes;
        log.writes += 1;
        if self.script.underrun_writes.contains(&n) {
            return Err(WriteError::Underrun);
        }
        log.frames_written += frames as u64;
        Ok(frames)
    }

    fn recover_from_underrun(&mut self) -> Result<(), DeviceError> {
        self.log.lock().recoveries += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.log.lock().drains += 1;
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        self.log.lock().drops += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let open = self.script.watch_path.as_deref().map(is_open_by_self);
        let mut log = self.log.lock();
        log.closes += 1;
        log.file_open_at_close = open;
        Ok(())
    }
}

impl PcmBackend for ScriptedBackend {
    type Device = ScriptedDevice;

    fn open(&self, name: &str) -> Result<ScriptedDevice, DeviceError> {
        self.log.lock().opened.push(name.to_string());
        Ok(ScriptedDevice {
            name: name.to_string(),
            script: self.script.clone(),
            rate: 0,
            log: Arc::clone(&self.log),
        })
    }
}

/// True if this process holds a descriptor for `path` (Linux only)
fn is_open_by_self(path: &Path) -> bool {
    let Ok(target) = path.canonicalize() else {
        return false;
    };
    let Ok(fds) = std::fs::read_dir("/proc/self/fd") else {
        return false;
    };
    fds.filter_map(|fd| fd.ok())
        .filter_map(|fd| std::fs::read_link(fd.path()).ok())
        .any(|link| link == target)
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "read error"))
    }
}

fn backend(script: Script) -> ScriptedBackend {
    ScriptedBackend {
        script,
        log: Arc::new(Mutex::new(DeviceLog::default())),
    }
}

fn period_480() -> Script {
    Script {
        period_frames: 480,
        ..Default::default()
    }
}

/// Mono 48 kHz 16-bit file with `seconds` of a square wave
fn write_wav(dir: &Path, seconds: u32) -> PathBuf {
    let frames = 48_000 * seconds as usize;
    let mut data = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let s: i16 = if (i / 50) % 2 == 0 { 8000 } else { -8000 };
        data.extend_from_slice(&s.to_le_bytes());
    }

    let path = dir.join("alarm.wav");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&WavHeader::pcm16(1, 48_000, data.len() as u32).to_bytes())
        .unwrap();
    file.write_all(&data).unwrap();
    path
}

fn request(path: &Path, duration_secs: u32) -> PlaybackRequest {
    PlaybackRequest {
        sound_path: path.to_path_buf(),
        duration_secs,
        device_name: "default".to_string(),
    }
}

#[test]
fn test_session_plays_whole_duration() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    // 480 frames at 48 kHz = 10 ms per period, 2 s -> 200 periods
    let report = PlaybackSession::new(backend, request(&path, 2), CancelToken::new())
        .run()
        .unwrap();

    assert_eq!(report.iterations, 200);
    // the file holds 1 s; the second half is silence
    assert_eq!(report.short_reads, 100);
    assert_eq!(report.underruns, 0);
    assert!(!report.cancelled);

    let log = log.lock();
    assert_eq!(log.opened, vec!["default".to_string()]);
    assert_eq!(log.channels, Some(1));
    assert_eq!(log.requested_rate, Some(48_000));
    assert_eq!(log.frames_written, 200 * 480);
    assert_eq!(log.drains, 1);
    assert_eq!(log.drops, 0);
    assert_eq!(log.closes, 1);
}

#[test]
fn test_session_uses_granted_rate_for_timing() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(Script {
        granted_rate: Some(44_100),
        period_frames: 441,
        ..Default::default()
    });

    // 441 frames at 44.1 kHz = 10 ms per period
    let report = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap();
    assert_eq!(report.iterations, 100);
}

#[test]
fn test_session_recovers_from_underrun() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(Script {
        underrun_writes: vec![10],
        ..period_480()
    });
    let log = Arc::clone(&backend.log);

    let report = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap();

    assert_eq!(report.iterations, 100);
    assert_eq!(report.underruns, 1);
    assert_eq!(report.write_errors, 0);

    let log = log.lock();
    assert_eq!(log.recoveries, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn test_negotiation_failure_closes_device() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);

    for stage in [
        NegotiationStage::Access,
        NegotiationStage::Format,
        NegotiationStage::Channels,
        NegotiationStage::Rate,
        NegotiationStage::Commit,
    ] {
        let backend = backend(Script {
            fail_stage: Some(stage),
            ..period_480()
        });
        let log = Arc::clone(&backend.log);

        let err = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
            .run()
            .unwrap_err();
        match err {
            SessionError::Device(DeviceError::NegotiationFailed { stage: s, .. }) => {
                assert_eq!(s, stage)
            }
            other => panic!("unexpected error for {}: {:?}", stage, other),
        }

        let log = log.lock();
        assert_eq!(log.writes, 0);
        assert_eq!(log.closes, 1, "device not closed after {} failure", stage);
    }
}

#[test]
fn test_loop_abort_closes_device() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(Script {
        period_time_micros: Some(0),
        ..period_480()
    });
    let log = Arc::clone(&backend.log);

    let err = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Playback(PlaybackError::InvalidPeriod)
    ));

    let log = log.lock();
    assert_eq!(log.drops, 1);
    assert_eq!(log.drains, 0);
    assert_eq!(log.closes, 1);
}

#[test]
fn test_bad_header_never_opens_device() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);

    // corrupt the "WAVE" tag
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[8..12].copy_from_slice(b"AVI ");
    std::fs::write(&path, &bytes).unwrap();

    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    let err = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Header(HeaderError::BadMagic {
            field: HeaderField::WaveFormat,
            ..
        })
    ));
    assert!(log.lock().opened.is_empty());
}

#[test]
fn test_unsupported_format_never_opens_device() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("8bit.wav");

    let mut header = WavHeader::pcm16(1, 8000, 0);
    header.fmt.bits_per_sample = 8;
    std::fs::write(&path, header.to_bytes()).unwrap();

    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    let err = PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap_err();
    assert!(matches!(err, SessionError::Header(HeaderError::Unsupported(_))));
    assert!(log.lock().opened.is_empty());
}

#[test]
fn test_cancelled_session_discards_and_closes() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = PlaybackSession::new(backend, request(&path, 1), cancel)
        .run()
        .unwrap();

    assert!(report.cancelled);
    let log = log.lock();
    assert_eq!(log.writes, 0);
    assert_eq!(log.drops, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn test_worker_plays_on_background_thread() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    let worker = PlaybackWorker::spawn(backend, request(&path, 1)).unwrap();
    let report = worker.join().unwrap().unwrap();

    assert_eq!(report.iterations, 100);
    assert_eq!(log.lock().closes, 1);
}

#[cfg(target_os = "linux")]
#[test]
fn test_device_closed_before_file_on_success() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(Script {
        watch_path: Some(path.clone()),
        ..period_480()
    });
    let log = Arc::clone(&backend.log);

    PlaybackSession::new(backend, request(&path, 1), CancelToken::new())
        .run()
        .unwrap();

    assert_eq!(log.lock().file_open_at_close, Some(true));
}

#[cfg(target_os = "linux")]
#[test]
fn test_device_closed_before_file_on_abort() {
    let dir = TempDir::new().unwrap();
    let path = write_wav(dir.path(), 1);
    let backend = backend(Script {
        period_time_micros: Some(0),
        watch_path: Some(path.clone()),
        ..period_480()
    });
    let log = Arc::clone(&backend.log);

    let result = PlaybackSession::new(backend, request(&path, 1), CancelToken::new()).run();

    assert!(result.is_err());
    let log = log.lock();
    assert_eq!(log.closes, 1);
    assert_eq!(log.file_open_at_close, Some(true));
}

#[test]
fn test_source_error_aborts_session_and_closes_device() {
    let backend = backend(period_480());
    let log = Arc::clone(&backend.log);

    let header = WavHeader::pcm16(1, 48_000, 96_000).to_bytes();
    let source = Cursor::new(header.to_vec()).chain(FailingReader);

    let session = PlaybackSession::new(
        backend,
        request(Path::new("stream.wav"), 1),
        CancelToken::new(),
    );
    let err = session.run_source(source).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Playback(PlaybackError::SourceIo(_))
    ));

    let log = log.lock();
    assert_eq!(log.opened.len(), 1);
    assert_eq!(log.writes, 0);
    assert_eq!(log.drops, 1);
    assert_eq!(log.drains, 0);
    assert_eq!(log.closes, 1);
}
