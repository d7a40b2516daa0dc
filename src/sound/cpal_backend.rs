//! cpal-based PCM device
//!
//! cpal drives output through a callback, while the playback loop wants a
//! blocking "write one period" interface. The two are joined by a bounded
//! crossbeam channel of period-sized sample blocks: `write_interleaved`
//! blocks when the channel is full, and the output callback pulls blocks as
//! the hardware consumes them.
//!
//! If the callback finds the channel empty after playback started, it plays
//! silence and flags an underrun. The next write reports
//! `WriteError::Underrun`, and `recover_from_underrun` re-arms the stream.
//!
//! The stream is not `Send`; a `CpalDevice` must stay on the thread that
//! opened it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use super::device::{
    AccessMode, DeviceError, HwConfig, NegotiationStage, PcmBackend, PcmDevice, SampleFormat,
    WriteError, DEFAULT_DEVICE_NAME,
};

/// Frames per period when the device leaves the choice to us
pub const DEFAULT_PERIOD_FRAMES: usize = 1024;

/// Periods buffered between the writer and the output callback
pub const DEFAULT_QUEUE_PERIODS: usize = 4;

/// Extra slack on top of the queue length before a write is declared stuck
const WRITE_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// State shared between the writer and the output callback
#[derive(Default)]
struct StreamShared {
    /// Callback has consumed at least one block since the last recovery
    running: AtomicBool,
    /// Callback ran dry while running
    xrun: AtomicBool,
    /// Writer asked the callback to throw away queued blocks
    discard: AtomicBool,
    /// Last error reported by the stream error callback
    error: Mutex<Option<String>>,
}

/// Callback-side cursor into the block being played
struct Feed {
    rx: Receiver<Vec<i16>>,
    current: Vec<i16>,
    pos: usize,
}

impl Feed {
    fn new(rx: Receiver<Vec<i16>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }

    fn render<T: Copy>(
        &mut self,
        out: &mut [T],
        shared: &StreamShared,
        convert: impl Fn(i16) -> T,
        silence: T,
    ) {
        if shared.discard.swap(false, Ordering::SeqCst) {
            while self.rx.try_recv().is_ok() {}
            self.current.clear();
            self.pos = 0;
            shared.running.store(false, Ordering::SeqCst);
        }

        let mut i = 0;
        while i < out.len() {
            if self.pos >= self.current.len() {
                match self.rx.try_recv() {
                    Ok(block) => {
                        self.current = block;
                        self.pos = 0;
                        shared.running.store(true, Ordering::SeqCst);
                        continue;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                        if shared.running.swap(false, Ordering::SeqCst) {
                            shared.xrun.store(true, Ordering::SeqCst);
                        }
                        out[i..].fill(silence);
                        return;
                    }
                }
            }
            out[i] = convert(self.current[self.pos]);
            self.pos += 1;
            i += 1;
        }
    }
}

fn i16_to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

/// Output sample type actually used for the cpal stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFormat {
    I16,
    F32,
}

impl StreamFormat {
    fn from_cpal(format: cpal::SampleFormat) -> Option<Self> {
        match format {
            cpal::SampleFormat::I16 => Some(StreamFormat::I16),
            cpal::SampleFormat::F32 => Some(StreamFormat::F32),
            _ => None,
        }
    }
}

/// Pick the rate closest to `requested` that one of `ranges` can run at.
fn nearest_rate(ranges: &[cpal::SupportedStreamConfigRange], requested: u32) -> Option<u32> {
    ranges
        .iter()
        .map(|r| requested.clamp(r.min_sample_rate().0, r.max_sample_rate().0))
        .min_by_key(|rate| rate.abs_diff(requested))
}

/// Clamp the preferred period to what the device accepts.
fn choose_buffer_size(
    range: &cpal::SupportedStreamConfigRange,
    preferred: usize,
) -> (usize, cpal::BufferSize) {
    match range.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let frames = (preferred as u32).clamp(*min, (*max).max(*min));
            (frames as usize, cpal::BufferSize::Fixed(frames))
        }
        cpal::SupportedBufferSize::Unknown => (preferred, cpal::BufferSize::Default),
    }
}

/// A cpal output device driven through blocking period writes
pub struct CpalDevice {
    name: String,
    device: cpal::Device,
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    preferred_period: usize,
    queue_periods: usize,
    channels: Option<u16>,
    rate: Option<u32>,
    period_frames: usize,
    period_time: Duration,
    stream: Option<cpal::Stream>,
    tx: Option<Sender<Vec<i16>>>,
    shared: Arc<StreamShared>,
}

impl CpalDevice {
    /// Ranges matching the negotiated channel count
    fn ranges_for(&self, channels: u16) -> Vec<cpal::SupportedStreamConfigRange> {
        self.ranges
            .iter()
            .filter(|r| r.channels() == channels)
            .cloned()
            .collect()
    }

    fn build_stream(
        &self,
        config: &cpal::StreamConfig,
        format: StreamFormat,
        rx: Receiver<Vec<i16>>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError> {
        let err_shared = Arc::clone(&self.shared);
        let err_fn = move |err: cpal::StreamError| {
            log::error!("PCM stream error: {}", err);
            *err_shared.error.lock() = Some(err.to_string());
        };

        let shared = Arc::clone(&self.shared);
        let mut feed = Feed::new(rx);

        match format {
            StreamFormat::I16 => self.device.build_output_stream(
                config,
                move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    feed.render(out, &shared, |s| s, 0)
                },
                err_fn,
                None,
            ),
            StreamFormat::F32 => self.device.build_output_stream(
                config,
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    feed.render(out, &shared, i16_to_f32, 0.0)
                },
                err_fn,
                None,
            ),
        }
    }
}

impl PcmDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_access(&mut self, access: AccessMode) -> Result<(), DeviceError> {
        match access {
            AccessMode::Interleaved => Ok(()),
            AccessMode::NonInterleaved => Err(DeviceError::negotiation(
                NegotiationStage::Access,
                "cpal streams are interleaved only",
            )),
        }
    }

    fn set_format(&mut self, format: SampleFormat) -> Result<(), DeviceError> {
        match format {
            SampleFormat::S16Le => {
                let usable = self
                    .ranges
                    .iter()
                    .any(|r| StreamFormat::from_cpal(r.sample_format()).is_some());
                if usable {
                    Ok(())
                } else {
                    Err(DeviceError::negotiation(
                        NegotiationStage::Format,
                        "device offers neither i16 nor f32 output",
                    ))
                }
            }
        }
    }

    fn set_channels(&mut self, channels: u16) -> Result<(), DeviceError> {
        if self.ranges_for(channels).is_empty() {
            let mut offered: Vec<u16> = self.ranges.iter().map(|r| r.channels()).collect();
            offered.sort_unstable();
            offered.dedup();
            return Err(DeviceError::negotiation(
                NegotiationStage::Channels,
                format!("{} channels not supported (device offers {:?})", channels, offered),
            ));
        }
        self.channels = Some(channels);
        Ok(())
    }

    fn set_rate_near(&mut self, rate: u32) -> Result<u32, DeviceError> {
        let channels = self.channels.ok_or_else(|| {
            DeviceError::negotiation(NegotiationStage::Rate, "channel count not set")
        })?;
        let granted = nearest_rate(&self.ranges_for(channels), rate).ok_or_else(|| {
            DeviceError::negotiation(NegotiationStage::Rate, "no configuration for channel count")
        })?;
        self.rate = Some(granted);
        Ok(granted)
    }

    fn commit(&mut self) -> Result<HwConfig, DeviceError> {
        let (channels, rate) = match (self.channels, self.rate) {
            (Some(c), Some(r)) => (c, r),
            _ => {
                return Err(DeviceError::negotiation(
                    NegotiationStage::Commit,
                    "channels and rate must be set before commit",
                ))
            }
        };

        let candidates: Vec<_> = self
            .ranges_for(channels)
            .into_iter()
            .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            .filter_map(|r| StreamFormat::from_cpal(r.sample_format()).map(|f| (f, r)))
            .collect();
        let (format, range) = candidates
            .iter()
            .find(|(f, _)| *f == StreamFormat::I16)
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                DeviceError::negotiation(
                    NegotiationStage::Commit,
                    format!("no i16/f32 configuration for {} ch @ {} Hz", channels, rate),
                )
            })?;

        let (period_frames, buffer_size) = choose_buffer_size(&range, self.preferred_period);
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size,
        };

        let (tx, rx) = channel::bounded(self.queue_periods.max(1));
        let stream = self
            .build_stream(&config, format, rx)
            .map_err(|e| DeviceError::negotiation(NegotiationStage::Commit, e))?;
        stream
            .play()
            .map_err(|e| DeviceError::negotiation(NegotiationStage::Commit, e))?;

        if format == StreamFormat::F32 {
            log::debug!("{}: no native i16 output, converting to f32", self.name);
        }

        let hw = HwConfig::from_frames(period_frames, rate);
        self.period_frames = period_frames;
        self.period_time = Duration::from_micros(hw.period_time_micros as u64);
        self.stream = Some(stream);
        self.tx = Some(tx);
        Ok(hw)
    }

    fn write_interleaved(&mut self, buf: &[u8], frames: usize) -> Result<usize, WriteError> {
        if let Some(err) = self.shared.error.lock().take() {
            return Err(WriteError::Device(err));
        }
        if self.shared.xrun.load(Ordering::SeqCst) {
            return Err(WriteError::Underrun);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| WriteError::Device("device not prepared".to_string()))?;

        let channels = self.channels.unwrap_or(1) as usize;
        let len = (frames * channels * 2).min(buf.len());
        let block: Vec<i16> = buf[..len]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let accepted = block.len() / channels;

        let timeout = self.period_time * (self.queue_periods as u32 + 1) + WRITE_TIMEOUT_SLACK;
        match tx.send_timeout(block, timeout) {
            Ok(()) => Ok(accepted),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(WriteError::Device("write timed out".to_string()))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(WriteError::Device("stream closed".to_string()))
            }
        }
    }

    fn recover_from_underrun(&mut self) -> Result<(), DeviceError> {
        self.shared.xrun.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(());
        };
        let budget = self.period_time * (self.queue_periods as u32 + 2) + WRITE_TIMEOUT_SLACK;
        let deadline = Instant::now() + budget;
        while !tx.is_empty() {
            if Instant::now() >= deadline {
                return Err(DeviceError::Backend("drain timed out".to_string()));
            }
            thread::sleep(self.period_time.max(Duration::from_millis(1)));
        }
        // the block in flight inside the callback
        thread::sleep(self.period_time);
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), DeviceError> {
        self.shared.discard.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.tx = None;
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("{}: pause on close failed: {}", self.name, e);
            }
        }
        Ok(())
    }
}

/// Opens host output devices through cpal's default host
#[derive(Debug, Clone, Copy)]
pub struct CpalBackend {
    pub preferred_period_frames: usize,
    pub queue_periods: usize,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self {
            preferred_period_frames: DEFAULT_PERIOD_FRAMES,
            queue_periods: DEFAULT_QUEUE_PERIODS,
        }
    }
}

impl PcmBackend for CpalBackend {
    type Device = CpalDevice;

    fn open(&self, name: &str) -> Result<CpalDevice, DeviceError> {
        let host = cpal::default_host();

        let device = if name == DEFAULT_DEVICE_NAME {
            host.default_output_device()
                .ok_or_else(|| DeviceError::open_failed(name, "no default output device"))?
        } else {
            host.output_devices()
                .map_err(|e| DeviceError::open_failed(name, e))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::open_failed(name, "no such output device"))?
        };

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| DeviceError::open_failed(name, e))?
            .collect();
        if ranges.is_empty() {
            return Err(DeviceError::open_failed(name, "device reports no output configs"));
        }

        let host_name = device.name().unwrap_or_else(|_| name.to_string());
        log::info!(
            "opened PCM device \"{}\" ({} via {:?})",
            name,
            host_name,
            host.id()
        );

        Ok(CpalDevice {
            name: name.to_string(),
            device,
            ranges,
            preferred_period: self.preferred_period_frames.max(1),
            queue_periods: self.queue_periods.max(1),
            channels: None,
            rate: None,
            period_frames: 0,
            period_time: Duration::ZERO,
            stream: None,
            tx: None,
            shared: Arc::new(StreamShared::default()),
        })
    }
}
