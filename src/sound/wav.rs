//! WAV header parser
//!
//! Reads the fixed 44-byte RIFF/WAVE prefix that precedes the sample payload
//! of a canonical PCM file:
//!
//! ```text
//! 0  "RIFF"   4 riff size   8 "WAVE"
//! 12 "fmt "  16 fmt size   20 audio format  22 channels  24 sample rate
//! 28 byte rate  32 block align  34 bits per sample
//! 36 "data"  40 data size  44 samples...
//! ```
//!
//! Numeric fields are little-endian. Tags are kept as raw bytes and are never
//! byte-swapped. Only the single-`fmt `/single-`data` layout is recognized.

use std::fmt;
use std::io::{self, Read};

use thiserror::Error;

use super::read_full;

/// Size of the fixed header prefix in bytes
pub const WAV_HEADER_LEN: usize = 44;

pub const RIFF_TAG: FourCC = FourCC(*b"RIFF");
pub const WAVE_TAG: FourCC = FourCC(*b"WAVE");
pub const FMT_TAG: FourCC = FourCC(*b"fmt ");
pub const DATA_TAG: FourCC = FourCC(*b"data");

/// Format code for linear PCM
pub const WAVE_FORMAT_PCM: u16 = 1;

/// The only sample width the playback path accepts
pub const SUPPORTED_BITS_PER_SAMPLE: u16 = 16;

/// Four-character chunk tag, stored exactly as it appears in the file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// Which tag of the header failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    RiffId,
    WaveFormat,
    FmtId,
    DataId,
}

impl HeaderField {
    /// Tag the field is required to hold
    pub fn expected(self) -> FourCC {
        match self {
            HeaderField::RiffId => RIFF_TAG,
            HeaderField::WaveFormat => WAVE_TAG,
            HeaderField::FmtId => FMT_TAG,
            HeaderField::DataId => DATA_TAG,
        }
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderField::RiffId => "riff.id",
            HeaderField::WaveFormat => "riff.format",
            HeaderField::FmtId => "fmt.id",
            HeaderField::DataId => "data.id",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("WAV header truncated: got {read} of 44 bytes")]
    Truncated { read: usize },
    #[error("bad magic in {field}: expected {}, found {found}", .field.expected())]
    BadMagic { field: HeaderField, found: FourCC },
    #[error("unsupported WAV stream: {0}")]
    Unsupported(String),
    #[error("failed to read WAV header: {0}")]
    Io(#[from] io::Error),
}

/// RIFF container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiffSection {
    pub id: FourCC,     // "RIFF"
    pub size: u32,      // file size - 8
    pub format: FourCC, // "WAVE"
}

/// `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSection {
    pub id: FourCC, // "fmt "
    pub size: u32,
    pub audio_format: u16, // 1 = PCM
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

/// `data` chunk header; the payload follows immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSection {
    pub id: FourCC, // "data"
    pub size: u32,
}

/// The complete 44-byte header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub riff: RiffSection,
    pub fmt: FormatSection,
    pub data: DataSection,
}

/// The subset of the header the playback path needs, after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_len: u32,
}

impl PcmSpec {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

impl WavHeader {
    /// Build a canonical header for 16-bit PCM with `data_len` payload bytes.
    pub fn pcm16(channels: u16, sample_rate: u32, data_len: u32) -> Self {
        let block_align = channels.saturating_mul(2);
        Self {
            riff: RiffSection {
                id: RIFF_TAG,
                size: data_len.saturating_add(36),
                format: WAVE_TAG,
            },
            fmt: FormatSection {
                id: FMT_TAG,
                size: 16,
                audio_format: WAVE_FORMAT_PCM,
                channels,
                sample_rate,
                byte_rate: sample_rate.saturating_mul(block_align as u32),
                block_align,
                bits_per_sample: SUPPORTED_BITS_PER_SAMPLE,
            },
            data: DataSection {
                id: DATA_TAG,
                size: data_len,
            },
        }
    }

    /// Check that the stream is something the PCM device path can play:
    /// linear PCM, 16 bits per sample, at least one channel, non-zero rate.
    pub fn pcm_spec(&self) -> Result<PcmSpec, HeaderError> {
        let fmt = &self.fmt;
        if fmt.audio_format != WAVE_FORMAT_PCM {
            return Err(HeaderError::Unsupported(format!(
                "audio format {} (only PCM supported)",
                fmt.audio_format
            )));
        }
        if fmt.bits_per_sample != SUPPORTED_BITS_PER_SAMPLE {
            return Err(HeaderError::Unsupported(format!(
                "{} bits per sample (only 16 supported)",
                fmt.bits_per_sample
            )));
        }
        if fmt.channels == 0 {
            return Err(HeaderError::Unsupported("zero channels".to_string()));
        }
        if fmt.sample_rate == 0 {
            return Err(HeaderError::Unsupported("zero sample rate".to_string()));
        }

        Ok(PcmSpec {
            channels: fmt.channels,
            sample_rate: fmt.sample_rate,
            bits_per_sample: fmt.bits_per_sample,
            data_len: self.data.size,
        })
    }

    /// Serialize back into the on-disk layout
    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(self.riff.id.as_bytes());
        out[4..8].copy_from_slice(&self.riff.size.to_le_bytes());
        out[8..12].copy_from_slice(self.riff.format.as_bytes());
        out[12..16].copy_from_slice(self.fmt.id.as_bytes());
        out[16..20].copy_from_slice(&self.fmt.size.to_le_bytes());
        out[20..22].copy_from_slice(&self.fmt.audio_format.to_le_bytes());
        out[22..24].copy_from_slice(&self.fmt.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.fmt.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.fmt.byte_rate.to_le_bytes());
        out[32..34].copy_from_slice(&self.fmt.block_align.to_le_bytes());
        out[34..36].copy_from_slice(&self.fmt.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(self.data.id.as_bytes());
        out[40..44].copy_from_slice(&self.data.size.to_le_bytes());
        out
    }
}

/// Little-endian field reader over the fixed header bytes
struct HeaderBytes<'a> {
    bytes: &'a [u8; WAV_HEADER_LEN],
    pos: usize,
}

impl<'a> HeaderBytes<'a> {
    fn new(bytes: &'a [u8; WAV_HEADER_LEN]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn tag(&mut self) -> FourCC {
        FourCC(self.take::<4>())
    }

    fn le_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take::<2>())
    }

    fn le_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take::<4>())
    }
}

fn expect_tag(field: HeaderField, found: FourCC) -> Result<(), HeaderError> {
    if found == field.expected() {
        Ok(())
    } else {
        Err(HeaderError::BadMagic { field, found })
    }
}

/// Read and validate the 44-byte header, leaving the stream positioned at the
/// first sample byte.
pub fn parse_header<R: Read + ?Sized>(stream: &mut R) -> Result<WavHeader, HeaderError> {
    let mut raw = [0u8; WAV_HEADER_LEN];
    let read = read_full(stream, &mut raw)?;
    if read < WAV_HEADER_LEN {
        return Err(HeaderError::Truncated { read });
    }

    let mut r = HeaderBytes::new(&raw);

    let riff = RiffSection {
        id: r.tag(),
        size: r.le_u32(),
        format: r.tag(),
    };
    expect_tag(HeaderField::RiffId, riff.id)?;
    expect_tag(HeaderField::WaveFormat, riff.format)?;

    let fmt = FormatSection {
        id: r.tag(),
        size: r.le_u32(),
        audio_format: r.le_u16(),
        channels: r.le_u16(),
        sample_rate: r.le_u32(),
        byte_rate: r.le_u32(),
        block_align: r.le_u16(),
        bits_per_sample: r.le_u16(),
    };
    expect_tag(HeaderField::FmtId, fmt.id)?;

    let data = DataSection {
        id: r.tag(),
        size: r.le_u32(),
    };
    expect_tag(HeaderField::DataId, data.id)?;

    let header = WavHeader { riff, fmt, data };
    log::debug!(
        "wav header: riff.size={} fmt.size={} format={} channels={} rate={} byte_rate={} block_align={} bits={} data.size={}",
        header.riff.size,
        header.fmt.size,
        header.fmt.audio_format,
        header.fmt.channels,
        header.fmt.sample_rate,
        header.fmt.byte_rate,
        header.fmt.block_align,
        header.fmt.bits_per_sample,
        header.data.size
    );
    Ok(header)
}
