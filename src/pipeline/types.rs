//! Core types for the pipeline system

use bytes::Bytes;
use serde::Deserialize;
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::pipeline::frame::{AudioFrame, VideoFrame};

/// Timestamp representation for media frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Microseconds on the owning clock
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from duration since epoch
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        let duration = instant.saturating_duration_since(base);
        Self::from_duration(duration)
    }

    /// Convert to duration (negative timestamps clamp to zero)
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Subtract a duration from this timestamp
    pub fn sub(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros - duration.as_micros() as i64,
        }
    }

    /// Shift by a signed number of microseconds
    pub fn offset(&self, micros: i64) -> Self {
        Self {
            micros: self.micros + micros,
        }
    }

    /// Calculate the difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Rational time base (`num/den` seconds per tick)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "TimeBaseRepr")]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimeBaseRepr {
    Text(String),
    Denominator(u32),
}

impl TryFrom<TimeBaseRepr> for TimeBase {
    type Error = Error;

    fn try_from(repr: TimeBaseRepr) -> Result<Self, Error> {
        match repr {
            TimeBaseRepr::Text(text) => text.parse(),
            TimeBaseRepr::Denominator(den) => TimeBase::checked(1, den),
        }
    }
}

impl TimeBase {
    /// One tick per microsecond
    pub const MICROS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    /// Create a time base; both terms must be non-zero
    pub fn checked(num: u32, den: u32) -> Result<Self, Error> {
        if num == 0 || den == 0 {
            return Err(Error::InvalidParameter(format!(
                "invalid time base {}/{}",
                num, den
            )));
        }
        Ok(Self { num, den })
    }

    /// Length of one tick in microseconds (rounded down)
    pub fn period_micros(&self) -> i64 {
        (self.num as i64 * 1_000_000) / self.den as i64
    }

    /// Convert a tick count to microseconds
    pub fn ticks_to_micros(&self, ticks: i64) -> i64 {
        ((ticks as i128 * self.num as i128 * 1_000_000) / self.den as i128) as i64
    }

    /// Convert microseconds to the nearest tick count
    pub fn micros_to_ticks(&self, micros: i64) -> i64 {
        let scale = self.num as i128 * 1_000_000;
        let scaled = micros as i128 * self.den as i128;
        let half = if scaled >= 0 { scale / 2 } else { -scale / 2 };
        ((scaled + half) / scale) as i64
    }
}

impl FromStr for TimeBase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidParameter(format!("invalid time base '{}'", s));
        match s.split_once('/') {
            Some((num, den)) => {
                let num = num.trim().parse::<u32>().map_err(|_| invalid())?;
                let den = den.trim().parse::<u32>().map_err(|_| invalid())?;
                TimeBase::checked(num, den)
            }
            None => {
                let den = s.trim().parse::<u32>().map_err(|_| invalid())?;
                TimeBase::checked(1, den)
            }
        }
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl MediaKind {
    pub fn index(&self) -> usize {
        match self {
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Raw frame crossing a shared frame queue, tagged with its kind
#[derive(Debug, PartialEq)]
pub enum MediaFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl MediaFrame {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaFrame::Video(_) => MediaKind::Video,
            MediaFrame::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn pts(&self) -> Timestamp {
        match self {
            MediaFrame::Video(f) => f.pts,
            MediaFrame::Audio(f) => f.pts,
        }
    }

    pub fn set_pts(&mut self, pts: Timestamp) {
        match self {
            MediaFrame::Video(f) => f.pts = pts,
            MediaFrame::Audio(f) => f.pts = pts,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        match self {
            MediaFrame::Video(f) => f.size(),
            MediaFrame::Audio(f) => f.size(),
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, MediaFrame::Video(f) if f.keyframe)
    }

    /// Deep copy for a second, independent consumer
    pub fn copy_of(source: &MediaFrame) -> Self {
        match source {
            MediaFrame::Video(f) => MediaFrame::Video(VideoFrame::copy_of(f)),
            MediaFrame::Audio(f) => MediaFrame::Audio(AudioFrame::copy_of(f)),
        }
    }
}

impl From<VideoFrame> for MediaFrame {
    fn from(frame: VideoFrame) -> Self {
        MediaFrame::Video(frame)
    }
}

impl From<AudioFrame> for MediaFrame {
    fn from(frame: AudioFrame) -> Self {
        MediaFrame::Audio(frame)
    }
}

/// Compressed packet produced by an encode track
#[derive(Clone, PartialEq)]
pub struct EncodedPacket {
    /// Track this packet belongs to
    pub track: MediaKind,
    /// Compressed payload
    pub data: Bytes,
    /// Presentation timestamp
    pub pts: Timestamp,
    /// Decode timestamp
    pub dts: Timestamp,
    /// Duration in microseconds (0 when unknown)
    pub duration: i64,
    pub is_keyframe: bool,
}

impl EncodedPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("track", &self.track)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}

/// Format-specific description of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackFormat {
    Video {
        width: u32,
        height: u32,
        frame_rate: u32,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
    },
}

/// Backend-private codec parameters passed through to the container sink
pub type NativeParameters = Arc<dyn Any + Send + Sync>;

/// Everything a container needs to declare one track
#[derive(Clone)]
pub struct TrackParameters {
    pub track: MediaKind,
    /// Canonical codec name ("h264", "aac", ...)
    pub codec: String,
    /// Concrete encoder that produced the track ("h264_nvenc", "libx264", ...)
    pub encoder: String,
    pub bit_rate: u64,
    pub format: TrackFormat,
    /// Codec extradata (SPS/PPS, AudioSpecificConfig, ...)
    pub extradata: Bytes,
    pub native: Option<NativeParameters>,
}

impl std::fmt::Debug for TrackParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackParameters")
            .field("track", &self.track)
            .field("codec", &self.codec)
            .field("encoder", &self.encoder)
            .field("bit_rate", &self.bit_rate)
            .field("format", &self.format)
            .field("extradata", &self.extradata.len())
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Item on the encode → mux queue: the track table first, then packets
#[derive(Debug, Clone)]
pub enum MuxItem {
    Tracks(Vec<TrackParameters>),
    Packet(EncodedPacket),
}
