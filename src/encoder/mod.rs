//! Encode orchestration
//!
//! Raw synchronized frames are compressed by an [`EncoderBackend`] chosen per
//! track by the [`BackendSelector`]. Backends are reached through
//! [`BackendProvider`]s, so the pipeline never knows whether a hardware or a
//! software encoder is active.

mod backend;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
mod orchestrator;

use serde::Deserialize;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::pipeline::types::{MediaKind, TimeBase, TrackFormat};

pub use backend::{BackendProvider, BackendSelector, EncoderBackend};
pub use orchestrator::EncodeOrchestrator;

/// Codecs the pipeline can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Av1,
    Vp9,
    Aac,
    Opus,
    Mp3,
    Flac,
}

impl Codec {
    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::H264 | Codec::Hevc | Codec::Av1 | Codec::Vp9 => MediaKind::Video,
            Codec::Aac | Codec::Opus | Codec::Mp3 | Codec::Flac => MediaKind::Audio,
        }
    }

    /// Canonical name, as written in configuration and container metadata
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Av1 => "av1",
            Codec::Vp9 => "vp9",
            Codec::Aac => "aac",
            Codec::Opus => "opus",
            Codec::Mp3 => "mp3",
            Codec::Flac => "flac",
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "hevc" | "h265" => Ok(Codec::Hevc),
            "av1" => Ok(Codec::Av1),
            "vp9" => Ok(Codec::Vp9),
            "aac" => Ok(Codec::Aac),
            "opus" => Ok(Codec::Opus),
            "mp3" => Ok(Codec::Mp3),
            "flac" => Ok(Codec::Flac),
            other => Err(Error::Unsupported(format!("codec '{}'", other))),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware acceleration preference; `None` also marks software providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[default]
    Auto,
    None,
    Nvenc,
    Qsv,
    Amf,
    VideoToolbox,
}

impl HwAccel {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, HwAccel::Auto | HwAccel::None)
    }
}

impl FromStr for HwAccel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(HwAccel::Auto),
            "none" | "software" => Ok(HwAccel::None),
            "nvenc" => Ok(HwAccel::Nvenc),
            "qsv" => Ok(HwAccel::Qsv),
            "amf" => Ok(HwAccel::Amf),
            "videotoolbox" => Ok(HwAccel::VideoToolbox),
            other => Err(Error::InvalidParameter(format!("hardware acceleration '{}'", other))),
        }
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HwAccel::Auto => "auto",
            HwAccel::None => "none",
            HwAccel::Nvenc => "nvenc",
            HwAccel::Qsv => "qsv",
            HwAccel::Amf => "amf",
            HwAccel::VideoToolbox => "videotoolbox",
        };
        f.write_str(name)
    }
}

/// Encoder settings, read from the `"encode"` scope
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Empty disables the video track
    pub video_codec: String,
    /// Empty disables the audio track
    pub audio_codec: String,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    /// Keyframe interval in frames (0 = twice the frame rate)
    pub gop_size: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub hw_accel: HwAccel,
    /// Frames buffered per track ahead of the encoder (0 = default)
    pub track_queue_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            video_bitrate: 4_000_000,
            audio_bitrate: 128_000,
            gop_size: 0,
            width: 1280,
            height: 720,
            frame_rate: 30,
            sample_rate: 48_000,
            channels: 2,
            hw_accel: HwAccel::Auto,
            track_queue_size: 0,
        }
    }
}

/// Default per-track queue depth
pub const DEFAULT_TRACK_QUEUE_SIZE: usize = 16;

impl EncoderConfig {
    pub fn effective_gop(&self) -> u32 {
        match self.gop_size {
            0 => self.frame_rate.saturating_mul(2),
            n => n,
        }
    }

    pub fn track_queue_size(&self) -> usize {
        match self.track_queue_size {
            0 => DEFAULT_TRACK_QUEUE_SIZE,
            n => n.max(2),
        }
    }

    fn codec_for(&self, kind: MediaKind) -> Result<Option<Codec>> {
        let name = match kind {
            MediaKind::Video => &self.video_codec,
            MediaKind::Audio => &self.audio_codec,
        };
        if name.trim().is_empty() {
            return Ok(None);
        }
        let codec: Codec = name.parse()?;
        if codec.kind() != kind {
            return Err(Error::InvalidParameter(format!(
                "{} is not a {} codec",
                codec,
                kind.to_string().to_lowercase()
            )));
        }
        Ok(Some(codec))
    }

    /// Settings for one track, or `None` when the track is disabled
    pub fn track(&self, kind: MediaKind) -> Result<Option<TrackSettings>> {
        let Some(codec) = self.codec_for(kind)? else {
            return Ok(None);
        };

        let settings = match kind {
            MediaKind::Video => {
                if self.width == 0 || self.height == 0 || self.frame_rate == 0 {
                    return Err(Error::InvalidParameter(format!(
                        "invalid video settings {}x{} @ {} fps",
                        self.width, self.height, self.frame_rate
                    )));
                }
                TrackSettings {
                    codec,
                    bit_rate: self.video_bitrate,
                    gop_size: self.effective_gop(),
                    format: TrackFormat::Video {
                        width: self.width,
                        height: self.height,
                        frame_rate: self.frame_rate,
                    },
                    time_base: TimeBase::checked(1, self.frame_rate)?,
                }
            }
            MediaKind::Audio => {
                if self.sample_rate == 0 || self.channels == 0 {
                    return Err(Error::InvalidParameter(format!(
                        "invalid audio settings {} Hz x {} ch",
                        self.sample_rate, self.channels
                    )));
                }
                TrackSettings {
                    codec,
                    bit_rate: self.audio_bitrate,
                    gop_size: 0,
                    format: TrackFormat::Audio {
                        sample_rate: self.sample_rate,
                        channels: self.channels,
                    },
                    time_base: TimeBase::checked(1, self.sample_rate)?,
                }
            }
        };
        Ok(Some(settings))
    }
}

/// What a backend is asked to open for one track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSettings {
    pub codec: Codec,
    pub bit_rate: u64,
    /// Keyframe interval in frames; unused for audio
    pub gop_size: u32,
    pub format: TrackFormat,
    pub time_base: TimeBase,
}

impl TrackSettings {
    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}
