//! FFmpeg encoder backends
//!
//! One [`BackendProvider`] per encoder family. Hardware families map each
//! codec to the vendor encoder (`h264_nvenc`, `hevc_qsv`, ...), the software
//! family covers every codec the pipeline knows.

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, ChannelLayout};
use ac_ffmpeg::codec::video::frame::{PictureType, get_pixel_format};
use ac_ffmpeg::codec::video::scaler::{Algorithm, VideoFrameScaler};
use ac_ffmpeg::codec::video::{self, VideoEncoder, VideoFrameMut};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase as AvTimeBase, Timestamp as AvTimestamp};
use bytes::Bytes;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{BackendProvider, Codec, EncoderBackend, HwAccel, TrackSettings};
use crate::error::{Error, Result};
use crate::pipeline::frame::{AudioFrame, PixelFormat, VideoFrame};
use crate::pipeline::types::{
    EncodedPacket, MediaFrame, MediaKind, TimeBase, Timestamp, TrackFormat, TrackParameters,
};

/// How the encoder wants its samples laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleLayout {
    /// Interleaved 32-bit float ("flt")
    Float,
    /// One 32-bit float plane per channel ("fltp")
    FloatPlanar,
    /// Interleaved signed 16-bit ("s16")
    Int16,
}

impl SampleLayout {
    fn ffmpeg_name(&self) -> &'static str {
        match self {
            SampleLayout::Float => "flt",
            SampleLayout::FloatPlanar => "fltp",
            SampleLayout::Int16 => "s16",
        }
    }
}

/// Input layout an encoder is fed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Pixels(PixelFormat),
    Samples(SampleLayout),
}

/// One concrete FFmpeg encoder and the options it is opened with
///
/// Bitrate and GOP are appended at open time from the track settings.
struct EncoderEntry {
    hw: HwAccel,
    codec: Codec,
    encoder: &'static str,
    input: InputFormat,
    options: &'static [(&'static str, &'static str)],
}

const NV12: InputFormat = InputFormat::Pixels(PixelFormat::Nv12);
const YUV420P: InputFormat = InputFormat::Pixels(PixelFormat::Yuv420p);

/// Encoder table, tuned for low latency.
///
/// - NVENC: p2 preset, ll tune, no delay
/// - QSV: fast preset with look-ahead
/// - AMF: lowlatency usage, balanced quality
/// - Software: zero-latency tunes, no B-frames
const ENCODERS: &[EncoderEntry] = &[
    EncoderEntry {
        hw: HwAccel::Nvenc,
        codec: Codec::H264,
        encoder: "h264_nvenc",
        input: NV12,
        options: &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("delay", "0"),
            ("forced-idr", "1"),
        ],
    },
    EncoderEntry {
        hw: HwAccel::Nvenc,
        codec: Codec::Hevc,
        encoder: "hevc_nvenc",
        input: NV12,
        options: &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("delay", "0"),
        ],
    },
    EncoderEntry {
        hw: HwAccel::Nvenc,
        codec: Codec::Av1,
        encoder: "av1_nvenc",
        input: NV12,
        options: &[("preset", "p2"), ("tune", "ll"), ("rc", "vbr")],
    },
    EncoderEntry {
        hw: HwAccel::Qsv,
        codec: Codec::H264,
        encoder: "h264_qsv",
        input: NV12,
        options: &[
            ("preset", "fast"),
            ("low_power", "0"),
            ("async_depth", "4"),
            ("look_ahead", "1"),
        ],
    },
    EncoderEntry {
        hw: HwAccel::Qsv,
        codec: Codec::Hevc,
        encoder: "hevc_qsv",
        input: NV12,
        options: &[("preset", "fast"), ("async_depth", "4")],
    },
    EncoderEntry {
        hw: HwAccel::Qsv,
        codec: Codec::Av1,
        encoder: "av1_qsv",
        input: NV12,
        options: &[("preset", "fast"), ("async_depth", "4")],
    },
    EncoderEntry {
        hw: HwAccel::Qsv,
        codec: Codec::Vp9,
        encoder: "vp9_qsv",
        input: NV12,
        options: &[("preset", "fast")],
    },
    EncoderEntry {
        hw: HwAccel::Amf,
        codec: Codec::H264,
        encoder: "h264_amf",
        input: NV12,
        options: &[
            ("usage", "lowlatency"),
            ("quality", "balanced"),
            ("rc", "vbr_peak"),
            ("preanalysis", "1"),
            ("frame_skipping", "0"),
        ],
    },
    EncoderEntry {
        hw: HwAccel::Amf,
        codec: Codec::Hevc,
        encoder: "hevc_amf",
        input: NV12,
        options: &[("usage", "lowlatency"), ("quality", "balanced"), ("rc", "vbr_peak")],
    },
    EncoderEntry {
        hw: HwAccel::Amf,
        codec: Codec::Av1,
        encoder: "av1_amf",
        input: NV12,
        options: &[("usage", "lowlatency"), ("quality", "balanced")],
    },
    EncoderEntry {
        hw: HwAccel::VideoToolbox,
        codec: Codec::H264,
        encoder: "h264_videotoolbox",
        input: NV12,
        options: &[("realtime", "1"), ("allow_sw", "0")],
    },
    EncoderEntry {
        hw: HwAccel::VideoToolbox,
        codec: Codec::Hevc,
        encoder: "hevc_videotoolbox",
        input: NV12,
        options: &[("realtime", "1"), ("allow_sw", "0")],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::H264,
        encoder: "libx264",
        input: NV12,
        options: &[
            ("profile", "main"),
            ("preset", "fast"),
            ("tune", "zerolatency"),
            ("threads", "0"),
            ("sliced-threads", "1"),
            ("sync-lookahead", "0"),
            ("bf", "0"),
        ],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Hevc,
        encoder: "libx265",
        input: YUV420P,
        options: &[("preset", "fast"), ("tune", "zerolatency")],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Av1,
        encoder: "libsvtav1",
        input: YUV420P,
        options: &[("preset", "10")],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Vp9,
        encoder: "libvpx-vp9",
        input: YUV420P,
        options: &[("deadline", "realtime"), ("cpu-used", "8"), ("row-mt", "1")],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Aac,
        encoder: "aac",
        input: InputFormat::Samples(SampleLayout::FloatPlanar),
        options: &[],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Opus,
        encoder: "libopus",
        input: InputFormat::Samples(SampleLayout::Float),
        options: &[("frame_duration", "20"), ("application", "lowdelay")],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Mp3,
        encoder: "libmp3lame",
        input: InputFormat::Samples(SampleLayout::FloatPlanar),
        options: &[],
    },
    EncoderEntry {
        hw: HwAccel::None,
        codec: Codec::Flac,
        encoder: "flac",
        input: InputFormat::Samples(SampleLayout::Int16),
        options: &[],
    },
];

/// Codec parameters of an open FFmpeg encoder, handed to the container sink
pub struct FfmpegParameters(pub CodecParameters);

// Parameters are never mutated after the encoder is opened
unsafe impl Send for FfmpegParameters {}
unsafe impl Sync for FfmpegParameters {}

/// All FFmpeg encoder families, hardware first
pub fn providers() -> Vec<Arc<dyn BackendProvider>> {
    [
        HwAccel::Nvenc,
        HwAccel::Qsv,
        HwAccel::Amf,
        HwAccel::VideoToolbox,
        HwAccel::None,
    ]
    .into_iter()
    .map(|hw| Arc::new(FfmpegProvider::new(hw)) as Arc<dyn BackendProvider>)
    .collect()
}

/// One encoder family
pub struct FfmpegProvider {
    hw: HwAccel,
    name: String,
}

impl FfmpegProvider {
    pub fn new(hw: HwAccel) -> Self {
        let family = if hw.is_hardware() {
            hw.to_string()
        } else {
            "software".to_string()
        };
        Self {
            hw,
            name: format!("ffmpeg-{}", family),
        }
    }

    fn entry(&self, codec: Codec) -> Option<&'static EncoderEntry> {
        ENCODERS.iter().find(|e| e.hw == self.hw && e.codec == codec)
    }
}

impl BackendProvider for FfmpegProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw(&self) -> HwAccel {
        self.hw
    }

    fn supports(&self, codec: Codec) -> bool {
        self.entry(codec).is_some()
    }

    fn open(&self, settings: &TrackSettings) -> Result<Box<dyn EncoderBackend>> {
        let entry = self.entry(settings.codec).ok_or_else(|| {
            Error::Unsupported(format!("{} has no {} encoder", self.name, settings.codec))
        })?;

        match (settings.format, entry.input) {
            (TrackFormat::Video { width, height, .. }, InputFormat::Pixels(format)) => Ok(Box::new(
                VideoBackend::open(entry, format, settings, width, height)?,
            )),
            (TrackFormat::Audio { sample_rate, channels }, InputFormat::Samples(layout)) => Ok(
                Box::new(AudioBackend::open(entry, layout, settings, sample_rate, channels)?),
            ),
            _ => Err(Error::InvalidParameter(format!(
                "{} cannot encode a {} track",
                entry.encoder,
                settings.kind()
            ))),
        }
    }
}

fn av_time_base(time_base: TimeBase) -> AvTimeBase {
    AvTimeBase::new(time_base.num as i32, time_base.den as i32)
}

/// Option list for an entry, with rate control from the track settings
fn encoder_options(entry: &EncoderEntry, settings: &TrackSettings) -> Vec<(String, String)> {
    let mut options: Vec<(String, String)> = entry
        .options
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if settings.bit_rate > 0 {
        options.push(("b".into(), settings.bit_rate.to_string()));
        if settings.kind() == MediaKind::Video {
            // Peak at 1.5x target with a 2x buffer
            options.push(("maxrate".into(), (settings.bit_rate * 3 / 2).to_string()));
            options.push(("bufsize".into(), (settings.bit_rate * 2).to_string()));
        }
    }
    if settings.kind() == MediaKind::Video && settings.gop_size > 0 {
        options.push(("g".into(), settings.gop_size.to_string()));
    }
    options
}

fn to_encoded_packet(packet: &Packet, track: MediaKind, duration: i64) -> EncodedPacket {
    let pts = packet.pts().as_micros().unwrap_or(0);
    let dts = packet.dts().as_micros().unwrap_or(pts);
    EncodedPacket {
        track,
        data: Bytes::copy_from_slice(packet.data()),
        pts: Timestamp::from_micros(pts),
        dts: Timestamp::from_micros(dts),
        duration,
        is_keyframe: packet.is_key(),
    }
}

/// Copy one plane, honoring both strides.
///
/// - Fast path 1: exact stride match, single memcpy
/// - Fast path 2: no padding on either side, single memcpy
/// - Fallback: row-by-row copy of `width` bytes
#[inline]
fn copy_plane(
    source: &[u8],
    stride: usize,
    line_size: usize,
    rows: usize,
    width: usize,
    destination: &mut [u8],
) {
    let copy_width = width.min(stride).min(line_size);
    let total_src = rows * stride;
    let total_dst = rows * line_size;

    if stride == line_size && source.len() >= total_src && destination.len() >= total_dst {
        destination[..total_dst].copy_from_slice(&source[..total_dst]);
        return;
    }

    if stride == copy_width && line_size == copy_width {
        let copy_len = copy_width * rows;
        if source.len() >= copy_len && destination.len() >= copy_len {
            destination[..copy_len].copy_from_slice(&source[..copy_len]);
            return;
        }
    }

    let src_end = source.len().saturating_sub(copy_width);
    let dst_end = destination.len().saturating_sub(copy_width);
    for r in 0..rows {
        let src_start = r * stride;
        let dst_start = r * line_size;
        if src_start > src_end || dst_start > dst_end {
            break;
        }
        destination[dst_start..dst_start + copy_width]
            .copy_from_slice(&source[src_start..src_start + copy_width]);
    }
}

/// Write every plane of a pipeline frame into an FFmpeg frame of the same
/// format and size
fn write_planes(frame: &VideoFrame, target: &mut VideoFrameMut) {
    let layout = frame.format().plane_layout(frame.width(), frame.height());
    let mut planes = target.planes_mut();
    for (i, (plane, geometry)) in frame.planes().iter().zip(layout).enumerate() {
        if i >= planes.len() || geometry.rows == 0 {
            break;
        }
        let data = planes[i].data_mut();
        let line_size = data.len() / geometry.rows;
        copy_plane(
            &plane.data,
            plane.stride,
            line_size,
            geometry.rows,
            geometry.stride,
            data,
        );
    }
}

/// Initial number of frames to pre-allocate in the pool
const INITIAL_POOL_SIZE: usize = 4;

/// Reusable encoder input frames
struct FramePool {
    frames: VecDeque<video::VideoFrame>,
    format: video::frame::PixelFormat,
    width: usize,
    height: usize,
    time_base: AvTimeBase,
}

impl FramePool {
    fn new(
        format: video::frame::PixelFormat,
        width: usize,
        height: usize,
        time_base: AvTimeBase,
    ) -> Self {
        let frames = (0..INITIAL_POOL_SIZE)
            .map(|_| {
                VideoFrameMut::black(format, width, height)
                    .with_time_base(time_base)
                    .freeze()
            })
            .collect();
        Self {
            frames,
            format,
            width,
            height,
            time_base,
        }
    }

    #[inline]
    fn put(&mut self, frame: video::VideoFrame) {
        if self.frames.len() < INITIAL_POOL_SIZE * 2 {
            self.frames.push_back(frame);
        }
    }

    /// A writable frame; frames still referenced by the encoder are skipped
    #[inline]
    fn take(&mut self) -> VideoFrameMut {
        for _ in 0..self.frames.len() {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                Err(frame) => self.frames.push_back(frame),
            }
        }
        VideoFrameMut::black(self.format, self.width, self.height).with_time_base(self.time_base)
    }
}

/// Converter for frames whose layout differs from the encoder input
struct Conversion {
    source: (PixelFormat, u32, u32),
    scaler: VideoFrameScaler,
}

struct VideoBackend {
    name: String,
    encoder: VideoEncoder,
    pool: FramePool,
    conversion: Option<Conversion>,
    input: PixelFormat,
    width: u32,
    height: u32,
    time_base: AvTimeBase,
    settings: TrackSettings,
}

// The encoder and scaler are only ever driven from one track worker
unsafe impl Send for VideoBackend {}

impl VideoBackend {
    fn open(
        entry: &EncoderEntry,
        input: PixelFormat,
        settings: &TrackSettings,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let width = if width.is_multiple_of(2) { width } else { width + 1 };
        let height = if height.is_multiple_of(2) { height } else { height + 1 };
        let time_base = av_time_base(settings.time_base);
        let pixel_format = get_pixel_format(input.ffmpeg_name());

        let mut builder = VideoEncoder::builder(entry.encoder)
            .map_err(|e| Error::Unsupported(format!("{} not available: {}", entry.encoder, e)))?
            .pixel_format(pixel_format)
            .width(width as usize)
            .height(height as usize)
            .time_base(time_base);
        for (k, v) in encoder_options(entry, settings) {
            builder = builder.set_option(&k, &v);
        }
        let encoder = builder.build().map_err(|e| {
            Error::Unsupported(format!("{} failed to initialize: {}", entry.encoder, e))
        })?;
        debug!("Encoder: opened {} at {}x{}", entry.encoder, width, height);

        Ok(Self {
            name: entry.encoder.to_string(),
            encoder,
            pool: FramePool::new(pixel_format, width as usize, height as usize, time_base),
            conversion: None,
            input,
            width,
            height,
            time_base,
            settings: settings.clone(),
        })
    }

    /// Encoder-ready frame holding the picture of `frame`
    fn prepare(&mut self, frame: &VideoFrame) -> Result<VideoFrameMut> {
        let mut target = self.pool.take();
        if frame.format() == self.input && frame.width() == self.width && frame.height() == self.height
        {
            write_planes(frame, &mut target);
            return Ok(target);
        }

        let source = (frame.format(), frame.width(), frame.height());
        if self.conversion.as_ref().is_none_or(|c| c.source != source) {
            debug!(
                "Encoder: converting {} {}x{} to {} {}x{}",
                source.0, source.1, source.2, self.input, self.width, self.height
            );
            let scaler = VideoFrameScaler::builder()
                .source_pixel_format(get_pixel_format(frame.format().ffmpeg_name()))
                .source_width(frame.width() as usize)
                .source_height(frame.height() as usize)
                .target_pixel_format(get_pixel_format(self.input.ffmpeg_name()))
                .target_width(self.width as usize)
                .target_height(self.height as usize)
                .algorithm(Algorithm::Bilinear)
                .build()?;
            self.conversion = Some(Conversion { source, scaler });
        }

        let mut staged = VideoFrameMut::black(
            get_pixel_format(frame.format().ffmpeg_name()),
            frame.width() as usize,
            frame.height() as usize,
        );
        write_planes(frame, &mut staged);
        let Some(conversion) = self.conversion.as_mut() else {
            return Err(Error::NotInitialized);
        };
        let scaled = conversion.scaler.scale(&staged.freeze())?;

        // Copy the converted picture into the pooled frame
        let layout = self.input.plane_layout(self.width, self.height);
        let planes = scaled.planes();
        let mut out = target.planes_mut();
        for (i, geometry) in layout.iter().enumerate() {
            if i >= planes.len() || i >= out.len() || geometry.rows == 0 {
                break;
            }
            let source = planes[i].data();
            let stride = source.len() / geometry.rows;
            let data = out[i].data_mut();
            let line_size = data.len() / geometry.rows;
            copy_plane(source, stride, line_size, geometry.rows, geometry.stride, data);
        }
        drop(out);
        Ok(target)
    }
}

impl EncoderBackend for VideoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> TrackParameters {
        let params: CodecParameters = self.encoder.codec_parameters().into();
        TrackParameters {
            track: MediaKind::Video,
            codec: self.settings.codec.name().to_string(),
            encoder: self.name.clone(),
            bit_rate: self.settings.bit_rate,
            format: TrackFormat::Video {
                width: self.width,
                height: self.height,
                frame_rate: self.settings.time_base.den / self.settings.time_base.num.max(1),
            },
            extradata: Bytes::new(),
            native: Some(Arc::new(FfmpegParameters(params))),
        }
    }

    fn submit(&mut self, frame: MediaFrame) -> Result<()> {
        let MediaFrame::Video(frame) = frame else {
            return Err(Error::InvalidParameter(format!("{} takes video frames", self.name)));
        };

        let picture_type = if frame.keyframe {
            PictureType::I
        } else {
            PictureType::None
        };
        let ticks = self.settings.time_base.micros_to_ticks(frame.pts.micros);
        let target = self
            .prepare(&frame)?
            .with_pts(AvTimestamp::new(ticks, self.time_base))
            .with_picture_type(picture_type)
            .freeze();

        self.encoder.push(target.clone())?;
        self.pool.put(target);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<EncodedPacket>> {
        let duration = self.settings.time_base.period_micros();
        Ok(self
            .encoder
            .take()?
            .map(|packet| to_encoded_packet(&packet, MediaKind::Video, duration)))
    }

    fn flush(&mut self) -> Result<()> {
        self.encoder.flush()?;
        Ok(())
    }
}

struct AudioBackend {
    name: String,
    encoder: AudioEncoder,
    layout: SampleLayout,
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    /// Pending samples, one buffer per output channel
    buffers: Vec<Vec<f32>>,
    /// Timestamp of the first pending sample, in samples
    next_pts: Option<i64>,
    time_base: AvTimeBase,
    settings: TrackSettings,
}

// The encoder is only ever driven from one track worker
unsafe impl Send for AudioBackend {}

impl AudioBackend {
    fn open(
        entry: &EncoderEntry,
        layout: SampleLayout,
        settings: &TrackSettings,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self> {
        let channel_layout = ChannelLayout::from_channels(channels as u32).ok_or_else(|| {
            Error::InvalidParameter(format!("no channel layout for {} channels", channels))
        })?;
        let time_base = AvTimeBase::new(1, sample_rate as i32);

        let mut builder = AudioEncoder::builder(entry.encoder)
            .map_err(|e| Error::Unsupported(format!("{} not available: {}", entry.encoder, e)))?
            .sample_rate(sample_rate)
            .channel_layout(channel_layout)
            .sample_format(get_sample_format(layout.ffmpeg_name()))
            .time_base(time_base);
        for (k, v) in encoder_options(entry, settings) {
            builder = builder.set_option(&k, &v);
        }
        let encoder = builder.build().map_err(|e| {
            Error::Unsupported(format!("{} failed to initialize: {}", entry.encoder, e))
        })?;

        // 20 ms when the codec accepts any frame size
        let frame_size = encoder
            .samples_per_frame()
            .unwrap_or(sample_rate as usize / 50)
            .max(1);
        debug!(
            "Encoder: opened {} at {} Hz, {} samples per frame",
            entry.encoder, sample_rate, frame_size
        );

        Ok(Self {
            name: entry.encoder.to_string(),
            encoder,
            layout,
            sample_rate,
            channels: channels as usize,
            frame_size,
            buffers: vec![Vec::new(); channels as usize],
            next_pts: None,
            time_base,
            settings: settings.clone(),
        })
    }

    fn pending(&self) -> usize {
        self.buffers.first().map_or(0, Vec::len)
    }

    /// Append a frame, mapping its channels onto the encoder's
    fn push_samples(&mut self, frame: &AudioFrame) {
        if self.pending() == 0 || self.next_pts.is_none() {
            let ticks = frame.pts.micros * self.sample_rate as i64 / 1_000_000;
            self.next_pts = Some(ticks - self.pending() as i64);
        }

        let planar = frame.to_planar_f32();
        for (ch, buffer) in self.buffers.iter_mut().enumerate() {
            let source = match planar.get(ch).or_else(|| planar.first()) {
                Some(source) => source,
                None => return,
            };
            buffer.extend_from_slice(source);
        }
    }

    /// Encode one frame from the head of the buffers
    fn encode_chunk(&mut self) -> Result<()> {
        let pts = self.next_pts.unwrap_or(0);
        let params = self.encoder.codec_parameters();
        let mut frame = AudioFrameMut::silence(
            params.channel_layout(),
            params.sample_format(),
            params.sample_rate(),
            self.frame_size,
        )
        .with_time_base(self.time_base)
        .with_pts(AvTimestamp::new(pts, self.time_base));

        let n = self.frame_size;
        {
            let mut planes = frame.planes_mut();
            match self.layout {
                SampleLayout::FloatPlanar => {
                    for (ch, buffer) in self.buffers.iter().enumerate() {
                        if ch >= planes.len() {
                            break;
                        }
                        let data = planes[ch].data_mut();
                        for (dst, s) in data.chunks_exact_mut(4).zip(&buffer[..n]) {
                            dst.copy_from_slice(&s.to_ne_bytes());
                        }
                    }
                }
                SampleLayout::Float | SampleLayout::Int16 => {
                    let width = if self.layout == SampleLayout::Float { 4 } else { 2 };
                    let data = planes[0].data_mut();
                    for (i, dst) in data.chunks_exact_mut(width).take(n * self.channels).enumerate() {
                        let s = self.buffers[i % self.channels][i / self.channels];
                        if width == 4 {
                            dst.copy_from_slice(&s.to_ne_bytes());
                        } else {
                            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            dst.copy_from_slice(&v.to_ne_bytes());
                        }
                    }
                }
            }
        }

        for buffer in &mut self.buffers {
            buffer.drain(..n);
        }
        self.next_pts = Some(pts + n as i64);

        self.encoder.push(frame.freeze())?;
        Ok(())
    }
}

impl EncoderBackend for AudioBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> TrackParameters {
        let params: CodecParameters = self.encoder.codec_parameters().into();
        TrackParameters {
            track: MediaKind::Audio,
            codec: self.settings.codec.name().to_string(),
            encoder: self.name.clone(),
            bit_rate: self.settings.bit_rate,
            format: TrackFormat::Audio {
                sample_rate: self.sample_rate,
                channels: self.channels as u16,
            },
            extradata: Bytes::new(),
            native: Some(Arc::new(FfmpegParameters(params))),
        }
    }

    fn submit(&mut self, frame: MediaFrame) -> Result<()> {
        let MediaFrame::Audio(frame) = frame else {
            return Err(Error::InvalidParameter(format!("{} takes audio frames", self.name)));
        };
        if frame.sample_rate() != self.sample_rate {
            return Err(Error::Encoding(format!(
                "{} Hz frame on a {} Hz track",
                frame.sample_rate(),
                self.sample_rate
            )));
        }

        self.push_samples(&frame);
        while self.pending() >= self.frame_size {
            self.encode_chunk()?;
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<EncodedPacket>> {
        let duration = self.frame_size as i64 * 1_000_000 / self.sample_rate as i64;
        Ok(self
            .encoder
            .take()?
            .map(|packet| to_encoded_packet(&packet, MediaKind::Audio, duration)))
    }

    fn flush(&mut self) -> Result<()> {
        // Pad the tail to a whole frame
        let pending = self.pending();
        if pending > 0 {
            for buffer in &mut self.buffers {
                buffer.resize(self.frame_size.max(pending), 0.0);
            }
            if let Err(e) = self.encode_chunk() {
                warn!("Encoder: failed to encode trailing audio: {}", e);
            }
        }
        self.encoder.flush()?;
        Ok(())
    }
}
