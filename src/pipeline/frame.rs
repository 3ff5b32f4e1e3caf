//! Raw (decoded) video and audio frames
//!
//! Frames own their buffers exclusively. Handing a frame to a queue moves it;
//! the only way to get a second, independent frame is the explicit deep copy
//! constructor (`copy_of`). Neither type implements `Clone`.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::pipeline::types::Timestamp;

/// Maximum number of planes a video frame can carry
pub const MAX_PLANES: usize = 4;

/// Raw pixel layouts understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Y plane + interleaved UV plane, 4:2:0
    Nv12,
    /// Three planes, 4:2:0
    Yuv420p,
    /// Three planes, 4:2:2
    Yuv422p,
    /// Three planes, 4:4:4
    Yuv444p,
    /// 10-bit NV12 in 16-bit little-endian words
    P010,
    Bgra,
    Rgba,
    Rgb24,
    Gray8,
}

/// One row of the per-format plane table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneSpec {
    /// Bytes per component sample
    bytes_per_sample: usize,
    /// Interleaved components per pixel in this plane
    components: usize,
    /// Horizontal subsampling (log2)
    x_shift: u32,
    /// Vertical subsampling (log2)
    y_shift: u32,
}

const fn plane(bytes_per_sample: usize, components: usize, x_shift: u32, y_shift: u32) -> PlaneSpec {
    PlaneSpec {
        bytes_per_sample,
        components,
        x_shift,
        y_shift,
    }
}

const LUMA: PlaneSpec = plane(1, 1, 0, 0);

const NV12_PLANES: [PlaneSpec; 2] = [LUMA, plane(1, 2, 1, 1)];
const YUV420P_PLANES: [PlaneSpec; 3] = [LUMA, plane(1, 1, 1, 1), plane(1, 1, 1, 1)];
const YUV422P_PLANES: [PlaneSpec; 3] = [LUMA, plane(1, 1, 1, 0), plane(1, 1, 1, 0)];
const YUV444P_PLANES: [PlaneSpec; 3] = [LUMA, LUMA, LUMA];
const P010_PLANES: [PlaneSpec; 2] = [plane(2, 1, 0, 0), plane(2, 2, 1, 1)];
const RGBX_PLANES: [PlaneSpec; 1] = [plane(1, 4, 0, 0)];
const RGB24_PLANES: [PlaneSpec; 1] = [plane(1, 3, 0, 0)];
const GRAY8_PLANES: [PlaneSpec; 1] = [LUMA];

/// Resolved geometry of one plane for a given frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bytes per row
    pub stride: usize,
    /// Number of rows
    pub rows: usize,
}

impl PlaneLayout {
    pub fn size(&self) -> usize {
        self.stride * self.rows
    }
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Nv12,
        PixelFormat::Yuv420p,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::P010,
        PixelFormat::Bgra,
        PixelFormat::Rgba,
        PixelFormat::Rgb24,
        PixelFormat::Gray8,
    ];

    fn planes(&self) -> &'static [PlaneSpec] {
        match self {
            PixelFormat::Nv12 => &NV12_PLANES,
            PixelFormat::Yuv420p => &YUV420P_PLANES,
            PixelFormat::Yuv422p => &YUV422P_PLANES,
            PixelFormat::Yuv444p => &YUV444P_PLANES,
            PixelFormat::P010 => &P010_PLANES,
            PixelFormat::Bgra | PixelFormat::Rgba => &RGBX_PLANES,
            PixelFormat::Rgb24 => &RGB24_PLANES,
            PixelFormat::Gray8 => &GRAY8_PLANES,
        }
    }

    /// Number of planes for this format
    pub fn plane_count(&self) -> usize {
        self.planes().len()
    }

    /// Stride and row count of every plane for a `width` x `height` frame.
    /// Subsampled planes round odd dimensions up.
    pub fn plane_layout(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let (w, h) = (width as usize, height as usize);
        self.planes()
            .iter()
            .map(|p| {
                let cols = w.div_ceil(1 << p.x_shift);
                let rows = h.div_ceil(1 << p.y_shift);
                PlaneLayout {
                    stride: cols * p.components * p.bytes_per_sample,
                    rows,
                }
            })
            .collect()
    }

    /// Total bytes of a frame in this format
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height).iter().map(PlaneLayout::size).sum()
    }

    /// FFmpeg pixel format name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::P010 => "p010le",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Gray8 => "gray",
        }
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.ffmpeg_name() == lower || format!("{:?}", f).to_ascii_lowercase() == lower)
            .ok_or_else(|| Error::Unsupported(format!("pixel format '{}'", s)))
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// A single plane buffer
#[derive(Debug, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

fn alloc_zeroed(len: usize, fill: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, fill);
    Ok(buf)
}

/// Decoded video frame
#[derive(Debug, PartialEq, Eq)]
pub struct VideoFrame {
    planes: Vec<Plane>,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Presentation timestamp
    pub pts: Timestamp,
    /// Whether this frame should start a new GOP
    pub keyframe: bool,
}

impl VideoFrame {
    /// Allocate a zeroed frame with plane sizes taken from the format table
    pub fn new(width: u32, height: u32, format: PixelFormat, pts: Timestamp) -> Result<Self> {
        Self::check_dimensions(width, height)?;
        let planes = format
            .plane_layout(width, height)
            .into_iter()
            .map(|layout| {
                Ok(Plane {
                    data: alloc_zeroed(layout.size(), 0)?,
                    stride: layout.stride,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            planes,
            width,
            height,
            format,
            pts,
            keyframe: false,
        })
    }

    /// Wrap captured plane buffers
    ///
    /// Plane count and every plane size must match the format table exactly.
    pub fn from_planes(
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: Timestamp,
        planes: Vec<Vec<u8>>,
    ) -> Result<Self> {
        Self::check_dimensions(width, height)?;
        let layout = format.plane_layout(width, height);
        if planes.len() != layout.len() {
            return Err(Error::InvalidParameter(format!(
                "{} expects {} planes, got {}",
                format,
                layout.len(),
                planes.len()
            )));
        }

        let mut out = Vec::with_capacity(planes.len());
        for (i, (data, expected)) in planes.into_iter().zip(layout).enumerate() {
            if data.len() != expected.size() {
                return Err(Error::InvalidParameter(format!(
                    "{} plane {} must be {} bytes ({}x{}), got {}",
                    format,
                    i,
                    expected.size(),
                    expected.stride,
                    expected.rows,
                    data.len()
                )));
            }
            out.push(Plane {
                data,
                stride: expected.stride,
            });
        }

        Ok(Self {
            planes: out,
            width,
            height,
            format,
            pts,
            keyframe: false,
        })
    }

    fn check_dimensions(width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "invalid frame size {}x{}",
                width, height
            )));
        }
        Ok(())
    }

    /// Deep copy: the new frame shares no buffer with `source`
    pub fn copy_of(source: &VideoFrame) -> Self {
        Self {
            planes: source
                .planes
                .iter()
                .map(|p| Plane {
                    data: p.data.clone(),
                    stride: p.stride,
                })
                .collect(),
            width: source.width,
            height: source.height,
            format: source.format,
            pts: source.pts,
            keyframe: source.keyframe,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    /// Mutable access to one plane's bytes (length is fixed)
    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.planes.get_mut(index).map(|p| p.data.as_mut_slice())
    }

    /// Total payload size in bytes
    pub fn size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

/// Raw audio sample layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    /// Planar signed 16-bit
    S16p,
    /// Planar 32-bit float
    F32p,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 7] = [
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::S32,
        SampleFormat::F32,
        SampleFormat::F64,
        SampleFormat::S16p,
        SampleFormat::F32p,
    ];

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::S32 | SampleFormat::F32 | SampleFormat::F32p => 4,
            SampleFormat::F64 => 8,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::S16p | SampleFormat::F32p)
    }

    /// FFmpeg sample format name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "flt",
            SampleFormat::F64 => "dbl",
            SampleFormat::S16p => "s16p",
            SampleFormat::F32p => "fltp",
        }
    }

    /// Decode one sample to f32 in [-1, 1]
    fn read(&self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
            SampleFormat::S16 | SampleFormat::S16p => {
                i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32768.0
            }
            SampleFormat::S32 => {
                i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
            }
            SampleFormat::F32 | SampleFormat::F32p => {
                f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            SampleFormat::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_ne_bytes(raw) as f32
            }
        }
    }

    fn silence_byte(&self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Decoded audio frame
#[derive(Debug, PartialEq)]
pub struct AudioFrame {
    data: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    samples: usize,
    /// Presentation timestamp of the first sample
    pub pts: Timestamp,
}

impl AudioFrame {
    /// Allocate a silent frame of `samples` samples per channel
    pub fn new(
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        samples: usize,
        pts: Timestamp,
    ) -> Result<Self> {
        Self::check_params(sample_rate, channels)?;
        let len = samples * channels as usize * format.bytes_per_sample();
        Ok(Self {
            data: alloc_zeroed(len, format.silence_byte())?,
            sample_rate,
            channels,
            format,
            samples,
            pts,
        })
    }

    /// Wrap a captured sample buffer; its length must be a whole number of sample frames
    pub fn from_data(
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        pts: Timestamp,
        data: Vec<u8>,
    ) -> Result<Self> {
        Self::check_params(sample_rate, channels)?;
        let frame_bytes = channels as usize * format.bytes_per_sample();
        if data.len() % frame_bytes != 0 {
            return Err(Error::InvalidParameter(format!(
                "audio buffer of {} bytes is not a multiple of {} ({} channels of {})",
                data.len(),
                frame_bytes,
                channels,
                format.ffmpeg_name()
            )));
        }
        Ok(Self {
            samples: data.len() / frame_bytes,
            data,
            sample_rate,
            channels,
            format,
            pts,
        })
    }

    fn check_params(sample_rate: u32, channels: u16) -> Result<()> {
        if sample_rate == 0 || channels == 0 {
            return Err(Error::InvalidParameter(format!(
                "invalid audio parameters: {} Hz, {} channels",
                sample_rate, channels
            )));
        }
        Ok(())
    }

    /// Deep copy: the new frame shares no buffer with `source`
    pub fn copy_of(source: &AudioFrame) -> Self {
        Self {
            data: source.data.clone(),
            sample_rate: source.sample_rate,
            channels: source.channels,
            format: source.format,
            samples: source.samples,
            pts: source.pts,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Samples per channel
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Playback duration in microseconds
    pub fn duration_micros(&self) -> i64 {
        (self.samples as i64 * 1_000_000) / self.sample_rate as i64
    }

    /// Samples converted to planar f32, one vector per channel
    pub fn to_planar_f32(&self) -> Vec<Vec<f32>> {
        let bps = self.format.bytes_per_sample();
        let channels = self.channels as usize;
        let mut out = vec![Vec::with_capacity(self.samples); channels];

        for (ch, samples) in out.iter_mut().enumerate() {
            for i in 0..self.samples {
                let offset = if self.format.is_planar() {
                    (ch * self.samples + i) * bps
                } else {
                    (i * channels + ch) * bps
                };
                samples.push(self.format.read(&self.data[offset..offset + bps]));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_table_nv12() {
        let layout = PixelFormat::Nv12.plane_layout(1920, 1080);
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[0], PlaneLayout { stride: 1920, rows: 1080 });
        assert_eq!(layout[1], PlaneLayout { stride: 1920, rows: 540 });
        assert_eq!(PixelFormat::Nv12.frame_size(1920, 1080), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_plane_count_for_every_format() {
        let expected = [2, 3, 3, 3, 2, 1, 1, 1, 1];
        for (format, planes) in PixelFormat::ALL.iter().zip(expected) {
            assert_eq!(format.plane_count(), planes, "{:?}", format);
            assert!(format.plane_count() <= MAX_PLANES);
            assert_eq!(format.plane_layout(16, 16).len(), planes);
        }
    }

    #[test]
    fn test_plane_table_odd_dimensions_round_up() {
        let layout = PixelFormat::Yuv420p.plane_layout(5, 3);
        assert_eq!(layout[0], PlaneLayout { stride: 5, rows: 3 });
        assert_eq!(layout[1], PlaneLayout { stride: 3, rows: 2 });
        assert_eq!(layout[2], PlaneLayout { stride: 3, rows: 2 });

        let p010 = PixelFormat::P010.plane_layout(3, 3);
        assert_eq!(p010[0], PlaneLayout { stride: 6, rows: 3 });
        assert_eq!(p010[1], PlaneLayout { stride: 8, rows: 2 });
    }

    #[test]
    fn test_packed_formats() {
        assert_eq!(PixelFormat::Bgra.plane_layout(10, 2)[0].stride, 40);
        assert_eq!(PixelFormat::Rgb24.plane_layout(10, 2)[0].stride, 30);
        assert_eq!(PixelFormat::Gray8.plane_count(), 1);
        assert_eq!(PixelFormat::Yuv422p.plane_layout(8, 4)[1], PlaneLayout { stride: 4, rows: 4 });
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert_eq!("YUV420P".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv420p);
        assert!("xyz".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_new_frame_matches_table() {
        for format in PixelFormat::ALL {
            let frame = VideoFrame::new(64, 48, format, Timestamp::from_micros(0)).unwrap();
            assert_eq!(frame.planes().len(), format.plane_count());
            assert_eq!(frame.size(), format.frame_size(64, 48));
        }
    }

    #[test]
    fn test_from_planes_validates_sizes() {
        let ts = Timestamp::from_micros(0);
        let ok = VideoFrame::from_planes(4, 4, PixelFormat::Nv12, ts, vec![vec![0; 16], vec![0; 8]]);
        assert!(ok.is_ok());

        let short = VideoFrame::from_planes(4, 4, PixelFormat::Nv12, ts, vec![vec![0; 16], vec![0; 4]]);
        assert!(matches!(short, Err(Error::InvalidParameter(_))));

        let count = VideoFrame::from_planes(4, 4, PixelFormat::Nv12, ts, vec![vec![0; 16]]);
        assert!(matches!(count, Err(Error::InvalidParameter(_))));

        assert!(VideoFrame::new(0, 4, PixelFormat::Nv12, ts).is_err());
    }

    #[test]
    fn test_video_copy_is_deep_for_every_format() {
        for format in PixelFormat::ALL {
            let mut original = VideoFrame::new(16, 8, format, Timestamp::from_micros(42)).unwrap();
            original.keyframe = true;
            for i in 0..format.plane_count() {
                original.plane_mut(i).unwrap().fill(7);
            }

            let mut copy = VideoFrame::copy_of(&original);
            assert_eq!(copy, original);

            for i in 0..format.plane_count() {
                copy.plane_mut(i).unwrap().fill(200);
            }
            copy.pts = Timestamp::from_micros(0);

            for plane in original.planes() {
                assert!(plane.data.iter().all(|&b| b == 7), "{} shared a buffer", format);
            }
            assert_eq!(original.pts.micros, 42);
        }
    }

    #[test]
    fn test_audio_copy_is_deep_for_every_format() {
        for format in SampleFormat::ALL {
            let mut original =
                AudioFrame::new(48_000, 2, format, 480, Timestamp::from_micros(5)).unwrap();
            original.data_mut().fill(3);

            let mut copy = AudioFrame::copy_of(&original);
            assert_eq!(copy, original);
            copy.data_mut().fill(9);

            assert!(original.data().iter().all(|&b| b == 3), "{:?} shared a buffer", format);
        }
    }

    #[test]
    fn test_audio_silence_and_duration() {
        let frame = AudioFrame::new(48_000, 2, SampleFormat::U8, 960, Timestamp::from_micros(0)).unwrap();
        assert!(frame.data().iter().all(|&b| b == 0x80));
        assert_eq!(frame.duration_micros(), 20_000);
        assert_eq!(frame.size(), 960 * 2);
    }

    #[test]
    fn test_audio_from_data_validates_length() {
        let ts = Timestamp::from_micros(0);
        let frame = AudioFrame::from_data(48_000, 2, SampleFormat::S16, ts, vec![0; 400]).unwrap();
        assert_eq!(frame.samples(), 100);
        assert!(AudioFrame::from_data(48_000, 2, SampleFormat::S16, ts, vec![0; 401]).is_err());
        assert!(AudioFrame::from_data(0, 2, SampleFormat::S16, ts, vec![0; 4]).is_err());
    }

    #[test]
    fn test_to_planar_f32_interleaved_and_planar() {
        let ts = Timestamp::from_micros(0);
        let interleaved: Vec<u8> = [0.5f32, -0.5, 0.25, -0.25]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let frame = AudioFrame::from_data(48_000, 2, SampleFormat::F32, ts, interleaved).unwrap();
        assert_eq!(frame.to_planar_f32(), vec![vec![0.5, 0.25], vec![-0.5, -0.25]]);

        let planar: Vec<u8> = [16384i16, -16384, 8192, -8192]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let frame = AudioFrame::from_data(48_000, 2, SampleFormat::S16p, ts, planar).unwrap();
        assert_eq!(frame.to_planar_f32(), vec![vec![0.5, -0.5], vec![0.25, -0.25]]);
    }
}
