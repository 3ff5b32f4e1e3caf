use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use log::{debug, info};

use super::{FrameSource, SourcePoll};
use crate::error::{Error, Result};
use crate::pipeline::frame::{AudioFrame, PixelFormat, SampleFormat, VideoFrame};
use crate::pipeline::types::{MediaKind, Timestamp};

const BAR_COUNT: usize = 8;
const BAR_STEP: usize = 4;
const NEUTRAL_CHROMA: u8 = 128;

/// Frame timing shared by both synthetic sources
///
/// Frame `n` is due at `started + n * period`. Pausing moves `started`
/// forward by the paused span so the source does not burst on resume.
#[derive(Debug)]
struct Pacer {
    realtime: bool,
    started: Option<Instant>,
    paused_at: Option<Instant>,
}

impl Pacer {
    fn new(realtime: bool) -> Self {
        Self {
            realtime,
            started: None,
            paused_at: None,
        }
    }

    fn start(&mut self) {
        self.started = Some(Instant::now());
        self.paused_at = None;
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let (Some(paused_at), Some(started)) = (self.paused_at.take(), self.started.as_mut()) {
            *started += paused_at.elapsed();
        }
    }

    /// Wait for `offset` past the start; false when it is not due within `timeout`
    fn wait_until(&self, offset: Duration, timeout: Duration) -> bool {
        if !self.realtime {
            return true;
        }
        let Some(started) = self.started else {
            return true;
        };

        let remaining = (started + offset).saturating_duration_since(Instant::now());
        if remaining > timeout {
            std::thread::sleep(timeout);
            return false;
        }
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        true
    }
}

/// Moving vertical bars at a fixed frame rate
///
/// The first plane carries the bars, shifted a few bytes every frame; every
/// other plane is filled with neutral chroma.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_rate: u32,
    limit: Option<u64>,
    produced: u64,
    pacer: Pacer,
    open: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Nv12,
            frame_rate,
            limit: None,
            produced: 0,
            pacer: Pacer::new(false),
            open: false,
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// End the stream after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Deliver frames at wall-clock rate instead of as fast as they are pulled
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.pacer.realtime = realtime;
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced
    }

    fn period_micros(&self) -> i64 {
        1_000_000 / self.frame_rate as i64
    }

    fn render(&self, pts: Timestamp) -> Result<VideoFrame> {
        let mut frame = VideoFrame::new(self.width, self.height, self.format, pts)?;
        let shift = self.produced as usize * BAR_STEP;

        let layouts = self.format.plane_layout(self.width, self.height);
        for (index, layout) in layouts.iter().enumerate() {
            let Some(plane) = frame.plane_mut(index) else {
                continue;
            };
            if index > 0 {
                plane.fill(NEUTRAL_CHROMA);
                continue;
            }

            let bar_width = (layout.stride / BAR_COUNT).max(1);
            for row in plane.chunks_exact_mut(layout.stride) {
                for (col, byte) in row.iter_mut().enumerate() {
                    let bar = ((col + shift) / bar_width) % BAR_COUNT;
                    *byte = (bar * (255 / (BAR_COUNT - 1))) as u8;
                }
            }
        }

        frame.keyframe = self.produced == 0;
        Ok(frame)
    }
}

impl FrameSource for TestPatternSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn describe(&self) -> String {
        format!(
            "test pattern {}x{} {} @ {} fps",
            self.width, self.height, self.format, self.frame_rate
        )
    }

    fn open(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.frame_rate == 0 {
            return Err(Error::InvalidParameter(format!(
                "test pattern needs a non-zero size and rate, got {}x{} @ {}",
                self.width, self.height, self.frame_rate
            )));
        }
        self.produced = 0;
        self.pacer.start();
        self.open = true;
        info!("Capture: opened {}", self.describe());
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<SourcePoll> {
        if !self.open {
            return Err(Error::NotInitialized);
        }
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(SourcePoll::EndOfStream);
        }

        let pts = Timestamp::from_micros(self.produced as i64 * self.period_micros());
        if !self.pacer.wait_until(pts.as_duration(), timeout) {
            return Ok(SourcePoll::Pending);
        }

        let frame = self.render(pts)?;
        self.produced += 1;
        Ok(SourcePoll::Frame(frame.into()))
    }

    fn pause(&mut self) {
        self.pacer.pause();
    }

    fn resume(&mut self) {
        self.pacer.resume();
    }

    fn close(&mut self) {
        if self.open {
            debug!("Capture: test pattern closed after {} frames", self.produced);
        }
        self.open = false;
    }
}

/// Continuous sine tone, delivered as interleaved `f32` chunks
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    amplitude: f32,
    chunk_samples: usize,
    limit: Option<u64>,
    produced: u64,
    samples_emitted: u64,
    phase: f32,
    pacer: Pacer,
    open: bool,
}

impl ToneSource {
    /// 20 ms chunks by default
    pub fn new(sample_rate: u32, channels: u16, frequency: f32) -> Self {
        Self {
            sample_rate,
            channels,
            frequency,
            amplitude: 0.25,
            chunk_samples: (sample_rate / 50) as usize,
            limit: None,
            produced: 0,
            samples_emitted: 0,
            phase: 0.0,
            pacer: Pacer::new(false),
            open: false,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    /// Samples per channel in each delivered frame
    pub fn with_chunk(mut self, samples: usize) -> Self {
        self.chunk_samples = samples;
        self
    }

    /// End the stream after `frames` chunks
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.pacer.realtime = realtime;
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced
    }

    fn render(&mut self, pts: Timestamp) -> Result<AudioFrame> {
        let channels = self.channels as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(self.chunk_samples * channels * 4)?;

        let step = TAU * self.frequency / self.sample_rate as f32;
        for _ in 0..self.chunk_samples {
            let value = self.phase.sin() * self.amplitude;
            for _ in 0..channels {
                data.extend_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % TAU;
        }

        AudioFrame::from_data(self.sample_rate, self.channels, SampleFormat::F32, pts, data)
    }
}

impl FrameSource for ToneSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn describe(&self) -> String {
        format!(
            "tone {} Hz, {} Hz x {} ch",
            self.frequency, self.sample_rate, self.channels
        )
    }

    fn open(&mut self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.chunk_samples == 0 {
            return Err(Error::InvalidParameter(format!(
                "tone needs a non-zero rate, channel count and chunk, got {} Hz x {} ch / {}",
                self.sample_rate, self.channels, self.chunk_samples
            )));
        }
        self.produced = 0;
        self.samples_emitted = 0;
        self.phase = 0.0;
        self.pacer.start();
        self.open = true;
        info!("Capture: opened {}", self.describe());
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<SourcePoll> {
        if !self.open {
            return Err(Error::NotInitialized);
        }
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(SourcePoll::EndOfStream);
        }

        let pts = Timestamp::from_micros(
            (self.samples_emitted * 1_000_000 / self.sample_rate as u64) as i64,
        );
        if !self.pacer.wait_until(pts.as_duration(), timeout) {
            return Ok(SourcePoll::Pending);
        }

        let frame = self.render(pts)?;
        self.produced += 1;
        self.samples_emitted += self.chunk_samples as u64;
        Ok(SourcePoll::Frame(frame.into()))
    }

    fn pause(&mut self) {
        self.pacer.pause();
    }

    fn resume(&mut self) {
        self.pacer.resume();
    }

    fn close(&mut self) {
        if self.open {
            debug!("Capture: tone closed after {} frames", self.produced);
        }
        self.open = false;
    }
}
