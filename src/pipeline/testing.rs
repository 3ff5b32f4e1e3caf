//! Test doubles for stages and collaborators

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::ConfigMap;
use crate::encoder::{BackendProvider, Codec, EncoderBackend, HwAccel, TrackSettings};
use crate::error::{Error, Result};
use crate::mux::{ContainerSink, MuxConfig, MuxStats};
use crate::pipeline::health::{StageHealth, StageRole};
use crate::pipeline::queue::{BoundedQueue, PopError};
use crate::pipeline::stage::{Flow, Module, ModuleContext, PortSpec, Ports, Wiring};
use crate::pipeline::types::{
    EncodedPacket, MediaFrame, MediaKind, MuxItem, Timestamp, TrackFormat, TrackParameters,
};

/// Producer whose queue the test fills by hand
pub struct FrameFeeder {
    name: String,
    kind: MediaKind,
    health: Arc<StageHealth>,
}

impl FrameFeeder {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            name: format!("feed-{}", kind.to_string().to_lowercase()),
            kind,
            health: Arc::new(StageHealth::new()),
        }
    }
}

impl Module for FrameFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StageRole {
        StageRole::Capture
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: Vec::new(),
            output: Some(PortSpec::frames(Some(self.kind))),
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, _config: &ConfigMap) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, _wiring: &Wiring) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        thread::sleep(wait);
        Ok(Flow::Idle)
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Same as [`FrameFeeder`] for the packet queue
pub struct PacketFeeder {
    health: Arc<StageHealth>,
}

impl PacketFeeder {
    pub fn new() -> Self {
        Self {
            health: Arc::new(StageHealth::new()),
        }
    }
}

impl Module for PacketFeeder {
    fn name(&self) -> &str {
        "feed-packets"
    }

    fn role(&self) -> StageRole {
        StageRole::Encode
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: Vec::new(),
            output: Some(PortSpec::packets()),
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, _config: &ConfigMap) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, _wiring: &Wiring) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        thread::sleep(wait);
        Ok(Flow::Idle)
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumer that keeps everything it pops
pub struct Collector<T> {
    name: &'static str,
    port: PortSpec,
    input: Option<Arc<BoundedQueue<T>>>,
    seen: Arc<Mutex<Vec<T>>>,
    health: Arc<StageHealth>,
}

pub type FrameCollector = Collector<MediaFrame>;

impl Collector<MediaFrame> {
    pub fn new() -> Self {
        Self {
            name: "collect-frames",
            port: PortSpec::frames(None),
            input: None,
            seen: Arc::new(Mutex::new(Vec::new())),
            health: Arc::new(StageHealth::new()),
        }
    }
}

impl<T> Collector<T> {
    pub fn seen(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.seen)
    }
}

/// A packet collector already wrapped in its context
pub fn packet_collector() -> ModuleContext {
    ModuleContext::new(Collector::<MuxItem> {
        name: "collect-packets",
        port: PortSpec::packets(),
        input: None,
        seen: Arc::new(Mutex::new(Vec::new())),
        health: Arc::new(StageHealth::new()),
    })
}

pub trait Bind: Sized {
    fn bind(wiring: &Wiring) -> Result<Arc<BoundedQueue<Self>>>;
}

impl Bind for MediaFrame {
    fn bind(wiring: &Wiring) -> Result<Arc<BoundedQueue<Self>>> {
        wiring.frames_in(0)
    }
}

impl Bind for MuxItem {
    fn bind(wiring: &Wiring) -> Result<Arc<BoundedQueue<Self>>> {
        wiring.packets_in(0)
    }
}

impl<T: Bind + Send + 'static> Module for Collector<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn role(&self) -> StageRole {
        StageRole::Mux
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![self.port],
            output: None,
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, _config: &ConfigMap) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, wiring: &Wiring) -> Result<()> {
        self.input = Some(T::bind(wiring)?);
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        let Some(input) = &self.input else {
            return Err(Error::NotInitialized);
        };
        match input.pop(wait) {
            Ok(item) => {
                self.health.record_input();
                self.health.record_frame(0, false);
                if let Ok(mut seen) = self.seen.lock() {
                    seen.push(item);
                }
                Ok(Flow::Continue)
            }
            Err(PopError::Empty) => Ok(Flow::Idle),
            Err(PopError::Closed) => Ok(Flow::Finished),
        }
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Encoder provider producing one fake packet per frame
pub struct ScriptedProvider {
    name: String,
    hw: HwAccel,
    codecs: Vec<Codec>,
    fail_open: bool,
    fail_every: Option<u64>,
}

impl ScriptedProvider {
    pub fn new(name: &str, hw: HwAccel, codecs: &[Codec]) -> Self {
        Self {
            name: name.to_string(),
            hw,
            codecs: codecs.to_vec(),
            fail_open: false,
            fail_every: None,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every `n`th submission fails
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }
}

impl BackendProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw(&self) -> HwAccel {
        self.hw
    }

    fn supports(&self, codec: Codec) -> bool {
        self.codecs.contains(&codec)
    }

    fn open(&self, settings: &TrackSettings) -> Result<Box<dyn EncoderBackend>> {
        if self.fail_open {
            return Err(Error::Unsupported(format!("{} device not present", self.name)));
        }
        Ok(Box::new(ScriptedBackend {
            name: self.name.clone(),
            settings: settings.clone(),
            fail_every: self.fail_every,
            submitted: 0,
            encoded: 0,
            pending: VecDeque::new(),
        }))
    }
}

struct ScriptedBackend {
    name: String,
    settings: TrackSettings,
    fail_every: Option<u64>,
    submitted: u64,
    encoded: u64,
    pending: VecDeque<EncodedPacket>,
}

impl EncoderBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> TrackParameters {
        TrackParameters {
            track: self.settings.kind(),
            codec: self.settings.codec.name().to_string(),
            encoder: self.name.clone(),
            bit_rate: self.settings.bit_rate,
            format: self.settings.format,
            extradata: Bytes::new(),
            native: None,
        }
    }

    fn submit(&mut self, frame: MediaFrame) -> Result<()> {
        self.submitted += 1;
        if self.fail_every.is_some_and(|n| self.submitted % n == 0) {
            return Err(Error::Encoding(format!("scripted failure #{}", self.submitted)));
        }

        let duration = match &frame {
            MediaFrame::Video(_) => self.settings.time_base.period_micros(),
            MediaFrame::Audio(audio) => audio.duration_micros(),
        };
        let keyframe = match self.settings.kind() {
            MediaKind::Video => self.encoded % self.settings.gop_size.max(1) as u64 == 0,
            MediaKind::Audio => true,
        };
        self.encoded += 1;

        let mut packet = packet(self.settings.kind(), frame.pts().micros, 16);
        packet.duration = duration;
        packet.is_keyframe = keyframe;
        self.pending.push_back(packet);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<EncodedPacket>> {
        Ok(self.pending.pop_front())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Everything a [`MemorySink`] was asked to do
#[derive(Debug, Default)]
pub struct Recording {
    pub tracks: Vec<TrackParameters>,
    pub packets: Vec<EncodedPacket>,
    pub title: Option<String>,
    pub finished: Option<MuxStats>,
}

/// Container sink that records into memory
pub struct MemorySink {
    recording: Arc<Mutex<Recording>>,
    fail_every: Option<u64>,
    writes: u64,
    stats: MuxStats,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            recording: Arc::new(Mutex::new(Recording::default())),
            fail_every: None,
            writes: 0,
            stats: MuxStats::default(),
        }
    }

    /// Every `n`th write fails
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn recording(&self) -> Arc<Mutex<Recording>> {
        Arc::clone(&self.recording)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        super::lock(&self.recording)
    }
}

impl ContainerSink for MemorySink {
    fn open(&mut self, tracks: &[TrackParameters], config: &MuxConfig) -> Result<()> {
        let mut recording = self.lock();
        recording.tracks = tracks.to_vec();
        recording.title = config.title.clone();
        Ok(())
    }

    fn write(&mut self, packet: EncodedPacket) -> Result<()> {
        self.writes += 1;
        if self.fail_every.is_some_and(|n| self.writes % n == 0) {
            return Err(Error::Io(std::io::Error::other("scripted write failure")));
        }
        self.stats.packets_written += 1;
        self.stats.bytes_written += packet.size() as u64;
        self.lock().packets.push(packet);
        Ok(())
    }

    fn finish(&mut self) -> Result<MuxStats> {
        self.lock().finished = Some(self.stats);
        Ok(self.stats)
    }
}

/// A packet with `size` payload bytes
pub fn packet(track: MediaKind, pts: i64, size: usize) -> EncodedPacket {
    EncodedPacket {
        track,
        data: Bytes::from(vec![0u8; size]),
        pts: Timestamp::from_micros(pts),
        dts: Timestamp::from_micros(pts),
        duration: 0,
        is_keyframe: true,
    }
}

/// Track description with the default encoder settings
pub fn track(kind: MediaKind) -> TrackParameters {
    let (codec, format) = match kind {
        MediaKind::Video => (
            "h264",
            TrackFormat::Video {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
        ),
        MediaKind::Audio => (
            "aac",
            TrackFormat::Audio {
                sample_rate: 48_000,
                channels: 2,
            },
        ),
    };
    TrackParameters {
        track: kind,
        codec: codec.to_string(),
        encoder: "scripted".to_string(),
        bit_rate: 0,
        format,
        extradata: Bytes::new(),
        native: None,
    }
}
