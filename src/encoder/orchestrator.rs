use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{BackendSelector, EncoderBackend, EncoderConfig};
use crate::error::{Error, Result};
use crate::pipeline::health::StageHealth;
use crate::pipeline::queue::{BoundedQueue, PopError, PushError};
use crate::pipeline::types::{EncodedPacket, MediaFrame, MediaKind, MuxItem, TrackParameters};

struct Track {
    kind: MediaKind,
    parameters: TrackParameters,
    queue: Arc<BoundedQueue<MediaFrame>>,
    backend: Option<Box<dyn EncoderBackend>>,
    worker: Option<JoinHandle<()>>,
}

/// Owns one encode context per enabled track
///
/// Each track runs on its own worker (`encode-video`, `encode-audio`) fed
/// through a private bounded queue, so a slow video encoder never delays
/// audio. Packets of both tracks share one output queue.
pub struct EncodeOrchestrator {
    tracks: Vec<Track>,
    running: Arc<AtomicBool>,
    health: Arc<StageHealth>,
}

impl EncodeOrchestrator {
    /// Select and open a backend for every enabled track
    ///
    /// Nothing is spawned yet. Fails if no track is enabled or a codec cannot
    /// be encoded by any provider.
    pub fn open(
        config: &EncoderConfig,
        selector: &BackendSelector,
        health: Arc<StageHealth>,
    ) -> Result<Self> {
        let mut tracks = Vec::new();
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let Some(settings) = config.track(kind)? else {
                debug!("Encoder: {} track disabled", kind);
                continue;
            };
            let backend = selector.open(&settings, config.hw_accel)?;
            tracks.push(Track {
                kind,
                parameters: backend.parameters(),
                queue: Arc::new(BoundedQueue::new(config.track_queue_size())?),
                backend: Some(backend),
                worker: None,
            });
        }

        if tracks.is_empty() {
            return Err(Error::InvalidParameter(
                "both video_codec and audio_codec are disabled".into(),
            ));
        }

        Ok(Self {
            tracks,
            running: Arc::new(AtomicBool::new(false)),
            health,
        })
    }

    /// Track table for the container, video first
    pub fn parameters(&self) -> Vec<TrackParameters> {
        self.tracks.iter().map(|t| t.parameters.clone()).collect()
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn one worker per track writing packets to `output`
    pub fn start(&mut self, output: Arc<BoundedQueue<MuxItem>>, wait: Duration) -> Result<()> {
        if self.is_running() {
            return Err(Error::invalid_state("start", "Running"));
        }
        self.running.store(true, Ordering::Release);

        for i in 0..self.tracks.len() {
            let track = &mut self.tracks[i];
            let Some(backend) = track.backend.take() else {
                self.halt();
                return Err(Error::invalid_state("start", "Finished"));
            };
            let worker = TrackWorker {
                kind: track.kind,
                input: Arc::clone(&track.queue),
                output: Arc::clone(&output),
                running: Arc::clone(&self.running),
                health: Arc::clone(&self.health),
                wait,
            };
            let spawned = thread::Builder::new()
                .name(format!("encode-{}", track.kind.to_string().to_lowercase()))
                .spawn(move || worker.run(backend));
            match spawned {
                Ok(handle) => track.worker = Some(handle),
                Err(e) => {
                    self.halt();
                    return Err(Error::Io(e));
                }
            }
        }

        info!(
            "Encoder: started {} track worker(s) ({})",
            self.tracks.len(),
            self.tracks
                .iter()
                .map(|t| t.parameters.encoder.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Hand a frame to its track, waiting at most `timeout` for space
    ///
    /// A frame for a disabled track, or one that does not fit in time, is
    /// returned to the caller, who counts it as dropped.
    pub fn submit(&self, frame: MediaFrame, timeout: Duration) -> std::result::Result<(), MediaFrame> {
        let Some(track) = self.tracks.iter().find(|t| t.kind == frame.kind()) else {
            return Err(frame);
        };
        track
            .queue
            .push(frame, timeout)
            .map_err(PushError::into_inner)
    }

    /// Close the track queues and wait for every worker to drain and flush
    pub fn finish(&mut self) {
        for track in &self.tracks {
            track.queue.close();
        }
        self.join();
        self.running.store(false, Ordering::Release);
    }

    /// Stop the workers without waiting for queued frames
    pub fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        for track in &self.tracks {
            track.queue.close();
        }
        self.join();

        let mut discarded = 0;
        for track in &self.tracks {
            discarded += track.queue.clear();
        }
        if discarded > 0 {
            for _ in 0..discarded {
                self.health.record_frame_drop();
            }
            info!("Encoder: discarded {} queued frames", discarded);
        }
    }

    fn join(&mut self) {
        for track in &mut self.tracks {
            if let Some(handle) = track.worker.take()
                && handle.join().is_err()
            {
                error!("Encoder: {} worker panicked", track.kind);
            }
        }
    }
}

impl Drop for EncodeOrchestrator {
    fn drop(&mut self) {
        self.halt();
    }
}

struct TrackWorker {
    kind: MediaKind,
    input: Arc<BoundedQueue<MediaFrame>>,
    output: Arc<BoundedQueue<MuxItem>>,
    running: Arc<AtomicBool>,
    health: Arc<StageHealth>,
    wait: Duration,
}

impl TrackWorker {
    fn run(self, mut backend: Box<dyn EncoderBackend>) {
        debug!("Encoder: {} worker running on {}", self.kind, backend.name());

        while self.running.load(Ordering::Acquire) {
            match self.input.pop(self.wait) {
                Ok(frame) => {
                    let pts = frame.pts();
                    if let Err(e) = backend.submit(frame) {
                        warn!("Encoder: dropping {} frame at {}: {}", self.kind, pts, e);
                        self.health.record_frame_drop();
                        self.health.record_error(e.to_string());
                        continue;
                    }
                    if !self.drain(backend.as_mut()) {
                        break;
                    }
                }
                Err(PopError::Empty) => {}
                Err(PopError::Closed) => {
                    if let Err(e) = backend.flush() {
                        warn!("Encoder: {} flush failed: {}", self.kind, e);
                        self.health.record_error(e.to_string());
                    }
                    self.drain(backend.as_mut());
                    debug!("Encoder: {} track finished", self.kind);
                    break;
                }
            }
        }
    }

    /// Move every finished packet downstream; false once the output is gone
    fn drain(&self, backend: &mut dyn EncoderBackend) -> bool {
        loop {
            let packet = match backend.receive() {
                Ok(Some(packet)) => packet,
                Ok(None) => return true,
                Err(e) => {
                    warn!("Encoder: {} receive failed: {}", self.kind, e);
                    self.health.record_error(e.to_string());
                    return true;
                }
            };
            if !self.forward(packet) {
                return false;
            }
        }
    }

    fn forward(&self, packet: EncodedPacket) -> bool {
        let size = packet.size();
        let keyframe = packet.is_keyframe;
        let mut item = MuxItem::Packet(packet);
        loop {
            match self.output.push(item, self.wait) {
                Ok(()) => {
                    self.health.record_frame(size, keyframe);
                    return true;
                }
                Err(PushError::Full(back)) => {
                    if !self.running.load(Ordering::Acquire) {
                        self.health.record_frame_drop();
                        return false;
                    }
                    item = back;
                }
                Err(PushError::Closed(_)) => {
                    warn!("Encoder: {} output closed downstream", self.kind);
                    self.health.record_frame_drop();
                    self.input.close();
                    return false;
                }
            }
        }
    }
}
