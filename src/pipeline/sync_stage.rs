//! A/V synchronization stage
//!
//! Merges the raw video and audio streams into one time-ordered stream on a
//! common timeline. Each stream's first PTS maps to a shared wall-clock
//! anchor; a frame falls due at
//!
//! ```text
//! target = (pts - stream.base_pts) + anchor + stream.offset
//! ```
//!
//! and is emitted once the clock reaches its target. When the pending video
//! and audio targets drift apart by more than the threshold, the later
//! stream's offset is pulled back so its pending frame lines up with the
//! earlier one. No frame is dropped to correct drift.
//!
//! A pause never moves the anchor. On resume each stream finds out from its
//! next frames whether its PTS kept running through the pause; only a stream
//! whose PTS did not advance has the paused span added to its offset.

use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ConfigMap;
use crate::error::{Error, Result};
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::{StageHealth, StageRole};
use crate::pipeline::queue::{BoundedQueue, PopError, PushError};
use crate::pipeline::stage::{Flow, Module, PortSpec, Ports, Wiring};
use crate::pipeline::types::{MediaFrame, MediaKind, TimeBase, Timestamp};

/// Configuration for A/V synchronization
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum tolerated |video - audio| target difference before retiming
    pub audio_drift_threshold_ms: u64,
    pub video_time_base: TimeBase,
    pub audio_time_base: TimeBase,
    /// How long a frame waits for a silent opposite stream (0 = two video periods)
    pub max_stream_wait_ms: u64,
    /// Upper bound on one idle sleep of the stage
    pub sync_tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            audio_drift_threshold_ms: 40,
            video_time_base: TimeBase { num: 1, den: 30 },
            audio_time_base: TimeBase { num: 1, den: 48_000 },
            max_stream_wait_ms: 0,
            sync_tick_ms: 5,
        }
    }
}

impl SyncConfig {
    pub fn drift_threshold_micros(&self) -> i64 {
        self.audio_drift_threshold_ms as i64 * 1000
    }

    pub fn max_wait_micros(&self) -> i64 {
        if self.max_stream_wait_ms == 0 {
            2 * self.video_time_base.period_micros()
        } else {
            self.max_stream_wait_ms as i64 * 1000
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.sync_tick_ms.max(1))
    }
}

/// A frame released by the engine, its PTS rewritten onto the common timeline
#[derive(Debug)]
pub struct Emitted {
    pub frame: MediaFrame,
    /// Wall-clock target on the engine's clock
    pub target: Timestamp,
}

struct Pending {
    frame: MediaFrame,
    target: Timestamp,
    /// Position on the common timeline
    pts: i64,
}

/// A pause the stream has not yet accounted for
struct PauseCredit {
    span: i64,
    /// Last source PTS offered before the pause
    pts_before: Timestamp,
    /// The span is currently part of the stream's offset
    held: bool,
}

#[derive(Default)]
struct StreamState {
    base_pts: Option<Timestamp>,
    offset: i64,
    /// Paused time cut out of the stream's output PTS
    gap: i64,
    pending: Option<Pending>,
    last_target: Option<Timestamp>,
    last_pts: Option<Timestamp>,
    last_source_pts: Option<Timestamp>,
    last_offer: Option<Timestamp>,
    pause: Option<PauseCredit>,
    closed: bool,
    emitted: u64,
}

impl StreamState {
    /// Decide, from a post-resume frame, whether the source clock ran through the pause
    fn settle_pause(&mut self, pts: Timestamp) {
        let Some(prev) = self.last_source_pts else {
            self.pause = None;
            return;
        };
        let Some(pause) = self.pause.as_mut() else {
            return;
        };
        let half = pause.span / 2;

        if pts.micros - prev.micros >= half {
            // PTS jumped across the pause: the source kept wall-clock time
            if pause.held {
                self.offset -= pause.span;
            }
            self.pause = None;
            return;
        }
        if !pause.held {
            self.offset += pause.span;
            pause.held = true;
        }
        if pts.micros >= pause.pts_before.micros + half {
            self.pause = None;
        }
    }
}

/// Deterministic synchronization core; the caller supplies `now`
pub struct SyncEngine {
    config: SyncConfig,
    anchor: Option<Timestamp>,
    streams: [StreamState; 2],
    drift_micros: i64,
    corrections: u64,
    discarded: u64,
}

fn other(kind: MediaKind) -> MediaKind {
    match kind {
        MediaKind::Video => MediaKind::Audio,
        MediaKind::Audio => MediaKind::Video,
    }
}

impl SyncEngine {
    /// The anchor is taken from the first frame offered
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            anchor: None,
            streams: Default::default(),
            drift_micros: 0,
            corrections: 0,
            discarded: 0,
        }
    }

    /// Engine with a fixed anchor
    pub fn with_anchor(config: SyncConfig, anchor: Timestamp) -> Self {
        let mut engine = Self::new(config);
        engine.anchor = Some(anchor);
        engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn anchor(&self) -> Option<Timestamp> {
        self.anchor
    }

    fn stream(&self, kind: MediaKind) -> &StreamState {
        &self.streams[kind.index()]
    }

    pub fn base_pts(&self, kind: MediaKind) -> Option<Timestamp> {
        self.stream(kind).base_pts
    }

    /// Correction currently applied to a stream's targets
    pub fn offset(&self, kind: MediaKind) -> i64 {
        self.stream(kind).offset
    }

    /// Last measured video-minus-audio target difference
    pub fn drift_micros(&self) -> i64 {
        self.drift_micros
    }

    /// Number of retiming corrections applied so far
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn emitted(&self, kind: MediaKind) -> u64 {
        self.stream(kind).emitted
    }

    /// Frames discarded at shutdown
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// PTS (common timeline) of the last frame emitted for a stream
    pub fn last_emitted_pts(&self, kind: MediaKind) -> Option<Timestamp> {
        self.stream(kind).last_pts
    }

    /// The stream's pending slot is free and the stream is still open
    pub fn needs(&self, kind: MediaKind) -> bool {
        let stream = self.stream(kind);
        stream.pending.is_none() && !stream.closed
    }

    pub fn is_closed(&self, kind: MediaKind) -> bool {
        self.stream(kind).closed
    }

    /// Both streams ended and nothing is pending
    pub fn is_drained(&self) -> bool {
        self.streams
            .iter()
            .all(|s| s.closed && s.pending.is_none())
    }

    /// Place a frame in its stream's pending slot
    ///
    /// The frame is handed back when the slot is taken or the stream is closed.
    pub fn offer(&mut self, frame: MediaFrame, now: Timestamp) -> std::result::Result<(), MediaFrame> {
        let kind = frame.kind();
        if !self.needs(kind) {
            return Err(frame);
        }

        let anchor = *self.anchor.get_or_insert(now);
        let stream = &mut self.streams[kind.index()];
        let pts = frame.pts();
        let base = *stream.base_pts.get_or_insert(pts);
        stream.settle_pause(pts);
        stream.last_source_pts = Some(pts);

        let mut target = Timestamp::from_micros(pts.micros - base.micros + anchor.micros + stream.offset);
        if let Some(last) = stream.last_target
            && target < last
        {
            target = last;
        }
        let timeline = target.micros - anchor.micros - stream.gap;

        stream.last_offer = Some(now);
        stream.pending = Some(Pending {
            frame,
            target,
            pts: timeline,
        });
        Ok(())
    }

    /// The stream's producer reached end of stream
    pub fn close_stream(&mut self, kind: MediaKind) {
        self.streams[kind.index()].closed = true;
    }

    /// Retime the later pending frame when the two targets drift apart
    fn correct_drift(&mut self) {
        let target_of = |kind: MediaKind| self.stream(kind).pending.as_ref().map(|p| p.target);
        let (Some(video_target), Some(audio_target)) =
            (target_of(MediaKind::Video), target_of(MediaKind::Audio))
        else {
            return;
        };

        let drift = video_target.micros - audio_target.micros;
        self.drift_micros = drift;
        if drift.abs() <= self.config.drift_threshold_micros() {
            return;
        }

        let (later, earlier_target) = if drift > 0 {
            (MediaKind::Video, audio_target)
        } else {
            (MediaKind::Audio, video_target)
        };

        let stream = &mut self.streams[later.index()];
        let mut new_target = earlier_target;
        if let Some(last) = stream.last_target {
            new_target = new_target.max(last);
        }
        let Some(pending) = stream.pending.as_mut() else {
            return;
        };

        let delta = new_target.micros - pending.target.micros;
        pending.target = new_target;
        pending.pts += delta;
        stream.offset += delta;
        self.corrections += 1;
        debug!(
            "SyncEngine: drift {}µs over threshold, {} retimed by {}µs (offset now {}µs)",
            drift, later, delta, stream.offset
        );
    }

    /// Which pending frame goes next and when it falls due
    fn next_due(&self) -> Option<(MediaKind, Timestamp)> {
        let video = self.stream(MediaKind::Video).pending.as_ref();
        let audio = self.stream(MediaKind::Audio).pending.as_ref();

        let (kind, target) = match (video, audio) {
            (Some(v), Some(a)) => {
                return Some(if a.target < v.target {
                    (MediaKind::Audio, a.target)
                } else {
                    (MediaKind::Video, v.target)
                });
            }
            (Some(v), None) => (MediaKind::Video, v.target),
            (None, Some(a)) => (MediaKind::Audio, a.target),
            (None, None) => return None,
        };

        // One-sided: give the silent stream a bounded chance to catch up
        let opposite = self.stream(other(kind));
        if opposite.closed {
            return Some((kind, target));
        }
        let heard = opposite
            .last_offer
            .or(self.anchor)
            .unwrap_or(Timestamp::ZERO);
        let patience = heard.offset(self.config.max_wait_micros());
        Some((kind, target.max(patience)))
    }

    /// Earliest moment `poll` may release something
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.correct_drift();
        self.next_due().map(|(_, due)| due)
    }

    /// Release the next frame if it is due at `now`
    pub fn poll(&mut self, now: Timestamp) -> Option<Emitted> {
        self.correct_drift();
        let (kind, due) = self.next_due()?;
        if now < due {
            return None;
        }
        self.emit(kind)
    }

    fn emit(&mut self, kind: MediaKind) -> Option<Emitted> {
        let stream = &mut self.streams[kind.index()];
        let pending = stream.pending.take()?;

        // Strictly increasing per stream
        let mut pts = pending.pts;
        if let Some(last) = stream.last_pts
            && pts <= last.micros
        {
            pts = last.micros + 1;
        }

        stream.last_pts = Some(Timestamp::from_micros(pts));
        stream.last_target = Some(pending.target);
        stream.emitted += 1;

        let mut frame = pending.frame;
        frame.set_pts(Timestamp::from_micros(pts));
        Some(Emitted {
            frame,
            target: pending.target,
        })
    }

    /// Account for a pause of `micros` that just ended
    ///
    /// The paused span is cut out of every started stream's output PTS. Whether
    /// it also delays the stream's targets is settled by the stream's next frames.
    pub fn note_pause(&mut self, micros: i64) {
        if self.anchor.is_none() || micros <= 0 {
            return;
        }
        for stream in &mut self.streams {
            let Some(pts_before) = stream.last_source_pts else {
                continue;
            };
            if let Some(pause) = stream.pause.as_mut() {
                if pause.held {
                    stream.offset -= pause.span;
                }
                pause.span += micros;
                pause.held = false;
            } else {
                stream.pause = Some(PauseCredit {
                    span: micros,
                    pts_before,
                    held: false,
                });
            }
            stream.gap += micros;
            stream.last_offer = stream.last_offer.map(|t| t.offset(micros));
        }
    }

    /// Discard whatever is pending and close both streams; returns the count
    pub fn shutdown(&mut self) -> usize {
        let mut discarded = 0;
        for stream in &mut self.streams {
            if stream.pending.take().is_some() {
                discarded += 1;
            }
            stream.closed = true;
        }
        self.discarded += discarded as u64;
        discarded
    }
}

/// Synchronization stage: two frame inputs (video, audio), one frame output
pub struct SyncStage {
    config: SyncConfig,
    engine: Option<SyncEngine>,
    clock: MediaClock,
    inputs: [Option<Arc<BoundedQueue<MediaFrame>>>; 2],
    output: Option<Arc<BoundedQueue<MediaFrame>>>,
    paused_at: Option<Timestamp>,
    health: Arc<StageHealth>,
}

impl SyncStage {
    pub fn new(clock: MediaClock) -> Self {
        Self {
            config: SyncConfig::default(),
            engine: None,
            clock,
            inputs: [None, None],
            output: None,
            paused_at: None,
            health: Arc::new(StageHealth::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Expose the measured drift and current corrections
    fn publish(health: &StageHealth, clock: &MediaClock, engine: &SyncEngine) {
        health.record_drift(engine.drift_micros());
        for kind in [MediaKind::Video, MediaKind::Audio] {
            clock.set_offset(kind, engine.offset(kind));
        }
    }

    fn close_inputs(&self) {
        for input in self.inputs.iter().flatten() {
            input.close();
        }
    }
}

impl Module for SyncStage {
    fn name(&self) -> &str {
        "sync"
    }

    fn role(&self) -> StageRole {
        StageRole::Sync
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![
                PortSpec::frames(Some(MediaKind::Video)),
                PortSpec::frames(Some(MediaKind::Audio)),
            ],
            output: Some(PortSpec::frames(None)),
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, config: &ConfigMap) -> Result<()> {
        self.config = config.settings("sync")?;
        info!(
            "SyncStage: drift threshold {}ms, time bases {} / {}, max wait {}µs",
            self.config.audio_drift_threshold_ms,
            self.config.video_time_base,
            self.config.audio_time_base,
            self.config.max_wait_micros()
        );
        self.engine = Some(SyncEngine::new(self.config.clone()));
        Ok(())
    }

    fn start(&mut self, wiring: &Wiring) -> Result<()> {
        self.inputs = [Some(wiring.frames_in(0)?), Some(wiring.frames_in(1)?)];
        self.output = Some(wiring.frames_out()?);
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        let (Some(engine), Some(output)) = (self.engine.as_mut(), self.output.as_ref()) else {
            return Err(Error::NotInitialized);
        };
        let now = self.clock.now();

        for kind in [MediaKind::Video, MediaKind::Audio] {
            if !engine.needs(kind) {
                continue;
            }
            let Some(input) = &self.inputs[kind.index()] else {
                continue;
            };
            match input.try_pop() {
                Ok(frame) => {
                    self.health.record_input();
                    // Routed by the frame's own tag, not by the queue it came from
                    if let Err(frame) = engine.offer(frame, now) {
                        warn!(
                            "SyncStage: dropping {} frame at {} received on the {} input",
                            frame.kind(),
                            frame.pts(),
                            kind
                        );
                        self.health.record_frame_drop();
                    }
                }
                Err(PopError::Empty) => {}
                Err(PopError::Closed) => {
                    info!("SyncStage: {} input ended", kind);
                    engine.close_stream(kind);
                }
            }
        }

        let deadline = Instant::now() + wait;
        let mut progressed = false;
        while let Some(emitted) = engine.poll(now) {
            progressed = true;
            let size = emitted.frame.size();
            let keyframe = emitted.frame.is_keyframe();
            match output.push(emitted.frame, deadline.saturating_duration_since(Instant::now())) {
                Ok(()) => self.health.record_frame(size, keyframe),
                Err(PushError::Full(frame)) => {
                    warn!(
                        "SyncStage: output full, dropping {} frame at {}",
                        frame.kind(),
                        frame.pts()
                    );
                    self.health.record_frame_drop();
                }
                Err(PushError::Closed(_)) => {
                    self.health.record_frame_drop();
                    let discarded = engine.shutdown();
                    for _ in 0..discarded {
                        self.health.record_frame_drop();
                    }
                    warn!(
                        "SyncStage: output closed downstream, discarded {} pending frames",
                        discarded
                    );
                    for input in self.inputs.iter().flatten() {
                        input.close();
                    }
                    return Ok(Flow::Finished);
                }
            }
        }

        Self::publish(&self.health, &self.clock, engine);

        if engine.is_drained() {
            output.close();
            info!(
                "SyncStage: finished ({} video, {} audio emitted, {} corrections)",
                engine.emitted(MediaKind::Video),
                engine.emitted(MediaKind::Audio),
                engine.corrections()
            );
            return Ok(Flow::Finished);
        }
        if progressed {
            return Ok(Flow::Continue);
        }

        // Fresh input waiting behind an empty slot: no need to sleep
        let input_ready = [MediaKind::Video, MediaKind::Audio].into_iter().any(|kind| {
            engine.needs(kind)
                && self.inputs[kind.index()]
                    .as_ref()
                    .is_some_and(|q| !q.is_empty() || q.is_closed())
        });
        if input_ready {
            return Ok(Flow::Continue);
        }

        let mut nap = self.config.tick().min(wait);
        if let Some(due) = engine.next_deadline() {
            let until = (due.micros - now.micros).max(0) as u64;
            nap = nap.min(Duration::from_micros(until));
        }
        thread::sleep(nap);
        Ok(Flow::Idle)
    }

    fn pause(&mut self) {
        self.paused_at = Some(self.clock.now());
    }

    fn resume(&mut self) {
        if let (Some(paused_at), Some(engine)) = (self.paused_at.take(), self.engine.as_mut()) {
            let paused_for = self.clock.now().micros - paused_at.micros;
            engine.note_pause(paused_for);
            debug!("SyncStage: resumed after {}µs pause", paused_for);
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(engine) = self.engine.as_mut() {
            let discarded = engine.shutdown();
            if discarded > 0 {
                for _ in 0..discarded {
                    self.health.record_frame_drop();
                }
                info!("SyncStage: discarded {} pending frames at shutdown", discarded);
            }
            Self::publish(&self.health, &self.clock, engine);
        }
        self.close_inputs();
        Ok(())
    }

    fn destroy(&mut self) {
        self.engine = None;
        self.inputs = [None, None];
        self.output = None;
    }
}
