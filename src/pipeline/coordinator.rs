//! Pipeline coordinator
//!
//! Chains capture → sync → encode → mux and manages their lifecycle.

use log::{error, info, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::lock;
use crate::capture::{FrameSource, SourcePoll};
use crate::config::ConfigMap;
use crate::encoder::{BackendSelector, EncoderConfig};
use crate::error::{Error, Result};
use crate::mux::ContainerSink;
use crate::pipeline::capture_stage::CaptureStage;
use crate::pipeline::clock::MediaClock;
use crate::pipeline::encode_stage::EncodeStage;
use crate::pipeline::health::{PipelineStats, StageRole, StatsHandle};
use crate::pipeline::mux_stage::MuxStage;
use crate::pipeline::stage::{ModuleContext, connect};
use crate::pipeline::state::PipelineState;
use crate::pipeline::sync_stage::SyncStage;
use crate::pipeline::types::MediaKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PipelineSettings {
    /// Slots per inter-stage queue (0 = default)
    queue_size: usize,
    drain_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_size: 0,
            drain_timeout_ms: 5000,
        }
    }
}

/// Stands in for a stream the caller did not provide
struct AbsentSource(MediaKind);

impl FrameSource for AbsentSource {
    fn kind(&self) -> MediaKind {
        self.0
    }

    fn describe(&self) -> String {
        format!("no {} source", self.0.to_string().to_lowercase())
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<SourcePoll> {
        Ok(SourcePoll::EndOfStream)
    }

    fn close(&mut self) {}
}

/// Declares the static topology of one recording
///
/// ```text
/// video source ─┐
///               ├─> sync ─> encode ─> mux ─> container
/// audio source ─┘
/// ```
pub struct PipelineBuilder {
    config: ConfigMap,
    video: Option<Box<dyn FrameSource>>,
    audio: Option<Box<dyn FrameSource>>,
    selector: Option<BackendSelector>,
    sink: Option<Box<dyn ContainerSink>>,
    clock: Option<MediaClock>,
}

impl PipelineBuilder {
    pub fn new(config: ConfigMap) -> Self {
        Self {
            config,
            video: None,
            audio: None,
            selector: None,
            sink: None,
            clock: None,
        }
    }

    pub fn video_source(mut self, source: impl FrameSource + 'static) -> Self {
        self.video = Some(Box::new(source));
        self
    }

    pub fn audio_source(mut self, source: impl FrameSource + 'static) -> Self {
        self.audio = Some(Box::new(source));
        self
    }

    /// Encoder providers (defaults to the ones compiled into this build)
    pub fn selector(mut self, selector: BackendSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn sink(mut self, sink: impl ContainerSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn clock(mut self, clock: MediaClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Allocate every stage and connect the queues; nothing is initialized yet
    pub fn build(mut self) -> Result<PipelineCoordinator> {
        let settings: PipelineSettings = self.config.settings("pipeline")?;
        sync_time_base_from_frame_rate(&mut self.config)?;
        let Some(sink) = self.sink else {
            return Err(Error::InvalidParameter("no container sink configured".into()));
        };

        let video = self
            .video
            .unwrap_or_else(|| Box::new(AbsentSource(MediaKind::Video)));
        let audio = self
            .audio
            .unwrap_or_else(|| Box::new(AbsentSource(MediaKind::Audio)));
        for (expected, source) in [(MediaKind::Video, &video), (MediaKind::Audio, &audio)] {
            if source.kind() != expected {
                return Err(Error::InvalidParameter(format!(
                    "{} given as the {} source",
                    source.describe(),
                    expected.to_string().to_lowercase()
                )));
            }
        }

        let clock = self.clock.unwrap_or_default();
        let selector = self.selector.unwrap_or_else(BackendSelector::with_builtin);

        let mut video = ModuleContext::new(CaptureStage::from_box(video));
        let mut audio = ModuleContext::new(CaptureStage::from_box(audio));
        let mut sync = ModuleContext::new(SyncStage::new(clock.clone()));
        let mut encode = ModuleContext::new(EncodeStage::new(selector));
        let mut mux = ModuleContext::new(MuxStage::from_box(sink));

        let size = settings.queue_size;
        connect(&mut video, &mut sync, size)?;
        connect(&mut audio, &mut sync, size)?;
        connect(&mut sync, &mut encode, size)?;
        connect(&mut encode, &mut mux, size)?;

        let stages = vec![video, audio, sync, encode, mux];
        let state = Arc::new(Mutex::new(PipelineState::Idle));
        let stats = StatsHandle::new(stages.iter().map(ModuleContext::probe).collect(), Arc::clone(&state));

        Ok(PipelineCoordinator {
            config: self.config,
            stages,
            state,
            stats,
            clock,
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
        })
    }
}

/// Without an explicit `video_time_base` the sync timeline ticks at the encode frame rate
fn sync_time_base_from_frame_rate(config: &mut ConfigMap) -> Result<()> {
    if config.scoped("sync").contains_key("video_time_base") {
        return Ok(());
    }
    let encode: EncoderConfig = config.settings("encode")?;
    if encode.frame_rate > 0 {
        config.set_scoped("sync", "video_time_base", format!("1/{}", encode.frame_rate));
    }
    Ok(())
}

/// Owns the stages of one pipeline, in producer-first order
pub struct PipelineCoordinator {
    config: ConfigMap,
    stages: Vec<ModuleContext>,
    state: Arc<Mutex<PipelineState>>,
    stats: StatsHandle,
    clock: MediaClock,
    drain_timeout: Duration,
}

impl PipelineCoordinator {
    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    pub fn clock(&self) -> &MediaClock {
        &self.clock
    }

    /// Poll every stage's counters
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Handle for observers on other threads (health monitor, UI)
    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Default timeout of [`drain`](Self::drain), from `pipeline.drain_timeout_ms`
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn stage(&self, name: &str) -> Option<&ModuleContext> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// True once the container has been finalised after end of stream
    pub fn is_finished(&self) -> bool {
        self.stages
            .iter()
            .filter(|s| s.role() == StageRole::Mux)
            .all(ModuleContext::is_finished)
    }

    fn transition(&self, target: PipelineState) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.can_transition_to(&target) {
            return Err(Error::invalid_state(target.description(), *state));
        }
        info!("Pipeline: {} -> {}", *state, target);
        *state = target;
        Ok(())
    }

    /// Initialize every stage; the first failure aborts and tears everything down
    pub fn init(&mut self) -> Result<()> {
        self.transition(PipelineState::Initializing)?;

        for i in 0..self.stages.len() {
            if let Err(e) = self.stages[i].init(&self.config) {
                error!("Pipeline: {} failed to initialize: {}", self.stages[i].name(), e);
                self.abort();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start producers first; any failure halts the whole pipeline
    pub fn start(&mut self) -> Result<()> {
        if self.state() == PipelineState::Idle {
            return Err(Error::NotInitialized);
        }
        self.transition(PipelineState::Running {
            started_at: Instant::now(),
        })?;

        for i in 0..self.stages.len() {
            if let Err(e) = self.stages[i].start() {
                error!("Pipeline: {} failed to start: {}", self.stages[i].name(), e);
                self.abort();
                return Err(e);
            }
        }

        self.stats.mark_started();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(PipelineState::Paused {
            paused_at: Instant::now(),
        })?;
        for stage in self.stages.iter_mut().filter(|s| s.status().is_running()) {
            stage.pause()?;
        }
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(PipelineState::Running {
            started_at: Instant::now(),
        })?;
        for stage in self.stages.iter_mut().rev().filter(|s| s.status().is_paused()) {
            stage.resume()?;
        }
        Ok(())
    }

    /// Stop consumers first
    ///
    /// Every stage is stopped even if one fails; the first error is returned.
    pub fn stop(&mut self) -> Result<()> {
        if self.state() == PipelineState::Stopped {
            return Ok(());
        }
        self.transition(PipelineState::Stopping)?;

        let mut first_error = None;
        for stage in self.stages.iter_mut().rev() {
            if !stage.status().is_active() && !stage.status().is_error() {
                continue;
            }
            if stage.status().is_error() {
                stage.destroy();
                continue;
            }
            if let Err(e) = stage.stop() {
                warn!("Pipeline: {} failed to stop: {}", stage.name(), e);
                first_error.get_or_insert(e);
            }
        }

        self.transition(PipelineState::Stopped)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End the recording cleanly
    ///
    /// Capture is stopped, end of stream travels through sync and encode, and
    /// the rest is stopped once the container is finalised or `timeout`
    /// passes. Returns whether end of stream reached the container in time.
    pub fn drain(&mut self, timeout: Duration) -> Result<bool> {
        let state = self.state();
        if state.is_paused() {
            self.resume()?;
        } else if !state.is_running() {
            return Err(Error::invalid_state("drain", state));
        }

        for stage in self.stages.iter_mut().filter(|s| s.role() == StageRole::Capture) {
            if stage.status().is_active()
                && let Err(e) = stage.stop()
            {
                warn!("Pipeline: {} failed to stop: {}", stage.name(), e);
            }
        }

        let deadline = Instant::now() + timeout;
        let downstream_done = |stages: &[ModuleContext]| {
            stages
                .iter()
                .filter(|s| s.role() != StageRole::Capture)
                .all(|s| s.is_finished() || s.status().is_error() || !s.status().is_active())
        };
        while !downstream_done(&self.stages) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let drained = downstream_done(&self.stages);
        if drained {
            info!("Pipeline: drained");
        } else {
            warn!("Pipeline: drain timed out after {:?}", timeout);
        }

        self.stop()?;
        Ok(drained)
    }

    /// Stop if needed and release every stage
    pub fn destroy(&mut self) {
        if self.state().is_active()
            && let Err(e) = self.stop()
        {
            warn!("Pipeline: stop during destroy failed: {}", e);
        }
        for stage in self.stages.iter_mut().rev() {
            stage.destroy();
        }
        let mut state = lock(&self.state);
        if *state != PipelineState::Stopped {
            *state = PipelineState::Stopped;
        }
    }

    /// Tear down after a failed init or start
    fn abort(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            stage.destroy();
        }
        *lock(&self.state) = PipelineState::Stopped;
        warn!("Pipeline: aborted");
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("state", &self.state())
            .field("stages", &self.stages)
            .finish()
    }
}
