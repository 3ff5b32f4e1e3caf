use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{FrameSource, SourcePoll};
use crate::config::ConfigMap;
use crate::error::{Error, Result};
use crate::pipeline::health::{StageHealth, StageRole};
use crate::pipeline::queue::{BoundedQueue, PushError};
use crate::pipeline::stage::{Flow, Module, PortSpec, Ports, Wiring};
use crate::pipeline::types::{MediaFrame, MediaKind};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// How long a captured frame may wait for queue space (0 = one wait interval)
    pub push_timeout_ms: u64,
}

/// Pulls frames from one [`FrameSource`] into the pipeline
pub struct CaptureStage {
    name: String,
    source: Box<dyn FrameSource>,
    config: CaptureConfig,
    output: Option<Arc<BoundedQueue<MediaFrame>>>,
    opened: bool,
    health: Arc<StageHealth>,
}

impl CaptureStage {
    pub fn new(source: impl FrameSource + 'static) -> Self {
        Self::from_box(Box::new(source))
    }

    pub fn from_box(source: Box<dyn FrameSource>) -> Self {
        let name = match source.kind() {
            MediaKind::Video => "capture-video",
            MediaKind::Audio => "capture-audio",
        };
        Self {
            name: name.to_string(),
            source,
            config: CaptureConfig::default(),
            output: None,
            opened: false,
            health: Arc::new(StageHealth::new()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    fn push_timeout(&self, wait: Duration) -> Duration {
        match self.config.push_timeout_ms {
            0 => wait,
            ms => Duration::from_millis(ms),
        }
    }

    fn close_source(&mut self) {
        if self.opened {
            self.source.close();
            self.opened = false;
        }
    }
}

impl Module for CaptureStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StageRole {
        StageRole::Capture
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: Vec::new(),
            output: Some(PortSpec::frames(Some(self.source.kind()))),
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, config: &ConfigMap) -> Result<()> {
        self.config = config.settings("capture")?;
        info!("CaptureStage: {} uses {}", self.name, self.source.describe());
        Ok(())
    }

    fn start(&mut self, wiring: &Wiring) -> Result<()> {
        self.output = Some(wiring.frames_out()?);
        self.source.open()?;
        self.opened = true;
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        let Some(output) = self.output.clone() else {
            return Err(Error::NotInitialized);
        };

        match self.source.next_frame(wait)? {
            SourcePoll::Frame(frame) => {
                self.health.record_input();
                let size = frame.size();
                let keyframe = frame.is_keyframe();
                match output.push(frame, self.push_timeout(wait)) {
                    Ok(()) => {
                        self.health.record_frame(size, keyframe);
                        Ok(Flow::Continue)
                    }
                    Err(PushError::Full(frame)) => {
                        warn!(
                            "CaptureStage: {} queue full, dropping frame at {}",
                            self.name,
                            frame.pts()
                        );
                        self.health.record_frame_drop();
                        Ok(Flow::Continue)
                    }
                    Err(PushError::Closed(_)) => {
                        self.health.record_frame_drop();
                        info!("CaptureStage: {} output closed downstream", self.name);
                        self.close_source();
                        Ok(Flow::Finished)
                    }
                }
            }
            SourcePoll::Pending => Ok(Flow::Idle),
            SourcePoll::EndOfStream => {
                info!(
                    "CaptureStage: {} reached end of stream after {} frames",
                    self.name,
                    self.health.frames_out()
                );
                output.close();
                self.close_source();
                Ok(Flow::Finished)
            }
        }
    }

    fn pause(&mut self) {
        self.source.pause();
    }

    fn resume(&mut self) {
        self.source.resume();
    }

    fn stop(&mut self) -> Result<()> {
        self.close_source();
        if let Some(output) = &self.output {
            output.close();
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.close_source();
        self.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{TestPatternSource, ToneSource};
    use crate::pipeline::stage::{Link, ModuleContext, connect};
    use crate::pipeline::state::ModuleStatus;
    use crate::pipeline::testing::FrameCollector;
    use std::thread;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_ports_follow_source_kind() {
        let video = CaptureStage::new(TestPatternSource::new(16, 16, 30));
        assert_eq!(video.name(), "capture-video");
        assert_eq!(
            video.ports().output,
            Some(PortSpec::frames(Some(MediaKind::Video)))
        );

        let audio = CaptureStage::new(ToneSource::new(48_000, 2, 440.0));
        assert_eq!(audio.name(), "capture-audio");
        assert!(audio.ports().inputs.is_empty());
    }

    #[test]
    fn test_end_of_stream_closes_output() {
        let mut capture =
            ModuleContext::new(CaptureStage::new(TestPatternSource::new(16, 16, 30).with_limit(5)));
        let mut sink = ModuleContext::new(FrameCollector::new());
        let Link::Frames(queue) = connect(&mut capture, &mut sink, 16).unwrap() else {
            panic!("frame link expected");
        };

        capture.init(&ConfigMap::new()).unwrap();
        capture.start().unwrap();

        assert!(wait_for(|| capture.is_finished()));
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 5);
        assert_eq!(capture.health().frames_out(), 5);
        assert_eq!(capture.health().frame_drops(), 0);

        let pts: Vec<i64> = std::iter::from_fn(|| queue.try_pop().ok())
            .map(|f| f.pts().micros)
            .collect();
        assert_eq!(pts, vec![0, 33_333, 66_666, 99_999, 133_332]);

        capture.stop().unwrap();
        assert_eq!(capture.status(), ModuleStatus::Stopped);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let mut capture =
            ModuleContext::new(CaptureStage::new(ToneSource::new(8_000, 1, 440.0).with_limit(10)));
        let mut sink = ModuleContext::new(FrameCollector::new());
        // Two slots, one usable
        let Link::Frames(queue) = connect(&mut capture, &mut sink, 2).unwrap() else {
            panic!("frame link expected");
        };

        let config = ConfigMap::new().with("capture", serde_json::json!({ "push_timeout_ms": 1 }));
        capture.init(&config).unwrap();
        capture.start().unwrap();

        assert!(wait_for(|| capture.is_finished()));
        assert_eq!(queue.len(), 1);
        assert_eq!(capture.health().frames_out(), 1);
        assert_eq!(capture.health().frame_drops(), 9);
        assert_eq!(capture.health().frames_in(), 10);
    }

    #[test]
    fn test_zero_push_timeout_is_one_wait_interval() {
        let mut capture = CaptureStage::new(TestPatternSource::new(16, 16, 30));
        let wait = Duration::from_millis(20);
        assert_eq!(capture.push_timeout(wait), wait);

        capture.config.push_timeout_ms = 250;
        assert_eq!(capture.push_timeout(wait), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_source_fails_start() {
        let mut capture = ModuleContext::new(CaptureStage::new(TestPatternSource::new(0, 16, 30)));
        let mut sink = ModuleContext::new(FrameCollector::new());
        connect(&mut capture, &mut sink, 4).unwrap();

        capture.init(&ConfigMap::new()).unwrap();
        assert!(matches!(capture.start(), Err(Error::InvalidParameter(_))));
        assert_eq!(capture.status(), ModuleStatus::Error);
        assert!(!capture.has_worker());
    }
}
