use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigMap;
use crate::encoder::{BackendSelector, EncodeOrchestrator, EncoderConfig};
use crate::error::{Error, Result};
use crate::pipeline::health::{StageHealth, StageRole};
use crate::pipeline::queue::{BoundedQueue, PopError};
use crate::pipeline::stage::{Flow, Module, PortSpec, Ports, StageSettings, Wiring};
use crate::pipeline::types::{MediaFrame, MuxItem};

/// Routes synchronized frames to the per-track encoders
///
/// Backends are selected at `init`, so an unsupported codec fails before any
/// worker exists. The packet queue starts with the track table.
pub struct EncodeStage {
    selector: BackendSelector,
    config: EncoderConfig,
    orchestrator: Option<EncodeOrchestrator>,
    input: Option<Arc<BoundedQueue<MediaFrame>>>,
    output: Option<Arc<BoundedQueue<MuxItem>>>,
    wait: Duration,
    health: Arc<StageHealth>,
}

impl EncodeStage {
    pub fn new(selector: BackendSelector) -> Self {
        Self {
            selector,
            config: EncoderConfig::default(),
            orchestrator: None,
            input: None,
            output: None,
            wait: StageSettings::default().wait(),
            health: Arc::new(StageHealth::new()),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn finish(&mut self) {
        if let Some(orchestrator) = self.orchestrator.as_mut() {
            orchestrator.finish();
        }
        if let Some(output) = &self.output {
            output.close();
        }
    }
}

impl Module for EncodeStage {
    fn name(&self) -> &str {
        "encode"
    }

    fn role(&self) -> StageRole {
        StageRole::Encode
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec::frames(None)],
            output: Some(PortSpec::packets()),
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, config: &ConfigMap) -> Result<()> {
        self.config = config.settings("encode")?;
        self.wait = config.settings::<StageSettings>("pipeline")?.wait();
        let orchestrator =
            EncodeOrchestrator::open(&self.config, &self.selector, Arc::clone(&self.health))?;
        info!(
            "EncodeStage: {} tracks, gop {}, hw {}",
            orchestrator.parameters().len(),
            self.config.effective_gop(),
            self.config.hw_accel
        );
        self.orchestrator = Some(orchestrator);
        Ok(())
    }

    fn start(&mut self, wiring: &Wiring) -> Result<()> {
        let input = wiring.frames_in(0)?;
        let output = wiring.packets_out()?;
        let Some(orchestrator) = self.orchestrator.as_mut() else {
            return Err(Error::NotInitialized);
        };

        let tracks = MuxItem::Tracks(orchestrator.parameters());
        if output.push(tracks, self.wait).is_err() {
            return Err(Error::invalid_state("start", "packet queue unavailable"));
        }
        orchestrator.start(Arc::clone(&output), self.wait)?;

        self.input = Some(input);
        self.output = Some(output);
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        let (Some(input), Some(orchestrator)) = (self.input.as_ref(), self.orchestrator.as_ref())
        else {
            return Err(Error::NotInitialized);
        };

        match input.pop(wait) {
            Ok(frame) => {
                self.health.record_input();
                let kind = frame.kind();
                if let Err(frame) = orchestrator.submit(frame, wait) {
                    let reason = if orchestrator.has_track(kind) {
                        "track queue full"
                    } else {
                        "track disabled"
                    };
                    warn!(
                        "EncodeStage: dropping {} frame at {} ({})",
                        kind,
                        frame.pts(),
                        reason
                    );
                    self.health.record_frame_drop();
                }
                Ok(Flow::Continue)
            }
            Err(PopError::Empty) => Ok(Flow::Idle),
            Err(PopError::Closed) => {
                self.finish();
                info!(
                    "EncodeStage: input ended, {} packets out, {} dropped",
                    self.health.frames_out(),
                    self.health.frame_drops()
                );
                Ok(Flow::Finished)
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(orchestrator) = self.orchestrator.as_mut() {
            orchestrator.halt();
        }
        if let Some(input) = &self.input {
            let pending = input.clear();
            for _ in 0..pending {
                self.health.record_frame_drop();
            }
            input.close();
        }
        if let Some(output) = &self.output {
            output.close();
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.orchestrator = None;
        self.input = None;
        self.output = None;
    }
}
