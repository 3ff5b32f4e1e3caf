use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigMap;
use crate::error::{Error, Result};
use crate::mux::{ContainerSink, MuxConfig, MuxStats};
use crate::pipeline::health::{StageHealth, StageRole};
use crate::pipeline::queue::{BoundedQueue, PopError};
use crate::pipeline::stage::{Flow, Module, PortSpec, Ports, Wiring};
use crate::pipeline::types::MuxItem;

/// Writes the packet stream into a container
///
/// The sink is opened when the track table arrives and finalised when the
/// packet queue ends or the stage is stopped, so a stopped pipeline still
/// leaves a playable file.
pub struct MuxStage {
    sink: Box<dyn ContainerSink>,
    config: MuxConfig,
    input: Option<Arc<BoundedQueue<MuxItem>>>,
    opened: bool,
    result: Option<MuxStats>,
    health: Arc<StageHealth>,
}

impl MuxStage {
    pub fn new(sink: impl ContainerSink + 'static) -> Self {
        Self::from_box(Box::new(sink))
    }

    pub fn from_box(sink: Box<dyn ContainerSink>) -> Self {
        Self {
            sink,
            config: MuxConfig::default(),
            input: None,
            opened: false,
            result: None,
            health: Arc::new(StageHealth::new()),
        }
    }

    /// Totals of the finalised container
    pub fn result(&self) -> Option<MuxStats> {
        self.result
    }

    fn finalize(&mut self) -> Result<()> {
        if !self.opened || self.result.is_some() {
            return Ok(());
        }
        let stats = self.sink.finish()?;
        info!(
            "MuxStage: finalised {} ({} packets, {} bytes)",
            self.config
                .output_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "output".into()),
            stats.packets_written,
            stats.bytes_written
        );
        self.result = Some(stats);
        Ok(())
    }
}

impl Module for MuxStage {
    fn name(&self) -> &str {
        "mux"
    }

    fn role(&self) -> StageRole {
        StageRole::Mux
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec::packets()],
            output: None,
        }
    }

    fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    fn init(&mut self, config: &ConfigMap) -> Result<()> {
        self.config = config.settings("mux")?;
        Ok(())
    }

    fn start(&mut self, wiring: &Wiring) -> Result<()> {
        self.input = Some(wiring.packets_in(0)?);
        Ok(())
    }

    fn process(&mut self, wait: Duration) -> Result<Flow> {
        let Some(input) = self.input.clone() else {
            return Err(Error::NotInitialized);
        };

        match input.pop(wait) {
            Ok(MuxItem::Tracks(tracks)) => {
                if self.opened {
                    warn!("MuxStage: ignoring a second track table");
                    return Ok(Flow::Continue);
                }
                self.sink.open(&tracks, &self.config)?;
                self.opened = true;
                info!(
                    "MuxStage: opened container with {}",
                    tracks
                        .iter()
                        .map(|t| format!("{} ({})", t.codec, t.encoder))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(Flow::Continue)
            }
            Ok(MuxItem::Packet(packet)) => {
                self.health.record_input();
                if !self.opened {
                    warn!("MuxStage: packet at {} before the track table", packet.pts);
                    self.health.record_frame_drop();
                    return Ok(Flow::Continue);
                }
                let size = packet.size();
                let keyframe = packet.is_keyframe;
                let track = packet.track;
                let pts = packet.pts;
                match self.sink.write(packet) {
                    Ok(()) => self.health.record_frame(size, keyframe),
                    Err(e) => {
                        warn!("MuxStage: failed to write {} packet at {}: {}", track, pts, e);
                        self.health.record_frame_drop();
                        self.health.record_error(e.to_string());
                    }
                }
                Ok(Flow::Continue)
            }
            Err(PopError::Empty) => Ok(Flow::Idle),
            Err(PopError::Closed) => {
                self.finalize()?;
                Ok(Flow::Finished)
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(input) = &self.input {
            input.close();
            let pending = input.clear();
            if pending > 0 {
                for _ in 0..pending {
                    self.health.record_frame_drop();
                }
                warn!("MuxStage: {} packets left unwritten", pending);
            }
        }
        if let Err(e) = self.finalize() {
            error!("MuxStage: failed to finalise container: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.input = None;
    }
}
