//! Container output
//!
//! The mux stage hands the track table and every compressed packet to a
//! [`ContainerSink`]. Container layout is the sink's business.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pipeline::types::{EncodedPacket, TrackParameters};

/// Mux settings, read from the `"mux"` scope
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub output_path: Option<PathBuf>,
    /// Container short name ("mp4", "matroska", ...); guessed from the file name when absent
    pub format: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub comment: Option<String>,
}

impl MuxConfig {
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Metadata entries that are set, as container tag names
    pub fn metadata(&self) -> Vec<(&'static str, &str)> {
        [
            ("title", self.title.as_deref()),
            ("artist", self.author.as_deref()),
            ("comment", self.comment.as_deref()),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.filter(|v| !v.is_empty()).map(|v| (key, v)))
        .collect()
    }
}

/// Totals reported when a container is finalised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub packets_written: u64,
    pub bytes_written: u64,
}

/// Destination of the compressed streams
pub trait ContainerSink: Send {
    /// Declare the tracks; called once, before any packet
    fn open(&mut self, tracks: &[TrackParameters], config: &MuxConfig) -> Result<()>;

    fn write(&mut self, packet: EncodedPacket) -> Result<()>;

    /// Write the trailer and release the output
    fn finish(&mut self) -> Result<MuxStats>;
}

impl<S: ContainerSink + ?Sized> ContainerSink for Box<S> {
    fn open(&mut self, tracks: &[TrackParameters], config: &MuxConfig) -> Result<()> {
        (**self).open(tracks, config)
    }

    fn write(&mut self, packet: EncodedPacket) -> Result<()> {
        (**self).write(packet)
    }

    fn finish(&mut self) -> Result<MuxStats> {
        (**self).finish()
    }
}
