//! Capture collaborators
//!
//! Platform capture (screen, window, loopback audio) lives outside this crate
//! and plugs in through [`FrameSource`]. The synthetic sources here drive the
//! pipeline in demos and tests.

mod synthetic;

use std::time::Duration;

use crate::error::Result;
use crate::pipeline::types::{MediaFrame, MediaKind};

pub use synthetic::{TestPatternSource, ToneSource};

/// Result of polling a source
#[derive(Debug)]
pub enum SourcePoll {
    /// A new frame, owned by the caller from now on
    Frame(MediaFrame),
    /// Nothing within the timeout
    Pending,
    /// The source has no more frames
    EndOfStream,
}

/// A producer of raw frames
pub trait FrameSource: Send {
    /// Stream this source feeds
    fn kind(&self) -> MediaKind;

    /// Short description for logs
    fn describe(&self) -> String;

    /// Acquire the device; called once before the first `next_frame`
    fn open(&mut self) -> Result<()>;

    /// Wait at most `timeout` for the next frame
    fn next_frame(&mut self, timeout: Duration) -> Result<SourcePoll>;

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Release the device
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn kind(&self) -> MediaKind {
        (**self).kind()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<SourcePoll> {
        (**self).next_frame(timeout)
    }

    fn pause(&mut self) {
        (**self).pause()
    }

    fn resume(&mut self) {
        (**self).resume()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
