use log::{debug, info};
use std::sync::Arc;

use super::{Codec, HwAccel, TrackSettings};
use crate::error::{Error, Result};
use crate::pipeline::types::{EncodedPacket, MediaFrame, TrackParameters};

/// One open encode context
///
/// Frames go in with [`submit`](EncoderBackend::submit) in presentation
/// order; packets come out of [`receive`](EncoderBackend::receive) in
/// non-decreasing timestamp order.
pub trait EncoderBackend: Send {
    /// Encoder actually in use ("h264_nvenc", "libx264", ...)
    fn name(&self) -> &str;

    /// Track description for the container
    fn parameters(&self) -> TrackParameters;

    fn submit(&mut self, frame: MediaFrame) -> Result<()>;

    /// Next finished packet, if any
    fn receive(&mut self) -> Result<Option<EncodedPacket>>;

    /// Signal end of stream; remaining packets become available to `receive`
    fn flush(&mut self) -> Result<()>;
}

/// Factory for one encoder family
pub trait BackendProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Hardware family, or [`HwAccel::None`] for software encoders
    fn hw(&self) -> HwAccel;

    fn supports(&self, codec: Codec) -> bool;

    fn open(&self, settings: &TrackSettings) -> Result<Box<dyn EncoderBackend>>;
}

/// Providers in priority order, hardware first
#[derive(Clone, Default)]
pub struct BackendSelector {
    providers: Vec<Arc<dyn BackendProvider>>,
}

impl BackendSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The providers compiled into this build
    pub fn with_builtin() -> Self {
        #[cfg(feature = "ffmpeg")]
        {
            let mut selector = Self::new();
            for provider in super::ffmpeg::providers() {
                selector.register(provider);
            }
            selector
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Self::new()
        }
    }

    pub fn register(&mut self, provider: Arc<dyn BackendProvider>) {
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: impl BackendProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn BackendProvider>> {
        self.providers.iter()
    }

    /// Providers to try for `codec`, in the order they will be tried
    ///
    /// A named hardware family comes first, then software. `Auto` tries every
    /// hardware family before software; `None` tries software only.
    pub fn candidates(&self, codec: Codec, preference: HwAccel) -> Vec<Arc<dyn BackendProvider>> {
        let supporting = self.providers.iter().filter(|p| p.supports(codec));
        let (hardware, software): (Vec<_>, Vec<_>) =
            supporting.cloned().partition(|p| p.hw().is_hardware());

        let mut ordered: Vec<Arc<dyn BackendProvider>> = match preference {
            HwAccel::None => Vec::new(),
            HwAccel::Auto => hardware,
            family => hardware.into_iter().filter(|p| p.hw() == family).collect(),
        };
        ordered.extend(software);
        ordered
    }

    /// Open an encoder for one track
    ///
    /// Never substitutes another codec: if nothing can encode `settings.codec`
    /// the result is [`Error::Unsupported`].
    pub fn open(&self, settings: &TrackSettings, preference: HwAccel) -> Result<Box<dyn EncoderBackend>> {
        let codec = settings.codec;
        if !self.providers.iter().any(|p| p.supports(codec)) {
            return Err(Error::Unsupported(format!("no encoder for codec {}", codec)));
        }

        let candidates = self.candidates(codec, preference);
        if candidates.is_empty() {
            return Err(Error::Unsupported(format!(
                "no {} encoder matches hardware preference '{}'",
                codec, preference
            )));
        }

        let mut failures = Vec::new();
        for provider in candidates {
            match provider.open(settings) {
                Ok(backend) => {
                    info!(
                        "Encoder: using {} ({}) for {}",
                        backend.name(),
                        provider.hw(),
                        codec
                    );
                    return Ok(backend);
                }
                Err(e) => {
                    debug!("Encoder: {} failed to open {}: {}", provider.name(), codec, e);
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(Error::Unsupported(format!(
            "no {} encoder could be opened ({})",
            codec,
            failures.join("; ")
        )))
    }
}

impl std::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}
