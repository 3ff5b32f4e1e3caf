//! Media clock for audio-video synchronization

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use super::types::{MediaKind, Timestamp};

/// Wall clock shared by the stages of one pipeline
///
/// All readings are microseconds since a base `Instant`. The sync stage takes
/// its anchor from here and publishes the per-stream correction it currently
/// applies, so the rest of the pipeline can observe A/V alignment without
/// reaching into the stage.
///
/// Cloning shares the same base and offsets.
#[derive(Clone)]
pub struct MediaClock {
    /// Base instant when the clock started
    base: Arc<Instant>,

    /// Correction applied to video targets (microseconds)
    video_offset: Arc<AtomicI64>,

    /// Correction applied to audio targets (microseconds)
    audio_offset: Arc<AtomicI64>,
}

impl MediaClock {
    /// Create a new media clock starting now
    pub fn new() -> Self {
        Self::with_base(Instant::now())
    }

    /// Create a new media clock with a specific base instant
    pub fn with_base(base: Instant) -> Self {
        Self {
            base: Arc::new(base),
            video_offset: Arc::new(AtomicI64::new(0)),
            audio_offset: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Get the base instant
    pub fn base(&self) -> Instant {
        *self.base
    }

    /// Time elapsed since the base
    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.base.elapsed())
    }

    /// Current time as seen by one stream (offset applied)
    pub fn now_for(&self, kind: MediaKind) -> Timestamp {
        self.now().offset(self.offset(kind))
    }

    /// Get a timestamp relative to the clock base
    pub fn timestamp_from_instant(&self, instant: Instant) -> Timestamp {
        Timestamp::from_instant(instant, *self.base)
    }

    /// Wall-clock instant at which `ts` falls due
    pub fn instant_of(&self, ts: Timestamp) -> Instant {
        *self.base + ts.as_duration()
    }

    fn slot(&self, kind: MediaKind) -> &AtomicI64 {
        match kind {
            MediaKind::Video => &self.video_offset,
            MediaKind::Audio => &self.audio_offset,
        }
    }

    /// Replace the correction for one stream
    pub fn set_offset(&self, kind: MediaKind, micros: i64) {
        self.slot(kind).store(micros, Ordering::Relaxed);
    }

    /// Adjust the correction for one stream by a signed delta
    pub fn adjust_offset(&self, kind: MediaKind, delta_micros: i64) {
        self.slot(kind).fetch_add(delta_micros, Ordering::Relaxed);
    }

    /// Current correction for one stream (microseconds, signed)
    pub fn offset(&self, kind: MediaKind) -> i64 {
        self.slot(kind).load(Ordering::Relaxed)
    }

    /// Video correction minus audio correction
    ///
    /// Positive values mean video is being held back relative to audio.
    pub fn av_offset_micros(&self) -> i64 {
        self.offset(MediaKind::Video) - self.offset(MediaKind::Audio)
    }

    /// Check if the applied corrections are within tolerance of each other
    pub fn is_synced(&self, tolerance: Duration) -> bool {
        self.av_offset_micros().unsigned_abs() <= tolerance.as_micros() as u64
    }

    /// Reset both offsets to zero
    pub fn reset_offsets(&self) {
        self.video_offset.store(0, Ordering::Relaxed);
        self.audio_offset.store(0, Ordering::Relaxed);
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaClock")
            .field("elapsed", &self.base.elapsed())
            .field("video_offset", &self.offset(MediaKind::Video))
            .field("audio_offset", &self.offset(MediaKind::Audio))
            .finish()
    }
}
