//! Capture pipeline
//!
//! Stages run on dedicated workers and talk only through bounded queues:
//! - Transport: [`BoundedQueue`], the single inter-stage primitive
//! - Lifecycle: [`Module`] implementations wrapped by [`ModuleContext`]
//! - Media processing: capture, sync, encode and mux stages
//! - Coordination: [`PipelineCoordinator`] wires the static topology
//!
//! # Architecture
//!
//! ```text
//! capture-video ─┐
//!                ├─> sync ─> encode ─> mux
//! capture-audio ─┘
//! ```
//!
//! Statistics are polled from each stage's [`StageHealth`]; nothing is
//! pushed between stages except frames and packets.

pub mod capture_stage;
pub mod clock;
pub mod coordinator;
pub mod encode_stage;
pub mod frame;
pub mod health;
pub mod mux_stage;
pub mod queue;
pub mod stage;
pub mod state;
pub mod sync_stage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use capture_stage::CaptureStage;
pub use clock::MediaClock;
pub use coordinator::{PipelineBuilder, PipelineCoordinator};
pub use encode_stage::EncodeStage;
pub use health::{HealthAlert, HealthMonitor, PipelineStats, StageHealth, StatsHandle};
pub use mux_stage::MuxStage;
pub use queue::{BoundedQueue, PopError, PushError, Timeout};
pub use stage::{Flow, Module, ModuleContext, connect};
pub use state::{ModuleStatus, PipelineState};
pub use sync_stage::{SyncConfig, SyncEngine, SyncStage};
pub use types::{MediaFrame, MediaKind, Timestamp};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
