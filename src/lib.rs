//! Real-time audio/video capture pipeline
//!
//! Independent video and audio sources are time-aligned by a
//! synchronization stage, compressed by pluggable encoder backends and
//! written to a container, each stage on its own worker connected by
//! bounded queues.

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod mux;
pub mod pipeline;

pub use config::ConfigMap;
pub use error::{Error, ErrorKind, Result};
