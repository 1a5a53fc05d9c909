//! # PeerLink Media
//!
//! Video frame transport for PeerLink: the bounded frame pool, the
//! acquire/deliver frame pipeline, application-defined video sources and
//! device lifecycle hooks for local tracks.

#![warn(clippy::all)]

pub mod lifecycle;
pub mod pipeline;
pub mod pool;
pub mod source;

// Re-export main types
pub use lifecycle::{lifecycle_for, CameraLifecycle, DeviceLifecycle, TrackLifecycle};
pub use pipeline::{FramePipeline, FrameStats, SinkPause};
pub use pool::{FramePool, SlotTicket, DEFAULT_POOL_DEPTH};
pub use source::AppVideoSource;
