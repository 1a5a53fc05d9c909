//! # PeerLink - Peer-to-Peer Media Sessions
//!
//! PeerLink manages peer connections, local and remote media tracks, media
//! streams, audio/video sinks and data channels on top of a handle-based
//! native media engine.
//!
//! ## Key Features
//!
//! - **Typed ids**: every entity is addressed by a generation-checked id
//! - **Offer/answer negotiation** with ICE candidate relay left to the application
//! - **Streams with active track selection** per media kind
//! - **Bounded frame pipeline** delivering video frames to sink handlers
//! - **Data channels** for text and binary messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::{ConnectionConfig, LoopbackEngine, Session, SessionConfig, SessionEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), peerlink::PeerLinkError> {
//!     let engine = Arc::new(LoopbackEngine::new());
//!     let mut session = Session::new(engine, SessionConfig::default())?;
//!     let mut events = session.events();
//!
//!     let connection = session.create_connection(ConnectionConfig::default())?;
//!     let stream = session.create_local_stream("camera")?;
//!     let track = session.create_camera_track()?;
//!     session.add_track_to_stream(stream, track)?;
//!     session.add_local_track(connection, track)?;
//!     session.create_offer(connection)?;
//!
//!     session.update().await;
//!     for event in events.drain() {
//!         if let SessionEvent::LocalOfferCreated { sdp, .. } = event {
//!             println!("relay offer to the remote peer: {} bytes", sdp.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use peerlink_core::{
    ConnectionConfig, DataChannelMessage, Frame, FrameFormat, Handle, IceCandidate, IceServer,
    ImagePlane, LoopbackEngine, NativeEngine, PeerLinkError, PeerLinkResult, Privilege,
    ProxyConfig, ProxyType, ResultCode, TrackKind, TrackSource,
};
pub use peerlink_media::{AppVideoSource, FrameStats};

// Public API modules
pub mod config;
pub mod connection;
pub mod data_channel;
pub mod event;
pub mod logging;
pub mod session;
pub mod sink;
pub mod stream;
pub mod track;

// Re-export main API types
pub use config::{LoggingConfig, SessionConfig};
pub use connection::{ConnectionId, ConnectionState, PeerConnection, DEFAULT_REMOTE_STREAM};
pub use data_channel::{DataChannel, DataChannelId};
pub use event::{EventStream, ObserverId, SessionEvent};
pub use logging::init_logging;
pub use session::{CycleStats, Session};
pub use sink::{FrameHandler, Sink, SinkId};
pub use stream::{MediaStream, StreamId};
pub use track::{Track, TrackId};
