//! # PeerLink Core
//!
//! Foundational types for the PeerLink media session subsystem: opaque
//! handles and generation-counted registries, result codes and errors,
//! decoded frame records, ICE and proxy configuration, and the handle-based
//! [`NativeEngine`] boundary together with an in-process loopback engine.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod gate;
pub mod handle;
pub mod ice;
pub mod loopback;
pub mod native;

// Re-export main types
pub use error::{LogFailure, PeerLinkError, PeerLinkResult, ResultCode};
pub use frame::{Frame, FrameFormat, ImagePlane, MAX_PLANES};
pub use gate::{InFlightGate, InFlightGuard};
pub use handle::{Handle, HandleAllocator, Registry, RegistryKey};
pub use ice::{ConnectionConfig, IceCandidate, IceServer, ProxyConfig, ProxyType};
pub use loopback::{HeldCall, LoopbackEngine};
pub use native::{
    event_channel, DataChannelMessage, EventReceiver, EventSender, NativeEngine, NativeEvent,
    NativeEventKind, Privilege, TrackKind, TrackSource,
};
