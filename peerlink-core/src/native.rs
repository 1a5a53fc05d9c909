//! Native engine boundary
//!
//! The media engine is reached only through [`NativeEngine`]: a handle-based
//! call surface where every call returns a result and every asynchronous
//! outcome comes back as a [`NativeEvent`] on an [`EventSender`]. Events may
//! be sent from any thread; the session drains them on its own thread.

use crate::error::PeerLinkResult;
use crate::frame::Frame;
use crate::handle::Handle;
use crate::ice::{ConnectionConfig, IceCandidate};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Media kind of a track or sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// What produces a track's media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Local microphone
    Microphone,
    /// Local device camera
    DeviceCamera,
    /// Application pushes frames itself
    AppDefinedVideo,
    /// Delivered by a remote peer
    Remote,
}

impl TrackSource {
    /// Kind of media this source produces
    pub fn kind(&self) -> Option<TrackKind> {
        match self {
            TrackSource::Microphone => Some(TrackKind::Audio),
            TrackSource::DeviceCamera | TrackSource::AppDefinedVideo => Some(TrackKind::Video),
            TrackSource::Remote => None,
        }
    }

    /// Privilege the device must grant before the source can start
    pub fn required_privilege(&self) -> Option<Privilege> {
        match self {
            TrackSource::Microphone => Some(Privilege::Microphone),
            TrackSource::DeviceCamera => Some(Privilege::Camera),
            TrackSource::AppDefinedVideo | TrackSource::Remote => None,
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::Microphone => write!(f, "microphone"),
            TrackSource::DeviceCamera => write!(f, "device_camera"),
            TrackSource::AppDefinedVideo => write!(f, "app_defined_video"),
            TrackSource::Remote => write!(f, "remote"),
        }
    }
}

/// Device privileges gating local capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    /// Camera capture
    Camera,
    /// Microphone capture
    Microphone,
    /// Network access, required to create connections
    Internet,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Privilege::Camera => write!(f, "camera"),
            Privilege::Microphone => write!(f, "microphone"),
            Privilege::Internet => write!(f, "internet"),
        }
    }
}

/// Message carried by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelMessage {
    /// Binary or UTF-8 text payload
    pub is_binary: bool,
    /// Payload bytes
    pub data: Bytes,
}

impl DataChannelMessage {
    /// Text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            is_binary: false,
            data: Bytes::from(text.into()),
        }
    }

    /// Binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            is_binary: true,
            data: data.into(),
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Payload as text, if this is a text message holding valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        if self.is_binary {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }
}

/// Asynchronous outcome reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEventKind {
    /// Local offer SDP is ready
    LocalOfferCreated {
        /// Session description
        sdp: String,
    },
    /// Local answer SDP is ready
    LocalAnswerCreated {
        /// Session description
        sdp: String,
    },
    /// A local ICE candidate was gathered
    IceCandidateFound {
        /// The candidate
        candidate: IceCandidate,
    },
    /// ICE gathering finished
    IceGatheringCompleted,
    /// Peer connection established
    Connected,
    /// Peer connection lost
    Disconnected,
    /// Negotiation or transport error
    Error {
        /// Error description
        message: String,
    },
    /// Remote peer added a track
    TrackAdded {
        /// Native track handle
        track: Handle,
        /// Track kind
        kind: TrackKind,
        /// Ids of the remote streams the track belongs to
        stream_ids: Vec<String>,
    },
    /// Remote peer removed a track
    TrackRemoved {
        /// Native track handle
        track: Handle,
    },
    /// Remote peer opened a data channel
    DataChannelReceived {
        /// Native data channel handle
        channel: Handle,
    },
    /// Data channel opened
    DataChannelOpened,
    /// Data channel closed
    DataChannelClosed,
    /// Data channel message arrived
    DataChannelMessage {
        /// The message
        message: DataChannelMessage,
    },
}

impl NativeEventKind {
    /// Event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            NativeEventKind::LocalOfferCreated { .. } => "local_offer_created",
            NativeEventKind::LocalAnswerCreated { .. } => "local_answer_created",
            NativeEventKind::IceCandidateFound { .. } => "ice_candidate_found",
            NativeEventKind::IceGatheringCompleted => "ice_gathering_completed",
            NativeEventKind::Connected => "connected",
            NativeEventKind::Disconnected => "disconnected",
            NativeEventKind::Error { .. } => "error",
            NativeEventKind::TrackAdded { .. } => "track_added",
            NativeEventKind::TrackRemoved { .. } => "track_removed",
            NativeEventKind::DataChannelReceived { .. } => "data_channel_received",
            NativeEventKind::DataChannelOpened => "data_channel_opened",
            NativeEventKind::DataChannelClosed => "data_channel_closed",
            NativeEventKind::DataChannelMessage { .. } => "data_channel_message",
        }
    }
}

/// Event tagged with the callback context it was registered under
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    /// Callback context token supplied when the callbacks were registered
    pub context: Handle,
    /// What happened
    pub kind: NativeEventKind,
}

/// Sending half of the native event queue; cloneable and thread-safe
pub type EventSender = mpsc::UnboundedSender<NativeEvent>;

/// Receiving half of the native event queue
pub type EventReceiver = mpsc::UnboundedReceiver<NativeEvent>;

/// Create a native event queue
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Handle-based call surface of the native media engine
pub trait NativeEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// Fail with `PrivilegeDenied` unless `privilege` is granted
    fn check_privilege(&self, privilege: Privilege) -> PeerLinkResult<()>;

    /// Create a connection whose callbacks report under `context`
    fn create_connection(
        &self,
        config: &ConnectionConfig,
        events: EventSender,
        context: Handle,
    ) -> PeerLinkResult<Handle>;

    /// Destroy a connection; no event for it is sent once this returns
    fn destroy_connection(&self, connection: Handle) -> PeerLinkResult<()>;

    /// Request a local offer (`LocalOfferCreated`)
    fn create_offer(&self, connection: Handle) -> PeerLinkResult<()>;

    /// Apply a remote offer and request an answer (`LocalAnswerCreated`)
    fn set_remote_offer(&self, connection: Handle, sdp: &str) -> PeerLinkResult<()>;

    /// Apply a remote answer
    fn set_remote_answer(&self, connection: Handle, sdp: &str) -> PeerLinkResult<()>;

    /// Add a candidate received from the remote peer
    fn add_remote_ice_candidate(
        &self,
        connection: Handle,
        candidate: &IceCandidate,
    ) -> PeerLinkResult<()>;

    /// Whether the connection is currently connected
    fn is_connected(&self, connection: Handle) -> PeerLinkResult<bool>;

    /// Whether the connection has failed
    fn has_failed(&self, connection: Handle) -> PeerLinkResult<bool>;

    /// Attach a local track, announcing the streams it belongs to
    fn add_local_track(
        &self,
        connection: Handle,
        track: Handle,
        stream_ids: &[String],
    ) -> PeerLinkResult<()>;

    /// Detach a local track
    fn remove_local_track(&self, connection: Handle, track: Handle) -> PeerLinkResult<()>;

    /// Create a local track for `source`
    fn create_local_track(&self, source: TrackSource) -> PeerLinkResult<Handle>;

    /// Destroy a local track
    fn destroy_track(&self, track: Handle) -> PeerLinkResult<()>;

    /// Release a remote track handed out by `TrackAdded`
    fn release_remote_track(&self, track: Handle) -> PeerLinkResult<()>;

    /// Enable or disable a track
    fn set_track_enabled(&self, track: Handle, enabled: bool) -> PeerLinkResult<()>;

    /// Current enablement of a track
    fn track_enabled(&self, track: Handle) -> PeerLinkResult<bool>;

    /// Reconnect a camera track to its capture device
    fn connect_camera(&self, track: Handle) -> PeerLinkResult<()>;

    /// Disconnect a camera track from its capture device
    fn disconnect_camera(&self, track: Handle) -> PeerLinkResult<()>;

    /// Push a frame into an application-defined video source
    fn push_frame(&self, source: Handle, frame: &Frame) -> PeerLinkResult<()>;

    /// Create an audio or video sink
    fn create_sink(&self, kind: TrackKind) -> PeerLinkResult<Handle>;

    /// Destroy a sink
    fn destroy_sink(&self, sink: Handle) -> PeerLinkResult<()>;

    /// Point a sink at a track; `Handle::INVALID` detaches it
    fn set_sink_source(&self, sink: Handle, track: Handle) -> PeerLinkResult<()>;

    /// Set audio sink volume in `0.0..=1.0`
    fn set_sink_volume(&self, sink: Handle, volume: f32) -> PeerLinkResult<()>;

    /// Whether a video sink has a frame it has not acquired yet
    fn is_new_frame_available(&self, sink: Handle) -> PeerLinkResult<bool>;

    /// Acquire the newest frame of a video sink, describing it into `out`.
    ///
    /// The returned frame handle must be passed to [`NativeEngine::release_frame`]
    /// exactly once.
    fn acquire_frame(&self, sink: Handle, out: &mut Frame) -> PeerLinkResult<Handle>;

    /// Release an acquired frame
    fn release_frame(&self, frame: Handle) -> PeerLinkResult<()>;

    /// Create a local data channel whose callbacks report under `context`
    fn create_data_channel(
        &self,
        connection: Handle,
        label: &str,
        events: EventSender,
        context: Handle,
    ) -> PeerLinkResult<Handle>;

    /// Register callbacks for a channel received from the remote peer
    fn register_data_channel(
        &self,
        channel: Handle,
        events: EventSender,
        context: Handle,
    ) -> PeerLinkResult<()>;

    /// Label of a data channel; ownership of the string passes to the caller
    fn data_channel_label(&self, channel: Handle) -> PeerLinkResult<String>;

    /// Whether a data channel is open
    fn is_data_channel_open(&self, channel: Handle) -> PeerLinkResult<bool>;

    /// Send a message on an open data channel
    fn send_data_channel_message(
        &self,
        channel: Handle,
        message: &DataChannelMessage,
    ) -> PeerLinkResult<()>;

    /// Destroy a data channel belonging to `connection`
    fn destroy_data_channel(&self, connection: Handle, channel: Handle) -> PeerLinkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_and_privilege() {
        assert_eq!(TrackSource::Microphone.kind(), Some(TrackKind::Audio));
        assert_eq!(TrackSource::DeviceCamera.kind(), Some(TrackKind::Video));
        assert_eq!(TrackSource::Remote.kind(), None);
        assert_eq!(
            TrackSource::DeviceCamera.required_privilege(),
            Some(Privilege::Camera)
        );
        assert_eq!(TrackSource::AppDefinedVideo.required_privilege(), None);
    }

    #[test]
    fn test_message_helpers() {
        let text = DataChannelMessage::text("hello");
        assert!(!text.is_binary);
        assert_eq!(text.size(), 5);
        assert_eq!(text.as_text(), Some("hello"));

        let binary = DataChannelMessage::binary(vec![1u8, 2, 3]);
        assert!(binary.is_binary);
        assert_eq!(binary.as_text(), None);
    }
}
