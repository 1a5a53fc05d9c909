//! Peer connections: negotiation, track attachment and event routing

use crate::data_channel::{DataChannel, DataChannelId};
use crate::event::SessionEvent;
use crate::session::{unknown, CallbackTarget, ContextId, Session};
use crate::stream::{MediaStream, StreamId};
use crate::track::{Track, TrackId};
use peerlink_core::{
    define_id, ConnectionConfig, Handle, IceCandidate, LogFailure, NativeEventKind,
    PeerLinkError, PeerLinkResult, Privilege, TrackKind, TrackSource,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Stream id used for remote tracks announced without one
pub const DEFAULT_REMOTE_STREAM: &str = "default";

define_id!(
    /// Identifies a peer connection within a session
    ConnectionId
);

/// Negotiation state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet
    Created,
    /// Offer or answer in progress
    Negotiating,
    /// Media can flow
    Connected,
    /// Connection was lost
    Disconnected,
    /// The engine reported an error
    Failed,
}

/// A negotiated session with one remote peer
#[derive(Debug)]
pub struct PeerConnection {
    pub(crate) native: Handle,
    pub(crate) context: ContextId,
    pub(crate) config: ConnectionConfig,
    pub(crate) state: ConnectionState,
    pub(crate) local_tracks: Vec<TrackId>,
    pub(crate) remote_streams: Vec<(String, StreamId)>,
    pub(crate) remote_tracks: Vec<(Handle, TrackId)>,
    pub(crate) local_channels: Vec<DataChannelId>,
    pub(crate) remote_channels: Vec<DataChannelId>,
}

impl PeerConnection {
    /// Native handle
    pub fn native_handle(&self) -> Handle {
        self.native
    }

    /// Configuration the connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Last state reported through events
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attached local tracks
    pub fn local_tracks(&self) -> &[TrackId] {
        &self.local_tracks
    }

    /// Remote streams, in arrival order
    pub fn remote_streams(&self) -> Vec<StreamId> {
        self.remote_streams.iter().map(|(_, id)| *id).collect()
    }

    /// Live remote tracks
    pub fn remote_tracks(&self) -> Vec<TrackId> {
        self.remote_tracks.iter().map(|(_, id)| *id).collect()
    }

    /// Data channels created locally
    pub fn local_data_channels(&self) -> &[DataChannelId] {
        &self.local_channels
    }

    /// Data channels opened by the remote peer
    pub fn remote_data_channels(&self) -> &[DataChannelId] {
        &self.remote_channels
    }
}

impl Session {
    /// Create a connection using `config`
    pub fn create_connection(&mut self, config: ConnectionConfig) -> PeerLinkResult<ConnectionId> {
        const OP: &str = "PeerConnection.create_remote";
        config.validate().log_failure(OP)?;
        self.engine.check_privilege(Privilege::Internet).log_failure(OP)?;

        let context = self.contexts.insert(CallbackTarget::Pending);
        let native = match self
            .engine
            .create_connection(&config, self.native_tx.clone(), context.handle())
        {
            Ok(native) => native,
            Err(err) => {
                self.contexts.remove(context);
                return Err(err).log_failure(OP);
            }
        };

        let id = self.connections.insert(PeerConnection {
            native,
            context,
            config,
            state: ConnectionState::Created,
            local_tracks: Vec::new(),
            remote_streams: Vec::new(),
            remote_tracks: Vec::new(),
            local_channels: Vec::new(),
            remote_channels: Vec::new(),
        });
        if let Some(target) = self.contexts.get_mut(context) {
            *target = CallbackTarget::Connection(id);
        }
        info!("Created connection {} (native {})", id, native);
        Ok(id)
    }

    /// Look up a connection
    pub fn connection(&self, id: ConnectionId) -> Option<&PeerConnection> {
        self.connections.get(id)
    }

    /// All live connections
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.keys()
    }

    /// Remote stream `name` delivered by `connection`
    pub fn remote_stream(&self, connection: ConnectionId, name: &str) -> Option<StreamId> {
        self.connections
            .get(connection)?
            .remote_streams
            .iter()
            .find(|(stream, _)| stream == name)
            .map(|(_, id)| *id)
    }

    pub(crate) fn connection_native(&self, id: ConnectionId, operation: &str) -> PeerLinkResult<Handle> {
        self.connections
            .get(id)
            .map(|conn| conn.native)
            .ok_or_else(|| unknown("connection", id))
            .log_failure(operation)
    }

    fn mark_negotiating(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(id) {
            if conn.state == ConnectionState::Created {
                conn.state = ConnectionState::Negotiating;
            }
        }
    }

    /// Request a local offer; it arrives as [`SessionEvent::LocalOfferCreated`]
    pub fn create_offer(&mut self, id: ConnectionId) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.create_offer";
        let native = self.connection_native(id, OP)?;
        self.engine.create_offer(native).log_failure(OP)?;
        self.mark_negotiating(id);
        Ok(())
    }

    /// Apply the remote peer's offer; the answer arrives as
    /// [`SessionEvent::LocalAnswerCreated`]
    pub fn set_remote_offer(&mut self, id: ConnectionId, sdp: &str) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.set_remote_offer";
        let native = self.connection_native(id, OP)?;
        self.engine.set_remote_offer(native, sdp).log_failure(OP)?;
        self.mark_negotiating(id);
        Ok(())
    }

    /// Apply the remote peer's answer
    pub fn set_remote_answer(&mut self, id: ConnectionId, sdp: &str) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.set_remote_answer";
        let native = self.connection_native(id, OP)?;
        self.engine.set_remote_answer(native, sdp).log_failure(OP)?;
        self.mark_negotiating(id);
        Ok(())
    }

    /// Add an ICE candidate received from the remote peer
    pub fn add_remote_ice_candidate(&self, id: ConnectionId, candidate: &IceCandidate) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.add_remote_ice_candidate";
        let native = self.connection_native(id, OP)?;
        self.engine
            .add_remote_ice_candidate(native, candidate)
            .log_failure(OP)
    }

    /// Whether the engine reports the connection as connected
    pub fn is_connected(&self, id: ConnectionId) -> PeerLinkResult<bool> {
        const OP: &str = "PeerConnection.is_connected";
        let native = self.connection_native(id, OP)?;
        self.engine.is_connected(native).log_failure(OP)
    }

    /// Lenient form of [`Session::is_connected`]: `false` on failure
    pub fn is_connected_or_false(&self, id: ConnectionId) -> bool {
        self.is_connected(id).unwrap_or(false)
    }

    /// Whether the engine reports the connection as failed
    pub fn has_failed(&self, id: ConnectionId) -> PeerLinkResult<bool> {
        const OP: &str = "PeerConnection.has_failed";
        let native = self.connection_native(id, OP)?;
        self.engine.has_failed(native).log_failure(OP)
    }

    /// Lenient form of [`Session::has_failed`]: `false` on failure
    pub fn has_failed_or_false(&self, id: ConnectionId) -> bool {
        self.has_failed(id).unwrap_or(false)
    }

    /// Attach a local track; a track can be attached to a connection once
    pub fn add_local_track(&mut self, id: ConnectionId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.add_local_track";
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| unknown("connection", id))
            .log_failure(OP)?;
        let conn_native = conn.native;
        if conn.local_tracks.contains(&track) {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is already attached to connection {}",
                track, id
            )))
            .log_failure(OP);
        }
        let entry = self
            .tracks
            .get(track)
            .ok_or_else(|| unknown("track", track))
            .log_failure(OP)?;
        if entry.is_remote() {
            return Err(PeerLinkError::invalid_param(format!(
                "remote track {} cannot be sent",
                track
            )))
            .log_failure(OP);
        }
        let streams = entry.streams.clone();
        let stream_ids: Vec<String> = streams
            .iter()
            .filter_map(|stream| self.streams.get(*stream).map(|s| s.name.clone()))
            .collect();

        self.engine
            .add_local_track(conn_native, entry.native, &stream_ids)
            .log_failure(OP)?;

        if let Some(conn) = self.connections.get_mut(id) {
            conn.local_tracks.push(track);
        }
        if let Some(entry) = self.tracks.get_mut(track) {
            entry.connections.push(id);
        }
        for stream in streams {
            if let Some(stream) = self.streams.get_mut(stream) {
                if !stream.connections.contains(&id) {
                    stream.connections.push(id);
                }
            }
        }
        debug!("Connection {}: attached track {} in {:?}", id, track, stream_ids);
        Ok(())
    }

    /// Detach a local track; detaching a track that is not attached is an error
    pub fn remove_local_track(&mut self, id: ConnectionId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.remove_local_track";
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| unknown("connection", id))
            .log_failure(OP)?;
        if !conn.local_tracks.contains(&track) {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is not attached to connection {}",
                track, id
            )))
            .log_failure(OP);
        }
        let conn_native = conn.native;
        let track_native = self.track_native(track, OP)?;

        self.engine
            .remove_local_track(conn_native, track_native)
            .log_failure(OP)?;
        self.unlink_local_track(id, track);
        debug!("Connection {}: detached track {}", id, track);
        Ok(())
    }

    /// Forget the attachment of `track` to `id` on both sides.
    ///
    /// A stream stays attached while any of its other tracks is.
    pub(crate) fn unlink_local_track(&mut self, id: ConnectionId, track: TrackId) {
        let remaining: Vec<TrackId> = match self.connections.get_mut(id) {
            Some(conn) => {
                conn.local_tracks.retain(|t| *t != track);
                conn.local_tracks.clone()
            }
            None => Vec::new(),
        };
        let streams = match self.tracks.get_mut(track) {
            Some(entry) => {
                entry.connections.retain(|c| *c != id);
                entry.streams.clone()
            }
            None => Vec::new(),
        };
        for stream in streams {
            let still_attached = self
                .streams
                .get(stream)
                .map(|s| s.tracks.iter().any(|t| remaining.contains(t)))
                .unwrap_or(false);
            if !still_attached {
                if let Some(stream) = self.streams.get_mut(stream) {
                    stream.connections.retain(|c| *c != id);
                }
            }
        }
    }

    /// Destroy a connection.
    ///
    /// Local tracks are detached but survive; remote tracks and streams are
    /// released; local data channels are destroyed; then the native
    /// connection goes away and its callback context is released last.
    pub fn destroy_connection(&mut self, id: ConnectionId) -> PeerLinkResult<()> {
        const OP: &str = "PeerConnection.destroy";
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| unknown("connection", id))
            .log_failure(OP)?;
        let native = conn.native;
        let context = conn.context;
        let local_tracks = conn.local_tracks.clone();
        let remote_tracks = conn.remote_tracks();
        let remote_streams = conn.remote_streams();
        let local_channels = conn.local_channels.clone();
        let remote_channels = conn.remote_channels.clone();

        for track in local_tracks {
            if let Some(track_native) = self.tracks.get(track).map(|t| t.native) {
                let _ = self
                    .engine
                    .remove_local_track(native, track_native)
                    .log_failure(OP);
            }
            self.unlink_local_track(id, track);
        }

        for track in remote_tracks {
            self.release_remote_track(id, track);
        }
        for stream in remote_streams {
            self.release_remote_stream(stream);
        }
        if let Some(conn) = self.connections.get_mut(id) {
            conn.remote_streams.clear();
        }

        for channel in local_channels {
            let _ = self.destroy_data_channel(channel);
        }
        for channel in remote_channels {
            self.forget_data_channel(channel);
        }

        self.engine.destroy_connection(native).log_failure(OP)?;
        self.contexts.remove(context);
        self.connections.remove(id);
        info!("Destroyed connection {}", id);
        Ok(())
    }

    /// Leave every stream, release natively and forget a remote track
    fn release_remote_track(&mut self, id: ConnectionId, track: TrackId) -> Option<TrackKind> {
        let (native, kind, streams) = {
            let entry = self.tracks.get(track)?;
            (entry.native, entry.kind, entry.streams.clone())
        };
        for stream in streams {
            if let Err(err) = self.detach_from_stream(stream, track) {
                warn!("Remote track {} left stream {} uncleanly: {}", track, stream, err);
            }
        }
        let _ = self
            .engine
            .release_remote_track(native)
            .log_failure("PeerConnection.release_remote_track");
        self.tracks.remove(track);
        if let Some(conn) = self.connections.get_mut(id) {
            conn.remote_tracks.retain(|(_, t)| *t != track);
        }
        Some(kind)
    }

    fn release_remote_stream(&mut self, stream: StreamId) {
        let sinks = self
            .streams
            .get(stream)
            .map(|s| s.sinks.clone())
            .unwrap_or_default();
        for sink in sinks {
            let _ = self.unbind_sink(sink);
        }
        self.streams.remove(stream);
    }

    fn remote_stream_or_create(&mut self, id: ConnectionId, name: &str) -> Option<StreamId> {
        if let Some(stream) = self.remote_stream(id, name) {
            return Some(stream);
        }
        let conn = self.connections.get_mut(id)?;
        let stream = self.streams.insert(MediaStream::new(name, Some(id)));
        conn.remote_streams.push((name.to_string(), stream));
        debug!("Connection {}: new remote stream '{}'", id, name);
        Some(stream)
    }

    pub(crate) fn handle_connection_event(&mut self, id: ConnectionId, kind: NativeEventKind) {
        if !self.connections.contains(id) {
            debug!("Dropping {} for destroyed connection {}", kind.name(), id);
            return;
        }
        let event = match kind {
            NativeEventKind::LocalOfferCreated { sdp } => SessionEvent::LocalOfferCreated { connection: id, sdp },
            NativeEventKind::LocalAnswerCreated { sdp } => SessionEvent::LocalAnswerCreated { connection: id, sdp },
            NativeEventKind::IceCandidateFound { candidate } => {
                SessionEvent::LocalIceCandidateFound { connection: id, candidate }
            }
            NativeEventKind::IceGatheringCompleted => SessionEvent::IceGatheringCompleted { connection: id },
            NativeEventKind::Connected => {
                self.set_state(id, ConnectionState::Connected);
                SessionEvent::Connected { connection: id }
            }
            NativeEventKind::Disconnected => {
                self.set_state(id, ConnectionState::Disconnected);
                SessionEvent::Disconnected { connection: id }
            }
            NativeEventKind::Error { message } => {
                warn!("Connection {} reported an error: {}", id, message);
                self.set_state(id, ConnectionState::Failed);
                SessionEvent::ConnectionError { connection: id, message }
            }
            NativeEventKind::TrackAdded {
                track,
                kind,
                stream_ids,
            } => self.on_remote_track_added(id, track, kind, stream_ids),
            NativeEventKind::TrackRemoved { track } => {
                let Some(track_id) = self.connections.get(id).and_then(|conn| {
                    conn.remote_tracks
                        .iter()
                        .find(|(native, _)| *native == track)
                        .map(|(_, track_id)| *track_id)
                }) else {
                    debug!("Connection {}: removal of unknown remote track {}", id, track);
                    return;
                };
                let Some(kind) = self.release_remote_track(id, track_id) else {
                    return;
                };
                SessionEvent::TrackRemoved {
                    connection: id,
                    track: track_id,
                    kind,
                }
            }
            NativeEventKind::DataChannelReceived { channel } => {
                let Some(channel) = self.on_remote_data_channel(id, channel) else {
                    return;
                };
                SessionEvent::DataChannelReceived { connection: id, channel }
            }
            other => {
                debug!("Connection {}: ignoring {}", id, other.name());
                return;
            }
        };
        self.hub.publish(event);
    }

    fn set_state(&mut self, id: ConnectionId, state: ConnectionState) {
        if let Some(conn) = self.connections.get_mut(id) {
            debug!("Connection {}: {:?} -> {:?}", id, conn.state, state);
            conn.state = state;
        }
    }

    fn on_remote_track_added(
        &mut self,
        id: ConnectionId,
        native: Handle,
        kind: TrackKind,
        stream_ids: Vec<String>,
    ) -> SessionEvent {
        let track = self.tracks.insert(Track {
            native,
            kind,
            source: TrackSource::Remote,
            connections: Vec::new(),
            remote_connection: Some(id),
            streams: Vec::new(),
            lifecycle: None,
            source_gate: None,
        });
        if let Some(conn) = self.connections.get_mut(id) {
            conn.remote_tracks.push((native, track));
        }

        let mut names: Vec<String> = Vec::with_capacity(stream_ids.len());
        for name in stream_ids {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            names.push(DEFAULT_REMOTE_STREAM.to_string());
        }

        let mut streams = Vec::new();
        for name in names {
            let Some(stream) = self.remote_stream_or_create(id, &name) else {
                continue;
            };
            let _ = self
                .insert_into_stream(stream, track)
                .log_failure("PeerConnection.on_track_added");
            streams.push(stream);
        }
        info!("Connection {}: remote {} track {} in {} stream(s)", id, kind, track, streams.len());
        SessionEvent::TrackAdded {
            connection: id,
            track,
            kind,
            streams,
        }
    }

    fn on_remote_data_channel(&mut self, id: ConnectionId, native: Handle) -> Option<DataChannelId> {
        const OP: &str = "PeerConnection.on_data_channel_received";
        let label = self.engine.data_channel_label(native).log_failure(OP).ok()?;
        let context = self.contexts.insert(CallbackTarget::Pending);
        if self
            .engine
            .register_data_channel(native, self.native_tx.clone(), context.handle())
            .log_failure(OP)
            .is_err()
        {
            self.contexts.remove(context);
            return None;
        }
        let open = self.engine.is_data_channel_open(native).unwrap_or(false);

        let channel = self.channels.insert(DataChannel {
            native,
            label,
            connection: Some(id),
            context,
            local: false,
            open,
        });
        if let Some(target) = self.contexts.get_mut(context) {
            *target = CallbackTarget::DataChannel(channel);
        }
        if let Some(conn) = self.connections.get_mut(id) {
            conn.remote_channels.push(channel);
        }
        Some(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use peerlink_core::{IceServer, LoopbackEngine, ResultCode};
    use std::sync::Arc;

    fn session() -> (Arc<LoopbackEngine>, Session) {
        let engine = Arc::new(LoopbackEngine::new());
        let session = Session::new(engine.clone(), SessionConfig::default()).unwrap();
        (engine, session)
    }

    #[test]
    fn test_create_rejects_bad_ice_server() {
        let (engine, mut session) = session();
        let err = session
            .create_connection(ConnectionConfig::new(vec![IceServer::stun("ftp://x")]))
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParam);
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_native_failure_releases_context() {
        let (engine, mut session) = session();
        engine.fail_next("create_connection");
        let err = session
            .create_connection(ConnectionConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::UnspecifiedFailure);
        assert_eq!(session.contexts.len(), 0);
    }

    #[test]
    fn test_attach_at_most_once() {
        let (engine, mut session) = session();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        let stream = session.create_local_stream("s").unwrap();
        let mic = session.create_microphone_track().unwrap();
        session.add_track_to_stream(stream, mic).unwrap();

        session.add_local_track(conn, mic).unwrap();
        assert_eq!(
            session.add_local_track(conn, mic).unwrap_err().code(),
            ResultCode::InvalidParam
        );
        assert_eq!(session.connection(conn).unwrap().local_tracks(), &[mic]);
        assert_eq!(session.stream(stream).unwrap().connections(), &[conn]);
        let native = session.connection(conn).unwrap().native_handle();
        assert_eq!(engine.attached_tracks(native).len(), 1);

        session.remove_local_track(conn, mic).unwrap();
        assert!(session.stream(stream).unwrap().connections().is_empty());
        assert_eq!(
            session.remove_local_track(conn, mic).unwrap_err().code(),
            ResultCode::InvalidParam
        );
    }

    #[test]
    fn test_unknown_connection_is_invalid_param() {
        let (_engine, mut session) = session();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        session.destroy_connection(conn).unwrap();
        assert_eq!(
            session.create_offer(conn).unwrap_err().code(),
            ResultCode::InvalidParam
        );
        assert!(!session.is_connected_or_false(conn));
        assert!(session.connections().is_empty());
    }
}
