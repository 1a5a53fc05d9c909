//! Local and remote media tracks

use crate::connection::ConnectionId;
use crate::session::{unknown, Session};
use crate::stream::StreamId;
use peerlink_core::{
    define_id, Handle, InFlightGate, LogFailure, PeerLinkError, PeerLinkResult, TrackKind,
    TrackSource,
};
use peerlink_media::{lifecycle_for, AppVideoSource, DeviceLifecycle, SinkPause};
use std::sync::Arc;
use tracing::{debug, info, warn};

define_id!(
    /// Identifies a track within a session
    TrackId
);

/// A single media source
#[derive(Debug)]
pub struct Track {
    pub(crate) native: Handle,
    pub(crate) kind: TrackKind,
    pub(crate) source: TrackSource,
    pub(crate) connections: Vec<ConnectionId>,
    pub(crate) remote_connection: Option<ConnectionId>,
    pub(crate) streams: Vec<StreamId>,
    pub(crate) lifecycle: Option<Box<dyn DeviceLifecycle>>,
    pub(crate) source_gate: Option<Arc<InFlightGate>>,
}

impl Track {
    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// What produces the track's media
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Created by the application
    pub fn is_local(&self) -> bool {
        self.source != TrackSource::Remote
    }

    /// Delivered by a connection
    pub fn is_remote(&self) -> bool {
        self.source == TrackSource::Remote
    }

    /// Native handle
    pub fn native_handle(&self) -> Handle {
        self.native
    }

    /// Connections this local track is attached to
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    /// Connection that delivered this remote track
    pub fn remote_connection(&self) -> Option<ConnectionId> {
        self.remote_connection
    }

    /// Streams the track is a member of
    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }
}

/// Keeps a track's producers and consumers stopped while it is changed.
///
/// Dropping reopens the source gate; the sink pauses end with it.
pub(crate) struct TrackQuiesce {
    source_gate: Option<Arc<InFlightGate>>,
    _pauses: Vec<SinkPause>,
}

impl TrackQuiesce {
    /// Leave the source gate closed for good
    pub(crate) fn keep_closed(mut self) {
        self.source_gate = None;
    }
}

impl Drop for TrackQuiesce {
    fn drop(&mut self) {
        if let Some(gate) = self.source_gate.take() {
            gate.reopen();
        }
    }
}

impl Session {
    /// Create a local track for `source`
    pub fn create_local_track(&mut self, source: TrackSource) -> PeerLinkResult<TrackId> {
        const OP: &str = "Track.create_local";
        let kind = source
            .kind()
            .ok_or_else(|| PeerLinkError::invalid_param("remote tracks are created by connections"))
            .log_failure(OP)?;
        if let Some(privilege) = source.required_privilege() {
            self.engine.check_privilege(privilege).log_failure(OP)?;
        }
        let native = self.engine.create_local_track(source).log_failure(OP)?;

        let id = self.tracks.insert(Track {
            native,
            kind,
            source,
            connections: Vec::new(),
            remote_connection: None,
            streams: Vec::new(),
            lifecycle: Some(lifecycle_for(source)),
            source_gate: (source == TrackSource::AppDefinedVideo)
                .then(|| Arc::new(InFlightGate::new())),
        });
        info!("Created local {} track {} from {}", kind, id, source);
        Ok(id)
    }

    /// Create a microphone track
    pub fn create_microphone_track(&mut self) -> PeerLinkResult<TrackId> {
        self.create_local_track(TrackSource::Microphone)
    }

    /// Create a device camera track
    pub fn create_camera_track(&mut self) -> PeerLinkResult<TrackId> {
        self.create_local_track(TrackSource::DeviceCamera)
    }

    /// Create a video track fed by the application, with its producer handle
    pub fn create_app_video_track(&mut self) -> PeerLinkResult<(TrackId, AppVideoSource)> {
        let id = self.create_local_track(TrackSource::AppDefinedVideo)?;
        let source = self.video_source(id)?;
        Ok((id, source))
    }

    /// Producer handle of an application-defined video track
    pub fn video_source(&self, id: TrackId) -> PeerLinkResult<AppVideoSource> {
        let track = self
            .tracks
            .get(id)
            .ok_or_else(|| unknown("track", id))
            .log_failure("Track.video_source")?;
        let gate = track
            .source_gate
            .clone()
            .ok_or_else(|| {
                PeerLinkError::invalid_param(format!("track {} is not application-defined video", id))
            })
            .log_failure("Track.video_source")?;
        Ok(AppVideoSource::new(Arc::clone(&self.engine), track.native, gate))
    }

    /// Look up a track
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id)
    }

    /// All live local tracks
    pub fn local_tracks(&self) -> Vec<TrackId> {
        self.tracks
            .iter()
            .filter(|(_, track)| track.is_local())
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn track_native(&self, id: TrackId, operation: &str) -> PeerLinkResult<Handle> {
        self.tracks
            .get(id)
            .map(|track| track.native)
            .ok_or_else(|| unknown("track", id))
            .log_failure(operation)
    }

    /// Current enablement, queried from the engine
    pub fn track_enabled(&self, id: TrackId) -> PeerLinkResult<bool> {
        let native = self.track_native(id, "Track.get_enabled")?;
        self.engine.track_enabled(native).log_failure("Track.get_enabled")
    }

    /// Lenient form of [`Session::track_enabled`]: `false` on failure
    pub fn track_enabled_or_false(&self, id: TrackId) -> bool {
        self.track_enabled(id).unwrap_or(false)
    }

    /// Enable or disable a track; no-op when the state already matches
    pub fn set_track_enabled(&mut self, id: TrackId, enabled: bool) -> PeerLinkResult<()> {
        const OP: &str = "Track.set_enabled";
        let native = self.track_native(id, OP)?;
        if self.engine.track_enabled(native).log_failure(OP)? == enabled {
            return Ok(());
        }

        let quiesce = if enabled {
            None
        } else {
            Some(self.quiesce_track(id, OP).log_failure(OP)?)
        };
        let result = self.engine.set_track_enabled(native, enabled).log_failure(OP);
        drop(quiesce);
        debug!("Track {} enabled={}", id, enabled);
        result
    }

    /// Video sinks currently rendering `id` through a stream's active slot
    pub(crate) fn sinks_rendering(&self, id: TrackId) -> Vec<crate::sink::SinkId> {
        self.sinks
            .iter()
            .filter(|(_, sink)| sink.kind == TrackKind::Video)
            .filter(|(_, sink)| {
                sink.stream
                    .and_then(|stream| self.streams.get(stream))
                    .and_then(|stream| stream.active_track(TrackKind::Video))
                    == Some(id)
            })
            .map(|(sink_id, _)| sink_id)
            .collect()
    }

    /// Wait out pushes into the track and acquisitions from sinks rendering it
    pub(crate) fn quiesce_track(&self, id: TrackId, operation: &str) -> PeerLinkResult<TrackQuiesce> {
        let track = self.tracks.get(id).ok_or_else(|| unknown("track", id))?;
        let timeout = self.config.destroy_wait_timeout;
        let mut quiesce = TrackQuiesce {
            source_gate: None,
            _pauses: Vec::new(),
        };

        // a gate closed by destroy stays closed
        if let Some(gate) = track.source_gate.as_ref().filter(|gate| !gate.is_closed()) {
            gate.close_and_drain(operation, timeout)?;
            quiesce.source_gate = Some(Arc::clone(gate));
        }
        for sink in self.sinks_rendering(id) {
            quiesce._pauses.push(self.pipeline.pause(sink.handle(), timeout)?);
        }
        Ok(quiesce)
    }

    /// Destroy a local track.
    ///
    /// The track leaves every stream (unselecting it first when active) and
    /// is detached from every connection before the native track goes away.
    /// Its id stops resolving even if the native destroy call fails.
    pub fn destroy_track(&mut self, id: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "Track.destroy";
        let track = self
            .tracks
            .get(id)
            .ok_or_else(|| unknown("track", id))
            .log_failure(OP)?;
        if track.is_remote() {
            return Err(PeerLinkError::invalid_param(format!(
                "remote track {} is released by its connection",
                id
            )))
            .log_failure(OP);
        }
        let native = track.native;
        let streams = track.streams.clone();
        let connections = track.connections.clone();

        self.quiesce_track(id, OP).log_failure(OP)?.keep_closed();

        for stream in streams {
            if let Err(err) = self.detach_from_stream(stream, id) {
                warn!("Track {} left stream {} uncleanly: {}", id, stream, err);
            }
        }
        for connection in connections {
            if let Some(conn_native) = self.connections.get(connection).map(|c| c.native) {
                let _ = self
                    .engine
                    .remove_local_track(conn_native, native)
                    .log_failure(OP);
            }
            self.unlink_local_track(connection, id);
        }

        let result = self.engine.destroy_track(native).log_failure(OP);
        self.tracks.remove(id);
        info!("Destroyed track {}", id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use bytes::Bytes;
    use peerlink_core::{Frame, LoopbackEngine, NativeEngine, Privilege, ResultCode};

    fn session() -> (Arc<LoopbackEngine>, Session) {
        let engine = Arc::new(LoopbackEngine::new());
        let session = Session::new(engine.clone(), SessionConfig::default()).unwrap();
        (engine, session)
    }

    #[test]
    fn test_set_enabled_round_trips_native() {
        let (engine, mut session) = session();
        let mic = session.create_microphone_track().unwrap();
        assert!(session.track_enabled(mic).unwrap());

        session.set_track_enabled(mic, false).unwrap();
        let native = session.track(mic).unwrap().native_handle();
        assert!(!engine.track_enabled(native).unwrap());

        // matching state skips the native setter
        engine.fail_next("set_track_enabled");
        assert!(session.set_track_enabled(mic, false).is_ok());
    }

    #[test]
    fn test_privilege_denied_surfaces() {
        let (engine, mut session) = session();
        engine.deny_privilege(Privilege::Microphone);
        assert_eq!(
            session.create_microphone_track().unwrap_err().code(),
            ResultCode::PrivilegeDenied
        );
        assert!(session.local_tracks().is_empty());
    }

    #[test]
    fn test_destroyed_track_closes_its_video_source() {
        let (engine, mut session) = session();
        let (track, source) = session.create_app_video_track().unwrap();
        let frame = Frame::rgba(1, 0, 1, 1, Bytes::from(vec![0u8; 4])).unwrap();
        source.push_frame(&frame).unwrap();

        session.destroy_track(track).unwrap();
        assert!(session.track(track).is_none());
        assert!(source.is_closed());
        assert!(source.push_frame(&frame).is_err());
        assert_eq!(engine.track_count(), 0);
        assert_eq!(
            session.destroy_track(track).unwrap_err().code(),
            ResultCode::InvalidParam
        );
    }

    #[test]
    fn test_lenient_query_defaults_to_false() {
        let (_engine, mut session) = session();
        let mic = session.create_microphone_track().unwrap();
        session.destroy_track(mic).unwrap();
        assert!(!session.track_enabled_or_false(mic));
    }

    #[test]
    fn test_only_app_video_tracks_have_sources() {
        let (_engine, mut session) = session();
        let camera = session.create_camera_track().unwrap();
        assert!(session.video_source(camera).is_err());
    }
}
