//! Media streams and active-track selection
//!
//! A stream is a named bag of tracks with one active slot per kind. The
//! first track of a kind added to a stream becomes active and later ones
//! join disabled; selecting another track of that kind disables the rest.
//! Sinks bound to the stream always render the active track of their kind,
//! so every change of an active slot re-points them.

use crate::connection::ConnectionId;
use crate::session::{unknown, Session};
use crate::sink::SinkId;
use crate::track::TrackId;
use peerlink_core::{define_id, LogFailure, PeerLinkError, PeerLinkResult, TrackKind};
use tracing::{debug, info};

define_id!(
    /// Identifies a media stream within a session
    StreamId
);

/// Named collection of tracks
#[derive(Debug)]
pub struct MediaStream {
    pub(crate) name: String,
    pub(crate) tracks: Vec<TrackId>,
    pub(crate) active_audio: Option<TrackId>,
    pub(crate) active_video: Option<TrackId>,
    pub(crate) connections: Vec<ConnectionId>,
    pub(crate) remote_connection: Option<ConnectionId>,
    pub(crate) sinks: Vec<SinkId>,
}

impl MediaStream {
    pub(crate) fn new(name: &str, remote_connection: Option<ConnectionId>) -> Self {
        Self {
            name: name.to_string(),
            tracks: Vec::new(),
            active_audio: None,
            active_video: None,
            connections: remote_connection.into_iter().collect(),
            remote_connection,
            sinks: Vec::new(),
        }
    }

    /// Stream id as announced to or by the remote peer
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member tracks, in insertion order
    pub fn tracks(&self) -> &[TrackId] {
        &self.tracks
    }

    /// Active track of `kind`
    pub fn active_track(&self, kind: TrackKind) -> Option<TrackId> {
        match kind {
            TrackKind::Audio => self.active_audio,
            TrackKind::Video => self.active_video,
        }
    }

    fn active_slot(&mut self, kind: TrackKind) -> &mut Option<TrackId> {
        match kind {
            TrackKind::Audio => &mut self.active_audio,
            TrackKind::Video => &mut self.active_video,
        }
    }

    /// Created by the application
    pub fn is_local(&self) -> bool {
        self.remote_connection.is_none()
    }

    /// Connections the stream is announced on, or the one it came from
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    /// Connection a remote stream belongs to
    pub fn remote_connection(&self) -> Option<ConnectionId> {
        self.remote_connection
    }

    /// Sinks bound to the stream
    pub fn sinks(&self) -> &[SinkId] {
        &self.sinks
    }
}

impl Session {
    /// Create an empty local stream; `name` must be unique among local streams
    pub fn create_local_stream(&mut self, name: &str) -> PeerLinkResult<StreamId> {
        const OP: &str = "MediaStream.create";
        if name.is_empty() {
            return Err(PeerLinkError::invalid_param("stream id must not be empty")).log_failure(OP);
        }
        if self.local_stream_by_id(name).is_some() {
            return Err(PeerLinkError::invalid_param(format!(
                "local stream '{}' already exists",
                name
            )))
            .log_failure(OP);
        }
        let id = self.streams.insert(MediaStream::new(name, None));
        info!("Created local stream '{}' as {}", name, id);
        Ok(id)
    }

    /// Look up a stream
    pub fn stream(&self, id: StreamId) -> Option<&MediaStream> {
        self.streams.get(id)
    }

    /// Local stream with the given id
    pub fn local_stream_by_id(&self, name: &str) -> Option<StreamId> {
        self.streams
            .iter()
            .find(|(_, stream)| stream.is_local() && stream.name == name)
            .map(|(id, _)| id)
    }

    /// All live local streams
    pub fn local_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, stream)| stream.is_local())
            .map(|(id, _)| id)
            .collect()
    }

    /// Active track of `kind` in `stream`
    pub fn active_track(&self, stream: StreamId, kind: TrackKind) -> Option<TrackId> {
        self.streams.get(stream)?.active_track(kind)
    }

    /// Add a local track to a local stream.
    ///
    /// Succeeds without change when the track is already a member or is a
    /// remote track.
    pub fn add_track_to_stream(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "MediaStream.add_local_track";
        self.require_stream(stream, OP)?;
        let is_remote = self
            .tracks
            .get(track)
            .ok_or_else(|| unknown("track", track))
            .log_failure(OP)?
            .is_remote();
        if is_remote {
            debug!("{}: track {} is remote, membership unchanged", OP, track);
            return Ok(());
        }
        self.insert_into_stream(stream, track).log_failure(OP)
    }

    /// Remove a local track from a stream, unselecting it first when active.
    ///
    /// Succeeds without change when the track is not a member or is remote.
    pub fn remove_track_from_stream(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "MediaStream.remove_local_track";
        self.require_stream(stream, OP)?;
        let is_remote = self
            .tracks
            .get(track)
            .ok_or_else(|| unknown("track", track))
            .log_failure(OP)?
            .is_remote();
        if is_remote {
            return Ok(());
        }
        self.detach_from_stream(stream, track).log_failure(OP)
    }

    /// Make `track` the active track of its kind, disabling every other
    /// member of that kind
    pub fn select_track(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "MediaStream.select_track";
        let members = &self.require_stream(stream, OP)?.tracks;
        if !members.contains(&track) {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is not a member of stream {}",
                track, stream
            )))
            .log_failure(OP);
        }
        let kind = self
            .tracks
            .get(track)
            .map(|t| t.kind)
            .ok_or_else(|| unknown("track", track))
            .log_failure(OP)?;
        let others: Vec<TrackId> = members
            .iter()
            .copied()
            .filter(|member| *member != track)
            .filter(|member| self.tracks.get(*member).map(|t| t.kind) == Some(kind))
            .collect();

        let previous = self.active_track(stream, kind);
        for other in others {
            self.set_track_enabled(other, false).log_failure(OP)?;
        }
        if let Some(slot) = self.streams.get_mut(stream).map(|s| s.active_slot(kind)) {
            *slot = Some(track);
        }
        self.set_track_enabled(track, true).log_failure(OP)?;
        if previous != Some(track) {
            self.repoint_sinks(stream, kind)?;
        }
        debug!("Stream {}: {} track {} selected", stream, kind, track);
        Ok(())
    }

    /// Disable and clear the active slot if `track` is the active track
    pub fn unselect_track(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        const OP: &str = "MediaStream.unselect_track";
        self.require_stream(stream, OP)?;
        let Some(kind) = self.tracks.get(track).map(|t| t.kind) else {
            return Err(unknown("track", track)).log_failure(OP);
        };
        if self.active_track(stream, kind) != Some(track) {
            return Ok(());
        }

        self.set_track_enabled(track, false).log_failure(OP)?;
        if let Some(slot) = self.streams.get_mut(stream).map(|s| s.active_slot(kind)) {
            *slot = None;
        }
        self.repoint_sinks(stream, kind)?;
        debug!("Stream {}: {} track {} unselected", stream, kind, track);
        Ok(())
    }

    /// Destroy a local stream and every local track in it
    pub fn destroy_stream(&mut self, stream: StreamId) -> PeerLinkResult<()> {
        const OP: &str = "MediaStream.destroy";
        let entry = self.require_stream(stream, OP)?;
        if !entry.is_local() {
            return Err(PeerLinkError::invalid_param(format!(
                "remote stream {} is released by its connection",
                stream
            )))
            .log_failure(OP);
        }
        let members = entry.tracks.clone();
        let sinks = entry.sinks.clone();

        let mut first_error = None;
        for sink in sinks {
            if let Err(err) = self.unbind_sink(sink) {
                first_error.get_or_insert(err);
            }
        }
        for track in members {
            let local = self.tracks.get(track).map(|t| t.is_local()).unwrap_or(false);
            if local {
                if let Err(err) = self.destroy_track(track) {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(entry) = self.streams.remove(stream) {
            info!("Destroyed local stream '{}'", entry.name);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn require_stream(&self, stream: StreamId, operation: &str) -> PeerLinkResult<&MediaStream> {
        self.streams
            .get(stream)
            .ok_or_else(|| unknown("stream", stream))
            .log_failure(operation)
    }

    /// Add membership; the first track of a kind becomes active and later
    /// ones join disabled
    pub(crate) fn insert_into_stream(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        let Some(kind) = self.tracks.get(track).map(|t| t.kind) else {
            return Err(unknown("track", track));
        };
        let entry = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| unknown("stream", stream))?;
        if entry.tracks.contains(&track) {
            return Ok(());
        }
        entry.tracks.push(track);
        let auto_select = entry.active_track(kind).is_none();
        if let Some(track) = self.tracks.get_mut(track) {
            track.streams.push(stream);
        }

        if auto_select {
            self.select_track(stream, track)
        } else {
            // the slot is taken, so the newcomer waits disabled
            self.set_track_enabled(track, false)
        }
    }

    /// Drop membership, unselecting the track first when active
    pub(crate) fn detach_from_stream(&mut self, stream: StreamId, track: TrackId) -> PeerLinkResult<()> {
        let member = self
            .streams
            .get(stream)
            .map(|s| s.tracks.contains(&track))
            .unwrap_or(false);
        if !member {
            return Ok(());
        }

        let unselected = self.unselect_track(stream, track);
        if let Some(entry) = self.streams.get_mut(stream) {
            entry.tracks.retain(|t| *t != track);
        }
        if let Some(entry) = self.tracks.get_mut(track) {
            entry.streams.retain(|s| *s != stream);
        }
        unselected
    }

    /// Point every sink of `kind` bound to `stream` at the stream's active track
    pub(crate) fn repoint_sinks(&mut self, stream: StreamId, kind: TrackKind) -> PeerLinkResult<()> {
        let sinks: Vec<SinkId> = self
            .streams
            .get(stream)
            .map(|s| s.sinks.clone())
            .unwrap_or_default();

        let mut first_error = None;
        for sink in sinks {
            if self.sinks.get(sink).map(|s| s.kind) != Some(kind) {
                continue;
            }
            if let Err(err) = self.apply_sink_source(sink).log_failure("MediaStream.repoint_sinks") {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use peerlink_core::{LoopbackEngine, ResultCode};
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(Arc::new(LoopbackEngine::new()), SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_duplicate_local_id_rejected() {
        let mut session = session();
        session.create_local_stream("main").unwrap();
        assert_eq!(
            session.create_local_stream("main").unwrap_err().code(),
            ResultCode::InvalidParam
        );
        assert!(session.create_local_stream("").is_err());
    }

    #[test]
    fn test_selection_keeps_one_active_per_kind() {
        let mut session = session();
        let stream = session.create_local_stream("s").unwrap();
        let cam = session.create_camera_track().unwrap();
        let app = session.create_app_video_track().unwrap().0;
        let mic = session.create_microphone_track().unwrap();

        for track in [cam, app, mic] {
            session.add_track_to_stream(stream, track).unwrap();
        }
        assert_eq!(session.active_track(stream, TrackKind::Video), Some(cam));
        assert_eq!(session.active_track(stream, TrackKind::Audio), Some(mic));
        assert!(session.track_enabled(cam).unwrap());

        session.select_track(stream, app).unwrap();
        assert_eq!(session.active_track(stream, TrackKind::Video), Some(app));
        assert!(session.track_enabled(app).unwrap());
        assert!(!session.track_enabled(cam).unwrap());
        assert!(session.track_enabled(mic).unwrap());
    }

    #[test]
    fn test_late_joiners_stay_disabled_until_selected() {
        let mut session = session();
        let stream = session.create_local_stream("s").unwrap();
        let a = session.create_app_video_track().unwrap().0;
        let b = session.create_app_video_track().unwrap().0;
        let c = session.create_app_video_track().unwrap().0;
        for track in [a, b, c] {
            session.add_track_to_stream(stream, track).unwrap();
        }
        assert!(session.track_enabled(a).unwrap());
        assert!(!session.track_enabled(b).unwrap());
        assert!(!session.track_enabled(c).unwrap());

        // re-enabled behind the stream's back, then another member is selected
        session.set_track_enabled(c, true).unwrap();
        session.select_track(stream, b).unwrap();
        assert_eq!(session.active_track(stream, TrackKind::Video), Some(b));
        assert!(session.track_enabled(b).unwrap());
        assert!(!session.track_enabled(a).unwrap());
        assert!(!session.track_enabled(c).unwrap());

        session.select_track(stream, a).unwrap();
        assert!(session.track_enabled(a).unwrap());
        assert!(!session.track_enabled(b).unwrap());
        assert!(!session.track_enabled(c).unwrap());
    }

    #[test]
    fn test_unselect_only_affects_active_track() {
        let mut session = session();
        let stream = session.create_local_stream("s").unwrap();
        let first = session.create_app_video_track().unwrap().0;
        let second = session.create_app_video_track().unwrap().0;
        session.add_track_to_stream(stream, first).unwrap();
        session.add_track_to_stream(stream, second).unwrap();

        session.unselect_track(stream, second).unwrap();
        assert_eq!(session.active_track(stream, TrackKind::Video), Some(first));

        session.unselect_track(stream, first).unwrap();
        assert_eq!(session.active_track(stream, TrackKind::Video), None);
        assert!(!session.track_enabled(first).unwrap());
    }

    #[test]
    fn test_membership_changes_are_idempotent() {
        let mut session = session();
        let stream = session.create_local_stream("s").unwrap();
        let mic = session.create_microphone_track().unwrap();

        session.add_track_to_stream(stream, mic).unwrap();
        session.add_track_to_stream(stream, mic).unwrap();
        assert_eq!(session.stream(stream).unwrap().tracks(), &[mic]);

        session.remove_track_from_stream(stream, mic).unwrap();
        session.remove_track_from_stream(stream, mic).unwrap();
        assert!(session.stream(stream).unwrap().tracks().is_empty());
        assert_eq!(session.active_track(stream, TrackKind::Audio), None);
        assert!(session.track(mic).unwrap().streams().is_empty());
    }

    #[test]
    fn test_destroy_cascades_to_member_tracks() {
        let mut session = session();
        let stream = session.create_local_stream("s").unwrap();
        let mic = session.create_microphone_track().unwrap();
        let cam = session.create_camera_track().unwrap();
        session.add_track_to_stream(stream, mic).unwrap();
        session.add_track_to_stream(stream, cam).unwrap();

        session.destroy_stream(stream).unwrap();
        assert!(session.stream(stream).is_none());
        assert!(session.track(mic).is_none());
        assert!(session.track(cam).is_none());
        assert!(session.local_stream_by_id("s").is_none());
    }
}
