//! Audio and video sinks
//!
//! A sink renders the active track of its kind in the stream it is bound
//! to. Video sinks are registered with the frame pipeline and hand every
//! delivered frame to their handler on the thread running
//! [`Session::update`].

use crate::session::{unknown, Session};
use crate::stream::StreamId;
use peerlink_core::{
    define_id, Frame, Handle, LogFailure, PeerLinkError, PeerLinkResult, TrackKind,
};
use peerlink_media::FrameStats;
use tracing::{debug, info};

define_id!(
    /// Identifies a sink within a session
    SinkId
);

/// Callback receiving decoded video frames
pub type FrameHandler = Box<dyn FnMut(&Frame) + Send>;

/// Consumer of a stream's active track
pub struct Sink {
    pub(crate) native: Handle,
    pub(crate) kind: TrackKind,
    pub(crate) stream: Option<StreamId>,
    pub(crate) handler: Option<FrameHandler>,
    pub(crate) volume: f32,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("native", &self.native)
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("has_handler", &self.handler.is_some())
            .field("volume", &self.volume)
            .finish()
    }
}

impl Sink {
    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Stream the sink is bound to
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Audio volume in `0.0..=1.0`
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Native handle
    pub fn native_handle(&self) -> Handle {
        self.native
    }
}

impl Session {
    /// Create an unbound audio sink
    pub fn create_audio_sink(&mut self) -> PeerLinkResult<SinkId> {
        self.create_sink(TrackKind::Audio, None)
    }

    /// Create an unbound video sink delivering frames to `handler`
    pub fn create_video_sink(
        &mut self,
        handler: impl FnMut(&Frame) + Send + 'static,
    ) -> PeerLinkResult<SinkId> {
        self.create_sink(TrackKind::Video, Some(Box::new(handler)))
    }

    fn create_sink(&mut self, kind: TrackKind, handler: Option<FrameHandler>) -> PeerLinkResult<SinkId> {
        const OP: &str = "Sink.create";
        let native = self.engine.create_sink(kind).log_failure(OP)?;
        let id = self.sinks.insert(Sink {
            native,
            kind,
            stream: None,
            handler,
            volume: 1.0,
        });

        if kind == TrackKind::Video {
            if let Err(err) = self.pipeline.register(id.handle(), native).log_failure(OP) {
                self.sinks.remove(id);
                let _ = self.engine.destroy_sink(native).log_failure(OP);
                return Err(err);
            }
        }
        info!("Created {} sink {}", kind, id);
        Ok(id)
    }

    /// Replace the frame handler of a video sink
    pub fn set_frame_handler(
        &mut self,
        id: SinkId,
        handler: impl FnMut(&Frame) + Send + 'static,
    ) -> PeerLinkResult<()> {
        const OP: &str = "Sink.set_frame_handler";
        let sink = self
            .sinks
            .get_mut(id)
            .ok_or_else(|| unknown("sink", id))
            .log_failure(OP)?;
        if sink.kind != TrackKind::Video {
            return Err(PeerLinkError::invalid_param("audio sinks receive no frames")).log_failure(OP);
        }
        sink.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Look up a sink
    pub fn sink(&self, id: SinkId) -> Option<&Sink> {
        self.sinks.get(id)
    }

    /// Delivery statistics of a video sink
    pub fn sink_stats(&self, id: SinkId) -> Option<FrameStats> {
        self.pipeline.stats(id.handle())
    }

    /// Bind a sink to a stream; it renders the stream's active track of its kind.
    ///
    /// Binding to the stream the sink is already bound to is an error.
    pub fn bind_sink(&mut self, id: SinkId, stream: StreamId) -> PeerLinkResult<()> {
        const OP: &str = "Sink.set_stream";
        let current = self
            .sinks
            .get(id)
            .ok_or_else(|| unknown("sink", id))
            .log_failure(OP)?
            .stream;
        if !self.streams.contains(stream) {
            return Err(unknown("stream", stream)).log_failure(OP);
        }
        if current == Some(stream) {
            return Err(PeerLinkError::invalid_param(format!(
                "sink {} is already bound to stream {}",
                id, stream
            )))
            .log_failure(OP);
        }

        self.rebind_sink(id, current, Some(stream), OP)?;
        debug!("Sink {} bound to stream {}", id, stream);
        Ok(())
    }

    /// Detach a sink from its stream; no-op when unbound
    pub fn unbind_sink(&mut self, id: SinkId) -> PeerLinkResult<()> {
        const OP: &str = "Sink.unbind";
        let current = self
            .sinks
            .get(id)
            .ok_or_else(|| unknown("sink", id))
            .log_failure(OP)?
            .stream;
        if current.is_none() {
            return Ok(());
        }
        self.rebind_sink(id, current, None, OP)
    }

    /// Move a sink from one stream to another and re-point the native sink.
    ///
    /// The native sink keeps its old source when re-pointing fails, so the
    /// bookkeeping is put back to match it.
    fn rebind_sink(
        &mut self,
        id: SinkId,
        from: Option<StreamId>,
        to: Option<StreamId>,
        operation: &str,
    ) -> PeerLinkResult<()> {
        self.link_sink(id, from, to);
        if let Err(err) = self.apply_sink_source(id).log_failure(operation) {
            self.link_sink(id, to, from);
            return Err(err);
        }
        Ok(())
    }

    fn link_sink(&mut self, id: SinkId, from: Option<StreamId>, to: Option<StreamId>) {
        if let Some(previous) = from.and_then(|s| self.streams.get_mut(s)) {
            previous.sinks.retain(|s| *s != id);
        }
        if let Some(entry) = to.and_then(|s| self.streams.get_mut(s)) {
            entry.sinks.push(id);
        }
        if let Some(sink) = self.sinks.get_mut(id) {
            sink.stream = to;
        }
    }

    /// Set the volume of an audio sink, clamped to `0.0..=1.0`
    pub fn set_sink_volume(&mut self, id: SinkId, volume: f32) -> PeerLinkResult<()> {
        const OP: &str = "Sink.set_volume";
        if volume.is_nan() {
            return Err(PeerLinkError::invalid_param("volume is NaN")).log_failure(OP);
        }
        let volume = volume.clamp(0.0, 1.0);
        let sink = self
            .sinks
            .get_mut(id)
            .ok_or_else(|| unknown("sink", id))
            .log_failure(OP)?;
        if sink.kind != TrackKind::Audio {
            return Err(PeerLinkError::invalid_param("volume applies to audio sinks")).log_failure(OP);
        }
        self.engine.set_sink_volume(sink.native, volume).log_failure(OP)?;
        sink.volume = volume;
        Ok(())
    }

    /// Destroy a sink, unbinding it first.
    ///
    /// A video sink whose frame acquisition does not finish within the
    /// configured wait is left in place and a retryable `Timeout` returned.
    pub fn destroy_sink(&mut self, id: SinkId) -> PeerLinkResult<()> {
        const OP: &str = "Sink.destroy";
        let (native, kind) = self
            .sinks
            .get(id)
            .map(|s| (s.native, s.kind))
            .ok_or_else(|| unknown("sink", id))
            .log_failure(OP)?;

        self.unbind_sink(id)?;
        if kind == TrackKind::Video {
            let stats = self
                .pipeline
                .unregister(id.handle(), self.config.destroy_wait_timeout)
                .log_failure(OP)?;
            debug!(
                "Sink {} delivered {} frame(s), dropped {}",
                id, stats.frames_delivered, stats.frames_dropped
            );
        }

        let result = self.engine.destroy_sink(native).log_failure(OP);
        self.sinks.remove(id);
        info!("Destroyed sink {}", id);
        result
    }

    /// Point the native sink at its stream's active track, or detach it
    pub(crate) fn apply_sink_source(&mut self, id: SinkId) -> PeerLinkResult<()> {
        let sink = self.sinks.get(id).ok_or_else(|| unknown("sink", id))?;
        let target = sink
            .stream
            .and_then(|stream| self.streams.get(stream))
            .and_then(|stream| stream.active_track(sink.kind))
            .and_then(|track| self.tracks.get(track))
            .map(|track| track.native)
            .unwrap_or(Handle::INVALID);
        let (native, kind) = (sink.native, sink.kind);

        let _pause = if kind == TrackKind::Video {
            Some(
                self.pipeline
                    .pause(id.handle(), self.config.destroy_wait_timeout)?,
            )
        } else {
            None
        };
        self.engine.set_sink_source(native, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use peerlink_core::{LoopbackEngine, ResultCode};
    use std::sync::Arc;

    fn session() -> (Arc<LoopbackEngine>, Session) {
        let engine = Arc::new(LoopbackEngine::new());
        let session = Session::new(engine.clone(), SessionConfig::default()).unwrap();
        (engine, session)
    }

    #[test]
    fn test_rebinding_to_same_stream_is_rejected() {
        let (engine, mut session) = session();
        let stream = session.create_local_stream("s").unwrap();
        let (track, _) = session.create_app_video_track().unwrap();
        session.add_track_to_stream(stream, track).unwrap();
        let sink = session.create_video_sink(|_| {}).unwrap();

        session.bind_sink(sink, stream).unwrap();
        let native_sink = session.sink(sink).unwrap().native_handle();
        let native_track = session.track(track).unwrap().native_handle();
        assert_eq!(engine.sink_source(native_sink), Some(native_track));

        assert_eq!(
            session.bind_sink(sink, stream).unwrap_err().code(),
            ResultCode::InvalidParam
        );
        assert_eq!(session.stream(stream).unwrap().sinks(), &[sink]);
    }

    #[test]
    fn test_failed_rebind_keeps_previous_binding() {
        let (engine, mut session) = session();
        let first = session.create_local_stream("a").unwrap();
        let second = session.create_local_stream("b").unwrap();
        let (track_a, _) = session.create_app_video_track().unwrap();
        let (track_b, _) = session.create_app_video_track().unwrap();
        session.add_track_to_stream(first, track_a).unwrap();
        session.add_track_to_stream(second, track_b).unwrap();
        let sink = session.create_video_sink(|_| {}).unwrap();
        session.bind_sink(sink, first).unwrap();
        let native_sink = session.sink(sink).unwrap().native_handle();
        let native_a = session.track(track_a).unwrap().native_handle();
        let native_b = session.track(track_b).unwrap().native_handle();

        engine.fail_next("set_sink_source");
        assert_eq!(
            session.bind_sink(sink, second).unwrap_err().code(),
            ResultCode::UnspecifiedFailure
        );
        assert_eq!(session.sink(sink).unwrap().stream(), Some(first));
        assert_eq!(session.stream(first).unwrap().sinks(), &[sink]);
        assert!(session.stream(second).unwrap().sinks().is_empty());
        assert_eq!(engine.sink_source(native_sink), Some(native_a));

        session.bind_sink(sink, second).unwrap();
        assert_eq!(session.sink(sink).unwrap().stream(), Some(second));
        assert!(session.stream(first).unwrap().sinks().is_empty());
        assert_eq!(engine.sink_source(native_sink), Some(native_b));

        engine.fail_next("set_sink_source");
        assert!(session.unbind_sink(sink).is_err());
        assert_eq!(session.sink(sink).unwrap().stream(), Some(second));
        assert_eq!(session.stream(second).unwrap().sinks(), &[sink]);
    }

    #[test]
    fn test_unbind_detaches_native_source() {
        let (engine, mut session) = session();
        let stream = session.create_local_stream("s").unwrap();
        let mic = session.create_microphone_track().unwrap();
        session.add_track_to_stream(stream, mic).unwrap();
        let sink = session.create_audio_sink().unwrap();
        session.bind_sink(sink, stream).unwrap();

        session.unbind_sink(sink).unwrap();
        session.unbind_sink(sink).unwrap();
        let native = session.sink(sink).unwrap().native_handle();
        assert_eq!(engine.sink_source(native), None);
        assert!(session.stream(stream).unwrap().sinks().is_empty());
    }

    #[test]
    fn test_volume_is_clamped_and_audio_only() {
        let (engine, mut session) = session();
        let audio = session.create_audio_sink().unwrap();
        let video = session.create_video_sink(|_| {}).unwrap();

        session.set_sink_volume(audio, 1.7).unwrap();
        assert_eq!(session.sink(audio).unwrap().volume(), 1.0);
        session.set_sink_volume(audio, 0.25).unwrap();
        let native = session.sink(audio).unwrap().native_handle();
        assert_eq!(engine.sink_volume(native), Some(0.25));

        assert!(session.set_sink_volume(audio, f32::NAN).is_err());
        assert!(session.set_sink_volume(video, 0.5).is_err());
    }

    #[test]
    fn test_destroy_sink_releases_everything() {
        let (engine, mut session) = session();
        let stream = session.create_local_stream("s").unwrap();
        let sink = session.create_video_sink(|_| {}).unwrap();
        session.bind_sink(sink, stream).unwrap();

        session.destroy_sink(sink).unwrap();
        assert!(session.sink(sink).is_none());
        assert!(session.sink_stats(sink).is_none());
        assert!(session.stream(stream).unwrap().sinks().is_empty());
        assert_eq!(engine.sink_count(), 0);
    }
}
