//! Application-defined video source
//!
//! [`AppVideoSource`] is a cheap, cloneable producer handle for a track
//! whose frames are supplied by the application rather than a capture
//! device. Pushing is allowed from any thread; each push holds the track's
//! [`InFlightGate`] for the duration of the native call, so the owning
//! session cannot disable or destroy the track underneath it.

use peerlink_core::{
    Frame, Handle, InFlightGate, LogFailure, NativeEngine, PeerLinkError, PeerLinkResult,
};
use std::sync::Arc;
use tracing::trace;

/// Producer handle for an application-defined video track
#[derive(Clone)]
pub struct AppVideoSource {
    engine: Arc<dyn NativeEngine>,
    track: Handle,
    gate: Arc<InFlightGate>,
}

impl std::fmt::Debug for AppVideoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppVideoSource")
            .field("track", &self.track)
            .field("closed", &self.gate.is_closed())
            .finish()
    }
}

impl AppVideoSource {
    /// Wrap native track `track`, guarded by `gate`
    pub fn new(engine: Arc<dyn NativeEngine>, track: Handle, gate: Arc<InFlightGate>) -> Self {
        Self {
            engine,
            track,
            gate,
        }
    }

    /// Native track handle
    pub fn track(&self) -> Handle {
        self.track
    }

    /// Whether the track has been shut down for destruction
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Validate `frame` and hand it to the native source
    pub fn push_frame(&self, frame: &Frame) -> PeerLinkResult<()> {
        frame.validate().log_failure("AppVideoSource.push_frame")?;
        let _guard = self
            .gate
            .enter()
            .ok_or(PeerLinkError::InvalidHandle {
                object: "video source",
                handle: self.track,
            })
            .log_failure("AppVideoSource.push_frame")?;

        trace!(
            "pushing frame {} ({}x{} {}) into source {}",
            frame.id,
            frame.width(),
            frame.height(),
            frame.format,
            self.track
        );
        self.engine
            .push_frame(self.track, frame)
            .log_failure("AppVideoSource.push_frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use peerlink_core::{FrameFormat, ImagePlane, LoopbackEngine, ResultCode, TrackSource};
    use std::time::Duration;

    fn source() -> (Arc<LoopbackEngine>, AppVideoSource) {
        let engine = Arc::new(LoopbackEngine::new());
        let track = engine
            .create_local_track(TrackSource::AppDefinedVideo)
            .unwrap();
        let source = AppVideoSource::new(engine.clone(), track, Arc::new(InFlightGate::new()));
        (engine, source)
    }

    #[test]
    fn test_push_validates_frames() {
        let (_engine, source) = source();
        let wrong = Frame {
            id: 1,
            timestamp_us: 0,
            format: FrameFormat::Yuv420_888,
            planes: vec![ImagePlane::new(2, 2, 8, 4, Bytes::from(vec![0u8; 16]))],
        };
        assert_eq!(
            source.push_frame(&wrong).unwrap_err().code(),
            ResultCode::InvalidFramePlaneCount
        );

        let good = Frame::rgba(2, 0, 2, 2, Bytes::from(vec![0u8; 16])).unwrap();
        assert!(source.push_frame(&good).is_ok());
    }

    #[test]
    fn test_push_after_close_fails() {
        let (_engine, source) = source();
        source
            .gate
            .close_and_drain("destroy", Duration::from_millis(10))
            .unwrap();
        assert!(source.is_closed());
        let frame = Frame::rgba(1, 0, 1, 1, Bytes::from(vec![0u8; 4])).unwrap();
        assert_eq!(
            source.push_frame(&frame).unwrap_err().code(),
            ResultCode::InvalidHandle
        );
    }

    #[test]
    fn test_push_from_another_thread() {
        let (engine, source) = source();
        let producer = source.clone();
        std::thread::spawn(move || {
            let frame = Frame::rgba(3, 0, 1, 1, Bytes::from(vec![0u8; 4])).unwrap();
            producer.push_frame(&frame).unwrap();
        })
        .join()
        .unwrap();

        let sink = engine.create_sink(peerlink_core::TrackKind::Video).unwrap();
        engine.set_sink_source(sink, source.track()).unwrap();
        assert!(engine.is_new_frame_available(sink).unwrap());
    }
}
