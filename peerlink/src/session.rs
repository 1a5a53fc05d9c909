//! The session: owner of every entity and of the native event queue
//!
//! All entities live in generation-checked registries owned by
//! [`Session`]. Native callbacks carry a context token that resolves to an
//! entity through the context registry; once an entity is destroyed its
//! token stops resolving and late events for it are dropped.

use crate::config::SessionConfig;
use crate::connection::{ConnectionId, PeerConnection};
use crate::data_channel::{DataChannel, DataChannelId};
use crate::event::{EventHub, EventStream, ObserverId, SessionEvent};
use crate::sink::{Sink, SinkId};
use crate::stream::{MediaStream, StreamId};
use crate::track::{Track, TrackId};
use peerlink_core::{
    define_id, event_channel, EventReceiver, EventSender, LogFailure, NativeEngine, NativeEvent,
    PeerLinkError, PeerLinkResult, Registry, RegistryKey,
};
use peerlink_media::FramePipeline;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Error for an id that does not resolve in this session
pub(crate) fn unknown(object: &str, id: impl fmt::Display) -> PeerLinkError {
    PeerLinkError::invalid_param(format!("unknown {} {}", object, id))
}

define_id!(
    /// Callback context token handed to the native engine
    ContextId
);

/// Entity a callback context resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackTarget {
    /// Registered, native object not created yet
    Pending,
    /// A peer connection
    Connection(ConnectionId),
    /// A data channel
    DataChannel(DataChannelId),
}

/// Work done by one [`Session::update`] cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Native events dispatched
    pub events_dispatched: usize,
    /// Frames acquired from video sinks
    pub frames_acquired: usize,
    /// Frames handed to frame handlers
    pub frames_delivered: usize,
}

/// A media session over one native engine
pub struct Session {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) config: SessionConfig,
    pub(crate) native_tx: EventSender,
    native_rx: EventReceiver,
    pub(crate) contexts: Registry<ContextId, CallbackTarget>,
    pub(crate) connections: Registry<ConnectionId, PeerConnection>,
    pub(crate) streams: Registry<StreamId, MediaStream>,
    pub(crate) tracks: Registry<TrackId, Track>,
    pub(crate) sinks: Registry<SinkId, Sink>,
    pub(crate) channels: Registry<DataChannelId, DataChannel>,
    pub(crate) pipeline: FramePipeline,
    pub(crate) hub: EventHub,
    shut_down: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine.name())
            .field("connections", &self.connections.len())
            .field("streams", &self.streams.len())
            .field("tracks", &self.tracks.len())
            .field("sinks", &self.sinks.len())
            .field("data_channels", &self.channels.len())
            .field("pipeline", &self.pipeline)
            .field("hub", &self.hub)
            .finish()
    }
}

impl Session {
    /// Create a session driving `engine`
    pub fn new(engine: Arc<dyn NativeEngine>, config: SessionConfig) -> PeerLinkResult<Self> {
        config.validate().log_failure("Session.new")?;
        let pipeline = FramePipeline::new(Arc::clone(&engine), config.frame_pool_depth)
            .log_failure("Session.new")?;
        let (native_tx, native_rx) = event_channel();
        info!(
            "Session started on engine '{}' (frame pool depth {})",
            engine.name(),
            config.frame_pool_depth
        );

        Ok(Self {
            engine,
            config,
            native_tx,
            native_rx,
            contexts: Registry::new(),
            connections: Registry::new(),
            streams: Registry::new(),
            tracks: Registry::new(),
            sinks: Registry::new(),
            channels: Registry::new(),
            pipeline,
            hub: EventHub::default(),
            shut_down: false,
        })
    }

    /// The native engine
    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events
    pub fn events(&mut self) -> EventStream {
        self.hub.subscribe()
    }

    /// Register a callback invoked for every session event
    pub fn on_event(&mut self, observer: impl FnMut(&SessionEvent) + Send + 'static) -> ObserverId {
        self.hub.add_observer(Box::new(observer))
    }

    /// Remove an observer; `false` if it was not registered
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        self.hub.remove_observer(id)
    }

    /// Run one update cycle.
    ///
    /// Dispatches queued native events, runs a frame acquisition pass on the
    /// blocking pool, then hands acquired frames to the video sinks' frame
    /// handlers. Observers and handlers run on the calling task.
    pub async fn update(&mut self) -> CycleStats {
        let events_dispatched = self.dispatch_pending();
        let frames_acquired = self.pipeline.acquire().await;
        let frames_delivered = self.deliver_frames();
        self.finish_cycle(events_dispatched, frames_acquired, frames_delivered)
    }

    /// [`Session::update`] with the acquisition pass on the calling thread
    pub fn update_blocking(&mut self) -> CycleStats {
        let events_dispatched = self.dispatch_pending();
        let frames_acquired = self.pipeline.acquire_blocking();
        let frames_delivered = self.deliver_frames();
        self.finish_cycle(events_dispatched, frames_acquired, frames_delivered)
    }

    fn finish_cycle(&self, events_dispatched: usize, frames_acquired: usize, frames_delivered: usize) -> CycleStats {
        let stats = CycleStats {
            events_dispatched,
            frames_acquired,
            frames_delivered,
        };
        trace!("Update cycle: {:?}", stats);
        stats
    }

    fn dispatch_pending(&mut self) -> usize {
        let limit = self.config.max_events_per_cycle.unwrap_or(usize::MAX);
        let mut dispatched = 0;
        while dispatched < limit {
            match self.native_rx.try_recv() {
                Ok(event) => {
                    self.dispatch(event);
                    dispatched += 1;
                }
                Err(_) => break,
            }
        }
        dispatched
    }

    fn dispatch(&mut self, event: NativeEvent) {
        let context = ContextId::from_handle(event.context);
        match self.contexts.get(context).copied() {
            Some(CallbackTarget::Connection(id)) => self.handle_connection_event(id, event.kind),
            Some(CallbackTarget::DataChannel(id)) => self.handle_channel_event(id, event.kind),
            Some(CallbackTarget::Pending) => {
                warn!("Dropping {} for context {} still being set up", event.kind.name(), context);
            }
            None => {
                debug!("Dropping {} for released context {}", event.kind.name(), context);
            }
        }
    }

    fn deliver_frames(&mut self) -> usize {
        let sinks = &mut self.sinks;
        self.pipeline.deliver(|key, frame| {
            if let Some(handler) = sinks
                .get_mut(SinkId::from_handle(key))
                .and_then(|sink| sink.handler.as_mut())
            {
                handler(frame);
            }
        })
    }

    /// The device is going to standby: every local track snapshots its
    /// enabled state and is disabled; cameras release their device.
    ///
    /// Every track is visited; the first failure is returned.
    pub fn handle_device_standby(&mut self) -> PeerLinkResult<()> {
        const OP: &str = "Session.handle_device_standby";
        let mut first_error = None;
        for id in self.local_tracks() {
            let quiesce = match self.quiesce_track(id, OP).log_failure(OP) {
                Ok(quiesce) => quiesce,
                Err(err) => {
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            let Some(track) = self.tracks.get_mut(id) else {
                continue;
            };
            let native = track.native;
            if let Some(lifecycle) = track.lifecycle.as_mut() {
                if let Err(err) = lifecycle
                    .handle_device_standby(self.engine.as_ref(), native)
                    .log_failure(OP)
                {
                    first_error.get_or_insert(err);
                }
            }
            drop(quiesce);
        }
        info!("Device standby handled");
        self.hub.publish(SessionEvent::DeviceStandby);
        first_error.map_or(Ok(()), Err)
    }

    /// The device is active again: local tracks restore their snapshot and
    /// cameras reattach.
    pub fn handle_device_active(&mut self) -> PeerLinkResult<()> {
        const OP: &str = "Session.handle_device_active";
        let mut first_error = None;
        for id in self.local_tracks() {
            let Some(track) = self.tracks.get_mut(id) else {
                continue;
            };
            let native = track.native;
            if let Some(lifecycle) = track.lifecycle.as_mut() {
                if let Err(err) = lifecycle
                    .handle_device_active(self.engine.as_ref(), native)
                    .log_failure(OP)
                {
                    first_error.get_or_insert(err);
                }
            }
        }
        info!("Device active handled");
        self.hub.publish(SessionEvent::DeviceActive);
        first_error.map_or(Ok(()), Err)
    }

    /// Destroy every entity: sinks, connections, streams, then tracks.
    ///
    /// Every entity is attempted; the first failure is returned. Calling it
    /// again retries whatever is left.
    pub fn shutdown(&mut self) -> PeerLinkResult<()> {
        let mut first_error = None;
        let mut note = |result: PeerLinkResult<()>| {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        };

        for sink in self.sinks.keys() {
            note(self.destroy_sink(sink));
        }
        for connection in self.connections.keys() {
            note(self.destroy_connection(connection));
        }
        for stream in self.local_streams() {
            if self.streams.contains(stream) {
                note(self.destroy_stream(stream));
            }
        }
        for track in self.local_tracks() {
            note(self.destroy_track(track));
        }

        self.shut_down = first_error.is_none();
        match first_error {
            Some(err) => {
                warn!("Session shutdown incomplete: {}", err);
                Err(err)
            }
            None => {
                info!("Session shut down");
                Ok(())
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{ConnectionConfig, LoopbackEngine, ResultCode};

    fn session_with(config: SessionConfig) -> (Arc<LoopbackEngine>, Session) {
        let engine = Arc::new(LoopbackEngine::new());
        let session = Session::new(engine.clone(), config).unwrap();
        (engine, session)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let engine = Arc::new(LoopbackEngine::new());
        let config = SessionConfig {
            frame_pool_depth: 0,
            ..SessionConfig::default()
        };
        assert_eq!(
            Session::new(engine, config).unwrap_err().code(),
            ResultCode::InvalidParam
        );
    }

    #[tokio::test]
    async fn test_events_for_destroyed_connection_are_dropped() {
        let (_engine, mut session) = session_with(SessionConfig::default());
        let mut events = session.events();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        session.create_offer(conn).unwrap();
        session.destroy_connection(conn).unwrap();

        let stats = session.update().await;
        assert!(stats.events_dispatched > 0);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_event_budget_per_cycle() {
        let config = SessionConfig {
            max_events_per_cycle: Some(1),
            ..SessionConfig::default()
        };
        let (_engine, mut session) = session_with(config);
        let mut events = session.events();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        session.create_offer(conn).unwrap();

        assert_eq!(session.update().await.events_dispatched, 1);
        assert_eq!(events.drain().len(), 1);
        assert_eq!(session.update().await.events_dispatched, 1);
    }

    #[test]
    fn test_shutdown_releases_native_objects() {
        let (engine, mut session) = session_with(SessionConfig::default());
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        let stream = session.create_local_stream("s").unwrap();
        let mic = session.create_microphone_track().unwrap();
        session.add_track_to_stream(stream, mic).unwrap();
        session.add_local_track(conn, mic).unwrap();
        let sink = session.create_video_sink(|_| {}).unwrap();
        session.bind_sink(sink, stream).unwrap();
        session.create_data_channel(conn, "chat").unwrap();

        session.shutdown().unwrap();
        assert_eq!(engine.connection_count(), 0);
        assert_eq!(engine.track_count(), 0);
        assert_eq!(engine.sink_count(), 0);
        assert_eq!(engine.data_channel_count(), 0);
        assert_eq!(session.contexts.len(), 0);
    }

    #[test]
    fn test_drop_shuts_down() {
        let engine = Arc::new(LoopbackEngine::new());
        {
            let mut session = Session::new(engine.clone(), SessionConfig::default()).unwrap();
            session.create_connection(ConnectionConfig::default()).unwrap();
            session.create_camera_track().unwrap();
        }
        assert_eq!(engine.connection_count(), 0);
        assert_eq!(engine.track_count(), 0);
    }
}
