//! In-process native engine
//!
//! [`LoopbackEngine`] implements [`NativeEngine`] without any network: two
//! connections created on the same engine negotiate by exchanging the
//! descriptions it renders (see [`sdp`]), after which tracks, frames and
//! data channel messages flow between them in memory. It also exposes
//! controls to inject remote activity and failures, which is what the test
//! suites of the workspace run against.

pub mod sdp;

use crate::error::{PeerLinkError, PeerLinkResult};
use crate::frame::Frame;
use crate::handle::{Handle, HandleAllocator};
use crate::ice::{ConnectionConfig, IceCandidate};
use crate::native::{
    DataChannelMessage, EventSender, NativeEngine, NativeEvent, NativeEventKind, Privilege,
    TrackKind, TrackSource,
};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use sdp::{AnnouncedTrack, LoopbackSdp, SdpType};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Callbacks {
    events: EventSender,
    context: Handle,
}

impl Callbacks {
    fn emit(&self, kind: NativeEventKind) {
        trace!("loopback event {} -> context {}", kind.name(), self.context);
        if self
            .events
            .send(NativeEvent {
                context: self.context,
                kind,
            })
            .is_err()
        {
            debug!("event receiver for context {} is gone", self.context);
        }
    }
}

#[derive(Debug)]
struct ConnectionState {
    callbacks: Callbacks,
    session_id: Uuid,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    connected: bool,
    failed: bool,
    peer: Option<Handle>,
    local_tracks: Vec<(Handle, Vec<String>)>,
    /// announcing-side track -> mirror track handed out to this side
    remote_tracks: HashMap<Handle, Handle>,
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Handle>,
}

#[derive(Debug)]
struct TrackState {
    kind: TrackKind,
    source: TrackSource,
    enabled: bool,
    camera_connected: bool,
    origin: Option<Handle>,
    latest: Option<(u64, Frame)>,
}

#[derive(Debug)]
struct SinkState {
    kind: TrackKind,
    source: Handle,
    volume: f32,
    last_seq: u64,
}

#[derive(Debug)]
struct ChannelState {
    connection: Handle,
    label: String,
    open: bool,
    peer: Option<Handle>,
    callbacks: Option<Callbacks>,
    backlog: Vec<NativeEventKind>,
}

impl ChannelState {
    fn deliver(&mut self, kind: NativeEventKind) {
        match &self.callbacks {
            Some(callbacks) => callbacks.emit(kind),
            None => self.backlog.push(kind),
        }
    }
}

#[derive(Debug, Default)]
struct HeldState {
    entered: bool,
    released: bool,
}

/// A native call parked inside the engine by [`LoopbackEngine::hold_next`]
#[derive(Debug, Default)]
pub struct HeldCall {
    state: Mutex<HeldState>,
    changed: Condvar,
}

impl HeldCall {
    /// Wait until a caller is parked, giving up after `timeout`
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.entered {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.entered;
            }
        }
        true
    }

    /// Let the parked caller continue
    pub fn release(&self) {
        self.state.lock().released = true;
        self.changed.notify_all();
    }

    fn park(&self) {
        let mut state = self.state.lock();
        state.entered = true;
        self.changed.notify_all();
        while !state.released {
            self.changed.wait(&mut state);
        }
    }
}

/// In-memory [`NativeEngine`]
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    handles: HandleAllocator,
    frame_seq: AtomicU64,
    denied: Mutex<HashSet<Privilege>>,
    forced_failures: Mutex<HashSet<String>>,
    pinned_failures: Mutex<HashSet<(String, Handle)>>,
    held: Mutex<HashMap<String, Arc<HeldCall>>>,
    connections: DashMap<Handle, ConnectionState>,
    tracks: DashMap<Handle, TrackState>,
    sinks: DashMap<Handle, SinkState>,
    frames: DashMap<Handle, Handle>,
    channels: DashMap<Handle, ChannelState>,
}

fn invalid(object: &'static str, handle: Handle) -> PeerLinkError {
    PeerLinkError::InvalidHandle { object, handle }
}

impl LoopbackEngine {
    /// Create an engine with every privilege granted
    pub fn new() -> Self {
        Self::default()
    }

    // ---------------------------------------------------------------------
    // Controls
    // ---------------------------------------------------------------------

    /// Deny a privilege; creating sources that need it fails with `PrivilegeDenied`
    pub fn deny_privilege(&self, privilege: Privilege) {
        self.denied.lock().insert(privilege);
    }

    /// Grant a previously denied privilege
    pub fn grant_privilege(&self, privilege: Privilege) {
        self.denied.lock().remove(&privilege);
    }

    /// Make the next call of `operation` (a [`NativeEngine`] method name) fail
    pub fn fail_next(&self, operation: &str) {
        self.forced_failures.lock().insert(operation.to_string());
    }

    /// Make every call of `operation` against `handle` fail until
    /// [`LoopbackEngine::restore`] is called.
    ///
    /// Honoured by the frame path: `push_frame`, `set_sink_source` and
    /// `acquire_frame`.
    pub fn fail_on(&self, operation: &str, handle: Handle) {
        self.pinned_failures
            .lock()
            .insert((operation.to_string(), handle));
    }

    /// Undo [`LoopbackEngine::fail_on`]
    pub fn restore(&self, operation: &str, handle: Handle) {
        self.pinned_failures
            .lock()
            .remove(&(operation.to_string(), handle));
    }

    /// Park the next call of `operation` inside the engine until the
    /// returned [`HeldCall`] is released. Honoured by `push_frame` and
    /// `acquire_frame`.
    pub fn hold_next(&self, operation: &str) -> Arc<HeldCall> {
        let held = Arc::new(HeldCall::default());
        self.held
            .lock()
            .insert(operation.to_string(), Arc::clone(&held));
        held
    }

    fn forced_failure(&self, operation: &str) -> PeerLinkResult<()> {
        if self.forced_failures.lock().remove(operation) {
            debug!("loopback: forced failure of {}", operation);
            return Err(PeerLinkError::native(operation, "forced failure"));
        }
        Ok(())
    }

    fn forced_failure_on(&self, operation: &str, handle: Handle) -> PeerLinkResult<()> {
        self.forced_failure(operation)?;
        if self
            .pinned_failures
            .lock()
            .contains(&(operation.to_string(), handle))
        {
            debug!("loopback: pinned failure of {} on {}", operation, handle);
            return Err(PeerLinkError::native(operation, "forced failure"));
        }
        Ok(())
    }

    fn park_if_held(&self, operation: &str) {
        let held = self.held.lock().remove(operation);
        if let Some(held) = held {
            debug!("loopback: holding {}", operation);
            held.park();
        }
    }

    /// Announce a remote track on `connection` without a peer behind it
    pub fn inject_remote_track(
        &self,
        connection: Handle,
        kind: TrackKind,
        stream_ids: &[&str],
    ) -> PeerLinkResult<Handle> {
        let track = self.handles.allocate();
        self.tracks.insert(
            track,
            TrackState {
                kind,
                source: TrackSource::Remote,
                enabled: true,
                camera_connected: false,
                origin: None,
                latest: None,
            },
        );
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.remote_tracks.insert(track, track);
        conn.callbacks.emit(NativeEventKind::TrackAdded {
            track,
            kind,
            stream_ids: stream_ids.iter().map(|id| id.to_string()).collect(),
        });
        Ok(track)
    }

    /// Report removal of a remote track on `connection`
    pub fn inject_track_removed(&self, connection: Handle, track: Handle) -> PeerLinkResult<()> {
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        let before = conn.remote_tracks.len();
        conn.remote_tracks.retain(|_, mirror| *mirror != track);
        if conn.remote_tracks.len() == before {
            return Err(invalid("remote track", track));
        }
        conn.callbacks.emit(NativeEventKind::TrackRemoved { track });
        Ok(())
    }

    /// Drop the connection as if the network went away
    pub fn inject_disconnect(&self, connection: Handle) -> PeerLinkResult<()> {
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.connected = false;
        conn.callbacks.emit(NativeEventKind::Disconnected);
        Ok(())
    }

    /// Mark the connection failed and report `message`
    pub fn inject_failure(&self, connection: Handle, message: &str) -> PeerLinkResult<()> {
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.connected = false;
        conn.failed = true;
        conn.callbacks.emit(NativeEventKind::Error {
            message: message.to_string(),
        });
        Ok(())
    }

    /// Publish a frame on any video track, local or remote
    pub fn inject_frame(&self, track: Handle, frame: Frame) -> PeerLinkResult<()> {
        frame.validate()?;
        let mut state = self
            .tracks
            .get_mut(&track)
            .ok_or_else(|| invalid("track", track))?;
        if state.kind != TrackKind::Video {
            return Err(PeerLinkError::invalid_param("frames need a video track"));
        }
        let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
        state.latest = Some((seq, frame));
        Ok(())
    }

    /// Open a data channel from the remote side of `connection`
    pub fn inject_remote_data_channel(&self, connection: Handle, label: &str) -> PeerLinkResult<Handle> {
        let channel = self.handles.allocate();
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        self.channels.insert(
            channel,
            ChannelState {
                connection,
                label: label.to_string(),
                open: true,
                peer: None,
                callbacks: None,
                backlog: vec![NativeEventKind::DataChannelOpened],
            },
        );
        conn.channels.push(channel);
        conn.callbacks
            .emit(NativeEventKind::DataChannelReceived { channel });
        Ok(channel)
    }

    /// Deliver a message to `channel` as if the remote peer sent it
    pub fn inject_message(&self, channel: Handle, message: DataChannelMessage) -> PeerLinkResult<()> {
        let mut state = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| invalid("data channel", channel))?;
        state.deliver(NativeEventKind::DataChannelMessage { message });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live tracks, local and remote
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Live sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Live data channels
    pub fn data_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames acquired and not yet released
    pub fn outstanding_frames(&self) -> usize {
        self.frames.len()
    }

    /// Tracks attached to `connection`
    pub fn attached_tracks(&self, connection: Handle) -> Vec<Handle> {
        self.connections
            .get(&connection)
            .map(|conn| conn.local_tracks.iter().map(|(track, _)| *track).collect())
            .unwrap_or_default()
    }

    /// Track a sink currently renders
    pub fn sink_source(&self, sink: Handle) -> Option<Handle> {
        self.sinks
            .get(&sink)
            .map(|state| state.source)
            .filter(|source| source.is_valid())
    }

    /// Audio sink volume
    pub fn sink_volume(&self, sink: Handle) -> Option<f32> {
        self.sinks.get(&sink).map(|state| state.volume)
    }

    /// Whether a camera track is attached to its capture device
    pub fn camera_connected(&self, track: Handle) -> Option<bool> {
        self.tracks.get(&track).map(|state| state.camera_connected)
    }

    /// Remote candidates applied to `connection`
    pub fn remote_candidates(&self, connection: Handle) -> Vec<IceCandidate> {
        self.connections
            .get(&connection)
            .map(|conn| conn.remote_candidates.clone())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Negotiation internals
    // ---------------------------------------------------------------------

    fn describe(&self, connection: Handle, sdp_type: SdpType) -> PeerLinkResult<String> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        let tracks = conn
            .local_tracks
            .iter()
            .filter_map(|(track, stream_ids)| {
                self.tracks.get(track).map(|state| AnnouncedTrack {
                    track: *track,
                    kind: state.kind,
                    stream_ids: stream_ids.clone(),
                })
            })
            .collect();
        Ok(LoopbackSdp {
            sdp_type,
            peer: connection,
            tracks,
        }
        .render(conn.session_id))
    }

    fn host_candidate(&self) -> IceCandidate {
        let port: u16 = rand::thread_rng().gen_range(49152..65535);
        IceCandidate::new(
            format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", port),
            "0",
            0,
        )
    }

    fn publish_local_description(&self, connection: Handle, sdp: String, sdp_type: SdpType) -> PeerLinkResult<()> {
        let candidate = self.host_candidate();
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.local_sdp = Some(sdp.clone());
        let created = match sdp_type {
            SdpType::Offer => NativeEventKind::LocalOfferCreated { sdp },
            SdpType::Answer => NativeEventKind::LocalAnswerCreated { sdp },
        };
        conn.callbacks.emit(created);
        conn.callbacks
            .emit(NativeEventKind::IceCandidateFound { candidate });
        conn.callbacks.emit(NativeEventKind::IceGatheringCompleted);
        Ok(())
    }

    fn apply_remote_description(&self, connection: Handle, sdp: &str, expected: SdpType) -> PeerLinkResult<()> {
        let parsed = LoopbackSdp::parse(sdp)?;
        if parsed.sdp_type != expected {
            return Err(PeerLinkError::invalid_param(format!(
                "expected an {:?} description, got {:?}",
                expected, parsed.sdp_type
            )));
        }
        if parsed.peer == connection {
            return Err(PeerLinkError::invalid_param(
                "a connection cannot negotiate with itself",
            ));
        }

        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.remote_sdp = Some(sdp.to_string());
        conn.peer = Some(parsed.peer);

        let announced: HashSet<Handle> = parsed.tracks.iter().map(|t| t.track).collect();
        let removed: Vec<(Handle, Handle)> = conn
            .remote_tracks
            .iter()
            .filter(|(origin, _)| !announced.contains(origin))
            .map(|(origin, mirror)| (*origin, *mirror))
            .collect();
        for (origin, mirror) in removed {
            conn.remote_tracks.remove(&origin);
            conn.callbacks
                .emit(NativeEventKind::TrackRemoved { track: mirror });
        }

        for announced in parsed.tracks {
            if conn.remote_tracks.contains_key(&announced.track) {
                continue;
            }
            let mirror = self.handles.allocate();
            self.tracks.insert(
                mirror,
                TrackState {
                    kind: announced.kind,
                    source: TrackSource::Remote,
                    enabled: true,
                    camera_connected: false,
                    origin: Some(announced.track),
                    latest: None,
                },
            );
            conn.remote_tracks.insert(announced.track, mirror);
            conn.callbacks.emit(NativeEventKind::TrackAdded {
                track: mirror,
                kind: announced.kind,
                stream_ids: announced.stream_ids,
            });
        }
        Ok(())
    }

    fn update_connected(&self, connection: Handle) {
        let peer = {
            let Some(mut conn) = self.connections.get_mut(&connection) else {
                return;
            };
            if conn.connected || conn.failed || conn.local_sdp.is_none() || conn.remote_sdp.is_none() {
                return;
            }
            conn.connected = true;
            conn.callbacks.emit(NativeEventKind::Connected);
            info!("loopback connection {} connected", connection);
            let peer = conn.peer;
            peer
        };

        let peer_connected = peer
            .and_then(|peer| self.connections.get(&peer).map(|p| p.connected))
            .unwrap_or(false);
        if let (Some(peer), true) = (peer, peer_connected) {
            self.pair_pending_channels(connection, peer);
            self.pair_pending_channels(peer, connection);
        }
    }

    fn peer_link(&self, connection: Handle) -> Option<Handle> {
        let conn = self.connections.get(&connection)?;
        let peer = conn.peer?;
        if !conn.connected {
            return None;
        }
        drop(conn);
        self.connections
            .get(&peer)
            .filter(|p| p.connected && p.peer == Some(connection))
            .map(|_| peer)
    }

    fn pair_pending_channels(&self, connection: Handle, peer: Handle) {
        let pending: Vec<Handle> = self
            .connections
            .get(&connection)
            .map(|conn| conn.channels.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|channel| {
                self.channels
                    .get(channel)
                    .map(|c| c.peer.is_none() && !c.open)
                    .unwrap_or(false)
            })
            .collect();
        for channel in pending {
            self.pair_channel(channel, peer);
        }
    }

    fn pair_channel(&self, channel: Handle, peer_connection: Handle) {
        let label = match self.channels.get_mut(&channel) {
            Some(mut local) => {
                local.open = true;
                local.deliver(NativeEventKind::DataChannelOpened);
                local.label.clone()
            }
            None => return,
        };

        let mirror = self.handles.allocate();
        self.channels.insert(
            mirror,
            ChannelState {
                connection: peer_connection,
                label,
                open: true,
                peer: Some(channel),
                callbacks: None,
                backlog: vec![NativeEventKind::DataChannelOpened],
            },
        );
        if let Some(mut local) = self.channels.get_mut(&channel) {
            local.peer = Some(mirror);
        }
        if let Some(mut peer) = self.connections.get_mut(&peer_connection) {
            peer.channels.push(mirror);
            peer.callbacks
                .emit(NativeEventKind::DataChannelReceived { channel: mirror });
        }
    }

    fn close_channel(&self, channel: Handle) {
        let Some((_, state)) = self.channels.remove(&channel) else {
            return;
        };
        if let Some(peer) = state.peer {
            if let Some(mut peer) = self.channels.get_mut(&peer) {
                peer.open = false;
                peer.peer = None;
                peer.deliver(NativeEventKind::DataChannelClosed);
            }
        }
    }

    fn local_track(&self, track: Handle) -> PeerLinkResult<TrackSource> {
        let state = self.tracks.get(&track).ok_or_else(|| invalid("track", track))?;
        if state.source == TrackSource::Remote {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is remote",
                track
            )));
        }
        Ok(state.source)
    }

    fn frame_source(&self, sink: Handle) -> PeerLinkResult<Option<(u64, Handle)>> {
        let state = self.sinks.get(&sink).ok_or_else(|| invalid("sink", sink))?;
        if state.kind != TrackKind::Video {
            return Err(PeerLinkError::invalid_param("audio sinks carry no frames"));
        }
        let (bound, last_seq) = (state.source, state.last_seq);
        drop(state);
        if !bound.is_valid() {
            return Ok(None);
        }

        let Some(track) = self.tracks.get(&bound) else {
            return Ok(None);
        };
        if !track.enabled {
            return Ok(None);
        }
        let producer = track.origin.unwrap_or(bound);
        drop(track);

        let seq = self
            .tracks
            .get(&producer)
            .and_then(|p| p.latest.as_ref().map(|(seq, _)| *seq));
        Ok(seq.filter(|seq| *seq > last_seq).map(|seq| (seq, producer)))
    }
}

impl NativeEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn check_privilege(&self, privilege: Privilege) -> PeerLinkResult<()> {
        if self.denied.lock().contains(&privilege) {
            return Err(PeerLinkError::PrivilegeDenied {
                privilege: privilege.to_string(),
            });
        }
        Ok(())
    }

    fn create_connection(
        &self,
        config: &ConnectionConfig,
        events: EventSender,
        context: Handle,
    ) -> PeerLinkResult<Handle> {
        self.forced_failure("create_connection")?;
        self.check_privilege(Privilege::Internet)?;
        config.validate()?;

        let connection = self.handles.allocate();
        self.connections.insert(
            connection,
            ConnectionState {
                callbacks: Callbacks { events, context },
                session_id: Uuid::new_v4(),
                local_sdp: None,
                remote_sdp: None,
                connected: false,
                failed: false,
                peer: None,
                local_tracks: Vec::new(),
                remote_tracks: HashMap::new(),
                remote_candidates: Vec::new(),
                channels: Vec::new(),
            },
        );
        debug!(
            "loopback connection {} created with {} ICE server(s)",
            connection,
            config.ice_servers.len()
        );
        Ok(connection)
    }

    fn destroy_connection(&self, connection: Handle) -> PeerLinkResult<()> {
        self.forced_failure("destroy_connection")?;
        let (_, state) = self
            .connections
            .remove(&connection)
            .ok_or_else(|| invalid("connection", connection))?;

        for channel in &state.channels {
            self.close_channel(*channel);
        }
        if let Some(peer) = state.peer {
            if let Some(mut peer_state) = self.connections.get_mut(&peer) {
                if peer_state.connected && peer_state.peer == Some(connection) {
                    peer_state.connected = false;
                    peer_state.callbacks.emit(NativeEventKind::Disconnected);
                }
            }
        }
        debug!("loopback connection {} destroyed", connection);
        Ok(())
    }

    fn create_offer(&self, connection: Handle) -> PeerLinkResult<()> {
        self.forced_failure("create_offer")?;
        let sdp = self.describe(connection, SdpType::Offer)?;
        self.publish_local_description(connection, sdp, SdpType::Offer)?;
        self.update_connected(connection);
        Ok(())
    }

    fn set_remote_offer(&self, connection: Handle, sdp: &str) -> PeerLinkResult<()> {
        self.forced_failure("set_remote_offer")?;
        self.apply_remote_description(connection, sdp, SdpType::Offer)?;
        let answer = self.describe(connection, SdpType::Answer)?;
        self.publish_local_description(connection, answer, SdpType::Answer)?;
        self.update_connected(connection);
        Ok(())
    }

    fn set_remote_answer(&self, connection: Handle, sdp: &str) -> PeerLinkResult<()> {
        self.forced_failure("set_remote_answer")?;
        let has_offer = self
            .connections
            .get(&connection)
            .ok_or_else(|| invalid("connection", connection))?
            .local_sdp
            .is_some();
        if !has_offer {
            return Err(PeerLinkError::invalid_param(
                "remote answer applied before a local offer was created",
            ));
        }
        self.apply_remote_description(connection, sdp, SdpType::Answer)?;
        self.update_connected(connection);
        Ok(())
    }

    fn add_remote_ice_candidate(&self, connection: Handle, candidate: &IceCandidate) -> PeerLinkResult<()> {
        self.forced_failure("add_remote_ice_candidate")?;
        if candidate.candidate.is_empty() {
            return Err(PeerLinkError::invalid_param("empty ICE candidate"));
        }
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        conn.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn is_connected(&self, connection: Handle) -> PeerLinkResult<bool> {
        self.connections
            .get(&connection)
            .map(|conn| conn.connected)
            .ok_or_else(|| invalid("connection", connection))
    }

    fn has_failed(&self, connection: Handle) -> PeerLinkResult<bool> {
        self.connections
            .get(&connection)
            .map(|conn| conn.failed)
            .ok_or_else(|| invalid("connection", connection))
    }

    fn add_local_track(&self, connection: Handle, track: Handle, stream_ids: &[String]) -> PeerLinkResult<()> {
        self.forced_failure("add_local_track")?;
        self.local_track(track)?;
        if let Some(bad) = stream_ids
            .iter()
            .find(|id| id.is_empty() || id.contains(|c: char| c == ',' || c.is_whitespace()))
        {
            return Err(PeerLinkError::invalid_param(format!(
                "stream id '{}' cannot be carried in a loopback description",
                bad
            )));
        }
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        if conn.local_tracks.iter().any(|(t, _)| *t == track) {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} already attached to connection {}",
                track, connection
            )));
        }
        conn.local_tracks.push((track, stream_ids.to_vec()));
        Ok(())
    }

    fn remove_local_track(&self, connection: Handle, track: Handle) -> PeerLinkResult<()> {
        self.forced_failure("remove_local_track")?;
        let mut conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(|| invalid("connection", connection))?;
        let before = conn.local_tracks.len();
        conn.local_tracks.retain(|(t, _)| *t != track);
        if conn.local_tracks.len() == before {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is not attached to connection {}",
                track, connection
            )));
        }
        Ok(())
    }

    fn create_local_track(&self, source: TrackSource) -> PeerLinkResult<Handle> {
        self.forced_failure("create_local_track")?;
        let kind = source.kind().ok_or_else(|| {
            PeerLinkError::invalid_param("remote tracks cannot be created locally")
        })?;
        if let Some(privilege) = source.required_privilege() {
            self.check_privilege(privilege)?;
        }

        let track = self.handles.allocate();
        self.tracks.insert(
            track,
            TrackState {
                kind,
                source,
                enabled: true,
                camera_connected: source == TrackSource::DeviceCamera,
                origin: None,
                latest: None,
            },
        );
        Ok(track)
    }

    fn destroy_track(&self, track: Handle) -> PeerLinkResult<()> {
        self.forced_failure("destroy_track")?;
        self.local_track(track)?;
        self.tracks.remove(&track);
        for mut conn in self.connections.iter_mut() {
            conn.local_tracks.retain(|(t, _)| *t != track);
        }
        Ok(())
    }

    fn release_remote_track(&self, track: Handle) -> PeerLinkResult<()> {
        let source = self
            .tracks
            .get(&track)
            .map(|state| state.source)
            .ok_or_else(|| invalid("track", track))?;
        if source != TrackSource::Remote {
            return Err(PeerLinkError::invalid_param(format!("track {} is local", track)));
        }
        self.tracks.remove(&track);
        for mut conn in self.connections.iter_mut() {
            conn.remote_tracks.retain(|_, mirror| *mirror != track);
        }
        Ok(())
    }

    fn set_track_enabled(&self, track: Handle, enabled: bool) -> PeerLinkResult<()> {
        self.forced_failure("set_track_enabled")?;
        let mut state = self.tracks.get_mut(&track).ok_or_else(|| invalid("track", track))?;
        state.enabled = enabled;
        Ok(())
    }

    fn track_enabled(&self, track: Handle) -> PeerLinkResult<bool> {
        self.tracks
            .get(&track)
            .map(|state| state.enabled)
            .ok_or_else(|| invalid("track", track))
    }

    fn connect_camera(&self, track: Handle) -> PeerLinkResult<()> {
        self.forced_failure("connect_camera")?;
        self.check_privilege(Privilege::Camera)?;
        let mut state = self.tracks.get_mut(&track).ok_or_else(|| invalid("track", track))?;
        if state.source != TrackSource::DeviceCamera {
            return Err(PeerLinkError::invalid_param("not a camera track"));
        }
        state.camera_connected = true;
        Ok(())
    }

    fn disconnect_camera(&self, track: Handle) -> PeerLinkResult<()> {
        self.forced_failure("disconnect_camera")?;
        let mut state = self.tracks.get_mut(&track).ok_or_else(|| invalid("track", track))?;
        if state.source != TrackSource::DeviceCamera {
            return Err(PeerLinkError::invalid_param("not a camera track"));
        }
        state.camera_connected = false;
        Ok(())
    }

    fn push_frame(&self, source: Handle, frame: &Frame) -> PeerLinkResult<()> {
        self.park_if_held("push_frame");
        self.forced_failure_on("push_frame", source)?;
        frame.validate()?;
        let mut state = self
            .tracks
            .get_mut(&source)
            .ok_or_else(|| invalid("video source", source))?;
        if state.source != TrackSource::AppDefinedVideo {
            return Err(PeerLinkError::invalid_param(format!(
                "track {} is not an application-defined video source",
                source
            )));
        }
        if state.enabled {
            let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
            state.latest = Some((seq, frame.clone()));
        }
        Ok(())
    }

    fn create_sink(&self, kind: TrackKind) -> PeerLinkResult<Handle> {
        self.forced_failure("create_sink")?;
        let sink = self.handles.allocate();
        self.sinks.insert(
            sink,
            SinkState {
                kind,
                source: Handle::INVALID,
                volume: 1.0,
                last_seq: 0,
            },
        );
        Ok(sink)
    }

    fn destroy_sink(&self, sink: Handle) -> PeerLinkResult<()> {
        self.forced_failure("destroy_sink")?;
        self.sinks
            .remove(&sink)
            .map(|_| ())
            .ok_or_else(|| invalid("sink", sink))
    }

    fn set_sink_source(&self, sink: Handle, track: Handle) -> PeerLinkResult<()> {
        self.forced_failure_on("set_sink_source", sink)?;
        let track_kind = if track.is_valid() {
            Some(
                self.tracks
                    .get(&track)
                    .map(|state| state.kind)
                    .ok_or_else(|| invalid("track", track))?,
            )
        } else {
            None
        };
        let mut state = self.sinks.get_mut(&sink).ok_or_else(|| invalid("sink", sink))?;
        if let Some(kind) = track_kind {
            if kind != state.kind {
                return Err(PeerLinkError::invalid_param(format!(
                    "{} sink cannot render a {} track",
                    state.kind, kind
                )));
            }
        }
        state.source = track;
        state.last_seq = 0;
        Ok(())
    }

    fn set_sink_volume(&self, sink: Handle, volume: f32) -> PeerLinkResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PeerLinkError::invalid_param(format!(
                "volume {} outside 0.0..=1.0",
                volume
            )));
        }
        let mut state = self.sinks.get_mut(&sink).ok_or_else(|| invalid("sink", sink))?;
        if state.kind != TrackKind::Audio {
            return Err(PeerLinkError::invalid_param("volume applies to audio sinks"));
        }
        state.volume = volume;
        Ok(())
    }

    fn is_new_frame_available(&self, sink: Handle) -> PeerLinkResult<bool> {
        Ok(self.frame_source(sink)?.is_some())
    }

    fn acquire_frame(&self, sink: Handle, out: &mut Frame) -> PeerLinkResult<Handle> {
        self.park_if_held("acquire_frame");
        self.forced_failure_on("acquire_frame", sink)?;
        let (seq, producer) = self
            .frame_source(sink)?
            .ok_or_else(|| PeerLinkError::native("acquire_frame", "no new frame available"))?;
        {
            let track = self
                .tracks
                .get(&producer)
                .ok_or_else(|| invalid("track", producer))?;
            let (_, frame) = track
                .latest
                .as_ref()
                .ok_or_else(|| PeerLinkError::native("acquire_frame", "frame vanished"))?;
            out.copy_from(frame);
        }
        if let Some(mut state) = self.sinks.get_mut(&sink) {
            state.last_seq = seq;
        }
        let frame = self.handles.allocate();
        self.frames.insert(frame, sink);
        Ok(frame)
    }

    fn release_frame(&self, frame: Handle) -> PeerLinkResult<()> {
        self.frames
            .remove(&frame)
            .map(|_| ())
            .ok_or_else(|| invalid("frame", frame))
    }

    fn create_data_channel(
        &self,
        connection: Handle,
        label: &str,
        events: EventSender,
        context: Handle,
    ) -> PeerLinkResult<Handle> {
        self.forced_failure("create_data_channel")?;
        if !self.connections.contains_key(&connection) {
            return Err(invalid("connection", connection));
        }
        let channel = self.handles.allocate();
        self.channels.insert(
            channel,
            ChannelState {
                connection,
                label: label.to_string(),
                open: false,
                peer: None,
                callbacks: Some(Callbacks { events, context }),
                backlog: Vec::new(),
            },
        );
        if let Some(mut conn) = self.connections.get_mut(&connection) {
            conn.channels.push(channel);
        }
        if let Some(peer) = self.peer_link(connection) {
            self.pair_channel(channel, peer);
        }
        Ok(channel)
    }

    fn register_data_channel(&self, channel: Handle, events: EventSender, context: Handle) -> PeerLinkResult<()> {
        let mut state = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| invalid("data channel", channel))?;
        let callbacks = Callbacks { events, context };
        for kind in state.backlog.drain(..) {
            callbacks.emit(kind);
        }
        state.callbacks = Some(callbacks);
        Ok(())
    }

    fn data_channel_label(&self, channel: Handle) -> PeerLinkResult<String> {
        self.channels
            .get(&channel)
            .map(|state| state.label.clone())
            .ok_or_else(|| invalid("data channel", channel))
    }

    fn is_data_channel_open(&self, channel: Handle) -> PeerLinkResult<bool> {
        self.channels
            .get(&channel)
            .map(|state| state.open)
            .ok_or_else(|| invalid("data channel", channel))
    }

    fn send_data_channel_message(&self, channel: Handle, message: &DataChannelMessage) -> PeerLinkResult<()> {
        self.forced_failure("send_data_channel_message")?;
        let peer = {
            let state = self
                .channels
                .get(&channel)
                .ok_or_else(|| invalid("data channel", channel))?;
            if !state.open {
                return Err(PeerLinkError::DataChannelIsClosed {
                    label: state.label.clone(),
                });
            }
            state.peer
        };
        if let Some(peer) = peer {
            if let Some(mut peer) = self.channels.get_mut(&peer) {
                peer.deliver(NativeEventKind::DataChannelMessage {
                    message: message.clone(),
                });
            }
        }
        Ok(())
    }

    fn destroy_data_channel(&self, connection: Handle, channel: Handle) -> PeerLinkResult<()> {
        self.forced_failure("destroy_data_channel")?;
        let owner = self
            .channels
            .get(&channel)
            .map(|state| state.connection)
            .ok_or_else(|| invalid("data channel", channel))?;
        if owner != connection {
            return Err(PeerLinkError::invalid_param(format!(
                "data channel {} does not belong to connection {}",
                channel, connection
            )));
        }
        self.close_channel(channel);
        if let Some(mut conn) = self.connections.get_mut(&connection) {
            conn.channels.retain(|c| *c != channel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::native::event_channel;

    #[test]
    fn test_offer_emits_description_and_candidates() {
        let engine = LoopbackEngine::new();
        let (tx, mut rx) = event_channel();
        let conn = engine
            .create_connection(&ConnectionConfig::default(), tx, Handle::from_raw(5))
            .unwrap();

        engine.create_offer(conn).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.context, Handle::from_raw(5));
        assert!(matches!(first.kind, NativeEventKind::LocalOfferCreated { ref sdp } if !sdp.is_empty()));
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            NativeEventKind::IceCandidateFound { .. }
        ));
        assert_eq!(rx.try_recv().unwrap().kind, NativeEventKind::IceGatheringCompleted);
        assert!(!engine.is_connected(conn).unwrap());
    }

    #[test]
    fn test_forced_failure_is_one_shot() {
        let engine = LoopbackEngine::new();
        engine.fail_next("create_sink");
        assert_eq!(
            engine.create_sink(TrackKind::Video).unwrap_err().code(),
            ResultCode::UnspecifiedFailure
        );
        assert!(engine.create_sink(TrackKind::Video).is_ok());
    }

    #[test]
    fn test_privilege_gate() {
        let engine = LoopbackEngine::new();
        engine.deny_privilege(Privilege::Camera);
        assert_eq!(
            engine
                .create_local_track(TrackSource::DeviceCamera)
                .unwrap_err()
                .code(),
            ResultCode::PrivilegeDenied
        );
        assert!(engine.create_local_track(TrackSource::Microphone).is_ok());
        engine.grant_privilege(Privilege::Camera);
        assert!(engine.create_local_track(TrackSource::DeviceCamera).is_ok());
    }

    #[test]
    fn test_acquire_and_release_frame() {
        let engine = LoopbackEngine::new();
        let source = engine
            .create_local_track(TrackSource::AppDefinedVideo)
            .unwrap();
        let sink = engine.create_sink(TrackKind::Video).unwrap();
        engine.set_sink_source(sink, source).unwrap();
        assert!(!engine.is_new_frame_available(sink).unwrap());

        let frame = Frame::rgba(1, 10, 2, 2, bytes::Bytes::from(vec![0u8; 16])).unwrap();
        engine.push_frame(source, &frame).unwrap();
        assert!(engine.is_new_frame_available(sink).unwrap());

        let mut out = Frame::empty(crate::frame::FrameFormat::Rgba8888);
        let handle = engine.acquire_frame(sink, &mut out).unwrap();
        assert_eq!(out, frame);
        assert_eq!(engine.outstanding_frames(), 1);
        assert!(!engine.is_new_frame_available(sink).unwrap());

        engine.release_frame(handle).unwrap();
        assert_eq!(engine.outstanding_frames(), 0);
        assert!(engine.release_frame(handle).is_err());
    }

    #[test]
    fn test_pinned_failure_targets_one_handle() {
        let engine = LoopbackEngine::new();
        let first = engine.create_sink(TrackKind::Video).unwrap();
        let second = engine.create_sink(TrackKind::Video).unwrap();
        engine.fail_on("set_sink_source", first);

        for _ in 0..2 {
            assert!(engine.set_sink_source(first, Handle::INVALID).is_err());
        }
        assert!(engine.set_sink_source(second, Handle::INVALID).is_ok());

        engine.restore("set_sink_source", first);
        assert!(engine.set_sink_source(first, Handle::INVALID).is_ok());
    }

    #[test]
    fn test_held_push_waits_for_release() {
        let engine = Arc::new(LoopbackEngine::new());
        let source = engine
            .create_local_track(TrackSource::AppDefinedVideo)
            .unwrap();
        let frame = Frame::rgba(1, 10, 2, 2, bytes::Bytes::from(vec![0u8; 16])).unwrap();
        let held = engine.hold_next("push_frame");
        assert!(!held.wait_entered(Duration::from_millis(10)));

        let producer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.push_frame(source, &frame))
        };
        assert!(held.wait_entered(Duration::from_secs(5)));
        assert!(!producer.is_finished());

        held.release();
        assert!(producer.join().unwrap().is_ok());
    }
}
