//! Event system for connection, track and data channel events
//!
//! Native callbacks are queued from whatever thread the engine uses and
//! dispatched by [`crate::Session::update`]. Every resulting
//! [`SessionEvent`] reaches registered observers and [`EventStream`]s on
//! the thread that called `update`.

use crate::connection::ConnectionId;
use crate::data_channel::DataChannelId;
use crate::stream::StreamId;
use crate::track::TrackId;
use futures::Stream;
use peerlink_core::{DataChannelMessage, IceCandidate, TrackKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Session events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A local offer is ready to be relayed to the remote peer
    LocalOfferCreated {
        /// Connection
        connection: ConnectionId,
        /// Session description
        sdp: String,
    },
    /// A local answer is ready to be relayed to the remote peer
    LocalAnswerCreated {
        /// Connection
        connection: ConnectionId,
        /// Session description
        sdp: String,
    },
    /// A local ICE candidate is ready to be relayed
    LocalIceCandidateFound {
        /// Connection
        connection: ConnectionId,
        /// The candidate
        candidate: IceCandidate,
    },
    /// ICE gathering finished
    IceGatheringCompleted {
        /// Connection
        connection: ConnectionId,
    },
    /// Connection established
    Connected {
        /// Connection
        connection: ConnectionId,
    },
    /// Connection lost
    Disconnected {
        /// Connection
        connection: ConnectionId,
    },
    /// Negotiation or transport failure
    ConnectionError {
        /// Connection
        connection: ConnectionId,
        /// Error reported by the engine
        message: String,
    },
    /// The remote peer added a track
    TrackAdded {
        /// Connection that delivered the track
        connection: ConnectionId,
        /// The new remote track
        track: TrackId,
        /// Track kind
        kind: TrackKind,
        /// Remote streams the track was placed in
        streams: Vec<StreamId>,
    },
    /// The remote peer removed a track; its id no longer resolves
    TrackRemoved {
        /// Connection that owned the track
        connection: ConnectionId,
        /// The removed track
        track: TrackId,
        /// Track kind
        kind: TrackKind,
    },
    /// The remote peer opened a data channel
    DataChannelReceived {
        /// Connection
        connection: ConnectionId,
        /// The new remote channel
        channel: DataChannelId,
    },
    /// A data channel opened
    DataChannelOpened {
        /// Channel
        channel: DataChannelId,
    },
    /// A data channel closed
    DataChannelClosed {
        /// Channel
        channel: DataChannelId,
    },
    /// A data channel message arrived
    DataChannelMessage {
        /// Channel
        channel: DataChannelId,
        /// The message
        message: DataChannelMessage,
    },
    /// The device went to standby; local tracks were paused
    DeviceStandby,
    /// The device became active; local tracks were restored
    DeviceActive,
}

impl SessionEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::LocalOfferCreated { .. } => "local_offer_created",
            SessionEvent::LocalAnswerCreated { .. } => "local_answer_created",
            SessionEvent::LocalIceCandidateFound { .. } => "local_ice_candidate_found",
            SessionEvent::IceGatheringCompleted { .. } => "ice_gathering_completed",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::ConnectionError { .. } => "connection_error",
            SessionEvent::TrackAdded { .. } => "track_added",
            SessionEvent::TrackRemoved { .. } => "track_removed",
            SessionEvent::DataChannelReceived { .. } => "data_channel_received",
            SessionEvent::DataChannelOpened { .. } => "data_channel_opened",
            SessionEvent::DataChannelClosed { .. } => "data_channel_closed",
            SessionEvent::DataChannelMessage { .. } => "data_channel_message",
            SessionEvent::DeviceStandby => "device_standby",
            SessionEvent::DeviceActive => "device_active",
        }
    }

    /// Connection the event concerns, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            SessionEvent::LocalOfferCreated { connection, .. }
            | SessionEvent::LocalAnswerCreated { connection, .. }
            | SessionEvent::LocalIceCandidateFound { connection, .. }
            | SessionEvent::IceGatheringCompleted { connection }
            | SessionEvent::Connected { connection }
            | SessionEvent::Disconnected { connection }
            | SessionEvent::ConnectionError { connection, .. }
            | SessionEvent::TrackAdded { connection, .. }
            | SessionEvent::TrackRemoved { connection, .. }
            | SessionEvent::DataChannelReceived { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    /// Check if this is a negotiation or connection state event
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::LocalOfferCreated { .. }
                | SessionEvent::LocalAnswerCreated { .. }
                | SessionEvent::LocalIceCandidateFound { .. }
                | SessionEvent::IceGatheringCompleted { .. }
                | SessionEvent::Connected { .. }
                | SessionEvent::Disconnected { .. }
                | SessionEvent::ConnectionError { .. }
        )
    }

    /// Check if this is a track event
    pub fn is_track_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::TrackAdded { .. } | SessionEvent::TrackRemoved { .. }
        )
    }

    /// Check if this is a data channel event
    pub fn is_data_channel_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::DataChannelReceived { .. }
                | SessionEvent::DataChannelOpened { .. }
                | SessionEvent::DataChannelClosed { .. }
                | SessionEvent::DataChannelMessage { .. }
        )
    }

    /// Check if this is a device lifecycle event
    pub fn is_device_event(&self) -> bool {
        matches!(self, SessionEvent::DeviceStandby | SessionEvent::DeviceActive)
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, SessionEvent::ConnectionError { .. })
    }
}

/// Stream of session events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<SessionEvent>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Identifies a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&SessionEvent) + Send>;

/// Fan-out of session events to observers and streams
#[derive(Default)]
pub(crate) struct EventHub {
    next_observer: u64,
    observers: Vec<(ObserverId, Observer)>,
    streams: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observers.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl EventHub {
    pub(crate) fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.push(tx);
        EventStream::new(rx)
    }

    pub(crate) fn add_observer(&mut self, observer: Observer) -> ObserverId {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, observer));
        id
    }

    pub(crate) fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        debug!("Session event: {}", event.event_type());
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
        self.streams.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_event_categories() {
        assert!(SessionEvent::DeviceStandby.is_device_event());
        assert_eq!(SessionEvent::DeviceActive.event_type(), "device_active");
        assert!(SessionEvent::DeviceActive.connection().is_none());
    }

    #[test]
    fn test_stream_wakes_on_publish() {
        let mut hub = EventHub::default();
        let mut stream = hub.subscribe();

        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
        hub.publish(SessionEvent::DeviceActive);
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(SessionEvent::DeviceActive));
    }

    #[tokio::test]
    async fn test_hub_fans_out_and_forgets_closed_streams() {
        let mut hub = EventHub::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let seen = Arc::clone(&seen);
            hub.add_observer(Box::new(move |event| {
                seen.lock().unwrap().push(event.event_type())
            }))
        };

        let mut stream = hub.subscribe();
        let dropped = hub.subscribe();
        drop(dropped);

        hub.publish(SessionEvent::DeviceStandby);
        assert_eq!(stream.next().await, Some(SessionEvent::DeviceStandby));
        assert_eq!(hub.streams.len(), 1);

        assert!(hub.remove_observer(observer));
        assert!(!hub.remove_observer(observer));
        hub.publish(SessionEvent::DeviceActive);
        assert_eq!(*seen.lock().unwrap(), vec!["device_standby"]);

        assert_eq!(
            StreamExt::next(&mut stream).await,
            Some(SessionEvent::DeviceActive)
        );
        assert!(stream.try_next().unwrap().is_none());
    }
}
