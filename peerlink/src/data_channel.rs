//! Data channels for application messages

use crate::connection::ConnectionId;
use crate::event::SessionEvent;
use crate::session::{unknown, CallbackTarget, ContextId, Session};
use bytes::Bytes;
use peerlink_core::{
    define_id, DataChannelMessage, Handle, LogFailure, PeerLinkError, PeerLinkResult,
    NativeEventKind,
};
use tracing::{debug, info};

define_id!(
    /// Identifies a data channel within a session
    DataChannelId
);

/// A labeled message channel on a connection
#[derive(Debug)]
pub struct DataChannel {
    pub(crate) native: Handle,
    pub(crate) label: String,
    pub(crate) connection: Option<ConnectionId>,
    pub(crate) context: ContextId,
    pub(crate) local: bool,
    pub(crate) open: bool,
}

impl DataChannel {
    /// Channel label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Owning connection
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Created by this side
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Open state as last reported through events
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Native handle
    pub fn native_handle(&self) -> Handle {
        self.native
    }
}

impl Session {
    /// Create a data channel labeled `label` on `connection`
    pub fn create_data_channel(&mut self, connection: ConnectionId, label: &str) -> PeerLinkResult<DataChannelId> {
        const OP: &str = "DataChannel.create";
        let conn_native = self.connection_native(connection, OP)?;

        let context = self.contexts.insert(CallbackTarget::Pending);
        let native = match self.engine.create_data_channel(
            conn_native,
            label,
            self.native_tx.clone(),
            context.handle(),
        ) {
            Ok(native) => native,
            Err(err) => {
                self.contexts.remove(context);
                return Err(err).log_failure(OP);
            }
        };

        let id = self.channels.insert(DataChannel {
            native,
            label: label.to_string(),
            connection: Some(connection),
            context,
            local: true,
            open: false,
        });
        if let Some(target) = self.contexts.get_mut(context) {
            *target = CallbackTarget::DataChannel(id);
        }
        if let Some(conn) = self.connections.get_mut(connection) {
            conn.local_channels.push(id);
        }
        info!("Created data channel {} '{}' on connection {}", id, label, connection);
        Ok(id)
    }

    /// Look up a data channel
    pub fn data_channel(&self, id: DataChannelId) -> Option<&DataChannel> {
        self.channels.get(id)
    }

    fn channel_native(&self, id: DataChannelId, operation: &str) -> PeerLinkResult<Handle> {
        self.channels
            .get(id)
            .map(|channel| channel.native)
            .ok_or_else(|| unknown("data channel", id))
            .log_failure(operation)
    }

    /// Send a message; fails with `DataChannelIsClosed` unless the channel is open
    pub fn send_message(&self, id: DataChannelId, message: &DataChannelMessage) -> PeerLinkResult<()> {
        const OP: &str = "DataChannel.send_message";
        let native = self.channel_native(id, OP)?;
        self.engine
            .send_data_channel_message(native, message)
            .log_failure(OP)
    }

    /// Send a UTF-8 text message
    pub fn send_text(&self, id: DataChannelId, text: &str) -> PeerLinkResult<()> {
        self.send_message(id, &DataChannelMessage::text(text))
    }

    /// Send a binary message
    pub fn send_bytes(&self, id: DataChannelId, data: impl Into<Bytes>) -> PeerLinkResult<()> {
        self.send_message(id, &DataChannelMessage::binary(data))
    }

    /// Whether the engine reports the channel as open
    pub fn is_data_channel_open(&self, id: DataChannelId) -> PeerLinkResult<bool> {
        const OP: &str = "DataChannel.is_open";
        let native = self.channel_native(id, OP)?;
        self.engine.is_data_channel_open(native).log_failure(OP)
    }

    /// Lenient form of [`Session::is_data_channel_open`]: `false` on failure
    pub fn is_data_channel_open_or_false(&self, id: DataChannelId) -> bool {
        self.is_data_channel_open(id).unwrap_or(false)
    }

    /// Destroy a data channel.
    ///
    /// The owning connection must still be alive. The callback context is
    /// released even when the native call fails; events still queued for it
    /// are dropped.
    pub fn destroy_data_channel(&mut self, id: DataChannelId) -> PeerLinkResult<()> {
        const OP: &str = "DataChannel.destroy";
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| unknown("data channel", id))
            .log_failure(OP)?;
        let native = channel.native;
        let conn_native = channel
            .connection
            .and_then(|conn| self.connections.get(conn))
            .map(|conn| conn.native)
            .ok_or_else(|| {
                PeerLinkError::invalid_param(format!("data channel {} has no live connection", id))
            })
            .log_failure(OP)?;

        let result = self
            .engine
            .destroy_data_channel(conn_native, native)
            .log_failure(OP);
        self.forget_data_channel(id);
        info!("Destroyed data channel {}", id);
        result
    }

    /// Drop a channel and its context without touching the engine
    pub(crate) fn forget_data_channel(&mut self, id: DataChannelId) {
        let Some(channel) = self.channels.remove(id) else {
            return;
        };
        self.contexts.remove(channel.context);
        if let Some(conn) = channel.connection.and_then(|c| self.connections.get_mut(c)) {
            conn.local_channels.retain(|c| *c != id);
            conn.remote_channels.retain(|c| *c != id);
        }
    }

    pub(crate) fn handle_channel_event(&mut self, id: DataChannelId, kind: NativeEventKind) {
        let Some(channel) = self.channels.get_mut(id) else {
            debug!("Dropping {} for destroyed data channel {}", kind.name(), id);
            return;
        };
        let event = match kind {
            NativeEventKind::DataChannelOpened => {
                channel.open = true;
                SessionEvent::DataChannelOpened { channel: id }
            }
            NativeEventKind::DataChannelClosed => {
                channel.open = false;
                SessionEvent::DataChannelClosed { channel: id }
            }
            NativeEventKind::DataChannelMessage { message } => {
                SessionEvent::DataChannelMessage { channel: id, message }
            }
            other => {
                debug!("Data channel {}: ignoring {}", id, other.name());
                return;
            }
        };
        self.hub.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use peerlink_core::{ConnectionConfig, LoopbackEngine, ResultCode};
    use std::sync::Arc;

    fn session() -> (Arc<LoopbackEngine>, Session) {
        let engine = Arc::new(LoopbackEngine::new());
        let session = Session::new(engine.clone(), SessionConfig::default()).unwrap();
        (engine, session)
    }

    #[test]
    fn test_unpaired_channel_is_not_open() {
        let (_engine, mut session) = session();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        let channel = session.create_data_channel(conn, "chat").unwrap();

        assert_eq!(session.data_channel(channel).unwrap().label(), "chat");
        assert!(!session.is_data_channel_open_or_false(channel));
        assert_eq!(
            session.send_text(channel, "hi").unwrap_err().code(),
            ResultCode::DataChannelIsClosed
        );
        assert_eq!(
            session.connection(conn).unwrap().local_data_channels(),
            &[channel]
        );
    }

    #[test]
    fn test_destroy_releases_context_and_entity() {
        let (engine, mut session) = session();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        let channel = session.create_data_channel(conn, "chat").unwrap();
        assert_eq!(session.contexts.len(), 2);

        session.destroy_data_channel(channel).unwrap();
        assert!(session.data_channel(channel).is_none());
        assert_eq!(session.contexts.len(), 1);
        assert_eq!(engine.data_channel_count(), 0);
        assert!(session.connection(conn).unwrap().local_data_channels().is_empty());
        assert_eq!(
            session.destroy_data_channel(channel).unwrap_err().code(),
            ResultCode::InvalidParam
        );
    }

    #[test]
    fn test_create_failure_releases_context() {
        let (engine, mut session) = session();
        let conn = session.create_connection(ConnectionConfig::default()).unwrap();
        engine.fail_next("create_data_channel");
        assert!(session.create_data_channel(conn, "x").is_err());
        assert_eq!(session.contexts.len(), 1);
    }
}
