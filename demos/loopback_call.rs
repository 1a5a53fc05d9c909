//! Loopback Call Demo
//!
//! Two sessions share one loopback engine and place a call to each other:
//! - offer/answer and ICE candidates relayed by hand
//! - an application-defined video track rendered by the remote sink
//! - a data channel carrying a greeting both ways

use anyhow::Context;
use bytes::Bytes;
use peerlink::{
    init_logging, ConnectionConfig, ConnectionId, Frame, IceServer, LoggingConfig,
    LoopbackEngine, Session, SessionConfig, SessionEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Endpoint {
    name: &'static str,
    session: Session,
    events: peerlink::EventStream,
    connection: ConnectionId,
}

impl Endpoint {
    fn new(name: &'static str, engine: &Arc<LoopbackEngine>) -> anyhow::Result<Self> {
        let mut session = Session::new(engine.clone(), SessionConfig::default())?;
        let events = session.events();
        let config = ConnectionConfig::new(vec![IceServer::stun("stun:stun.l.google.com:19302")]);
        let connection = session.create_connection(config)?;
        Ok(Self {
            name,
            session,
            events,
            connection,
        })
    }

    async fn pump(&mut self) -> Vec<SessionEvent> {
        self.session.update().await;
        let events = self.events.drain();
        for event in &events {
            println!("  [{}] {}", self.name, event.event_type());
        }
        events
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::default())?;

    println!("📞 PeerLink Loopback Call Demo");
    println!("==============================");

    let engine = Arc::new(LoopbackEngine::new());
    let mut alice = Endpoint::new("alice", &engine)?;
    let mut bob = Endpoint::new("bob", &engine)?;

    // Alice publishes a synthetic video track and opens a chat channel
    let stream = alice.session.create_local_stream("camera")?;
    let (track, source) = alice.session.create_app_video_track()?;
    alice.session.add_track_to_stream(stream, track)?;
    alice.session.add_local_track(alice.connection, track)?;
    let chat = alice.session.create_data_channel(alice.connection, "chat")?;

    println!("\n📋 Negotiation");
    alice.session.create_offer(alice.connection)?;
    let events = alice.pump().await;
    let offer = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::LocalOfferCreated { sdp, .. } => Some(sdp.clone()),
            _ => None,
        })
        .context("alice produced no offer")?;

    bob.session.set_remote_offer(bob.connection, &offer)?;
    let events = bob.pump().await;
    let answer = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::LocalAnswerCreated { sdp, .. } => Some(sdp.clone()),
            _ => None,
        })
        .context("bob produced no answer")?;
    for event in &events {
        if let SessionEvent::LocalIceCandidateFound { candidate, .. } = event {
            alice
                .session
                .add_remote_ice_candidate(alice.connection, candidate)?;
        }
    }

    alice.session.set_remote_answer(alice.connection, &answer)?;
    alice.pump().await;
    let events = bob.pump().await;
    println!(
        "✅ Connected: alice={} bob={}",
        alice.session.is_connected_or_false(alice.connection),
        bob.session.is_connected_or_false(bob.connection)
    );

    println!("\n🎥 Video");
    let remote = bob
        .session
        .remote_stream(bob.connection, "camera")
        .context("bob has no remote camera stream")?;
    let rendered = Arc::new(AtomicUsize::new(0));
    let sink = {
        let rendered = Arc::clone(&rendered);
        bob.session.create_video_sink(move |frame| {
            rendered.fetch_add(1, Ordering::Relaxed);
            println!(
                "  [bob] frame {} {}x{} ({} bytes)",
                frame.id,
                frame.width(),
                frame.height(),
                frame.total_size()
            );
        })?
    };
    bob.session.bind_sink(sink, remote)?;

    for id in 1..=3u64 {
        let frame = Frame::rgba(id, id * 33_000, 4, 4, Bytes::from(vec![id as u8; 64]))?;
        source.push_frame(&frame)?;
        bob.session.update().await;
    }
    println!("✅ Bob rendered {} frame(s)", rendered.load(Ordering::Relaxed));

    println!("\n💬 Data channel");
    let bob_chat = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::DataChannelReceived { channel, .. } => Some(*channel),
            _ => None,
        })
        .context("bob never saw the chat channel")?;
    alice.session.send_text(chat, "hello bob")?;
    bob.session.send_text(bob_chat, "hi alice")?;
    for event in bob.pump().await.into_iter().chain(alice.pump().await) {
        if let SessionEvent::DataChannelMessage { message, .. } = event {
            println!("  message: {:?}", message.as_text());
        }
    }

    println!("\n🧹 Hang up");
    alice.session.shutdown()?;
    bob.pump().await;
    bob.session.shutdown()?;
    println!("✨ Loopback call demo completed!");
    Ok(())
}
