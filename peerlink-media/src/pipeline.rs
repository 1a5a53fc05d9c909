//! Video frame pipeline
//!
//! Frames move from native video sinks to application handlers in two
//! decoupled phases:
//!
//! 1. **Acquisition** polls registered sinks for new frames, acquires them
//!    and describes each into a slot of the shared [`FramePool`]. It runs on
//!    the blocking thread pool; an `is_processing` flag keeps passes from
//!    overlapping. One pass acquires at most `depth` frames and starts from a
//!    sink cursor that advances every pass, so a busy sink cannot starve the
//!    others out of the shared pool.
//! 2. **Delivery** runs on the thread driving the session. Each pending
//!    frame is handed to the handler and its native frame is released
//!    exactly once, whether or not the slot survived.
//!
//! Every sink carries an [`InFlightGate`]; acquisition enters it, and
//! unregistering or pausing a sink drains it first.

use crate::pool::{FramePool, SlotTicket};
use parking_lot::Mutex;
use peerlink_core::{
    Frame, Handle, InFlightGate, LogFailure, NativeEngine, PeerLinkError, PeerLinkResult,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Delivery statistics of one sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames handed to the sink's handler
    pub frames_delivered: u64,
    /// Frames acquired but lost to slot reuse or sink teardown
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    ticket: SlotTicket,
    native_frame: Handle,
}

#[derive(Debug)]
struct SinkChannel {
    key: Handle,
    native: Handle,
    gate: InFlightGate,
    pending: Mutex<Vec<PendingFrame>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SinkChannel {
    fn stats(&self) -> FrameStats {
        FrameStats {
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    engine: Arc<dyn NativeEngine>,
    pool: Mutex<FramePool>,
    sinks: Mutex<Vec<Arc<SinkChannel>>>,
    cursor: AtomicUsize,
    processing: AtomicBool,
}

/// Keeps a sink's acquisition stopped until dropped
#[derive(Debug)]
pub struct SinkPause {
    channel: Arc<SinkChannel>,
}

impl Drop for SinkPause {
    fn drop(&mut self) {
        self.channel.gate.reopen();
    }
}

/// Pool-backed frame pipeline shared by every video sink of a session
pub struct FramePipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("engine", &self.shared.engine.name())
            .field("depth", &self.depth())
            .field("sinks", &self.shared.sinks.lock().len())
            .finish()
    }
}

impl FramePipeline {
    /// Create a pipeline with a pool of `depth` slots
    pub fn new(engine: Arc<dyn NativeEngine>, depth: usize) -> PeerLinkResult<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                pool: Mutex::new(FramePool::new(depth)?),
                sinks: Mutex::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                processing: AtomicBool::new(false),
            }),
        })
    }

    /// Pool depth
    pub fn depth(&self) -> usize {
        self.shared.pool.lock().depth()
    }

    /// Start delivering frames of native sink `native` under `key`
    pub fn register(&self, key: Handle, native: Handle) -> PeerLinkResult<()> {
        let mut sinks = self.shared.sinks.lock();
        if sinks.iter().any(|sink| sink.key == key) {
            return Err(PeerLinkError::invalid_param(format!(
                "sink {} already registered with the frame pipeline",
                key
            )));
        }
        sinks.push(Arc::new(SinkChannel {
            key,
            native,
            gate: InFlightGate::new(),
            pending: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }));
        debug!("frame pipeline: registered sink {}", key);
        Ok(())
    }

    /// Stop delivering frames for `key`.
    ///
    /// Waits up to `timeout` for an in-flight acquisition on the sink; on
    /// expiry the sink stays registered and a retryable `Timeout` is
    /// returned. Pending frames are released undelivered.
    pub fn unregister(&self, key: Handle, timeout: Duration) -> PeerLinkResult<FrameStats> {
        let channel = self.channel(key)?;
        channel
            .gate
            .close_and_drain("FramePipeline.unregister", timeout)?;

        self.shared.sinks.lock().retain(|sink| sink.key != key);
        let pending: Vec<PendingFrame> = channel.pending.lock().drain(..).collect();
        for frame in pending {
            channel.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .shared
                .engine
                .release_frame(frame.native_frame)
                .log_failure("FramePipeline.unregister");
        }
        debug!("frame pipeline: unregistered sink {}", key);
        Ok(channel.stats())
    }

    /// Stop acquisition on `key` until the returned guard is dropped
    pub fn pause(&self, key: Handle, timeout: Duration) -> PeerLinkResult<SinkPause> {
        let channel = self.channel(key)?;
        channel.gate.close_and_drain("FramePipeline.pause", timeout)?;
        Ok(SinkPause { channel })
    }

    /// Whether `key` is registered
    pub fn is_registered(&self, key: Handle) -> bool {
        self.channel(key).is_ok()
    }

    /// Delivery statistics for `key`
    pub fn stats(&self, key: Handle) -> Option<FrameStats> {
        self.channel(key).ok().map(|channel| channel.stats())
    }

    /// Whether an acquisition pass is running
    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::Acquire)
    }

    fn channel(&self, key: Handle) -> PeerLinkResult<Arc<SinkChannel>> {
        self.shared
            .sinks
            .lock()
            .iter()
            .find(|sink| sink.key == key)
            .cloned()
            .ok_or(PeerLinkError::InvalidHandle {
                object: "video sink",
                handle: key,
            })
    }

    /// Run one acquisition pass on the blocking pool and wait for it.
    ///
    /// Returns the number of frames acquired; 0 without running when a
    /// previous pass is still in progress.
    pub async fn acquire(&self) -> usize {
        if self
            .shared
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("frame pipeline: acquisition already in progress");
            return 0;
        }

        let shared = Arc::clone(&self.shared);
        let pass = tokio::task::spawn_blocking(move || {
            let acquired = acquire_pass(&shared);
            shared.processing.store(false, Ordering::Release);
            acquired
        });
        match pass.await {
            Ok(acquired) => acquired,
            Err(err) => {
                warn!("frame pipeline: acquisition pass aborted: {}", err);
                self.shared.processing.store(false, Ordering::Release);
                0
            }
        }
    }

    /// Acquisition pass on the calling thread
    pub fn acquire_blocking(&self) -> usize {
        if self
            .shared
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let acquired = acquire_pass(&self.shared);
        self.shared.processing.store(false, Ordering::Release);
        acquired
    }

    /// Hand every pending frame to `handler`, then release it natively.
    ///
    /// Returns the number of frames delivered.
    pub fn deliver(&self, mut handler: impl FnMut(Handle, &Frame)) -> usize {
        let sinks: Vec<Arc<SinkChannel>> = self.shared.sinks.lock().clone();
        let mut delivered = 0;

        for sink in sinks {
            let pending: Vec<PendingFrame> = sink.pending.lock().drain(..).collect();
            for frame in pending {
                {
                    let pool = self.shared.pool.lock();
                    match pool.frame(frame.ticket) {
                        Some(described) => {
                            handler(sink.key, described);
                            sink.delivered.fetch_add(1, Ordering::Relaxed);
                            delivered += 1;
                        }
                        None => {
                            debug!(
                                "frame pipeline: slot {} reused before delivery to sink {}, dropping frame",
                                frame.ticket.index(),
                                sink.key
                            );
                            sink.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let _ = self
                    .shared
                    .engine
                    .release_frame(frame.native_frame)
                    .log_failure("FramePipeline.deliver");
            }
        }
        delivered
    }
}

fn acquire_pass(shared: &Shared) -> usize {
    let sinks: Vec<Arc<SinkChannel>> = shared.sinks.lock().clone();
    if sinks.is_empty() {
        return 0;
    }

    let budget = shared.pool.lock().depth();
    let start = shared.cursor.fetch_add(1, Ordering::Relaxed) % sinks.len();
    let mut acquired = 0;
    // a failed acquisition still spends its slot
    let mut slots_used = 0;

    for offset in 0..sinks.len() {
        if slots_used == budget {
            break;
        }
        let sink = &sinks[(start + offset) % sinks.len()];
        let Some(_guard) = sink.gate.enter() else {
            continue;
        };

        match shared.engine.is_new_frame_available(sink.native) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                debug!("frame pipeline: polling sink {} failed: {}", sink.key, err);
                continue;
            }
        }

        let mut pool = shared.pool.lock();
        let (ticket, slot) = pool.get();
        slots_used += 1;
        match shared.engine.acquire_frame(sink.native, slot) {
            Ok(native_frame) => {
                drop(pool);
                trace!("frame pipeline: sink {} acquired into slot {}", sink.key, ticket.index());
                sink.pending.lock().push(PendingFrame {
                    ticket,
                    native_frame,
                });
                acquired += 1;
            }
            Err(err) => {
                debug!("frame pipeline: acquiring from sink {} failed: {}", sink.key, err);
            }
        }
    }
    acquired
}
