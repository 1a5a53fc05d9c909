//! In-flight operation gate
//!
//! Producers and frame acquisition enter the gate around every native call
//! that references a track or sink handle. Destruction closes the gate and
//! waits, up to a bound, for in-flight operations to drain. When the bound
//! expires the gate reopens and destruction is refused with a retryable
//! `Timeout`, so a native handle is never released under a running call.

use crate::error::{PeerLinkError, PeerLinkResult};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    closed: bool,
}

/// Reference-counted gate guarding a native handle
#[derive(Debug, Default)]
pub struct InFlightGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

/// Marks one in-flight operation; leaving scope exits the gate
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    gate: &'a InFlightGate,
}

impl InFlightGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate; `None` once the gate has been closed for destruction
    pub fn enter(&self) -> Option<InFlightGuard<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(InFlightGuard { gate: self })
    }

    /// Number of operations currently inside
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Whether the gate is closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the gate and wait for in-flight operations to finish.
    ///
    /// On success the gate stays closed. On timeout it is reopened and a
    /// retryable [`PeerLinkError::Timeout`] is returned.
    pub fn close_and_drain(&self, operation: &str, timeout: Duration) -> PeerLinkResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.closed = true;

        while state.in_flight > 0 {
            debug!("{}: waiting on {} in-flight operation(s)", operation, state.in_flight);
            if self.drained.wait_until(&mut state, deadline).timed_out() && state.in_flight > 0 {
                state.closed = false;
                warn!(
                    "{}: {} operation(s) still in flight after {:?}, refusing",
                    operation, state.in_flight, timeout
                );
                return Err(PeerLinkError::Timeout {
                    operation: operation.to_string(),
                    duration: timeout,
                });
            }
        }
        Ok(())
    }

    /// Reopen a gate closed by [`InFlightGate::close_and_drain`]
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_close_without_in_flight_succeeds() {
        let gate = InFlightGate::new();
        assert!(gate.close_and_drain("test", Duration::from_millis(10)).is_ok());
        assert!(gate.is_closed());
        assert!(gate.enter().is_none());
    }

    #[test]
    fn test_close_times_out_and_reopens() {
        let gate = InFlightGate::new();
        let guard = gate.enter().unwrap();

        let err = gate
            .close_and_drain("destroy", Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::Timeout);
        assert!(err.is_retryable());
        assert!(!gate.is_closed());

        drop(guard);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_close_waits_for_other_thread() {
        let gate = Arc::new(InFlightGate::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.enter().unwrap();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(30));
            })
        };

        entered_rx.recv().unwrap();
        assert!(gate.close_and_drain("destroy", Duration::from_secs(2)).is_ok());
        assert_eq!(gate.in_flight(), 0);
        worker.join().unwrap();
    }
}
