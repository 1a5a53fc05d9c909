//! Device lifecycle hooks for local tracks
//!
//! When the host device goes to standby every local track snapshots its
//! enabled state and disables itself; when the device becomes active again
//! the snapshot is restored. Camera tracks additionally release their
//! capture device on standby and reattach it on wake.

use peerlink_core::{Handle, NativeEngine, PeerLinkResult, TrackSource};
use tracing::debug;

/// Standby/active behaviour of a local track
pub trait DeviceLifecycle: Send + std::fmt::Debug {
    /// Remember `enabled` for the next wake; a held snapshot is kept
    fn store_snapshot(&mut self, enabled: bool);

    /// Take the remembered state, if any
    fn take_snapshot(&mut self) -> Option<bool>;

    /// Device is going to standby
    fn handle_device_standby(&mut self, engine: &dyn NativeEngine, track: Handle) -> PeerLinkResult<()> {
        let enabled = engine.track_enabled(track)?;
        self.store_snapshot(enabled);
        if enabled {
            engine.set_track_enabled(track, false)?;
        }
        Ok(())
    }

    /// Device is active again
    fn handle_device_active(&mut self, engine: &dyn NativeEngine, track: Handle) -> PeerLinkResult<()> {
        match self.take_snapshot() {
            Some(enabled) => engine.set_track_enabled(track, enabled),
            None => Ok(()),
        }
    }
}

/// Snapshot-and-restore behaviour shared by all local tracks
#[derive(Debug, Default)]
pub struct TrackLifecycle {
    snapshot: Option<bool>,
}

impl DeviceLifecycle for TrackLifecycle {
    fn store_snapshot(&mut self, enabled: bool) {
        self.snapshot.get_or_insert(enabled);
    }

    fn take_snapshot(&mut self) -> Option<bool> {
        self.snapshot.take()
    }
}

/// Camera tracks also detach from the capture device while in standby
#[derive(Debug, Default)]
pub struct CameraLifecycle {
    snapshot: Option<bool>,
}

impl DeviceLifecycle for CameraLifecycle {
    fn store_snapshot(&mut self, enabled: bool) {
        self.snapshot.get_or_insert(enabled);
    }

    fn take_snapshot(&mut self) -> Option<bool> {
        self.snapshot.take()
    }

    fn handle_device_standby(&mut self, engine: &dyn NativeEngine, track: Handle) -> PeerLinkResult<()> {
        let enabled = engine.track_enabled(track)?;
        self.store_snapshot(enabled);
        if enabled {
            engine.set_track_enabled(track, false)?;
        }
        engine.disconnect_camera(track)?;
        debug!("camera track {} released its capture device", track);
        Ok(())
    }

    fn handle_device_active(&mut self, engine: &dyn NativeEngine, track: Handle) -> PeerLinkResult<()> {
        engine.connect_camera(track)?;
        debug!("camera track {} reattached its capture device", track);
        match self.take_snapshot() {
            Some(enabled) => engine.set_track_enabled(track, enabled),
            None => Ok(()),
        }
    }
}

/// Lifecycle behaviour for a local track of `source`
pub fn lifecycle_for(source: TrackSource) -> Box<dyn DeviceLifecycle> {
    match source {
        TrackSource::DeviceCamera => Box::new(CameraLifecycle::default()),
        _ => Box::new(TrackLifecycle::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::LoopbackEngine;

    #[test]
    fn test_standby_restores_previous_state() {
        let engine = LoopbackEngine::new();
        let enabled = engine.create_local_track(TrackSource::Microphone).unwrap();
        let disabled = engine.create_local_track(TrackSource::Microphone).unwrap();
        engine.set_track_enabled(disabled, false).unwrap();

        let mut first = lifecycle_for(TrackSource::Microphone);
        let mut second = lifecycle_for(TrackSource::Microphone);
        first.handle_device_standby(&engine, enabled).unwrap();
        second.handle_device_standby(&engine, disabled).unwrap();
        assert!(!engine.track_enabled(enabled).unwrap());
        assert!(!engine.track_enabled(disabled).unwrap());

        first.handle_device_active(&engine, enabled).unwrap();
        second.handle_device_active(&engine, disabled).unwrap();
        assert!(engine.track_enabled(enabled).unwrap());
        assert!(!engine.track_enabled(disabled).unwrap());
    }

    #[test]
    fn test_repeated_standby_keeps_first_snapshot() {
        let engine = LoopbackEngine::new();
        let mic = engine.create_local_track(TrackSource::Microphone).unwrap();
        let camera = engine.create_local_track(TrackSource::DeviceCamera).unwrap();
        let mut mic_lifecycle = lifecycle_for(TrackSource::Microphone);
        let mut camera_lifecycle = lifecycle_for(TrackSource::DeviceCamera);

        for _ in 0..2 {
            mic_lifecycle.handle_device_standby(&engine, mic).unwrap();
            camera_lifecycle.handle_device_standby(&engine, camera).unwrap();
        }
        assert!(!engine.track_enabled(mic).unwrap());
        assert!(!engine.track_enabled(camera).unwrap());

        mic_lifecycle.handle_device_active(&engine, mic).unwrap();
        camera_lifecycle.handle_device_active(&engine, camera).unwrap();
        assert!(engine.track_enabled(mic).unwrap());
        assert!(engine.track_enabled(camera).unwrap());
        assert_eq!(engine.camera_connected(camera), Some(true));
    }

    #[test]
    fn test_camera_releases_capture_device() {
        let engine = LoopbackEngine::new();
        let camera = engine.create_local_track(TrackSource::DeviceCamera).unwrap();
        let mut lifecycle = lifecycle_for(TrackSource::DeviceCamera);

        lifecycle.handle_device_standby(&engine, camera).unwrap();
        assert_eq!(engine.camera_connected(camera), Some(false));

        lifecycle.handle_device_active(&engine, camera).unwrap();
        assert_eq!(engine.camera_connected(camera), Some(true));
        assert!(engine.track_enabled(camera).unwrap());
    }

    #[test]
    fn test_active_without_standby_is_a_no_op() {
        let engine = LoopbackEngine::new();
        let track = engine.create_local_track(TrackSource::Microphone).unwrap();
        engine.set_track_enabled(track, false).unwrap();
        let mut lifecycle = TrackLifecycle::default();
        lifecycle.handle_device_active(&engine, track).unwrap();
        assert!(!engine.track_enabled(track).unwrap());
    }
}
