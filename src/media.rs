use std::sync::Arc;

use anyhow::Result;
use futures_util::future::{self, BoxFuture, FutureExt};

use crate::types::{EncodedFrame, Role};

/// A live microphone track owned by the session.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Disabling keeps the track attached; the remote side hears silence.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Stops capture for good. Safe to call more than once.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Encoded frames for the network, if this track produces any.
    fn frames(&self) -> Option<flume::Receiver<EncodedFrame>>;
}

/// Platform access to a capture device.
pub trait MediaSource: Send + Sync {
    /// Opens the microphone. `Ok(None)` means the platform has no capture
    /// path at all and the session should run receive-only.
    fn acquire(&self) -> BoxFuture<'static, Result<Option<Arc<dyn LocalTrack>>>>;
}

/// Source for platforms without a microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMicrophone;

impl MediaSource for NoMicrophone {
    fn acquire(&self) -> BoxFuture<'static, Result<Option<Arc<dyn LocalTrack>>>> {
        future::ready(Ok(None)).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaState {
    pub has_track: bool,
    pub muted: bool,
}

/// Owns the local track for the active session.
pub struct MediaManager {
    source: Arc<dyn MediaSource>,
    track: Option<Arc<dyn LocalTrack>>,
    enabled: bool,
}

impl MediaManager {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            track: None,
            enabled: true,
        }
    }

    /// Future resolving to the track for `role`. The audience resolves to
    /// `None` without ever touching the device.
    pub fn acquire_task(&self, role: Role) -> BoxFuture<'static, Result<Option<Arc<dyn LocalTrack>>>> {
        if !role.captures_audio() {
            return future::ready(Ok(None)).boxed();
        }
        self.source.acquire()
    }

    pub fn install(&mut self, track: Arc<dyn LocalTrack>) {
        self.release();
        track.set_enabled(self.enabled);
        tracing::info!("Local track {} ready (enabled: {})", track.id(), self.enabled);
        self.track = Some(track);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if let Some(track) = &self.track {
            track.set_enabled(enabled);
            tracing::debug!("Microphone state applied: {enabled}");
        }
    }

    pub fn track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.track.clone()
    }

    pub fn release(&mut self) {
        if let Some(track) = self.track.take() {
            track.stop();
            tracing::info!("Released local track {}", track.id());
        }
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            has_track: self.track.is_some(),
            muted: !self.enabled,
        }
    }
}

impl Drop for MediaManager {
    fn drop(&mut self) {
        self.release();
    }
}
