use std::sync::Arc;

use crate::audio::{CpalMicrophone, CpalSpeaker};
use crate::config::ClientConfig;
use crate::media::{MediaSource, NoMicrophone};
use crate::peer::{PeerFactory, WebRtcPeerFactory};
use crate::signaling::{SignalingConnector, WebSocketConnector};
use crate::sink::{AudioOutput, DrainOutput};

/// Capabilities the session runtime drives, chosen once at startup.
#[derive(Clone)]
pub struct Platform {
    pub signaling: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaSource>,
    pub audio_out: Arc<dyn AudioOutput>,
}

impl Platform {
    /// Desktop: WebSocket signaling, webrtc, cpal microphone and speaker.
    pub fn native(config: &ClientConfig) -> Self {
        Self {
            signaling: Arc::new(WebSocketConnector {
                ping_interval: config.ping_interval,
            }),
            peers: Arc::new(WebRtcPeerFactory),
            media: Arc::new(CpalMicrophone::new(
                config.input_device.clone(),
                config.noise_suppression,
            )),
            audio_out: Arc::new(CpalSpeaker),
        }
    }

    /// No audio devices: receive-only, remote audio is drained.
    pub fn headless(config: &ClientConfig) -> Self {
        Self {
            signaling: Arc::new(WebSocketConnector {
                ping_interval: config.ping_interval,
            }),
            peers: Arc::new(WebRtcPeerFactory),
            media: Arc::new(NoMicrophone),
            audio_out: Arc::new(DrainOutput),
        }
    }
}
