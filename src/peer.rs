use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::media::LocalTrack;
use crate::types::{
    DecodedFrame, EncodedFrame, IceCandidate, PeerConnectionState, CHANNELS, FRAME_SIZE,
    SAMPLE_RATE,
};

/// Opus payload type registered by the default codecs.
const OPUS_PAYLOAD_TYPE: u8 = 111;

// ── Capability traits ──

/// Remote audio, already decoded to 48kHz mono.
pub struct RemoteTrack {
    pub id: String,
    pub frames: flume::Receiver<DecodedFrame>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack").field("id", &self.id).finish()
    }
}

/// What the transport reports back to the session.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerConnectionState),
}

pub trait PeerTransport: Send + Sync {
    fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> BoxFuture<'_, Result<()>>;

    /// Offer that always receives audio and never video. Sets it as the
    /// local description and returns the SDP.
    fn create_offer(&self) -> BoxFuture<'_, Result<String>>;

    fn set_remote_answer(&self, sdp: String) -> BoxFuture<'_, Result<()>>;

    fn add_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<()>>;

    /// Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: Vec<String>,
        events: flume::Sender<PeerEvent>,
    ) -> BoxFuture<'static, Result<Arc<dyn PeerTransport>>>;
}

// ── webrtc implementation ──

#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcPeerFactory;

impl PeerFactory for WebRtcPeerFactory {
    fn create(
        &self,
        ice_servers: Vec<String>,
        events: flume::Sender<PeerEvent>,
    ) -> BoxFuture<'static, Result<Arc<dyn PeerTransport>>> {
        async move {
            let peer = WebRtcPeer::new(ice_servers, events).await?;
            Ok(Arc::new(peer) as Arc<dyn PeerTransport>)
        }
        .boxed()
    }
}

pub fn map_ice_state(state: RTCIceConnectionState) -> PeerConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => PeerConnectionState::New,
        RTCIceConnectionState::Checking => PeerConnectionState::Connecting,
        RTCIceConnectionState::Connected => PeerConnectionState::Connected,
        RTCIceConnectionState::Completed => PeerConnectionState::Completed,
        RTCIceConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCIceConnectionState::Failed => PeerConnectionState::Failed,
        RTCIceConnectionState::Closed => PeerConnectionState::Closed,
    }
}

pub struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
    has_local_track: AtomicBool,
    closed: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: Vec<String>, events: flume::Sender<PeerEvent>) -> Result<Self> {
        // Set up media engine with Opus
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors for RTCP etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|url| RTCIceServer {
                    urls: vec![url],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );
        let closed = Arc::new(AtomicBool::new(false));

        // Trickle local candidates out as they are gathered
        let ice_tx = events.clone();
        let ice_closed = Arc::clone(&closed);
        connection.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_tx.clone();
            let closed = ice_closed.load(Ordering::Relaxed);
            Box::pin(async move {
                let Some(c) = candidate else { return };
                if closed {
                    return;
                }
                let json = match c.to_json() {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {e}");
                        return;
                    }
                };
                let _ = ice_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: json.candidate,
                    sdp_mid: json.sdp_mid,
                    sdp_mline_index: json.sdp_mline_index,
                }));
            })
        }));

        let state_tx = events.clone();
        connection.on_ice_connection_state_change(Box::new(move |state| {
            tracing::debug!("ICE connection state: {state}");
            let _ = state_tx.send(PeerEvent::StateChanged(map_ice_state(state)));
            Box::pin(async {})
        }));

        connection.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!("Peer connection state: {state}");
            Box::pin(async {})
        }));

        // On incoming audio: decode opus and hand the PCM stream to the session
        let track_tx = events;
        connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    tracing::debug!("Ignoring remote {} track", track.kind());
                    return;
                }
                let track_id = track.id();
                tracing::info!("Received remote audio track {track_id}");

                let (decoded_tx, decoded_rx) = flume::unbounded::<DecodedFrame>();
                let remote_id = track_id.clone();
                tokio::spawn(async move {
                    let mut decoder = match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::error!("Failed to create opus decoder: {e}");
                            return;
                        }
                    };
                    let mut pcm_buf = vec![0.0f32; FRAME_SIZE];

                    loop {
                        let (rtp_packet, _) = match track.read_rtp().await {
                            Ok(read) => read,
                            Err(e) => {
                                tracing::debug!("RTP read ended for {remote_id}: {e}");
                                break;
                            }
                        };
                        if rtp_packet.payload.is_empty() {
                            continue;
                        }
                        match decoder.decode_float(&rtp_packet.payload, &mut pcm_buf, false) {
                            Ok(samples) => {
                                let frame = DecodedFrame {
                                    samples: pcm_buf[..samples].to_vec(),
                                };
                                if decoded_tx.send(frame).is_err() {
                                    break; // playback unloaded
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Opus decode error: {e}");
                            }
                        }
                    }
                });

                let _ = track_tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track_id,
                    frames: decoded_rx,
                }));
            })
        }));

        Ok(Self {
            connection,
            has_local_track: AtomicBool::new(false),
            closed,
            pump: Mutex::new(None),
        })
    }

    async fn attach(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            format!("stagelink-{}", track.id()),
        ));

        let sender = self
            .connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add local track")?;
        self.has_local_track.store(true, Ordering::Relaxed);
        tracing::info!("Added local audio track to peer connection");

        // Drain RTCP so the interceptors keep running
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        if let Some(frames) = track.frames() {
            let pump = tokio::spawn(pump_frames(audio_track, frames));
            if let Ok(mut slot) = self.pump.lock() {
                if let Some(previous) = slot.replace(pump) {
                    previous.abort();
                }
            }
        }
        Ok(())
    }

    async fn offer(&self) -> Result<String> {
        if !self.has_local_track.load(Ordering::Relaxed) {
            // Every peer can hear even without a microphone
            self.connection
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .context("Failed to add receive-only audio transceiver")?;
        }

        let offer = self.connection.create_offer(None).await?;
        self.connection
            .set_local_description(offer.clone())
            .await?;
        Ok(offer.sdp)
    }

    async fn answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn candidate(&self, candidate: IceCandidate) -> Result<()> {
        let ice_candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(ice_candidate)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
            }
        }
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Error closing peer connection: {e}");
        }
    }
}

impl PeerTransport for WebRtcPeer {
    fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> BoxFuture<'_, Result<()>> {
        self.attach(track).boxed()
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<String>> {
        self.offer().boxed()
    }

    fn set_remote_answer(&self, sdp: String) -> BoxFuture<'_, Result<()>> {
        self.answer(sdp).boxed()
    }

    fn add_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<()>> {
        self.candidate(candidate).boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.shutdown().boxed()
    }
}

/// Packetizes encoded frames onto the RTP track until capture stops.
async fn pump_frames(track: Arc<TrackLocalStaticRTP>, frames: flume::Receiver<EncodedFrame>) {
    let ssrc: u32 = rand::random();
    let mut seq: u16 = rand::random();
    let mut ts: u32 = 0;

    while let Ok(frame) = frames.recv_async().await {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: OPUS_PAYLOAD_TYPE,
                sequence_number: seq,
                timestamp: ts,
                ssrc,
                marker: false,
                ..Default::default()
            },
            payload: Bytes::from(frame.data),
        };
        seq = seq.wrapping_add(1);
        ts = ts.wrapping_add(FRAME_SIZE as u32);

        if let Err(e) = track.write_rtp(&packet).await {
            tracing::debug!("Failed to write RTP: {e}");
        }
    }
    tracing::debug!("Local audio pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checking_maps_to_connecting() {
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Checking),
            PeerConnectionState::Connecting
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            PeerConnectionState::Completed
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Unspecified),
            PeerConnectionState::New
        );
    }

    #[tokio::test]
    async fn offer_without_microphone_is_receive_only_audio() {
        let (tx, _rx) = flume::unbounded();
        let peer = WebRtcPeer::new(Vec::new(), tx).await.unwrap();
        let sdp = peer.create_offer().await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("a=recvonly"));
        assert!(!sdp.contains("m=video"));
        peer.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, _rx) = flume::unbounded();
        let peer = WebRtcPeer::new(Vec::new(), tx).await.unwrap();
        peer.close().await;
        peer.close().await;
    }
}
