//! Negotiation state machine.
//!
//! [`Coordinator`] is pure: it consumes [`SessionInput`]s translated from
//! platform callbacks (signaling frames, ICE events, media results) and
//! returns the [`SessionAction`]s the runtime must perform, in order. It never
//! touches a socket, a device or a peer connection, so every ordering of
//! events can be exercised without I/O.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, SessionConfig};
use crate::error::SessionError;
use crate::types::{
    ClientId, IceCandidate, PeerConnectionState, Role, SdpKind, SessionDescription,
    SignalMessage,
};

/// Where a session is in the connect sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    SignalingOpening,
    AwaitingIdentity,
    PreparingLocalMedia,
    OfferSent,
    Negotiating,
    Connected,
    /// Torn down after an error. Accepts a fresh `connect` like `Idle`.
    Failed {
        reason: String,
    },
}

impl NegotiationState {
    /// `connect` is only accepted from a resting state.
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed { .. })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::SignalingOpening => f.write_str("signaling-opening"),
            Self::AwaitingIdentity => f.write_str("awaiting-identity"),
            Self::PreparingLocalMedia => f.write_str("preparing-local-media"),
            Self::OfferSent => f.write_str("offer-sent"),
            Self::Negotiating => f.write_str("negotiating"),
            Self::Connected => f.write_str("connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    // Caller
    Connect { muted: bool, role: Role },
    ToggleMic,
    Close,

    // Signaling channel
    SignalingOpened,
    SignalingFailed { reason: String },
    SignalingClosed { reason: String },
    Signal(SignalMessage),

    // Local media
    MediaSettled { has_track: bool },
    MediaUnavailable { reason: String },
    /// The peer refused the local track; the session goes on receive-only.
    LocalTrackFailed { reason: String },

    // Peer transport
    PeerFailed { reason: String },
    OfferCreated { sdp: String },
    OfferFailed { reason: String },
    AnswerApplied,
    AnswerRejected { reason: String },
    LocalCandidate(IceCandidate),
    IceStateChanged(PeerConnectionState),
}

/// Side effects requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    CreatePeer { ice_servers: Vec<String> },
    AcquireMedia { role: Role },
    OpenSignaling { url: String },
    SetTrackEnabled(bool),
    AttachLocalTrack,
    CreateOffer,
    Send(SignalMessage),
    ApplyAnswer { sdp: String },
    AddRemoteCandidate(IceCandidate),
    ReleaseMedia,
    ClosePeer,
    CloseSignaling,
    StopPlayback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaProgress {
    Pending,
    Settled { has_track: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescription {
    Unset,
    Applying,
    Applied,
}

/// Negotiation coordinator for one session handle.
///
/// Owns the identity, mute intent and connection flags that a browser hook
/// would keep in nullable refs; every one of them is reset on teardown.
#[derive(Debug, Clone)]
pub struct Coordinator {
    server_url: String,
    ice_servers: Vec<String>,
    signaling_path: String,

    state: NegotiationState,
    role: Option<Role>,
    muted: bool,
    identity: Option<ClientId>,
    media: MediaProgress,
    offer_requested: bool,
    remote_description: RemoteDescription,
    /// Remote candidates received before the answer was applied.
    pending_candidates: Vec<IceCandidate>,
    signaling_open: bool,
    connection_state: Option<PeerConnectionState>,
}

impl Coordinator {
    pub fn new(server_url: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            server_url: server_url.into(),
            ice_servers: config.ice_servers.clone(),
            signaling_path: config.signaling_path.clone(),
            state: NegotiationState::Idle,
            role: None,
            muted: false,
            identity: None,
            media: MediaProgress::Pending,
            offer_requested: false,
            remote_description: RemoteDescription::Unset,
            pending_candidates: Vec::new(),
            signaling_open: false,
            connection_state: None,
        }
    }

    // ── Observers ──

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_resting()
    }

    pub fn is_connected(&self) -> bool {
        self.is_active() && self.connection_state.is_some_and(PeerConnectionState::is_connected)
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.identity.as_ref()
    }

    pub fn connection_state(&self) -> Option<PeerConnectionState> {
        self.connection_state
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    // ── Transitions ──

    /// Process one input and return the actions to run, in order.
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        match input {
            SessionInput::Connect { muted, role } => match self.connect(muted, role) {
                Ok(actions) => actions,
                Err(e) => {
                    warn!("connect ignored: {e}");
                    Vec::new()
                }
            },
            SessionInput::ToggleMic => self.toggle_mic(),
            SessionInput::Close => self.close(),

            SessionInput::SignalingOpened => {
                if self.state == NegotiationState::SignalingOpening {
                    info!("Signaling channel open, waiting for client id");
                    self.signaling_open = true;
                    self.state = NegotiationState::AwaitingIdentity;
                } else {
                    debug!("Signaling open in state {}, ignoring", self.state);
                }
                Vec::new()
            }
            SessionInput::SignalingFailed { reason } => {
                if !self.is_active() {
                    return Vec::new();
                }
                error!("Signaling channel error: {reason}");
                self.signaling_open = false;
                self.teardown(NegotiationState::Failed { reason })
            }
            SessionInput::SignalingClosed { reason } => {
                if !self.is_active() {
                    return Vec::new();
                }
                warn!("Signaling channel closed: {reason}");
                self.signaling_open = false;
                self.teardown(NegotiationState::Failed { reason })
            }
            SessionInput::Signal(msg) => self.on_signal(msg),

            SessionInput::MediaSettled { has_track } => self.on_media_settled(has_track),
            SessionInput::MediaUnavailable { reason } => {
                if self.is_active() {
                    warn!("Microphone unavailable, continuing receive-only: {reason}");
                }
                self.on_media_settled(false)
            }

            SessionInput::LocalTrackFailed { reason } => self.on_local_track_failed(reason),

            SessionInput::PeerFailed { reason } => {
                if !self.is_active() {
                    return Vec::new();
                }
                error!("Peer transport unavailable: {reason}");
                self.teardown(NegotiationState::Failed { reason })
            }
            SessionInput::OfferCreated { sdp } => self.on_offer_created(sdp),
            SessionInput::OfferFailed { reason } => {
                if !self.is_active() {
                    return Vec::new();
                }
                error!("Error creating offer: {reason}");
                self.teardown(NegotiationState::Failed { reason })
            }
            SessionInput::AnswerApplied => self.on_answer_applied(),
            SessionInput::AnswerRejected { reason } => {
                if self.remote_description == RemoteDescription::Applying {
                    warn!("Remote answer rejected: {reason}");
                    self.remote_description = RemoteDescription::Unset;
                }
                Vec::new()
            }
            SessionInput::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            SessionInput::IceStateChanged(state) => self.on_ice_state(state),
        }
    }

    /// Start a connection attempt, or explain why it was refused.
    pub fn connect(&mut self, muted: bool, role: Role) -> Result<Vec<SessionAction>, SessionError> {
        if self.is_active() {
            return Err(SessionError::SessionActive(self.state.clone()));
        }
        let session = SessionConfig {
            server_url: self.server_url.clone(),
            role,
        };
        let url = session.signaling_url(&self.signaling_path)?;

        self.reset_session();
        self.role = Some(role);
        // Audience never unmutes.
        self.muted = muted || !role.captures_audio();
        self.connection_state = None;
        self.state = NegotiationState::SignalingOpening;
        info!("Connecting to {url} as {role} (muted: {})", self.muted);

        let mut actions = vec![SessionAction::CreatePeer {
            ice_servers: self.ice_servers.clone(),
        }];
        if role.captures_audio() {
            actions.push(SessionAction::AcquireMedia { role });
        } else {
            self.media = MediaProgress::Settled { has_track: false };
        }
        actions.push(SessionAction::OpenSignaling { url });
        Ok(actions)
    }

    fn toggle_mic(&mut self) -> Vec<SessionAction> {
        if self.role == Some(Role::Audience) {
            debug!("Audience stays muted");
            return Vec::new();
        }
        self.muted = !self.muted;
        info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
        if self.is_active() && self.media == (MediaProgress::Settled { has_track: true }) {
            vec![SessionAction::SetTrackEnabled(!self.muted)]
        } else {
            Vec::new()
        }
    }

    fn close(&mut self) -> Vec<SessionAction> {
        match self.state {
            NegotiationState::Idle => {
                debug!("close() with no session, nothing to do");
                Vec::new()
            }
            NegotiationState::Failed { .. } => {
                self.state = NegotiationState::Idle;
                Vec::new()
            }
            _ => {
                info!("Closing session");
                self.teardown(NegotiationState::Idle)
            }
        }
    }

    fn on_signal(&mut self, msg: SignalMessage) -> Vec<SessionAction> {
        if !self.is_active() {
            debug!("Dropping '{}' message, no active session", msg.kind());
            return Vec::new();
        }
        match msg {
            SignalMessage::ClientId(id) => self.on_client_id(id),
            SignalMessage::Answer { description } => self.on_answer(description),
            SignalMessage::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate),
            SignalMessage::Disconnect { from } => {
                info!("Server ended the session (from {from:?})");
                self.teardown(NegotiationState::Failed {
                    reason: "remote party disconnected".into(),
                })
            }
            SignalMessage::Error { message } => {
                warn!("Signaling server error: {message}");
                Vec::new()
            }
            SignalMessage::Offer { from, .. } => {
                warn!("Unexpected offer from {from:?}, this client only makes offers");
                Vec::new()
            }
        }
    }

    fn on_client_id(&mut self, id: ClientId) -> Vec<SessionAction> {
        if let Some(current) = &self.identity {
            warn!("Ignoring second client id {id}, already {current}");
            return Vec::new();
        }
        if self.state != NegotiationState::AwaitingIdentity {
            warn!("Client id {id} arrived in state {}, ignoring", self.state);
            return Vec::new();
        }
        info!("Received client id: {id}");
        self.identity = Some(id);
        self.state = NegotiationState::PreparingLocalMedia;
        self.maybe_request_offer()
    }

    fn on_media_settled(&mut self, has_track: bool) -> Vec<SessionAction> {
        if !self.is_active() || self.media != MediaProgress::Pending {
            debug!("Local media settled again, ignoring");
            return Vec::new();
        }
        self.media = MediaProgress::Settled { has_track };
        let mut actions = Vec::new();
        if has_track {
            actions.push(SessionAction::SetTrackEnabled(!self.muted));
            actions.push(SessionAction::AttachLocalTrack);
        }
        actions.extend(self.maybe_request_offer());
        actions
    }

    fn on_local_track_failed(&mut self, reason: String) -> Vec<SessionAction> {
        if !self.is_active() || self.media != (MediaProgress::Settled { has_track: true }) {
            return Vec::new();
        }
        warn!("Failed to attach microphone, continuing receive-only: {reason}");
        self.media = MediaProgress::Settled { has_track: false };
        vec![SessionAction::ReleaseMedia]
    }

    /// Offer only once both identity and local media are settled.
    fn maybe_request_offer(&mut self) -> Vec<SessionAction> {
        let media_ready = matches!(self.media, MediaProgress::Settled { .. });
        if self.identity.is_none() || !media_ready || self.offer_requested {
            return Vec::new();
        }
        self.offer_requested = true;
        vec![SessionAction::CreateOffer]
    }

    fn on_offer_created(&mut self, sdp: String) -> Vec<SessionAction> {
        if self.state != NegotiationState::PreparingLocalMedia || !self.offer_requested {
            debug!("Offer created in state {}, discarding", self.state);
            return Vec::new();
        }
        self.state = NegotiationState::OfferSent;
        info!("Offer sent to server");
        vec![SessionAction::Send(SignalMessage::Offer {
            from: self.identity.clone(),
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp,
                profile_type: self.role,
            },
        })]
    }

    fn on_answer(&mut self, description: SessionDescription) -> Vec<SessionAction> {
        if description.kind != SdpKind::Answer {
            warn!("Answer message carried a {:?} description, ignoring", description.kind);
            return Vec::new();
        }
        let in_window = matches!(
            self.state,
            NegotiationState::OfferSent | NegotiationState::Negotiating
        );
        if !in_window || self.remote_description != RemoteDescription::Unset {
            warn!("Answer in state {} ignored", self.state);
            return Vec::new();
        }
        self.remote_description = RemoteDescription::Applying;
        self.state = NegotiationState::Negotiating;
        vec![SessionAction::ApplyAnswer {
            sdp: description.sdp,
        }]
    }

    fn on_answer_applied(&mut self) -> Vec<SessionAction> {
        if self.remote_description != RemoteDescription::Applying {
            return Vec::new();
        }
        info!("Remote description set successfully");
        self.remote_description = RemoteDescription::Applied;
        if !self.pending_candidates.is_empty() {
            debug!("Flushing {} buffered candidates", self.pending_candidates.len());
        }
        self.pending_candidates
            .drain(..)
            .map(SessionAction::AddRemoteCandidate)
            .collect()
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Vec<SessionAction> {
        if self.state == NegotiationState::SignalingOpening {
            debug!("Candidate before signaling open, dropping");
            return Vec::new();
        }
        if candidate.candidate.trim().is_empty() {
            // end-of-candidates marker
            return Vec::new();
        }
        if self.remote_description == RemoteDescription::Applied {
            vec![SessionAction::AddRemoteCandidate(candidate)]
        } else {
            self.pending_candidates.push(candidate);
            Vec::new()
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<SessionAction> {
        if !self.is_active() || !self.signaling_open {
            return Vec::new();
        }
        let Some(from) = self.identity.clone() else {
            warn!("Local candidate before client id, dropping");
            return Vec::new();
        };
        vec![SessionAction::Send(SignalMessage::IceCandidate {
            from: Some(from),
            candidate,
        })]
    }

    fn on_ice_state(&mut self, state: PeerConnectionState) -> Vec<SessionAction> {
        if !self.is_active() {
            return Vec::new();
        }
        info!("ICE connection state: {state}");
        self.connection_state = Some(state);
        if state.is_connected() {
            if self.state != NegotiationState::Connected {
                info!("WebRTC connection established");
                self.state = NegotiationState::Connected;
            }
            Vec::new()
        } else if state.is_terminal_failure() {
            self.teardown(NegotiationState::Failed {
                reason: format!("ice connection {state}"),
            })
        } else {
            Vec::new()
        }
    }

    /// Disconnect notice first, then media, peer, signaling and playback.
    fn teardown(&mut self, next: NegotiationState) -> Vec<SessionAction> {
        let mut actions = Vec::with_capacity(5);
        if self.signaling_open {
            actions.push(SessionAction::Send(SignalMessage::Disconnect {
                from: self.identity.clone(),
            }));
        }
        actions.extend([
            SessionAction::ReleaseMedia,
            SessionAction::ClosePeer,
            SessionAction::CloseSignaling,
            SessionAction::StopPlayback,
        ]);

        self.connection_state = match self.connection_state {
            Some(s) if s.is_terminal_failure() => Some(s),
            _ => Some(PeerConnectionState::Closed),
        };
        self.reset_session();
        self.state = next;
        actions
    }

    fn reset_session(&mut self) {
        self.identity = None;
        self.media = MediaProgress::Pending;
        self.offer_requested = false;
        self.remote_description = RemoteDescription::Unset;
        self.pending_candidates.clear();
        self.signaling_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new("http://10.0.0.5:8080", &ClientConfig::default())
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn answer() -> SessionInput {
        SessionInput::Signal(SignalMessage::Answer {
            description: SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 answer".into(),
                profile_type: None,
            },
        })
    }

    fn client_id(id: &str) -> SessionInput {
        SessionInput::Signal(SignalMessage::ClientId(ClientId::from(id)))
    }

    fn offers(actions: &[SessionAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, SessionAction::CreateOffer))
            .count()
    }

    /// Drive an actor session to `OfferSent`.
    fn offered_actor() -> Coordinator {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::SignalingOpened);
        c.handle(client_id("c1"));
        c.handle(SessionInput::MediaSettled { has_track: true });
        c.handle(SessionInput::OfferCreated { sdp: "v=0 offer".into() });
        assert_eq!(c.state(), &NegotiationState::OfferSent);
        c
    }

    #[test]
    fn actor_connect_opens_everything() {
        let mut c = coordinator();
        let actions = c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        assert_eq!(
            actions,
            vec![
                SessionAction::CreatePeer {
                    ice_servers: ClientConfig::default().ice_servers
                },
                SessionAction::AcquireMedia { role: Role::Actor },
                SessionAction::OpenSignaling {
                    url: "ws://10.0.0.5:8080/ws".into()
                },
            ]
        );
        assert_eq!(c.state(), &NegotiationState::SignalingOpening);
    }

    #[test]
    fn actor_sends_exactly_one_offer_from_identity() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        assert!(c.handle(SessionInput::SignalingOpened).is_empty());
        assert!(c.handle(client_id("c1")).is_empty(), "media still pending");

        let actions = c.handle(SessionInput::MediaSettled { has_track: true });
        assert_eq!(
            actions,
            vec![
                SessionAction::SetTrackEnabled(true),
                SessionAction::AttachLocalTrack,
                SessionAction::CreateOffer,
            ]
        );

        let actions = c.handle(SessionInput::OfferCreated { sdp: "v=0 offer".into() });
        assert_eq!(
            actions,
            vec![SessionAction::Send(SignalMessage::Offer {
                from: Some(ClientId::from("c1")),
                description: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0 offer".into(),
                    profile_type: Some(Role::Actor),
                },
            })]
        );
        assert_eq!(c.state(), &NegotiationState::OfferSent);
    }

    #[test]
    fn media_before_identity_waits_for_client_id() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: true, role: Role::Director });
        let actions = c.handle(SessionInput::MediaSettled { has_track: true });
        assert_eq!(
            actions,
            vec![SessionAction::SetTrackEnabled(false), SessionAction::AttachLocalTrack]
        );
        c.handle(SessionInput::SignalingOpened);
        assert_eq!(offers(&c.handle(client_id("c7"))), 1);
    }

    #[test]
    fn media_failure_degrades_to_receive_only() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::SignalingOpened);
        c.handle(client_id("c1"));
        let actions = c.handle(SessionInput::MediaUnavailable {
            reason: "permission denied".into(),
        });
        assert_eq!(actions, vec![SessionAction::CreateOffer]);
        assert!(c.is_active());
    }

    #[test]
    fn rejected_local_track_releases_microphone() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::MediaSettled { has_track: true });
        let actions = c.handle(SessionInput::LocalTrackFailed {
            reason: "add_track rejected".into(),
        });
        assert_eq!(actions, vec![SessionAction::ReleaseMedia]);
        assert!(c.is_active());

        // No live track any more, so toggling only records intent
        assert!(c.handle(SessionInput::ToggleMic).is_empty());
        assert!(c
            .handle(SessionInput::LocalTrackFailed { reason: "again".into() })
            .is_empty());

        c.handle(SessionInput::SignalingOpened);
        assert_eq!(offers(&c.handle(client_id("c1"))), 1);
    }

    #[test]
    fn repeated_media_resolution_does_not_offer_twice() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::SignalingOpened);
        let mut total = offers(&c.handle(client_id("c1")));
        total += offers(&c.handle(SessionInput::MediaSettled { has_track: true }));
        total += offers(&c.handle(SessionInput::MediaSettled { has_track: true }));
        total += offers(&c.handle(SessionInput::MediaUnavailable { reason: "late".into() }));
        total += offers(&c.handle(client_id("c2")));
        assert_eq!(total, 1);
        assert_eq!(c.client_id(), Some(&ClientId::from("c1")));
    }

    #[test]
    fn audience_never_touches_microphone() {
        let mut c = coordinator();
        let actions = c.handle(SessionInput::Connect { muted: true, role: Role::Audience });
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::AcquireMedia { .. })));
        assert!(c.muted());

        for _ in 0..3 {
            assert!(c.handle(SessionInput::ToggleMic).is_empty());
            assert!(c.muted());
        }

        c.handle(SessionInput::SignalingOpened);
        // media counts as settled (absent) for the audience
        assert_eq!(c.handle(client_id("a1")), vec![SessionAction::CreateOffer]);
    }

    #[test]
    fn audience_is_muted_even_when_asked_not_to_be() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Audience });
        assert!(c.muted());
    }

    #[test]
    fn toggle_twice_restores_mute_and_drives_live_track() {
        let mut c = offered_actor();
        assert!(!c.muted());
        assert_eq!(
            c.handle(SessionInput::ToggleMic),
            vec![SessionAction::SetTrackEnabled(false)]
        );
        assert_eq!(
            c.handle(SessionInput::ToggleMic),
            vec![SessionAction::SetTrackEnabled(true)]
        );
        assert!(!c.muted());
    }

    #[test]
    fn toggle_before_track_only_records_intent() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        assert!(c.handle(SessionInput::ToggleMic).is_empty());
        let actions = c.handle(SessionInput::MediaSettled { has_track: true });
        assert_eq!(actions[0], SessionAction::SetTrackEnabled(false));
    }

    #[test]
    fn toggle_without_session_flips_intent() {
        let mut c = coordinator();
        assert!(c.handle(SessionInput::ToggleMic).is_empty());
        assert!(c.muted());
    }

    #[test]
    fn candidates_before_answer_are_buffered_then_flushed_in_order() {
        let mut c = offered_actor();
        assert!(c
            .handle(SessionInput::Signal(SignalMessage::IceCandidate {
                from: None,
                candidate: candidate(1),
            }))
            .is_empty());
        c.handle(SessionInput::Signal(SignalMessage::IceCandidate {
            from: None,
            candidate: candidate(2),
        }));
        assert_eq!(c.buffered_candidates(), 2);

        assert_eq!(
            c.handle(answer()),
            vec![SessionAction::ApplyAnswer { sdp: "v=0 answer".into() }]
        );
        assert_eq!(c.state(), &NegotiationState::Negotiating);

        // still buffering while the answer is being applied
        c.handle(SessionInput::Signal(SignalMessage::IceCandidate {
            from: None,
            candidate: candidate(3),
        }));

        assert_eq!(
            c.handle(SessionInput::AnswerApplied),
            vec![
                SessionAction::AddRemoteCandidate(candidate(1)),
                SessionAction::AddRemoteCandidate(candidate(2)),
                SessionAction::AddRemoteCandidate(candidate(3)),
            ]
        );
        assert_eq!(
            c.handle(SessionInput::Signal(SignalMessage::IceCandidate {
                from: None,
                candidate: candidate(4),
            })),
            vec![SessionAction::AddRemoteCandidate(candidate(4))]
        );
    }

    #[test]
    fn empty_remote_candidate_is_ignored() {
        let mut c = offered_actor();
        c.handle(SessionInput::Signal(SignalMessage::IceCandidate {
            from: None,
            candidate: IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        }));
        assert_eq!(c.buffered_candidates(), 0);
    }

    #[test]
    fn answer_outside_window_is_ignored() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::SignalingOpened);
        assert!(c.handle(answer()).is_empty());
        assert_eq!(c.state(), &NegotiationState::AwaitingIdentity);
    }

    #[test]
    fn duplicate_answer_is_ignored() {
        let mut c = offered_actor();
        assert_eq!(c.handle(answer()).len(), 1);
        assert!(c.handle(answer()).is_empty());
    }

    #[test]
    fn rejected_answer_keeps_session_and_allows_retry() {
        let mut c = offered_actor();
        c.handle(answer());
        c.handle(SessionInput::AnswerRejected { reason: "bad sdp".into() });
        assert!(c.is_active());
        assert_eq!(c.handle(answer()).len(), 1);
    }

    #[test]
    fn local_candidates_are_tagged_with_identity() {
        let mut c = offered_actor();
        assert_eq!(
            c.handle(SessionInput::LocalCandidate(candidate(5))),
            vec![SessionAction::Send(SignalMessage::IceCandidate {
                from: Some(ClientId::from("c1")),
                candidate: candidate(5),
            })]
        );
    }

    #[test]
    fn local_candidates_after_close_are_dropped() {
        let mut c = offered_actor();
        c.handle(SessionInput::Close);
        assert!(c.handle(SessionInput::LocalCandidate(candidate(5))).is_empty());
    }

    #[test]
    fn connected_then_failed_tears_down_with_disconnect() {
        let mut c = offered_actor();
        c.handle(answer());
        c.handle(SessionInput::AnswerApplied);
        c.handle(SessionInput::IceStateChanged(PeerConnectionState::Connecting));
        assert!(!c.is_connected());
        c.handle(SessionInput::IceStateChanged(PeerConnectionState::Connected));
        assert!(c.is_connected());
        assert_eq!(c.state(), &NegotiationState::Connected);

        let actions = c.handle(SessionInput::IceStateChanged(PeerConnectionState::Failed));
        assert_eq!(
            actions,
            vec![
                SessionAction::Send(SignalMessage::Disconnect {
                    from: Some(ClientId::from("c1"))
                }),
                SessionAction::ReleaseMedia,
                SessionAction::ClosePeer,
                SessionAction::CloseSignaling,
                SessionAction::StopPlayback,
            ]
        );
        assert!(!c.is_connected());
        assert_eq!(c.connection_state(), Some(PeerConnectionState::Failed));
        assert!(matches!(c.state(), NegotiationState::Failed { .. }));
    }

    #[test]
    fn completed_counts_as_connected() {
        let mut c = offered_actor();
        c.handle(SessionInput::IceStateChanged(PeerConnectionState::Completed));
        assert!(c.is_connected());
    }

    #[test]
    fn signaling_failure_skips_disconnect_notice() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        let actions = c.handle(SessionInput::SignalingFailed {
            reason: "connection refused".into(),
        });
        assert_eq!(actions.first(), Some(&SessionAction::ReleaseMedia));
        assert_eq!(
            c.state(),
            &NegotiationState::Failed {
                reason: "connection refused".into()
            }
        );
    }

    #[test]
    fn close_without_connect_is_a_no_op() {
        let mut c = coordinator();
        assert!(c.handle(SessionInput::Close).is_empty());
        assert_eq!(c.state(), &NegotiationState::Idle);
        assert_eq!(c.connection_state(), None);
    }

    #[test]
    fn close_resets_to_idle_and_allows_reconnect() {
        let mut c = offered_actor();
        let actions = c.handle(SessionInput::Close);
        assert_eq!(actions.len(), 5);
        assert_eq!(c.state(), &NegotiationState::Idle);
        assert_eq!(c.client_id(), None);
        assert_eq!(c.connection_state(), Some(PeerConnectionState::Closed));
        assert!(c.handle(SessionInput::Close).is_empty());
        assert!(!c
            .handle(SessionInput::Connect { muted: false, role: Role::Actor })
            .is_empty());
    }

    #[test]
    fn connect_while_active_is_rejected() {
        let mut c = offered_actor();
        let err = c.connect(false, Role::Actor).unwrap_err();
        assert!(matches!(err, SessionError::SessionActive(NegotiationState::OfferSent)));
        assert!(c
            .handle(SessionInput::Connect { muted: false, role: Role::Director })
            .is_empty());
        assert_eq!(c.role(), Some(Role::Actor));
    }

    #[test]
    fn connect_after_failure_is_accepted() {
        let mut c = coordinator();
        c.handle(SessionInput::Connect { muted: false, role: Role::Actor });
        c.handle(SessionInput::PeerFailed { reason: "no api".into() });
        assert!(c.state().is_resting());
        assert!(c.connect(false, Role::Actor).is_ok());
    }

    #[test]
    fn missing_server_url_is_rejected() {
        let mut c = Coordinator::new("", &ClientConfig::default());
        assert!(matches!(
            c.connect(false, Role::Actor),
            Err(SessionError::MissingServerUrl)
        ));
        assert_eq!(c.state(), &NegotiationState::Idle);
    }

    #[test]
    fn server_disconnect_ends_session() {
        let mut c = offered_actor();
        let actions = c.handle(SessionInput::Signal(SignalMessage::Disconnect { from: None }));
        assert!(actions.contains(&SessionAction::ClosePeer));
        assert!(!c.is_active());
    }

    #[test]
    fn server_error_message_keeps_session() {
        let mut c = offered_actor();
        assert!(c
            .handle(SessionInput::Signal(SignalMessage::Error {
                message: "busy".into()
            }))
            .is_empty());
        assert_eq!(c.state(), &NegotiationState::OfferSent);
    }
}
