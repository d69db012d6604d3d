use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::media::{LocalTrack, MediaManager};
use crate::negotiation::{Coordinator, NegotiationState, SessionAction, SessionInput};
use crate::peer::{PeerEvent, PeerTransport};
use crate::platform::Platform;
use crate::signaling::{SignalingEvent, SignalingLink};
use crate::sink::RemoteAudioSink;
use crate::types::{ClientId, PeerConnectionState, Role};

/// Snapshot of a session, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: NegotiationState,
    pub is_connected: bool,
    /// Mute intent; always `true` for the audience.
    pub muted: bool,
    pub connection_state: Option<PeerConnectionState>,
    pub client_id: Option<ClientId>,
    pub role: Option<Role>,
    pub has_local_track: bool,
    pub playing: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: NegotiationState::Idle,
            is_connected: false,
            muted: false,
            connection_state: None,
            client_id: None,
            role: None,
            has_local_track: false,
            playing: false,
        }
    }
}

enum Command {
    Input(SessionInput),
    Shutdown,
}

/// Backend completions, tagged with the connect epoch that started them.
enum Event {
    SignalingReady {
        epoch: u64,
        result: Result<SignalingLink>,
    },
    Signaling {
        epoch: u64,
        event: SignalingEvent,
    },
    MediaReady {
        epoch: u64,
        result: Result<Option<Arc<dyn LocalTrack>>>,
    },
    Peer {
        epoch: u64,
        event: PeerEvent,
    },
}

// ── Handle ──

/// Caller-facing side of a session. All commands are fire-and-forget; the
/// outcome shows up in [`SessionStatus`].
pub struct SessionHandle {
    commands: flume::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Starts the runtime task. Must be called inside a tokio runtime.
    pub fn spawn(server_url: impl Into<String>, config: ClientConfig, platform: Platform) -> Self {
        let (commands_tx, commands_rx) = flume::unbounded();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let runtime = Runtime::new(server_url.into(), &config, platform, status_tx);
        let task = tokio::spawn(runtime.run(commands_rx));
        Self {
            commands: commands_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    pub fn connect(&self, muted: bool, role: Role) {
        self.send(SessionInput::Connect { muted, role });
    }

    pub fn toggle_mic(&self) {
        self.send(SessionInput::ToggleMic);
    }

    pub fn close(&self) {
        self.send(SessionInput::Close);
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected
    }

    pub fn muted(&self) -> bool {
        self.status.borrow().muted
    }

    pub fn connection_state(&self) -> Option<PeerConnectionState> {
        self.status.borrow().connection_state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Tears down any active session and waits for the runtime to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session runtime ended abnormally: {e}");
            }
        }
    }

    fn send(&self, input: SessionInput) {
        if self.commands.send(Command::Input(input)).is_err() {
            warn!("Session runtime has stopped, command dropped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ── Runtime ──

/// The single execution context that owns every session resource.
struct Runtime {
    coordinator: Coordinator,
    platform: Platform,
    /// Bumped whenever a session starts or ends.
    epoch: u64,

    signaling: Option<SignalingLink>,
    signaling_forward: Option<JoinHandle<()>>,
    peer: Option<Arc<dyn PeerTransport>>,
    peer_forward: Option<JoinHandle<()>>,
    media: MediaManager,
    sink: RemoteAudioSink,

    events_tx: flume::Sender<Event>,
    events_rx: flume::Receiver<Event>,
    status: watch::Sender<SessionStatus>,
}

impl Runtime {
    fn new(
        server_url: String,
        config: &ClientConfig,
        platform: Platform,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            coordinator: Coordinator::new(server_url, config),
            media: MediaManager::new(Arc::clone(&platform.media)),
            sink: RemoteAudioSink::new(Arc::clone(&platform.audio_out)),
            platform,
            epoch: 0,
            signaling: None,
            signaling_forward: None,
            peer: None,
            peer_forward: None,
            events_tx,
            events_rx,
            status,
        }
    }

    async fn run(mut self, commands: flume::Receiver<Command>) {
        let events = self.events_rx.clone();
        loop {
            tokio::select! {
                cmd = commands.recv_async() => match cmd {
                    Ok(Command::Input(input)) => self.feed(input).await,
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                Ok(event) = events.recv_async() => self.on_event(event).await,
            }
        }
        self.feed(SessionInput::Close).await;
        info!("Session runtime stopped");
    }

    /// Runs one input through the coordinator, bumping the epoch when the
    /// session starts or ends.
    fn step(&mut self, input: SessionInput) -> Vec<SessionAction> {
        let was_active = self.coordinator.is_active();
        let actions = self.coordinator.handle(input);
        if was_active != self.coordinator.is_active() {
            self.epoch += 1;
        }
        actions
    }

    async fn feed(&mut self, input: SessionInput) {
        let actions = self.step(input);
        let epoch = self.epoch;
        let mut queue: VecDeque<(u64, SessionAction)> =
            actions.into_iter().map(|a| (epoch, a)).collect();

        while let Some((epoch, action)) = queue.pop_front() {
            if epoch != self.epoch {
                debug!("Skipping {action:?} from a finished session");
                continue;
            }
            if let Some(input) = self.execute(action).await {
                let follow_up = self.step(input);
                let epoch = self.epoch;
                for action in follow_up.into_iter().rev() {
                    queue.push_front((epoch, action));
                }
            }
        }
        self.publish();
    }

    /// Performs one action. Inline results come back as the next input.
    async fn execute(&mut self, action: SessionAction) -> Option<SessionInput> {
        match action {
            SessionAction::CreatePeer { ice_servers } => {
                self.close_peer().await;
                let (peer_tx, peer_rx) = flume::unbounded();
                match self.platform.peers.create(ice_servers, peer_tx).await {
                    Ok(peer) => {
                        let epoch = self.epoch;
                        self.peer = Some(peer);
                        self.peer_forward = Some(forward(
                            peer_rx,
                            self.events_tx.clone(),
                            move |event| Event::Peer { epoch, event },
                        ));
                        None
                    }
                    Err(e) => Some(SessionInput::PeerFailed {
                        reason: format!("{e:#}"),
                    }),
                }
            }
            SessionAction::AcquireMedia { role } => {
                self.media.set_enabled(!self.coordinator.muted());
                let acquiring = self.media.acquire_task(role);
                let events = self.events_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = acquiring.await;
                    let _ = events.send(Event::MediaReady { epoch, result });
                });
                None
            }
            SessionAction::OpenSignaling { url } => {
                let connecting = self.platform.signaling.connect(url);
                let events = self.events_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = connecting.await;
                    let _ = events.send(Event::SignalingReady { epoch, result });
                });
                None
            }
            SessionAction::SetTrackEnabled(enabled) => {
                self.media.set_enabled(enabled);
                None
            }
            SessionAction::AttachLocalTrack => {
                let (Some(peer), Some(track)) = (self.peer.clone(), self.media.track()) else {
                    debug!("No track or peer to attach");
                    return None;
                };
                if let Err(e) = peer.add_local_track(track).await {
                    return Some(SessionInput::LocalTrackFailed {
                        reason: format!("{e:#}"),
                    });
                }
                None
            }
            SessionAction::CreateOffer => {
                let Some(peer) = self.peer.clone() else {
                    return Some(SessionInput::OfferFailed {
                        reason: SessionError::PeerUnavailable.to_string(),
                    });
                };
                match peer.create_offer().await {
                    Ok(sdp) => Some(SessionInput::OfferCreated { sdp }),
                    Err(e) => Some(SessionInput::OfferFailed {
                        reason: format!("{e:#}"),
                    }),
                }
            }
            SessionAction::Send(msg) => {
                match &self.signaling {
                    Some(link) => {
                        link.send(msg);
                    }
                    None => debug!(
                        "Dropping '{}': {}",
                        msg.kind(),
                        SessionError::SignalingUnavailable
                    ),
                }
                None
            }
            SessionAction::ApplyAnswer { sdp } => {
                let Some(peer) = self.peer.clone() else {
                    return Some(SessionInput::AnswerRejected {
                        reason: SessionError::PeerUnavailable.to_string(),
                    });
                };
                match peer.set_remote_answer(sdp).await {
                    Ok(()) => Some(SessionInput::AnswerApplied),
                    Err(e) => Some(SessionInput::AnswerRejected {
                        reason: format!("{e:#}"),
                    }),
                }
            }
            SessionAction::AddRemoteCandidate(candidate) => {
                if let Some(peer) = self.peer.clone() {
                    if let Err(e) = peer.add_remote_candidate(candidate).await {
                        warn!("Error adding ICE candidate: {e:#}");
                    }
                }
                None
            }

            // Teardown steps never fail the sequence
            SessionAction::ReleaseMedia => {
                self.media.release();
                None
            }
            SessionAction::ClosePeer => {
                self.close_peer().await;
                None
            }
            SessionAction::CloseSignaling => {
                if let Some(forward) = self.signaling_forward.take() {
                    forward.abort();
                }
                if let Some(link) = self.signaling.take() {
                    link.close();
                    info!("Signaling channel closed");
                }
                None
            }
            SessionAction::StopPlayback => {
                self.sink.stop();
                None
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::SignalingReady { epoch, result } => {
                if epoch != self.epoch {
                    if let Ok(link) = result {
                        debug!("Closing signaling link from a finished session");
                        link.close();
                    }
                    return;
                }
                match result {
                    Ok(link) => {
                        self.signaling_forward = Some(forward(
                            link.incoming(),
                            self.events_tx.clone(),
                            move |event| Event::Signaling { epoch, event },
                        ));
                        self.signaling = Some(link);
                        self.feed(SessionInput::SignalingOpened).await;
                    }
                    Err(e) => {
                        self.feed(SessionInput::SignalingFailed {
                            reason: format!("{e:#}"),
                        })
                        .await
                    }
                }
            }
            Event::Signaling { epoch, event } => {
                if epoch != self.epoch {
                    return;
                }
                let input = match event {
                    SignalingEvent::Message(msg) => SessionInput::Signal(msg),
                    SignalingEvent::Closed { reason } => SessionInput::SignalingClosed { reason },
                };
                self.feed(input).await;
            }
            Event::MediaReady { epoch, result } => {
                if epoch != self.epoch {
                    if let Ok(Some(track)) = result {
                        debug!("Stopping microphone acquired for a finished session");
                        track.stop();
                    }
                    return;
                }
                let input = match result {
                    Ok(Some(track)) => {
                        self.media.set_enabled(!self.coordinator.muted());
                        self.media.install(track);
                        SessionInput::MediaSettled { has_track: true }
                    }
                    Ok(None) => SessionInput::MediaSettled { has_track: false },
                    Err(e) => SessionInput::MediaUnavailable {
                        reason: format!("{e:#}"),
                    },
                };
                self.feed(input).await;
            }
            Event::Peer { epoch, event } => {
                if epoch != self.epoch {
                    return;
                }
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        self.feed(SessionInput::LocalCandidate(candidate)).await
                    }
                    PeerEvent::StateChanged(state) => {
                        self.feed(SessionInput::IceStateChanged(state)).await
                    }
                    PeerEvent::RemoteTrack(track) => {
                        if self.coordinator.is_active() {
                            self.sink.play(track);
                            self.publish();
                        }
                    }
                }
            }
        }
    }

    async fn close_peer(&mut self) {
        if let Some(forward) = self.peer_forward.take() {
            forward.abort();
        }
        if let Some(peer) = self.peer.take() {
            peer.close().await;
            info!("Peer connection closed");
        }
    }

    fn publish(&self) {
        let media = self.media.state();
        let next = SessionStatus {
            state: self.coordinator.state().clone(),
            is_connected: self.coordinator.is_connected(),
            muted: self.coordinator.muted(),
            connection_state: self.coordinator.connection_state(),
            client_id: self.coordinator.client_id().cloned(),
            role: self.coordinator.role(),
            has_local_track: media.has_track,
            playing: self.sink.is_playing(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

fn forward<T: Send + 'static>(
    rx: flume::Receiver<T>,
    events: flume::Sender<Event>,
    wrap: impl Fn(T) -> Event + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(item) = rx.recv_async().await {
            if events.send(wrap(item)).is_err() {
                break;
            }
        }
    })
}
