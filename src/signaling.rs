use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::DEFAULT_PING_INTERVAL;
use crate::types::SignalMessage;

/// What the signaling channel reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(SignalMessage),
    Closed { reason: String },
}

/// An open signaling channel.
///
/// - `outgoing`: the session writes here, serialized to the socket
/// - `incoming`: socket frames, parsed, plus a final `Closed`
pub struct SignalingLink {
    outgoing: flume::Sender<SignalMessage>,
    incoming: flume::Receiver<SignalingEvent>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingLink {
    pub fn new(
        outgoing: flume::Sender<SignalMessage>,
        incoming: flume::Receiver<SignalingEvent>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn incoming(&self) -> flume::Receiver<SignalingEvent> {
        self.incoming.clone()
    }

    /// Queues a message. Returns `false` once the channel has gone away.
    pub fn send(&self, msg: SignalMessage) -> bool {
        let kind = msg.kind();
        match self.outgoing.send(msg) {
            Ok(()) => {
                tracing::debug!("Queued outgoing {kind}");
                true
            }
            Err(_) => {
                tracing::debug!("Dropped outgoing {kind}, signaling closed");
                false
            }
        }
    }

    /// Dropping the outgoing sender makes the writer send a close frame.
    pub fn close(mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens signaling channels; injected so the session can run against fakes.
pub trait SignalingConnector: Send + Sync {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SignalingLink>>;
}

#[derive(Debug, Clone, Copy)]
pub struct WebSocketConnector {
    pub ping_interval: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl SignalingConnector for WebSocketConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SignalingLink>> {
        let ping_interval = self.ping_interval;
        async move { connect(&url, ping_interval).await }.boxed()
    }
}

/// Connects to the signaling server over WebSocket.
pub async fn connect(url: &str, ping_interval: Duration) -> Result<SignalingLink> {
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to signaling server")?;
    tracing::info!("Signaling connected to {url}");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Session → WS
    let (outgoing_tx, outgoing_rx) = flume::unbounded::<SignalMessage>();
    // WS → Session
    let (incoming_tx, incoming_rx) = flume::unbounded::<SignalingEvent>();

    // Task: forward outgoing messages to the websocket + periodic keepalive pings
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                msg = outgoing_rx.recv_async() => {
                    let Ok(msg) = msg else {
                        // Session closed the link
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!("Failed to serialize outgoing signal: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        tracing::warn!("WS send failed, connection likely closed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        tracing::warn!("WS ping failed, connection likely closed");
                        break;
                    }
                }
            }
        }
    });

    // Task: forward incoming websocket messages to the session
    let reader = tokio::spawn(async move {
        let reason = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => match parse_signal(&text) {
                    Some(signal) => {
                        if incoming_tx.send(SignalingEvent::Message(signal)).is_err() {
                            return; // session dropped
                        }
                    }
                    None => continue,
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) if !f.reason.is_empty() => format!("closed by server: {}", f.reason),
                        _ => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {} // pings are answered by tungstenite
                Some(Err(e)) => break format!("signaling error: {e}"),
                None => break "connection lost".to_string(),
            }
        };
        tracing::info!("Signaling WS connection closed ({reason})");
        let _ = incoming_tx.send(SignalingEvent::Closed { reason });
    });

    Ok(SignalingLink::new(outgoing_tx, incoming_rx).with_reader(reader))
}

/// Malformed or unknown frames are logged and skipped.
pub fn parse_signal(text: &str) -> Option<SignalMessage> {
    match serde_json::from_str::<SignalMessage>(text) {
        Ok(signal) => Some(signal),
        Err(e) => {
            tracing::warn!("Ignoring incoming signal ({e}): {text}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientId;

    #[test]
    fn parses_known_frames() {
        let msg = parse_signal(r#"{"type":"client-id","data":"abc"}"#);
        assert_eq!(msg, Some(SignalMessage::ClientId(ClientId::from("abc"))));
    }

    #[test]
    fn skips_garbage_and_unknown_types() {
        assert_eq!(parse_signal("not json"), None);
        assert_eq!(parse_signal(r#"{"type":"mystery","data":1}"#), None);
    }

    #[test]
    fn send_reports_closed_channel() {
        let (tx, rx) = flume::unbounded();
        let (_in_tx, in_rx) = flume::unbounded();
        let link = SignalingLink::new(tx, in_rx);
        assert!(link.send(SignalMessage::Disconnect {
            from: Some(ClientId::from("me"))
        }));
        assert!(rx.try_recv().is_ok());
        drop(rx);
        assert!(!link.send(SignalMessage::Disconnect {
            from: Some(ClientId::from("me"))
        }));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let result = connect("ws://127.0.0.1:1/ws", DEFAULT_PING_INTERVAL).await;
        assert!(result.is_err());
    }
}
