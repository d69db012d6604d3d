use thiserror::Error;

use crate::negotiation::NegotiationState;

/// Reasons a session request is refused before any I/O happens.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server URL is required")]
    MissingServerUrl,

    #[error("invalid server URL '{url}': {source}")]
    InvalidServerUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("session already active ({0})")]
    SessionActive(NegotiationState),

    #[error("no peer transport for this session")]
    PeerUnavailable,

    #[error("signaling channel is not open")]
    SignalingUnavailable,
}
