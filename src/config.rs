use std::time::Duration;

use url::Url;

use crate::error::SessionError;
use crate::types::{Role, DEFAULT_ICE_SERVERS};

/// Path appended to a bare server address to reach the signaling endpoint.
pub const DEFAULT_SIGNALING_PATH: &str = "/ws";

/// How often to send a WebSocket ping to keep the connection alive.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide client settings, fixed for the lifetime of a session handle.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// STUN URLs used for candidate gathering. No TURN relay is configured by
    /// default; peers behind symmetric NAT stay in `connecting` and fail.
    pub ice_servers: Vec<String>,
    pub signaling_path: String,
    pub ping_interval: Duration,
    /// Microphone by name; `None` picks the system default.
    pub input_device: Option<String>,
    pub noise_suppression: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            signaling_path: DEFAULT_SIGNALING_PATH.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            input_device: None,
            noise_suppression: false,
        }
    }
}

/// Parameters of a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_url: String,
    pub role: Role,
}

impl SessionConfig {
    pub fn signaling_url(&self, signaling_path: &str) -> Result<String, SessionError> {
        signaling_url(&self.server_url, signaling_path)
    }
}

/// Turns a stage address into the signaling endpoint.
///
/// `http`/`https` become `ws`/`wss`, a missing scheme defaults to `ws`, and
/// `signaling_path` is appended only when the address has no path of its own.
pub fn signaling_url(server_url: &str, signaling_path: &str) -> Result<String, SessionError> {
    let trimmed = server_url.trim();
    if trimmed.is_empty() {
        return Err(SessionError::MissingServerUrl);
    }

    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("ws://") || lower.starts_with("wss://") {
        trimmed.to_string()
    } else if lower.starts_with("https://") {
        format!("wss://{}", &trimmed["https://".len()..])
    } else if lower.starts_with("http://") {
        format!("ws://{}", &trimmed["http://".len()..])
    } else {
        format!("ws://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|source| SessionError::InvalidServerUrl {
        url: trimmed.to_string(),
        source,
    })?;

    if matches!(url.path(), "" | "/") && !signaling_path.is_empty() {
        let path = if signaling_path.starts_with('/') {
            signaling_path.to_string()
        } else {
            format!("/{signaling_path}")
        };
        url.set_path(&path);
    }

    Ok(url.to_string())
}
