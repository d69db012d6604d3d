pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod platform;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod types;

pub use config::ClientConfig;
pub use error::SessionError;
pub use platform::Platform;
pub use session::{SessionHandle, SessionStatus};
pub use types::{PeerConnectionState, Role};
