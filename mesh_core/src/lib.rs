//! Shared types for the voice mesh.
//!
//! Everything the signaling, media and coordination crates need to agree on
//! lives here: peer identities, connection and call states, the event
//! vocabulary published to consumers, and the media stream handles.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod bus;
pub mod events;
pub mod media;

// Re-export commonly used types
pub use bus::{EventBus, SubscriptionId};
pub use events::{EventKind, MeshEvent};
pub use media::{resample, LocalStream, RemoteStream};

/// Namespace prefix shared by every identity that takes part in the mesh.
pub const IDENTITY_NAMESPACE: &str = "voice";

// Capture format handed to the media layer
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 1; // Mono capture

/// Represents a buffer of audio samples.
pub type AudioBuffer = Vec<f32>;

/// Identity of a participant as registered with the signaling endpoint.
///
/// The token has the form `voice-<display name>-<unix millis>`. The string is
/// the only source of truth; the display name and creation time are parsed
/// from it on demand. Tokens received from the directory are kept verbatim,
/// whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identity token received from elsewhere
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Build the token for `display_name` created at `timestamp_ms`
    pub fn format(display_name: &str, timestamp_ms: u64) -> Self {
        Self(format!(
            "{}-{}-{}",
            IDENTITY_NAMESPACE, display_name, timestamp_ms
        ))
    }

    /// Mint a fresh token for `display_name` stamped with the current time
    pub fn mint(display_name: &str) -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::format(display_name, now_ms)
    }

    /// The raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token starts with `<namespace>-`
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.0
            .strip_prefix(namespace)
            .map_or(false, |rest| rest.starts_with('-'))
    }

    /// Display name recovered from the token.
    ///
    /// Strips the namespace prefix and a trailing `-<digits>` segment. The
    /// name itself may contain hyphens.
    pub fn display_name(&self) -> String {
        let body = self
            .0
            .strip_prefix(IDENTITY_NAMESPACE)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.0);

        match body.rsplit_once('-') {
            Some((name, stamp)) if is_timestamp(stamp) => name.to_string(),
            _ => body.to_string(),
        }
    }

    /// Creation time encoded in the token, if it carries one
    pub fn created_at_ms(&self) -> Option<u64> {
        let (_, stamp) = self.0.rsplit_once('-')?;
        if is_timestamp(stamp) {
            stamp.parse().ok()
        } else {
            None
        }
    }
}

fn is_timestamp(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// State of the control connection to the signaling endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Lifecycle of a single call session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallState {
    Calling,
    Active,
    Closed,
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Registry-assigned identifier distinguishing successive sessions with the
/// same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of one call session held by the registry.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Remote participant
    pub peer: PeerIdentity,
    /// Registry-assigned session id
    pub id: SessionId,
    /// Who placed the call
    pub direction: CallDirection,
    /// Current lifecycle state
    pub state: CallState,
    /// Remote media, present once the session is active
    pub media: Option<RemoteStream>,
}

/// Unified error type for the mesh crates.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error), // Catch-all for other errors
}
