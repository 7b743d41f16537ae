//! Network communication for huddle
//!
//! This crate handles everything that talks to other machines:
//! the signaling link and its reconnection policy, peer discovery, the call
//! registry and the WebRTC media sessions behind it.

use mesh_core::Error;
use settings_manager::Settings;
use std::sync::Arc;

pub mod codec;
pub mod directory;
pub mod peerjs;
pub mod reconnect;
pub mod registry;
pub mod signaling;
pub mod webrtc_if;

#[cfg(any(test, feature = "test_utils"))]
pub mod memory;

// Re-export commonly used types
pub use directory::{filter_candidates, HttpPeerListing, PeerDirectory, PeerListing};
pub use peerjs::PeerJsTransport;
pub use reconnect::ReconnectPolicy;
pub use registry::{
    CallConnector, CallLink, CallRegistry, SessionChange, SessionContext, SessionEvent,
    SessionEventKind,
};
pub use signaling::{
    ConnectAttempt, ConnectOutcome, LinkStep, Signal, SignalBody, SignalingChannel,
    SignalingLink, SignalingTransport, TransportEvent, TransportEventKind,
};
pub use webrtc_if::WebRtcConnector;

/// The three network seams a mesh runs on
#[derive(Clone)]
pub struct NetworkStack {
    pub transport: Arc<dyn SignalingTransport>,
    pub listing: Arc<dyn PeerListing>,
    pub connector: Arc<dyn CallConnector>,
}

impl NetworkStack {
    /// PeerJS signaling, HTTP discovery and WebRTC media as configured
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let listing = HttpPeerListing::new(
            &settings.signaling,
            settings.discovery.request_timeout(),
        )?;
        let connector = WebRtcConnector::new(&settings.ice_servers)?;

        Ok(Self {
            transport: Arc::new(PeerJsTransport::new(settings.signaling.clone())),
            listing: Arc::new(listing),
            connector: Arc::new(connector),
        })
    }

    /// Everything in-process, backed by `hub`
    #[cfg(any(test, feature = "test_utils"))]
    pub fn in_memory(hub: &memory::MemoryHub) -> Self {
        Self {
            transport: Arc::new(hub.transport()),
            listing: Arc::new(hub.listing()),
            connector: Arc::new(hub.connector()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stack_from_default_settings() {
        assert!(NetworkStack::from_settings(&Settings::default()).is_ok());
    }
}
