//! Participant list maintained from mesh events.

use mesh_core::{MeshEvent, PeerIdentity};
use serde::Serialize;
use std::collections::HashMap;

/// One row of the participant list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub identity: PeerIdentity,
    pub display_name: String,
    pub is_self: bool,
    pub is_speaking: bool,
    /// Only tracked for the local participant
    pub muted: bool,
}

/// Who is in the mesh, as seen by one participant
#[derive(Debug, Default)]
pub struct Roster {
    local: Option<Participant>,
    remote: HashMap<PeerIdentity, Participant>,
    muted: bool,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from an event. Returns whether the list changed.
    pub fn apply(&mut self, event: &MeshEvent) -> bool {
        match event {
            MeshEvent::Connected { id } => {
                self.local = Some(Participant {
                    identity: id.clone(),
                    display_name: id.display_name(),
                    is_self: true,
                    is_speaking: false,
                    muted: self.muted,
                });
                true
            }
            MeshEvent::PeerJoined { peer, display_name } => {
                self.remote.insert(
                    peer.clone(),
                    Participant {
                        identity: peer.clone(),
                        display_name: display_name.clone(),
                        is_self: false,
                        is_speaking: false,
                        muted: false,
                    },
                );
                true
            }
            MeshEvent::PeerLeft { peer } => self.remote.remove(peer).is_some(),
            MeshEvent::SpeakingChanged { peer, is_speaking } => match self.remote.get_mut(peer) {
                Some(p) if p.is_speaking != *is_speaking => {
                    p.is_speaking = *is_speaking;
                    true
                }
                _ => false,
            },
            MeshEvent::Disconnected => {
                let changed = self.local.is_some() || !self.remote.is_empty();
                self.local = None;
                self.remote.clear();
                changed
            }
            MeshEvent::Stream { .. } => false,
        }
    }

    /// Record the local mute flag
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(local) = &mut self.local {
            local.muted = muted;
        }
    }

    /// Self first, then remote participants by display name
    pub fn participants(&self) -> Vec<Participant> {
        let mut remote: Vec<Participant> = self.remote.values().cloned().collect();
        remote.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        self.local.iter().cloned().chain(remote).collect()
    }

    /// Number of participants, self included
    pub fn len(&self) -> usize {
        self.remote.len() + usize::from(self.local.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
