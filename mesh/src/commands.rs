//! Messages understood by the coordinator.

use crate::MeshSnapshot;
use mesh_core::{Error, EventKind, MeshEvent, SubscriptionId};
use tokio::sync::oneshot;

/// Event handler registered through a handle
pub type Handler = Box<dyn Fn(&MeshEvent) + Send + Sync>;

/// Commands sent from a [`crate::MeshHandle`] to the coordinator
pub enum MeshCommand {
    /// Acquire capture and start connecting as `display_name`
    Join {
        display_name: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Tear everything down; interrupts a join in flight
    Leave { reply: oneshot::Sender<()> },
    SetMuted(bool),
    Subscribe {
        kind: EventKind,
        handler: Handler,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        kind: EventKind,
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot { reply: oneshot::Sender<MeshSnapshot> },
    /// Leave and stop the coordinator
    Shutdown,
}

impl std::fmt::Debug for MeshCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshCommand::Join { display_name, .. } => write!(f, "Join({})", display_name),
            MeshCommand::Leave { .. } => write!(f, "Leave"),
            MeshCommand::SetMuted(muted) => write!(f, "SetMuted({})", muted),
            MeshCommand::Subscribe { kind, .. } => write!(f, "Subscribe({})", kind),
            MeshCommand::Unsubscribe { kind, id, .. } => write!(f, "Unsubscribe({}, {:?})", kind, id),
            MeshCommand::Snapshot { .. } => write!(f, "Snapshot"),
            MeshCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}
