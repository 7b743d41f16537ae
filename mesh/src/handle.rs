use crate::commands::MeshCommand;
use crate::MeshSnapshot;
use mesh_core::{Error, EventKind, MeshEvent, SubscriptionId};
use tokio::sync::{mpsc, oneshot};

/// Cloneable front door of a [`crate::MeshCoordinator`]
#[derive(Clone, Debug)]
pub struct MeshHandle {
    commands: mpsc::Sender<MeshCommand>,
}

fn stopped() -> Error {
    Error::InvalidState("Mesh coordinator has stopped".to_string())
}

impl MeshHandle {
    pub(crate) fn new(commands: mpsc::Sender<MeshCommand>) -> Self {
        Self { commands }
    }

    async fn send(&self, command: MeshCommand) -> Result<(), Error> {
        self.commands.send(command).await.map_err(|_| stopped())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> MeshCommand,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| stopped())
    }

    /// Acquire the local capture and start connecting as `display_name`.
    ///
    /// Resolves once capture is running; signaling and mesh formation carry
    /// on in the background and are observable through events. Fails with
    /// [`Error::Capture`] when the device cannot be opened, and with
    /// [`Error::Cancelled`] when `leave()` interrupts it.
    pub async fn join(&self, display_name: &str) -> Result<(), Error> {
        let display_name = display_name.to_string();
        self.request(|reply| MeshCommand::Join {
            display_name,
            reply,
        })
        .await?
    }

    /// Close every session, disconnect and release capture. A no-op while
    /// not joined.
    pub async fn leave(&self) -> Result<(), Error> {
        self.request(|reply| MeshCommand::Leave { reply }).await
    }

    /// Silence outbound audio without touching any session
    pub async fn set_muted(&self, muted: bool) -> Result<(), Error> {
        self.send(MeshCommand::SetMuted(muted)).await
    }

    /// Register `handler` for events of `kind`
    pub async fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<SubscriptionId, Error>
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.request(|reply| MeshCommand::Subscribe {
            kind,
            handler: Box::new(handler),
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> Result<bool, Error> {
        self.request(|reply| MeshCommand::Unsubscribe { kind, id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, Error> {
        self.request(|reply| MeshCommand::Snapshot { reply }).await
    }

    /// Leave and stop the coordinator
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.send(MeshCommand::Shutdown).await
    }
}
