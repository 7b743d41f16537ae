//! End-to-end mesh scenarios over the in-memory signaling hub.

use async_trait::async_trait;
use audio::{CaptureBackend, MediaCaptureController, SyntheticCapture, Waveform};
use mesh::{MeshCoordinator, MeshHandle, MeshSnapshot};
use mesh_core::{
    CallDirection, CallState, ConnectionState, Error, EventKind, LocalStream, MeshEvent,
    PeerIdentity,
};
use network::memory::MemoryHub;
use network::NetworkStack;
use settings_manager::Settings;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.discovery.delay_ms = 20;
    settings.reconnect.base_delay_ms = 20;
    settings
}

struct Client {
    handle: MeshHandle,
    events: Arc<Mutex<Vec<MeshEvent>>>,
}

impl Client {
    async fn start(hub: &MemoryHub, backend: Box<dyn CaptureBackend>) -> Self {
        Self::start_with(hub, backend, &settings()).await
    }

    async fn start_with(
        hub: &MemoryHub,
        backend: Box<dyn CaptureBackend>,
        settings: &Settings,
    ) -> Self {
        let capture = MediaCaptureController::new(backend);
        let (handle, _task) =
            MeshCoordinator::spawn(settings, NetworkStack::in_memory(hub), capture);

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = events.clone();
            handle
                .subscribe(kind, move |event| sink.lock().unwrap().push(event.clone()))
                .await
                .unwrap();
        }
        Self { handle, events }
    }

    async fn speaking(hub: &MemoryHub) -> Self {
        Self::start(
            hub,
            Box::new(SyntheticCapture::new(20, Waveform::Noise, 0.5)),
        )
        .await
    }

    fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    fn saw(&self, predicate: impl Fn(&MeshEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }

    async fn wait_for(&self, what: &str, condition: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = self.handle.snapshot().await.unwrap();
            if condition(&snapshot) {
                return snapshot;
            }
            if Instant::now() > deadline {
                panic!("Timed out waiting for {}: {:?}", what, snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_event(&self, what: &str, predicate: impl Fn(&MeshEvent) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.saw(&predicate) {
            if Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Join and wait for the first discovery round
    async fn join(&self, name: &str) -> PeerIdentity {
        self.handle.join(name).await.unwrap();
        let snapshot = self
            .wait_for("discovery", |s| {
                s.state == ConnectionState::Connected && s.discovery_rounds >= 1
            })
            .await;
        snapshot.local_identity.unwrap()
    }
}

fn active(snapshot: &MeshSnapshot) -> usize {
    snapshot
        .sessions
        .iter()
        .filter(|s| s.state == CallState::Active)
        .count()
}

fn direction_to(snapshot: &MeshSnapshot, peer: &PeerIdentity) -> CallDirection {
    snapshot
        .sessions
        .iter()
        .find(|s| &s.peer == peer)
        .map(|s| s.direction)
        .unwrap_or_else(|| panic!("No session with {}", peer))
}

/// Capture that cannot open a device
struct BrokenCapture;

#[async_trait]
impl CaptureBackend for BrokenCapture {
    async fn start(&mut self) -> Result<LocalStream, Error> {
        Err(Error::Capture("permission denied".to_string()))
    }

    fn stop(&mut self) {}
}

/// Capture whose device never answers
struct StuckCapture;

#[async_trait]
impl CaptureBackend for StuckCapture {
    async fn start(&mut self) -> Result<LocalStream, Error> {
        std::future::pending().await
    }

    fn stop(&mut self) {}
}

#[test_log::test(tokio::test)]
async fn three_clients_form_a_full_mesh() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;
    let b = Client::speaking(&hub).await;
    let c = Client::speaking(&hub).await;

    let a_id = a.join("alice").await;

    let b_id = b.join("bob").await;
    b.wait_for("bob in a call", |s| active(s) == 1).await;
    a.wait_for("alice in a call", |s| active(s) == 1).await;

    let c_id = c.join("carol").await;
    let c_view = c.wait_for("carol meshed", |s| active(s) == 2).await;
    let a_view = a.wait_for("alice meshed", |s| active(s) == 2).await;
    let b_view = b.wait_for("bob meshed", |s| active(s) == 2).await;

    for view in [&a_view, &b_view, &c_view] {
        let peers: HashSet<&PeerIdentity> = view.sessions.iter().map(|s| &s.peer).collect();
        assert_eq!(peers.len(), 2, "duplicate sessions: {:?}", view.sessions);
        assert_eq!(view.sessions.len(), 2);
    }

    // Earlier participants are called; they never dial newcomers
    assert_eq!(direction_to(&a_view, &b_id), CallDirection::Inbound);
    assert_eq!(direction_to(&a_view, &c_id), CallDirection::Inbound);
    assert_eq!(direction_to(&b_view, &a_id), CallDirection::Outbound);
    assert_eq!(direction_to(&b_view, &c_id), CallDirection::Inbound);
    assert_eq!(direction_to(&c_view, &a_id), CallDirection::Outbound);
    assert_eq!(direction_to(&c_view, &b_id), CallDirection::Outbound);

    // Discovery only runs after connecting
    assert_eq!(a_view.discovery_rounds, 1);
    assert_eq!(b_view.discovery_rounds, 1);

    for client in [&a, &b, &c] {
        assert_eq!(client.count(EventKind::PeerJoined), 2);
        assert_eq!(client.count(EventKind::Stream), 2);
        assert_eq!(client.count(EventKind::PeerLeft), 0);
        assert_eq!(client.count(EventKind::Connected), 1);
    }
    assert!(a.saw(|e| matches!(e, MeshEvent::PeerJoined { display_name, .. } if display_name == "carol")));
}

#[test_log::test(tokio::test)]
async fn remote_voice_is_reported_as_speaking() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;
    let b = Client::speaking(&hub).await;

    a.join("alice").await;
    let b_id = b.join("bob").await;

    a.wait_for_event("bob speaking", |e| {
        matches!(e, MeshEvent::SpeakingChanged { peer, is_speaking: true } if peer == &b_id)
    })
    .await;

    // Muting sends silence, which ends the speaking state on the other side
    b.handle.set_muted(true).await.unwrap();
    a.wait_for_event("bob silent", |e| {
        matches!(e, MeshEvent::SpeakingChanged { peer, is_speaking: false } if peer == &b_id)
    })
    .await;
    assert!(b.handle.snapshot().await.unwrap().muted);
}

#[test_log::test(tokio::test)]
async fn leaving_tears_down_both_sides() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;
    let b = Client::speaking(&hub).await;

    a.join("alice").await;
    let b_id = b.join("bob").await;
    a.wait_for("alice in a call", |s| active(s) == 1).await;

    b.handle.leave().await.unwrap();

    let b_view = b.handle.snapshot().await.unwrap();
    assert!(!b_view.joined);
    assert!(b_view.sessions.is_empty());
    assert_eq!(b_view.state, ConnectionState::Disconnected);
    assert_eq!(b.count(EventKind::Disconnected), 1);
    assert_eq!(b.count(EventKind::PeerLeft), 1);

    a.wait_for("alice alone", |s| s.sessions.is_empty()).await;
    assert!(a.saw(|e| matches!(e, MeshEvent::PeerLeft { peer } if peer == &b_id)));
    assert!(!hub.peers().contains(&b_id));

    // Bob's detector on Alice's side is gone with the session
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let events = a.events.lock().unwrap();
        let left_at = events
            .iter()
            .position(|e| matches!(e, MeshEvent::PeerLeft { peer } if peer == &b_id))
            .unwrap();
        let late = events[left_at..].iter().any(
            |e| matches!(e, MeshEvent::SpeakingChanged { peer, .. } if peer == &b_id),
        );
        assert!(!late, "speaking reported after bob left: {:?}", &events[left_at..]);
    }

    // Leaving twice is a no-op
    b.handle.leave().await.unwrap();
    assert_eq!(b.count(EventKind::Disconnected), 1);
}

#[test_log::test(tokio::test)]
async fn leave_before_join_is_a_no_op() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;

    a.handle.leave().await.unwrap();

    let view = a.handle.snapshot().await.unwrap();
    assert!(!view.joined);
    assert_eq!(view.state, ConnectionState::Disconnected);
    assert!(a.events.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn capture_failure_fails_join_without_side_effects() {
    let hub = MemoryHub::new();
    let a = Client::start(&hub, Box::new(BrokenCapture)).await;

    match a.handle.join("alice").await {
        Err(Error::Capture(msg)) => assert!(msg.contains("permission denied")),
        other => panic!("Expected capture error, got {:?}", other),
    }

    let view = a.handle.snapshot().await.unwrap();
    assert!(!view.joined);
    assert_eq!(view.state, ConnectionState::Disconnected);
    assert!(hub.peers().is_empty());
    assert!(a.events.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn leave_interrupts_a_pending_join() {
    let hub = MemoryHub::new();
    let a = Client::start(&hub, Box::new(StuckCapture)).await;

    let handle = a.handle.clone();
    let join = tokio::spawn(async move { handle.join("alice").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!join.is_finished());

    a.handle.leave().await.unwrap();

    match join.await.unwrap() {
        Err(Error::Cancelled) => {}
        other => panic!("Expected cancelled join, got {:?}", other),
    }
    assert!(hub.peers().is_empty());
    assert!(!a.handle.snapshot().await.unwrap().joined);
}

#[test_log::test(tokio::test)]
async fn reconnect_rediscovers_without_duplicate_calls() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;
    let b = Client::speaking(&hub).await;

    a.join("alice").await;
    let b_id = b.join("bob").await;
    b.wait_for("bob in a call", |s| active(s) == 1).await;

    assert!(hub.sever(&b_id));

    let view = b
        .wait_for("bob back online", |s| {
            s.state == ConnectionState::Connected && s.discovery_rounds == 2
        })
        .await;
    assert_ne!(view.local_identity.as_ref(), Some(&b_id));
    assert_eq!(view.sessions.len(), 1);
    assert_eq!(active(&view), 1);
    assert_eq!(b.count(EventKind::Connected), 2);
    assert_eq!(b.count(EventKind::PeerJoined), 1);
    assert_eq!(b.count(EventKind::Disconnected), 0);
}

#[test_log::test(tokio::test)]
async fn exhausted_reconnects_stay_silent() {
    let hub = MemoryHub::new();
    hub.refuse_connections(true);
    let a = Client::speaking(&hub).await;

    a.handle.join("alice").await.unwrap();
    let view = a
        .wait_for("alice to give up", |s| s.state == ConnectionState::Disconnected)
        .await;

    assert!(view.joined);
    assert_eq!(view.discovery_rounds, 0);
    assert!(a.events.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn joining_again_after_giving_up_reconnects() {
    let hub = MemoryHub::new();
    hub.refuse_connections(true);
    let a = Client::speaking(&hub).await;

    a.handle.join("alice").await.unwrap();
    a.wait_for("alice to give up", |s| s.state == ConnectionState::Disconnected)
        .await;

    hub.refuse_connections(false);
    a.handle.join("alice").await.unwrap();
    let view = a
        .wait_for("alice online", |s| {
            s.state == ConnectionState::Connected && s.discovery_rounds >= 1
        })
        .await;
    assert!(view.joined);
    assert!(hub.peers().contains(view.local_identity.as_ref().unwrap()));
    assert_eq!(a.count(EventKind::Connected), 1);
}

#[test_log::test(tokio::test)]
async fn simultaneous_discovery_still_connects() {
    let hub = MemoryHub::new();
    let mut slow = settings();
    slow.discovery.delay_ms = 200;
    slow.call_timeout_ms = 500;
    let noise = || Box::new(SyntheticCapture::new(20, Waveform::Noise, 0.5));
    let a = Client::start_with(&hub, noise(), &slow).await;
    let b = Client::start_with(&hub, noise(), &slow).await;

    // Both are online before either looks at the directory, so each calls the other
    a.handle.join("alice").await.unwrap();
    b.handle.join("bob").await.unwrap();

    let a_view = a.wait_for("alice meshed", |s| active(s) == 1).await;
    let b_view = b.wait_for("bob meshed", |s| active(s) == 1).await;
    assert_eq!(a_view.sessions.len(), 1);
    assert_eq!(b_view.sessions.len(), 1);
    assert_ne!(a_view.sessions[0].direction, b_view.sessions[0].direction);

    // Still together once the abandoned call would have timed out
    tokio::time::sleep(Duration::from_millis(800)).await;
    for client in [&a, &b] {
        let view = client.handle.snapshot().await.unwrap();
        assert_eq!(active(&view), 1);
        assert_eq!(client.count(EventKind::PeerJoined), 1);
        assert_eq!(client.count(EventKind::PeerLeft), 0);
    }
}

#[test_log::test(tokio::test)]
async fn failed_discovery_is_silent() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;
    let b = Client::speaking(&hub).await;

    a.join("alice").await;
    hub.set_listing_unavailable(true);
    b.join("bob").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    for client in [&a, &b] {
        let view = client.handle.snapshot().await.unwrap();
        assert_eq!(view.state, ConnectionState::Connected);
        assert!(view.sessions.is_empty());
        assert_eq!(client.count(EventKind::Connected), 1);
        assert_eq!(client.events.lock().unwrap().len(), 1);
    }
}

#[test_log::test(tokio::test)]
async fn unsubscribed_handlers_stop_hearing_events() {
    let hub = MemoryHub::new();
    let a = Client::speaking(&hub).await;

    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    let id = a
        .handle
        .subscribe(EventKind::Connected, move |_| *counter.lock().unwrap() += 1)
        .await
        .unwrap();
    assert!(a.handle.unsubscribe(EventKind::Connected, id).await.unwrap());
    assert!(!a.handle.unsubscribe(EventKind::Connected, id).await.unwrap());

    a.join("alice").await;
    assert_eq!(a.count(EventKind::Connected), 1);
    assert_eq!(*seen.lock().unwrap(), 0);
}
