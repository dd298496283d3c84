#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_core::transport::mock::MockConnectionFactory;
use huddle_core::{
    LocalIdentity, MediaStreamHandle, MeshCollaborators, MeshConfig, MeshEvent, NegotiationPhase,
    PassthroughAudio, PeerManager,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use transport_bus::{Bus, LocalBus};

pub const SETTLE: Duration = Duration::from_secs(5);

pub struct TestPeer {
    pub manager: PeerManager,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub audio: Arc<PassthroughAudio>,
    pub connections: MockConnectionFactory,
}

impl TestPeer {
    pub fn id(&self) -> &str {
        self.manager.local_id()
    }

    /// Waits for the first event matching `pred`, skipping the rest.
    pub async fn expect_event<F>(&mut self, within: Duration, mut pred: F) -> MeshEvent
    where
        F: FnMut(&MeshEvent) -> bool,
    {
        let id = self.id().to_string();
        timeout(within, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream for {id} closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} did not see the expected event"))
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn test_config(room: &str) -> MeshConfig {
    MeshConfig {
        room: room.to_string(),
        ice_servers: Vec::new(),
        ..MeshConfig::default()
    }
}

pub fn brokers(count: usize) -> Vec<Arc<LocalBus>> {
    (0..count)
        .map(|n| Arc::new(LocalBus::named(format!("broker-{n}"))))
        .collect()
}

pub async fn join(peer_id: &str, buses: &[Arc<LocalBus>], config: &MeshConfig) -> TestPeer {
    let (events_tx, events) = mpsc::unbounded_channel();
    let audio = Arc::new(PassthroughAudio::new());
    let connections = MockConnectionFactory::new(peer_id);
    let collaborators = MeshCollaborators {
        brokers: buses
            .iter()
            .map(|bus| Arc::clone(bus) as Arc<dyn Bus>)
            .collect(),
        connections: Arc::new(connections.clone()),
        audio: audio.clone(),
        events: Arc::new(events_tx),
        local_stream: Some(MediaStreamHandle::new(format!("mic-{peer_id}"))),
    };
    let identity = LocalIdentity::new(peer_id.to_uppercase()).with_peer_id(peer_id);
    let manager = PeerManager::join(config.clone(), identity, collaborators)
        .await
        .expect("join room");
    TestPeer {
        manager,
        events,
        audio,
        connections,
    }
}

pub async fn eventually<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    let result = timeout(SETTLE, async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Every peer sees every other peer as connected.
pub fn fully_connected(peers: &[&TestPeer]) -> bool {
    peers.iter().all(|peer| {
        let snapshots = peer.manager.peers();
        snapshots.len() == peers.len() - 1
            && snapshots
                .iter()
                .all(|snapshot| snapshot.phase == NegotiationPhase::Connected)
    })
}
