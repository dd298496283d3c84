mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};
use transport_bus::{Bus, LocalBus};

use crate::cli::{Cli, Commands};
use huddle_core::telemetry::init_tracing;
use huddle_core::transport::{Backend, connection_factory};
use huddle_core::{
    LocalIdentity, MediaStreamHandle, MeshCollaborators, MeshConfig, MeshEvent, NegotiationPhase,
    PassthroughAudio, PeerManager,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = MeshConfig::from_env();
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Config => {
            config.validate()?;
            println!("{config:#?}");
            println!("topic: {}", config.topic());
            Ok(())
        }
        Commands::Demo {
            peers,
            brokers,
            room,
            drop_broker,
            backend,
        } => {
            let mut config = config;
            if let Some(room) = room {
                config.room = room;
            }
            run_demo(config, peers, brokers, drop_broker, backend.into()).await
        }
    }
}

async fn run_demo(
    config: MeshConfig,
    peers: usize,
    brokers: usize,
    drop_broker: bool,
    backend: Backend,
) -> Result<()> {
    if peers < 2 {
        bail!("the demo needs at least two peers");
    }
    if brokers == 0 {
        bail!("the demo needs at least one broker");
    }

    info!(target = "demo", backend = ?backend, ice_servers = ?config.ice_servers, "starting demo");
    let buses: Vec<Arc<LocalBus>> = (0..brokers)
        .map(|n| Arc::new(LocalBus::named(format!("broker-{n}"))))
        .collect();

    let mut managers = Vec::with_capacity(peers);
    for n in 0..peers {
        let name = format!("peer-{n}");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(log_events(name.clone(), events_rx));
        let collaborators = MeshCollaborators {
            brokers: buses
                .iter()
                .map(|bus| Arc::clone(bus) as Arc<dyn Bus>)
                .collect(),
            connections: connection_factory(backend, &name, &config),
            audio: Arc::new(PassthroughAudio::new()),
            events: Arc::new(events_tx),
            local_stream: Some(MediaStreamHandle::new(format!("mic-{n}"))),
        };
        let manager = PeerManager::join(config.clone(), LocalIdentity::new(name), collaborators)
            .await
            .context("failed to join demo room")?;
        managers.push(manager);
    }

    wait_for("full mesh", || {
        managers.iter().all(|manager| {
            let peers = manager.peers();
            peers.len() == managers.len() - 1
                && peers
                    .iter()
                    .all(|peer| peer.phase == NegotiationPhase::Connected)
        })
    })
    .await?;
    info!(target = "demo", peers = managers.len(), "mesh connected");

    let host = &managers[0];
    let guest = &managers[1];

    host.set_room_lock(true).await?;
    wait_for("room lock", || managers.iter().all(|m| m.control().room_locked)).await?;

    guest.set_hand_raised(true).await?;
    wait_for("raised hand", || {
        managers.iter().all(|m| m.control().raised_hands.len() == 1)
    })
    .await?;

    let mute_all = host.request_mute_all().await?;
    wait_for("mute-all delivery", || {
        managers[1..]
            .iter()
            .all(|m| m.control().pending_mute_all_requests.contains_key(&mute_all))
    })
    .await?;
    for manager in &managers[1..] {
        manager.respond_mute_all(&mute_all, true).await?;
    }

    let request_id = host.request_remote_mic(guest.local_id()).await?;
    wait_for("remote mic request", || {
        guest
            .control()
            .pending_remote_mic_requests
            .contains_key(&request_id)
    })
    .await?;
    guest.respond_remote_mic(&request_id, true).await?;
    wait_for("remote mic live", || host.control().remote_mic_live).await?;
    host.stop_remote_mic().await?;

    if drop_broker {
        if let Some(first) = buses.first() {
            first.set_connected(false);
            warn!(target = "demo", broker = first.id(), "broker disconnected");
        }
        host.set_room_lock(false).await?;
        wait_for("unlock over remaining brokers", || {
            managers.iter().all(|m| !m.control().room_locked)
        })
        .await?;
        info!(target = "demo", transport_up = host.is_transport_up(), "room unlocked");
    }

    for manager in managers {
        manager.leave().await?;
    }
    // Let the event loggers drain.
    sleep(Duration::from_millis(50)).await;
    Ok(())
}

async fn log_events(peer: String, mut events: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target = "demo", peer = %peer, event = %json),
            Err(err) => warn!(target = "demo", peer = %peer, error = %err, "unserializable event"),
        }
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
