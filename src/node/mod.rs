// Copyright (c) 2024 Botho Foundation

//! The node orchestrator: wires C1-C7 together behind a single handle.
//! Structured after this crate's previous `node/mod.rs`, which likewise held
//! the long-lived shared state behind `Arc`s and drove it from a small set
//! of background tasks; generalized here from a blockchain node into the
//! overlay's seven components, with every cross-component callback routed
//! through one internal event channel rather than ad hoc listener lists
//! (§9 "event-driven callbacks").

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::connection_manager::{ConnectionManager, ConnectionManagerConfig, ConnRole, ManagerEvent};
use crate::dht::{self, Dht};
use crate::peer_connection::{PeerConnection, PeerConnectionEvent};
use crate::peer_id::PeerId;
use crate::router::{Router, RouterEvent};
use crate::signaling::{self, SignalingEvent, SignalingFrame};
use crate::store::{
    ChaChaCryptoProvider, CryptoCollaborator, HeedPersistence, PersistenceCollaborator,
    ReplicatedStore,
};

const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

fn default_ice_servers() -> Vec<String> {
    vec![DEFAULT_ICE_SERVER.to_string()]
}

/// Snapshot surface for operators (SPEC_FULL.md supplement 4).
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub connected_peers: usize,
}

/// Internal events fed into the node's single dispatch loop, unifying the
/// manager, router, signaling, and per-link event streams.
enum Internal {
    Manager(ManagerEvent),
    Router(RouterEvent),
    Signaling(SignalingEvent),
    Link(PeerId, PeerConnectionEvent),
}

/// The main PeerPigeon node: owns every component and the channels that
/// connect them.
pub struct Node {
    pub self_id: PeerId,
    connections: Arc<ConnectionManager>,
    links: Arc<DashMap<PeerId, Arc<PeerConnection>>>,
    router: Arc<Router>,
    dht: Arc<Dht>,
    pub store: ReplicatedStore,
    signaling_outbound: mpsc::Sender<SignalingFrame>,
    shutdown: Arc<AtomicBool>,
}

impl Node {
    pub async fn new(config: NodeConfig, data_dir_override: Option<PathBuf>) -> Result<Self> {
        let self_id = config.peer_id.unwrap_or_else(PeerId::new_random);
        info!(peer_id = %self_id, "starting peerpigeon node");

        let (manager_tx, manager_rx) = mpsc::channel(256);
        let connections = Arc::new(ConnectionManager::new(
            self_id,
            ConnectionManagerConfig {
                min_peers: config.min_peers,
                max_peers: config.max_peers,
                auto_connect: config.auto_connect,
                auto_discovery: config.auto_discovery,
                eviction_enabled: config.eviction_enabled,
                xor_routing_enabled: config.xor_routing_enabled,
            },
            manager_tx,
        ));

        let links: Arc<DashMap<PeerId, Arc<PeerConnection>>> = Arc::new(DashMap::new());
        let (router_tx, router_rx) = mpsc::channel(256);
        let router = Arc::new(Router::new(
            self_id,
            Arc::clone(&connections),
            Arc::clone(&links),
            config.seen_set_capacity,
            router_tx,
        ));

        let known_peers = {
            let connections = Arc::clone(&connections);
            Arc::new(move || connections.connected_peers())
        };
        let dht = Dht::new(self_id, Arc::clone(&router), known_peers, config.replication_factor);
        dht::spawn_ttl_sweeper(Arc::clone(&dht), config.ttl_sweep_interval());

        let data_dir = data_dir_override.unwrap_or_else(|| config.data_dir.clone());
        let persistence: Arc<dyn PersistenceCollaborator> = Arc::new(
            HeedPersistence::open(&data_dir.join("store")).context("opening replicated store")?,
        );
        let crypto: Arc<dyn CryptoCollaborator> =
            Arc::new(ChaChaCryptoProvider::new(process_seal_key(self_id)));
        let store = ReplicatedStore::new(self_id, Arc::clone(&dht), crypto, persistence);

        let signaling = signaling::spawn(
            config.hub_uri.clone(),
            self_id,
            config.reconnect_backoff_base(),
            config.reconnect_backoff_cap(),
            config.max_reconnect_attempts,
        );

        let signaling_outbound = signaling.outbound_sender();

        let (internal_tx, internal_rx) = mpsc::channel(512);
        forward(manager_rx, internal_tx.clone(), Internal::Manager);
        forward(router_rx, internal_tx.clone(), Internal::Router);
        forward(signaling.events, internal_tx.clone(), Internal::Signaling);

        spawn_dispatch_loop(
            self_id,
            Arc::clone(&connections),
            Arc::clone(&router),
            Arc::clone(&dht),
            Arc::clone(&links),
            signaling_outbound.clone(),
            internal_tx,
            internal_rx,
        );
        spawn_health_sweep(Arc::clone(&connections));

        Ok(Self {
            self_id,
            connections,
            links,
            router,
            dht,
            store,
            signaling_outbound,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn dht(&self) -> Arc<Dht> {
        Arc::clone(&self.dht)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats { connected_peers: self.connections.connected_count() }
    }

    /// Orderly shutdown (§5, SPEC_FULL.md supplement 3): broadcasts
    /// `Goodbye`, then closes every live transport link.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.send_goodbye().await;
        let _ = self.signaling_outbound.send(SignalingFrame::Goodbye { peer_id: self.self_id }).await;

        for entry in self.links.iter() {
            entry.value().close("local_shutdown").await;
        }
        self.links.clear();
        info!("node shutdown complete");
    }
}

fn process_seal_key(self_id: PeerId) -> [u8; 32] {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(b"peerpigeon-store-key");
    hasher.update(self_id.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&digest);
    key
}

/// Spawns a task that relays every message from `rx` into `into` wrapped by
/// `wrap`, so heterogeneous component event streams can be merged into the
/// node's single dispatch loop.
fn forward<T, U>(mut rx: mpsc::Receiver<T>, into: mpsc::Sender<U>, wrap: fn(T) -> U)
where
    T: Send + 'static,
    U: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if into.send(wrap(item)).await.is_err() {
                break;
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn spawn_dispatch_loop(
    self_id: PeerId,
    connections: Arc<ConnectionManager>,
    router: Arc<Router>,
    dht: Arc<Dht>,
    links: Arc<DashMap<PeerId, Arc<PeerConnection>>>,
    signaling_outbound: mpsc::Sender<SignalingFrame>,
    internal_tx: mpsc::Sender<Internal>,
    mut internal_rx: mpsc::Receiver<Internal>,
) {
    tokio::spawn(async move {
        while let Some(event) = internal_rx.recv().await {
            match event {
                Internal::Signaling(SignalingEvent::FrameReceived(frame)) => {
                    handle_signaling_frame(
                        self_id,
                        frame,
                        &connections,
                        &router,
                        &links,
                        &signaling_outbound,
                        &internal_tx,
                    )
                    .await;
                }
                Internal::Signaling(SignalingEvent::Authenticated) => {
                    info!("signaling authenticated");
                }
                Internal::Signaling(SignalingEvent::Disconnected(reason)) => {
                    warn!(reason, "signaling link down");
                }
                Internal::Manager(ManagerEvent::ConnectRequested(peer, ConnRole::Initiator)) => {
                    initiate_connection(self_id, peer, &links, &router, &signaling_outbound, &internal_tx).await;
                }
                Internal::Manager(ManagerEvent::ConnectRequested(_, ConnRole::Responder)) => {}
                Internal::Manager(ManagerEvent::PeerEvicted(peer))
                | Internal::Manager(ManagerEvent::PeerDisconnected(peer, _)) => {
                    if let Some((_, link)) = links.remove(&peer) {
                        link.close("evicted").await;
                    }
                    router.remove_link(&peer);
                    dht.remove_remote_subscriber(peer);
                }
                Internal::Manager(ManagerEvent::DataChannelReady(peer)) => {
                    connections.on_data_channel_ready(peer);
                }
                Internal::Manager(ManagerEvent::PeerConnected(peer)) => {
                    info!(peer = %peer, "peer connected");
                }
                Internal::Router(RouterEvent::Protocol(envelope)) => {
                    dht.handle_envelope(envelope).await;
                }
                Internal::Router(RouterEvent::Delivered { .. }) => {}
                Internal::Router(RouterEvent::PeerSaidGoodbye(peer)) => {
                    connections.on_disconnected(peer, "goodbye");
                }
                Internal::Link(peer, PeerConnectionEvent::ChannelOpen(_)) => {
                    connections.on_connected(peer, links_role(&links, peer));
                    connections.on_data_channel_ready(peer);
                }
                Internal::Link(from, PeerConnectionEvent::EnvelopeReceived(_, envelope)) => {
                    router.handle_incoming(from, envelope).await;
                }
                Internal::Link(peer, PeerConnectionEvent::Disconnected(_, reason)) => {
                    connections.on_disconnected(peer, &reason);
                    links.remove(&peer);
                    router.remove_link(&peer);
                    dht.remove_remote_subscriber(peer);
                }
                Internal::Link(peer, PeerConnectionEvent::StreamAborted(_, stream_id)) => {
                    warn!(peer = %peer, stream_id, "stream reassembly aborted");
                }
            }
        }
    });
}

fn links_role(links: &DashMap<PeerId, Arc<PeerConnection>>, peer: PeerId) -> ConnRole {
    links.get(&peer).map(|l| ConnRole::from(l.role)).unwrap_or(ConnRole::Responder)
}

impl From<crate::peer_connection::Role> for ConnRole {
    fn from(role: crate::peer_connection::Role) -> Self {
        match role {
            crate::peer_connection::Role::Initiator => ConnRole::Initiator,
            crate::peer_connection::Role::Responder => ConnRole::Responder,
        }
    }
}

async fn initiate_connection(
    self_id: PeerId,
    peer: PeerId,
    links: &Arc<DashMap<PeerId, Arc<PeerConnection>>>,
    router: &Arc<Router>,
    signaling_outbound: &mpsc::Sender<SignalingFrame>,
    internal_tx: &mpsc::Sender<Internal>,
) {
    let (events_tx, events_rx) = mpsc::channel(16);
    match PeerConnection::create_offer(peer, &default_ice_servers(), events_tx).await {
        Ok((link, sdp)) => {
            wire_local_ice(&link, self_id, peer, signaling_outbound.clone());
            links.insert(peer, Arc::clone(&link));
            router.register_link(peer, link);
            forward_link_events(peer, events_rx, internal_tx.clone());
            let _ = signaling_outbound
                .send(SignalingFrame::Offer { from: self_id, to: peer, sdp })
                .await;
        }
        Err(err) => warn!(peer = %peer, error = %err, "failed to create offer"),
    }
}

/// Forwards every local ICE candidate generated for `link` out through
/// signaling, addressed from `self_id` to `remote`.
fn wire_local_ice(link: &Arc<PeerConnection>, self_id: PeerId, remote: PeerId, outbound: mpsc::Sender<SignalingFrame>) {
    let link = Arc::clone(link);
    tokio::spawn(async move {
        link.on_local_ice_candidates(move |candidate| {
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let Ok(init) = candidate.to_json() else { return };
                let _ = outbound
                    .send(SignalingFrame::Ice { from: self_id, to: remote, candidate: init.candidate })
                    .await;
            });
        })
        .await;
    });
}

fn forward_link_events(
    peer: PeerId,
    mut events_rx: mpsc::Receiver<PeerConnectionEvent>,
    internal_tx: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if internal_tx.send(Internal::Link(peer, event)).await.is_err() {
                break;
            }
        }
    });
}

async fn handle_signaling_frame(
    self_id: PeerId,
    frame: SignalingFrame,
    connections: &Arc<ConnectionManager>,
    router: &Arc<Router>,
    links: &Arc<DashMap<PeerId, Arc<PeerConnection>>>,
    signaling_outbound: &mpsc::Sender<SignalingFrame>,
    internal_tx: &mpsc::Sender<Internal>,
) {
    match frame {
        SignalingFrame::PeerDiscovered { peer_id } => {
            connections.on_peer_discovered(peer_id).await;
        }
        SignalingFrame::Offer { from, to, sdp } if to == self_id => {
            let (events_tx, events_rx) = mpsc::channel(16);
            match PeerConnection::accept_offer(from, sdp, &default_ice_servers(), events_tx).await {
                Ok((link, answer_sdp)) => {
                    wire_local_ice(&link, self_id, from, signaling_outbound.clone());
                    links.insert(from, Arc::clone(&link));
                    router.register_link(from, link);
                    forward_link_events(from, events_rx, internal_tx.clone());
                    let _ = signaling_outbound
                        .send(SignalingFrame::Answer { from: self_id, to: from, sdp: answer_sdp })
                        .await;
                }
                Err(err) => warn!(peer = %from, error = %err, "failed to accept offer"),
            }
        }
        SignalingFrame::Answer { from, to, sdp } if to == self_id => {
            if let Some(link) = links.get(&from) {
                if let Err(err) = link.apply_answer(sdp).await {
                    warn!(peer = %from, error = %err, "failed to apply answer");
                }
            }
        }
        SignalingFrame::Ice { from, to, candidate } if to == self_id => {
            if let Some(link) = links.get(&from) {
                if let Err(err) = link.add_ice(candidate).await {
                    warn!(peer = %from, error = %err, "failed to add ice candidate");
                }
            }
        }
        SignalingFrame::Goodbye { peer_id } => {
            connections.on_disconnected(peer_id, "goodbye");
        }
        _ => {}
    }
}

fn spawn_health_sweep(connections: Arc<ConnectionManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(crate::connection_manager::HEALTH_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            connections.sweep();
        }
    });
}
