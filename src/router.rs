// Copyright (c) 2024 Botho Foundation

//! Router & Gossip (C5): XOR-nearest forwarding and loop-suppressed
//! broadcast (§4.5). Grounded on `network/discovery.rs`'s mpsc event-channel
//! dispatch pattern, generalized from a libp2p `Swarm` event loop into a
//! direct dispatch over this crate's `PeerConnection` table, and on
//! `network/privacy/broadcaster.rs`'s atomic broadcast-metrics shape.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection_manager::ConnectionManager;
use crate::envelope::{Destination, Envelope, EnvelopeKind, SeenSet};
use crate::error::{CoreError, CoreResult};
use crate::metrics::METRICS;
use crate::peer_connection::PeerConnection;
use crate::peer_id::PeerId;

#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A `Direct` or reassembled application payload addressed to this node.
    Delivered { from: PeerId, payload: Vec<u8> },
    /// A protocol envelope the router doesn't own (DHT/store kinds), handed
    /// up for the owning component to interpret.
    Protocol(Envelope),
    PeerSaidGoodbye(PeerId),
}

pub struct Router {
    self_id: PeerId,
    connections: Arc<ConnectionManager>,
    links: Arc<DashMap<PeerId, Arc<PeerConnection>>>,
    seen: Mutex<SeenSet>,
    events: mpsc::Sender<RouterEvent>,
}

impl Router {
    pub fn new(
        self_id: PeerId,
        connections: Arc<ConnectionManager>,
        links: Arc<DashMap<PeerId, Arc<PeerConnection>>>,
        seen_set_capacity: usize,
        events: mpsc::Sender<RouterEvent>,
    ) -> Self {
        Self {
            self_id,
            connections,
            links,
            seen: Mutex::new(SeenSet::new(seen_set_capacity)),
            events,
        }
    }

    async fn send_on_link(&self, peer: PeerId, envelope: &Envelope) -> CoreResult<()> {
        let link = self.links.get(&peer).map(|entry| Arc::clone(entry.value()));
        match link {
            Some(link) => link.send_envelope(envelope).await.map_err(|err| {
                METRICS.broadcasts_dropped.inc();
                CoreError::PeerDisconnected(peer, err.to_string())
            }),
            None => Err(CoreError::NotConnected),
        }
    }

    /// Direct routing (§4.5): sends straight to `target` if connected,
    /// otherwise forwards to the Connected peer strictly closer to `target`
    /// than this node, failing with `NoRoute` if no such peer exists.
    pub async fn send_to(&self, target: PeerId, payload: Vec<u8>) -> CoreResult<()> {
        let envelope = Envelope::new(
            self.self_id,
            Destination::Peer(target),
            EnvelopeKind::Direct { payload },
        );
        self.route(envelope).await
    }

    async fn route(&self, envelope: Envelope) -> CoreResult<()> {
        let target = match envelope.to {
            Destination::Peer(p) => p,
            Destination::Broadcast => return Err(CoreError::ProtocolViolation(
                "route() called with a broadcast envelope".to_string(),
            )),
        };

        if self.connections.is_connected(&target) {
            return self.send_on_link(target, &envelope).await;
        }

        let next_hop = self
            .connections
            .nearest_connected_to(&target)
            .ok_or(CoreError::NoRoute(target))?;

        let self_distance = self.self_id.distance_to(&target);
        let hop_distance = next_hop.distance_to(&target);
        if hop_distance >= self_distance {
            return Err(CoreError::NoRoute(target));
        }

        let forwarded = envelope.forwarded();
        if forwarded.is_expired() {
            return Err(CoreError::NoRoute(target));
        }
        self.send_on_link(next_hop, &forwarded).await
    }

    /// Broadcast (gossip, §4.5): delivers locally once, then re-emits to
    /// every Connected peer except the sender.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        let envelope = Envelope::new(
            self.self_id,
            Destination::Broadcast,
            EnvelopeKind::Broadcast { payload },
        );
        self.gossip(envelope, None).await;
    }

    async fn gossip(&self, envelope: Envelope, exclude: Option<PeerId>) {
        {
            let mut seen = self.seen.lock();
            if seen.contains(&envelope.message_id) {
                return;
            }
            seen.insert(envelope.message_id);
        }

        if let EnvelopeKind::Broadcast { payload } = &envelope.kind {
            let _ = self
                .events
                .send(RouterEvent::Delivered { from: envelope.from, payload: payload.clone() })
                .await;
        }

        if envelope.is_expired() {
            return;
        }
        let forwarded = envelope.clone().forwarded();
        for peer in self.connections.connected_peers() {
            if Some(peer) == exclude || peer == envelope.from {
                continue;
            }
            if self.send_on_link(peer, &forwarded).await.is_err() {
                METRICS.broadcasts_dropped.inc();
            }
        }
    }

    /// Entry point for envelopes arriving from a `PeerConnection`.
    pub async fn handle_incoming(&self, from: PeerId, envelope: Envelope) {
        if envelope.is_expired() {
            debug!(peer = %from, "dropping envelope past ttl");
            return;
        }

        match &envelope.kind {
            EnvelopeKind::Broadcast { .. } => {
                self.gossip(envelope, Some(from)).await;
            }
            EnvelopeKind::Direct { payload } => {
                match envelope.to {
                    Destination::Peer(target) if target == self.self_id => {
                        let _ = self
                            .events
                            .send(RouterEvent::Delivered { from: envelope.from, payload: payload.clone() })
                            .await;
                    }
                    Destination::Peer(_) => {
                        if self.route(envelope.clone()).await.is_err() {
                            warn!(peer = %from, "dropping unroutable direct envelope");
                        }
                    }
                    Destination::Broadcast => {
                        warn!(peer = %from, "direct envelope addressed to broadcast, dropping");
                    }
                }
            }
            EnvelopeKind::Goodbye { peer_id } => {
                let _ = self.events.send(RouterEvent::PeerSaidGoodbye(*peer_id)).await;
            }
            _ => {
                let _ = self.events.send(RouterEvent::Protocol(envelope)).await;
            }
        }
    }

    /// Graceful shutdown: broadcasts `Goodbye` so peers can prune faster than
    /// the discovery staleness window (§4.5).
    pub async fn send_goodbye(&self) {
        let envelope = Envelope::new(
            self.self_id,
            Destination::Broadcast,
            EnvelopeKind::Goodbye { peer_id: self.self_id },
        );
        self.gossip(envelope, None).await;
    }

    pub fn register_link(&self, peer: PeerId, link: Arc<PeerConnection>) {
        self.links.insert(peer, link);
    }

    pub fn remove_link(&self, peer: &PeerId) {
        self.links.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionManagerConfig;

    fn manager(self_id: PeerId) -> Arc<ConnectionManager> {
        let (tx, _rx) = mpsc::channel(64);
        Arc::new(ConnectionManager::new(
            self_id,
            ConnectionManagerConfig {
                min_peers: 1,
                max_peers: 6,
                auto_connect: true,
                auto_discovery: true,
                eviction_enabled: true,
                xor_routing_enabled: true,
            },
            tx,
        ))
    }

    #[tokio::test]
    async fn direct_send_without_any_link_fails_not_connected() {
        let self_id = PeerId::new_random();
        let connections = manager(self_id);
        let links = Arc::new(DashMap::new());
        let (tx, _rx) = mpsc::channel(64);
        let router = Router::new(self_id, connections.clone(), links, 128, tx);

        let target = PeerId::new_random();
        let result = router.send_to(target, b"hi".to_vec()).await;
        assert!(matches!(result, Err(CoreError::NoRoute(_))));
    }

    #[tokio::test]
    async fn broadcast_is_delivered_locally_exactly_once() {
        let self_id = PeerId::new_random();
        let connections = manager(self_id);
        let links = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(64);
        let router = Router::new(self_id, connections, links, 128, tx);

        router.broadcast(b"hello".to_vec()).await;
        let event = rx.recv().await.unwrap();
        match event {
            RouterEvent::Delivered { payload, .. } => assert_eq!(payload, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_broadcast_is_suppressed_by_seen_set() {
        let self_id = PeerId::new_random();
        let connections = manager(self_id);
        let links = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(64);
        let router = Router::new(self_id, connections, links, 128, tx);

        let envelope = Envelope::new(
            PeerId::new_random(),
            Destination::Broadcast,
            EnvelopeKind::Broadcast { payload: b"dup".to_vec() },
        );
        router.gossip(envelope.clone(), None).await;
        router.gossip(envelope, None).await;

        let mut delivered = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RouterEvent::Delivered { .. }) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }
}
