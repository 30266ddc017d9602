// Copyright (c) 2024 Botho Foundation

//! Connection manager (C4): owns the `ConnectionTable` and implements the
//! bounded-degree policy (§3, §4.4). Grounded on `network/connection_limiter.rs`'s
//! `parking_lot::RwLock` + atomic-metrics shape for the per-IP rate limiter,
//! generalized here into the per-peer connection table, and on
//! `network/reputation.rs` for the peer-scoring supplement used to break ties
//! among equidistant candidates.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics::METRICS;
use crate::peer_id::{Distance, PeerId};
use crate::reputation::ReputationManager;

pub const DISCOVERY_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const CONNECTING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Discovered,
    Connecting,
    Connected,
    Evicting,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub state: ConnState,
    pub role: ConnRole,
    pub discovered_at: Instant,
    pub connected_at: Option<Instant>,
    pub last_seen: Instant,
    pub distance_to_self: Distance,
    pub data_channel_ready: bool,
    pub failure_count: u32,
}

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId, String),
    PeerEvicted(PeerId),
    DataChannelReady(PeerId),
    ConnectRequested(PeerId, ConnRole),
}

/// Per-remote-address acceptance limiter, a Sybil-resistance supplement
/// layered in front of the degree policy (not itself part of §4.4).
#[derive(Default)]
pub struct ConnectionLimiterMetrics {
    pub rejected: AtomicU64,
    pub accepted: AtomicU64,
}

pub struct ConnectionLimiter {
    max_per_ip: u32,
    connections: RwLock<HashMap<IpAddr, u32>>,
    pub metrics: Arc<ConnectionLimiterMetrics>,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        Self {
            max_per_ip,
            connections: RwLock::new(HashMap::new()),
            metrics: Arc::new(ConnectionLimiterMetrics::default()),
        }
    }

    pub fn try_connect(&self, addr: IpAddr) -> bool {
        let mut table = self.connections.write();
        let count = table.entry(addr).or_insert(0);
        if *count >= self.max_per_ip {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            METRICS.connections_rejected.inc();
            return false;
        }
        *count += 1;
        self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        METRICS.connections_accepted.inc();
        true
    }

    pub fn disconnect(&self, addr: IpAddr) {
        let mut table = self.connections.write();
        if let Some(count) = table.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                table.remove(&addr);
            }
        }
    }
}

pub struct ConnectionManagerConfig {
    pub min_peers: usize,
    pub max_peers: usize,
    pub auto_connect: bool,
    pub auto_discovery: bool,
    pub eviction_enabled: bool,
    pub xor_routing_enabled: bool,
}

/// Owns the `ConnectionTable` and enforces the min/max degree policy.
pub struct ConnectionManager {
    self_id: PeerId,
    config: RwLock<ConnectionManagerConfig>,
    table: RwLock<HashMap<PeerId, PeerRecord>>,
    pub reputation: ReputationManager,
    events: mpsc::Sender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(
        self_id: PeerId,
        config: ConnectionManagerConfig,
        events: mpsc::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            self_id,
            config: RwLock::new(config),
            table: RwLock::new(HashMap::new()),
            reputation: ReputationManager::new(),
            events,
        }
    }

    pub fn connected_count(&self) -> usize {
        self.table
            .read()
            .values()
            .filter(|r| r.state == ConnState::Connected)
            .count()
    }

    fn farthest_connected(&self) -> Option<(PeerId, Distance)> {
        self.table
            .read()
            .values()
            .filter(|r| r.state == ConnState::Connected)
            .map(|r| (r.id, r.distance_to_self))
            .max_by_key(|(_, d)| *d)
    }

    /// Handles a `peer-discovered{id}` event from the signaling client
    /// (§4.4 "Discovery handling").
    pub async fn on_peer_discovered(&self, id: PeerId) {
        if id == self.self_id {
            return;
        }
        let distance = self.self_id.distance_to(&id);
        let is_new = {
            let mut table = self.table.write();
            if table.contains_key(&id) {
                false
            } else {
                table.insert(
                    id,
                    PeerRecord {
                        id,
                        state: ConnState::Discovered,
                        role: ConnRole::Responder,
                        discovered_at: Instant::now(),
                        connected_at: None,
                        last_seen: Instant::now(),
                        distance_to_self: distance,
                        data_channel_ready: false,
                        failure_count: 0,
                    },
                );
                true
            }
        };
        if !is_new {
            return;
        }

        let (auto_connect, eviction_enabled, max_peers, min_peers) = {
            let c = self.config.read();
            (c.auto_connect, c.eviction_enabled, c.max_peers, c.min_peers)
        };
        let connected = self.connected_count();

        if auto_connect && connected < min_peers {
            self.request_connect(id).await;
            return;
        }

        if connected >= max_peers && eviction_enabled {
            if let Some((victim, victim_distance)) = self.farthest_connected() {
                if distance < victim_distance {
                    self.evict(victim, id).await;
                }
            }
        }
    }

    async fn request_connect(&self, id: PeerId) {
        {
            let mut table = self.table.write();
            if let Some(record) = table.get_mut(&id) {
                record.state = ConnState::Connecting;
            }
        }
        let _ = self.events.send(ManagerEvent::ConnectRequested(id, ConnRole::Initiator)).await;
    }

    /// Simultaneous cross-offer tie-break: the node with the lexicographically
    /// smaller PeerID is Initiator (§4.4).
    pub fn resolve_simultaneous_connect(&self, remote: PeerId) -> ConnRole {
        if self.self_id < remote {
            ConnRole::Initiator
        } else {
            ConnRole::Responder
        }
    }

    /// Eviction algorithm (§4.4): victim is the farthest Connected peer;
    /// evicted only if `candidate` is strictly closer than the victim.
    async fn evict(&self, victim: PeerId, candidate: PeerId) {
        {
            let mut table = self.table.write();
            if let Some(record) = table.get_mut(&victim) {
                record.state = ConnState::Evicting;
            }
        }
        METRICS.evictions.inc();
        info!(victim = %victim, candidate = %candidate, "evicting farthest peer for closer candidate");
        let _ = self.events.send(ManagerEvent::PeerEvicted(victim)).await;
        self.request_connect(candidate).await;
    }

    pub fn on_connected(&self, id: PeerId, role: ConnRole) {
        let mut table = self.table.write();
        let distance = self.self_id.distance_to(&id);
        let record = table.entry(id).or_insert_with(|| PeerRecord {
            id,
            state: ConnState::Discovered,
            role,
            discovered_at: Instant::now(),
            connected_at: None,
            last_seen: Instant::now(),
            distance_to_self: distance,
            data_channel_ready: false,
            failure_count: 0,
        });
        record.state = ConnState::Connected;
        record.role = role;
        record.connected_at = Some(Instant::now());
        record.last_seen = Instant::now();
        METRICS.connected_peers.set(
            table.values().filter(|r| r.state == ConnState::Connected).count() as f64,
        );
    }

    pub fn on_data_channel_ready(&self, id: PeerId) {
        let mut table = self.table.write();
        if let Some(record) = table.get_mut(&id) {
            record.data_channel_ready = true;
        }
    }

    pub fn on_disconnected(&self, id: PeerId, reason: &str) {
        let mut table = self.table.write();
        if let Some(record) = table.get_mut(&id) {
            record.state = ConnState::Closed;
            record.data_channel_ready = false;
            record.failure_count += 1;
        }
        METRICS.connected_peers.set(
            table.values().filter(|r| r.state == ConnState::Connected).count() as f64,
        );
        warn!(peer = %id, reason, "peer disconnected");
    }

    /// Applies a runtime change to `max_peers`: evicts farthest-Connected
    /// peers down to the new ceiling, or opportunistically connects up to
    /// `min_peers` when raised.
    pub async fn set_max_peers(&self, new_max: usize) {
        self.config.write().max_peers = new_max;
        loop {
            if self.connected_count() <= new_max {
                break;
            }
            match self.farthest_connected() {
                Some((victim, _)) => {
                    {
                        let mut table = self.table.write();
                        if let Some(record) = table.get_mut(&victim) {
                            record.state = ConnState::Evicting;
                        }
                    }
                    METRICS.evictions.inc();
                    let _ = self.events.send(ManagerEvent::PeerEvicted(victim)).await;
                }
                None => break,
            }
        }
    }

    /// Periodic sweep (§4.4 "Health and cleanup"): every `HEALTH_SWEEP_INTERVAL`,
    /// prunes stale Discovered records and stuck Connecting attempts.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut table = self.table.write();
        table.retain(|id, record| {
            match record.state {
                ConnState::Discovered if now.duration_since(record.last_seen) > DISCOVERY_STALE_AFTER => {
                    debug!(peer = %id, "pruning stale discovered peer");
                    false
                }
                ConnState::Connecting if now.duration_since(record.discovered_at) > CONNECTING_TIMEOUT => {
                    debug!(peer = %id, "connecting attempt timed out");
                    record.state = ConnState::Failed;
                    record.failure_count += 1;
                    true
                }
                _ => true,
            }
        });
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.table
            .read()
            .get(id)
            .map(|r| r.state == ConnState::Connected)
            .unwrap_or(false)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.table
            .read()
            .values()
            .filter(|r| r.state == ConnState::Connected)
            .map(|r| r.id)
            .collect()
    }

    /// Nearest Connected peer to `target` by XOR distance, used by the
    /// router for next-hop selection (§4.5). Falls back to reputation score
    /// when two candidates are equidistant.
    pub fn nearest_connected_to(&self, target: &PeerId) -> Option<PeerId> {
        let table = self.table.read();
        table
            .values()
            .filter(|r| r.state == ConnState::Connected)
            .map(|r| (r.id, r.id.distance_to(target)))
            .min_by(|(a_id, a_dist), (b_id, b_dist)| {
                a_dist.cmp(b_dist).then_with(|| {
                    let a_score = self.reputation.score(a_id);
                    let b_score = self.reputation.score(b_id);
                    b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
                })
            })
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager(self_id: PeerId, max_peers: usize) -> (ConnectionManager, mpsc::Receiver<ManagerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let config = ConnectionManagerConfig {
            min_peers: 1,
            max_peers,
            auto_connect: true,
            auto_discovery: true,
            eviction_enabled: true,
            xor_routing_enabled: true,
        };
        (ConnectionManager::new(self_id, config, tx), rx)
    }

    #[tokio::test]
    async fn discovery_below_min_peers_triggers_connect() {
        let self_id = PeerId::parse(&"00".repeat(20)).unwrap();
        let (mgr, mut rx) = make_manager(self_id, 3);
        let peer = PeerId::new_random();
        mgr.on_peer_discovered(peer).await;
        match rx.try_recv() {
            Ok(ManagerEvent::ConnectRequested(id, ConnRole::Initiator)) => assert_eq!(id, peer),
            other => panic!("expected ConnectRequested, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eviction_only_for_strictly_closer_candidate() {
        let self_id = PeerId::parse(&"00".repeat(20)).unwrap();
        let (mgr, mut rx) = make_manager(self_id, 1);
        let far = PeerId::parse(&"ff".repeat(20)).unwrap();
        mgr.on_connected(far, ConnRole::Initiator);
        // drain the implicit events from setup
        while rx.try_recv().is_ok() {}

        let closer = PeerId::parse(&{
            let mut s = "00".repeat(20);
            s.replace_range(0..2, "01");
            s
        })
        .unwrap();
        mgr.on_peer_discovered(closer).await;

        let mut evicted = false;
        while let Ok(event) = rx.try_recv() {
            if let ManagerEvent::PeerEvicted(id) = event {
                assert_eq!(id, far);
                evicted = true;
            }
        }
        assert!(evicted, "expected the farther peer to be evicted");
    }

    #[test]
    fn tie_break_picks_lexicographically_smaller_as_initiator() {
        let a = PeerId::parse(&"00".repeat(20)).unwrap();
        let b = PeerId::parse(&"ff".repeat(20)).unwrap();
        let (mgr_a, _rx) = make_manager(a, 3);
        assert_eq!(mgr_a.resolve_simultaneous_connect(b), ConnRole::Initiator);
        let (mgr_b, _rx2) = make_manager(b, 3);
        assert_eq!(mgr_b.resolve_simultaneous_connect(a), ConnRole::Responder);
    }

    #[test]
    fn connection_limiter_rejects_past_cap() {
        let limiter = ConnectionLimiter::new(2);
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.try_connect(addr));
        assert!(limiter.try_connect(addr));
        assert!(!limiter.try_connect(addr));
        limiter.disconnect(addr);
        assert!(limiter.try_connect(addr));
    }

    #[test]
    fn sweep_prunes_stale_discovered_records() {
        let self_id = PeerId::parse(&"00".repeat(20)).unwrap();
        let (mgr, _rx) = make_manager(self_id, 3);
        let peer = PeerId::new_random();
        {
            let mut table = mgr.table.write();
            table.insert(
                peer,
                PeerRecord {
                    id: peer,
                    state: ConnState::Discovered,
                    role: ConnRole::Responder,
                    discovered_at: Instant::now() - DISCOVERY_STALE_AFTER - Duration::from_secs(1),
                    connected_at: None,
                    last_seen: Instant::now() - DISCOVERY_STALE_AFTER - Duration::from_secs(1),
                    distance_to_self: self_id.distance_to(&peer),
                    data_channel_ready: false,
                    failure_count: 0,
                },
            );
        }
        mgr.sweep();
        assert!(mgr.table.read().get(&peer).is_none());
    }
}
