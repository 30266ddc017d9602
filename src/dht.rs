// Copyright (c) 2024 Botho Foundation

//! Kademlia-style distributed hash table (C6): put/get/update/subscribe with
//! TTL and change notifications (§4.6). Grounded on the request/oneshot-reply
//! actor shape used for Tari's DHT actor (`comms-dht/src/actor.rs` in the
//! supplementary example pack), re-expressed in this crate's `thiserror` +
//! `tracing` idiom over a `DashMap`-backed local store rather than
//! `derive_error`/`log`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::envelope::{Destination, Envelope, EnvelopeKind, MessageId};
use crate::metrics::METRICS;
use crate::peer_id::PeerId;
use crate::router::Router;

pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOMBSTONE_GRACE: Duration = Duration::from_secs(60 * 60);
pub const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("no value found for key")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct DhtEntry {
    pub key_hash: PeerId,
    pub value: Option<Vec<u8>>,
    pub version: u64,
    pub expires_at: Option<Instant>,
    pub origin_peer: PeerId,
    pub is_origin_local: bool,
}

impl DhtEntry {
    /// Conflict resolution: higher version wins; ties broken by
    /// lexicographic `origin_peer` (§3 "DHT Entry").
    fn supersedes(&self, other: &DhtEntry) -> bool {
        (self.version, self.origin_peer) > (other.version, other.origin_peer)
    }
}

#[derive(Debug, Clone)]
pub struct DhtNotification {
    pub key_hash: PeerId,
    pub value: Option<Vec<u8>>,
    pub version: u64,
}

struct PendingGet {
    request_id: MessageId,
    best: Option<DhtEntry>,
    reply: Option<oneshot::Sender<Result<DhtEntry, DhtError>>>,
}

/// Owns DHT entries and subscriptions. Shared behind an `Arc` by the node;
/// all mutable state uses interior mutability so the router's inbound
/// dispatch (which only holds a shared reference) can deliver replies.
pub struct Dht {
    self_id: PeerId,
    router: Arc<Router>,
    known_peers: Arc<dyn Fn() -> Vec<PeerId> + Send + Sync>,
    replication_factor: usize,
    store: DashMap<PeerId, DhtEntry>,
    subscriptions: DashMap<PeerId, Vec<mpsc::Sender<DhtNotification>>>,
    /// Remote peers that have sent us a `DhtSubscribe` for a key we hold,
    /// pruned when that peer disconnects (§4.6 "Notification propagation").
    remote_subscribers: DashMap<PeerId, HashSet<PeerId>>,
    pending_gets: Mutex<HashMap<MessageId, PendingGet>>,
}

impl Dht {
    pub fn new(
        self_id: PeerId,
        router: Arc<Router>,
        known_peers: Arc<dyn Fn() -> Vec<PeerId> + Send + Sync>,
        replication_factor: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            router,
            known_peers,
            replication_factor,
            store: DashMap::new(),
            subscriptions: DashMap::new(),
            remote_subscribers: DashMap::new(),
            pending_gets: Mutex::new(HashMap::new()),
        })
    }

    /// True if this node is among the `replication_factor` known peers
    /// closest to `key_hash`, i.e. a storing peer for that key.
    fn is_storing_peer(&self, key_hash: &PeerId) -> bool {
        let mut candidates: Vec<PeerId> = (self.known_peers)();
        candidates.push(self.self_id);
        candidates.sort_by_key(|id| id.distance_to(key_hash));
        candidates.truncate(self.replication_factor);
        candidates.contains(&self.self_id)
    }

    /// Commits `entry` if it supersedes any existing one, firing local
    /// subscriber callbacks. Returns whether the store actually changed, so
    /// callers know whether to also propagate to remote subscribers.
    fn apply_local(&self, key_hash: PeerId, entry: DhtEntry) -> bool {
        let should_replace = self
            .store
            .get(&key_hash)
            .map(|existing| entry.supersedes(&existing))
            .unwrap_or(true);
        if should_replace {
            self.notify_subscribers(key_hash, entry.value.clone(), entry.version);
            self.store.insert(key_hash, entry);
        }
        should_replace
    }

    /// Sends `DhtNotify` to every remote peer that has subscribed to
    /// `key_hash` via this node (§4.6 "Notification propagation"). Forwarding
    /// is one hop, direct peer -> subscriber; transitive re-forwarding by the
    /// subscriber is left to that node's own `remote_subscribers` table.
    async fn propagate_remote_notify(&self, key_hash: PeerId, value: Option<Vec<u8>>, version: u64) {
        let subscribers: Vec<PeerId> = self
            .remote_subscribers
            .get(&key_hash)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for peer in subscribers {
            let envelope = Envelope::new(
                self.self_id,
                Destination::Peer(peer),
                EnvelopeKind::DhtNotify { key_hash, value: value.clone(), version, origin: self.self_id },
            );
            let _ = self.router.send_to(peer, envelope.to_bytes().unwrap_or_default()).await;
        }
    }

    /// Drops `peer` from every key's remote subscriber set; called when a
    /// peer disconnects so stale subscriptions don't accumulate.
    pub fn remove_remote_subscriber(&self, peer: PeerId) {
        for mut entry in self.remote_subscribers.iter_mut() {
            entry.value_mut().remove(&peer);
        }
    }

    fn notify_subscribers(&self, key_hash: PeerId, value: Option<Vec<u8>>, version: u64) {
        if let Some(subs) = self.subscriptions.get(&key_hash) {
            for sender in subs.iter() {
                let _ = sender.try_send(DhtNotification { key_hash, value: value.clone(), version });
            }
        }
    }

    /// `put`/`update` (§4.6): writes locally when a storing peer, always
    /// forwards a replicate envelope routed toward `key_hash`, and
    /// auto-subscribes the local node to the key.
    pub async fn put(&self, logical_key: &str, value: Vec<u8>, ttl: Option<Duration>, version: Option<u64>) {
        let key_hash = PeerId::from_key_hash(logical_key);
        let version = version.unwrap_or_else(|| {
            self.store.get(&key_hash).map(|e| e.version + 1).unwrap_or(1)
        });
        let expires_at = ttl.map(|d| Instant::now() + d);

        METRICS.dht_puts.inc();

        if self.is_storing_peer(&key_hash) {
            let changed = self.apply_local(
                key_hash,
                DhtEntry {
                    key_hash,
                    value: Some(value.clone()),
                    version,
                    expires_at,
                    origin_peer: self.self_id,
                    is_origin_local: true,
                },
            );
            if changed {
                self.propagate_remote_notify(key_hash, Some(value.clone()), version).await;
            }
        }

        let envelope = Envelope::new(
            self.self_id,
            Destination::Peer(key_hash),
            EnvelopeKind::DhtReplicate {
                key_hash,
                value: Some(value),
                version,
                ttl_secs: ttl.map(|d| d.as_secs()),
                origin: self.self_id,
            },
        );
        if self.router.send_to(key_hash, envelope.to_bytes().unwrap_or_default()).await.is_err() {
            debug!(key = %key_hash, "no route to replicate key, relying on local copy");
        }
    }

    pub async fn update(&self, logical_key: &str, value: Vec<u8>) {
        let key_hash = PeerId::from_key_hash(logical_key);
        let next_version = self.store.get(&key_hash).map(|e| e.version + 1).unwrap_or(1);
        self.put(logical_key, value, None, Some(next_version)).await;
    }

    /// Tombstone write; grace period before the entry is actually pruned by
    /// the TTL sweep.
    pub async fn delete(&self, logical_key: &str) {
        let key_hash = PeerId::from_key_hash(logical_key);
        let version = self.store.get(&key_hash).map(|e| e.version + 1).unwrap_or(1);
        if self.is_storing_peer(&key_hash) {
            let changed = self.apply_local(
                key_hash,
                DhtEntry {
                    key_hash,
                    value: None,
                    version,
                    expires_at: Some(Instant::now() + TOMBSTONE_GRACE),
                    origin_peer: self.self_id,
                    is_origin_local: true,
                },
            );
            if changed {
                self.propagate_remote_notify(key_hash, None, version).await;
            }
        }
        let envelope = Envelope::new(
            self.self_id,
            Destination::Peer(key_hash),
            EnvelopeKind::DhtReplicate {
                key_hash,
                value: None,
                version,
                ttl_secs: Some(TOMBSTONE_GRACE.as_secs()),
                origin: self.self_id,
            },
        );
        let _ = self.router.send_to(key_hash, envelope.to_bytes().unwrap_or_default()).await;
    }

    /// `get` (§4.6): returns the local copy unless `force_refresh`, otherwise
    /// queries the network and awaits the first/best response within
    /// `DEFAULT_GET_TIMEOUT`.
    pub async fn get(&self, logical_key: &str, force_refresh: bool) -> Result<Vec<u8>, DhtError> {
        let key_hash = PeerId::from_key_hash(logical_key);

        if !force_refresh {
            if let Some(entry) = self.store.get(&key_hash) {
                return entry.value.clone().ok_or(DhtError::NotFound);
            }
        }

        METRICS.dht_gets.inc();
        let request_id = MessageId::random();
        let (tx, rx) = oneshot::channel();
        self.pending_gets.lock().insert(
            request_id,
            PendingGet { request_id, best: None, reply: Some(tx) },
        );

        let envelope = Envelope::new(
            self.self_id,
            Destination::Peer(key_hash),
            EnvelopeKind::DhtQuery { key_hash, request_id },
        );
        if self
            .router
            .send_to(key_hash, envelope.to_bytes().unwrap_or_default())
            .await
            .is_err()
        {
            self.pending_gets.lock().remove(&request_id);
            METRICS.dht_timeouts.inc();
            return Err(DhtError::NotFound);
        }

        match tokio::time::timeout(DEFAULT_GET_TIMEOUT, rx).await {
            Ok(Ok(Ok(entry))) => {
                self.subscribe_internal(key_hash);
                entry.value.ok_or(DhtError::NotFound)
            }
            Ok(Ok(Err(err))) => Err(err),
            _ => {
                self.pending_gets.lock().remove(&request_id);
                METRICS.dht_timeouts.inc();
                Err(DhtError::Timeout)
            }
        }
    }

    fn subscribe_internal(&self, key_hash: PeerId) {
        self.subscriptions.entry(key_hash).or_default();
    }

    /// Registers a callback channel for `key`; fires once per strictly
    /// increasing `(version, origin)` update, per subscriber (§4.6, §8
    /// property 4). Also announces this node as an interested party to the
    /// key's storing peer, so remote `put`/`delete` calls reach it too.
    pub async fn subscribe(&self, logical_key: &str) -> mpsc::Receiver<DhtNotification> {
        let key_hash = PeerId::from_key_hash(logical_key);
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions.entry(key_hash).or_default().push(tx);

        let envelope = Envelope::new(self.self_id, Destination::Peer(key_hash), EnvelopeKind::DhtSubscribe { key_hash });
        let _ = self.router.send_to(key_hash, envelope.to_bytes().unwrap_or_default()).await;

        rx
    }

    pub fn unsubscribe(&self, logical_key: &str) {
        let key_hash = PeerId::from_key_hash(logical_key);
        self.subscriptions.remove(&key_hash);
    }

    /// Dispatch for DHT-kind envelopes handed up by the router.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::DhtQuery { key_hash, request_id } => {
                if let Some(entry) = self.store.get(&key_hash) {
                    let response = Envelope::new(
                        self.self_id,
                        Destination::Peer(envelope.from),
                        EnvelopeKind::DhtResponse {
                            key_hash,
                            request_id,
                            value: entry.value.clone(),
                            version: entry.version,
                        },
                    );
                    let _ = self
                        .router
                        .send_to(envelope.from, response.to_bytes().unwrap_or_default())
                        .await;
                }
            }
            EnvelopeKind::DhtResponse { key_hash, request_id, value, version } => {
                let mut pending = self.pending_gets.lock();
                if let Some(slot) = pending.get_mut(&request_id) {
                    let candidate = DhtEntry {
                        key_hash,
                        value,
                        version,
                        expires_at: None,
                        origin_peer: envelope.from,
                        is_origin_local: false,
                    };
                    let better = slot
                        .best
                        .as_ref()
                        .map(|b| candidate.supersedes(b))
                        .unwrap_or(true);
                    if better {
                        slot.best = Some(candidate);
                    }
                    if let Some(best) = slot.best.clone() {
                        if let Some(reply) = slot.reply.take() {
                            let _ = reply.send(Ok(best));
                            pending.remove(&request_id);
                        }
                    }
                }
            }
            EnvelopeKind::DhtReplicate { key_hash, value, version, ttl_secs, origin } => {
                if self.is_storing_peer(&key_hash) {
                    let changed = self.apply_local(
                        key_hash,
                        DhtEntry {
                            key_hash,
                            value: value.clone(),
                            version,
                            expires_at: ttl_secs.map(|s| Instant::now() + Duration::from_secs(s)),
                            origin_peer: origin,
                            is_origin_local: false,
                        },
                    );
                    if changed {
                        self.propagate_remote_notify(key_hash, value, version).await;
                    }
                }
            }
            EnvelopeKind::DhtNotify { key_hash, value, version, .. } => {
                self.notify_subscribers(key_hash, value, version);
            }
            EnvelopeKind::DhtSubscribe { key_hash } => {
                self.remote_subscribers.entry(key_hash).or_default().insert(envelope.from);
            }
            other => {
                warn!(kind = ?other, "dht received an unexpected envelope kind");
            }
        }
    }

    /// Background sweep (§4.6 "TTL sweep"): removes expired entries, firing
    /// a synthetic notification to subscribers.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .store
            .iter()
            .filter(|entry| entry.expires_at.map(|t| t < now).unwrap_or(false))
            .map(|entry| *entry.key())
            .collect();
        for key_hash in expired {
            if let Some((_, entry)) = self.store.remove(&key_hash) {
                self.notify_subscribers(key_hash, None, entry.version + 1);
            }
        }
    }

    pub fn local_entry(&self, logical_key: &str) -> Option<DhtEntry> {
        let key_hash = PeerId::from_key_hash(logical_key);
        self.store.get(&key_hash).map(|e| e.clone())
    }
}

/// Spawns the periodic TTL sweep task (§5 suspension points: `C6 get/put
/// await a routed round trip`).
pub fn spawn_ttl_sweeper(dht: Arc<Dht>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            dht.sweep_expired();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ConnectionManager, ConnectionManagerConfig};
    use dashmap::DashMap as DM;

    fn test_router(self_id: PeerId) -> Arc<Router> {
        let (conn_tx, _conn_rx) = mpsc::channel(64);
        let connections = Arc::new(ConnectionManager::new(
            self_id,
            ConnectionManagerConfig {
                min_peers: 1,
                max_peers: 6,
                auto_connect: true,
                auto_discovery: true,
                eviction_enabled: true,
                xor_routing_enabled: true,
            },
            conn_tx,
        ));
        let links = Arc::new(DM::new());
        let (router_tx, _router_rx) = mpsc::channel(64);
        Arc::new(Router::new(self_id, connections, links, 128, router_tx))
    }

    #[tokio::test]
    async fn storing_peer_serves_put_then_get_locally() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);

        dht.put("alpha", b"{\"n\":1}".to_vec(), None, None).await;
        let value = dht.get("alpha", false).await.unwrap();
        assert_eq!(value, b"{\"n\":1}");
    }

    #[tokio::test]
    async fn update_is_idempotent_at_equal_version() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);

        dht.put("alpha", b"v1".to_vec(), None, Some(1)).await;
        dht.put("alpha", b"v1".to_vec(), None, Some(1)).await;
        assert_eq!(dht.get("alpha", false).await.unwrap(), b"v1");
    }

    #[tokio::test]
    async fn higher_version_wins_conflict() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);

        dht.put("k", b"old".to_vec(), None, Some(1)).await;
        dht.put("k", b"new".to_vec(), None, Some(2)).await;
        assert_eq!(dht.get("k", false).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_notifications() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);

        let mut rx = dht.subscribe("x").await;
        dht.put("x", b"1".to_vec(), None, Some(1)).await;
        assert!(rx.try_recv().is_ok());

        dht.unsubscribe("x");
        dht.put("x", b"2".to_vec(), None, Some(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dht_subscribe_envelope_registers_remote_subscriber() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);
        let key_hash = PeerId::from_key_hash("watched");
        let subscriber = PeerId::new_random();

        let envelope = Envelope::new(subscriber, Destination::Peer(self_id), EnvelopeKind::DhtSubscribe { key_hash });
        dht.handle_envelope(envelope).await;

        assert!(dht.remote_subscribers.get(&key_hash).unwrap().contains(&subscriber));

        dht.remove_remote_subscriber(subscriber);
        assert!(!dht.remote_subscribers.get(&key_hash).unwrap().contains(&subscriber));
    }

    #[tokio::test]
    async fn get_on_missing_key_times_out_as_not_found() {
        let self_id = PeerId::new_random();
        let router = test_router(self_id);
        // Replication factor 0 means this node is never a storing peer for
        // anything, forcing the network round trip, which has no peers to
        // answer and so resolves via NoRoute -> NotFound immediately.
        let dht = Dht::new(self_id, router, Arc::new(Vec::new), 0);
        let result = dht.get("missing", false).await;
        assert_eq!(result, Err(DhtError::NotFound));
    }
}
