// Copyright (c) 2024 Botho Foundation

//! Peer reputation tracking based on response latency and reliability
//! (SPEC_FULL.md supplement 2). Adapted from `network/reputation.rs`'s
//! exponential-moving-average design; used by the connection manager to
//! break ties among equidistant routing candidates and to deprioritize
//! flaky peers when choosing eviction/connect order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::peer_id::PeerId;

const EMA_ALPHA: f64 = 0.3;
const FAILURE_LATENCY_MS: u64 = 30_000;
const MIN_SAMPLES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PeerReputation {
    pub avg_latency_ms: f64,
    pub successes: u32,
    pub failures: u32,
    pub last_response: Option<Instant>,
    pub first_seen: Instant,
}

impl PeerReputation {
    pub fn new() -> Self {
        Self {
            avg_latency_ms: 0.0,
            successes: 0,
            failures: 0,
            last_response: None,
            first_seen: Instant::now(),
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as f64;
        self.update_latency(latency_ms);
        self.successes += 1;
        self.last_response = Some(Instant::now());
    }

    pub fn record_failure(&mut self) {
        self.update_latency(FAILURE_LATENCY_MS as f64);
        self.failures += 1;
    }

    fn update_latency(&mut self, latency_ms: f64) {
        if self.total_requests() == 0 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms = EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.avg_latency_ms;
        }
    }

    pub fn total_requests(&self) -> u32 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests() == 0 {
            1.0
        } else {
            self.successes as f64 / self.total_requests() as f64
        }
    }

    /// Selection score: higher is better. New peers (below `MIN_SAMPLES`) get
    /// a neutral score so they are not starved before they have a track
    /// record.
    pub fn score(&self) -> f64 {
        if self.total_requests() < MIN_SAMPLES {
            return 1.0;
        }
        let reliability = self.success_rate();
        let latency_factor = 1.0 / (1.0 + self.avg_latency_ms / 1000.0);
        reliability * latency_factor
    }

    pub fn is_banned(&self) -> bool {
        self.total_requests() >= MIN_SAMPLES && self.success_rate() < 0.25
    }
}

impl Default for PeerReputation {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages reputation for all known peers. Interior mutability via
/// `parking_lot::RwLock` so callers holding only a shared `&ConnectionManager`
/// reference (e.g. the router's next-hop selection) can still record and
/// read scores.
#[derive(Default)]
pub struct ReputationManager {
    peers: RwLock<HashMap<PeerId, PeerReputation>>,
}

impl ReputationManager {
    pub fn new() -> Self {
        Self { peers: RwLock::new(HashMap::new()) }
    }

    pub fn record_success(&self, peer: &PeerId, latency: Duration) {
        self.peers.write().entry(*peer).or_default().record_success(latency);
    }

    pub fn record_failure(&self, peer: &PeerId) {
        self.peers.write().entry(*peer).or_default().record_failure();
    }

    /// Selection score for `peer`; higher is better. Unknown peers score 1.0,
    /// the same neutral value as a peer with too few samples.
    pub fn score(&self, peer: &PeerId) -> f64 {
        self.peers.read().get(peer).map(|r| r.score()).unwrap_or(1.0)
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers.read().get(peer).map(|r| r.is_banned()).unwrap_or(false)
    }

    pub fn forget(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peers_get_neutral_score() {
        let mgr = ReputationManager::new();
        let peer = PeerId::new_random();
        assert_eq!(mgr.score(&peer), 1.0);
    }

    #[test]
    fn repeated_failures_lower_score_and_eventually_ban() {
        let mgr = ReputationManager::new();
        let peer = PeerId::new_random();
        for _ in 0..5 {
            mgr.record_failure(&peer);
        }
        assert!(mgr.is_banned(&peer));
        assert!(mgr.score(&peer) < 1.0);
    }

    #[test]
    fn fast_reliable_peer_scores_higher_than_slow_one() {
        let mgr = ReputationManager::new();
        let fast = PeerId::new_random();
        let slow = PeerId::new_random();
        for _ in 0..5 {
            mgr.record_success(&fast, Duration::from_millis(10));
            mgr.record_success(&slow, Duration::from_millis(2000));
        }
        assert!(mgr.score(&fast) > mgr.score(&slow));
    }
}
