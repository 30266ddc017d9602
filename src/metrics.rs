// Copyright (c) 2024 Botho Foundation

//! Process-wide counters for operator introspection (§ ambient stack:
//! Metrics). Registered once via `lazy_static`, in the style of the
//! connection limiter's own metrics struct.

use lazy_static::lazy_static;
use prometheus::{Gauge, IntCounter, Opts, Registry};

pub struct NodeMetrics {
    registry: Registry,
    pub connections_accepted: IntCounter,
    pub connections_rejected: IntCounter,
    pub evictions: IntCounter,
    pub broadcasts_dropped: IntCounter,
    pub dht_puts: IntCounter,
    pub dht_gets: IntCounter,
    pub dht_timeouts: IntCounter,
    pub store_access_denied: IntCounter,
    pub connected_peers: Gauge,
}

impl NodeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help)).expect("metric can be created");
                registry
                    .register(Box::new(c.clone()))
                    .expect("collector can be registered");
                c
            }};
        }

        let connected_peers = Gauge::with_opts(Opts::new(
            "peerpigeon_connected_peers",
            "Number of peers currently in the Connected state",
        ))
        .expect("metric can be created");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("collector can be registered");

        Self {
            connections_accepted: counter!("peerpigeon_connections_accepted_total", "Accepted inbound connection attempts"),
            connections_rejected: counter!("peerpigeon_connections_rejected_total", "Rejected inbound connection attempts"),
            evictions: counter!("peerpigeon_evictions_total", "Peers evicted to make room for a closer candidate"),
            broadcasts_dropped: counter!("peerpigeon_broadcasts_dropped_total", "Broadcasts dropped due to per-peer send queue backpressure"),
            dht_puts: counter!("peerpigeon_dht_puts_total", "DHT put/update operations issued"),
            dht_gets: counter!("peerpigeon_dht_gets_total", "DHT get operations issued"),
            dht_timeouts: counter!("peerpigeon_dht_timeouts_total", "DHT get operations that timed out"),
            store_access_denied: counter!("peerpigeon_store_access_denied_total", "Replicated store reads rejected by access control"),
            registry,
            connected_peers,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref METRICS: NodeMetrics = NodeMetrics::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = NodeMetrics::new();
        assert_eq!(metrics.connections_accepted.get(), 0);
        metrics.connections_accepted.inc();
        assert_eq!(metrics.connections_accepted.get(), 1);
    }
}
