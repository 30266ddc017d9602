// Copyright (c) 2024 Botho Foundation

//! PeerPigeon core: a browser-capable peer-to-peer mesh networking overlay.
//!
//! A deployment consists of many [`node::Node`]s and one or more signaling
//! Hubs. Within a node the core decomposes into seven leaf-first components:
//! peer identity ([`peer_id`]), the signaling client ([`signaling`]), the
//! WebRTC transport link ([`peer_connection`]), the bounded-degree topology
//! manager ([`connection_manager`]), the gossip router ([`router`]), the
//! Kademlia-style DHT ([`dht`]), and the replicated, access-controlled
//! key/value store ([`store`]) layered on top of it.

#![deny(clippy::print_stdout)]

pub mod config;
pub mod connection_manager;
pub mod dht;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod node;
pub mod peer_connection;
pub mod peer_id;
pub mod reputation;
pub mod router;
pub mod signaling;
pub mod store;
pub mod telemetry;

pub use config::NodeConfig;
pub use envelope::{Envelope, EnvelopeKind, MessageId};
pub use error::{CoreError, CoreResult};
pub use node::Node;
pub use peer_id::PeerId;
