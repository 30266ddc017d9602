// Copyright (c) 2024 Botho Foundation

//! Exercises `Node::new` end to end: every one of C1-C7 gets wired up behind
//! a single handle, against a hub that refuses the connection, and shutdown
//! is safe to call more than once.

use peerpigeon::config::NodeConfig;
use peerpigeon::Node;

fn unreachable_hub_config(data_dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.hub_uri = "ws://127.0.0.1:1".to_string();
    config.data_dir = data_dir.to_path_buf();
    config.max_reconnect_attempts = 0;
    config
}

#[tokio::test]
async fn node_starts_with_no_peers_and_shuts_down_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_hub_config(dir.path());

    let node = Node::new(config, None).await.expect("node construction");
    assert_eq!(node.stats().connected_peers, 0);

    node.shutdown().await;
    node.shutdown().await;
}

#[tokio::test]
async fn node_store_is_usable_immediately_after_construction() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_hub_config(dir.path());
    let node = Node::new(config, None).await.expect("node construction");

    node.store
        .store(
            "greeting",
            b"hello, mesh",
            peerpigeon::store::StoreOptions { is_public: true, ..Default::default() },
        )
        .await
        .expect("local store write succeeds without any peers");

    let value = node
        .store
        .retrieve("greeting", &peerpigeon::store::StoreOptions::default())
        .await
        .expect("local retrieve succeeds from the freshly written record");
    assert_eq!(value, b"hello, mesh");

    node.shutdown().await;
}

#[tokio::test]
async fn node_router_and_dht_handles_are_shared_with_the_owning_node() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_hub_config(dir.path());
    let node = Node::new(config, None).await.expect("node construction");

    let dht = node.dht();
    dht.put("shared", b"via handle".to_vec(), None, None).await;
    let value = dht.get("shared", false).await.expect("stored locally, single known peer is self");
    assert_eq!(value, b"via handle");

    node.shutdown().await;
}
