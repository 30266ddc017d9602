// Copyright (c) 2024 Botho Foundation

//! Durability of the replicated store's default collaborators: a record
//! written through `HeedPersistence` survives closing and reopening the
//! LMDB environment at the same path, and `backup`/`restore` round-trip
//! through the real on-disk backend rather than the in-memory test double.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use peerpigeon::connection_manager::{ConnectionManager, ConnectionManagerConfig};
use peerpigeon::dht::Dht;
use peerpigeon::peer_id::PeerId;
use peerpigeon::router::Router;
use peerpigeon::store::{ChaChaCryptoProvider, HeedPersistence, ReplicatedStore, StoreOptions};

fn solo_store(self_id: PeerId, data_dir: &std::path::Path) -> ReplicatedStore {
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
    let links = Arc::new(DashMap::new());
    let (router_tx, _router_rx) = mpsc::channel(64);
    let router = Arc::new(Router::new(self_id, connections, links, 128, router_tx));
    let dht = Dht::new(self_id, router, Arc::new(Vec::new), 3);
    let crypto = Arc::new(ChaChaCryptoProvider::new([9u8; 32]));
    let persistence = Arc::new(HeedPersistence::open(data_dir).expect("open store env"));
    ReplicatedStore::new(self_id, dht, crypto, persistence)
}

#[tokio::test]
async fn record_survives_reopening_the_heed_environment() {
    let dir = tempfile::tempdir().unwrap();
    let self_id = PeerId::new_random();

    {
        let store = solo_store(self_id, dir.path());
        store
            .store("alpha", b"first run", StoreOptions { is_public: true, ..Default::default() })
            .await
            .unwrap();
    }

    let store = solo_store(self_id, dir.path());
    let value = store.retrieve("alpha", &StoreOptions::default()).await.unwrap();
    assert_eq!(value, b"first run");
}

#[tokio::test]
async fn backup_and_restore_round_trip_through_heed() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let self_id = PeerId::new_random();

    let src = solo_store(self_id, src_dir.path());
    src.store("a", b"one", StoreOptions { is_public: true, ..Default::default() }).await.unwrap();
    src.store("b", b"two", StoreOptions { is_public: true, ..Default::default() }).await.unwrap();
    let snapshot = src.backup().unwrap();
    assert_eq!(snapshot.len(), 2);

    let dst = solo_store(PeerId::new_random(), dst_dir.path());
    dst.restore(snapshot).unwrap();

    assert_eq!(dst.retrieve("a", &StoreOptions::default()).await.unwrap(), b"one");
    assert_eq!(dst.retrieve("b", &StoreOptions::default()).await.unwrap(), b"two");
}

#[tokio::test]
async fn bulk_delete_removes_only_matching_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let self_id = PeerId::new_random();
    let store = solo_store(self_id, dir.path());

    store.store("keep/a", b"1", StoreOptions { is_public: true, ..Default::default() }).await.unwrap();
    store.store("drop/a", b"2", StoreOptions { is_public: true, ..Default::default() }).await.unwrap();
    store.store("drop/b", b"3", StoreOptions { is_public: true, ..Default::default() }).await.unwrap();

    let removed = store.bulk_delete("drop/").unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.list_keys("").unwrap(), vec!["keep/a".to_string()]);
}
