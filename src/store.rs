// Copyright (c) 2024 Botho Foundation

//! Replicated Store (C7): sealed records addressed by key, with
//! access-control metadata, layered over the DHT (§4.7). The crypto and
//! persistence collaborators are external per §1/§6; this module defines
//! their trait contracts plus a default local implementation of each,
//! grounded on `ledger/store.rs`'s `heed`-backed LMDB pattern for
//! persistence and on the crate's `chacha20poly1305`/`zeroize` dependencies
//! for a minimal sealing collaborator.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::dht::Dht;
use crate::error::{CoreError, CoreResult};
use crate::peer_id::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealPolicy {
    pub is_public: bool,
}

/// Crypto collaborator contract (§6): the core treats outputs as opaque.
pub trait CryptoCollaborator: Send + Sync {
    fn seal(&self, plaintext: &[u8], policy: &SealPolicy) -> Vec<u8>;
    fn open(&self, sealed: &[u8], identity: &PeerId) -> CoreResult<Vec<u8>>;
    fn generate_group_key(&self, group_id: &str) -> Vec<u8>;
    fn exchange_public_key(&self, peer_id: &PeerId, key: &[u8]);
}

/// Persistence collaborator contract (§6): a key -> blob byte store.
pub trait PersistenceCollaborator: Send + Sync {
    fn write(&self, key: &str, bytes: &[u8]) -> CoreResult<()>;
    fn read(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> CoreResult<()>;
    fn list(&self, prefix: &str) -> CoreResult<Vec<String>>;
    fn stats(&self) -> PersistenceStats;
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistenceStats {
    pub items: u64,
    pub size_bytes: u64,
    pub kind: &'static str,
}

/// Minimal default crypto collaborator: ChaCha20-Poly1305 under a process
/// key, a stand-in sufficient for public records and for local testing.
/// Non-public records beyond the local node's own policy are the external
/// identity/crypto subsystem's concern (§1 Non-goals); this default never
/// claims to implement multi-party key exchange.
pub struct ChaChaCryptoProvider {
    key: [u8; 32],
}

impl ChaChaCryptoProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl Drop for ChaChaCryptoProvider {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl CryptoCollaborator for ChaChaCryptoProvider {
    fn seal(&self, plaintext: &[u8], policy: &SealPolicy) -> Vec<u8> {
        if policy.is_public {
            return plaintext.to_vec();
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::default();
        cipher
            .encrypt(&nonce, plaintext)
            .unwrap_or_else(|_| plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8], _identity: &PeerId) -> CoreResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = Nonce::default();
        cipher
            .decrypt(&nonce, sealed)
            .map_err(|_| CoreError::AccessDenied)
    }

    fn generate_group_key(&self, _group_id: &str) -> Vec<u8> {
        self.key.to_vec()
    }

    fn exchange_public_key(&self, _peer_id: &PeerId, _key: &[u8]) {}
}

/// LMDB-backed local replica, adapted from the ledger's `heed` usage.
pub struct HeedPersistence {
    env: Env,
    db: Database<HeedBytes, HeedBytes>,
}

impl HeedPersistence {
    pub fn open(path: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| CoreError::ProtocolViolation(format!("failed to create store dir: {e}")))?;
        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(1)
                .map_size(256 * 1024 * 1024)
                .open(path)
        }
        .map_err(|e| CoreError::ProtocolViolation(format!("failed to open store env: {e}")))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        let db = env
            .create_database(&mut wtxn, Some("records"))
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        wtxn.commit().map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;

        info!(path = %path.display(), "opened replicated store persistence");
        Ok(Self { env, db })
    }
}

impl PersistenceCollaborator for HeedPersistence {
    fn write(&self, key: &str, bytes: &[u8]) -> CoreResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), bytes)
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        wtxn.commit().map_err(|e| CoreError::ProtocolViolation(e.to_string()))
    }

    fn read(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        Ok(self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?
            .map(|b| b.to_vec()))
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        wtxn.commit().map_err(|e| CoreError::ProtocolViolation(e.to_string()))
    }

    fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        let mut out = Vec::new();
        for item in self
            .db
            .iter(&rtxn)
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?
        {
            let (k, _) = item.map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
            if let Ok(k) = std::str::from_utf8(k) {
                if k.starts_with(prefix) {
                    out.push(k.to_string());
                }
            }
        }
        Ok(out)
    }

    fn stats(&self) -> PersistenceStats {
        let rtxn = match self.env.read_txn() {
            Ok(t) => t,
            Err(_) => return PersistenceStats { items: 0, size_bytes: 0, kind: "heed" },
        };
        let items = self.db.len(&rtxn).unwrap_or(0);
        PersistenceStats { items, size_bytes: 0, kind: "heed" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub owner: PeerId,
    pub is_public: bool,
    pub is_immutable: bool,
    pub created_at: u64,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub key: String,
    pub sealed_payload: Vec<u8>,
    pub metadata: RecordMetadata,
    pub access_list: HashSet<PeerId>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub is_public: bool,
    pub is_immutable: bool,
    pub ttl: Option<Duration>,
    pub access_list: HashSet<PeerId>,
    pub force_refresh: bool,
}

/// Thin access-controlled layer over the DHT (§4.7).
pub struct ReplicatedStore {
    self_id: PeerId,
    dht: Arc<Dht>,
    crypto: Arc<dyn CryptoCollaborator>,
    persistence: Arc<dyn PersistenceCollaborator>,
}

impl ReplicatedStore {
    pub fn new(
        self_id: PeerId,
        dht: Arc<Dht>,
        crypto: Arc<dyn CryptoCollaborator>,
        persistence: Arc<dyn PersistenceCollaborator>,
    ) -> Self {
        Self { self_id, dht, crypto, persistence }
    }

    /// Write path (§4.7): seal, attach metadata, write through the DHT, and
    /// durably persist a local copy.
    pub async fn store(&self, key: &str, plaintext: &[u8], opts: StoreOptions) -> CoreResult<()> {
        let policy = SealPolicy { is_public: opts.is_public };
        let sealed_payload = self.crypto.seal(plaintext, &policy);

        let metadata = RecordMetadata {
            owner: self.self_id,
            is_public: opts.is_public,
            is_immutable: opts.is_immutable,
            created_at: now_unix(),
            ttl_secs: opts.ttl.map(|d| d.as_secs()),
        };
        let record = SealedRecord {
            key: key.to_string(),
            sealed_payload,
            metadata,
            access_list: opts.access_list,
        };

        let bytes = bincode::serialize(&record)
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        self.dht.put(key, bytes.clone(), opts.ttl, None).await;
        self.persistence.write(key, &bytes)
    }

    /// Read path (§4.7).
    pub async fn retrieve(&self, key: &str, opts: &StoreOptions) -> CoreResult<Vec<u8>> {
        let bytes = match self.dht.get(key, opts.force_refresh).await {
            Ok(bytes) => bytes,
            Err(_) => self
                .persistence
                .read(key)?
                .ok_or(CoreError::DhtNotFound)?,
        };
        let record: SealedRecord =
            bincode::deserialize(&bytes).map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;

        if !record.metadata.is_public
            && record.metadata.owner != self.self_id
            && !record.access_list.contains(&self.self_id)
        {
            crate::metrics::METRICS.store_access_denied.inc();
            return Err(CoreError::AccessDenied);
        }

        self.crypto.open(&record.sealed_payload, &self.self_id)
    }

    async fn mutate_access(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut SealedRecord),
    ) -> CoreResult<()> {
        let bytes = self.dht.get(key, true).await.map_err(|_| CoreError::DhtNotFound)?;
        let mut record: SealedRecord =
            bincode::deserialize(&bytes).map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;

        if record.metadata.owner != self.self_id {
            return Err(CoreError::AccessDenied);
        }
        if record.metadata.is_immutable {
            return Err(CoreError::Immutable);
        }

        mutate(&mut record);

        let updated = bincode::serialize(&record)
            .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
        self.dht.update(key, updated.clone()).await;
        self.persistence.write(key, &updated)
    }

    pub async fn grant_access(&self, key: &str, peer: PeerId) -> CoreResult<()> {
        self.mutate_access(key, |record| {
            record.access_list.insert(peer);
        })
        .await
    }

    pub async fn revoke_access(&self, key: &str, peer: PeerId) -> CoreResult<()> {
        self.mutate_access(key, |record| {
            record.access_list.remove(&peer);
        })
        .await
    }

    /// Local-only bulk operations (§4.7): these never consult the network.
    pub fn list_keys(&self, prefix: &str) -> CoreResult<Vec<String>> {
        self.persistence.list(prefix)
    }

    pub fn bulk_delete(&self, prefix: &str) -> CoreResult<usize> {
        let keys = self.persistence.list(prefix)?;
        for key in &keys {
            self.persistence.delete(key)?;
        }
        Ok(keys.len())
    }

    pub fn backup(&self) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let keys = self.persistence.list("")?;
        keys.into_iter()
            .map(|k| {
                let bytes = self.persistence.read(&k)?.unwrap_or_default();
                Ok((k, bytes))
            })
            .collect()
    }

    pub fn restore(&self, snapshot: Vec<(String, Vec<u8>)>) -> CoreResult<()> {
        for (key, bytes) in snapshot {
            debug!(key = %key, "restoring record from snapshot");
            self.persistence.write(&key, &bytes)?;
        }
        Ok(())
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ConnectionManager, ConnectionManagerConfig};
    use crate::router::Router;
    use dashmap::DashMap;
    use tokio::sync::mpsc;

    struct InMemoryPersistence(parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>);

    impl InMemoryPersistence {
        fn new() -> Self {
            Self(parking_lot::Mutex::new(std::collections::HashMap::new()))
        }
    }

    impl PersistenceCollaborator for InMemoryPersistence {
        fn write(&self, key: &str, bytes: &[u8]) -> CoreResult<()> {
            self.0.lock().insert(key.to_string(), bytes.to_vec());
            Ok(())
        }
        fn read(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
            Ok(self.0.lock().get(key).cloned())
        }
        fn delete(&self, key: &str) -> CoreResult<()> {
            self.0.lock().remove(key);
            Ok(())
        }
        fn list(&self, prefix: &str) -> CoreResult<Vec<String>> {
            Ok(self.0.lock().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
        }
        fn stats(&self) -> PersistenceStats {
            PersistenceStats { items: self.0.lock().len() as u64, size_bytes: 0, kind: "memory" }
        }
    }

    fn test_store(self_id: PeerId) -> ReplicatedStore {
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
        let crypto = Arc::new(ChaChaCryptoProvider::new([7u8; 32]));
        let persistence = Arc::new(InMemoryPersistence::new());
        ReplicatedStore::new(self_id, dht, crypto, persistence)
    }

    #[tokio::test]
    async fn owner_can_store_and_retrieve_private_record() {
        let owner = PeerId::new_random();
        let store = test_store(owner);
        store
            .store("secret", b"top secret", StoreOptions { is_public: false, ..Default::default() })
            .await
            .unwrap();
        let plaintext = store.retrieve("secret", &StoreOptions::default()).await.unwrap();
        assert_eq!(plaintext, b"top secret");
    }

    #[tokio::test]
    async fn public_record_has_no_access_restriction() {
        let owner = PeerId::new_random();
        let store = test_store(owner);
        store
            .store("public", b"hello world", StoreOptions { is_public: true, ..Default::default() })
            .await
            .unwrap();
        let plaintext = store.retrieve("public", &StoreOptions::default()).await.unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[tokio::test]
    async fn immutable_record_rejects_access_mutation() {
        let owner = PeerId::new_random();
        let store = test_store(owner);
        store
            .store(
                "frozen",
                b"data",
                StoreOptions { is_public: false, is_immutable: true, ..Default::default() },
            )
            .await
            .unwrap();
        let other = PeerId::new_random();
        let result = store.grant_access("frozen", other).await;
        assert_eq!(result, Err(CoreError::Immutable));
    }
}
