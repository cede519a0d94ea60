//! On-disk node state, backed by a single sled database.
//!
//! Three keys live in the default tree: the full blockchain in its binary
//! encoding, the known peer address list as JSON, and the node wallet file
//! as JSON. Everything is rewritten wholesale on save; the chain is small
//! enough that incremental persistence is not worth the complexity.
//!
//! The chain manager persists through the [`BlobStore`] impl; the strict
//! [`NodeStore::save_chain`] path exists for the shutdown flush, where a
//! write failure must surface as a nonzero exit.

use std::path::Path;

use pyrite_chain::{BlobStore, StorageError, CHAIN_KEY};
use pyrite_codec::{encode_chain, Block, CodecError};
use pyrite_wallet::{wallet_keypair_from_file, WalletError, WalletKeypair};
use tracing::info;

const ADDRESSES_KEY: &[u8] = b"addresses";
const WALLET_KEY: &[u8] = b"wallet";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("chain snapshot failed to encode: {0}")]
    Codec(#[from] CodecError),
    #[error("stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored wallet is unusable: {0}")]
    Wallet(#[from] WalletError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct NodeStore {
    db: sled::Db,
}

impl NodeStore {
    /// Opens (or creates) the node database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join("node.sled"))?;
        Ok(NodeStore { db })
    }

    /// Writes the chain snapshot, propagating any failure.
    pub fn save_chain(&self, blocks: &[Block]) -> Result<(), StoreError> {
        let encoded = encode_chain(blocks)?;
        self.db.insert(CHAIN_KEY, encoded)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_addresses(&self) -> Result<Vec<String>, StoreError> {
        match self.db.get(ADDRESSES_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn save_addresses(&self, addresses: &[String]) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(addresses)?;
        self.db.insert(ADDRESSES_KEY, encoded)?;
        self.db.flush()?;
        Ok(())
    }

    /// Loads the node wallet, generating and persisting a fresh keypair if
    /// none has been stored yet.
    pub fn load_or_create_wallet(&self) -> Result<WalletKeypair, StoreError> {
        if let Some(raw) = self.db.get(WALLET_KEY)? {
            let file = serde_json::from_slice(&raw)?;
            return Ok(wallet_keypair_from_file(&file)?);
        }
        let keypair = WalletKeypair::generate();
        let encoded = serde_json::to_vec(&keypair.to_wallet_file())?;
        self.db.insert(WALLET_KEY, encoded)?;
        self.db.flush()?;
        info!(address = %keypair.address(), "generated new node wallet");
        Ok(keypair)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlobStore for NodeStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.db.get(key) {
            Ok(value) => Ok(value.map(|raw| raw.to_vec())),
            Err(err) => Err(StorageError(err.to_string())),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db
            .insert(key, value)
            .map_err(|err| StorageError(err.to_string()))?;
        self.db
            .flush()
            .map_err(|err| StorageError(err.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .remove(key)
            .map_err(|err| StorageError(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrite_codec::decode_chain;

    fn open_temp() -> (tempfile::TempDir, NodeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn sample_block(index: u64) -> Block {
        Block::new(
            index,
            [index as u8; 32],
            1_465_154_705 + index,
            0,
            7,
            vec![pyrite_codec::Transaction {
                version: 1,
                inputs: Vec::new(),
                outputs: vec![pyrite_codec::TxOutput {
                    amount: 50,
                    lock_script: vec![0xAA],
                }],
                locktime: 0,
            }],
        )
        .unwrap()
    }

    #[test]
    fn fresh_store_is_empty() {
        let (_dir, store) = open_temp();
        assert!(store.get(CHAIN_KEY).unwrap().is_none());
        assert!(store.load_addresses().unwrap().is_empty());
    }

    #[test]
    fn save_chain_writes_the_chain_blob() {
        let (_dir, store) = open_temp();
        let chain = vec![sample_block(0), sample_block(1)];
        store.save_chain(&chain).unwrap();
        let raw = store.get(CHAIN_KEY).unwrap().unwrap();
        assert_eq!(decode_chain(&raw).unwrap(), chain);
    }

    #[test]
    fn blob_store_round_trips_and_deletes() {
        let (_dir, store) = open_temp();
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v".to_vec());
        store.delete("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn addresses_round_trip_through_store() {
        let (_dir, store) = open_temp();
        let addrs = vec!["10.0.0.1:6001".to_string(), "10.0.0.2:6001".to_string()];
        store.save_addresses(&addrs).unwrap();
        assert_eq!(store.load_addresses().unwrap(), addrs);
    }

    #[test]
    fn wallet_is_created_once_and_reloaded() {
        let (_dir, store) = open_temp();
        let first = store.load_or_create_wallet().unwrap();
        let second = store.load_or_create_wallet().unwrap();
        assert_eq!(first.address(), second.address());
        assert_eq!(first.secret_key_hex(), second.secret_key_hex());
    }
}
