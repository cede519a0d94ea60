//! Pyrite chain manager
//!
//! Owns the canonical block list behind a single mutex and implements
//! validation, proof-of-work mining, difficulty retargeting and the
//! length-based fork choice. Mining runs outside the lock; a block mined
//! against a tip that has since moved is rejected with [`ChainError::RaceLost`].

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use pyrite_codec::{
    decode_chain, encode_chain, leading_zero_bits, merkle_root, Block, CodecError, Transaction,
};
use tracing::{info, warn};

/// Target seconds between blocks
pub const BLOCK_GENERATION_INTERVAL_SECS: u64 = 5;
/// Difficulty is re-evaluated every this many blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2;
/// Tolerated clock drift for block timestamps, in seconds
pub const TIMESTAMP_DRIFT_SECS: u64 = 60;
/// Upper bound on nonce attempts for a single mining call
pub const MAX_MINE_ATTEMPTS: u64 = 1 << 32;

/// Genesis constants, fixed for the network
pub const GENESIS_TIMESTAMP: u64 = 1_465_154_705;

/// Store key under which the chain snapshot lives
pub const CHAIN_KEY: &str = "blockchain";

/// Opaque storage failure surfaced by a [`BlobStore`] backend
#[derive(Debug, thiserror::Error)]
#[error("storage failure: {0}")]
pub struct StorageError(pub String);

/// The persistence boundary the chain manager writes through. Backends
/// only need blob get/put/delete on string keys.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain manager not initialized")]
    NotInitialized,
    #[error("chain manager already initialized")]
    AlreadyInitialized,
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("tip changed while mining")]
    RaceLost,
    #[error("nonce space exhausted after {0} attempts")]
    MiningExhausted(u64),
    #[error("chain lock poisoned")]
    Lock,
    #[error("system clock before unix epoch")]
    Clock,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Notifications emitted by the manager for the gossip layer
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockGenerated(Block),
}

/// The genesis block every node agrees on
pub fn genesis_block() -> Block {
    let mut block = Block {
        index: 0,
        previous_hash: [0u8; 32],
        merkle_root: [0u8; 32],
        timestamp: GENESIS_TIMESTAMP,
        difficulty: 0,
        nonce: 0,
        transactions: vec![],
        hash: [0u8; 32],
    };
    block.hash = block.compute_hash();
    block
}

pub struct ChainManager {
    inner: Mutex<Option<Vec<Block>>>,
    events: Option<Sender<ChainEvent>>,
    store: Option<Arc<dyn BlobStore>>,
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            events: None,
            store: None,
        }
    }

    /// Manager that notifies the given channel when local mining extends
    /// the chain.
    pub fn with_events(events: Sender<ChainEvent>) -> Self {
        Self {
            inner: Mutex::new(None),
            events: Some(events),
            store: None,
        }
    }

    /// Attach the store used by [`ChainManager::init`] and
    /// [`ChainManager::save_locally`].
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Install the starting chain from the attached store. A persisted
    /// chain must decode and validate from genesis; any failure falls back
    /// to a fresh genesis chain with a warning. Calling twice is an error.
    pub fn init(&self) -> Result<(), ChainError> {
        let stored = self.load_stored();
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Err(ChainError::AlreadyInitialized);
        }
        let chain = match stored {
            Some(chain) => {
                info!(height = chain.len(), "loaded persisted chain");
                chain
            }
            None => {
                info!("starting fresh chain from genesis");
                vec![genesis_block()]
            }
        };
        *guard = Some(chain);
        Ok(())
    }

    fn load_stored(&self) -> Option<Vec<Block>> {
        let store = self.store.as_ref()?;
        let raw = match store.get(CHAIN_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "failed to read persisted chain");
                return None;
            }
        };
        let chain = match decode_chain(&raw) {
            Ok(chain) => chain,
            Err(err) => {
                warn!(error = %err, "persisted chain is corrupt");
                return None;
            }
        };
        if !is_valid_chain(&chain) {
            warn!("persisted chain fails validation");
            return None;
        }
        Some(chain)
    }

    /// Persist the current chain through the attached store. Storage
    /// failures are logged and left for the next persistence tick; only
    /// lifecycle errors propagate.
    pub fn save_locally(&self) -> Result<(), ChainError> {
        let snapshot = self.chain()?;
        let Some(ref store) = self.store else {
            return Ok(());
        };
        let encoded = encode_chain(&snapshot)?;
        match store.put(CHAIN_KEY, &encoded) {
            Ok(()) => info!(height = snapshot.len(), "persisted chain"),
            Err(err) => warn!(error = %err, "failed to persist chain"),
        }
        Ok(())
    }

    /// Snapshot of the full chain
    pub fn chain(&self) -> Result<Vec<Block>, ChainError> {
        let guard = self.lock()?;
        Ok(required(&guard)?.clone())
    }

    pub fn height(&self) -> Result<usize, ChainError> {
        let guard = self.lock()?;
        Ok(required(&guard)?.len())
    }

    pub fn latest_block(&self) -> Result<Block, ChainError> {
        let guard = self.lock()?;
        let chain = required(&guard)?;
        chain
            .last()
            .cloned()
            .ok_or_else(|| ChainError::NotFound("latest".to_string()))
    }

    /// Look up a block by its hash
    pub fn block_by_hash(&self, hash: &[u8; 32]) -> Result<Block, ChainError> {
        let guard = self.lock()?;
        let chain = required(&guard)?;
        chain
            .iter()
            .find(|b| b.hash == *hash)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(to_hex(hash)))
    }

    /// Mine the next block on top of the current tip. The nonce search runs
    /// without holding the lock; if another block lands on the tip in the
    /// meantime the freshly mined block is discarded.
    pub fn generate_next_block(
        &self,
        transactions: Vec<Transaction>,
    ) -> Result<Block, ChainError> {
        let (previous, difficulty) = {
            let guard = self.lock()?;
            let chain = required(&guard)?;
            let previous = chain
                .last()
                .cloned()
                .ok_or_else(|| ChainError::NotFound("latest".to_string()))?;
            (previous, next_difficulty(chain))
        };
        let timestamp = unix_now()?;
        let block = mine_block(
            previous.index + 1,
            previous.hash,
            timestamp,
            difficulty,
            transactions,
            MAX_MINE_ATTEMPTS,
        )?;

        self.append_mined(previous.hash, block.clone())?;
        info!(
            index = block.index,
            difficulty = block.difficulty,
            nonce = block.nonce,
            hash = %to_hex(&block.hash),
            "mined block"
        );
        if let Some(ref events) = self.events {
            let _ = events.send(ChainEvent::BlockGenerated(block.clone()));
        }
        Ok(block)
    }

    /// Append a freshly mined block, but only if the tip is still the
    /// parent it was mined against.
    fn append_mined(&self, expected_parent: [u8; 32], block: Block) -> Result<(), ChainError> {
        let mut guard = self.lock()?;
        let chain = required_mut(&mut guard)?;
        let tip = chain
            .last()
            .ok_or_else(|| ChainError::NotFound("latest".to_string()))?;
        if tip.hash != expected_parent {
            return Err(ChainError::RaceLost);
        }
        chain.push(block);
        Ok(())
    }

    /// Append a block received from the network. Returns `false` when the
    /// block fails validation against the current tip.
    pub fn add_block(&self, block: Block) -> Result<bool, ChainError> {
        let mut guard = self.lock()?;
        let chain = required_mut(&mut guard)?;
        let tip = chain
            .last()
            .ok_or_else(|| ChainError::NotFound("latest".to_string()))?;
        if !is_valid_new_block(&block, tip) {
            return Ok(false);
        }
        info!(index = block.index, hash = %to_hex(&block.hash), "appended block");
        chain.push(block);
        Ok(true)
    }

    /// Length-based fork choice: adopt `candidate` only when it validates
    /// from genesis and is strictly longer than the local chain.
    pub fn replace_chain(&self, candidate: Vec<Block>) -> Result<bool, ChainError> {
        if !is_valid_chain(&candidate) {
            warn!("rejecting replacement chain: invalid");
            return Ok(false);
        }
        let mut guard = self.lock()?;
        let chain = required_mut(&mut guard)?;
        if candidate.len() <= chain.len() {
            return Ok(false);
        }
        info!(
            old_height = chain.len(),
            new_height = candidate.len(),
            "replacing chain"
        );
        *chain = candidate;
        Ok(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<Block>>>, ChainError> {
        self.inner.lock().map_err(|_| ChainError::Lock)
    }
}

fn required<'a>(guard: &'a Option<Vec<Block>>) -> Result<&'a Vec<Block>, ChainError> {
    guard.as_ref().ok_or(ChainError::NotInitialized)
}

fn required_mut<'a>(guard: &'a mut Option<Vec<Block>>) -> Result<&'a mut Vec<Block>, ChainError> {
    guard.as_mut().ok_or(ChainError::NotInitialized)
}

/// Bounded nonce search over the header bytes. The merkle root and all
/// other header fields stay fixed; only the nonce varies.
pub fn mine_block(
    index: u64,
    previous_hash: [u8; 32],
    timestamp: u64,
    difficulty: u32,
    transactions: Vec<Transaction>,
    max_attempts: u64,
) -> Result<Block, ChainError> {
    let mut block = Block::new(index, previous_hash, timestamp, difficulty, 0, transactions)?;
    let mut header = block.header_bytes();
    for attempt in 0..max_attempts {
        let nonce = (attempt & 0xFFFF_FFFF) as u32;
        header[84..88].copy_from_slice(&nonce.to_le_bytes());
        let hash = pyrite_codec::double_sha256(&header);
        if leading_zero_bits(&hash) >= difficulty {
            block.nonce = nonce;
            block.hash = hash;
            return Ok(block);
        }
    }
    Err(ChainError::MiningExhausted(max_attempts))
}

/// The five ordered rules a block must pass against the current tip
pub fn is_valid_new_block(block: &Block, previous: &Block) -> bool {
    let Some(expected_index) = previous.index.checked_add(1) else {
        warn!(index = block.index, "rejected block: predecessor index at maximum");
        return false;
    };
    if expected_index != block.index {
        warn!(
            expected = expected_index,
            got = block.index,
            "rejected block: invalid index"
        );
        return false;
    }
    if previous.hash != block.previous_hash {
        warn!(index = block.index, "rejected block: previous hash mismatch");
        return false;
    }
    if !has_valid_timestamp(block, previous) {
        warn!(
            index = block.index,
            timestamp = block.timestamp,
            "rejected block: timestamp outside window"
        );
        return false;
    }
    if !has_valid_content(block) {
        warn!(index = block.index, "rejected block: hash or merkle root mismatch");
        return false;
    }
    if leading_zero_bits(&block.hash) < block.difficulty {
        warn!(
            index = block.index,
            difficulty = block.difficulty,
            "rejected block: insufficient proof of work"
        );
        return false;
    }
    true
}

/// A timestamp is acceptable when it is at most a minute before the
/// previous block and at most a minute ahead of local time.
fn has_valid_timestamp(block: &Block, previous: &Block) -> bool {
    // saturating: timestamps are peer-supplied and may sit at u64::MAX
    let now = unix_now().unwrap_or(0);
    block.timestamp.saturating_add(TIMESTAMP_DRIFT_SECS) > previous.timestamp
        && block.timestamp < now.saturating_add(TIMESTAMP_DRIFT_SECS)
}

/// The stored hash must match the header bytes and the stored merkle root
/// must match the transaction list.
fn has_valid_content(block: &Block) -> bool {
    let Ok(txids) = block.txids() else {
        return false;
    };
    merkle_root(&txids) == block.merkle_root && block.compute_hash() == block.hash
}

/// Full-chain validation: exact genesis, then every link in order
pub fn is_valid_chain(chain: &[Block]) -> bool {
    let Some(first) = chain.first() else {
        return false;
    };
    if *first != genesis_block() {
        return false;
    }
    chain
        .windows(2)
        .all(|pair| is_valid_new_block(&pair[1], &pair[0]))
}

/// Difficulty for the next block. Outside an adjustment boundary the tip's
/// difficulty carries forward unchanged.
pub fn next_difficulty(chain: &[Block]) -> u32 {
    let Some(latest) = chain.last() else {
        return 0;
    };
    if latest.index % DIFFICULTY_ADJUSTMENT_INTERVAL == 0 && latest.index != 0 {
        adjusted_difficulty(chain, latest)
    } else {
        latest.difficulty
    }
}

/// Compare the time the last adjustment window actually took against the
/// expected time: twice too fast raises difficulty by one, twice too slow
/// lowers it, floored at zero.
fn adjusted_difficulty(chain: &[Block], latest: &Block) -> u32 {
    let Some(anchor) = chain.len().checked_sub(DIFFICULTY_ADJUSTMENT_INTERVAL as usize) else {
        return latest.difficulty;
    };
    let Some(anchor_block) = chain.get(anchor) else {
        return latest.difficulty;
    };
    let expected = BLOCK_GENERATION_INTERVAL_SECS * DIFFICULTY_ADJUSTMENT_INTERVAL;
    let taken = latest.timestamp.saturating_sub(anchor_block.timestamp);
    if taken < expected / 2 {
        latest.difficulty + 1
    } else if taken > expected * 2 {
        latest.difficulty.saturating_sub(1)
    } else {
        latest.difficulty
    }
}

fn unix_now() -> Result<u64, ChainError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ChainError::Clock)
}

fn to_hex(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}
