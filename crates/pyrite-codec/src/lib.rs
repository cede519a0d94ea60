//! Pyrite block codec
//!
//! Deterministic binary encoding for blocks and transactions, plus the
//! hashing primitives the rest of the node builds on: double-SHA256 block
//! hashes, iterated pairwise merkle roots and the leading-zero-bit measure
//! used for proof-of-work.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod varint;
pub use varint::{read_var_uint, write_var_uint, MAX_VAR_UINT};

/// Maximum allowed script size in bytes (DoS mitigation)
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum allowed number of inputs or outputs in a transaction
pub const MAX_TX_INOUTS: usize = 10_000;
/// Serialized size of a block header in bytes
pub const HEADER_SIZE: usize = 88;

/// Errors raised while encoding or decoding wire bytes
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("var uint out of range: {0} (max {max})", max = MAX_VAR_UINT)]
    VarUintRange(u64),
    #[error("input truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} trailing bytes after block")]
    TrailingBytes(usize),
    #[error("script too large: {0} bytes (max {1})")]
    TooLargeScript(usize, usize),
    #[error("too many inputs or outputs: {0} (max {1})")]
    TooManyInOut(usize, usize),
    #[error("transaction has no outputs")]
    NoOutputs,
}

/// Transaction input spending an earlier output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub source_txid: [u8; 32],
    pub output_index: u32,
    pub unlock_script: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub amount: u64,
    pub lock_script: Vec<u8>,
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    /// Validate structural policy: script sizes, in/out counts, at least
    /// one output. A coinbase transaction legitimately has zero inputs.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.inputs.len() > MAX_TX_INOUTS {
            return Err(CodecError::TooManyInOut(self.inputs.len(), MAX_TX_INOUTS));
        }
        if self.outputs.len() > MAX_TX_INOUTS {
            return Err(CodecError::TooManyInOut(self.outputs.len(), MAX_TX_INOUTS));
        }
        if self.outputs.is_empty() {
            return Err(CodecError::NoOutputs);
        }
        for input in &self.inputs {
            if input.unlock_script.len() > MAX_SCRIPT_SIZE {
                return Err(CodecError::TooLargeScript(
                    input.unlock_script.len(),
                    MAX_SCRIPT_SIZE,
                ));
            }
        }
        for output in &self.outputs {
            if output.lock_script.len() > MAX_SCRIPT_SIZE {
                return Err(CodecError::TooLargeScript(
                    output.lock_script.len(),
                    MAX_SCRIPT_SIZE,
                ));
            }
        }
        Ok(())
    }

    /// Canonical binary bytes. Layout (integers little-endian):
    /// - version: u32
    /// - input count: var uint
    /// - for each input:
    ///   - source_txid (32 bytes)
    ///   - output_index u32
    ///   - unlock_script length var uint, unlock_script bytes
    ///   - sequence u32
    /// - output count: var uint
    /// - for each output:
    ///   - amount u64
    ///   - lock_script length var uint, lock_script bytes
    /// - locktime u32
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        let mut out: Vec<u8> = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_var_uint(&mut out, self.inputs.len() as u64)?;
        for input in &self.inputs {
            out.extend_from_slice(&input.source_txid);
            out.extend_from_slice(&input.output_index.to_le_bytes());
            write_var_uint(&mut out, input.unlock_script.len() as u64)?;
            out.extend_from_slice(&input.unlock_script);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_var_uint(&mut out, self.outputs.len() as u64)?;
        for output in &self.outputs {
            out.extend_from_slice(&output.amount.to_le_bytes());
            write_var_uint(&mut out, output.lock_script.len() as u64)?;
            out.extend_from_slice(&output.lock_script);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        Ok(out)
    }

    /// Compute txid as double-SHA256 of the canonical bytes
    pub fn txid(&self) -> Result<[u8; 32], CodecError> {
        Ok(double_sha256(&self.canonical_bytes()?))
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = reader.read_u32("tx version")?;
        let input_count = reader.read_count("tx input count")?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let source_txid = reader.read_hash("input txid")?;
            let output_index = reader.read_u32("input index")?;
            let unlock_script = reader.read_script("unlock script")?;
            let sequence = reader.read_u32("input sequence")?;
            inputs.push(TxInput {
                source_txid,
                output_index,
                unlock_script,
                sequence,
            });
        }
        let output_count = reader.read_count("tx output count")?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let amount = reader.read_u64("output amount")?;
            let lock_script = reader.read_script("lock script")?;
            outputs.push(TxOutput {
                amount,
                lock_script,
            });
        }
        let locktime = reader.read_u32("tx locktime")?;
        let tx = Transaction {
            version,
            inputs,
            outputs,
            locktime,
        };
        tx.validate()?;
        Ok(tx)
    }
}

/// Block
///
/// The header commits to the transaction list through `merkle_root`; the
/// block hash is the double-SHA256 of the 88 serialized header bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u64,
    pub difficulty: u32,
    pub nonce: u32,
    pub transactions: Vec<Transaction>,
    pub hash: [u8; 32],
}

impl Block {
    /// Construct a block, computing the merkle root and hash from its fields
    pub fn new(
        index: u64,
        previous_hash: [u8; 32],
        timestamp: u64,
        difficulty: u32,
        nonce: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Self, CodecError> {
        let txids = transactions
            .iter()
            .map(|tx| tx.txid())
            .collect::<Result<Vec<_>, _>>()?;
        let merkle_root = merkle_root(&txids);
        let mut block = Block {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
            transactions,
            hash: [0u8; 32],
        };
        block.hash = block.compute_hash();
        Ok(block)
    }

    /// Serialized header. Layout (integers little-endian):
    /// - index: u64
    /// - previous_hash (32 bytes)
    /// - merkle_root (32 bytes)
    /// - timestamp: u64
    /// - difficulty: u32
    /// - nonce: u32
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..40].copy_from_slice(&self.previous_hash);
        out[40..72].copy_from_slice(&self.merkle_root);
        out[72..80].copy_from_slice(&self.timestamp.to_le_bytes());
        out[80..84].copy_from_slice(&self.difficulty.to_le_bytes());
        out[84..88].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Double-SHA256 of the serialized header
    pub fn compute_hash(&self) -> [u8; 32] {
        double_sha256(&self.header_bytes())
    }

    /// Txids of the block's transactions in order
    pub fn txids(&self) -> Result<Vec<[u8; 32]>, CodecError> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    /// Serialize the block: header bytes, then a var uint transaction
    /// count, then each transaction in canonical form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 64 * self.transactions.len());
        out.extend_from_slice(&self.header_bytes());
        write_var_uint(&mut out, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            out.extend_from_slice(&tx.canonical_bytes()?);
        }
        Ok(out)
    }

    /// Decode a block, rejecting trailing bytes. The hash is recomputed
    /// from the header bytes rather than carried on the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let block = Self::read(&mut reader)?;
        let trailing = reader.remaining();
        if trailing > 0 {
            return Err(CodecError::TrailingBytes(trailing));
        }
        Ok(block)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = reader.take(HEADER_SIZE, "block header")?;
        let hash = double_sha256(header);
        let index = u64::from_le_bytes(header[0..8].try_into().unwrap_or([0u8; 8]));
        let mut previous_hash = [0u8; 32];
        previous_hash.copy_from_slice(&header[8..40]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&header[40..72]);
        let timestamp = u64::from_le_bytes(header[72..80].try_into().unwrap_or([0u8; 8]));
        let difficulty = u32::from_le_bytes(header[80..84].try_into().unwrap_or([0u8; 4]));
        let nonce = u32::from_le_bytes(header[84..88].try_into().unwrap_or([0u8; 4]));

        let tx_count = reader.read_count("block tx count")?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::read(reader)?);
        }
        Ok(Block {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
            transactions,
            hash,
        })
    }
}

/// Serialize a whole chain: var uint block count followed by each block
pub fn encode_chain(blocks: &[Block]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    write_var_uint(&mut out, blocks.len() as u64)?;
    for block in blocks {
        out.extend_from_slice(&block.encode()?);
    }
    Ok(out)
}

/// Decode a chain serialized with [`encode_chain`]
pub fn decode_chain(bytes: &[u8]) -> Result<Vec<Block>, CodecError> {
    let mut reader = Reader::new(bytes);
    let count = reader.read_var("chain block count")?;
    // capacity clamped so a corrupt count cannot force a huge allocation
    let mut blocks = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        blocks.push(Block::read(&mut reader)?);
    }
    let trailing = reader.remaining();
    if trailing > 0 {
        return Err(CodecError::TrailingBytes(trailing));
    }
    Ok(blocks)
}

/// SHA256 applied twice
pub fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Number of leading zero bits in a hash, the proof-of-work measure
pub fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut count = 0u32;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

/// Iterated pairwise merkle root over txids. An empty list yields the zero
/// hash; an odd level duplicates its last entry.
pub fn merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut i = 0;
        while i < level.len() {
            let left = level[i];
            let right = if i + 1 < level.len() {
                level[i + 1]
            } else {
                level[i]
            };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next.push(double_sha256(&data));
            i += 2;
        }
        level = next;
    }
    level[0]
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(CodecError::Truncated(what))?;
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap_or([0u8; 4])))
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap_or([0u8; 8])))
    }

    fn read_hash(&mut self, what: &'static str) -> Result<[u8; 32], CodecError> {
        let bytes = self.take(32, what)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_var(&mut self, what: &'static str) -> Result<u64, CodecError> {
        let (value, consumed) = read_var_uint(self.buf, self.pos).map_err(|err| match err {
            CodecError::Truncated(_) => CodecError::Truncated(what),
            other => other,
        })?;
        self.pos += consumed;
        Ok(value)
    }

    /// Var uint bounded by the in/out cap, so corrupt counts fail before
    /// any allocation.
    fn read_count(&mut self, what: &'static str) -> Result<usize, CodecError> {
        let value = self.read_var(what)?;
        if value > MAX_TX_INOUTS as u64 {
            return Err(CodecError::TooManyInOut(value as usize, MAX_TX_INOUTS));
        }
        Ok(value as usize)
    }

    fn read_script(&mut self, what: &'static str) -> Result<Vec<u8>, CodecError> {
        let len = self.read_var(what)?;
        if len > MAX_SCRIPT_SIZE as u64 {
            return Err(CodecError::TooLargeScript(len as usize, MAX_SCRIPT_SIZE));
        }
        Ok(self.take(len as usize, what)?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                source_txid: [tag; 32],
                output_index: 0,
                unlock_script: vec![tag, tag],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOutput {
                amount: 50_000,
                lock_script: b"lock".to_vec(),
            }],
            locktime: 0,
        }
    }

    fn coinbase_tx(amount: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput {
                amount,
                lock_script: vec![1],
            }],
            locktime: 0,
        }
    }

    #[test]
    fn tx_binary_roundtrip() {
        let tx = sample_tx(7);
        let bytes = tx.canonical_bytes().unwrap();
        let mut reader = Reader::new(&bytes);
        let decoded = Transaction::read(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        assert_eq!(tx, decoded);
    }

    #[test]
    fn txid_is_deterministic() {
        let a = sample_tx(1).txid().unwrap();
        let b = sample_tx(1).txid().unwrap();
        let c = sample_tx(2).txid().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tx_without_outputs_rejected() {
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            locktime: 0,
        };
        match tx.validate() {
            Err(CodecError::NoOutputs) => {}
            other => panic!("expected NoOutputs, got {:?}", other),
        }
    }

    #[test]
    fn script_length_limit_errs() {
        let mut tx = sample_tx(3);
        tx.inputs[0].unlock_script = vec![0u8; MAX_SCRIPT_SIZE + 1];
        match tx.validate() {
            Err(CodecError::TooLargeScript(len, max)) => {
                assert_eq!(len, MAX_SCRIPT_SIZE + 1);
                assert_eq!(max, MAX_SCRIPT_SIZE);
            }
            other => panic!("expected TooLargeScript, got {:?}", other),
        }
    }

    #[test]
    fn block_binary_roundtrip() {
        let block = Block::new(
            3,
            [9u8; 32],
            1_465_154_800,
            4,
            42,
            vec![coinbase_tx(50), sample_tx(5)],
        )
        .unwrap();
        let bytes = block.encode().unwrap();
        let decoded = Block::decode(&bytes).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(decoded.hash, decoded.compute_hash());
    }

    #[test]
    fn block_decode_rejects_trailing_bytes() {
        let block = Block::new(0, [0u8; 32], 1_465_154_705, 0, 0, vec![]).unwrap();
        let mut bytes = block.encode().unwrap();
        bytes.push(0);
        match Block::decode(&bytes) {
            Err(CodecError::TrailingBytes(1)) => {}
            other => panic!("expected TrailingBytes, got {:?}", other),
        }
    }

    #[test]
    fn block_decode_rejects_truncated_header() {
        match Block::decode(&[0u8; HEADER_SIZE - 1]) {
            Err(CodecError::Truncated(what)) => assert_eq!(what, "block header"),
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn header_bytes_layout() {
        let block = Block::new(1, [2u8; 32], 77, 3, 9, vec![]).unwrap();
        let header = block.header_bytes();
        assert_eq!(&header[0..8], &1u64.to_le_bytes());
        assert_eq!(&header[8..40], &[2u8; 32]);
        assert_eq!(&header[40..72], &[0u8; 32]);
        assert_eq!(&header[72..80], &77u64.to_le_bytes());
        assert_eq!(&header[80..84], &3u32.to_le_bytes());
        assert_eq!(&header[84..88], &9u32.to_le_bytes());
    }

    #[test]
    fn merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn merkle_root_single_is_txid() {
        let txid = sample_tx(1).txid().unwrap();
        assert_eq!(merkle_root(&[txid]), txid);
    }

    #[test]
    fn merkle_root_odd_level_duplicates_last() {
        let a = sample_tx(1).txid().unwrap();
        let b = sample_tx(2).txid().unwrap();
        let c = sample_tx(3).txid().unwrap();
        // three leaves pair as (a,b) and (c,c)
        let ab = double_sha256(&[a, b].concat());
        let cc = double_sha256(&[c, c].concat());
        let expected = double_sha256(&[ab, cc].concat());
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn merkle_root_commits_to_order() {
        let a = sample_tx(1).txid().unwrap();
        let b = sample_tx(2).txid().unwrap();
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn leading_zero_bits_counts() {
        assert_eq!(leading_zero_bits(&[0xFF; 32]), 0);
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);

        let mut hash = [0u8; 32];
        hash[0] = 0b0001_0000;
        assert_eq!(leading_zero_bits(&hash), 3);

        let mut hash = [0u8; 32];
        hash[1] = 0x80;
        assert_eq!(leading_zero_bits(&hash), 8);
    }

    #[test]
    fn double_sha256_known_vector() {
        // double SHA256 of the empty string
        assert_eq!(
            hex::encode(double_sha256(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn chain_roundtrip() {
        let genesis = Block::new(0, [0u8; 32], 1_465_154_705, 0, 0, vec![]).unwrap();
        let next = Block::new(1, genesis.hash, 1_465_154_710, 1, 3, vec![coinbase_tx(50)]).unwrap();
        let chain = vec![genesis, next];
        let bytes = encode_chain(&chain).unwrap();
        let decoded = decode_chain(&bytes).unwrap();
        assert_eq!(chain, decoded);
    }

    #[test]
    fn chain_decode_rejects_trailing_bytes() {
        let chain = vec![Block::new(0, [0u8; 32], 1_465_154_705, 0, 0, vec![]).unwrap()];
        let mut bytes = encode_chain(&chain).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        match decode_chain(&bytes) {
            Err(CodecError::TrailingBytes(3)) => {}
            other => panic!("expected TrailingBytes, got {:?}", other),
        }
    }

    #[test]
    fn tx_serde_json_roundtrip() {
        let tx = sample_tx(9);
        let json = serde_json::to_vec(&tx).unwrap();
        let decoded: Transaction = serde_json::from_slice(&json).unwrap();
        assert_eq!(tx, decoded);
    }
}
