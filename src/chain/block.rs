//! Blocks with the 112-byte claim-trie header.
use bitcoin::{
    block::Version,
    consensus::encode::{self, deserialize_partial, serialize, VarInt},
    hashes::{sha256d, Hash},
    merkle_tree,
    pow::CompactTarget,
    BlockHash, Transaction, TxMerkleNode,
};
use thiserror::Error;

/// Serialized header length: the bitcoin header plus the claim-trie root.
pub const HEADER_LEN: usize = 112;

/// Structural problems with raw block bytes.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Fewer bytes than a header.
    #[error("block is {0} bytes, shorter than a header")]
    TooShort(usize),
    /// The transaction count varint does not decode.
    #[error("bad transaction count: {0}")]
    TxCount(encode::Error),
    /// A transaction does not decode.
    #[error("transaction {index} does not decode: {source}")]
    Transaction {
        /// Position of the transaction in the block.
        index: usize,
        /// Decoder error.
        #[source]
        source: encode::Error,
    },
    /// Zero transactions announced.
    #[error("block has no transactions")]
    Empty,
    /// Bytes left over after the last transaction.
    #[error("{0} trailing bytes after the last transaction")]
    TrailingBytes(usize),
    /// Header merkle root does not match the transactions.
    #[error("merkle root mismatch")]
    MerkleMismatch,
}

/// Block header: the bitcoin fields plus the claim-trie root after the merkle root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimBlockHeader {
    /// Block version.
    pub version: Version,
    /// Hash of the previous header.
    pub prev_blockhash: BlockHash,
    /// Merkle root of the transactions.
    pub merkle_root: TxMerkleNode,
    /// Root of the claim trie after this block.
    pub claim_trie_root: [u8; 32],
    /// Block time, unix seconds.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: CompactTarget,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl ClaimBlockHeader {
    /// Read the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < HEADER_LEN {
            return Err(BlockError::TooShort(bytes.len()));
        }
        let u32_at = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let hash_at = |at: usize| {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes[at..at + 32]);
            hash
        };
        Ok(Self {
            version: Version::from_consensus(u32_at(0) as i32),
            prev_blockhash: BlockHash::from_byte_array(hash_at(4)),
            merkle_root: TxMerkleNode::from_byte_array(hash_at(36)),
            claim_trie_root: hash_at(68),
            time: u32_at(100),
            bits: CompactTarget::from_consensus(u32_at(104)),
            nonce: u32_at(108),
        })
    }

    /// Consensus encoding.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_consensus().to_le_bytes());
        out[4..36].copy_from_slice(self.prev_blockhash.as_byte_array());
        out[36..68].copy_from_slice(self.merkle_root.as_byte_array());
        out[68..100].copy_from_slice(&self.claim_trie_root);
        out[100..104].copy_from_slice(&self.time.to_le_bytes());
        out[104..108].copy_from_slice(&self.bits.to_consensus().to_le_bytes());
        out[108..112].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Double SHA-256 of the serialized header.
    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(sha256d::Hash::hash(&self.serialize()).to_byte_array())
    }
}

/// A fully decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimBlock {
    /// Decoded header.
    pub header: ClaimBlockHeader,
    /// Transactions in block order, coinbase first.
    pub txdata: Vec<Transaction>,
}

impl ClaimBlock {
    /// Decode and structurally validate raw block bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, BlockError> {
        let header = ClaimBlockHeader::parse(bytes)?;
        let mut rest = &bytes[HEADER_LEN..];

        let (count, used) = deserialize_partial::<VarInt>(rest).map_err(BlockError::TxCount)?;
        rest = &rest[used..];
        if count.0 == 0 {
            return Err(BlockError::Empty);
        }

        let mut txdata = Vec::with_capacity(count.0.min(10_000) as usize);
        for index in 0..count.0 as usize {
            let (tx, used) = deserialize_partial::<Transaction>(rest)
                .map_err(|source| BlockError::Transaction { index, source })?;
            rest = &rest[used..];
            txdata.push(tx);
        }
        if !rest.is_empty() {
            return Err(BlockError::TrailingBytes(rest.len()));
        }

        let block = Self { header, txdata };
        if block.compute_merkle_root() != Some(block.header.merkle_root) {
            return Err(BlockError::MerkleMismatch);
        }
        Ok(block)
    }

    /// Number of transactions announced right after the header, without decoding them.
    pub fn peek_tx_count(bytes: &[u8]) -> Result<u64, BlockError> {
        if bytes.len() < HEADER_LEN {
            return Err(BlockError::TooShort(bytes.len()));
        }
        deserialize_partial::<VarInt>(&bytes[HEADER_LEN..])
            .map(|(count, _)| count.0)
            .map_err(BlockError::TxCount)
    }

    /// Merkle root over the txids, `None` for an empty block.
    pub fn compute_merkle_root(&self) -> Option<TxMerkleNode> {
        let hashes = self
            .txdata
            .iter()
            .map(|tx| TxMerkleNode::from_raw_hash(tx.compute_txid().to_raw_hash()));
        merkle_tree::calculate_root(hashes)
    }

    /// Hash of the header.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Consensus encoding of the whole block.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize().to_vec();
        out.extend(serialize(&VarInt(self.txdata.len() as u64)));
        for tx in &self.txdata {
            out.extend(serialize(tx));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, transaction, Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut,
        Witness,
    };

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, tag]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn block() -> ClaimBlock {
        let mut block = ClaimBlock {
            header: ClaimBlockHeader {
                version: Version::from_consensus(1),
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                claim_trie_root: [0u8; 32],
                time: 1,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: vec![coinbase(1), coinbase(2)],
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        block
    }

    #[test]
    fn parses_serialized_block() {
        let block = block();
        let bytes = block.serialize();
        assert_eq!(ClaimBlock::peek_tx_count(&bytes).unwrap(), 2);
        let parsed = ClaimBlock::parse(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.block_hash(), block.block_hash());
    }

    #[test]
    fn rejects_structural_damage() {
        let bytes = block().serialize();
        assert!(matches!(
            ClaimBlock::parse(&bytes[..80]),
            Err(BlockError::TooShort(80))
        ));
        assert!(matches!(
            ClaimBlock::parse(&bytes[..bytes.len() - 3]),
            Err(BlockError::Transaction { index: 1, .. })
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            ClaimBlock::parse(&trailing),
            Err(BlockError::TrailingBytes(1))
        ));

        let mut bad_root = bytes;
        bad_root[40] ^= 0xff;
        assert!(matches!(
            ClaimBlock::parse(&bad_root),
            Err(BlockError::MerkleMismatch)
        ));
    }
}
