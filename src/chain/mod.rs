//! Abstractions for reading blocks from the external node.
use async_trait::async_trait;
use bitcoin::BlockHash;

use crate::error::SyncResult;

pub mod blk_dir;
pub mod block;

pub use blk_dir::BlockDirSource;
pub use block::{BlockError, ClaimBlock, ClaimBlockHeader};

/// A contiguous run of main-chain blocks stored in one block file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFile {
    /// `blkNNNNN.dat` number.
    pub file_number: u32,
    /// First height of the run.
    pub start_height: u32,
    /// Last height of the run, inclusive.
    pub end_height: u32,
    /// Blocks of this file inside the requested range.
    pub blocks: u32,
    /// Transactions in those blocks.
    pub txs: u64,
}

/// Raw consensus-encoded block at a known height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Best-chain height.
    pub height: u32,
    /// Block bytes without the record prefix.
    pub bytes: Vec<u8>,
}

/// Read access to the node's chain. Implementations must return blocks in ascending
/// height order and must never skip one.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Height of the best block, `None` while the chain is empty.
    async fn tip_height(&self) -> SyncResult<Option<u32>>;

    /// Block files covering `from..=to`, in height order.
    async fn block_files(&self, from: u32, to: u32) -> SyncResult<Vec<BlockFile>>;

    /// Raw blocks of `file`, one per height in `start_height..=end_height`.
    async fn read_blocks(&self, file: &BlockFile) -> SyncResult<Vec<RawBlock>>;

    /// Raw block at `height` on the best chain.
    async fn block_at_height(&self, height: u32) -> SyncResult<Option<RawBlock>>;

    /// Raw block by hash (best chain only).
    async fn block_by_hash(&self, hash: BlockHash) -> SyncResult<Option<RawBlock>>;
}
