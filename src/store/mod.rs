//! Persistence interfaces and implementations used by the sync
//! (claims, supports, takeovers and the per-file cursor).
use async_trait::async_trait;

use crate::trie::{Claim, ClaimHash, Support, Takeover, TrieChanges, TrieSnapshot};

/// Called with the number of claim rows written so far.
pub type RowProgressFn = Box<dyn Fn(u64) + Send + 'static>;

/// Reports claim-row progress during a commit.
pub struct RowProgress {
    /// Rows between reports. The final row count is always reported.
    pub every: u64,
    /// Receives the running row count.
    pub report: RowProgressFn,
}

/// Everything derived from one block file, committed atomically with its cursor.
pub struct CommitBatch {
    /// File the rows came from.
    pub block_file: u32,
    /// Last height applied from `block_file`.
    pub height: u32,
    /// Rows to upsert and delete.
    pub changes: TrieChanges,
    /// Optional claim-row progress.
    pub progress: Option<RowProgress>,
}

/// Relational store for the derived claim index.
#[async_trait]
pub trait Store: Send + Sync {
    /// Highest height committed by any file, `None` on a fresh store.
    async fn last_synced_height(&self) -> anyhow::Result<Option<u32>>;

    /// `(block_file, last_height)` for every file committed so far.
    async fn file_cursors(&self) -> anyhow::Result<Vec<(u32, u32)>>;

    /// All rows needed to rebuild the in-memory trie.
    async fn load_snapshot(&self) -> anyhow::Result<TrieSnapshot>;

    /// Write `batch` and advance the cursor in a single transaction.
    async fn commit(&self, batch: CommitBatch) -> anyhow::Result<()>;

    /// Claim row by hash.
    async fn claim(&self, claim_hash: ClaimHash) -> anyhow::Result<Option<Claim>>;

    /// Last takeover recorded for `name`.
    async fn takeover(&self, name: &[u8]) -> anyhow::Result<Option<Takeover>>;

    /// Claim controlling `name` at `height`: the recorded controller, provided it took
    /// over at or before `height` and is still active there.
    async fn controlling_claim(&self, name: &[u8], height: u32) -> anyhow::Result<Option<Claim>>;

    /// Claims of `name` active at `height`.
    async fn active_for_name(&self, name: &[u8], height: u32) -> anyhow::Result<Vec<Claim>>;

    /// Claims of `name` still waiting to activate as of `height`.
    async fn pending_for_name(&self, name: &[u8], height: u32) -> anyhow::Result<Vec<Claim>>;

    /// Supports of `name` still waiting to activate as of `height`.
    async fn pending_supports_for_name(
        &self,
        name: &[u8],
        height: u32,
    ) -> anyhow::Result<Vec<Support>>;

    /// Every claim row of `name`, oldest first.
    async fn claims_for_name(&self, name: &[u8]) -> anyhow::Result<Vec<Claim>>;

    /// Supports pointing at `claim_hash`.
    async fn supports_for_claim(&self, claim_hash: ClaimHash) -> anyhow::Result<Vec<Support>>;

    /// Every stored claim, oldest first.
    async fn search_claims(&self) -> anyhow::Result<Vec<Claim>>;
}

// submodules / concrete stores live here
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
