#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! claimtrie-sync: keeps a relational index of LBRY name claims in step with the
//! node's block files.
//!
//! ## What you provide
//! - [`ChainSource`]: tip height, block files for a height range, raw blocks.
//!   [`BlockDirSource`] reads a node's `blk*.dat` directory directly.
//! - [`Store`]: persists claims, supports, takeovers and one cursor per block file.
//!   [`SqliteStore`] is the bundled implementation.
//!
//! ## What the sync does
//! - Reads block files in height order, prefetching the next one.
//! - Decodes claim / update / support / abandon operations from every transaction.
//! - Applies them to the in-memory [`ClaimTrie`]: activation delays, takeovers,
//!   effective amounts, expiration.
//! - Commits each file's changes together with its cursor, so a crash never loses or
//!   double-applies a block.
//! - Publishes `blockchain.sync.*` progress on an [`EventStream`].
//!
//! ## Minimal usage
//! ```rust,ignore
//! use claimtrie_sync::prelude::*;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = SyncConfig::load("claimtrie.toml")?;
//!     let blocks_dir = config.blocks_dir.clone().unwrap_or_default();
//!     let chain = BlockDirSource::new(blocks_dir, config.network.magic());
//!     let store = SqliteStore::new(config.db_path.clone().unwrap_or("claims.db".into()))?;
//!
//!     let mut sync = ClaimtrieSync::new(store, chain, config);
//!     let mut progress = sync.events().subscribe();
//!     tokio::spawn(async move {
//!         while let Some(event) = progress.recv().await {
//!             println!("{} {:?}", event.name(), event.progress());
//!         }
//!     });
//!     sync.advance().await?;
//!
//!     if let Some(state) = sync.name_state(b"foo") {
//!         println!("controlling: {:?}", state.controlling.map(|c| c.claim_hash));
//!     }
//!     Ok(())
//! }
//! ```
/// Block files, raw block parsing and the chain-source abstraction.
pub mod chain;

/// TOML settings and network selection.
pub mod config;

/// Claim operations extracted from transactions.
pub mod decoder;

/// Error taxonomy of an advance.
pub mod error;

/// Progress events and subscriptions.
pub mod events;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

/// Orchestrator that drives chain reads, trie updates and commits.
pub mod sync;

/// In-memory claim trie and consensus rules.
pub mod trie;

// Public re-exports
pub use chain::{BlockDirSource, ChainSource};
pub use config::{Network, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use events::{EventStream, SyncEvent};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::Store;
pub use sync::{AdvanceOutcome, ClaimtrieSync};
pub use trie::{Claim, ClaimHash, ClaimTrie, NameState, Support, Takeover};

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
    pub use crate::{
        AdvanceOutcome, BlockDirSource, ChainSource, ClaimHash, ClaimtrieSync, EventStream,
        Network, Store, SyncConfig, SyncError, SyncEvent,
    };
}
