//! Error surface of an advance.
use thiserror::Error;

/// Errors returned by [`ClaimtrieSync::advance`](crate::ClaimtrieSync::advance) and the
/// chain sources.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The external node (or its block files) could not be reached. Retryable by the caller.
    #[error("chain source unavailable: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),

    /// Raw block bytes failed structural validation. Fatal for the current advance.
    #[error("corrupt block data (file {block_file:?}, height {height:?}): {reason}")]
    CorruptBlockData {
        /// Block file the bytes came from, when known.
        block_file: Option<u32>,
        /// Height of the offending block, when known.
        height: Option<u32>,
        /// What was wrong with it.
        reason: String,
    },

    /// A claim-trie invariant broke during resolution. Never retried.
    #[error("claimtrie consistency violation at height {height} for name {name:?}: {detail}")]
    ConsistencyViolation {
        /// Height being applied.
        height: u32,
        /// Name being resolved (lossy utf-8).
        name: String,
        /// Which invariant failed.
        detail: String,
    },

    /// The persistent store rejected a read or a commit.
    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    pub(crate) fn corrupt(block_file: Option<u32>, height: Option<u32>, reason: impl Into<String>) -> Self {
        Self::CorruptBlockData {
            block_file,
            height,
            reason: reason.into(),
        }
    }

    pub(crate) fn violation(height: u32, name: &[u8], detail: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            height,
            name: String::from_utf8_lossy(name).into_owned(),
            detail: detail.into(),
        }
    }

    /// Whether the caller may retry the advance as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }
}

/// Shorthand for results carrying a [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;
