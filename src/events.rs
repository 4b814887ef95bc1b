//! Progress events published while syncing.
//!
//! Events go out on a bounded broadcast channel. Nothing is buffered for
//! subscribers that attach later, and a subscriber that falls behind skips ahead
//! instead of holding up the sync.
use std::future::Future;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Prefix for every event name emitted by the block sync.
pub const SYNC_PHASE: &str = "blockchain.sync";

/// Which step of a file's processing a [`Progress`] event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Raw blocks parsed and validated.
    BlockRead,
    /// Transactions decoded and applied to the trie.
    BlockSave,
    /// Claim rows written to the store.
    ClaimUpdate,
}

impl ProgressKind {
    /// Event name after the `blockchain.sync.` prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::BlockRead => "block.read",
            Self::BlockSave => "block.save",
            Self::ClaimUpdate => "claim.update",
        }
    }
}

/// Payload of `blockchain.sync.start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStart {
    /// Last height already synced, `-1` when nothing is.
    pub starting_height: i64,
    /// Chain tip the advance will reach.
    pub ending_height: u32,
    /// Block files to read.
    pub files: usize,
    /// Blocks to apply.
    pub blocks: u64,
    /// Transactions in those blocks.
    pub txs: u64,
}

/// Payload of the per-file progress events. `step == total` marks completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Which step this reports; carried in the event name.
    #[serde(skip)]
    pub kind: ProgressKind,
    /// File being processed.
    pub block_file: u32,
    /// Units done so far.
    pub step: u64,
    /// Units in the file.
    pub total: u64,
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SyncEvent {
    /// An advance found new blocks.
    Start(SyncStart),
    /// Per-file progress.
    Progress(Progress),
    /// An advance finished.
    Block {
        /// Chain tip the advance reached.
        height: u32,
    },
}

impl SyncEvent {
    /// Dotted event name, e.g. `blockchain.sync.block.read`.
    pub fn name(&self) -> String {
        match self {
            Self::Start(_) => format!("{SYNC_PHASE}.start"),
            Self::Progress(p) => format!("{SYNC_PHASE}.{}", p.kind.suffix()),
            Self::Block { .. } => format!("{SYNC_PHASE}.block"),
        }
    }

    /// Progress payload, if this is a progress event.
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            Self::Progress(p) => Some(p),
            _ => None,
        }
    }
}

/// Publish side of the progress channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventStream {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventStream {
    /// `capacity` bounds how far a subscriber may fall behind before it skips events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a subscriber. Dropping the [`Subscription`] detaches it.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `event`. Dropped when nobody listens.
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event);
        }
    }

    /// Resolve with the first event matching `pred` published after this call.
    pub fn wait_for<F>(&self, pred: F) -> impl Future<Output = Option<SyncEvent>> + Send + 'static
    where
        F: FnMut(&SyncEvent) -> bool + Send + 'static,
    {
        let mut sub = self.subscribe();
        async move { sub.wait_for(pred).await }
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receive side of the progress channel.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
    /// Next event, `None` once every [`EventStream`] handle is gone.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "claimtrie::events", skipped, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Everything already published and not yet received.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(target: "claimtrie::events", skipped, "progress subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return out,
            }
        }
    }

    /// First event matching `pred`, `None` if the stream closes first.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<SyncEvent>
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        while let Some(event) = self.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }
}
