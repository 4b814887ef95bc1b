//! Orchestrator for the claim-trie sync:
//! 1) find the unsynced height range from the store cursor and the chain tip,
//! 2) read each block file (the next one is prefetched while the current one applies),
//! 3) decode and apply blocks to the trie in strict height order,
//! 4) commit the file's derived rows together with its cursor.
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    chain::{BlockFile, ChainSource, ClaimBlock, RawBlock},
    config::SyncConfig,
    decoder::decode_transaction,
    error::{SyncError, SyncResult},
    events::{EventStream, Progress, ProgressKind, SyncEvent, SyncStart},
    store::{CommitBatch, RowProgress, Store},
    trie::{ClaimTrie, ClaimtriePolicy, NameState},
};

/// Result of one [`ClaimtrieSync::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Nothing new; no events were published.
    UpToDate,
    /// Applied everything after `from` up to and including `to`.
    Synced {
        /// Height synced before the call, `None` on a fresh store.
        from: Option<u32>,
        /// Chain tip reached.
        to: u32,
    },
    /// Shutdown was requested before the tip was reached.
    Stopped {
        /// Last committed height.
        at: Option<u32>,
    },
}

/// Core sync. `S` = store, `C` = chain source.
pub struct ClaimtrieSync<S, C> {
    store: S,
    chain: Arc<C>,
    config: SyncConfig,
    policy: Arc<dyn ClaimtriePolicy>,
    events: EventStream,
    trie: Option<ClaimTrie>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S, C> ClaimtrieSync<S, C>
where
    S: Store + 'static,
    C: ChainSource + 'static,
{
    /// Create a sync over `store` and `chain`, with consensus rules taken from `config.network`.
    pub fn new(store: S, chain: C, config: SyncConfig) -> Self {
        Self {
            store,
            chain: Arc::new(chain),
            policy: config.policy(),
            events: EventStream::new(config.event_capacity),
            config,
            trie: None,
            shutdown: None,
        }
    }

    /// Replace the activation/expiration rules.
    pub fn with_policy(mut self, policy: Arc<dyn ClaimtriePolicy>) -> Self {
        self.policy = policy;
        self.trie = None;
        self
    }

    /// Stop between block-file commits once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Progress stream of this sync.
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// Backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Chain source.
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Settings in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The in-memory trie, once an advance has loaded it.
    pub fn trie(&self) -> Option<&ClaimTrie> {
        self.trie.as_ref()
    }

    /// Controlling / active / accepted claims of `name` at the synced height.
    pub fn name_state(&self, name: &[u8]) -> Option<NameState> {
        let trie = self.trie.as_ref()?;
        Some(trie.name_state(name, trie.height()?))
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Bring the derived index up to the chain tip.
    ///
    /// Safe to call repeatedly. On error, nothing past the last committed block file
    /// is kept: the in-memory trie is dropped and reloaded from the store next time.
    ///
    /// # Errors
    /// [`SyncError::SourceUnavailable`] and [`SyncError::CorruptBlockData`] from the
    /// chain source, [`SyncError::ConsistencyViolation`] from the trie, and
    /// [`SyncError::Store`] when a read or commit fails.
    pub async fn advance(&mut self) -> SyncResult<AdvanceOutcome> {
        match self.advance_to_tip().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(target: "claimtrie::sync", %err, "advance failed");
                self.trie = None;
                Err(err)
            }
        }
    }

    /// Advance once, then again after every notification, until `new_blocks` closes or
    /// shutdown is requested. Retryable source errors are logged and waited out.
    pub async fn run(&mut self, mut new_blocks: mpsc::Receiver<()>) -> SyncResult<()> {
        loop {
            match self.advance().await {
                Ok(AdvanceOutcome::Stopped { .. }) => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    warn!(target: "claimtrie::sync", %err, "chain source unavailable, waiting for next block");
                }
                Err(err) => return Err(err),
            }
            if self.shutdown_requested() || new_blocks.recv().await.is_none() {
                return Ok(());
            }
        }
    }

    async fn advance_to_tip(&mut self) -> SyncResult<AdvanceOutcome> {
        let Some(tip) = self.chain.tip_height().await? else {
            return Ok(AdvanceOutcome::UpToDate);
        };
        let synced = self
            .store
            .last_synced_height()
            .await
            .map_err(SyncError::Store)?;
        let from = synced.map_or(0, |h| h + 1);
        if from > tip {
            return Ok(AdvanceOutcome::UpToDate);
        }

        let files = self.chain.block_files(from, tip).await?;
        check_coverage(&files, from, tip)?;

        let blocks: u64 = files.iter().map(|f| u64::from(f.blocks)).sum();
        let txs: u64 = files.iter().map(|f| f.txs).sum();
        self.events.emit(SyncEvent::Start(SyncStart {
            starting_height: synced.map_or(-1, i64::from),
            ending_height: tip,
            files: files.len(),
            blocks,
            txs,
        }));
        info!(target: "claimtrie::sync", from, tip, files = files.len(), blocks, txs, "sync started");

        self.ensure_trie(synced).await?;

        // Prefetch: the reader stays at most one file ahead of the trie.
        let (file_tx, mut file_rx) = mpsc::channel::<(BlockFile, SyncResult<Vec<RawBlock>>)>(1);
        let chain = self.chain.clone();
        let reader = tokio::spawn(async move {
            for file in files {
                let read = chain.read_blocks(&file).await;
                let failed = read.is_err();
                if file_tx.send((file, read)).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut last = synced;
        while let Some((file, read)) = file_rx.recv().await {
            let raw = read?;
            self.sync_file(&file, raw).await?;
            last = Some(file.end_height);

            if self.shutdown_requested() && last != Some(tip) {
                reader.abort();
                info!(target: "claimtrie::sync", at = ?last, "sync stopped on request");
                return Ok(AdvanceOutcome::Stopped { at: last });
            }
        }
        if last != Some(tip) {
            return Err(SyncError::SourceUnavailable(anyhow::anyhow!(
                "block reader stopped at {last:?} before tip {tip}"
            )));
        }

        self.events.emit(SyncEvent::Block { height: tip });
        info!(target: "claimtrie::sync", height = tip, "sync finished");
        Ok(AdvanceOutcome::Synced {
            from: synced,
            to: tip,
        })
    }

    /// Make sure the in-memory trie sits exactly at `synced`.
    async fn ensure_trie(&mut self, synced: Option<u32>) -> SyncResult<()> {
        if self.trie.as_ref().is_some_and(|t| t.height() == synced) {
            return Ok(());
        }
        let snapshot = self.store.load_snapshot().await.map_err(SyncError::Store)?;
        if snapshot.height != synced {
            return Err(SyncError::Store(anyhow::anyhow!(
                "snapshot height {:?} does not match cursor {synced:?}",
                snapshot.height
            )));
        }
        debug!(
            target: "claimtrie::sync",
            claims = snapshot.claims.len(),
            supports = snapshot.supports.len(),
            "loaded claimtrie from store"
        );
        self.trie = Some(ClaimTrie::from_snapshot(self.policy.clone(), snapshot));
        Ok(())
    }

    async fn sync_file(&mut self, file: &BlockFile, raw: Vec<RawBlock>) -> SyncResult<()> {
        let block_file = file.file_number;
        let events = self.events.clone();
        let progress = |kind, step, total| {
            events.emit(SyncEvent::Progress(Progress {
                kind,
                block_file,
                step,
                total,
            }))
        };

        // read: structural validation
        let total_blocks = raw.len() as u64;
        let read_every = self.config.read_progress_interval.max(1);
        progress(ProgressKind::BlockRead, 0, total_blocks);
        let mut blocks: Vec<(u32, ClaimBlock)> = Vec::with_capacity(raw.len());
        for (i, rb) in raw.into_iter().enumerate() {
            let block = ClaimBlock::parse(&rb.bytes)
                .map_err(|e| SyncError::corrupt(Some(block_file), Some(rb.height), e.to_string()))?;
            if let Some((prev_height, prev)) = blocks.last() {
                if rb.height != *prev_height + 1 || block.header.prev_blockhash != prev.block_hash() {
                    return Err(SyncError::corrupt(
                        Some(block_file),
                        Some(rb.height),
                        "block does not extend the previous block",
                    ));
                }
            }
            blocks.push((rb.height, block));
            let step = i as u64 + 1;
            if step % read_every == 0 && step != total_blocks {
                progress(ProgressKind::BlockRead, step, total_blocks);
            }
        }
        progress(ProgressKind::BlockRead, total_blocks, total_blocks);

        // save: decode and apply
        let trie = self
            .trie
            .as_mut()
            .ok_or_else(|| SyncError::Store(anyhow::anyhow!("claimtrie not loaded")))?;
        let total_txs: u64 = blocks.iter().map(|(_, b)| b.txdata.len() as u64).sum();
        let save_every = self.config.save_progress_interval.max(1);
        progress(ProgressKind::BlockSave, 0, total_txs);
        let (mut done, mut reported) = (0u64, 0u64);
        let mut last_height = file.end_height;
        for (height, block) in &blocks {
            let decoded: Vec<_> = block
                .txdata
                .iter()
                .enumerate()
                .map(|(i, tx)| decode_transaction(i as u32, tx))
                .collect();
            let summary = trie.apply_block(*height, &decoded)?;
            if !summary.takeovers.is_empty() {
                debug!(target: "claimtrie::sync", height, takeovers = summary.takeovers.len(), "control changed");
            }
            done += block.txdata.len() as u64;
            if done - reported >= save_every && done != total_txs {
                progress(ProgressKind::BlockSave, done, total_txs);
                reported = done;
            }
            last_height = *height;
        }
        progress(ProgressKind::BlockSave, total_txs, total_txs);

        // commit
        let changes = trie.take_changes();
        let total_rows = changes.claims.len() as u64;
        if total_rows > 0 {
            progress(ProgressKind::ClaimUpdate, 0, total_rows);
        }
        let row_events = self.events.clone();
        let batch = CommitBatch {
            block_file,
            height: last_height,
            changes,
            progress: Some(RowProgress {
                every: self.config.claim_progress_interval.max(1),
                report: Box::new(move |step| {
                    row_events.emit(SyncEvent::Progress(Progress {
                        kind: ProgressKind::ClaimUpdate,
                        block_file,
                        step,
                        total: total_rows,
                    }))
                }),
            }),
        };
        self.store
            .commit(batch)
            .await
            .map_err(SyncError::Store)?;
        info!(target: "claimtrie::sync", block_file, height = last_height, claims = total_rows, "committed block file");
        Ok(())
    }
}

/// The source must hand back exactly `from..=tip`, in order, without gaps.
fn check_coverage(files: &[BlockFile], from: u32, tip: u32) -> SyncResult<()> {
    let mut next = from;
    for file in files {
        if file.start_height != next || file.end_height < file.start_height {
            return Err(SyncError::corrupt(
                Some(file.file_number),
                Some(next),
                format!(
                    "block file covers {}..={}, expected to start at {next}",
                    file.start_height, file.end_height
                ),
            ));
        }
        next = file.end_height + 1;
    }
    if next != tip + 1 {
        return Err(SyncError::corrupt(None, Some(next), format!("block files end before tip {tip}")));
    }
    Ok(())
}
