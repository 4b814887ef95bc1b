//! The claim-trie state machine.
//!
//! [`ClaimTrie::apply_block`] takes the decoded transactions of one block and
//! re-derives, for every affected name, the controlling claim, pending activations
//! and effective amounts. Blocks must arrive strictly in height order.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use bitcoin::OutPoint;
use tracing::{debug, trace, warn};

use crate::{
    decoder::{ClaimEvent, DecodedTx},
    error::{SyncError, SyncResult},
};

mod claim;
pub mod policy;

pub use claim::{Claim, ClaimHash, Support, Takeover, TxoPosition};
pub use policy::{ClaimtriePolicy, ConsensusParams};

/// Per-name index.
#[derive(Debug, Default, Clone)]
struct NameEntry {
    claims: BTreeSet<ClaimHash>,
    supports: BTreeSet<OutPoint>,
    takeover: Option<Takeover>,
}

impl NameEntry {
    fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.supports.is_empty() && self.takeover.is_none()
    }
}

/// Everything needed to rebuild a [`ClaimTrie`] from persisted rows.
#[derive(Debug, Default, Clone)]
pub struct TrieSnapshot {
    /// Last applied height, `None` before genesis.
    pub height: Option<u32>,
    /// Live claims.
    pub claims: Vec<Claim>,
    /// Live supports.
    pub supports: Vec<Support>,
    /// Takeover per name.
    pub takeovers: Vec<(Vec<u8>, Takeover)>,
}

/// Rows touched since the last [`ClaimTrie::take_changes`].
#[derive(Debug, Default, Clone)]
pub struct TrieChanges {
    /// Claims to upsert.
    pub claims: Vec<Claim>,
    /// Claims to delete.
    pub deleted_claims: Vec<ClaimHash>,
    /// Supports to upsert.
    pub supports: Vec<Support>,
    /// Supports to delete.
    pub deleted_supports: Vec<OutPoint>,
    /// `None` clears the name's takeover record.
    pub takeovers: Vec<(Vec<u8>, Option<Takeover>)>,
}

impl TrieChanges {
    /// Nothing to write.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
            && self.deleted_claims.is_empty()
            && self.supports.is_empty()
            && self.deleted_supports.is_empty()
            && self.takeovers.is_empty()
    }
}

#[derive(Debug, Default)]
struct Dirty {
    claims: BTreeSet<ClaimHash>,
    deleted_claims: BTreeSet<ClaimHash>,
    supports: BTreeSet<OutPoint>,
    deleted_supports: BTreeSet<OutPoint>,
    takeovers: BTreeSet<Vec<u8>>,
}

/// What one block did, for logging and callers that want to react.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    /// Applied height.
    pub height: u32,
    /// New claims.
    pub claims_created: usize,
    /// Valid updates.
    pub claims_updated: usize,
    /// Claims spent without an update.
    pub claims_abandoned: usize,
    /// New supports.
    pub supports_added: usize,
    /// Supports spent.
    pub supports_spent: usize,
    /// Names whose controlling claim changed, with the new controller.
    pub takeovers: Vec<(Vec<u8>, Option<ClaimHash>)>,
}

/// Controlling / active / accepted view of one name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NameState {
    /// Controlling claim, if it is active.
    pub controlling: Option<Claim>,
    /// Active claims other than the controlling one, oldest first.
    pub active: Vec<Claim>,
    /// Claims still waiting for their activation height, oldest first.
    pub accepted: Vec<Claim>,
}

/// In-memory claim trie. Owned by the sync orchestrator, one per sync instance.
pub struct ClaimTrie {
    policy: Arc<dyn ClaimtriePolicy>,
    height: Option<u32>,
    claims: HashMap<ClaimHash, Claim>,
    supports: HashMap<OutPoint, Support>,
    names: HashMap<Vec<u8>, NameEntry>,
    claim_outpoints: HashMap<OutPoint, ClaimHash>,
    /// Heights at which a name needs another look (activation or expiration).
    schedule: BTreeMap<u32, BTreeSet<Vec<u8>>>,
    dirty: Dirty,
}

impl ClaimTrie {
    /// Empty trie that expects genesis next.
    pub fn new(policy: Arc<dyn ClaimtriePolicy>) -> Self {
        Self {
            policy,
            height: None,
            claims: HashMap::new(),
            supports: HashMap::new(),
            names: HashMap::new(),
            claim_outpoints: HashMap::new(),
            schedule: BTreeMap::new(),
            dirty: Dirty::default(),
        }
    }

    /// Rebuild from persisted rows. The result has no pending changes.
    pub fn from_snapshot(policy: Arc<dyn ClaimtriePolicy>, snapshot: TrieSnapshot) -> Self {
        let mut trie = Self::new(policy);
        trie.height = snapshot.height;

        for claim in snapshot.claims {
            trie.claim_outpoints.insert(claim.outpoint, claim.claim_hash);
            trie.entry(&claim.name).claims.insert(claim.claim_hash);
            trie.claims.insert(claim.claim_hash, claim);
        }
        for support in snapshot.supports {
            trie.entry(&support.name).supports.insert(support.outpoint);
            trie.supports.insert(support.outpoint, support);
        }
        for (name, takeover) in snapshot.takeovers {
            trie.entry(&name).takeover = Some(takeover);
        }

        if let Some(height) = trie.height {
            let names: Vec<Vec<u8>> = trie.names.keys().cloned().collect();
            for name in names {
                trie.schedule_next(&name, height);
            }
        }
        trie
    }

    /// Last applied height.
    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// Activation and expiration rules.
    pub fn policy(&self) -> &Arc<dyn ClaimtriePolicy> {
        &self.policy
    }

    /// Live claim by hash.
    pub fn claim(&self, claim_hash: &ClaimHash) -> Option<&Claim> {
        self.claims.get(claim_hash)
    }

    /// Every live claim.
    pub fn claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values()
    }

    /// Live support by outpoint.
    pub fn support(&self, outpoint: &OutPoint) -> Option<&Support> {
        self.supports.get(outpoint)
    }

    /// Every live support.
    pub fn supports(&self) -> impl Iterator<Item = &Support> {
        self.supports.values()
    }

    /// Last takeover of `name`.
    pub fn takeover(&self, name: &[u8]) -> Option<Takeover> {
        self.names.get(name).and_then(|e| e.takeover)
    }

    /// Current controlling claim for `name`.
    pub fn controlling(&self, name: &[u8]) -> Option<&Claim> {
        self.takeover(name)
            .and_then(|t| self.claims.get(&t.claim_hash))
    }

    /// Names that currently have at least one claim, support or takeover.
    pub fn names(&self) -> impl Iterator<Item = &[u8]> {
        self.names.keys().map(Vec::as_slice)
    }

    /// Controlling / active / accepted claims of `name` as seen at `height`.
    pub fn name_state(&self, name: &[u8], height: u32) -> NameState {
        let Some(entry) = self.names.get(name) else {
            return NameState::default();
        };
        let controlling = entry
            .takeover
            .and_then(|t| self.claims.get(&t.claim_hash))
            .filter(|c| c.is_active_at(height))
            .cloned();
        let controlling_hash = controlling.as_ref().map(|c| c.claim_hash);

        let mut claims: Vec<&Claim> = entry
            .claims
            .iter()
            .filter_map(|h| self.claims.get(h))
            .collect();
        claims.sort_by_key(|c| (c.created_height, c.position));

        let active = claims
            .iter()
            .filter(|c| c.is_active_at(height) && Some(c.claim_hash) != controlling_hash)
            .map(|c| (*c).clone())
            .collect();
        let accepted = claims
            .iter()
            .filter(|c| c.is_pending_at(height))
            .map(|c| (*c).clone())
            .collect();

        NameState {
            controlling,
            active,
            accepted,
        }
    }

    /// Drain the rows changed since the previous call.
    pub fn take_changes(&mut self) -> TrieChanges {
        let dirty = std::mem::take(&mut self.dirty);
        TrieChanges {
            claims: dirty
                .claims
                .iter()
                .filter_map(|h| self.claims.get(h).cloned())
                .collect(),
            deleted_claims: dirty.deleted_claims.into_iter().collect(),
            supports: dirty
                .supports
                .iter()
                .filter_map(|op| self.supports.get(op).cloned())
                .collect(),
            deleted_supports: dirty.deleted_supports.into_iter().collect(),
            takeovers: dirty
                .takeovers
                .into_iter()
                .map(|name| {
                    let takeover = self.takeover(&name);
                    (name, takeover)
                })
                .collect(),
        }
    }

    /// Apply one block. `txs` must be in block order.
    pub fn apply_block(&mut self, height: u32, txs: &[DecodedTx]) -> SyncResult<BlockSummary> {
        let expected = self.height.map_or(0, |h| h + 1);
        if height != expected {
            return Err(SyncError::violation(
                height,
                b"",
                format!("blocks out of order: expected height {expected}"),
            ));
        }

        let mut summary = BlockSummary {
            height,
            ..Default::default()
        };
        let mut touched = self.schedule.remove(&height).unwrap_or_default();

        let spent: HashSet<OutPoint> = txs.iter().flat_map(|tx| tx.spends().copied()).collect();
        // (claim, outpoint) pairs where the spending tx also carries an update for that claim
        let mut update_spends: HashSet<(ClaimHash, OutPoint)> = HashSet::new();
        for tx in txs {
            for event in &tx.events {
                if let ClaimEvent::Update { claim_hash, .. } = event {
                    update_spends.extend(tx.spends().map(|op| (*claim_hash, *op)));
                }
            }
        }
        // claims whose outpoint may still be spent once this block's updates are in
        let mut recheck: Vec<ClaimHash> = Vec::new();

        // 1. spends of pre-existing outputs
        for op in txs.iter().flat_map(|tx| tx.spends()) {
            if let Some(support) = self.remove_support(op) {
                touched.insert(support.name);
                summary.supports_spent += 1;
            } else if let Some(&claim_hash) = self.claim_outpoints.get(op) {
                if update_spends.contains(&(claim_hash, *op)) {
                    recheck.push(claim_hash);
                } else if let Some(claim) = self.abandon(&claim_hash) {
                    trace!(target: "claimtrie::trie", height, claim = %claim_hash, "claim abandoned");
                    touched.insert(claim.name);
                    summary.claims_abandoned += 1;
                }
            }
        }

        // 2. creates
        for tx in txs {
            for event in &tx.events {
                let ClaimEvent::Create {
                    outpoint,
                    name,
                    claim_hash,
                    amount,
                    owner,
                } = event
                else {
                    continue;
                };
                if self.claims.contains_key(claim_hash) {
                    warn!(target: "claimtrie::trie", height, claim = %claim_hash, "duplicate claim hash ignored");
                    continue;
                }
                let activation_height = height + self.delay_for(name, height);
                let claim = Claim {
                    claim_hash: *claim_hash,
                    name: name.clone(),
                    outpoint: *outpoint,
                    amount: *amount,
                    owner: owner.clone(),
                    created_height: height,
                    position: TxoPosition {
                        tx_index: tx.tx_index,
                        output: outpoint.vout,
                    },
                    updated_height: height,
                    activation_height,
                    expiration_height: self.policy.expiration_height(height),
                    effective_amount: 0,
                };
                self.claim_outpoints.insert(*outpoint, *claim_hash);
                self.entry(name).claims.insert(*claim_hash);
                self.claims.insert(*claim_hash, claim);
                self.dirty.claims.insert(*claim_hash);
                self.dirty.deleted_claims.remove(claim_hash);
                touched.insert(name.clone());
                recheck.push(*claim_hash);
                summary.claims_created += 1;
            }
        }

        // 3. updates
        for tx in txs {
            for event in &tx.events {
                let ClaimEvent::Update {
                    outpoint,
                    name,
                    claim_hash,
                    amount,
                    owner,
                } = event
                else {
                    continue;
                };
                let Some(claim) = self.claims.get_mut(claim_hash) else {
                    debug!(target: "claimtrie::trie", height, claim = %claim_hash, "update of unknown claim ignored");
                    continue;
                };
                if claim.name != *name
                    || claim.is_expired_at(height)
                    || !tx.spends().any(|op| *op == claim.outpoint)
                {
                    debug!(target: "claimtrie::trie", height, claim = %claim_hash, "invalid update ignored");
                    continue;
                }
                self.claim_outpoints.remove(&claim.outpoint);
                claim.outpoint = *outpoint;
                claim.amount = *amount;
                claim.owner = owner.clone();
                claim.updated_height = height;
                // an update renews the claim: its lifetime restarts here
                claim.expiration_height = self.policy.expiration_height(height);
                self.claim_outpoints.insert(*outpoint, *claim_hash);
                self.dirty.claims.insert(*claim_hash);
                touched.insert(name.clone());
                recheck.push(*claim_hash);
                summary.claims_updated += 1;
            }
        }

        // outputs spent later in the same block without a follow-up update
        for claim_hash in recheck {
            let spent_now = self
                .claims
                .get(&claim_hash)
                .is_some_and(|c| spent.contains(&c.outpoint));
            if spent_now {
                if let Some(claim) = self.abandon(&claim_hash) {
                    touched.insert(claim.name);
                    summary.claims_abandoned += 1;
                }
            }
        }

        // 4. supports
        for tx in txs {
            for event in &tx.events {
                let ClaimEvent::Support {
                    outpoint,
                    name,
                    claim_hash,
                    amount,
                } = event
                else {
                    continue;
                };
                if spent.contains(outpoint) {
                    continue;
                }
                let controls = self
                    .takeover(name)
                    .is_some_and(|t| t.claim_hash == *claim_hash);
                let activation_height = if controls {
                    height
                } else {
                    height + self.delay_for(name, height)
                };
                let support = Support {
                    outpoint: *outpoint,
                    name: name.clone(),
                    claim_hash: *claim_hash,
                    amount: *amount,
                    created_height: height,
                    activation_height,
                    expiration_height: self.policy.expiration_height(height),
                };
                self.entry(name).supports.insert(*outpoint);
                self.supports.insert(*outpoint, support);
                self.dirty.supports.insert(*outpoint);
                self.dirty.deleted_supports.remove(outpoint);
                touched.insert(name.clone());
                summary.supports_added += 1;
            }
        }

        // 5 + 6. resolve; expired items drop out through the active filter
        for name in &touched {
            if let Some(changed) = self.resolve(name, height)? {
                summary.takeovers.push((name.clone(), changed));
            }
            self.prune_name(name);
        }

        self.height = Some(height);
        Ok(summary)
    }

    fn entry(&mut self, name: &[u8]) -> &mut NameEntry {
        self.names.entry(name.to_vec()).or_default()
    }

    fn prune_name(&mut self, name: &[u8]) {
        if self.names.get(name).is_some_and(NameEntry::is_empty) {
            self.names.remove(name);
        }
    }

    /// Delay for a new claim or a support of a non-controlling claim.
    fn delay_for(&self, name: &[u8], height: u32) -> u32 {
        match self.takeover(name) {
            Some(t) => self.policy.activation_delay(height, t.height),
            None => 0,
        }
    }

    fn remove_support(&mut self, outpoint: &OutPoint) -> Option<Support> {
        let support = self.supports.remove(outpoint)?;
        if let Some(entry) = self.names.get_mut(&support.name) {
            entry.supports.remove(outpoint);
        }
        self.dirty.supports.remove(outpoint);
        self.dirty.deleted_supports.insert(*outpoint);
        Some(support)
    }

    fn abandon(&mut self, claim_hash: &ClaimHash) -> Option<Claim> {
        let claim = self.claims.remove(claim_hash)?;
        self.claim_outpoints.remove(&claim.outpoint);
        if let Some(entry) = self.names.get_mut(&claim.name) {
            entry.claims.remove(claim_hash);
        }
        self.dirty.claims.remove(claim_hash);
        self.dirty.deleted_claims.insert(*claim_hash);
        Some(claim)
    }

    /// Active support totals per claim of `entry`.
    fn support_totals(&self, entry: &NameEntry, height: u32) -> HashMap<ClaimHash, u64> {
        let mut totals = HashMap::new();
        for support in entry.supports.iter().filter_map(|op| self.supports.get(op)) {
            if support.is_active_at(height) {
                *totals.entry(support.claim_hash).or_insert(0) += support.amount;
            }
        }
        totals
    }

    /// Best active claim of `name` by effective amount, age and position.
    fn best_claim(&self, name: &[u8], height: u32) -> Option<ClaimHash> {
        let entry = self.names.get(name)?;
        let totals = self.support_totals(entry, height);
        entry
            .claims
            .iter()
            .filter_map(|h| self.claims.get(h))
            .filter(|c| c.is_active_at(height))
            .map(|c| (c, c.amount + totals.get(&c.claim_hash).copied().unwrap_or(0)))
            .min_by(|a, b| claim::rank(*a, *b))
            .map(|(c, _)| c.claim_hash)
    }

    /// Pull every pending claim and support of `name` down to `height`.
    fn activate_pending(&mut self, name: &[u8], height: u32) -> bool {
        let Some(entry) = self.names.get(name) else {
            return false;
        };
        let mut changed = false;
        for claim_hash in &entry.claims {
            if self.claims.get_mut(claim_hash).is_some_and(|c| c.activate_by(height)) {
                self.dirty.claims.insert(*claim_hash);
                changed = true;
            }
        }
        for outpoint in &entry.supports {
            if self.supports.get_mut(outpoint).is_some_and(|s| s.activate_by(height)) {
                self.dirty.supports.insert(*outpoint);
                changed = true;
            }
        }
        changed
    }

    /// Returns `Some(new_controller)` when control of `name` changed.
    fn resolve(&mut self, name: &[u8], height: u32) -> SyncResult<Option<Option<ClaimHash>>> {
        let Some(previous) = self.names.get(name).map(|e| e.takeover) else {
            return Ok(None);
        };
        let previous_hash = previous.map(|t| t.claim_hash);

        let mut best = self.best_claim(name, height);
        let mut changed = None;
        if best != previous_hash {
            if self.activate_pending(name, height) {
                best = self.best_claim(name, height);
            }
            if best != previous_hash {
                let takeover = best.map(|claim_hash| Takeover { claim_hash, height });
                self.entry(name).takeover = takeover;
                self.dirty.takeovers.insert(name.to_vec());
                debug!(
                    target: "claimtrie::trie",
                    height,
                    name = %String::from_utf8_lossy(name),
                    from = ?previous_hash,
                    to = ?best,
                    "takeover"
                );
                changed = Some(best);
            }
        }

        self.refresh_effective(name, height);
        self.schedule_next(name, height);
        self.verify(name, height)?;
        Ok(changed)
    }

    fn refresh_effective(&mut self, name: &[u8], height: u32) {
        let Some(entry) = self.names.get(name) else {
            return;
        };
        let totals = self.support_totals(entry, height);
        for claim_hash in &entry.claims {
            let Some(claim) = self.claims.get_mut(claim_hash) else {
                continue;
            };
            let effective = if claim.is_active_at(height) {
                claim.amount + totals.get(claim_hash).copied().unwrap_or(0)
            } else {
                0
            };
            if claim.effective_amount != effective {
                claim.effective_amount = effective;
                self.dirty.claims.insert(*claim_hash);
            }
        }
    }

    /// Queue `name` for the next height at which something under it activates or expires.
    fn schedule_next(&mut self, name: &[u8], height: u32) {
        let Some(entry) = self.names.get(name) else {
            return;
        };
        let claim_heights = entry
            .claims
            .iter()
            .filter_map(|h| self.claims.get(h))
            .flat_map(|c| [c.activation_height, c.expiration_height]);
        let support_heights = entry
            .supports
            .iter()
            .filter_map(|op| self.supports.get(op))
            .flat_map(|s| [s.activation_height, s.expiration_height]);
        let next = claim_heights
            .chain(support_heights)
            .filter(|h| *h > height)
            .min();
        if let Some(next) = next {
            self.schedule.entry(next).or_default().insert(name.to_vec());
        }
    }

    fn verify(&self, name: &[u8], height: u32) -> SyncResult<()> {
        let Some(entry) = self.names.get(name) else {
            return Ok(());
        };
        for claim in entry.claims.iter().filter_map(|h| self.claims.get(h)) {
            if claim.activation_height < claim.created_height {
                return Err(SyncError::violation(
                    height,
                    name,
                    format!("claim {} activates before it was created", claim.claim_hash),
                ));
            }
        }
        let best = self.best_claim(name, height);
        match entry.takeover {
            Some(t) => {
                let claim = self.claims.get(&t.claim_hash).ok_or_else(|| {
                    SyncError::violation(
                        height,
                        name,
                        format!("controlling claim {} does not exist", t.claim_hash),
                    )
                })?;
                if !claim.is_active_at(height) {
                    return Err(SyncError::violation(
                        height,
                        name,
                        format!("controlling claim {} is not active", t.claim_hash),
                    ));
                }
                if best != Some(t.claim_hash) {
                    return Err(SyncError::violation(
                        height,
                        name,
                        format!("controlling claim {} is outranked by {best:?}", t.claim_hash),
                    ));
                }
            }
            None if best.is_some() => {
                return Err(SyncError::violation(
                    height,
                    name,
                    "active claims present but no controlling claim",
                ));
            }
            None => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClaimTrie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimTrie")
            .field("height", &self.height)
            .field("claims", &self.claims.len())
            .field("supports", &self.supports.len())
            .field("names", &self.names.len())
            .finish()
    }
}
