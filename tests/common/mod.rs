#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, MutexGuard,
};

use anyhow::anyhow;
use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::Version,
    hashes::Hash,
    opcodes::{
        all::{OP_2DROP, OP_DROP},
        Opcode,
    },
    pow::CompactTarget,
    script::{Builder, PushBytesBuf},
    transaction, Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, WPubkeyHash, Witness,
};
use claimtrie_sync::{
    chain::{BlockFile, ChainSource, ClaimBlock, ClaimBlockHeader, RawBlock},
    decoder::{OP_CLAIM_NAME, OP_SUPPORT_CLAIM, OP_UPDATE_CLAIM},
    ClaimHash, ClaimtrieSync, Network, SqliteStore, SyncConfig, SyncError, SyncResult,
};

pub const COIN: u64 = 100_000_000;

/// ------- Transactions -------

static FUNDING: AtomicU32 = AtomicU32::new(1);

/// An outpoint nothing in the trie knows about; stands in for a wallet coin.
fn funding() -> OutPoint {
    let n = FUNDING.fetch_add(1, Ordering::Relaxed);
    let mut txid = [0xee; 32];
    txid[..4].copy_from_slice(&n.to_le_bytes());
    OutPoint {
        txid: Txid::from_byte_array(txid),
        vout: 0,
    }
}

fn owner() -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([7u8; 20]))
}

fn push(bytes: &[u8]) -> PushBytesBuf {
    PushBytesBuf::try_from(bytes.to_vec()).unwrap()
}

fn with_owner(prefix: Builder) -> ScriptBuf {
    let mut bytes = prefix.into_script().into_bytes();
    bytes.extend_from_slice(owner().as_bytes());
    ScriptBuf::from_bytes(bytes)
}

pub fn claim_script(name: &str) -> ScriptBuf {
    with_owner(
        Builder::new()
            .push_opcode(Opcode::from(OP_CLAIM_NAME))
            .push_slice(push(name.as_bytes()))
            .push_slice(push(b"{\"title\":\"test\"}"))
            .push_opcode(OP_2DROP)
            .push_opcode(OP_DROP),
    )
}

pub fn update_script(name: &str, claim_hash: ClaimHash) -> ScriptBuf {
    with_owner(
        Builder::new()
            .push_opcode(Opcode::from(OP_UPDATE_CLAIM))
            .push_slice(push(name.as_bytes()))
            .push_slice(push(claim_hash.as_bytes()))
            .push_slice(push(b"{\"title\":\"updated\"}"))
            .push_opcode(OP_2DROP)
            .push_opcode(OP_2DROP),
    )
}

pub fn support_script(name: &str, claim_hash: ClaimHash) -> ScriptBuf {
    with_owner(
        Builder::new()
            .push_opcode(Opcode::from(OP_SUPPORT_CLAIM))
            .push_slice(push(name.as_bytes()))
            .push_slice(push(claim_hash.as_bytes()))
            .push_opcode(OP_2DROP)
            .push_opcode(OP_DROP),
    )
}

fn tx(inputs: Vec<OutPoint>, outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .into_iter()
            .map(|(script_pubkey, sat)| TxOut {
                value: Amount::from_sat(sat),
                script_pubkey,
            })
            .collect(),
    }
}

/// New claim on `name` at output 0.
pub fn claim(name: &str, amount: u64) -> Transaction {
    tx(vec![funding()], vec![(claim_script(name), amount)])
}

/// Update of `claim_hash`, spending `prev` (the claim's current output).
pub fn update(prev: OutPoint, name: &str, claim_hash: ClaimHash, amount: u64) -> Transaction {
    tx(vec![prev, funding()], vec![(update_script(name, claim_hash), amount)])
}

pub fn support(name: &str, claim_hash: ClaimHash, amount: u64) -> Transaction {
    tx(vec![funding()], vec![(support_script(name, claim_hash), amount)])
}

/// Spend `prev` into a plain payment.
pub fn abandon(prev: OutPoint) -> Transaction {
    tx(vec![prev], vec![(owner(), 1_000)])
}

/// Output 0 of `tx`.
pub fn outpoint(tx: &Transaction) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout: 0,
    }
}

/// Claim hash of a claim created at output 0 of `tx`.
pub fn claim_hash(tx: &Transaction) -> ClaimHash {
    ClaimHash::from_outpoint(&outpoint(tx))
}

/// ------- In-memory chain -------

struct StoredBlock {
    file: u32,
    block: ClaimBlock,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<StoredBlock>,
    file: u32,
    unavailable: bool,
    /// Highest height the node admits to having.
    visible_tip: Option<u32>,
}

impl ChainState {
    fn tip(&self) -> Option<u32> {
        let tip = self.blocks.len().checked_sub(1).map(|h| h as u32)?;
        Some(self.visible_tip.map_or(tip, |cap| cap.min(tip)))
    }
}

/// A node's chain, shared between the test and the sync under test.
#[derive(Clone, Default)]
pub struct TestChain {
    state: Arc<Mutex<ChainState>>,
}

impl TestChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn tip(&self) -> Option<u32> {
        self.state().blocks.len().checked_sub(1).map(|h| h as u32)
    }

    /// Mine one block holding a coinbase plus `txs`; returns its height.
    pub fn mine(&self, txs: Vec<Transaction>) -> u32 {
        let mut state = self.state();
        let height = state.blocks.len() as u32;
        let prev_blockhash = state
            .blocks
            .last()
            .map_or(BlockHash::all_zeros(), |b| b.block.block_hash());

        let coinbase = Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(height.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(COIN),
                script_pubkey: owner(),
            }],
        };
        let mut block = ClaimBlock {
            header: ClaimBlockHeader {
                version: Version::from_consensus(536_870_912),
                prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                claim_trie_root: [0u8; 32],
                time: 1_600_000_000 + height,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: std::iter::once(coinbase).chain(txs).collect(),
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        let bytes = block.serialize();
        let file = state.file;
        state.blocks.push(StoredBlock { file, block, bytes });
        height
    }

    /// Mine empty blocks until the tip reaches `height`.
    pub fn mine_to(&self, height: u32) {
        while self.tip().map_or(true, |tip| tip < height) {
            self.mine(vec![]);
        }
    }

    /// Blocks mined from now on land in the next block file.
    pub fn next_file(&self) {
        self.state().file += 1;
    }

    /// Damage the stored bytes of the block at `height` (its merkle root).
    pub fn corrupt(&self, height: u32) {
        self.state().blocks[height as usize].bytes[40] ^= 0xff;
    }

    pub fn repair(&self, height: u32) {
        let mut state = self.state();
        let stored = &mut state.blocks[height as usize];
        stored.bytes = stored.block.serialize();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Pretend the node only has blocks up to `height` (`None` shows everything).
    pub fn hide_above(&self, height: Option<u32>) {
        self.state().visible_tip = height;
    }

    /// `(file, bytes)` of every block, in height order.
    pub fn raw_blocks(&self) -> Vec<(u32, Vec<u8>)> {
        self.state()
            .blocks
            .iter()
            .map(|b| (b.file, b.bytes.clone()))
            .collect()
    }

    fn check_online(state: &ChainState) -> SyncResult<()> {
        if state.unavailable {
            return Err(SyncError::SourceUnavailable(anyhow!("node offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for TestChain {
    async fn tip_height(&self) -> SyncResult<Option<u32>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.tip())
    }

    async fn block_files(&self, from: u32, to: u32) -> SyncResult<Vec<BlockFile>> {
        let state = self.state();
        Self::check_online(&state)?;
        let mut files: Vec<BlockFile> = Vec::new();
        let Some(tip) = state.tip() else {
            return Ok(files);
        };
        for height in from..=to.min(tip) {
            let Some(stored) = state.blocks.get(height as usize) else {
                break;
            };
            let txs = stored.block.txdata.len() as u64;
            match files.last_mut() {
                Some(run) if run.file_number == stored.file => {
                    run.end_height = height;
                    run.blocks += 1;
                    run.txs += txs;
                }
                _ => files.push(BlockFile {
                    file_number: stored.file,
                    start_height: height,
                    end_height: height,
                    blocks: 1,
                    txs,
                }),
            }
        }
        Ok(files)
    }

    async fn read_blocks(&self, file: &BlockFile) -> SyncResult<Vec<RawBlock>> {
        let state = self.state();
        Self::check_online(&state)?;
        (file.start_height..=file.end_height)
            .map(|height| {
                state
                    .blocks
                    .get(height as usize)
                    .map(|b| RawBlock {
                        height,
                        bytes: b.bytes.clone(),
                    })
                    .ok_or_else(|| SyncError::SourceUnavailable(anyhow!("no block at {height}")))
            })
            .collect()
    }

    async fn block_at_height(&self, height: u32) -> SyncResult<Option<RawBlock>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.blocks.get(height as usize).map(|b| RawBlock {
            height,
            bytes: b.bytes.clone(),
        }))
    }

    async fn block_by_hash(&self, hash: BlockHash) -> SyncResult<Option<RawBlock>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state
            .blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.block.block_hash() == hash)
            .map(|(height, b)| RawBlock {
                height: height as u32,
                bytes: b.bytes.clone(),
            }))
    }
}

/// ------- Sync wiring -------

pub fn regtest_config() -> SyncConfig {
    SyncConfig::default().with_network(Network::Regtest)
}

pub fn new_sync(chain: &TestChain) -> anyhow::Result<ClaimtrieSync<SqliteStore, TestChain>> {
    Ok(ClaimtrieSync::new(
        SqliteStore::new_in_memory()?,
        chain.clone(),
        regtest_config(),
    ))
}
