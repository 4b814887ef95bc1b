//! Chain source backed by the node's `blkNNNNN.dat` files.
//!
//! Each record is `magic ‖ u32 le length ‖ block`. Blocks may land in a file out of
//! height order, so every rescan relinks the index from genesis and walks back from
//! the highest tip to find the best chain.
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bitcoin::{hashes::Hash, BlockHash};
use tokio::task;
use tracing::debug;

use super::{
    block::{ClaimBlock, ClaimBlockHeader, HEADER_LEN},
    BlockFile, ChainSource, RawBlock,
};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy)]
struct BlockLocation {
    file: u32,
    /// Offset of the block bytes (after magic and length).
    offset: u64,
    len: u32,
    prev: BlockHash,
    txs: u64,
}

#[derive(Debug, Default)]
struct BlockIndex {
    /// Bytes of each file already indexed.
    scanned: BTreeMap<u32, u64>,
    blocks: HashMap<BlockHash, BlockLocation>,
    /// Best chain, index = height.
    main_chain: Vec<BlockHash>,
    heights: HashMap<BlockHash, u32>,
}

impl BlockIndex {
    fn relink(&mut self) {
        let mut children: HashMap<BlockHash, Vec<BlockHash>> = HashMap::new();
        let mut genesis = None;
        for (hash, loc) in &self.blocks {
            if loc.prev == BlockHash::all_zeros() {
                genesis = Some(*hash);
            } else {
                children.entry(loc.prev).or_default().push(*hash);
            }
        }

        let mut heights = HashMap::new();
        let mut tip: Option<(u32, BlockHash)> = None;
        if let Some(genesis) = genesis {
            let mut stack = vec![(genesis, 0u32)];
            while let Some((hash, height)) = stack.pop() {
                heights.insert(hash, height);
                if tip.map_or(true, |(h, _)| height > h) {
                    tip = Some((height, hash));
                }
                if let Some(next) = children.get(&hash) {
                    stack.extend(next.iter().map(|c| (*c, height + 1)));
                }
            }
        }

        let mut main_chain = Vec::new();
        if let Some((height, mut hash)) = tip {
            main_chain.resize(height as usize + 1, BlockHash::all_zeros());
            for h in (0..=height).rev() {
                main_chain[h as usize] = hash;
                match self.blocks.get(&hash) {
                    Some(loc) => hash = loc.prev,
                    None => break,
                }
            }
        }
        self.main_chain = main_chain;
        self.heights = heights;
    }
}

/// Reads blocks straight from a node's block directory.
#[derive(Clone)]
pub struct BlockDirSource {
    dir: PathBuf,
    magic: [u8; 4],
    index: Arc<Mutex<BlockIndex>>,
}

impl BlockDirSource {
    /// `dir` holds the `blk*.dat` files; `magic` is the network's message start.
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.into(),
            magic,
            index: Arc::new(Mutex::new(BlockIndex::default())),
        }
    }

    /// Directory being scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(dir: &Path, file: u32) -> PathBuf {
        dir.join(format!("blk{file:05}.dat"))
    }

    fn list_files(dir: &Path) -> anyhow::Result<Vec<u32>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name
                .strip_prefix("blk")
                .and_then(|n| n.strip_suffix(".dat"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                files.push(num);
            }
        }
        files.sort_unstable();
        Ok(files)
    }

    /// Index any bytes appended since the previous scan.
    fn rescan(dir: &Path, magic: [u8; 4], index: &mut BlockIndex) -> SyncResult<()> {
        let files = Self::list_files(dir).map_err(SyncError::SourceUnavailable)?;
        let mut added = 0usize;

        for file in files {
            let path = Self::file_path(dir, file);
            let start = index.scanned.get(&file).copied().unwrap_or(0);
            let mut data = Vec::new();
            let mut fh = File::open(&path)
                .with_context(|| format!("open {}", path.display()))
                .map_err(SyncError::SourceUnavailable)?;
            fh.seek(SeekFrom::Start(start))
                .and_then(|_| fh.read_to_end(&mut data))
                .with_context(|| format!("read {}", path.display()))
                .map_err(SyncError::SourceUnavailable)?;

            let mut pos = 0usize;
            while pos + 8 <= data.len() {
                let record_magic = &data[pos..pos + 4];
                if record_magic == [0u8; 4] {
                    // preallocated tail
                    break;
                }
                if record_magic != magic {
                    return Err(SyncError::corrupt(
                        Some(file),
                        None,
                        format!("bad magic {} at offset {}", hex::encode(record_magic), start + pos as u64),
                    ));
                }
                let len = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
                let body = pos + 8;
                if body + len as usize > data.len() {
                    // the node is still writing this record
                    break;
                }
                let bytes = &data[body..body + len as usize];
                if bytes.len() < HEADER_LEN {
                    return Err(SyncError::corrupt(
                        Some(file),
                        None,
                        format!("record of {len} bytes at offset {} is shorter than a header", start + pos as u64),
                    ));
                }
                let header = ClaimBlockHeader::parse(bytes)
                    .map_err(|e| SyncError::corrupt(Some(file), None, e.to_string()))?;
                let txs = ClaimBlock::peek_tx_count(bytes)
                    .map_err(|e| SyncError::corrupt(Some(file), None, e.to_string()))?;
                index.blocks.insert(
                    header.block_hash(),
                    BlockLocation {
                        file,
                        offset: start + body as u64,
                        len,
                        prev: header.prev_blockhash,
                        txs,
                    },
                );
                added += 1;
                pos = body + len as usize;
            }
            index.scanned.insert(file, start + pos as u64);
        }

        if added > 0 {
            index.relink();
            debug!(target: "claimtrie::chain", added, tip = index.main_chain.len().saturating_sub(1), "indexed block files");
        }
        Ok(())
    }

    fn read_at(dir: &Path, loc: &BlockLocation) -> SyncResult<Vec<u8>> {
        let path = Self::file_path(dir, loc.file);
        let mut bytes = vec![0u8; loc.len as usize];
        File::open(&path)
            .and_then(|mut fh| {
                fh.seek(SeekFrom::Start(loc.offset))?;
                fh.read_exact(&mut bytes)
            })
            .with_context(|| format!("read block at {}:{}", path.display(), loc.offset))
            .map_err(SyncError::SourceUnavailable)?;
        Ok(bytes)
    }

    /// Run `f` on a blocking thread with a freshly rescanned index.
    async fn with_index<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &BlockIndex) -> SyncResult<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        let magic = self.magic;
        let index = self.index.clone();
        task::spawn_blocking(move || {
            let mut guard = index
                .lock()
                .map_err(|_| SyncError::SourceUnavailable(anyhow!("block index lock poisoned")))?;
            Self::rescan(&dir, magic, &mut guard)?;
            f(&dir, &guard)
        })
        .await
        .map_err(|e| SyncError::SourceUnavailable(e.into()))?
    }
}

#[async_trait]
impl ChainSource for BlockDirSource {
    async fn tip_height(&self) -> SyncResult<Option<u32>> {
        self.with_index(|_, index| Ok(index.main_chain.len().checked_sub(1).map(|h| h as u32)))
            .await
    }

    async fn block_files(&self, from: u32, to: u32) -> SyncResult<Vec<BlockFile>> {
        self.with_index(move |_, index| {
            let mut files: Vec<BlockFile> = Vec::new();
            let Some(tip) = index.main_chain.len().checked_sub(1) else {
                return Ok(files);
            };
            let end = to.min(tip as u32);
            for height in from..=end {
                let loc = index
                    .main_chain
                    .get(height as usize)
                    .and_then(|hash| index.blocks.get(hash))
                    .ok_or_else(|| SyncError::corrupt(None, Some(height), "block missing from index"))?;
                match files.last_mut() {
                    Some(run) if run.file_number == loc.file => {
                        run.end_height = height;
                        run.blocks += 1;
                        run.txs += loc.txs;
                    }
                    _ => files.push(BlockFile {
                        file_number: loc.file,
                        start_height: height,
                        end_height: height,
                        blocks: 1,
                        txs: loc.txs,
                    }),
                }
            }
            Ok(files)
        })
        .await
    }

    async fn read_blocks(&self, file: &BlockFile) -> SyncResult<Vec<RawBlock>> {
        let file = *file;
        self.with_index(move |dir, index| {
            (file.start_height..=file.end_height)
                .map(|height| {
                    let loc = index
                        .main_chain
                        .get(height as usize)
                        .and_then(|hash| index.blocks.get(hash))
                        .ok_or_else(|| {
                            SyncError::corrupt(Some(file.file_number), Some(height), "block missing from index")
                        })?;
                    Ok(RawBlock {
                        height,
                        bytes: Self::read_at(dir, loc)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn block_at_height(&self, height: u32) -> SyncResult<Option<RawBlock>> {
        self.with_index(move |dir, index| {
            let Some(loc) = index
                .main_chain
                .get(height as usize)
                .and_then(|hash| index.blocks.get(hash))
            else {
                return Ok(None);
            };
            Ok(Some(RawBlock {
                height,
                bytes: Self::read_at(dir, loc)?,
            }))
        })
        .await
    }

    async fn block_by_hash(&self, hash: BlockHash) -> SyncResult<Option<RawBlock>> {
        self.with_index(move |dir, index| {
            let Some(height) = index.heights.get(&hash).copied() else {
                return Ok(None);
            };
            if index.main_chain.get(height as usize) != Some(&hash) {
                return Ok(None);
            }
            let Some(loc) = index.blocks.get(&hash) else {
                return Ok(None);
            };
            Ok(Some(RawBlock {
                height,
                bytes: Self::read_at(dir, loc)?,
            }))
        })
        .await
    }
}
