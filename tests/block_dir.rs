mod common;

use std::{fs::OpenOptions, io::Write, path::Path};

use claimtrie_sync::{chain::BlockFile, prelude::*};
use common::*;

fn record(magic: [u8; 4], bytes: &[u8]) -> Vec<u8> {
    let mut out = magic.to_vec();
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Append `blocks` (by height) of `chain` to `blkNNNNN.dat` in `dir`.
fn append(dir: &Path, file: u32, chain: &TestChain, heights: &[u32]) -> anyhow::Result<()> {
    let raw = chain.raw_blocks();
    let mut fh = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("blk{file:05}.dat")))?;
    for height in heights {
        fh.write_all(&record(Network::Regtest.magic(), &raw[*height as usize].1))?;
    }
    Ok(())
}

#[tokio::test]
async fn reads_blocks_straight_from_block_files() -> anyhow::Result<()> {
    let chain = TestChain::new();
    chain.mine_to(112);
    let a = claim("dir", 4 * COIN);
    chain.mine(vec![a.clone()]); // 113
    chain.mine_to(150);

    let tmp = tempfile::tempdir()?;
    // the node may write blocks out of order inside a file
    let mut first: Vec<u32> = (0..=100).collect();
    first.swap(40, 41);
    append(tmp.path(), 0, &chain, &first)?;
    // preallocated zero tail
    append_zeros(tmp.path(), 0)?;
    append(tmp.path(), 1, &chain, &(101..=150).collect::<Vec<_>>())?;

    let source = BlockDirSource::new(tmp.path(), Network::Regtest.magic());
    assert_eq!(source.tip_height().await?, Some(150));
    assert_eq!(
        source.block_files(90, 120).await?,
        vec![
            BlockFile {
                file_number: 0,
                start_height: 90,
                end_height: 100,
                blocks: 11,
                txs: 11,
            },
            BlockFile {
                file_number: 1,
                start_height: 101,
                end_height: 120,
                blocks: 20,
                txs: 21,
            },
        ]
    );
    let block = source.block_at_height(41).await?.unwrap();
    assert_eq!(block.bytes, chain.raw_blocks()[41].1);

    let mut sync = ClaimtrieSync::new(SqliteStore::new_in_memory()?, source.clone(), regtest_config());
    sync.advance().await?;
    let state = sync.name_state(b"dir").unwrap();
    assert_eq!(state.controlling.map(|c| c.claim_hash), Some(claim_hash(&a)));

    // the node keeps appending to the last file
    let b = claim("dir", 9 * COIN);
    chain.mine(vec![b.clone()]); // 151
    chain.mine_to(160);
    append(tmp.path(), 1, &chain, &(151..=160).collect::<Vec<_>>())?;
    assert_eq!(
        sync.advance().await?,
        AdvanceOutcome::Synced {
            from: Some(150),
            to: 160
        }
    );
    // (151 - 113) / 32 = 1
    let pending = sync.store().claim(claim_hash(&b)).await?.unwrap();
    assert_eq!(pending.activation_height, 152);
    assert_eq!(
        sync.store().controlling_claim(b"dir", 160).await?.map(|c| c.claim_hash),
        Some(claim_hash(&b))
    );
    Ok(())
}

fn append_zeros(dir: &Path, file: u32) -> anyhow::Result<()> {
    let mut fh = OpenOptions::new()
        .append(true)
        .open(dir.join(format!("blk{file:05}.dat")))?;
    fh.write_all(&[0u8; 64])?;
    Ok(())
}

#[tokio::test]
async fn wrong_magic_is_corrupt_data() -> anyhow::Result<()> {
    let chain = TestChain::new();
    chain.mine_to(3);
    let tmp = tempfile::tempdir()?;
    append(tmp.path(), 0, &chain, &[0, 1, 2, 3])?;

    let mainnet = BlockDirSource::new(tmp.path(), Network::Mainnet.magic());
    let err = mainnet.tip_height().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::CorruptBlockData {
            block_file: Some(0),
            ..
        }
    ));

    let missing = BlockDirSource::new(tmp.path().join("nope"), Network::Regtest.magic());
    assert!(missing.tip_height().await.unwrap_err().is_retryable());
    Ok(())
}
