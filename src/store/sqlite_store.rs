//! Embedded SQLite store for the derived claim index.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bitcoin::{hashes::Hash, OutPoint, ScriptBuf, Txid};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tokio::task;
use tracing::debug;

use crate::{
    store::{CommitBatch, Store},
    trie::{Claim, ClaimHash, Support, Takeover, TrieSnapshot, TxoPosition},
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS claim (
        claim_hash        BLOB PRIMARY KEY,
        name              BLOB NOT NULL,
        txid              BLOB NOT NULL,
        vout              INTEGER NOT NULL,
        amount            INTEGER NOT NULL,
        owner             BLOB NOT NULL,
        created_height    INTEGER NOT NULL,
        tx_index          INTEGER NOT NULL,
        output            INTEGER NOT NULL,
        updated_height    INTEGER NOT NULL,
        activation_height INTEGER NOT NULL,
        expiration_height INTEGER NOT NULL,
        effective_amount  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS claim_name_idx ON claim (name, activation_height);

    CREATE TABLE IF NOT EXISTS support (
        txid              BLOB NOT NULL,
        vout              INTEGER NOT NULL,
        name              BLOB NOT NULL,
        claim_hash        BLOB NOT NULL,
        amount            INTEGER NOT NULL,
        created_height    INTEGER NOT NULL,
        activation_height INTEGER NOT NULL,
        expiration_height INTEGER NOT NULL,
        PRIMARY KEY (txid, vout)
    );
    CREATE INDEX IF NOT EXISTS support_claim_idx ON support (claim_hash);
    CREATE INDEX IF NOT EXISTS support_name_idx ON support (name, activation_height);

    CREATE TABLE IF NOT EXISTS takeover (
        name       BLOB PRIMARY KEY,
        claim_hash BLOB NOT NULL,
        height     INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_cursor (
        block_file INTEGER PRIMARY KEY,
        height     INTEGER NOT NULL
    );
"#;

const CLAIM_COLUMNS: &str = "claim_hash, name, txid, vout, amount, owner, created_height, \
     tx_index, output, updated_height, activation_height, expiration_height, effective_amount";

const SUPPORT_COLUMNS: &str = "txid, vout, name, claim_hash, amount, created_height, \
     activation_height, expiration_height";

/// Tables:
///   claim(claim_hash PK, ...)        one row per live or expired claim
///   support(txid, vout PK, ...)      one row per unspent support
///   takeover(name PK, claim_hash, height)
///   sync_cursor(block_file PK, height)
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Convenient in-memory store (useful for tests)
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Database file, `:memory:` for in-memory stores.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on a blocking thread.
    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            f(&mut guard)
        })
        .await?
    }

    fn query_claims(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> anyhow::Result<Vec<Claim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM claim {filter} \
             ORDER BY created_height, tx_index, output"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, claim_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn query_supports(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> anyhow::Result<Vec<Support>> {
        let sql = format!(
            "SELECT {SUPPORT_COLUMNS} FROM support {filter} ORDER BY created_height, txid, vout"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, support_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn last_height(conn: &Connection) -> anyhow::Result<Option<u32>> {
        let h: Option<i64> = conn.query_row("SELECT MAX(height) FROM sync_cursor", [], |r| r.get(0))?;
        Ok(h.map(|h| h as u32))
    }
}

fn fixed<const N: usize>(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("expected {N} bytes, found {}", bytes.len()).into(),
        )
    })
}

fn claim_from_row(row: &Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        claim_hash: ClaimHash::from_byte_array(fixed(row, 0)?),
        name: row.get(1)?,
        outpoint: OutPoint {
            txid: Txid::from_byte_array(fixed(row, 2)?),
            vout: row.get(3)?,
        },
        amount: row.get::<_, i64>(4)? as u64,
        owner: ScriptBuf::from_bytes(row.get(5)?),
        created_height: row.get(6)?,
        position: TxoPosition {
            tx_index: row.get(7)?,
            output: row.get(8)?,
        },
        updated_height: row.get(9)?,
        activation_height: row.get(10)?,
        expiration_height: row.get(11)?,
        effective_amount: row.get::<_, i64>(12)? as u64,
    })
}

fn support_from_row(row: &Row<'_>) -> rusqlite::Result<Support> {
    Ok(Support {
        outpoint: OutPoint {
            txid: Txid::from_byte_array(fixed(row, 0)?),
            vout: row.get(1)?,
        },
        name: row.get(2)?,
        claim_hash: ClaimHash::from_byte_array(fixed(row, 3)?),
        amount: row.get::<_, i64>(4)? as u64,
        created_height: row.get(5)?,
        activation_height: row.get(6)?,
        expiration_height: row.get(7)?,
    })
}

fn upsert_claim(conn: &Connection, c: &Claim) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "INSERT INTO claim (claim_hash, name, txid, vout, amount, owner, created_height,
                            tx_index, output, updated_height, activation_height,
                            expiration_height, effective_amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(claim_hash) DO UPDATE SET
            txid=excluded.txid, vout=excluded.vout, amount=excluded.amount,
            owner=excluded.owner, updated_height=excluded.updated_height,
            activation_height=excluded.activation_height,
            expiration_height=excluded.expiration_height,
            effective_amount=excluded.effective_amount",
    )?
    .execute(params![
        c.claim_hash.as_bytes().as_slice(),
        c.name,
        c.outpoint.txid.as_byte_array().as_slice(),
        c.outpoint.vout,
        c.amount as i64,
        c.owner.as_bytes(),
        c.created_height,
        c.position.tx_index,
        c.position.output,
        c.updated_height,
        c.activation_height,
        c.expiration_height,
        c.effective_amount as i64,
    ])
}

fn upsert_support(conn: &Connection, s: &Support) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "INSERT INTO support (txid, vout, name, claim_hash, amount, created_height,
                              activation_height, expiration_height)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(txid, vout) DO UPDATE SET
            activation_height=excluded.activation_height,
            expiration_height=excluded.expiration_height",
    )?
    .execute(params![
        s.outpoint.txid.as_byte_array().as_slice(),
        s.outpoint.vout,
        s.name,
        s.claim_hash.as_bytes().as_slice(),
        s.amount as i64,
        s.created_height,
        s.activation_height,
        s.expiration_height,
    ])
}

#[async_trait]
impl Store for SqliteStore {
    async fn last_synced_height(&self) -> anyhow::Result<Option<u32>> {
        self.with_conn(|conn| Self::last_height(conn)).await
    }

    async fn file_cursors(&self) -> anyhow::Result<Vec<(u32, u32)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT block_file, height FROM sync_cursor ORDER BY block_file")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    async fn load_snapshot(&self) -> anyhow::Result<TrieSnapshot> {
        self.with_conn(|conn| {
            let height = Self::last_height(conn)?;
            let claims = Self::query_claims(conn, "", [])?;
            let supports = Self::query_supports(conn, "", [])?;
            let mut stmt = conn.prepare("SELECT name, claim_hash, height FROM takeover")?;
            let takeovers = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, Vec<u8>>(0)?,
                        Takeover {
                            claim_hash: ClaimHash::from_byte_array(fixed(r, 1)?),
                            height: r.get(2)?,
                        },
                    ))
                })?
                .collect::<rusqlite::Result<_>>()?;
            Ok(TrieSnapshot {
                height,
                claims,
                supports,
                takeovers,
            })
        })
        .await
        .context("load claimtrie snapshot")
    }

    async fn commit(&self, batch: CommitBatch) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            let CommitBatch {
                block_file,
                height,
                changes,
                progress,
            } = batch;
            let tx = conn.transaction()?;

            for claim_hash in &changes.deleted_claims {
                tx.execute(
                    "DELETE FROM claim WHERE claim_hash = ?1",
                    params![claim_hash.as_bytes().as_slice()],
                )?;
            }
            let total = changes.claims.len() as u64;
            for (i, claim) in changes.claims.iter().enumerate() {
                upsert_claim(&tx, claim)?;
                let done = i as u64 + 1;
                if let Some(p) = &progress {
                    if done % p.every.max(1) == 0 && done != total {
                        (p.report)(done);
                    }
                }
            }

            for outpoint in &changes.deleted_supports {
                tx.execute(
                    "DELETE FROM support WHERE txid = ?1 AND vout = ?2",
                    params![outpoint.txid.as_byte_array().as_slice(), outpoint.vout],
                )?;
            }
            for support in &changes.supports {
                upsert_support(&tx, support)?;
            }

            for (name, takeover) in &changes.takeovers {
                match takeover {
                    Some(t) => tx.execute(
                        "INSERT INTO takeover (name, claim_hash, height) VALUES (?1, ?2, ?3)
                         ON CONFLICT(name) DO UPDATE SET
                            claim_hash=excluded.claim_hash, height=excluded.height",
                        params![name, t.claim_hash.as_bytes().as_slice(), t.height],
                    )?,
                    None => tx.execute("DELETE FROM takeover WHERE name = ?1", params![name])?,
                };
            }

            tx.execute(
                "INSERT INTO sync_cursor (block_file, height) VALUES (?1, ?2)
                 ON CONFLICT(block_file) DO UPDATE SET height=excluded.height",
                params![block_file, height],
            )?;
            tx.commit()?;

            if let Some(p) = &progress {
                (p.report)(total);
            }
            debug!(
                target: "claimtrie::store",
                block_file,
                height,
                claims = total,
                deleted = changes.deleted_claims.len(),
                supports = changes.supports.len(),
                takeovers = changes.takeovers.len(),
                "committed"
            );
            Ok(())
        })
        .await
    }

    async fn claim(&self, claim_hash: ClaimHash) -> anyhow::Result<Option<Claim>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CLAIM_COLUMNS} FROM claim WHERE claim_hash = ?1");
            Ok(conn
                .query_row(&sql, params![claim_hash.as_bytes().as_slice()], claim_from_row)
                .optional()?)
        })
        .await
    }

    async fn takeover(&self, name: &[u8]) -> anyhow::Result<Option<Takeover>> {
        let name = name.to_vec();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT claim_hash, height FROM takeover WHERE name = ?1",
                    params![name],
                    |r| {
                        Ok(Takeover {
                            claim_hash: ClaimHash::from_byte_array(fixed(r, 0)?),
                            height: r.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn controlling_claim(&self, name: &[u8], height: u32) -> anyhow::Result<Option<Claim>> {
        let name = name.to_vec();
        self.with_conn(move |conn| {
            let mut claims = Self::query_claims(
                conn,
                "WHERE claim_hash = (SELECT claim_hash FROM takeover WHERE name = ?1 AND height <= ?2)
                   AND activation_height <= ?2 AND expiration_height > ?2",
                params![name, height],
            )?;
            Ok(claims.pop())
        })
        .await
    }

    async fn active_for_name(&self, name: &[u8], height: u32) -> anyhow::Result<Vec<Claim>> {
        let name = name.to_vec();
        self.with_conn(move |conn| {
            Self::query_claims(
                conn,
                "WHERE name = ?1 AND activation_height <= ?2 AND expiration_height > ?2",
                params![name, height],
            )
        })
        .await
    }

    async fn pending_for_name(&self, name: &[u8], height: u32) -> anyhow::Result<Vec<Claim>> {
        let name = name.to_vec();
        self.with_conn(move |conn| {
            Self::query_claims(
                conn,
                "WHERE name = ?1 AND activation_height > ?2 AND expiration_height > ?2",
                params![name, height],
            )
        })
        .await
    }

    async fn pending_supports_for_name(
        &self,
        name: &[u8],
        height: u32,
    ) -> anyhow::Result<Vec<Support>> {
        let name = name.to_vec();
        self.with_conn(move |conn| {
            Self::query_supports(
                conn,
                "WHERE name = ?1 AND activation_height > ?2 AND expiration_height > ?2",
                params![name, height],
            )
        })
        .await
    }

    async fn claims_for_name(&self, name: &[u8]) -> anyhow::Result<Vec<Claim>> {
        let name = name.to_vec();
        self.with_conn(move |conn| Self::query_claims(conn, "WHERE name = ?1", params![name]))
            .await
    }

    async fn supports_for_claim(&self, claim_hash: ClaimHash) -> anyhow::Result<Vec<Support>> {
        self.with_conn(move |conn| {
            Self::query_supports(
                conn,
                "WHERE claim_hash = ?1",
                params![claim_hash.as_bytes().as_slice()],
            )
        })
        .await
    }

    async fn search_claims(&self) -> anyhow::Result<Vec<Claim>> {
        self.with_conn(|conn| Self::query_claims(conn, "", [])).await
    }
}
