use std::path::Path;

use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use crate::node::{NodeKind, RemoteHandle};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("record could not be sealed")]
    Seal,
    #[error("record could not be opened")]
    Open,
    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Serialized form of one local node, sealed into the cache blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub parent_row: u32,
    pub kind: NodeKind,
    pub name: Vec<u8>,
    pub size: i64,
    pub mtime: i64,
    pub fingerprint: Option<Vec<u8>>,
    pub inode: Option<u64>,
}

/// Cache identity of one sync: base64 over the concatenated root inode,
/// remote root handle and user id (24 bytes in, 32 chars out).
pub fn cache_name(root_inode: u64, remote_root: RemoteHandle, user_id: u64) -> String {
    let mut raw = [0u8; 24];
    raw[..8].copy_from_slice(&root_inode.to_le_bytes());
    raw[8..16].copy_from_slice(&remote_root.0.to_le_bytes());
    raw[16..].copy_from_slice(&user_id.to_le_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Everything read back from a cache, plus the count of rows that could not
/// be opened (wrong key, corruption). Dropped rows are re-added by the next
/// full scan.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub rows: Vec<(u32, NodeRecord)>,
    pub skipped: usize,
}

/// Durable per-sync table of `(row_id, parent_row_id, sealed blob)`. The
/// blob is the XChaCha20-Poly1305-sealed serialized node record with the
/// 24-byte nonce prepended; `parent_row_id` stays in the clear so the tree
/// shape is recoverable without opening unrelated rows.
pub struct StateCache {
    pool: SqlitePool,
    cipher: XChaCha20Poly1305,
}

impl StateCache {
    pub async fn open(db_path: &Path, key: &[u8; 32]) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let cache = Self::from_pool(pool, key);
        cache.init().await?;
        Ok(cache)
    }

    pub fn from_pool(pool: SqlitePool, key: &[u8; 32]) -> Self {
        Self {
            pool,
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub async fn init(&self) -> Result<(), CacheError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS statecache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent INTEGER NOT NULL,
                content BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<CacheTxn<'_>, CacheError> {
        Ok(CacheTxn {
            txn: self.pool.begin().await?,
            cipher: &self.cipher,
        })
    }

    /// Reads every committed row. Rows that fail to open or parse are
    /// counted, not fatal.
    pub async fn load_all(&self) -> Result<CacheSnapshot, CacheError> {
        let rows = sqlx::query("SELECT id, content FROM statecache ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = CacheSnapshot::default();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let content: Vec<u8> = row.try_get("content")?;
            match self.open_blob(&content) {
                Ok(record) => snapshot.rows.push((id as u32, record)),
                Err(_) => snapshot.skipped += 1,
            }
        }
        Ok(snapshot)
    }

    pub async fn row_count(&self) -> Result<u64, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM statecache")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    fn open_blob(&self, blob: &[u8]) -> Result<NodeRecord, CacheError> {
        if blob.len() < 24 {
            return Err(CacheError::Open);
        }
        let (nonce, sealed) = blob.split_at(24);
        let plain = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CacheError::Open)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

fn seal(cipher: &XChaCha20Poly1305, record: &NodeRecord) -> Result<Vec<u8>, CacheError> {
    let plain = serde_json::to_vec(record)?;
    let mut nonce = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plain.as_slice())
        .map_err(|_| CacheError::Seal)?;
    let mut blob = Vec::with_capacity(24 + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// One transactional batch of cache mutations. Nothing is visible to
/// `load_all` until `commit`; dropping the transaction rolls back.
pub struct CacheTxn<'a> {
    txn: Transaction<'static, Sqlite>,
    cipher: &'a XChaCha20Poly1305,
}

impl CacheTxn<'_> {
    /// Writes a record. A zero `row` allocates a new row id; a non-zero
    /// `row` rewrites in place. Returns the row id.
    pub async fn put(&mut self, row: u32, record: &NodeRecord) -> Result<u32, CacheError> {
        let blob = seal(self.cipher, record)?;
        if row == 0 {
            let result = sqlx::query("INSERT INTO statecache (parent, content) VALUES (?1, ?2)")
                .bind(record.parent_row as i64)
                .bind(&blob)
                .execute(&mut *self.txn)
                .await?;
            Ok(result.last_insert_rowid() as u32)
        } else {
            sqlx::query("UPDATE statecache SET parent = ?1, content = ?2 WHERE id = ?3")
                .bind(record.parent_row as i64)
                .bind(&blob)
                .bind(row as i64)
                .execute(&mut *self.txn)
                .await?;
            Ok(row)
        }
    }

    pub async fn del(&mut self, row: u32) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM statecache WHERE id = ?1")
            .bind(row as i64)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), CacheError> {
        self.txn.commit().await?;
        Ok(())
    }
}
