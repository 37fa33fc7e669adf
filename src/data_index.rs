//! # Content-Data Index
//!
//! The `data` store resolves transaction and data-item ids to canonical
//! content hashes and back. The hash row carries the verifiable attributes
//! (size, original content type, cache/index timestamps); `data_ids` and
//! `data_roots` are the two lookup paths onto it; the `nested_*` tables
//! describe sub-ranges inside a parent's payload, which is how a data item's
//! bytes are located inside its bundle without re-fetching.
//!
//! The two hot reads (`get_data_attributes`, `get_data_parent`) sit behind
//! circuit breakers at the facade; a tripped breaker reports "unknown", so
//! these functions themselves stay plain `Result<Option<_>>` reads.

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

use crate::chain_index::respond;
use crate::encoding::{b64_decode, b64_encode};
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{unix_now, DataAttributes, DataContentAttributes, DataParent};

// =============================================================================
// Named Statements
// =============================================================================

const UPSERT_DATA_HASH: &str = "\
INSERT INTO data_hashes (hash, data_size, original_source_content_type, indexed_at, cached_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (hash) DO UPDATE SET
    cached_at = COALESCE(excluded.cached_at, cached_at),
    original_source_content_type =
        COALESCE(excluded.original_source_content_type, original_source_content_type)";

const UPSERT_DATA_ID: &str = "\
INSERT INTO data_ids (id, contiguous_data_hash, indexed_at)
VALUES (?, ?, ?)
ON CONFLICT (id) DO UPDATE SET
    contiguous_data_hash = excluded.contiguous_data_hash,
    indexed_at = excluded.indexed_at";

const UPSERT_DATA_ROOT: &str = "\
INSERT INTO data_roots (data_root, contiguous_data_hash)
VALUES (?, ?)
ON CONFLICT (data_root) DO UPDATE SET
    contiguous_data_hash = excluded.contiguous_data_hash";

const INSERT_OR_IGNORE_NESTED_DATA_ID: &str = "\
INSERT OR IGNORE INTO nested_data_ids (id, parent_id, data_offset, data_size, indexed_at)
VALUES (?, ?, ?, ?, ?)";

const INSERT_OR_IGNORE_NESTED_DATA_HASH: &str = "\
INSERT OR IGNORE INTO nested_data_hashes (hash, parent_id, data_offset, indexed_at)
VALUES (?, ?, ?, ?)";

/// Write-side statement repository, warmed at worker boot.
pub const WRITE_STATEMENTS: &[(&str, &str)] = &[
    ("upsert_data_hash", UPSERT_DATA_HASH),
    ("upsert_data_id", UPSERT_DATA_ID),
    ("upsert_data_root", UPSERT_DATA_ROOT),
    ("insert_or_ignore_nested_data_id", INSERT_OR_IGNORE_NESTED_DATA_ID),
    (
        "insert_or_ignore_nested_data_hash",
        INSERT_OR_IGNORE_NESTED_DATA_HASH,
    ),
];

const SELECT_DATA_ATTRIBUTES_BY_ID: &str = "\
SELECT dh.hash, dh.data_size, dh.original_source_content_type, dh.cached_at, dh.indexed_at
FROM data_ids di
JOIN data_hashes dh ON dh.hash = di.contiguous_data_hash
WHERE di.id = ?";

const SELECT_DATA_PARENT: &str = "\
SELECT parent_id, data_offset, data_size
FROM nested_data_ids
WHERE id = ?
ORDER BY indexed_at DESC
LIMIT 1";

/// Read-side statement repository, warmed at worker boot.
pub const READ_STATEMENTS: &[(&str, &str)] = &[
    ("select_data_attributes_by_id", SELECT_DATA_ATTRIBUTES_BY_ID),
    ("select_data_parent", SELECT_DATA_PARENT),
];

// =============================================================================
// Write Worker
// =============================================================================

/// The single data-index writer.
pub struct DataIndexWriter {
    conn: Connection,
}

impl DataIndexWriter {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_standalone_rw(&paths.data)?;
        schema::warm_statements(&conn, WRITE_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// Records the canonical content hash for an id: the hash row, the id
    /// mapping, and (when supplied) the data-root mapping, atomically.
    pub fn save_data_content_attributes(&mut self, attrs: &DataContentAttributes) -> Result<()> {
        let now = unix_now();
        let hash = b64_decode(&attrs.hash)?;
        let id = b64_decode(&attrs.id)?;

        let tx = self.conn.transaction()?;
        tx.prepare_cached(UPSERT_DATA_HASH)?.execute(params![
            hash,
            attrs.data_size,
            attrs.content_type,
            now,
            attrs.cached_at,
        ])?;
        tx.prepare_cached(UPSERT_DATA_ID)?
            .execute(params![id, hash, now])?;
        if let Some(data_root) = &attrs.data_root {
            if !data_root.is_empty() {
                tx.prepare_cached(UPSERT_DATA_ROOT)?
                    .execute(params![b64_decode(data_root)?, hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records that `id`'s payload is the byte range
    /// `[data_offset, data_offset + data_size)` inside `parent_id`'s payload.
    pub fn save_nested_data_id(
        &mut self,
        id: &str,
        parent_id: &str,
        data_offset: u64,
        data_size: u64,
    ) -> Result<()> {
        self.conn
            .prepare_cached(INSERT_OR_IGNORE_NESTED_DATA_ID)?
            .execute(params![
                b64_decode(id)?,
                b64_decode(parent_id)?,
                data_offset,
                data_size,
                unix_now(),
            ])?;
        Ok(())
    }

    /// Records that content `hash` occurs at `data_offset` inside
    /// `parent_id`'s payload.
    pub fn save_nested_data_hash(
        &mut self,
        hash: &str,
        parent_id: &str,
        data_offset: u64,
    ) -> Result<()> {
        self.conn
            .prepare_cached(INSERT_OR_IGNORE_NESTED_DATA_HASH)?
            .execute(params![
                b64_decode(hash)?,
                b64_decode(parent_id)?,
                data_offset,
                unix_now(),
            ])?;
        Ok(())
    }
}

// =============================================================================
// Read Worker
// =============================================================================

/// A data-index reader. Two of these run in parallel; the queries are pure.
pub struct DataIndexReader {
    conn: Connection,
}

impl DataIndexReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_standalone_ro(&paths.data)?;
        schema::warm_statements(&conn, READ_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// Resolves an id to its content hash's verifiable attributes.
    pub fn get_data_attributes(&self, id: &str) -> Result<Option<DataAttributes>> {
        let id = b64_decode(id)?;
        let attrs = self
            .conn
            .prepare_cached(SELECT_DATA_ATTRIBUTES_BY_ID)?
            .query_row(params![id], |row| {
                Ok(DataAttributes {
                    hash: b64_encode(&row.get::<_, Vec<u8>>(0)?),
                    data_size: row.get(1)?,
                    content_type: row.get(2)?,
                    cached_at: row.get(3)?,
                    indexed_at: row.get(4)?,
                })
            })
            .optional()?;
        Ok(attrs)
    }

    /// Finds the parent payload a nested id lives inside, most recently
    /// indexed parent first.
    pub fn get_data_parent(&self, id: &str) -> Result<Option<DataParent>> {
        let id = b64_decode(id)?;
        let parent = self
            .conn
            .prepare_cached(SELECT_DATA_PARENT)?
            .query_row(params![id], |row| {
                Ok(DataParent {
                    parent_id: b64_encode(&row.get::<_, Vec<u8>>(0)?),
                    data_offset: row.get(1)?,
                    data_size: row.get(2)?,
                })
            })
            .optional()?;
        Ok(parent)
    }
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the data write worker.
pub enum DataWriteJob {
    SaveDataContentAttributes {
        attrs: Box<DataContentAttributes>,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveNestedDataId {
        id: String,
        parent_id: String,
        data_offset: u64,
        data_size: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveNestedDataHash {
        hash: String,
        parent_id: String,
        data_offset: u64,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PoolWorker for DataIndexWriter {
    type Job = DataWriteJob;

    fn handle(&mut self, job: DataWriteJob) -> JobOutcome {
        match job {
            DataWriteJob::SaveDataContentAttributes { attrs, reply } => {
                respond(reply, self.save_data_content_attributes(&attrs))
            }
            DataWriteJob::SaveNestedDataId {
                id,
                parent_id,
                data_offset,
                data_size,
                reply,
            } => respond(
                reply,
                self.save_nested_data_id(&id, &parent_id, data_offset, data_size),
            ),
            DataWriteJob::SaveNestedDataHash {
                hash,
                parent_id,
                data_offset,
                reply,
            } => respond(
                reply,
                self.save_nested_data_hash(&hash, &parent_id, data_offset),
            ),
        }
    }
}

/// Jobs served by the data read workers.
pub enum DataReadJob {
    GetDataAttributes {
        id: String,
        reply: oneshot::Sender<Result<Option<DataAttributes>>>,
    },
    GetDataParent {
        id: String,
        reply: oneshot::Sender<Result<Option<DataParent>>>,
    },
}

impl PoolWorker for DataIndexReader {
    type Job = DataReadJob;

    fn handle(&mut self, job: DataReadJob) -> JobOutcome {
        match job {
            DataReadJob::GetDataAttributes { id, reply } => {
                respond(reply, self.get_data_attributes(&id))
            }
            DataReadJob::GetDataParent { id, reply } => respond(reply, self.get_data_parent(&id)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
