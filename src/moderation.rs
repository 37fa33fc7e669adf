//! # Moderation Index
//!
//! Blocklists for the serving path: ids and content hashes that must not be
//! served, each optionally attributed to a named source for audit. Lookups
//! are hot (every data request consults them), writes are rare and
//! operator-driven.
//!
//! Empty or absent inputs are never blocked: `is_id_blocked("")` is `false`,
//! not an error.

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::info;

use crate::chain_index::respond;
use crate::encoding::b64_decode;
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{unix_now, BlockDataInput};

// =============================================================================
// Named Statements
// =============================================================================

const INSERT_OR_IGNORE_BLOCK_SOURCE: &str =
    "INSERT OR IGNORE INTO block_sources (name) VALUES (?)";

const SELECT_BLOCK_SOURCE_ID: &str = "SELECT id FROM block_sources WHERE name = ?";

const INSERT_OR_IGNORE_BLOCKED_ID: &str = "\
INSERT OR IGNORE INTO blocked_ids (id, block_source_id, notes, blocked_at)
VALUES (?, ?, ?, ?)";

const INSERT_OR_IGNORE_BLOCKED_HASH: &str = "\
INSERT OR IGNORE INTO blocked_hashes (hash, block_source_id, notes, blocked_at)
VALUES (?, ?, ?, ?)";

/// Write-side statement repository, warmed at worker boot.
pub const WRITE_STATEMENTS: &[(&str, &str)] = &[
    ("insert_or_ignore_block_source", INSERT_OR_IGNORE_BLOCK_SOURCE),
    ("select_block_source_id", SELECT_BLOCK_SOURCE_ID),
    ("insert_or_ignore_blocked_id", INSERT_OR_IGNORE_BLOCKED_ID),
    ("insert_or_ignore_blocked_hash", INSERT_OR_IGNORE_BLOCKED_HASH),
];

const SELECT_BLOCKED_ID: &str = "SELECT 1 FROM blocked_ids WHERE id = ?";

const SELECT_BLOCKED_HASH: &str = "SELECT 1 FROM blocked_hashes WHERE hash = ?";

/// Read-side statement repository, warmed at worker boot.
pub const READ_STATEMENTS: &[(&str, &str)] = &[
    ("select_blocked_id", SELECT_BLOCKED_ID),
    ("select_blocked_hash", SELECT_BLOCKED_HASH),
];

// =============================================================================
// Write Worker
// =============================================================================

/// The single moderation writer.
pub struct ModerationWriter {
    conn: Connection,
}

impl ModerationWriter {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_standalone_rw(&paths.moderation)?;
        schema::warm_statements(&conn, WRITE_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// Records a blocked id and/or hash, attributing it to `source` when one
    /// is named.
    pub fn block_data(&mut self, input: &BlockDataInput) -> Result<()> {
        let now = unix_now();
        let tx = self.conn.transaction()?;

        let source_id: Option<i64> = match input.source.as_deref() {
            Some(name) if !name.is_empty() => {
                tx.prepare_cached(INSERT_OR_IGNORE_BLOCK_SOURCE)?
                    .execute(params![name])?;
                Some(
                    tx.prepare_cached(SELECT_BLOCK_SOURCE_ID)?
                        .query_row(params![name], |row| row.get(0))?,
                )
            }
            _ => None,
        };

        if let Some(id) = input.id.as_deref() {
            if !id.is_empty() {
                tx.prepare_cached(INSERT_OR_IGNORE_BLOCKED_ID)?.execute(params![
                    b64_decode(id)?,
                    source_id,
                    input.notes,
                    now,
                ])?;
            }
        }
        if let Some(hash) = input.hash.as_deref() {
            if !hash.is_empty() {
                tx.prepare_cached(INSERT_OR_IGNORE_BLOCKED_HASH)?.execute(params![
                    b64_decode(hash)?,
                    source_id,
                    input.notes,
                    now,
                ])?;
            }
        }

        tx.commit()?;
        info!(
            id = input.id.as_deref().unwrap_or(""),
            hash = input.hash.as_deref().unwrap_or(""),
            source = input.source.as_deref().unwrap_or(""),
            "content blocked"
        );
        Ok(())
    }
}

// =============================================================================
// Read Worker
// =============================================================================

/// A moderation reader.
pub struct ModerationReader {
    conn: Connection,
}

impl ModerationReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_standalone_ro(&paths.moderation)?;
        schema::warm_statements(&conn, READ_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// True when the id is on the blocklist. Empty input is never blocked.
    pub fn is_id_blocked(&self, id: &str) -> Result<bool> {
        if id.is_empty() {
            return Ok(false);
        }
        let hit: Option<i64> = self
            .conn
            .prepare_cached(SELECT_BLOCKED_ID)?
            .query_row(params![b64_decode(id)?], |row| row.get(0))
            .optional()?;
        Ok(hit.is_some())
    }

    /// True when the content hash is on the blocklist. Empty input is never
    /// blocked.
    pub fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        let hit: Option<i64> = self
            .conn
            .prepare_cached(SELECT_BLOCKED_HASH)?
            .query_row(params![b64_decode(hash)?], |row| row.get(0))
            .optional()?;
        Ok(hit.is_some())
    }
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the moderation write worker.
pub enum ModerationWriteJob {
    BlockData {
        input: Box<BlockDataInput>,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PoolWorker for ModerationWriter {
    type Job = ModerationWriteJob;

    fn handle(&mut self, job: ModerationWriteJob) -> JobOutcome {
        match job {
            ModerationWriteJob::BlockData { input, reply } => {
                respond(reply, self.block_data(&input))
            }
        }
    }
}

/// Jobs served by the moderation read worker.
pub enum ModerationReadJob {
    IsIdBlocked {
        id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    IsHashBlocked {
        hash: String,
        reply: oneshot::Sender<Result<bool>>,
    },
}

impl PoolWorker for ModerationReader {
    type Job = ModerationReadJob;

    fn handle(&mut self, job: ModerationReadJob) -> JobOutcome {
        match job {
            ModerationReadJob::IsIdBlocked { id, reply } => respond(reply, self.is_id_blocked(&id)),
            ModerationReadJob::IsHashBlocked { hash, reply } => {
                respond(reply, self.is_hash_blocked(&hash))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
