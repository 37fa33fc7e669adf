//! # Core Chain Index
//!
//! Ingestion and maintenance of the `core` store: blocks, transactions, their
//! block links, tag occurrences, wallets, and the missing-transaction backlog.
//!
//! ## Staging Flow
//!
//! ```text
//! save_block_and_txs ──► new_blocks / new_block_transactions /
//!                        new_transactions / new_transaction_tags
//!                                  │
//!        every STABLE_FLUSH_INTERVAL blocks (height % 5 == 0)
//!                                  ▼
//!            promote height ≤ tip − max_fork_depth into stable_*
//!            (core and the attached bundles schema in one pass),
//!            then garbage-collect stale new_* rows
//! ```
//!
//! Every write here is idempotent (`INSERT OR IGNORE` / upsert): replaying a
//! block or transaction converges on the same state. Each multi-row operation
//! runs in a single transaction; a failure aborts the whole unit.
//!
//! `reset_to_height` is the fork-rollback: it truncates `new_blocks`, the
//! block links, and the missing backlog above the fork point and clears the
//! `height` linkage on surviving `new_*` rows. Stable rows are below fork
//! depth by construction and are never rewound.

use rusqlite::{params, Connection, OptionalExtension, Transaction as SqlTransaction};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::encoding::{b64_decode, b64_encode, owner_address, tag_hash};
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{
    content_type_from_tags, unix_now, BlockHeader, TxRecord, NEW_DATA_ITEM_CLEANUP_WAIT,
    NEW_TX_CLEANUP_WAIT, STABLE_FLUSH_INTERVAL,
};

// =============================================================================
// Named Statements
// =============================================================================
// The write worker's statement repository. Warmed (prepared and cached) at
// worker boot; a typo fails construction, not the first block.

const INSERT_OR_IGNORE_NEW_BLOCK: &str = "\
INSERT OR IGNORE INTO new_blocks (
    indep_hash, height, previous_block, nonce, hash, block_timestamp,
    diff, cumulative_diff, last_retarget, reward_addr, reward_pool,
    block_size, weave_size,
    usd_to_ar_rate_dividend, usd_to_ar_rate_divisor,
    scheduled_usd_to_ar_rate_dividend, scheduled_usd_to_ar_rate_divisor,
    hash_list_merkle, wallet_list, tx_root, tx_count, missing_tx_count
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_OR_IGNORE_NEW_BLOCK_TRANSACTION: &str = "\
INSERT OR IGNORE INTO new_block_transactions
    (block_indep_hash, transaction_id, block_transaction_index, height)
VALUES (?, ?, ?, ?)";

const INSERT_OR_IGNORE_MISSING_TRANSACTION: &str = "\
INSERT OR IGNORE INTO missing_transactions (block_indep_hash, transaction_id, height)
VALUES (?, ?, ?)";

const INSERT_OR_IGNORE_TAG_NAME: &str =
    "INSERT OR IGNORE INTO tag_names (hash, name) VALUES (?, ?)";

const INSERT_OR_IGNORE_TAG_VALUE: &str =
    "INSERT OR IGNORE INTO tag_values (hash, value) VALUES (?, ?)";

const UPSERT_NEW_TRANSACTION_TAG: &str = "\
INSERT INTO new_transaction_tags
    (tag_name_hash, tag_value_hash, transaction_id, transaction_tag_index, indexed_at, height)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT (tag_name_hash, tag_value_hash, transaction_id, transaction_tag_index)
DO UPDATE SET height = excluded.height";

const INSERT_OR_IGNORE_WALLET: &str =
    "INSERT OR IGNORE INTO wallets (address, public_modulus) VALUES (?, ?)";

const UPSERT_NEW_TRANSACTION: &str = "\
INSERT INTO new_transactions (
    id, signature, format, last_tx, owner_address, target, quantity, reward,
    data_size, data_root, content_type, tag_count, indexed_at, height
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (id) DO UPDATE SET height = excluded.height";

const SELECT_MISSING_TRANSACTION_HEIGHT: &str =
    "SELECT height FROM missing_transactions WHERE transaction_id = ? LIMIT 1";

const DELETE_MISSING_TRANSACTION: &str =
    "DELETE FROM missing_transactions WHERE transaction_id = ?";

const UPDATE_NEW_DATA_ITEM_HEIGHTS: &str =
    "UPDATE bundles.new_data_items SET height = ? WHERE root_transaction_id = ?";

const UPDATE_NEW_DATA_ITEM_TAG_HEIGHTS: &str = "\
UPDATE bundles.new_data_item_tags SET height = ?
WHERE data_item_id IN
    (SELECT id FROM bundles.new_data_items WHERE root_transaction_id = ?)";

const SELECT_MAX_STABLE_BLOCK_TIMESTAMP: &str =
    "SELECT MAX(block_timestamp) FROM stable_blocks";

const INSERT_OR_IGNORE_STABLE_BLOCKS: &str = "\
INSERT OR IGNORE INTO stable_blocks (
    height, indep_hash, previous_block, nonce, hash, block_timestamp,
    diff, cumulative_diff, last_retarget, reward_addr, reward_pool,
    block_size, weave_size,
    usd_to_ar_rate_dividend, usd_to_ar_rate_divisor,
    scheduled_usd_to_ar_rate_dividend, scheduled_usd_to_ar_rate_divisor,
    hash_list_merkle, wallet_list, tx_root, tx_count, missing_tx_count
)
SELECT
    height, indep_hash, previous_block, nonce, hash, block_timestamp,
    diff, cumulative_diff, last_retarget, reward_addr, reward_pool,
    block_size, weave_size,
    usd_to_ar_rate_dividend, usd_to_ar_rate_divisor,
    scheduled_usd_to_ar_rate_dividend, scheduled_usd_to_ar_rate_divisor,
    hash_list_merkle, wallet_list, tx_root, tx_count, missing_tx_count
FROM new_blocks WHERE height <= ?";

const INSERT_OR_IGNORE_STABLE_BLOCK_TRANSACTIONS: &str = "\
INSERT OR IGNORE INTO stable_block_transactions
    (block_indep_hash, transaction_id, block_transaction_index, height)
SELECT block_indep_hash, transaction_id, block_transaction_index, height
FROM new_block_transactions WHERE height <= ?";

// Promotion resolves each row's block-transaction position through its
// block link. The link itself may have been promoted (and its new_* row
// cleaned) on an earlier flush, so the join unions both staging families —
// a transaction or item arriving late for an old block still promotes.

const INSERT_OR_IGNORE_STABLE_TRANSACTIONS: &str = "\
INSERT OR IGNORE INTO stable_transactions (
    id, height, block_transaction_index, signature, format, last_tx,
    owner_address, target, quantity, reward, data_size, data_root,
    content_type, tag_count, indexed_at, offset
)
SELECT
    nt.id, nt.height, bt.block_transaction_index, nt.signature, nt.format,
    nt.last_tx, nt.owner_address, nt.target, nt.quantity, nt.reward,
    nt.data_size, nt.data_root, nt.content_type, nt.tag_count, nt.indexed_at,
    nt.offset
FROM new_transactions nt
JOIN (SELECT transaction_id, block_transaction_index FROM new_block_transactions
      UNION
      SELECT transaction_id, block_transaction_index FROM stable_block_transactions) bt
  ON bt.transaction_id = nt.id
WHERE nt.height <= ?";

const INSERT_OR_IGNORE_STABLE_TRANSACTION_TAGS: &str = "\
INSERT OR IGNORE INTO stable_transaction_tags
    (tag_name_hash, tag_value_hash, height, block_transaction_index,
     transaction_tag_index, transaction_id)
SELECT
    ntt.tag_name_hash, ntt.tag_value_hash, ntt.height,
    bt.block_transaction_index, ntt.transaction_tag_index, ntt.transaction_id
FROM new_transaction_tags ntt
JOIN (SELECT transaction_id, block_transaction_index FROM new_block_transactions
      UNION
      SELECT transaction_id, block_transaction_index FROM stable_block_transactions) bt
  ON bt.transaction_id = ntt.transaction_id
WHERE ntt.height <= ?";

const INSERT_OR_IGNORE_STABLE_DATA_ITEMS: &str = "\
INSERT OR IGNORE INTO bundles.stable_data_items (
    id, parent_id, root_transaction_id, height, block_transaction_index,
    signature, anchor, owner_address, target, data_offset, data_size,
    content_type, tag_count, indexed_at, filter_id
)
SELECT
    ndi.id, ndi.parent_id, ndi.root_transaction_id, ndi.height,
    bt.block_transaction_index, ndi.signature, ndi.anchor, ndi.owner_address,
    ndi.target, ndi.data_offset, ndi.data_size, ndi.content_type,
    ndi.tag_count, ndi.indexed_at, ndi.filter_id
FROM bundles.new_data_items ndi
JOIN (SELECT transaction_id, block_transaction_index FROM new_block_transactions
      UNION
      SELECT transaction_id, block_transaction_index FROM stable_block_transactions) bt
  ON bt.transaction_id = ndi.root_transaction_id
WHERE ndi.height <= ?";

const INSERT_OR_IGNORE_STABLE_DATA_ITEM_TAGS: &str = "\
INSERT OR IGNORE INTO bundles.stable_data_item_tags
    (tag_name_hash, tag_value_hash, height, block_transaction_index,
     data_item_id, data_item_tag_index)
SELECT
    ndit.tag_name_hash, ndit.tag_value_hash, ndit.height,
    bt.block_transaction_index, ndit.data_item_id, ndit.data_item_tag_index
FROM bundles.new_data_item_tags ndit
JOIN bundles.new_data_items ndi ON ndi.id = ndit.data_item_id
JOIN (SELECT transaction_id, block_transaction_index FROM new_block_transactions
      UNION
      SELECT transaction_id, block_transaction_index FROM stable_block_transactions) bt
  ON bt.transaction_id = ndi.root_transaction_id
WHERE ndit.height <= ?";

const DELETE_STALE_NEW_BLOCKS: &str = "DELETE FROM new_blocks WHERE height <= ?";

const DELETE_STALE_NEW_BLOCK_TRANSACTIONS: &str =
    "DELETE FROM new_block_transactions WHERE height <= ?";

const DELETE_STALE_NEW_TRANSACTIONS: &str = "\
DELETE FROM new_transactions
WHERE (height IS NOT NULL AND height <= ?) OR indexed_at < ?";

const DELETE_STALE_NEW_TRANSACTION_TAGS: &str = "\
DELETE FROM new_transaction_tags
WHERE (height IS NOT NULL AND height <= ?) OR indexed_at < ?";

const DELETE_STALE_NEW_DATA_ITEMS: &str = "\
DELETE FROM bundles.new_data_items
WHERE (height IS NOT NULL AND height <= ?) OR indexed_at < ?";

const DELETE_STALE_NEW_DATA_ITEM_TAGS: &str = "\
DELETE FROM bundles.new_data_item_tags
WHERE (height IS NOT NULL AND height <= ?) OR indexed_at < ?";

const CLEAR_HEIGHTS_ON_NEW_TRANSACTIONS: &str =
    "UPDATE new_transactions SET height = NULL WHERE height > ?";

const CLEAR_HEIGHTS_ON_NEW_TRANSACTION_TAGS: &str =
    "UPDATE new_transaction_tags SET height = NULL WHERE height > ?";

const TRUNCATE_NEW_BLOCKS_AT: &str = "DELETE FROM new_blocks WHERE height > ?";

const TRUNCATE_NEW_BLOCK_TRANSACTIONS_AT: &str =
    "DELETE FROM new_block_transactions WHERE height > ?";

const TRUNCATE_MISSING_TRANSACTIONS_AT: &str =
    "DELETE FROM missing_transactions WHERE height > ?";

const UPDATE_NEW_TRANSACTION_OFFSET: &str =
    "UPDATE new_transactions SET offset = ? WHERE id = ?";

const UPDATE_STABLE_TRANSACTION_OFFSET: &str =
    "UPDATE stable_transactions SET offset = ? WHERE id = ?";

/// Write-side statement repository, warmed at worker boot.
pub const WRITE_STATEMENTS: &[(&str, &str)] = &[
    ("insert_or_ignore_new_block", INSERT_OR_IGNORE_NEW_BLOCK),
    (
        "insert_or_ignore_new_block_transaction",
        INSERT_OR_IGNORE_NEW_BLOCK_TRANSACTION,
    ),
    (
        "insert_or_ignore_missing_transaction",
        INSERT_OR_IGNORE_MISSING_TRANSACTION,
    ),
    ("insert_or_ignore_tag_name", INSERT_OR_IGNORE_TAG_NAME),
    ("insert_or_ignore_tag_value", INSERT_OR_IGNORE_TAG_VALUE),
    ("upsert_new_transaction_tag", UPSERT_NEW_TRANSACTION_TAG),
    ("insert_or_ignore_wallet", INSERT_OR_IGNORE_WALLET),
    ("upsert_new_transaction", UPSERT_NEW_TRANSACTION),
    (
        "select_missing_transaction_height",
        SELECT_MISSING_TRANSACTION_HEIGHT,
    ),
    ("delete_missing_transaction", DELETE_MISSING_TRANSACTION),
    ("update_new_data_item_heights", UPDATE_NEW_DATA_ITEM_HEIGHTS),
    (
        "update_new_data_item_tag_heights",
        UPDATE_NEW_DATA_ITEM_TAG_HEIGHTS,
    ),
    (
        "select_max_stable_block_timestamp",
        SELECT_MAX_STABLE_BLOCK_TIMESTAMP,
    ),
    ("insert_or_ignore_stable_blocks", INSERT_OR_IGNORE_STABLE_BLOCKS),
    (
        "insert_or_ignore_stable_block_transactions",
        INSERT_OR_IGNORE_STABLE_BLOCK_TRANSACTIONS,
    ),
    (
        "insert_or_ignore_stable_transactions",
        INSERT_OR_IGNORE_STABLE_TRANSACTIONS,
    ),
    (
        "insert_or_ignore_stable_transaction_tags",
        INSERT_OR_IGNORE_STABLE_TRANSACTION_TAGS,
    ),
    (
        "insert_or_ignore_stable_data_items",
        INSERT_OR_IGNORE_STABLE_DATA_ITEMS,
    ),
    (
        "insert_or_ignore_stable_data_item_tags",
        INSERT_OR_IGNORE_STABLE_DATA_ITEM_TAGS,
    ),
    ("delete_stale_new_blocks", DELETE_STALE_NEW_BLOCKS),
    (
        "delete_stale_new_block_transactions",
        DELETE_STALE_NEW_BLOCK_TRANSACTIONS,
    ),
    ("delete_stale_new_transactions", DELETE_STALE_NEW_TRANSACTIONS),
    (
        "delete_stale_new_transaction_tags",
        DELETE_STALE_NEW_TRANSACTION_TAGS,
    ),
    ("delete_stale_new_data_items", DELETE_STALE_NEW_DATA_ITEMS),
    (
        "delete_stale_new_data_item_tags",
        DELETE_STALE_NEW_DATA_ITEM_TAGS,
    ),
    (
        "clear_heights_on_new_transactions",
        CLEAR_HEIGHTS_ON_NEW_TRANSACTIONS,
    ),
    (
        "clear_heights_on_new_transaction_tags",
        CLEAR_HEIGHTS_ON_NEW_TRANSACTION_TAGS,
    ),
    ("truncate_new_blocks_at", TRUNCATE_NEW_BLOCKS_AT),
    (
        "truncate_new_block_transactions_at",
        TRUNCATE_NEW_BLOCK_TRANSACTIONS_AT,
    ),
    (
        "truncate_missing_transactions_at",
        TRUNCATE_MISSING_TRANSACTIONS_AT,
    ),
    ("update_new_transaction_offset", UPDATE_NEW_TRANSACTION_OFFSET),
    (
        "update_stable_transaction_offset",
        UPDATE_STABLE_TRANSACTION_OFFSET,
    ),
];

const SELECT_MAX_HEIGHT: &str = "\
SELECT MAX(
    COALESCE((SELECT MAX(height) FROM new_blocks), -1),
    COALESCE((SELECT MAX(height) FROM stable_blocks), -1)
)";

const SELECT_NEW_BLOCK_HASH_BY_HEIGHT: &str =
    "SELECT indep_hash FROM new_blocks WHERE height = ?";

const SELECT_STABLE_BLOCK_HASH_BY_HEIGHT: &str =
    "SELECT indep_hash FROM stable_blocks WHERE height = ?";

const SELECT_MISSING_TRANSACTION_IDS: &str =
    "SELECT transaction_id FROM missing_transactions ORDER BY height ASC LIMIT ?";

const SELECT_TRANSACTION_IDS_MISSING_OFFSETS: &str = "\
SELECT id FROM stable_transactions
WHERE offset IS NULL AND data_size > 0
ORDER BY height DESC LIMIT ?";

/// Read-side statement repository, warmed at worker boot.
pub const READ_STATEMENTS: &[(&str, &str)] = &[
    ("select_max_height", SELECT_MAX_HEIGHT),
    (
        "select_new_block_hash_by_height",
        SELECT_NEW_BLOCK_HASH_BY_HEIGHT,
    ),
    (
        "select_stable_block_hash_by_height",
        SELECT_STABLE_BLOCK_HASH_BY_HEIGHT,
    ),
    ("select_missing_transaction_ids", SELECT_MISSING_TRANSACTION_IDS),
    (
        "select_transaction_ids_missing_offsets",
        SELECT_TRANSACTION_IDS_MISSING_OFFSETS,
    ),
];

// =============================================================================
// Write Worker
// =============================================================================

/// The single core writer. Owns a read-write core connection with the bundles
/// file attached, so height propagation and stable promotion reach both
/// stores in one pass.
pub struct ChainIndexWriter {
    conn: Connection,
    max_fork_depth: u64,
}

impl ChainIndexWriter {
    pub fn open(paths: &StorePaths, max_fork_depth: u64) -> Result<Self> {
        let conn = schema::open_core_rw(paths)?;
        schema::warm_statements(&conn, WRITE_STATEMENTS)?;
        Ok(Self {
            conn,
            max_fork_depth,
        })
    }

    /// Ingests one block with its fetched transactions and the ids it carries
    /// that could not be fetched, atomically.
    ///
    /// When the height lands on the flush cadence, stable promotion and
    /// new-row cleanup run inside the same transaction.
    pub fn save_block_and_txs(
        &mut self,
        block: &BlockHeader,
        txs: &[TxRecord],
        missing_tx_ids: &[String],
    ) -> Result<()> {
        let now = unix_now();
        let max_fork_depth = self.max_fork_depth;
        let tx = self.conn.transaction()?;

        let indep_hash = b64_decode(&block.indep_hash)?;
        let (rate_dividend, rate_divisor) = match &block.usd_to_ar_rate {
            Some((dividend, divisor)) => (Some(dividend.as_str()), Some(divisor.as_str())),
            None => (None, None),
        };
        let (sched_dividend, sched_divisor) = match &block.scheduled_usd_to_ar_rate {
            Some((dividend, divisor)) => (Some(dividend.as_str()), Some(divisor.as_str())),
            None => (None, None),
        };

        tx.prepare_cached(INSERT_OR_IGNORE_NEW_BLOCK)?.execute(params![
            indep_hash,
            block.height,
            b64_decode_opt(&block.previous_block)?,
            b64_decode(&block.nonce)?,
            b64_decode(&block.hash)?,
            block.block_timestamp,
            block.diff,
            block.cumulative_diff,
            block.last_retarget,
            b64_decode_opt(&block.reward_addr)?,
            block.reward_pool,
            block.block_size,
            block.weave_size,
            rate_dividend,
            rate_divisor,
            sched_dividend,
            sched_divisor,
            b64_decode_opt(&block.hash_list_merkle)?,
            b64_decode_opt(&block.wallet_list)?,
            b64_decode_opt(&block.tx_root)?,
            block.txs.len(),
            missing_tx_ids.len(),
        ])?;

        for (index, tx_id) in block.txs.iter().enumerate() {
            tx.prepare_cached(INSERT_OR_IGNORE_NEW_BLOCK_TRANSACTION)?
                .execute(params![indep_hash, b64_decode(tx_id)?, index, block.height])?;
        }

        for record in txs {
            insert_transaction(&tx, record, Some(block.height as i64), now)?;
        }

        for tx_id in missing_tx_ids {
            tx.prepare_cached(INSERT_OR_IGNORE_MISSING_TRANSACTION)?
                .execute(params![indep_hash, b64_decode(tx_id)?, block.height])?;
        }

        if block.height % STABLE_FLUSH_INTERVAL == 0 {
            flush_stable(&tx, block.height, max_fork_depth)?;
        }

        tx.commit()?;
        debug!(
            height = block.height,
            txs = txs.len(),
            missing = missing_tx_ids.len(),
            "block ingested"
        );
        Ok(())
    }

    /// Ingests a transaction arriving after its block.
    ///
    /// A pending `missing_transactions` row supplies the height; the
    /// placeholder is removed in the same transaction.
    pub fn save_tx(&mut self, record: &TxRecord) -> Result<()> {
        let now = unix_now();
        let tx = self.conn.transaction()?;

        let id = b64_decode(&record.id)?;
        let height: Option<i64> = tx
            .prepare_cached(SELECT_MISSING_TRANSACTION_HEIGHT)?
            .query_row(params![id], |row| row.get(0))
            .optional()?;

        insert_transaction(&tx, record, height, now)?;

        tx.prepare_cached(DELETE_MISSING_TRANSACTION)?
            .execute(params![id])?;

        tx.commit()?;
        Ok(())
    }

    /// Rolls the fork-prone state back to `height`.
    ///
    /// One transaction on this connection; the bundles-side rollback runs on
    /// the bundles writer's own transaction (cross-store atomicity is not
    /// required because stable state is untouched).
    pub fn reset_to_height(&mut self, height: u64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(CLEAR_HEIGHTS_ON_NEW_TRANSACTIONS)?
            .execute(params![height])?;
        tx.prepare_cached(CLEAR_HEIGHTS_ON_NEW_TRANSACTION_TAGS)?
            .execute(params![height])?;
        tx.prepare_cached(TRUNCATE_NEW_BLOCKS_AT)?
            .execute(params![height])?;
        tx.prepare_cached(TRUNCATE_NEW_BLOCK_TRANSACTIONS_AT)?
            .execute(params![height])?;
        tx.prepare_cached(TRUNCATE_MISSING_TRANSACTIONS_AT)?
            .execute(params![height])?;
        tx.commit()?;
        info!(height, "core reset to height");
        Ok(())
    }

    /// Records the absolute weave offset of a transaction on both staging
    /// families.
    pub fn save_tx_offset(&mut self, id: &str, offset: u64) -> Result<()> {
        let id = b64_decode(id)?;
        let tx = self.conn.transaction()?;
        tx.prepare_cached(UPDATE_NEW_TRANSACTION_OFFSET)?
            .execute(params![offset, id])?;
        tx.prepare_cached(UPDATE_STABLE_TRANSACTION_OFFSET)?
            .execute(params![offset, id])?;
        tx.commit()?;
        Ok(())
    }
}

/// Decodes an id, mapping the empty string to NULL.
fn b64_decode_opt(value: &str) -> Result<Option<Vec<u8>>> {
    if value.is_empty() {
        Ok(None)
    } else {
        b64_decode(value).map(Some)
    }
}

/// Inserts one transaction row with its tags and wallet, linking the given
/// height, and pushes the height onto any data items already indexed under
/// this transaction.
fn insert_transaction(
    tx: &SqlTransaction<'_>,
    record: &TxRecord,
    height: Option<i64>,
    now: i64,
) -> Result<()> {
    let id = b64_decode(&record.id)?;

    if let Some(height) = height {
        tx.prepare_cached(UPDATE_NEW_DATA_ITEM_HEIGHTS)?
            .execute(params![height, id])?;
        tx.prepare_cached(UPDATE_NEW_DATA_ITEM_TAG_HEIGHTS)?
            .execute(params![height, id])?;
    }

    for (index, tag) in record.tags.iter().enumerate() {
        let name_hash = tag_hash(tag.name.as_bytes());
        let value_hash = tag_hash(tag.value.as_bytes());
        tx.prepare_cached(INSERT_OR_IGNORE_TAG_NAME)?
            .execute(params![name_hash, tag.name.as_bytes()])?;
        tx.prepare_cached(INSERT_OR_IGNORE_TAG_VALUE)?
            .execute(params![value_hash, tag.value.as_bytes()])?;
        tx.prepare_cached(UPSERT_NEW_TRANSACTION_TAG)?
            .execute(params![name_hash, value_hash, id, index, now, height])?;
    }

    let modulus = b64_decode(&record.owner)?;
    let address = owner_address(&modulus);
    tx.prepare_cached(INSERT_OR_IGNORE_WALLET)?
        .execute(params![address, modulus])?;

    tx.prepare_cached(UPSERT_NEW_TRANSACTION)?.execute(params![
        id,
        b64_decode_opt(&record.signature)?,
        record.format,
        b64_decode_opt(&record.last_tx)?,
        address,
        b64_decode_opt(&record.target)?,
        record.quantity,
        record.reward,
        record.data_size,
        b64_decode_opt(&record.data_root)?,
        content_type_from_tags(&record.tags),
        record.tags.len(),
        now,
        height,
    ])?;

    Ok(())
}

/// Promotes everything at `height ≤ tip − max_fork_depth` into the stable
/// families of both stores, then garbage-collects stale `new_*` rows.
fn flush_stable(tx: &SqlTransaction<'_>, tip: u64, max_fork_depth: u64) -> Result<()> {
    // Read before promoting: the cleanup grace window is anchored to the
    // stable timestamps as they were when this flush began.
    let max_stable_ts: Option<i64> = tx
        .prepare_cached(SELECT_MAX_STABLE_BLOCK_TIMESTAMP)?
        .query_row([], |row| row.get(0))?;

    let end_height = tip as i64 - max_fork_depth as i64;

    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_BLOCKS)?
        .execute(params![end_height])?;
    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_BLOCK_TRANSACTIONS)?
        .execute(params![end_height])?;
    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_TRANSACTIONS)?
        .execute(params![end_height])?;
    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_TRANSACTION_TAGS)?
        .execute(params![end_height])?;
    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_DATA_ITEMS)?
        .execute(params![end_height])?;
    tx.prepare_cached(INSERT_OR_IGNORE_STABLE_DATA_ITEM_TAGS)?
        .execute(params![end_height])?;

    let tx_cutoff = max_stable_ts
        .map(|ts| ts - NEW_TX_CLEANUP_WAIT.as_secs() as i64)
        .unwrap_or(i64::MIN);
    let item_cutoff = max_stable_ts
        .map(|ts| ts - NEW_DATA_ITEM_CLEANUP_WAIT.as_secs() as i64)
        .unwrap_or(i64::MIN);

    tx.prepare_cached(DELETE_STALE_NEW_BLOCKS)?
        .execute(params![end_height])?;
    tx.prepare_cached(DELETE_STALE_NEW_BLOCK_TRANSACTIONS)?
        .execute(params![end_height])?;
    tx.prepare_cached(DELETE_STALE_NEW_TRANSACTIONS)?
        .execute(params![end_height, tx_cutoff])?;
    tx.prepare_cached(DELETE_STALE_NEW_TRANSACTION_TAGS)?
        .execute(params![end_height, tx_cutoff])?;
    tx.prepare_cached(DELETE_STALE_NEW_DATA_ITEMS)?
        .execute(params![end_height, item_cutoff])?;
    tx.prepare_cached(DELETE_STALE_NEW_DATA_ITEM_TAGS)?
        .execute(params![end_height, item_cutoff])?;

    debug!(tip, end_height, "stable flush complete");
    Ok(())
}

// =============================================================================
// Read Worker
// =============================================================================

/// A core reader: read-only connection, pure queries.
pub struct ChainIndexReader {
    conn: Connection,
}

impl ChainIndexReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_core_ro(paths)?;
        schema::warm_statements(&conn, READ_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// Highest indexed height across both staging families, if any block has
    /// been ingested.
    pub fn get_max_height(&self) -> Result<Option<u64>> {
        let max: i64 = self
            .conn
            .prepare_cached(SELECT_MAX_HEIGHT)?
            .query_row([], |row| row.get(0))?;
        Ok(if max < 0 { None } else { Some(max as u64) })
    }

    /// Independent hash of the block at `height`, preferring the fork-prone
    /// tip over the stable prefix.
    pub fn get_block_hash_by_height(&self, height: u64) -> Result<Option<String>> {
        let new: Option<Vec<u8>> = self
            .conn
            .prepare_cached(SELECT_NEW_BLOCK_HASH_BY_HEIGHT)?
            .query_row(params![height], |row| row.get(0))
            .optional()?;
        if let Some(hash) = new {
            return Ok(Some(b64_encode(&hash)));
        }
        let stable: Option<Vec<u8>> = self
            .conn
            .prepare_cached(SELECT_STABLE_BLOCK_HASH_BY_HEIGHT)?
            .query_row(params![height], |row| row.get(0))
            .optional()?;
        Ok(stable.map(|hash| b64_encode(&hash)))
    }

    /// Transaction ids whose blocks were ingested without them, oldest first.
    pub fn get_missing_tx_ids(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(SELECT_MISSING_TRANSACTION_IDS)?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.iter().map(|id| b64_encode(id)).collect())
    }

    /// Stable transactions that carry data but have no recorded weave offset.
    pub fn get_tx_ids_missing_offsets(&self, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_TRANSACTION_IDS_MISSING_OFFSETS)?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.iter().map(|id| b64_encode(id)).collect())
    }
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the core write worker.
pub enum CoreWriteJob {
    SaveBlockAndTxs {
        block: Box<BlockHeader>,
        txs: Vec<TxRecord>,
        missing_tx_ids: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveTx {
        tx: Box<TxRecord>,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetToHeight {
        height: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveTxOffset {
        id: String,
        offset: u64,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PoolWorker for ChainIndexWriter {
    type Job = CoreWriteJob;

    fn handle(&mut self, job: CoreWriteJob) -> JobOutcome {
        match job {
            CoreWriteJob::SaveBlockAndTxs {
                block,
                txs,
                missing_tx_ids,
                reply,
            } => respond(reply, self.save_block_and_txs(&block, &txs, &missing_tx_ids)),
            CoreWriteJob::SaveTx { tx, reply } => respond(reply, self.save_tx(&tx)),
            CoreWriteJob::ResetToHeight { height, reply } => {
                respond(reply, self.reset_to_height(height))
            }
            CoreWriteJob::SaveTxOffset { id, offset, reply } => {
                respond(reply, self.save_tx_offset(&id, offset))
            }
        }
    }
}

/// Jobs served by the core read worker.
pub enum CoreReadJob {
    GetMaxHeight {
        reply: oneshot::Sender<Result<Option<u64>>>,
    },
    GetBlockHashByHeight {
        height: u64,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    GetMissingTxIds {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    GetTxIdsMissingOffsets {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
}

impl PoolWorker for ChainIndexReader {
    type Job = CoreReadJob;

    fn handle(&mut self, job: CoreReadJob) -> JobOutcome {
        match job {
            CoreReadJob::GetMaxHeight { reply } => respond(reply, self.get_max_height()),
            CoreReadJob::GetBlockHashByHeight { height, reply } => {
                respond(reply, self.get_block_hash_by_height(height))
            }
            CoreReadJob::GetMissingTxIds { limit, reply } => {
                respond(reply, self.get_missing_tx_ids(limit))
            }
            CoreReadJob::GetTxIdsMissingOffsets { limit, reply } => {
                respond(reply, self.get_tx_ids_missing_offsets(limit))
            }
        }
    }
}

/// Sends the reply and reports the outcome for the worker's error budget.
pub(crate) fn respond<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> JobOutcome {
    let outcome = if result.is_err() {
        JobOutcome::Errored
    } else {
        JobOutcome::Completed
    };
    let _ = reply.send(result);
    outcome
}

// =============================================================================
// Tests
// =============================================================================
