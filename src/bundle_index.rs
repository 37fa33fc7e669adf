//! # Bundle and Data-Item Index
//!
//! Ingestion side of the `bundles` store: data items unbundled out of bundle
//! transactions, their tag occurrences, and the bundle lifecycle table that
//! tracks each bundle from queueing through full indexing.
//!
//! Data items mirror the core staging model (`new_data_items` →
//! `stable_data_items`); promotion itself runs from the core writer during
//! the stable flush, because it needs the root transactions'
//! `new_block_transactions` rows. What lives here:
//!
//! - `save_data_item`, resolving the root transaction's height through the
//!   attached `core` schema so late-unbundled items link immediately;
//! - `save_bundle`, an upsert that only ever fills fields forward (a partial
//!   record never erases lifecycle stamps written earlier);
//! - the lifecycle maintenance passes (`update_bundles_fully_indexed_at`,
//!   `update_bundles_for_filter_change`, `backfill_bundles`,
//!   `get_failed_bundle_ids`);
//! - the bundles-side fork rollback.
//!
//! `filters` and `bundle_formats` are small integer-keyed dimension tables.
//! Their ids are stable for the life of the process, so each worker keeps a
//! populate-on-first-use cache and never invalidates it.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::info;

use crate::chain_index::respond;
use crate::encoding::{b64_decode, b64_encode, owner_address, tag_hash};
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{
    content_type_from_tags, unix_now, BundleRecord, DataItemRecord, BUNDLE_REPROCESS_WAIT,
};

// =============================================================================
// Named Statements
// =============================================================================

const SELECT_TRANSACTION_HEIGHT: &str = "\
SELECT height FROM (
    SELECT height FROM core.new_transactions WHERE id = ?1 AND height IS NOT NULL
    UNION ALL
    SELECT height FROM core.stable_transactions WHERE id = ?1
) LIMIT 1";

const INSERT_OR_IGNORE_TAG_NAME: &str =
    "INSERT OR IGNORE INTO tag_names (hash, name) VALUES (?, ?)";

const INSERT_OR_IGNORE_TAG_VALUE: &str =
    "INSERT OR IGNORE INTO tag_values (hash, value) VALUES (?, ?)";

const UPSERT_NEW_DATA_ITEM_TAG: &str = "\
INSERT INTO new_data_item_tags
    (tag_name_hash, tag_value_hash, data_item_id, data_item_tag_index, indexed_at, height)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT (tag_name_hash, tag_value_hash, data_item_id, data_item_tag_index)
DO UPDATE SET height = excluded.height";

const INSERT_OR_IGNORE_WALLET: &str =
    "INSERT OR IGNORE INTO wallets (address, public_modulus) VALUES (?, ?)";

const UPSERT_NEW_DATA_ITEM: &str = "\
INSERT INTO new_data_items (
    id, parent_id, root_transaction_id, height, signature, anchor,
    owner_address, target, data_offset, data_size, content_type, tag_count,
    indexed_at, filter_id
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (id) DO UPDATE SET
    height = excluded.height,
    filter_id = COALESCE(excluded.filter_id, filter_id)";

const INSERT_OR_IGNORE_FILTER: &str = "INSERT OR IGNORE INTO filters (filter) VALUES (?)";

const SELECT_FILTER_ID: &str = "SELECT id FROM filters WHERE filter = ?";

const INSERT_OR_IGNORE_BUNDLE_FORMAT: &str =
    "INSERT OR IGNORE INTO bundle_formats (format) VALUES (?)";

const SELECT_BUNDLE_FORMAT_ID: &str = "SELECT id FROM bundle_formats WHERE format = ?";

const UPSERT_BUNDLE: &str = "\
INSERT INTO bundles (
    id, root_transaction_id, format_id, unbundle_filter_id, index_filter_id,
    data_item_count, matched_data_item_count,
    queued_at, skipped_at, unbundled_at, fully_indexed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (id) DO UPDATE SET
    format_id = COALESCE(excluded.format_id, format_id),
    unbundle_filter_id = COALESCE(excluded.unbundle_filter_id, unbundle_filter_id),
    index_filter_id = COALESCE(excluded.index_filter_id, index_filter_id),
    data_item_count = COALESCE(excluded.data_item_count, data_item_count),
    matched_data_item_count =
        COALESCE(excluded.matched_data_item_count, matched_data_item_count),
    queued_at = COALESCE(excluded.queued_at, queued_at),
    skipped_at = COALESCE(excluded.skipped_at, skipped_at),
    unbundled_at = COALESCE(excluded.unbundled_at, unbundled_at),
    fully_indexed_at = COALESCE(excluded.fully_indexed_at, fully_indexed_at)";

const UPDATE_BUNDLES_FULLY_INDEXED_AT: &str = "\
UPDATE bundles SET fully_indexed_at = ?
WHERE fully_indexed_at IS NULL
  AND matched_data_item_count IS NOT NULL
  AND matched_data_item_count > 0
  AND matched_data_item_count = (
      SELECT COUNT(*) FROM (
          SELECT id FROM new_data_items WHERE parent_id = bundles.id
          UNION
          SELECT id FROM stable_data_items WHERE parent_id = bundles.id
      )
  )";

const CLEAR_STAMPS_FOR_FILTER_CHANGE: &str = "\
UPDATE bundles SET
    queued_at = NULL, skipped_at = NULL, unbundled_at = NULL, fully_indexed_at = NULL
WHERE unbundle_filter_id IS NOT ?1 OR index_filter_id IS NOT ?2";

const REQUEUE_UNDERINDEXED_BUNDLES: &str = "\
UPDATE bundles SET queued_at = ?
WHERE fully_indexed_at IS NULL
  AND matched_data_item_count IS NOT NULL
  AND matched_data_item_count > (
      SELECT COUNT(*) FROM (
          SELECT id FROM new_data_items WHERE parent_id = bundles.id
          UNION
          SELECT id FROM stable_data_items WHERE parent_id = bundles.id
      )
  )";

const CLEAR_HEIGHTS_ON_NEW_DATA_ITEMS: &str =
    "UPDATE new_data_items SET height = NULL WHERE height > ?";

const CLEAR_HEIGHTS_ON_NEW_DATA_ITEM_TAGS: &str =
    "UPDATE new_data_item_tags SET height = NULL WHERE height > ?";

/// Write-side statement repository, warmed at worker boot.
pub const WRITE_STATEMENTS: &[(&str, &str)] = &[
    ("select_transaction_height", SELECT_TRANSACTION_HEIGHT),
    ("insert_or_ignore_tag_name", INSERT_OR_IGNORE_TAG_NAME),
    ("insert_or_ignore_tag_value", INSERT_OR_IGNORE_TAG_VALUE),
    ("upsert_new_data_item_tag", UPSERT_NEW_DATA_ITEM_TAG),
    ("insert_or_ignore_wallet", INSERT_OR_IGNORE_WALLET),
    ("upsert_new_data_item", UPSERT_NEW_DATA_ITEM),
    ("insert_or_ignore_filter", INSERT_OR_IGNORE_FILTER),
    ("select_filter_id", SELECT_FILTER_ID),
    ("insert_or_ignore_bundle_format", INSERT_OR_IGNORE_BUNDLE_FORMAT),
    ("select_bundle_format_id", SELECT_BUNDLE_FORMAT_ID),
    ("upsert_bundle", UPSERT_BUNDLE),
    (
        "update_bundles_fully_indexed_at",
        UPDATE_BUNDLES_FULLY_INDEXED_AT,
    ),
    ("clear_stamps_for_filter_change", CLEAR_STAMPS_FOR_FILTER_CHANGE),
    ("requeue_underindexed_bundles", REQUEUE_UNDERINDEXED_BUNDLES),
    ("clear_heights_on_new_data_items", CLEAR_HEIGHTS_ON_NEW_DATA_ITEMS),
    (
        "clear_heights_on_new_data_item_tags",
        CLEAR_HEIGHTS_ON_NEW_DATA_ITEM_TAGS,
    ),
];

const SELECT_FAILED_BUNDLE_IDS: &str = "\
SELECT id FROM bundles
WHERE unbundled_at IS NULL
  AND COALESCE(queued_at, skipped_at) IS NOT NULL
  AND COALESCE(queued_at, skipped_at) < ?
ORDER BY COALESCE(queued_at, skipped_at) ASC
LIMIT ?";

/// Read-side statement repository, warmed at worker boot.
pub const READ_STATEMENTS: &[(&str, &str)] =
    &[("select_failed_bundle_ids", SELECT_FAILED_BUNDLE_IDS)];

// =============================================================================
// Write Worker
// =============================================================================

/// The single bundles writer. Owns a read-write bundles connection with the
/// core file attached, plus the never-invalidated dimension-id caches.
pub struct BundleIndexWriter {
    conn: Connection,
    filter_ids: HashMap<String, i64>,
    format_ids: HashMap<String, i64>,
}

impl BundleIndexWriter {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_bundles_rw(paths)?;
        schema::warm_statements(&conn, WRITE_STATEMENTS)?;
        Ok(Self {
            conn,
            filter_ids: HashMap::new(),
            format_ids: HashMap::new(),
        })
    }

    /// Ingests one data item atomically: tags, wallet, filter dimension, and
    /// the item row, linked to its root transaction's height when known.
    pub fn save_data_item(&mut self, item: &DataItemRecord) -> Result<()> {
        let now = unix_now();
        let root_id = b64_decode(&item.root_transaction_id)?;
        let id = b64_decode(&item.id)?;

        let filter_id = match &item.filter {
            Some(filter) => Some(get_or_create_id(
                &self.conn,
                &mut self.filter_ids,
                INSERT_OR_IGNORE_FILTER,
                SELECT_FILTER_ID,
                filter,
            )?),
            None => None,
        };

        let tx = self.conn.transaction()?;

        let height: Option<i64> = tx
            .prepare_cached(SELECT_TRANSACTION_HEIGHT)?
            .query_row(params![root_id], |row| row.get(0))
            .optional()?;

        for (index, tag) in item.tags.iter().enumerate() {
            let name_hash = tag_hash(tag.name.as_bytes());
            let value_hash = tag_hash(tag.value.as_bytes());
            tx.prepare_cached(INSERT_OR_IGNORE_TAG_NAME)?
                .execute(params![name_hash, tag.name.as_bytes()])?;
            tx.prepare_cached(INSERT_OR_IGNORE_TAG_VALUE)?
                .execute(params![value_hash, tag.value.as_bytes()])?;
            tx.prepare_cached(UPSERT_NEW_DATA_ITEM_TAG)?
                .execute(params![name_hash, value_hash, id, index, now, height])?;
        }

        let modulus = b64_decode(&item.owner)?;
        let address = owner_address(&modulus);
        tx.prepare_cached(INSERT_OR_IGNORE_WALLET)?
            .execute(params![address, modulus])?;

        tx.prepare_cached(UPSERT_NEW_DATA_ITEM)?.execute(params![
            id,
            b64_decode(&item.parent_id)?,
            root_id,
            height,
            b64_decode_opt(&item.signature)?,
            b64_decode_opt(&item.anchor)?,
            address,
            b64_decode_opt(&item.target)?,
            item.data_offset,
            item.data_size,
            content_type_from_tags(&item.tags),
            item.tags.len(),
            now,
            filter_id,
        ])?;

        tx.commit()?;
        Ok(())
    }

    /// Upserts a bundle lifecycle record. Absent fields never clobber values
    /// already recorded.
    pub fn save_bundle(&mut self, record: &BundleRecord) -> Result<()> {
        let format_id = if record.format.is_empty() {
            None
        } else {
            Some(get_or_create_id(
                &self.conn,
                &mut self.format_ids,
                INSERT_OR_IGNORE_BUNDLE_FORMAT,
                SELECT_BUNDLE_FORMAT_ID,
                &record.format,
            )?)
        };
        let unbundle_filter_id = match &record.unbundle_filter {
            Some(filter) => Some(get_or_create_id(
                &self.conn,
                &mut self.filter_ids,
                INSERT_OR_IGNORE_FILTER,
                SELECT_FILTER_ID,
                filter,
            )?),
            None => None,
        };
        let index_filter_id = match &record.index_filter {
            Some(filter) => Some(get_or_create_id(
                &self.conn,
                &mut self.filter_ids,
                INSERT_OR_IGNORE_FILTER,
                SELECT_FILTER_ID,
                filter,
            )?),
            None => None,
        };

        self.conn.prepare_cached(UPSERT_BUNDLE)?.execute(params![
            b64_decode(&record.id)?,
            b64_decode(&record.root_transaction_id)?,
            format_id,
            unbundle_filter_id,
            index_filter_id,
            record.data_item_count,
            record.matched_data_item_count,
            record.queued_at,
            record.skipped_at,
            record.unbundled_at,
            record.fully_indexed_at,
        ])?;
        Ok(())
    }

    /// Stamps `fully_indexed_at` on bundles whose matched items are all
    /// present in the item index. Returns the number stamped.
    pub fn update_bundles_fully_indexed_at(&mut self) -> Result<usize> {
        let stamped = self
            .conn
            .prepare_cached(UPDATE_BUNDLES_FULLY_INDEXED_AT)?
            .execute(params![unix_now()])?;
        Ok(stamped)
    }

    /// Clears lifecycle stamps on every bundle that was processed under
    /// filters other than the current pair, so it is picked up again.
    pub fn update_bundles_for_filter_change(
        &mut self,
        unbundle_filter: &str,
        index_filter: &str,
    ) -> Result<usize> {
        let unbundle_id = get_or_create_id(
            &self.conn,
            &mut self.filter_ids,
            INSERT_OR_IGNORE_FILTER,
            SELECT_FILTER_ID,
            unbundle_filter,
        )?;
        let index_id = get_or_create_id(
            &self.conn,
            &mut self.filter_ids,
            INSERT_OR_IGNORE_FILTER,
            SELECT_FILTER_ID,
            index_filter,
        )?;
        let cleared = self
            .conn
            .prepare_cached(CLEAR_STAMPS_FOR_FILTER_CHANGE)?
            .execute(params![unbundle_id, index_id])?;
        if cleared > 0 {
            info!(cleared, "bundles re-queued after filter change");
        }
        Ok(cleared)
    }

    /// Re-queues bundles whose indexed item count still trails their matched
    /// count. Returns the number re-queued.
    pub fn backfill_bundles(&mut self) -> Result<usize> {
        let requeued = self
            .conn
            .prepare_cached(REQUEUE_UNDERINDEXED_BUNDLES)?
            .execute(params![unix_now()])?;
        Ok(requeued)
    }

    /// Bundles-side fork rollback: unlink heights above the fork point.
    pub fn reset_to_height(&mut self, height: u64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(CLEAR_HEIGHTS_ON_NEW_DATA_ITEMS)?
            .execute(params![height])?;
        tx.prepare_cached(CLEAR_HEIGHTS_ON_NEW_DATA_ITEM_TAGS)?
            .execute(params![height])?;
        tx.commit()?;
        info!(height, "bundles reset to height");
        Ok(())
    }
}

/// Looks up a dimension id through the per-worker cache, inserting the row on
/// first sight. Ids are stable for the process lifetime, so the cache is
/// never invalidated.
fn get_or_create_id(
    conn: &Connection,
    cache: &mut HashMap<String, i64>,
    insert_sql: &str,
    select_sql: &str,
    key: &str,
) -> Result<i64> {
    if let Some(id) = cache.get(key) {
        return Ok(*id);
    }
    conn.prepare_cached(insert_sql)?.execute(params![key])?;
    let id: i64 = conn
        .prepare_cached(select_sql)?
        .query_row(params![key], |row| row.get(0))?;
    cache.insert(key.to_string(), id);
    Ok(id)
}

fn b64_decode_opt(value: &str) -> Result<Option<Vec<u8>>> {
    if value.is_empty() {
        Ok(None)
    } else {
        b64_decode(value).map(Some)
    }
}

// =============================================================================
// Read Worker
// =============================================================================

/// A bundles reader: read-only connection, pure queries.
pub struct BundleIndexReader {
    conn: Connection,
}

impl BundleIndexReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_bundles_ro(paths)?;
        schema::warm_statements(&conn, READ_STATEMENTS)?;
        Ok(Self { conn })
    }

    /// Bundles queued or skipped longer ago than the reprocess wait that were
    /// never unbundled, oldest first.
    pub fn get_failed_bundle_ids(&self, limit: usize) -> Result<Vec<String>> {
        let cutoff = unix_now() - BUNDLE_REPROCESS_WAIT.as_secs() as i64;
        let mut stmt = self.conn.prepare_cached(SELECT_FAILED_BUNDLE_IDS)?;
        let ids = stmt
            .query_map(params![cutoff, limit], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.iter().map(|id| b64_encode(id)).collect())
    }
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the bundles write worker.
pub enum BundlesWriteJob {
    SaveDataItem {
        item: Box<DataItemRecord>,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveBundle {
        record: Box<BundleRecord>,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateBundlesFullyIndexedAt {
        reply: oneshot::Sender<Result<usize>>,
    },
    UpdateBundlesForFilterChange {
        unbundle_filter: String,
        index_filter: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    BackfillBundles {
        reply: oneshot::Sender<Result<usize>>,
    },
    ResetToHeight {
        height: u64,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl PoolWorker for BundleIndexWriter {
    type Job = BundlesWriteJob;

    fn handle(&mut self, job: BundlesWriteJob) -> JobOutcome {
        match job {
            BundlesWriteJob::SaveDataItem { item, reply } => {
                respond(reply, self.save_data_item(&item))
            }
            BundlesWriteJob::SaveBundle { record, reply } => {
                respond(reply, self.save_bundle(&record))
            }
            BundlesWriteJob::UpdateBundlesFullyIndexedAt { reply } => {
                respond(reply, self.update_bundles_fully_indexed_at())
            }
            BundlesWriteJob::UpdateBundlesForFilterChange {
                unbundle_filter,
                index_filter,
                reply,
            } => respond(
                reply,
                self.update_bundles_for_filter_change(&unbundle_filter, &index_filter),
            ),
            BundlesWriteJob::BackfillBundles { reply } => respond(reply, self.backfill_bundles()),
            BundlesWriteJob::ResetToHeight { height, reply } => {
                respond(reply, self.reset_to_height(height))
            }
        }
    }
}

/// Jobs served by the bundles read worker.
pub enum BundlesReadJob {
    GetFailedBundleIds {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
}

impl PoolWorker for BundleIndexReader {
    type Job = BundlesReadJob;

    fn handle(&mut self, job: BundlesReadJob) -> JobOutcome {
        match job {
            BundlesReadJob::GetFailedBundleIds { limit, reply } => {
                respond(reply, self.get_failed_bundle_ids(limit))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_index::ChainIndexWriter;
    use crate::test_support::{block_at, item_in, test_id, tx_with_tags, TestStores};

    #[test]
    fn test_save_data_item_resolves_root_height() {
        let stores = TestStores::new();
        let mut core = ChainIndexWriter::open(&stores.paths, 50).unwrap();
        let mut bundles = BundleIndexWriter::open(&stores.paths).unwrap();

        let root = tx_with_tags("bundle-root", &[]);
        core.save_block_and_txs(&block_at(12, &[&root.id]), &[root.clone()], &[])
            .unwrap();

        let item = item_in("item-1", &root.id, &root.id);
        bundles.save_data_item(&item).unwrap();

        let height: i64 = stores
            .bundles_conn()
            .query_row(
                "SELECT height FROM new_data_items WHERE id = ?",
                [b64_decode(&item.id).unwrap()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(height, 12);
    }

    #[test]
    fn test_save_data_item_without_root_has_null_height() {
        let stores = TestStores::new();
        let mut bundles = BundleIndexWriter::open(&stores.paths).unwrap();

        let item = item_in("orphan-item", &test_id("unknown-root"), &test_id("unknown-root"));
        bundles.save_data_item(&item).unwrap();
        bundles.save_data_item(&item).unwrap(); // idempotent

        let conn = stores.bundles_conn();
        let (count, height): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(height) FROM new_data_items",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(height, None);
    }

    #[test]
    fn test_save_bundle_fills_forward() {
        let stores = TestStores::new();
        let mut bundles = BundleIndexWriter::open(&stores.paths).unwrap();

        let mut record = BundleRecord {
            id: test_id("bundle-1"),
            root_transaction_id: test_id("bundle-1"),
            format: "binary".to_string(),
            queued_at: Some(1_000),
            ..Default::default()
        };
        bundles.save_bundle(&record).unwrap();

        // Second save adds the unbundled stamp without erasing queued_at.
        record.queued_at = None;
        record.unbundled_at = Some(2_000);
        record.data_item_count = Some(3);
        record.matched_data_item_count = Some(2);
        bundles.save_bundle(&record).unwrap();

        let (queued, unbundled, matched): (i64, i64, i64) = stores
            .bundles_conn()
            .query_row(
                "SELECT queued_at, unbundled_at, matched_data_item_count FROM bundles",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((queued, unbundled, matched), (1_000, 2_000, 2));
    }

    #[test]
    fn test_fully_indexed_stamping_and_backfill() {
        let stores = TestStores::new();
        let mut bundles = BundleIndexWriter::open(&stores.paths).unwrap();

        let bundle_id = test_id("bundle-2");
        bundles
            .save_bundle(&BundleRecord {
                id: bundle_id.clone(),
                root_transaction_id: bundle_id.clone(),
                format: "binary".to_string(),
                matched_data_item_count: Some(2),
                unbundled_at: Some(unix_now()),
                ..Default::default()
            })
            .unwrap();

        // One of two matched items indexed: not fully indexed, backfill
        // re-queues.
        bundles
            .save_data_item(&item_in("only-item", &bundle_id, &bundle_id))
            .unwrap();
        assert_eq!(bundles.update_bundles_fully_indexed_at().unwrap(), 0);
        assert_eq!(bundles.backfill_bundles().unwrap(), 1);

        // Second item lands: stamped, nothing left to backfill.
        bundles
            .save_data_item(&item_in("second-item", &bundle_id, &bundle_id))
            .unwrap();
        assert_eq!(bundles.update_bundles_fully_indexed_at().unwrap(), 1);
        assert_eq!(bundles.backfill_bundles().unwrap(), 0);
    }

    #[test]
    fn test_failed_bundle_ids_respect_reprocess_wait() {
        let stores = TestStores::new();
        let mut writer = BundleIndexWriter::open(&stores.paths).unwrap();
        let reader = BundleIndexReader::open(&stores.paths).unwrap();

        let stale = BundleRecord {
            id: test_id("stale-bundle"),
            root_transaction_id: test_id("stale-bundle"),
            format: "binary".to_string(),
            queued_at: Some(unix_now() - BUNDLE_REPROCESS_WAIT.as_secs() as i64 - 60),
            ..Default::default()
        };
        let fresh = BundleRecord {
            id: test_id("fresh-bundle"),
            root_transaction_id: test_id("fresh-bundle"),
            format: "binary".to_string(),
            queued_at: Some(unix_now()),
            ..Default::default()
        };
        writer.save_bundle(&stale).unwrap();
        writer.save_bundle(&fresh).unwrap();

        assert_eq!(reader.get_failed_bundle_ids(10).unwrap(), vec![stale.id]);
    }

    #[test]
    fn test_filter_change_requeues_other_filters() {
        let stores = TestStores::new();
        let mut writer = BundleIndexWriter::open(&stores.paths).unwrap();

        writer
            .save_bundle(&BundleRecord {
                id: test_id("old-filter-bundle"),
                root_transaction_id: test_id("old-filter-bundle"),
                format: "binary".to_string(),
                unbundle_filter: Some("{\"old\":true}".to_string()),
                index_filter: Some("{\"old\":true}".to_string()),
                unbundled_at: Some(1_000),
                fully_indexed_at: Some(2_000),
                ..Default::default()
            })
            .unwrap();

        let cleared = writer
            .update_bundles_for_filter_change("{\"new\":true}", "{\"new\":true}")
            .unwrap();
        assert_eq!(cleared, 1);

        let unbundled: Option<i64> = stores
            .bundles_conn()
            .query_row("SELECT unbundled_at FROM bundles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(unbundled, None);
    }
}
