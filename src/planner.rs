//! # GQL Query Planner
//!
//! Cursor-paginated, tag-filtered queries that unify bare transactions and
//! bundled data items into one sorted stream.
//!
//! ## Four Sources, One Projection
//!
//! Every query draws from up to four sources — {stable, new} × {transactions,
//! data items} — each projected onto the same 18-column shape so their rows
//! merge under one total order:
//!
//! ```text
//! (height, block_transaction_index, data_item_id, indexed_at, id)
//! ```
//!
//! Bare transactions project `x'00'` as their `data_item_id`, which sorts
//! them ahead of the items bundled inside them; rows not yet linked to a
//! block carry NULL height and live on a secondary `(indexed_at, id)`
//! ordering plane — first in descending order, last in ascending.
//!
//! ## Page Assembly
//!
//! Each queried source gets `LIMIT page_size + 1`. Descending queries drain
//! the new family first, then the stable family with its upper height bound
//! stepped below the lowest height the new family returned (the families can
//! briefly overlap around a flush; the step prevents duplicates). Ascending
//! is symmetric. `has_next_page` is simply "more rows collected than the
//! page holds", and the continuation cursor re-encodes the last returned
//! row's ordering tuple.
//!
//! ## Tag Joins
//!
//! Tag constraints become joins against the tag-occurrence tables, in the
//! caller's order except that low-selectivity names ("App-Name",
//! "Content-Type") sink to the end. On stable sources the first join
//! equi-joins the shared `(height, block_transaction_index[, data_item_id])`
//! columns; every further join is written `CROSS JOIN … INDEXED BY …` with
//! the owner-id correlation in WHERE, pinning the join order and index so
//! the engine cannot reorder toward a low-selectivity tag. New-family joins
//! correlate on the owner id directly. Values match by SHA-1 of the raw
//! bytes, never by literal.

use std::cmp::Ordering;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::debug;

use crate::chain_index::respond;
use crate::encoding::{b64_decode, b64_encode, tag_hash, BlockCursor, ItemCursor};
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{
    BundledIn, Edge, GqlBlockNode, GqlBlockRef, GqlBlocksQuery, GqlTransactionNode,
    GqlTransactionsQuery, PageInfo, Paginated, Tag, TagFilter, LOW_SELECTIVITY_TAG_NAMES,
};

// =============================================================================
// Sources
// =============================================================================

/// The uniform 18-column projection, in mapping order:
/// height, block_transaction_index, data_item_id, indexed_at, id, anchor,
/// signature, target, reward, quantity, data_size, content_type,
/// owner_address, public_modulus, block_indep_hash, block_timestamp,
/// block_previous_block, parent_id.
const STABLE_TXS_SELECT: &str = "\
SELECT st.height, st.block_transaction_index, x'00', st.indexed_at, st.id,
       st.last_tx, st.signature, st.target, st.reward, st.quantity,
       st.data_size, st.content_type, st.owner_address, w.public_modulus,
       sb.indep_hash, sb.block_timestamp, sb.previous_block, x''
FROM stable_transactions st
JOIN stable_blocks sb ON sb.height = st.height
LEFT JOIN wallets w ON w.address = st.owner_address";

const STABLE_ITEMS_SELECT: &str = "\
SELECT sdi.height, sdi.block_transaction_index, sdi.id, sdi.indexed_at, sdi.id,
       sdi.anchor, sdi.signature, sdi.target, '0', '0',
       sdi.data_size, sdi.content_type, sdi.owner_address, w.public_modulus,
       sb.indep_hash, sb.block_timestamp, sb.previous_block, sdi.parent_id
FROM bundles.stable_data_items sdi
JOIN stable_blocks sb ON sb.height = sdi.height
LEFT JOIN bundles.wallets w ON w.address = sdi.owner_address";

const NEW_TXS_SELECT: &str = "\
SELECT nt.height, nbt.block_transaction_index, x'00', nt.indexed_at, nt.id,
       nt.last_tx, nt.signature, nt.target, nt.reward, nt.quantity,
       nt.data_size, nt.content_type, nt.owner_address, w.public_modulus,
       nb.indep_hash, nb.block_timestamp, nb.previous_block, x''
FROM new_transactions nt
LEFT JOIN new_block_transactions nbt ON nbt.transaction_id = nt.id
LEFT JOIN new_blocks nb ON nb.height = nt.height
LEFT JOIN wallets w ON w.address = nt.owner_address";

const NEW_ITEMS_SELECT: &str = "\
SELECT ndi.height, nbt.block_transaction_index, ndi.id, ndi.indexed_at, ndi.id,
       ndi.anchor, ndi.signature, ndi.target, '0', '0',
       ndi.data_size, ndi.content_type, ndi.owner_address, w.public_modulus,
       nb.indep_hash, nb.block_timestamp, nb.previous_block, ndi.parent_id
FROM bundles.new_data_items ndi
LEFT JOIN new_block_transactions nbt ON nbt.transaction_id = ndi.root_transaction_id
LEFT JOIN new_blocks nb ON nb.height = ndi.height
LEFT JOIN bundles.wallets w ON w.address = ndi.owner_address";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    StableTxs,
    StableItems,
    NewTxs,
    NewItems,
}

impl Source {
    fn name(self) -> &'static str {
        match self {
            Source::StableTxs => "stable_txs",
            Source::StableItems => "stable_items",
            Source::NewTxs => "new_txs",
            Source::NewItems => "new_items",
        }
    }

    fn select_from(self) -> &'static str {
        match self {
            Source::StableTxs => STABLE_TXS_SELECT,
            Source::StableItems => STABLE_ITEMS_SELECT,
            Source::NewTxs => NEW_TXS_SELECT,
            Source::NewItems => NEW_ITEMS_SELECT,
        }
    }

    /// Alias of the row-owning table.
    fn alias(self) -> &'static str {
        match self {
            Source::StableTxs => "st",
            Source::StableItems => "sdi",
            Source::NewTxs => "nt",
            Source::NewItems => "ndi",
        }
    }

    /// Expression for the projected `data_item_id` ordering column.
    fn item_id_expr(self) -> &'static str {
        match self {
            Source::StableTxs | Source::NewTxs => "x'00'",
            Source::StableItems => "sdi.id",
            Source::NewItems => "ndi.id",
        }
    }

    /// Expression for the projected `block_transaction_index` column.
    fn bti_expr(self) -> &'static str {
        match self {
            Source::StableTxs => "st.block_transaction_index",
            Source::StableItems => "sdi.block_transaction_index",
            Source::NewTxs | Source::NewItems => "nbt.block_transaction_index",
        }
    }

    fn is_item(self) -> bool {
        matches!(self, Source::StableItems | Source::NewItems)
    }

    fn is_stable(self) -> bool {
        matches!(self, Source::StableTxs | Source::StableItems)
    }

    /// Tag-occurrence table for this source.
    fn tag_table(self) -> &'static str {
        match self {
            Source::StableTxs => "stable_transaction_tags",
            Source::StableItems => "bundles.stable_data_item_tags",
            Source::NewTxs => "new_transaction_tags",
            Source::NewItems => "bundles.new_data_item_tags",
        }
    }

    /// Owner-id column inside the tag table.
    fn tag_owner_col(self) -> &'static str {
        if self.is_item() {
            "data_item_id"
        } else {
            "transaction_id"
        }
    }

    /// Owner-id index forced on chained stable tag joins.
    fn tag_index_hint(self) -> &'static str {
        match self {
            Source::StableTxs => "stable_transaction_tags_transaction_id_idx",
            Source::StableItems => "stable_data_item_tags_data_item_id_idx",
            Source::NewTxs => "new_transaction_tags_transaction_id_idx",
            Source::NewItems => "new_data_item_tags_data_item_id_idx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Stable,
    New,
}

// =============================================================================
// Raw Rows
// =============================================================================

/// One row of the uniform projection, still in store form (raw bytes).
#[derive(Debug, Clone)]
struct RawRow {
    height: Option<i64>,
    block_transaction_index: Option<i64>,
    data_item_id: Vec<u8>,
    indexed_at: i64,
    id: Vec<u8>,
    anchor: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
    target: Option<Vec<u8>>,
    reward: Option<String>,
    quantity: Option<String>,
    data_size: Option<i64>,
    content_type: Option<String>,
    owner_address: Option<Vec<u8>>,
    public_modulus: Option<Vec<u8>>,
    block_indep_hash: Option<Vec<u8>>,
    block_timestamp: Option<i64>,
    block_previous_block: Option<Vec<u8>>,
    parent_id: Vec<u8>,
}

impl RawRow {
    fn is_item(&self) -> bool {
        self.data_item_id.len() > 1
    }

    fn cursor(&self) -> ItemCursor {
        ItemCursor {
            height: self.height.map(|h| h as u64),
            block_transaction_index: self.block_transaction_index.map(|i| i as u64),
            data_item_id: self.data_item_id.clone(),
            indexed_at: Some(self.indexed_at),
            id: self.id.clone(),
        }
    }
}

/// Ascending comparison over the total order, NULL heights last.
///
/// The descending order is the exact reverse (NULL heights first), so one
/// comparator serves both directions.
fn cmp_rows_asc(a: &RawRow, b: &RawRow) -> Ordering {
    let key = |r: &RawRow| {
        (
            r.height.unwrap_or(i64::MAX),
            r.block_transaction_index.unwrap_or(i64::MAX),
        )
    };
    key(a)
        .cmp(&key(b))
        .then_with(|| a.data_item_id.cmp(&b.data_item_id))
        .then_with(|| a.indexed_at.cmp(&b.indexed_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn cmp_rows(a: &RawRow, b: &RawRow, desc: bool) -> Ordering {
    if desc {
        cmp_rows_asc(b, a)
    } else {
        cmp_rows_asc(a, b)
    }
}

/// Merges two already-sorted row vectors, keeping at most `limit` rows.
fn merge_sorted(a: Vec<RawRow>, b: Vec<RawRow>, desc: bool, limit: usize) -> Vec<RawRow> {
    let mut out = Vec::with_capacity(limit.min(a.len() + b.len()));
    let (mut ai, mut bi) = (0, 0);
    while out.len() < limit && (ai < a.len() || bi < b.len()) {
        let take_a = match (a.get(ai), b.get(bi)) {
            (Some(x), Some(y)) => cmp_rows(x, y, desc) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_a {
            out.push(a[ai].clone());
            ai += 1;
        } else {
            out.push(b[bi].clone());
            bi += 1;
        }
    }
    out
}

// =============================================================================
// Tag Fetch Statements
// =============================================================================

const SELECT_TRANSACTION_TAGS: &str = "\
SELECT name, value FROM (
    SELECT t.transaction_tag_index AS idx, tn.name AS name, tv.value AS value
    FROM new_transaction_tags t
    JOIN tag_names tn ON tn.hash = t.tag_name_hash
    JOIN tag_values tv ON tv.hash = t.tag_value_hash
    WHERE t.transaction_id = ?1
    UNION
    SELECT t.transaction_tag_index, tn.name, tv.value
    FROM stable_transaction_tags t
    JOIN tag_names tn ON tn.hash = t.tag_name_hash
    JOIN tag_values tv ON tv.hash = t.tag_value_hash
    WHERE t.transaction_id = ?1
)
GROUP BY idx
ORDER BY idx";

const SELECT_DATA_ITEM_TAGS: &str = "\
SELECT name, value FROM (
    SELECT t.data_item_tag_index AS idx, tn.name AS name, tv.value AS value
    FROM bundles.new_data_item_tags t
    JOIN bundles.tag_names tn ON tn.hash = t.tag_name_hash
    JOIN bundles.tag_values tv ON tv.hash = t.tag_value_hash
    WHERE t.data_item_id = ?1
    UNION
    SELECT t.data_item_tag_index, tn.name, tv.value
    FROM bundles.stable_data_item_tags t
    JOIN bundles.tag_names tn ON tn.hash = t.tag_name_hash
    JOIN bundles.tag_values tv ON tv.hash = t.tag_value_hash
    WHERE t.data_item_id = ?1
)
GROUP BY idx
ORDER BY idx";

const SELECT_MAX_STABLE_BLOCK_HEIGHT: &str = "SELECT MAX(height) FROM stable_blocks";

const STABLE_BLOCKS_SELECT: &str =
    "SELECT height, indep_hash, block_timestamp, previous_block FROM stable_blocks";

const NEW_BLOCKS_SELECT: &str =
    "SELECT height, indep_hash, block_timestamp, previous_block FROM new_blocks";

const SELECT_NEW_BLOCK_BY_HASH: &str = "\
SELECT height, indep_hash, block_timestamp, previous_block
FROM new_blocks WHERE indep_hash = ?";

const SELECT_STABLE_BLOCK_BY_HASH: &str = "\
SELECT height, indep_hash, block_timestamp, previous_block
FROM stable_blocks WHERE indep_hash = ?";

/// Fixed statements warmed at worker boot. The planner's source queries are
/// assembled per call and cached by SQL text through the same prepared
/// statement cache.
pub const READ_STATEMENTS: &[(&str, &str)] = &[
    ("select_transaction_tags", SELECT_TRANSACTION_TAGS),
    ("select_data_item_tags", SELECT_DATA_ITEM_TAGS),
    (
        "select_max_stable_block_height",
        SELECT_MAX_STABLE_BLOCK_HEIGHT,
    ),
    ("select_new_block_by_hash", SELECT_NEW_BLOCK_BY_HASH),
    ("select_stable_block_by_hash", SELECT_STABLE_BLOCK_BY_HASH),
];

// =============================================================================
// Gql Reader
// =============================================================================

/// A gql worker: read-only core connection with bundles attached, serving
/// the paginated query surface. The gql pool runs many of these in parallel.
pub struct GqlReader {
    conn: Connection,
}

impl GqlReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        let conn = schema::open_core_ro(paths)?;
        schema::warm_statements(&conn, READ_STATEMENTS)?;
        Ok(Self { conn })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// One page of transactions and data items under the shared total order.
    pub fn get_gql_transactions(
        &self,
        query: &GqlTransactionsQuery,
    ) -> Result<Paginated<GqlTransactionNode>> {
        let cursor = match query.cursor.as_deref() {
            Some(c) => Some(ItemCursor::decode(c)?),
            None => None,
        };
        let desc = query.sort_order.is_desc();
        let limit = query.page_size + 1;
        let max_stable = self.max_stable_height()?;

        let mut rows: Vec<RawRow>;
        if desc {
            rows = self.query_family(Family::New, query, cursor.as_ref(), None, limit, max_stable)?;
            if rows.len() < limit {
                // Step the stable bound below the lowest new height so rows
                // living in both families during a flush appear once.
                let adjust = rows.iter().filter_map(|r| r.height).min().map(|h| h - 1);
                let remaining = limit - rows.len();
                let stable = self.query_family(
                    Family::Stable,
                    query,
                    cursor.as_ref(),
                    adjust,
                    remaining,
                    max_stable,
                )?;
                rows.extend(stable);
            }
        } else {
            rows =
                self.query_family(Family::Stable, query, cursor.as_ref(), None, limit, max_stable)?;
            if rows.len() < limit {
                let adjust = rows.iter().filter_map(|r| r.height).max().map(|h| h + 1);
                let remaining = limit - rows.len();
                let new = self.query_family(
                    Family::New,
                    query,
                    cursor.as_ref(),
                    adjust,
                    remaining,
                    max_stable,
                )?;
                rows.extend(new);
            }
        }

        let has_next_page = rows.len() > query.page_size;
        rows.truncate(query.page_size);

        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let cursor = row.cursor().encode();
            let node = self.node_from_row(row)?;
            edges.push(Edge { cursor, node });
        }

        Ok(Paginated {
            page_info: PageInfo { has_next_page },
            edges,
        })
    }

    /// Point lookup across all four sources.
    pub fn get_gql_transaction(&self, id: &str) -> Result<Option<GqlTransactionNode>> {
        let query = GqlTransactionsQuery {
            ids: vec![id.to_string()],
            page_size: 1,
            ..Default::default()
        };
        Ok(self
            .get_gql_transactions(&query)?
            .edges
            .into_iter()
            .next()
            .map(|edge| edge.node))
    }

    /// Queries the new or stable family: transactions, items, or both per the
    /// bundle-membership filter, merged under the total order and clipped.
    fn query_family(
        &self,
        family: Family,
        query: &GqlTransactionsQuery,
        cursor: Option<&ItemCursor>,
        adjust_height: Option<i64>,
        limit: usize,
        max_stable: Option<i64>,
    ) -> Result<Vec<RawRow>> {
        if family == Family::Stable && max_stable.is_none() {
            return Ok(Vec::new());
        }
        // An ascending cursor on the NULL-height plane means every
        // block-linked row was already delivered; only the new family still
        // has rows to give.
        if family == Family::Stable
            && !query.sort_order.is_desc()
            && matches!(cursor, Some(c) if c.height.is_none() && c.indexed_at.is_some())
        {
            return Ok(Vec::new());
        }

        let (txs_source, items_source) = match family {
            Family::Stable => (Source::StableTxs, Source::StableItems),
            Family::New => (Source::NewTxs, Source::NewItems),
        };

        let (query_txs, query_items) = match &query.bundled_in {
            BundledIn::Any => (true, true),
            BundledIn::Standalone => (true, false),
            BundledIn::Parents(_) => (false, true),
        };

        let tx_rows = if query_txs {
            self.query_source(txs_source, query, cursor, adjust_height, limit, max_stable)?
        } else {
            Vec::new()
        };
        let item_rows = if query_items {
            self.query_source(items_source, query, cursor, adjust_height, limit, max_stable)?
        } else {
            Vec::new()
        };

        Ok(merge_sorted(
            tx_rows,
            item_rows,
            query.sort_order.is_desc(),
            limit,
        ))
    }

    /// Builds and runs the SELECT for one source.
    fn query_source(
        &self,
        source: Source,
        query: &GqlTransactionsQuery,
        cursor: Option<&ItemCursor>,
        adjust_height: Option<i64>,
        limit: usize,
        max_stable: Option<i64>,
    ) -> Result<Vec<RawRow>> {
        debug!(source = source.name(), "planning gql source query");

        let alias = source.alias();
        let height = format!("{alias}.height");
        let desc = query.sort_order.is_desc();

        let mut joins = String::new();
        let mut join_params: Vec<Value> = Vec::new();
        let mut wheres: Vec<String> = Vec::new();
        let mut where_params: Vec<Value> = Vec::new();

        // Tag joins: caller's order, low-selectivity names last.
        let mut tags: Vec<&TagFilter> = query.tags.iter().collect();
        tags.sort_by_key(|t| LOW_SELECTIVITY_TAG_NAMES.contains(&t.name.as_str()));
        push_tag_joins(
            source,
            &tags,
            &mut joins,
            &mut join_params,
            &mut wheres,
            &mut where_params,
        );

        // Simple IN filters.
        push_in_filter(
            &mut wheres,
            &mut where_params,
            &format!("{alias}.id"),
            decode_ids(&query.ids)?,
        );
        push_in_filter(
            &mut wheres,
            &mut where_params,
            &format!("{alias}.target"),
            decode_ids(&query.recipients)?,
        );
        push_in_filter(
            &mut wheres,
            &mut where_params,
            &format!("{alias}.owner_address"),
            decode_ids(&query.owners)?,
        );
        if let BundledIn::Parents(parents) = &query.bundled_in {
            if source.is_item() {
                push_in_filter(
                    &mut wheres,
                    &mut where_params,
                    &format!("{alias}.parent_id"),
                    decode_ids(parents)?,
                );
            }
        }

        // Height bounds. The caller's bounds are strict (NULL heights never
        // match); the stable upper bound is clamped to the stable tip.
        if let Some(min) = query.min_height {
            wheres.push(format!("{height} >= ?"));
            where_params.push(Value::from(min as i64));
        }
        if source.is_stable() {
            let mut eff_max = query.max_height.map(|h| h as i64);
            if let (Some(user), Some(stable)) = (eff_max, max_stable) {
                eff_max = Some(user.min(stable));
            }
            if let Some(adjust) = adjust_height {
                eff_max = Some(eff_max.map_or(adjust, |m| m.min(adjust)));
            }
            if let Some(max) = eff_max {
                wheres.push(format!("{height} <= ?"));
                where_params.push(Value::from(max));
            }
        } else {
            if let Some(max) = query.max_height {
                wheres.push(format!("{height} <= ?"));
                where_params.push(Value::from(max as i64));
            }
            if let Some(adjust) = adjust_height {
                // Merge-internal bound: must not drop the NULL-height plane.
                if desc {
                    wheres.push(format!("({height} <= ? OR {height} IS NULL)"));
                } else {
                    wheres.push(format!("({height} >= ? OR {height} IS NULL)"));
                }
                where_params.push(Value::from(adjust));
            }
        }

        // Cursor predicate.
        if let Some(cursor) = cursor {
            push_cursor_predicate(source, cursor, desc, &mut wheres, &mut where_params);
        }

        // Assemble.
        let mut sql = String::from(source.select_from());
        sql.push_str(&joins);
        if !wheres.is_empty() {
            sql.push_str("\nWHERE ");
            sql.push_str(&wheres.join("\n  AND "));
        }
        sql.push_str(&order_clause(source, desc));
        sql.push_str("\nLIMIT ?");

        let mut params: Vec<Value> = join_params;
        params.extend(where_params);
        params.push(Value::from(limit as i64));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), map_raw_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn max_stable_height(&self) -> Result<Option<i64>> {
        let max: Option<i64> = self
            .conn
            .prepare_cached(SELECT_MAX_STABLE_BLOCK_HEIGHT)?
            .query_row([], |row| row.get(0))?;
        Ok(max)
    }

    /// Decodes one projected row into its API node, fetching tags lazily.
    fn node_from_row(&self, row: RawRow) -> Result<GqlTransactionNode> {
        let tags = if row.is_item() {
            self.fetch_tags(SELECT_DATA_ITEM_TAGS, &row.id)?
        } else {
            self.fetch_tags(SELECT_TRANSACTION_TAGS, &row.id)?
        };

        let is_data_item = row.is_item();

        Ok(GqlTransactionNode {
            id: b64_encode(&row.id),
            anchor: row.anchor.as_deref().map(b64_encode).unwrap_or_default(),
            signature: row.signature.as_deref().map(b64_encode).unwrap_or_default(),
            recipient: row.target.as_deref().filter(|t| !t.is_empty()).map(b64_encode),
            owner_address: row
                .owner_address
                .as_deref()
                .map(b64_encode)
                .unwrap_or_default(),
            owner_key: row.public_modulus.as_deref().map(b64_encode),
            fee: row.reward.unwrap_or_else(|| "0".to_string()),
            quantity: row.quantity.unwrap_or_else(|| "0".to_string()),
            data_size: row.data_size.unwrap_or(0) as u64,
            content_type: row.content_type,
            height: row.height.map(|h| h as u64),
            block_transaction_index: row.block_transaction_index.map(|i| i as u64),
            indexed_at: Some(row.indexed_at),
            block: row.block_indep_hash.as_deref().map(|hash| GqlBlockRef {
                indep_hash: b64_encode(hash),
                timestamp: row.block_timestamp.unwrap_or(0),
                previous_block: row
                    .block_previous_block
                    .as_deref()
                    .map(b64_encode)
                    .unwrap_or_default(),
            }),
            parent_id: if row.parent_id.is_empty() {
                None
            } else {
                Some(b64_encode(&row.parent_id))
            },
            is_data_item,
            tags,
        })
    }

    fn fetch_tags(&self, sql: &str, owner_id: &[u8]) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let tags = stmt
            .query_map(params![owner_id], |row| {
                let name: Vec<u8> = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok(Tag {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    value: String::from_utf8_lossy(&value).into_owned(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// One page of blocks ordered by height.
    pub fn get_gql_blocks(&self, query: &GqlBlocksQuery) -> Result<Paginated<GqlBlockNode>> {
        let cursor = match query.cursor.as_deref() {
            Some(c) => Some(BlockCursor::decode(c)?),
            None => None,
        };
        let desc = query.sort_order.is_desc();
        let limit = query.page_size + 1;

        let mut rows: Vec<BlockRow>;
        if desc {
            rows = self.query_blocks(NEW_BLOCKS_SELECT, query, cursor, None, limit)?;
            if rows.len() < limit {
                let adjust = rows.iter().map(|r| r.height).min().map(|h| h - 1);
                let remaining = limit - rows.len();
                let stable =
                    self.query_blocks(STABLE_BLOCKS_SELECT, query, cursor, adjust, remaining)?;
                rows.extend(stable);
            }
        } else {
            rows = self.query_blocks(STABLE_BLOCKS_SELECT, query, cursor, None, limit)?;
            if rows.len() < limit {
                let adjust = rows.iter().map(|r| r.height).max().map(|h| h + 1);
                let remaining = limit - rows.len();
                let new = self.query_blocks(NEW_BLOCKS_SELECT, query, cursor, adjust, remaining)?;
                rows.extend(new);
            }
        }

        let has_next_page = rows.len() > query.page_size;
        rows.truncate(query.page_size);

        let edges = rows
            .into_iter()
            .map(|row| Edge {
                cursor: BlockCursor {
                    height: row.height as u64,
                }
                .encode(),
                node: row.into_node(),
            })
            .collect();

        Ok(Paginated {
            page_info: PageInfo { has_next_page },
            edges,
        })
    }

    /// Point lookup by independent hash, preferring the tip family.
    pub fn get_gql_block(&self, id: &str) -> Result<Option<GqlBlockNode>> {
        let hash = b64_decode(id)?;
        for sql in [SELECT_NEW_BLOCK_BY_HASH, SELECT_STABLE_BLOCK_BY_HASH] {
            let row = self
                .conn
                .prepare_cached(sql)?
                .query_row(params![hash], map_block_row)
                .optional()?;
            if let Some(row) = row {
                return Ok(Some(row.into_node()));
            }
        }
        Ok(None)
    }

    fn query_blocks(
        &self,
        select_from: &str,
        query: &GqlBlocksQuery,
        cursor: Option<BlockCursor>,
        adjust_height: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BlockRow>> {
        let desc = query.sort_order.is_desc();
        let mut wheres: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        push_in_filter(&mut wheres, &mut params, "indep_hash", decode_ids(&query.ids)?);
        if let Some(min) = query.min_height {
            wheres.push("height >= ?".to_string());
            params.push(Value::from(min as i64));
        }
        if let Some(max) = query.max_height {
            wheres.push("height <= ?".to_string());
            params.push(Value::from(max as i64));
        }
        if let Some(adjust) = adjust_height {
            if desc {
                wheres.push("height <= ?".to_string());
            } else {
                wheres.push("height >= ?".to_string());
            }
            params.push(Value::from(adjust));
        }
        if let Some(cursor) = cursor {
            if desc {
                wheres.push("height < ?".to_string());
            } else {
                wheres.push("height > ?".to_string());
            }
            params.push(Value::from(cursor.height as i64));
        }

        let mut sql = String::from(select_from);
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }
        sql.push_str(if desc {
            " ORDER BY height DESC"
        } else {
            " ORDER BY height ASC"
        });
        sql.push_str(" LIMIT ?");
        params.push(Value::from(limit as i64));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), map_block_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// =============================================================================
// SQL Assembly Helpers
// =============================================================================

fn decode_ids(ids: &[String]) -> Result<Vec<Vec<u8>>> {
    ids.iter().map(|id| b64_decode(id)).collect()
}

/// Appends `col IN (?, …)` when the list is non-empty.
fn push_in_filter(
    wheres: &mut Vec<String>,
    params: &mut Vec<Value>,
    col: &str,
    values: Vec<Vec<u8>>,
) {
    if values.is_empty() {
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    wheres.push(format!("{col} IN ({placeholders})"));
    params.extend(values.into_iter().map(Value::from));
}

/// Appends the tag joins for one source.
///
/// Stable sources: the first join equi-joins the ordering columns the row
/// and its tags share; each subsequent join is a `CROSS JOIN` pinned to the
/// owner-id index, correlated to the previous join in WHERE. This keeps the
/// engine on the user-specified join order even when a low-selectivity tag
/// would otherwise tempt it into a pathological plan. New sources correlate
/// every join on the owner id directly.
fn push_tag_joins(
    source: Source,
    tags: &[&TagFilter],
    joins: &mut String,
    join_params: &mut Vec<Value>,
    wheres: &mut Vec<String>,
    where_params: &mut Vec<Value>,
) {
    let alias = source.alias();
    let table = source.tag_table();
    let owner_col = source.tag_owner_col();

    for (i, tag) in tags.iter().enumerate() {
        let t = format!("t{i}");
        let name_hash = tag_hash(tag.name.as_bytes()).to_vec();
        let value_hashes: Vec<Vec<u8>> = tag
            .values
            .iter()
            .map(|v| tag_hash(v.as_bytes()).to_vec())
            .collect();
        // An empty value list constrains the name only.
        let value_clause = |t: &str| {
            if value_hashes.is_empty() {
                String::new()
            } else {
                let placeholders = vec!["?"; value_hashes.len()].join(", ");
                format!(" AND {t}.tag_value_hash IN ({placeholders})")
            }
        };

        if source.is_stable() && i > 0 {
            let hint = source.tag_index_hint();
            let prev = format!("t{}", i - 1);
            joins.push_str(&format!("\nCROSS JOIN {table} {t} INDEXED BY {hint}"));
            wheres.push(format!("{t}.{owner_col} = {prev}.{owner_col}"));
            wheres.push(format!("{t}.tag_name_hash = ?{}", value_clause(&t)));
            where_params.push(Value::from(name_hash));
            where_params.extend(value_hashes.into_iter().map(Value::from));
        } else {
            let correlation = if source.is_stable() {
                let mut on = format!(
                    "{t}.height = {alias}.height AND {t}.block_transaction_index = {alias}.block_transaction_index"
                );
                if source.is_item() {
                    on.push_str(&format!(" AND {t}.{owner_col} = {alias}.id"));
                }
                on
            } else {
                format!("{t}.{owner_col} = {alias}.id")
            };
            joins.push_str(&format!(
                "\nJOIN {table} {t} ON {correlation} AND {t}.tag_name_hash = ?{}",
                value_clause(&t)
            ));
            join_params.push(Value::from(name_hash));
            join_params.extend(value_hashes.into_iter().map(Value::from));
        }
    }
}

/// Appends the cursor predicate for one source.
///
/// Two planes: a cursor carrying a height resumes inside the block-linked
/// order via a strict lexicographic comparison over
/// `(height, block_transaction_index, data_item_id)`; a cursor with NULL
/// height resumes inside the ingestion-order plane via `(indexed_at, id)`.
fn push_cursor_predicate(
    source: Source,
    cursor: &ItemCursor,
    desc: bool,
    wheres: &mut Vec<String>,
    where_params: &mut Vec<Value>,
) {
    let alias = source.alias();
    let h = format!("{alias}.height");
    let bti = source.bti_expr();
    let d = source.item_id_expr();
    let ia = format!("{alias}.indexed_at");
    let id = format!("{alias}.id");

    match (cursor.height, cursor.indexed_at) {
        (None, Some(indexed_at)) => {
            if source.is_stable() {
                // Descending: the NULL plane precedes every stable row, so
                // stable is unaffected. Ascending: handled by skipping the
                // stable family entirely.
                return;
            }
            if desc {
                // Rest of the NULL plane, then every block-linked row.
                wheres.push(format!(
                    "({h} IS NOT NULL OR {ia} < ? OR ({ia} = ? AND {id} < ?))"
                ));
            } else {
                wheres.push(format!(
                    "({h} IS NULL AND ({ia} > ? OR ({ia} = ? AND {id} > ?)))"
                ));
            }
            where_params.push(Value::from(indexed_at));
            where_params.push(Value::from(indexed_at));
            where_params.push(Value::from(cursor.id.clone()));
        }
        (Some(height), _) => {
            let height = height as i64;
            let index = cursor.block_transaction_index.unwrap_or(0) as i64;
            let op = if desc { "<" } else { ">" };
            let mut predicate = format!(
                "({h} {op} ? OR ({h} = ? AND {bti} {op} ?) OR ({h} = ? AND {bti} = ? AND {d} {op} ?))"
            );
            if !desc && !source.is_stable() {
                // Ascending: the NULL plane still follows the linked rows.
                predicate = format!("({predicate} OR {h} IS NULL)");
            }
            wheres.push(predicate);
            where_params.push(Value::from(height));
            where_params.push(Value::from(height));
            where_params.push(Value::from(index));
            where_params.push(Value::from(height));
            where_params.push(Value::from(index));
            where_params.push(Value::from(cursor.data_item_id.clone()));
        }
        (None, None) => {}
    }
}

/// ORDER BY mirroring the cursor tuple, NULLS FIRST descending / NULLS LAST
/// ascending.
fn order_clause(source: Source, desc: bool) -> String {
    let alias = source.alias();
    let h = format!("{alias}.height");
    let bti = source.bti_expr();
    let d = source.item_id_expr();
    let (dir, nulls) = if desc {
        ("DESC", "NULLS FIRST")
    } else {
        ("ASC", "NULLS LAST")
    };
    format!(
        "\nORDER BY {h} {dir} {nulls}, {bti} {dir} {nulls}, {d} {dir}, {alias}.indexed_at {dir}, {alias}.id {dir}"
    )
}

fn map_raw_row(row: &rusqlite::Row<'_>) -> std::result::Result<RawRow, rusqlite::Error> {
    Ok(RawRow {
        height: row.get(0)?,
        block_transaction_index: row.get(1)?,
        data_item_id: row.get(2)?,
        indexed_at: row.get(3)?,
        id: row.get(4)?,
        anchor: row.get(5)?,
        signature: row.get(6)?,
        target: row.get(7)?,
        reward: row.get(8)?,
        quantity: row.get(9)?,
        data_size: row.get(10)?,
        content_type: row.get(11)?,
        owner_address: row.get(12)?,
        public_modulus: row.get(13)?,
        block_indep_hash: row.get(14)?,
        block_timestamp: row.get(15)?,
        block_previous_block: row.get(16)?,
        parent_id: row.get(17)?,
    })
}

// =============================================================================
// Block Rows
// =============================================================================

#[derive(Debug, Clone)]
struct BlockRow {
    height: i64,
    indep_hash: Vec<u8>,
    block_timestamp: i64,
    previous_block: Option<Vec<u8>>,
}

impl BlockRow {
    fn into_node(self) -> GqlBlockNode {
        GqlBlockNode {
            id: b64_encode(&self.indep_hash),
            height: self.height as u64,
            timestamp: self.block_timestamp,
            previous: self
                .previous_block
                .as_deref()
                .map(b64_encode)
                .unwrap_or_default(),
        }
    }
}

fn map_block_row(row: &rusqlite::Row<'_>) -> std::result::Result<BlockRow, rusqlite::Error> {
    Ok(BlockRow {
        height: row.get(0)?,
        indep_hash: row.get(1)?,
        block_timestamp: row.get(2)?,
        previous_block: row.get(3)?,
    })
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the gql readers.
pub enum GqlReadJob {
    GetGqlTransactions {
        query: Box<GqlTransactionsQuery>,
        reply: oneshot::Sender<Result<Paginated<GqlTransactionNode>>>,
    },
    GetGqlTransaction {
        id: String,
        reply: oneshot::Sender<Result<Option<GqlTransactionNode>>>,
    },
    GetGqlBlocks {
        query: Box<GqlBlocksQuery>,
        reply: oneshot::Sender<Result<Paginated<GqlBlockNode>>>,
    },
    GetGqlBlock {
        id: String,
        reply: oneshot::Sender<Result<Option<GqlBlockNode>>>,
    },
}

impl PoolWorker for GqlReader {
    type Job = GqlReadJob;

    fn handle(&mut self, job: GqlReadJob) -> JobOutcome {
        match job {
            GqlReadJob::GetGqlTransactions { query, reply } => {
                respond(reply, self.get_gql_transactions(&query))
            }
            GqlReadJob::GetGqlTransaction { id, reply } => {
                respond(reply, self.get_gql_transaction(&id))
            }
            GqlReadJob::GetGqlBlocks { query, reply } => respond(reply, self.get_gql_blocks(&query)),
            GqlReadJob::GetGqlBlock { id, reply } => respond(reply, self.get_gql_block(&id)),
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
    use crate::test_support::{block_at, test_id, tx_with_tags, TestStores};
    use crate::types::SortOrder;

    /// Ingests heights 1..=n, one tagged transaction per block, and promotes
    /// everything with a tiny fork depth so the rows land in stable.
    fn seed_stable_txs(stores: &TestStores, n: u64) -> Vec<String> {
        let mut writer = ChainIndexWriter::open(&stores.paths, 1).unwrap();
        let mut ids = Vec::new();
        for h in 1..=n {
            let tx = tx_with_tags(&format!("tx-{h}"), &[("App-Name", "Foo")]);
            ids.push(tx.id.clone());
            writer
                .save_block_and_txs(&block_at(h, &[&tx.id]), &[tx], &[])
                .unwrap();
        }
        // Flush heights up to n-1 into stable.
        let flush_h = n.next_multiple_of(5);
        for h in (n + 1)..=flush_h {
            writer.save_block_and_txs(&block_at(h, &[]), &[], &[]).unwrap();
        }
        ids
    }

    #[test]
    fn test_desc_paging_is_complete_and_ordered() {
        let stores = TestStores::new();
        seed_stable_txs(&stores, 7);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let mut heights = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = reader
                .get_gql_transactions(&GqlTransactionsQuery {
                    page_size: 3,
                    cursor: cursor.clone(),
                    sort_order: SortOrder::HeightDesc,
                    ..Default::default()
                })
                .unwrap();
            for edge in &page.edges {
                heights.push(edge.node.height.unwrap());
            }
            if !page.page_info.has_next_page {
                break;
            }
            cursor = page.edges.last().map(|e| e.cursor.clone());
        }

        assert_eq!(heights, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_asc_paging_is_complete_and_ordered() {
        let stores = TestStores::new();
        seed_stable_txs(&stores, 6);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let mut heights = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = reader
                .get_gql_transactions(&GqlTransactionsQuery {
                    page_size: 4,
                    cursor: cursor.clone(),
                    sort_order: SortOrder::HeightAsc,
                    ..Default::default()
                })
                .unwrap();
            for edge in &page.edges {
                heights.push(edge.node.height.unwrap());
            }
            if !page.page_info.has_next_page {
                break;
            }
            cursor = page.edges.last().map(|e| e.cursor.clone());
        }

        assert_eq!(heights, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_invalid_cursor_is_rejected() {
        let stores = TestStores::new();
        let reader = GqlReader::open(&stores.paths).unwrap();
        let result = reader.get_gql_transactions(&GqlTransactionsQuery {
            cursor: Some("!!not-a-cursor!!".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            result,
            Err(crate::error::Error::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_tag_filter_matches_by_value_hash() {
        let stores = TestStores::new();
        seed_stable_txs(&stores, 3);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let hit = reader
            .get_gql_transactions(&GqlTransactionsQuery {
                tags: vec![TagFilter {
                    name: "App-Name".to_string(),
                    values: vec!["Foo".to_string()],
                }],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hit.edges.len(), 3);

        let miss = reader
            .get_gql_transactions(&GqlTransactionsQuery {
                tags: vec![TagFilter {
                    name: "App-Name".to_string(),
                    values: vec!["Bar".to_string()],
                }],
                ..Default::default()
            })
            .unwrap();
        assert!(miss.edges.is_empty());
    }

    #[test]
    fn test_two_tag_constraints_return_row_once() {
        let stores = TestStores::new();
        let mut writer = ChainIndexWriter::open(&stores.paths, 1).unwrap();
        let tx = tx_with_tags(
            "multi-tag",
            &[("Content-Type", "text/plain"), ("App-Name", "Foo")],
        );
        writer
            .save_block_and_txs(&block_at(1, &[&tx.id]), &[tx.clone()], &[])
            .unwrap();

        let reader = GqlReader::open(&stores.paths).unwrap();
        let page = reader
            .get_gql_transactions(&GqlTransactionsQuery {
                tags: vec![
                    TagFilter {
                        name: "App-Name".to_string(),
                        values: vec!["Foo".to_string()],
                    },
                    TagFilter {
                        name: "Content-Type".to_string(),
                        values: vec!["text/plain".to_string()],
                    },
                ],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.edges.len(), 1);
        assert_eq!(page.edges[0].node.id, tx.id);
        assert_eq!(page.edges[0].node.tags.len(), 2);
    }

    #[test]
    fn test_ids_and_owner_filters() {
        let stores = TestStores::new();
        let ids = seed_stable_txs(&stores, 4);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let page = reader
            .get_gql_transactions(&GqlTransactionsQuery {
                ids: vec![ids[1].clone()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.edges.len(), 1);
        assert_eq!(page.edges[0].node.id, ids[1]);

        let node = reader.get_gql_transaction(&ids[2]).unwrap().unwrap();
        assert_eq!(node.id, ids[2]);
        assert!(reader
            .get_gql_transaction(&test_id("missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_height_bounds() {
        let stores = TestStores::new();
        seed_stable_txs(&stores, 6);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let page = reader
            .get_gql_transactions(&GqlTransactionsQuery {
                min_height: Some(3),
                max_height: Some(5),
                sort_order: SortOrder::HeightAsc,
                ..Default::default()
            })
            .unwrap();
        let heights: Vec<u64> = page.edges.iter().map(|e| e.node.height.unwrap()).collect();
        assert_eq!(heights, vec![3, 4, 5]);
    }

    #[test]
    fn test_blocks_paging() {
        let stores = TestStores::new();
        seed_stable_txs(&stores, 6);
        let reader = GqlReader::open(&stores.paths).unwrap();

        let page1 = reader
            .get_gql_blocks(&GqlBlocksQuery {
                page_size: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page1.edges.len(), 4);
        assert!(page1.page_info.has_next_page);
        let first_heights: Vec<u64> = page1.edges.iter().map(|e| e.node.height).collect();
        assert!(first_heights.windows(2).all(|w| w[0] > w[1]));

        let page2 = reader
            .get_gql_blocks(&GqlBlocksQuery {
                page_size: 100,
                cursor: Some(page1.edges.last().unwrap().cursor.clone()),
                ..Default::default()
            })
            .unwrap();
        assert!(!page2.page_info.has_next_page);
        // No overlap, no gap.
        let all: Vec<u64> = first_heights
            .iter()
            .copied()
            .chain(page2.edges.iter().map(|e| e.node.height))
            .collect();
        let mut sorted = all.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();
        assert_eq!(all, sorted);

        // Point lookup.
        let block = reader.get_gql_block(&page1.edges[0].node.id).unwrap().unwrap();
        assert_eq!(block.height, page1.edges[0].node.height);
    }
}
