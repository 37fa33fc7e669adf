//! # Domain Types for chaindex
//!
//! This module defines the types flowing through the indexing core: chain
//! blocks and transactions on their way in, bundled data items, bundle
//! lifecycle records, the content-data index records, and the paginated query
//! surface on the way out.
//!
//! ## Identifier Convention
//!
//! Every id field on these types (`id`, `indep_hash`, `parent_id`, owner keys,
//! data roots, …) is the wire form: URL-safe base64 without padding. The store
//! workers decode to raw bytes exactly once at the SQL binding boundary and
//! re-encode on the way out (see [`crate::encoding`]). `quantity`, `reward`,
//! and `reward_pool` exceed the signed 64-bit range and travel as decimal
//! strings end to end.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in seconds; `indexed_at` and the lifecycle stamps use it.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

// =============================================================================
// Constants
// =============================================================================

/// Default maximum depth at which the chain may reorganize.
///
/// Content deeper than this below the tip is promoted to the `stable_*`
/// tables and never rewound.
pub const DEFAULT_MAX_FORK_DEPTH: u64 = 50;

/// Stable promotion runs when `block.height % STABLE_FLUSH_INTERVAL == 0`.
pub const STABLE_FLUSH_INTERVAL: u64 = 5;

/// Grace window before unlinked `new_transactions` rows are garbage collected.
pub const NEW_TX_CLEANUP_WAIT: Duration = Duration::from_secs(2 * 60 * 60);

/// Grace window before unlinked `new_data_items` rows are garbage collected.
pub const NEW_DATA_ITEM_CLEANUP_WAIT: Duration = Duration::from_secs(2 * 60 * 60);

/// A bundle queued or skipped longer ago than this without being unbundled is
/// considered failed and eligible for reprocessing.
pub const BUNDLE_REPROCESS_WAIT: Duration = Duration::from_secs(4 * 60 * 60);

/// Debug health warns when no bundle has been fully indexed for this long.
pub const STALE_INDEX_WARNING_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Tag names that match enormous result sets.
///
/// The planner orders these joins last so the selective tags cut the candidate
/// set first.
pub const LOW_SELECTIVITY_TAG_NAMES: [&str; 2] = ["App-Name", "Content-Type"];

/// Upper bound on the gql reader pool size.
pub const MAX_WORKER_COUNT: usize = 12;

/// A worker that accumulates more than this many job errors exits and is
/// rebuilt with fresh connections.
pub const MAX_WORKER_ERRORS: usize = 100;

// =============================================================================
// Tags
// =============================================================================

/// A transaction or data-item tag.
///
/// `name` and `value` are UTF-8 literals here; the stores key them by the
/// SHA-1 of their raw bytes and keep each literal once in the `tag_names` /
/// `tag_values` dimension tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Extracts the content type from a tag list (case-insensitive name match).
pub fn content_type_from_tags(tags: &[Tag]) -> Option<String> {
    tags.iter()
        .find(|t| t.name.eq_ignore_ascii_case("Content-Type"))
        .map(|t| t.value.clone())
}

// =============================================================================
// Blocks
// =============================================================================

/// A chain block header as delivered by the upstream poller.
///
/// `txs` lists every transaction id the block carries, fetched or not; the
/// ingestion path records the fetched subset as rows and the rest as
/// `missing_transactions` placeholders.
#[derive(Debug, Clone, Default)]
pub struct BlockHeader {
    pub indep_hash: String,
    pub height: u64,
    pub previous_block: String,
    pub nonce: String,
    /// Mining hash (distinct from the independent hash).
    pub hash: String,
    /// Unix seconds.
    pub block_timestamp: i64,
    pub diff: String,
    pub cumulative_diff: String,
    pub last_retarget: i64,
    /// Empty when the reward is unclaimed.
    pub reward_addr: String,
    pub reward_pool: String,
    pub block_size: u64,
    pub weave_size: u64,
    /// Current USD↔token rate as (dividend, divisor).
    pub usd_to_ar_rate: Option<(String, String)>,
    /// Scheduled USD↔token rate as (dividend, divisor).
    pub scheduled_usd_to_ar_rate: Option<(String, String)>,
    pub hash_list_merkle: String,
    pub wallet_list: String,
    pub tx_root: String,
    /// All transaction ids carried by this block, in block order.
    pub txs: Vec<String>,
}

// =============================================================================
// Transactions
// =============================================================================

/// A chain transaction as delivered by the upstream poller.
#[derive(Debug, Clone, Default)]
pub struct TxRecord {
    pub id: String,
    pub signature: String,
    pub format: u32,
    /// The last-tx anchor.
    pub last_tx: String,
    /// The owner's public modulus; the wallet address is derived from it.
    pub owner: String,
    pub target: String,
    /// Decimal string; exceeds the signed 64-bit range.
    pub quantity: String,
    /// Decimal string; exceeds the signed 64-bit range.
    pub reward: String,
    pub data_size: u64,
    pub data_root: String,
    pub tags: Vec<Tag>,
}

// =============================================================================
// Data Items
// =============================================================================

/// A bundled sub-transaction as delivered by the unbundler.
#[derive(Debug, Clone, Default)]
pub struct DataItemRecord {
    pub id: String,
    /// Enclosing bundle transaction or enclosing data item.
    pub parent_id: String,
    /// The outermost on-chain transaction carrying this item.
    pub root_transaction_id: String,
    pub signature: String,
    pub anchor: String,
    /// The owner's public modulus.
    pub owner: String,
    pub target: String,
    /// Byte offset of the item's payload within its parent.
    pub data_offset: u64,
    pub data_size: u64,
    pub tags: Vec<Tag>,
    /// Opaque selector string under which the item was indexed.
    pub filter: Option<String>,
}

// =============================================================================
// Bundles
// =============================================================================

/// Lifecycle record for a bundle transaction.
///
/// Timestamps are unix seconds; each stays `None` until the corresponding
/// stage happens. A re-queued bundle overwrites `queued_at` and clears nothing
/// else; filter changes clear the stamps via
/// `update_bundles_for_filter_change`.
#[derive(Debug, Clone, Default)]
pub struct BundleRecord {
    pub id: String,
    pub root_transaction_id: String,
    /// Bundle framing format name (e.g. `"binary"`); normalized into the
    /// `bundle_formats` dimension table.
    pub format: String,
    pub unbundle_filter: Option<String>,
    pub index_filter: Option<String>,
    pub data_item_count: Option<u64>,
    pub matched_data_item_count: Option<u64>,
    pub queued_at: Option<i64>,
    pub skipped_at: Option<i64>,
    pub unbundled_at: Option<i64>,
    pub fully_indexed_at: Option<i64>,
}

// =============================================================================
// Content-Data Index
// =============================================================================

/// Input to `save_data_content_attributes`.
#[derive(Debug, Clone, Default)]
pub struct DataContentAttributes {
    pub id: String,
    pub data_root: Option<String>,
    /// Canonical content hash the id resolves to.
    pub hash: String,
    pub data_size: u64,
    pub content_type: Option<String>,
    /// Set when the payload entered the local cache.
    pub cached_at: Option<i64>,
}

/// Verifiable attributes of a canonical content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAttributes {
    pub hash: String,
    pub data_size: u64,
    pub content_type: Option<String>,
    pub cached_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

/// A sub-range of a parent payload that carries a nested id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataParent {
    pub parent_id: String,
    pub data_offset: u64,
    pub data_size: u64,
}

// =============================================================================
// Moderation
// =============================================================================

/// Input to `block_data`: block an id, a content hash, or both.
#[derive(Debug, Clone, Default)]
pub struct BlockDataInput {
    pub id: Option<String>,
    pub hash: Option<String>,
    /// Human-readable source of the block decision, recorded for audit.
    pub source: Option<String>,
    pub notes: Option<String>,
}

// =============================================================================
// Query Surface
// =============================================================================

/// Sort direction over the `(height, block_transaction_index, data_item_id,
/// indexed_at, id)` total order.
///
/// Rows not yet linked to a block (`height IS NULL`) sort first in descending
/// order and last in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    HeightDesc,
    HeightAsc,
}

impl SortOrder {
    pub fn is_desc(self) -> bool {
        matches!(self, SortOrder::HeightDesc)
    }
}

/// One tag constraint: the row must carry a tag named `name` whose value is
/// any of `values` (matched by SHA-1 of the raw value bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

/// The bundle-membership filter, which also decides which sources the planner
/// unions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BundledIn {
    /// No constraint: bare transactions and data items both match.
    #[default]
    Any,
    /// Only bare transactions (rows with no enclosing bundle).
    Standalone,
    /// Only data items whose parent is one of these ids.
    Parents(Vec<String>),
}

/// Parameters of `get_gql_transactions`.
#[derive(Debug, Clone)]
pub struct GqlTransactionsQuery {
    pub page_size: usize,
    pub cursor: Option<String>,
    pub sort_order: SortOrder,
    pub ids: Vec<String>,
    pub recipients: Vec<String>,
    pub owners: Vec<String>,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    pub bundled_in: BundledIn,
    pub tags: Vec<TagFilter>,
}

impl Default for GqlTransactionsQuery {
    fn default() -> Self {
        Self {
            page_size: 10,
            cursor: None,
            sort_order: SortOrder::HeightDesc,
            ids: Vec::new(),
            recipients: Vec::new(),
            owners: Vec::new(),
            min_height: None,
            max_height: None,
            bundled_in: BundledIn::Any,
            tags: Vec::new(),
        }
    }
}

/// Parameters of `get_gql_blocks`.
#[derive(Debug, Clone)]
pub struct GqlBlocksQuery {
    pub page_size: usize,
    pub cursor: Option<String>,
    pub sort_order: SortOrder,
    pub ids: Vec<String>,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
}

impl Default for GqlBlocksQuery {
    fn default() -> Self {
        Self {
            page_size: 10,
            cursor: None,
            sort_order: SortOrder::HeightDesc,
            ids: Vec::new(),
            min_height: None,
            max_height: None,
        }
    }
}

/// Block fields embedded in a transaction node; absent until the row is
/// linked to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GqlBlockRef {
    pub indep_hash: String,
    pub timestamp: i64,
    pub previous_block: String,
}

/// A transaction or data item in query results.
///
/// Bare transactions and bundled data items share this shape: a data item
/// reports its enclosing bundle in `parent_id`, carries `'0'` fee and
/// quantity, and sets `is_data_item`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GqlTransactionNode {
    pub id: String,
    pub anchor: String,
    pub signature: String,
    pub recipient: Option<String>,
    pub owner_address: String,
    /// The owner's public modulus, when the wallet is known.
    pub owner_key: Option<String>,
    pub fee: String,
    pub quantity: String,
    pub data_size: u64,
    pub content_type: Option<String>,
    pub height: Option<u64>,
    pub block_transaction_index: Option<u64>,
    pub indexed_at: Option<i64>,
    pub block: Option<GqlBlockRef>,
    pub parent_id: Option<String>,
    pub is_data_item: bool,
    pub tags: Vec<Tag>,
}

/// A block in query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GqlBlockNode {
    pub id: String,
    pub height: u64,
    pub timestamp: i64,
    pub previous: String,
}

/// One page entry: the node plus the cursor resuming after it.
#[derive(Debug, Clone)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
}

/// A page of results.
#[derive(Debug, Clone)]
pub struct Paginated<T> {
    pub page_info: PageInfo,
    pub edges: Vec<Edge<T>>,
}

impl<T> Paginated<T> {
    pub fn empty() -> Self {
        Self {
            page_info: PageInfo {
                has_next_page: false,
            },
            edges: Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_from_tags() {
        let tags = vec![
            Tag::new("App-Name", "Foo"),
            Tag::new("content-type", "text/plain"),
        ];
        assert_eq!(
            content_type_from_tags(&tags),
            Some("text/plain".to_string())
        );
        assert_eq!(content_type_from_tags(&[Tag::new("App-Name", "Foo")]), None);
    }

    #[test]
    fn test_bundled_in_default_is_any() {
        assert_eq!(BundledIn::default(), BundledIn::Any);
    }

    #[test]
    fn test_sort_order() {
        assert!(SortOrder::HeightDesc.is_desc());
        assert!(!SortOrder::HeightAsc.is_desc());
        assert_eq!(SortOrder::default(), SortOrder::HeightDesc);
    }

    #[test]
    fn test_query_defaults() {
        let q = GqlTransactionsQuery::default();
        assert_eq!(q.page_size, 10);
        assert!(q.cursor.is_none());
        assert_eq!(q.bundled_in, BundledIn::Any);
        assert!(q.tags.is_empty());
    }
}
