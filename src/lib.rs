//! # chaindex — Gateway Indexing and Query Core
//!
//! chaindex is the indexing heart of a gateway for a content-addressed,
//! block-structured, append-only data network. It ingests blocks,
//! transactions, and bundled sub-transactions ("data items") into four
//! SQLite stores, reconciles the fork-prone tip of the chain with a stable
//! prefix, and answers cursor-paginated tag queries that unify transactions
//! and data items into one sorted stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Async Facade (ChainDb)                      │
//! │   save_block_and_txs · save_data_item · get_gql_transactions …  │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ bounded FIFO queues, oneshot replies
//!        ┌───────────┬───────────┼────────────┬─────────────┐
//!        ▼           ▼           ▼            ▼             ▼
//!   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌──────────┐ ┌────────────┐
//!   │  core   │ │ bundles │ │  data   │ │moderation│ │ gql, debug │
//!   │ 1R / 1W │ │ 1R / 1W │ │ 2R / 1W │ │ 1R / 1W  │ │ NR, 1R / — │
//!   └────┬────┘ └────┬────┘ └────┬────┘ └────┬─────┘ └─────┬──────┘
//!        ▼           ▼           ▼           ▼             ▼
//!    core.db ◄──► bundles.db   data.db  moderation.db  core ⋈ bundles
//!      (ATTACHed to each other for cross-store joins)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Ingestion idempotence**: every write is INSERT OR IGNORE or an
//!    upsert; replaying any input converges on the same state.
//! 2. **Fork-depth safety**: nothing enters a `stable_*` table until it sits
//!    at least `max_fork_depth` below the tip; stable rows are never rewound.
//! 3. **Writer serialization**: each store has at most one writer thread;
//!    readers parallelize under the stores' WAL snapshots.
//! 4. **Stable pagination**: query cursors encode the total order
//!    `(height, block_transaction_index, data_item_id, indexed_at, id)`;
//!    a page walk with returned cursors covers every row once.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum and `Result` alias
//! - [`encoding`]: URL-safe base64, tag/owner digests, cursor codecs
//! - [`types`]: domain types and tuning constants
//! - [`schema`]: store DDL, PRAGMAs, connections, statement warming
//! - [`pool`]: the generic reader/writer worker pool
//! - [`chain_index`]: core-store ingestion, stable promotion, fork rollback
//! - [`bundle_index`]: data-item ingestion and bundle lifecycle
//! - [`data_index`]: content-hash and nested-data index
//! - [`moderation`]: id/hash blocklists
//! - [`planner`]: the cursor-paginated, tag-filtered query planner
//! - [`data_stream`]: the streaming transaction-data assembler
//! - [`breaker`]: circuit breakers for the hot data-index reads
//! - [`debug_info`]: per-store statistics and invariant findings
//! - [`db`]: the `ChainDb` facade owning the pools

pub mod breaker;
pub mod bundle_index;
pub mod chain_index;
pub mod data_index;
pub mod data_stream;
pub mod db;
pub mod debug_info;
pub mod encoding;
pub mod error;
pub mod moderation;
pub mod planner;
pub mod pool;
pub mod schema;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use db::{ChainDb, ChainDbConfig};
pub use error::{Error, Result};
pub use schema::StorePaths;

pub use breaker::BreakerConfig;
pub use data_stream::{
    get_tx_data, CachingChunkSource, ChainSource, ChunkSource, TxData, TxDataStream,
};
pub use debug_info::DebugInfo;
pub use types::{
    BlockDataInput, BlockHeader, BundleRecord, BundledIn, DataAttributes, DataContentAttributes,
    DataItemRecord, DataParent, Edge, GqlBlockNode, GqlBlocksQuery, GqlTransactionNode,
    GqlTransactionsQuery, PageInfo, Paginated, SortOrder, Tag, TagFilter, TxRecord,
};
