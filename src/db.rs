//! # ChainDb — the Async Facade
//!
//! The entry point of the crate. `ChainDb` owns the four store files and the
//! six worker pools over them, and exposes every indexing and query
//! capability as an async method:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            ChainDb                                │
//! └──┬─────────┬──────────┬──────────────┬───────────┬───────────────┘
//!    │         │          │              │           │
//!  core      bundles     data        moderation   gql + debug
//!  1R/1W     1R/1W      2R/1W         1R/1W       NR/—   1R/—
//!    │         │          │              │           │
//!  core.db  bundles.db  data.db    moderation.db  core.db ⋈ bundles.db
//! ```
//!
//! Write methods serialize on their store's single writer; read methods run
//! on parallel readers that rely on the stores' WAL snapshots. Submission
//! queues are bounded: callers see [`crate::error::Error::QueueFull`] under
//! sustained backpressure instead of unbounded buffering.
//!
//! The two hot data-index reads are wrapped in circuit breakers and return
//! bare `Option`s — `None` means "unknown" (including an open breaker), and
//! callers must not read it as "absent".

use std::thread::available_parallelism;

use tracing::info;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::bundle_index::{
    BundleIndexReader, BundleIndexWriter, BundlesReadJob, BundlesWriteJob,
};
use crate::chain_index::{ChainIndexReader, ChainIndexWriter, CoreReadJob, CoreWriteJob};
use crate::data_index::{DataIndexReader, DataIndexWriter, DataReadJob, DataWriteJob};
use crate::debug_info::{DebugInfo, DebugReadJob, DebugReader};
use crate::error::Result;
use crate::moderation::{ModerationReadJob, ModerationReader, ModerationWriteJob, ModerationWriter};
use crate::planner::{GqlReadJob, GqlReader};
use crate::pool::Pool;
use crate::schema::{self, StorePaths};
use crate::types::{
    BlockDataInput, BlockHeader, BundleRecord, DataAttributes, DataContentAttributes,
    DataItemRecord, DataParent, GqlBlockNode, GqlBlocksQuery, GqlTransactionNode,
    GqlTransactionsQuery, Paginated, TxRecord, DEFAULT_MAX_FORK_DEPTH, MAX_WORKER_COUNT,
};

// =============================================================================
// Configuration
// =============================================================================

/// Default bound on every pool's submission queue.
const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Construction parameters for [`ChainDb`].
#[derive(Debug, Clone)]
pub struct ChainDbConfig {
    pub paths: StorePaths,
    /// Depth below the tip at which content becomes stable.
    pub max_fork_depth: u64,
    /// Bound on each pool's submission queue.
    pub queue_depth: usize,
    /// Gql reader count; defaults to `min(host cpus, 12)`.
    pub gql_readers: Option<usize>,
    /// Tuning for the data-index circuit breakers.
    pub breaker: BreakerConfig,
}

impl ChainDbConfig {
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            max_fork_depth: DEFAULT_MAX_FORK_DEPTH,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            gql_readers: None,
            breaker: BreakerConfig::default(),
        }
    }
}

// =============================================================================
// ChainDb
// =============================================================================

/// The indexing and query core. See the module docs for the pool layout.
pub struct ChainDb {
    core_write: Pool<CoreWriteJob>,
    core_read: Pool<CoreReadJob>,
    bundles_write: Pool<BundlesWriteJob>,
    bundles_read: Pool<BundlesReadJob>,
    data_write: Pool<DataWriteJob>,
    data_read: Pool<DataReadJob>,
    moderation_write: Pool<ModerationWriteJob>,
    moderation_read: Pool<ModerationReadJob>,
    gql_read: Pool<GqlReadJob>,
    debug_read: Pool<DebugReadJob>,
    attributes_breaker: CircuitBreaker,
    parent_breaker: CircuitBreaker,
}

impl ChainDb {
    /// Initializes the four stores and spawns the worker pools.
    pub fn open(config: ChainDbConfig) -> Result<Self> {
        schema::init_all(&config.paths)?;

        let qd = config.queue_depth;
        let paths = config.paths.clone();
        let fork_depth = config.max_fork_depth;

        let core_write = {
            let paths = paths.clone();
            Pool::spawn("core", "write", 1, qd, move || {
                ChainIndexWriter::open(&paths, fork_depth)
            })?
        };
        let core_read = {
            let paths = paths.clone();
            Pool::spawn("core", "read", 1, qd, move || ChainIndexReader::open(&paths))?
        };
        let bundles_write = {
            let paths = paths.clone();
            Pool::spawn("bundles", "write", 1, qd, move || {
                BundleIndexWriter::open(&paths)
            })?
        };
        let bundles_read = {
            let paths = paths.clone();
            Pool::spawn("bundles", "read", 1, qd, move || {
                BundleIndexReader::open(&paths)
            })?
        };
        let data_write = {
            let paths = paths.clone();
            Pool::spawn("data", "write", 1, qd, move || DataIndexWriter::open(&paths))?
        };
        let data_read = {
            let paths = paths.clone();
            Pool::spawn("data", "read", 2, qd, move || DataIndexReader::open(&paths))?
        };
        let moderation_write = {
            let paths = paths.clone();
            Pool::spawn("moderation", "write", 1, qd, move || {
                ModerationWriter::open(&paths)
            })?
        };
        let moderation_read = {
            let paths = paths.clone();
            Pool::spawn("moderation", "read", 1, qd, move || {
                ModerationReader::open(&paths)
            })?
        };

        let gql_count = config.gql_readers.unwrap_or_else(|| {
            available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_WORKER_COUNT)
        });
        let gql_read = {
            let paths = paths.clone();
            Pool::spawn("gql", "read", gql_count.max(1), qd, move || {
                GqlReader::open(&paths)
            })?
        };
        let debug_read = {
            let paths = paths.clone();
            Pool::spawn("debug", "read", 1, qd, move || DebugReader::open(&paths))?
        };

        info!(gql_readers = gql_count, "chaindex pools started");
        Ok(Self {
            core_write,
            core_read,
            bundles_write,
            bundles_read,
            data_write,
            data_read,
            moderation_write,
            moderation_read,
            gql_read,
            debug_read,
            attributes_breaker: CircuitBreaker::new("data-attributes", config.breaker.clone()),
            parent_breaker: CircuitBreaker::new("data-parent", config.breaker),
        })
    }

    // =========================================================================
    // ChainIndex
    // =========================================================================

    /// Ingests a block, its fetched transactions, and its missing tx ids.
    pub async fn save_block_and_txs(
        &self,
        block: BlockHeader,
        txs: Vec<TxRecord>,
        missing_tx_ids: Vec<String>,
    ) -> Result<()> {
        self.core_write
            .submit(|reply| CoreWriteJob::SaveBlockAndTxs {
                block: Box::new(block),
                txs,
                missing_tx_ids,
                reply,
            })
            .await?
    }

    /// Ingests a transaction that arrived after its block.
    pub async fn save_tx(&self, tx: TxRecord) -> Result<()> {
        self.core_write
            .submit(|reply| CoreWriteJob::SaveTx {
                tx: Box::new(tx),
                reply,
            })
            .await?
    }

    /// Fork rollback on both staged stores. Stable state is never touched.
    pub async fn reset_to_height(&self, height: u64) -> Result<()> {
        self.core_write
            .submit(|reply| CoreWriteJob::ResetToHeight { height, reply })
            .await??;
        self.bundles_write
            .submit(|reply| BundlesWriteJob::ResetToHeight { height, reply })
            .await??;
        Ok(())
    }

    /// Highest indexed block height, if any.
    pub async fn get_max_height(&self) -> Result<Option<u64>> {
        self.core_read
            .submit(|reply| CoreReadJob::GetMaxHeight { reply })
            .await?
    }

    /// Independent hash of the block at `height`.
    pub async fn get_block_hash_by_height(&self, height: u64) -> Result<Option<String>> {
        self.core_read
            .submit(|reply| CoreReadJob::GetBlockHashByHeight { height, reply })
            .await?
    }

    /// Transaction ids awaiting fetch, oldest first.
    pub async fn get_missing_tx_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.core_read
            .submit(|reply| CoreReadJob::GetMissingTxIds { limit, reply })
            .await?
    }

    // =========================================================================
    // ChainOffsetIndex
    // =========================================================================

    /// Stable data-bearing transactions with no recorded weave offset.
    pub async fn get_tx_ids_missing_offsets(&self, limit: usize) -> Result<Vec<String>> {
        self.core_read
            .submit(|reply| CoreReadJob::GetTxIdsMissingOffsets { limit, reply })
            .await?
    }

    /// Records a transaction's absolute weave offset.
    pub async fn save_tx_offset(&self, id: String, offset: u64) -> Result<()> {
        self.core_write
            .submit(|reply| CoreWriteJob::SaveTxOffset { id, offset, reply })
            .await?
    }

    // =========================================================================
    // BundleIndex
    // =========================================================================

    /// Ingests one unbundled data item.
    pub async fn save_data_item(&self, item: DataItemRecord) -> Result<()> {
        self.bundles_write
            .submit(|reply| BundlesWriteJob::SaveDataItem {
                item: Box::new(item),
                reply,
            })
            .await?
    }

    /// Upserts a bundle lifecycle record.
    pub async fn save_bundle(&self, record: BundleRecord) -> Result<()> {
        self.bundles_write
            .submit(|reply| BundlesWriteJob::SaveBundle {
                record: Box::new(record),
                reply,
            })
            .await?
    }

    /// Bundles stuck before unbundling past the reprocess wait.
    pub async fn get_failed_bundle_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.bundles_read
            .submit(|reply| BundlesReadJob::GetFailedBundleIds { limit, reply })
            .await?
    }

    /// Stamps bundles whose matched items are all indexed. Returns how many.
    ///
    /// Routed through the write queue: it mutates lifecycle state and the
    /// single bundles writer's queue is shallow enough that ordering, not
    /// starvation, is the concern.
    pub async fn update_bundles_fully_indexed_at(&self) -> Result<usize> {
        self.bundles_write
            .submit(|reply| BundlesWriteJob::UpdateBundlesFullyIndexedAt { reply })
            .await?
    }

    /// Re-queues bundles processed under filters other than the given pair.
    pub async fn update_bundles_for_filter_change(
        &self,
        unbundle_filter: String,
        index_filter: String,
    ) -> Result<usize> {
        self.bundles_write
            .submit(|reply| BundlesWriteJob::UpdateBundlesForFilterChange {
                unbundle_filter,
                index_filter,
                reply,
            })
            .await?
    }

    /// Re-queues bundles whose indexed item count trails their matched count.
    pub async fn backfill_bundles(&self) -> Result<usize> {
        self.bundles_write
            .submit(|reply| BundlesWriteJob::BackfillBundles { reply })
            .await?
    }

    // =========================================================================
    // ContiguousDataIndex (breaker-wrapped reads)
    // =========================================================================

    /// Verifiable attributes for an id's content hash.
    ///
    /// `None` is "unknown": absent row, failed read, or open breaker.
    pub async fn get_data_attributes(&self, id: String) -> Option<DataAttributes> {
        let fut = async {
            self.data_read
                .submit(|reply| DataReadJob::GetDataAttributes { id, reply })
                .await?
        };
        self.attributes_breaker.call(fut).await.flatten()
    }

    /// The parent payload a nested id lives inside.
    ///
    /// `None` is "unknown": absent row, failed read, or open breaker.
    pub async fn get_data_parent(&self, id: String) -> Option<DataParent> {
        let fut = async {
            self.data_read
                .submit(|reply| DataReadJob::GetDataParent { id, reply })
                .await?
        };
        self.parent_breaker.call(fut).await.flatten()
    }

    /// Records an id's canonical content hash and attributes.
    pub async fn save_data_content_attributes(
        &self,
        attrs: DataContentAttributes,
    ) -> Result<()> {
        self.data_write
            .submit(|reply| DataWriteJob::SaveDataContentAttributes {
                attrs: Box::new(attrs),
                reply,
            })
            .await?
    }

    // =========================================================================
    // NestedDataIndexWriter
    // =========================================================================

    pub async fn save_nested_data_id(
        &self,
        id: String,
        parent_id: String,
        data_offset: u64,
        data_size: u64,
    ) -> Result<()> {
        self.data_write
            .submit(|reply| DataWriteJob::SaveNestedDataId {
                id,
                parent_id,
                data_offset,
                data_size,
                reply,
            })
            .await?
    }

    pub async fn save_nested_data_hash(
        &self,
        hash: String,
        parent_id: String,
        data_offset: u64,
    ) -> Result<()> {
        self.data_write
            .submit(|reply| DataWriteJob::SaveNestedDataHash {
                hash,
                parent_id,
                data_offset,
                reply,
            })
            .await?
    }

    // =========================================================================
    // BlockListValidator
    // =========================================================================

    /// True when the id is blocklisted; empty input is never blocked.
    pub async fn is_id_blocked(&self, id: String) -> Result<bool> {
        self.moderation_read
            .submit(|reply| ModerationReadJob::IsIdBlocked { id, reply })
            .await?
    }

    /// True when the content hash is blocklisted; empty input is never
    /// blocked.
    pub async fn is_hash_blocked(&self, hash: String) -> Result<bool> {
        self.moderation_read
            .submit(|reply| ModerationReadJob::IsHashBlocked { hash, reply })
            .await?
    }

    /// Records a blocked id and/or hash with its audit source.
    pub async fn block_data(&self, input: BlockDataInput) -> Result<()> {
        self.moderation_write
            .submit(|reply| ModerationWriteJob::BlockData {
                input: Box::new(input),
                reply,
            })
            .await?
    }

    // =========================================================================
    // GqlQueryable
    // =========================================================================

    /// One page of transactions and data items in cursor order.
    pub async fn get_gql_transactions(
        &self,
        query: GqlTransactionsQuery,
    ) -> Result<Paginated<GqlTransactionNode>> {
        self.gql_read
            .submit(|reply| GqlReadJob::GetGqlTransactions {
                query: Box::new(query),
                reply,
            })
            .await?
    }

    /// Point lookup of a transaction or data item.
    pub async fn get_gql_transaction(&self, id: String) -> Result<Option<GqlTransactionNode>> {
        self.gql_read
            .submit(|reply| GqlReadJob::GetGqlTransaction { id, reply })
            .await?
    }

    /// One page of blocks in height order.
    pub async fn get_gql_blocks(&self, query: GqlBlocksQuery) -> Result<Paginated<GqlBlockNode>> {
        self.gql_read
            .submit(|reply| GqlReadJob::GetGqlBlocks {
                query: Box::new(query),
                reply,
            })
            .await?
    }

    /// Point lookup of a block by independent hash.
    pub async fn get_gql_block(&self, id: String) -> Result<Option<GqlBlockNode>> {
        self.gql_read
            .submit(|reply| GqlReadJob::GetGqlBlock { id, reply })
            .await?
    }

    // =========================================================================
    // Debug / Health
    // =========================================================================

    /// Aggregated per-store statistics, invariant findings, and warnings.
    pub async fn get_debug_info(&self) -> Result<DebugInfo> {
        self.debug_read
            .submit(|reply| DebugReadJob::GetDebugInfo { reply })
            .await?
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Drains every pool and joins the worker threads. Jobs already queued
    /// complete first.
    pub async fn shutdown(self) {
        self.core_write.shutdown().await;
        self.core_read.shutdown().await;
        self.bundles_write.shutdown().await;
        self.bundles_read.shutdown().await;
        self.data_write.shutdown().await;
        self.data_read.shutdown().await;
        self.moderation_write.shutdown().await;
        self.moderation_read.shutdown().await;
        self.gql_read.shutdown().await;
        self.debug_read.shutdown().await;
        info!("chaindex shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
