//! # Debug and Health Reporting
//!
//! `get_debug_info` aggregates per-store statistics into one report: row
//! counts, height ranges, key timestamps, plus two classes of findings that
//! are reported rather than thrown:
//!
//! - **errors** — violated stable-prefix invariants (a stable block count
//!   that disagrees with its height range; stable transactions missing their
//!   block links);
//! - **warnings** — operational staleness (no bundle fully indexed within the
//!   last day).

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::chain_index::respond;
use crate::error::Result;
use crate::pool::{JobOutcome, PoolWorker};
use crate::schema::{self, StorePaths};
use crate::types::{unix_now, STALE_INDEX_WARNING_WAIT};

// =============================================================================
// Report Types
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugCounts {
    pub new_blocks: u64,
    pub stable_blocks: u64,
    pub new_transactions: u64,
    pub stable_transactions: u64,
    pub stable_block_transactions: u64,
    pub missing_transactions: u64,
    pub new_data_items: u64,
    pub stable_data_items: u64,
    pub bundles: u64,
    pub wallets: u64,
    pub tag_names: u64,
    pub tag_values: u64,
    pub data_hashes: u64,
    pub data_ids: u64,
    pub blocked_ids: u64,
    pub blocked_hashes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugHeights {
    pub min_stable: Option<i64>,
    pub max_stable: Option<i64>,
    pub max_new: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugTimestamps {
    pub max_stable_block_timestamp: Option<i64>,
    pub max_bundle_fully_indexed_at: Option<i64>,
}

/// The aggregate health report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugInfo {
    pub counts: DebugCounts,
    pub heights: DebugHeights,
    pub timestamps: DebugTimestamps,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

// =============================================================================
// Debug Worker
// =============================================================================

/// The debug reader holds read-only connections to all four stores.
pub struct DebugReader {
    core: Connection,
    data: Connection,
    moderation: Connection,
}

impl DebugReader {
    pub fn open(paths: &StorePaths) -> Result<Self> {
        Ok(Self {
            // Bundles rides along attached to core.
            core: schema::open_core_ro(paths)?,
            data: schema::open_standalone_ro(&paths.data)?,
            moderation: schema::open_standalone_ro(&paths.moderation)?,
        })
    }

    pub fn get_debug_info(&self) -> Result<DebugInfo> {
        let counts = DebugCounts {
            new_blocks: self.count(&self.core, "new_blocks")?,
            stable_blocks: self.count(&self.core, "stable_blocks")?,
            new_transactions: self.count(&self.core, "new_transactions")?,
            stable_transactions: self.count(&self.core, "stable_transactions")?,
            stable_block_transactions: self.count(&self.core, "stable_block_transactions")?,
            missing_transactions: self.count(&self.core, "missing_transactions")?,
            new_data_items: self.count(&self.core, "bundles.new_data_items")?,
            stable_data_items: self.count(&self.core, "bundles.stable_data_items")?,
            bundles: self.count(&self.core, "bundles.bundles")?,
            wallets: self.count(&self.core, "wallets")?,
            tag_names: self.count(&self.core, "tag_names")?,
            tag_values: self.count(&self.core, "tag_values")?,
            data_hashes: self.count(&self.data, "data_hashes")?,
            data_ids: self.count(&self.data, "data_ids")?,
            blocked_ids: self.count(&self.moderation, "blocked_ids")?,
            blocked_hashes: self.count(&self.moderation, "blocked_hashes")?,
        };

        let (min_stable, max_stable): (Option<i64>, Option<i64>) = self.core.query_row(
            "SELECT MIN(height), MAX(height) FROM stable_blocks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let max_new: Option<i64> =
            self.core
                .query_row("SELECT MAX(height) FROM new_blocks", [], |row| row.get(0))?;
        let heights = DebugHeights {
            min_stable,
            max_stable,
            max_new,
        };

        let max_stable_block_timestamp: Option<i64> = self.core.query_row(
            "SELECT MAX(block_timestamp) FROM stable_blocks",
            [],
            |row| row.get(0),
        )?;
        let max_bundle_fully_indexed_at: Option<i64> = self.core.query_row(
            "SELECT MAX(fully_indexed_at) FROM bundles.bundles",
            [],
            |row| row.get(0),
        )?;
        let timestamps = DebugTimestamps {
            max_stable_block_timestamp,
            max_bundle_fully_indexed_at,
        };

        let mut errors = Vec::new();
        // The stable prefix must be gap-free: count == max − min + 1.
        if let (Some(min), Some(max)) = (min_stable, max_stable) {
            let expected = (max - min + 1) as u64;
            if counts.stable_blocks != expected {
                errors.push(format!(
                    "stable block count mismatch: {} blocks for height range {min}..={max} (expected {expected})",
                    counts.stable_blocks
                ));
            }
        }
        // Every stable transaction must be reachable from its block link.
        let unlinked: u64 = self.core.query_row(
            "SELECT COUNT(*) FROM stable_transactions st
             WHERE NOT EXISTS (
                 SELECT 1 FROM stable_block_transactions sbt
                 WHERE sbt.transaction_id = st.id
             )",
            [],
            |row| row.get(0),
        )?;
        if unlinked > 0 {
            errors.push(format!(
                "{unlinked} stable transactions have no stable block-transaction link"
            ));
        }

        let mut warnings = Vec::new();
        if counts.bundles > 0 {
            let cutoff = unix_now() - STALE_INDEX_WARNING_WAIT.as_secs() as i64;
            let stale = match max_bundle_fully_indexed_at {
                Some(at) => at < cutoff,
                None => true,
            };
            if stale {
                warnings.push("no bundle fully indexed within the last 24 hours".to_string());
            }
        }

        Ok(DebugInfo {
            counts,
            heights,
            timestamps,
            errors,
            warnings,
        })
    }

    fn count(&self, conn: &Connection, table: &str) -> Result<u64> {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }
}

// =============================================================================
// Pool Jobs
// =============================================================================

/// Jobs served by the debug reader.
pub enum DebugReadJob {
    GetDebugInfo {
        reply: oneshot::Sender<Result<DebugInfo>>,
    },
}

impl PoolWorker for DebugReader {
    type Job = DebugReadJob;

    fn handle(&mut self, job: DebugReadJob) -> JobOutcome {
        match job {
            DebugReadJob::GetDebugInfo { reply } => respond(reply, self.get_debug_info()),
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
    use crate::test_support::{block_at, tx_with_tags, TestStores};

    #[test]
    fn test_clean_stores_report_no_findings() {
        let stores = TestStores::new();
        let reader = DebugReader::open(&stores.paths).unwrap();
        let info = reader.get_debug_info().unwrap();
        assert!(info.errors.is_empty());
        assert!(info.warnings.is_empty());
        assert_eq!(info.counts.new_blocks, 0);
        assert_eq!(info.heights.max_new, None);
    }

    #[test]
    fn test_counts_and_heights_after_ingestion() {
        let stores = TestStores::new();
        let mut writer = ChainIndexWriter::open(&stores.paths, 2).unwrap();
        for h in 0..=10 {
            let tx = tx_with_tags(&format!("tx-{h}"), &[]);
            writer
                .save_block_and_txs(&block_at(h, &[&tx.id]), &[tx], &[])
                .unwrap();
        }

        let reader = DebugReader::open(&stores.paths).unwrap();
        let info = reader.get_debug_info().unwrap();
        // Flush at height 10 promoted 0..=8.
        assert_eq!(info.heights.min_stable, Some(0));
        assert_eq!(info.heights.max_stable, Some(8));
        assert_eq!(info.heights.max_new, Some(10));
        assert_eq!(info.counts.stable_blocks, 9);
        assert!(info.errors.is_empty(), "errors: {:?}", info.errors);
    }

    #[test]
    fn test_stable_gap_is_reported() {
        let stores = TestStores::new();
        let mut writer = ChainIndexWriter::open(&stores.paths, 2).unwrap();
        for h in 0..=10 {
            writer.save_block_and_txs(&block_at(h, &[]), &[], &[]).unwrap();
        }
        // Punch a hole into the stable prefix.
        stores
            .core_conn()
            .execute("DELETE FROM stable_blocks WHERE height = 4", [])
            .unwrap();

        let reader = DebugReader::open(&stores.paths).unwrap();
        let info = reader.get_debug_info().unwrap();
        assert_eq!(info.errors.len(), 1);
        assert!(info.errors[0].contains("stable block count mismatch"));
    }
}
