#![allow(dead_code)]

use sha2::{Digest as _, Sha256};
use tempfile::TempDir;

use chaindex::{
    BlockHeader, ChainDb, ChainDbConfig, DataItemRecord, StorePaths, Tag, TxRecord,
};

/// Opens a ChainDb over fresh temp stores. Keep the TempDir alive for the
/// duration of the test.
pub fn open_db() -> (TempDir, ChainDb) {
    open_db_with_fork_depth(50)
}

/// Same, with a small fork depth so promotion tests don't need long chains.
pub fn open_db_with_fork_depth(max_fork_depth: u64) -> (TempDir, ChainDb) {
    let dir = TempDir::new().expect("create temp dir");
    let mut config = ChainDbConfig::new(StorePaths::in_dir(dir.path()));
    config.max_fork_depth = max_fork_depth;
    config.gql_readers = Some(2);
    let db = ChainDb::open(config).expect("open chaindex");
    (dir, db)
}

/// A deterministic 32-byte id in wire form (URL-safe base64 of a SHA-256).
pub fn test_id(seed: &str) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// A block header at `height` carrying the given transaction ids.
pub fn block_at(height: u64, txs: &[&str]) -> BlockHeader {
    BlockHeader {
        indep_hash: test_id(&format!("block-{height}")),
        height,
        previous_block: if height == 0 {
            String::new()
        } else {
            test_id(&format!("block-{}", height - 1))
        },
        nonce: test_id(&format!("nonce-{height}")),
        hash: test_id(&format!("hash-{height}")),
        block_timestamp: 1_700_000_000 + height as i64 * 120,
        diff: "115792089".to_string(),
        cumulative_diff: "328340664353".to_string(),
        last_retarget: 1_700_000_000,
        reward_addr: test_id("miner"),
        reward_pool: "18014398509481984".to_string(),
        block_size: 4096,
        weave_size: 1_000_000 + height * 4096,
        usd_to_ar_rate: Some(("1".to_string(), "10".to_string())),
        scheduled_usd_to_ar_rate: Some(("1".to_string(), "10".to_string())),
        hash_list_merkle: test_id(&format!("merkle-{height}")),
        wallet_list: test_id(&format!("wallets-{height}")),
        tx_root: test_id(&format!("tx-root-{height}")),
        txs: txs.iter().map(|t| t.to_string()).collect(),
    }
}

/// A transaction whose id derives from `seed`, carrying the given tags.
pub fn tx_with_tags(seed: &str, tags: &[(&str, &str)]) -> TxRecord {
    TxRecord {
        id: test_id(seed),
        signature: test_id(&format!("sig-{seed}")),
        format: 2,
        last_tx: test_id(&format!("anchor-{seed}")),
        owner: test_id(&format!("owner-{seed}")),
        target: test_id(&format!("target-{seed}")),
        quantity: "0".to_string(),
        reward: "65596".to_string(),
        data_size: 100,
        data_root: test_id(&format!("root-{seed}")),
        tags: tags.iter().map(|(n, v)| Tag::new(*n, *v)).collect(),
    }
}

/// A data item whose id derives from `seed`, nested under the given parent
/// and root transaction.
pub fn item_with_tags(
    seed: &str,
    parent_id: &str,
    root_transaction_id: &str,
    tags: &[(&str, &str)],
) -> DataItemRecord {
    DataItemRecord {
        id: test_id(seed),
        parent_id: parent_id.to_string(),
        root_transaction_id: root_transaction_id.to_string(),
        signature: test_id(&format!("sig-{seed}")),
        anchor: test_id(&format!("anchor-{seed}")),
        owner: test_id(&format!("owner-{seed}")),
        target: test_id(&format!("target-{seed}")),
        data_offset: 64,
        data_size: 32,
        tags: tags.iter().map(|(n, v)| Tag::new(*n, *v)).collect(),
        filter: Some("{\"always\":true}".to_string()),
    }
}
