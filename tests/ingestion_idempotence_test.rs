//! Ingestion idempotence: replaying any ingestion sequence, with arbitrary
//! duplication, converges all four stores on the same state.

mod common;

use chaindex::{BlockDataInput, BundleRecord, ChainDb, DataContentAttributes};
use common::{block_at, item_with_tags, open_db_with_fork_depth, test_id, tx_with_tags};

/// Runs one full ingestion sequence against the db.
async fn run_sequence(db: &ChainDb) {
    for h in 0..=12 {
        let tx = tx_with_tags(&format!("tx-{h}"), &[("App-Name", "Foo")]);
        db.save_block_and_txs(block_at(h, &[&tx.id]), vec![tx.clone()], vec![])
            .await
            .unwrap();
        if h == 6 {
            // Duplicate a whole block mid-sequence.
            db.save_block_and_txs(block_at(h, &[&tx.id]), vec![tx], vec![])
                .await
                .unwrap();
        }
    }

    let root = test_id("tx-10");
    db.save_data_item(item_with_tags("item-a", &root, &root, &[("App-Name", "Foo")]))
        .await
        .unwrap();
    db.save_bundle(BundleRecord {
        id: root.clone(),
        root_transaction_id: root.clone(),
        format: "binary".to_string(),
        matched_data_item_count: Some(1),
        queued_at: Some(1_000),
        unbundled_at: Some(2_000),
        ..Default::default()
    })
    .await
    .unwrap();

    db.save_data_content_attributes(DataContentAttributes {
        id: test_id("tx-10"),
        data_root: Some(test_id("root-tx-10")),
        hash: test_id("content-hash"),
        data_size: 100,
        content_type: Some("text/plain".to_string()),
        cached_at: None,
    })
    .await
    .unwrap();
    db.save_nested_data_id(test_id("item-a"), test_id("tx-10"), 0, 32)
        .await
        .unwrap();
    db.save_nested_data_hash(test_id("nested-hash"), test_id("tx-10"), 0)
        .await
        .unwrap();

    db.block_data(BlockDataInput {
        id: Some(test_id("bad-id")),
        hash: Some(test_id("bad-hash")),
        source: Some("manual".to_string()),
        notes: None,
    })
    .await
    .unwrap();
}

/// Collects a comparable snapshot of all four stores.
async fn snapshot(db: &ChainDb) -> String {
    let info = db.get_debug_info().await.unwrap();
    format!("{info:?}")
}

#[tokio::test]
async fn replaying_the_sequence_is_a_no_op() {
    let (_dir, db) = open_db_with_fork_depth(3);

    run_sequence(&db).await;
    let first = snapshot(&db).await;

    // Replay the whole thing, twice.
    run_sequence(&db).await;
    run_sequence(&db).await;
    let replayed = snapshot(&db).await;

    assert_eq!(first, replayed, "replay must not change any store");

    // Sanity on the converged state: flush at 10 promoted 0..=7.
    let info = db.get_debug_info().await.unwrap();
    assert_eq!(info.heights.max_stable, Some(7));
    assert_eq!(info.counts.stable_transactions, 8);
    assert_eq!(info.counts.new_data_items, 1);
    assert_eq!(info.counts.data_hashes, 1);
    assert_eq!(info.counts.blocked_ids, 1);
    assert!(info.errors.is_empty(), "{:?}", info.errors);

    db.shutdown().await;
}

/// Two databases fed the same sequence in different duplication patterns
/// converge on identical states.
#[tokio::test]
async fn duplication_pattern_does_not_matter() {
    let (_dir_a, db_a) = open_db_with_fork_depth(3);
    let (_dir_b, db_b) = open_db_with_fork_depth(3);

    run_sequence(&db_a).await;

    run_sequence(&db_b).await;
    run_sequence(&db_b).await;

    // Timestamps (indexed_at) can differ between the runs; compare the
    // structural fields only.
    let a = db_a.get_debug_info().await.unwrap();
    let b = db_b.get_debug_info().await.unwrap();
    assert_eq!(format!("{:?}", a.counts), format!("{:?}", b.counts));
    assert_eq!(format!("{:?}", a.heights), format!("{:?}", b.heights));
    assert_eq!(a.errors, b.errors);

    db_a.shutdown().await;
    db_b.shutdown().await;
}
