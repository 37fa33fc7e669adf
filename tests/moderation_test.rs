//! Moderation: blocked ids and hashes answer lookups, empty inputs are
//! never blocked, and sources are recorded for audit.

mod common;

use chaindex::BlockDataInput;
use common::{open_db, test_id};

/// The literal moderation scenario: block an id from a named source, then
/// look it up.
#[tokio::test]
async fn block_id_and_lookup() {
    let (_dir, db) = open_db();

    let id = test_id("blocked-content");
    db.block_data(BlockDataInput {
        id: Some(id.clone()),
        hash: None,
        source: Some("manual".to_string()),
        notes: Some("operator request".to_string()),
    })
    .await
    .unwrap();

    assert!(db.is_id_blocked(id).await.unwrap());
    assert!(!db.is_id_blocked(test_id("innocent")).await.unwrap());
    assert!(!db.is_id_blocked(String::new()).await.unwrap());

    db.shutdown().await;
}

#[tokio::test]
async fn block_hash_and_lookup() {
    let (_dir, db) = open_db();

    let hash = test_id("blocked-hash");
    let input = BlockDataInput {
        id: None,
        hash: Some(hash.clone()),
        source: None,
        notes: None,
    };
    db.block_data(input.clone()).await.unwrap();
    db.block_data(input).await.unwrap(); // replay is a no-op

    assert!(db.is_hash_blocked(hash).await.unwrap());
    assert!(!db.is_hash_blocked(test_id("other-hash")).await.unwrap());
    assert!(!db.is_hash_blocked(String::new()).await.unwrap());

    let info = db.get_debug_info().await.unwrap();
    assert_eq!(info.counts.blocked_hashes, 1);
    assert_eq!(info.counts.blocked_ids, 0);

    db.shutdown().await;
}

/// Blocking both an id and a hash in one call records both under the same
/// source.
#[tokio::test]
async fn block_id_and_hash_together() {
    let (_dir, db) = open_db();

    db.block_data(BlockDataInput {
        id: Some(test_id("both-id")),
        hash: Some(test_id("both-hash")),
        source: Some("list-import".to_string()),
        notes: None,
    })
    .await
    .unwrap();

    assert!(db.is_id_blocked(test_id("both-id")).await.unwrap());
    assert!(db.is_hash_blocked(test_id("both-hash")).await.unwrap());

    db.shutdown().await;
}
