//! Tag filtering: a row is returned iff every requested (name, values)
//! constraint is satisfied by at least one of its tags, with value
//! membership decided by the SHA-1 of the raw value bytes.

mod common;

use chaindex::{GqlTransactionsQuery, TagFilter};
use common::{block_at, open_db_with_fork_depth, tx_with_tags};

fn tag_query(tags: Vec<TagFilter>) -> GqlTransactionsQuery {
    GqlTransactionsQuery {
        page_size: 10,
        tags,
        ..Default::default()
    }
}

fn filter(name: &str, values: &[&str]) -> TagFilter {
    TagFilter {
        name: name.to_string(),
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

/// The literal tag scenario: a tx tagged (Content-Type, text/plain) and
/// (App-Name, Foo).
#[tokio::test]
async fn tag_match_miss_and_conjunction() {
    let (_dir, db) = open_db_with_fork_depth(1);

    let tx = tx_with_tags(
        "tagged-tx",
        &[("Content-Type", "text/plain"), ("App-Name", "Foo")],
    );
    db.save_block_and_txs(block_at(1, &[&tx.id]), vec![tx.clone()], vec![])
        .await
        .unwrap();

    // Matching value.
    let hit = db
        .get_gql_transactions(tag_query(vec![filter("App-Name", &["Foo"])]))
        .await
        .unwrap();
    assert_eq!(hit.edges.len(), 1);
    assert_eq!(hit.edges[0].node.id, tx.id);

    // Same name, wrong value.
    let miss = db
        .get_gql_transactions(tag_query(vec![filter("App-Name", &["Bar"])]))
        .await
        .unwrap();
    assert!(miss.edges.is_empty());

    // Both constraints matching: the row comes back exactly once.
    let both = db
        .get_gql_transactions(tag_query(vec![
            filter("App-Name", &["Foo"]),
            filter("Content-Type", &["text/plain"]),
        ]))
        .await
        .unwrap();
    assert_eq!(both.edges.len(), 1);

    // One matching, one not: conjunction fails.
    let half = db
        .get_gql_transactions(tag_query(vec![
            filter("App-Name", &["Foo"]),
            filter("Content-Type", &["application/json"]),
        ]))
        .await
        .unwrap();
    assert!(half.edges.is_empty());

    db.shutdown().await;
}

/// Value lists are OR within one constraint.
#[tokio::test]
async fn value_list_membership() {
    let (_dir, db) = open_db_with_fork_depth(1);

    let foo = tx_with_tags("app-foo", &[("App-Name", "Foo")]);
    let bar = tx_with_tags("app-bar", &[("App-Name", "Bar")]);
    let baz = tx_with_tags("app-baz", &[("App-Name", "Baz")]);
    for (h, tx) in [&foo, &bar, &baz].iter().enumerate() {
        db.save_block_and_txs(
            block_at(h as u64 + 1, &[&tx.id]),
            vec![(*tx).clone()],
            vec![],
        )
        .await
        .unwrap();
    }

    let page = db
        .get_gql_transactions(tag_query(vec![filter("App-Name", &["Foo", "Baz"])]))
        .await
        .unwrap();
    let mut ids: Vec<String> = page.edges.iter().map(|e| e.node.id.clone()).collect();
    ids.sort();
    let mut expected = vec![foo.id.clone(), baz.id.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    db.shutdown().await;
}

/// Tag matching is byte-exact: values differing only in case are different
/// hashes.
#[tokio::test]
async fn value_match_is_byte_exact() {
    let (_dir, db) = open_db_with_fork_depth(1);

    let tx = tx_with_tags("case-tx", &[("App-Name", "Foo")]);
    db.save_block_and_txs(block_at(1, &[&tx.id]), vec![tx], vec![])
        .await
        .unwrap();

    let miss = db
        .get_gql_transactions(tag_query(vec![filter("App-Name", &["foo"])]))
        .await
        .unwrap();
    assert!(miss.edges.is_empty());

    db.shutdown().await;
}

/// Tag filters keep working after rows promote into the stable family, and
/// the chained-join path (several tags, one low-selectivity) returns the
/// same rows.
#[tokio::test]
async fn tags_survive_promotion_and_chained_joins() {
    let (_dir, db) = open_db_with_fork_depth(1);

    let tx = tx_with_tags(
        "stable-tagged",
        &[
            ("App-Name", "Foo"),
            ("Content-Type", "text/plain"),
            ("Protocol", "v2"),
        ],
    );
    db.save_block_and_txs(block_at(1, &[&tx.id]), vec![tx.clone()], vec![])
        .await
        .unwrap();
    for h in 2..=5 {
        db.save_block_and_txs(block_at(h, &[]), vec![], vec![])
            .await
            .unwrap();
    }
    // Height 1 is stable now (flush at 5, end_height 4).
    let info = db.get_debug_info().await.unwrap();
    assert_eq!(info.counts.stable_transactions, 1);

    let page = db
        .get_gql_transactions(tag_query(vec![
            filter("Protocol", &["v2"]),
            filter("App-Name", &["Foo"]),
            filter("Content-Type", &["text/plain"]),
        ]))
        .await
        .unwrap();
    assert_eq!(page.edges.len(), 1);
    assert_eq!(page.edges[0].node.id, tx.id);
    // The node decodes all of its tags.
    assert_eq!(page.edges[0].node.tags.len(), 3);

    db.shutdown().await;
}
