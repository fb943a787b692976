mod common;

use common::{setup_test_db, MemoryStore, LOCATION};
use faceatlas::db;
use faceatlas::pipeline::catalog::index_catalog;

#[tokio::test]
async fn test_index_selects_jpegs_with_hashes() {
    let (_tmp, pool) = setup_test_db();
    let store = MemoryStore::new();
    store.add_listing("2020/a.jpg", "AAA", "image/jpeg");
    store.add_listing("2020/b.JPG", "bbb", "IMAGE/JPEG");
    store.add_listing("2020/c.png", "ccc", "image/png");
    store.add_listing("2020/d.jpg", "", "image/jpeg");

    let summary = index_catalog(&pool, &store, LOCATION).await.unwrap();
    assert_eq!(summary.listed, 4);
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.missing_hash, 1);
    assert_eq!(summary.other_type, 1);

    let catalog = db::with_conn(&pool, db::query::catalog).await.unwrap();
    assert_eq!(
        catalog,
        vec![("aaa".to_string(), "2020/a.jpg".to_string()), ("bbb".to_string(), "2020/b.JPG".to_string())]
    );
}

#[tokio::test]
async fn test_reindex_is_idempotent_and_last_path_wins() {
    let (_tmp, pool) = setup_test_db();
    let store = MemoryStore::new();
    store.add_listing("old/a.jpg", "aaa", "image/jpeg");
    index_catalog(&pool, &store, LOCATION).await.unwrap();
    index_catalog(&pool, &store, LOCATION).await.unwrap();
    let totals = db::with_conn(&pool, db::query::store_totals).await.unwrap();
    assert_eq!(totals.indexed, 1);

    store.entries.lock().clear();
    store.add_listing("new/a.jpg", "aaa", "image/jpeg");
    index_catalog(&pool, &store, LOCATION).await.unwrap();
    let path = db::with_conn(&pool, |c| db::query::catalog_path(c, "aaa")).await.unwrap();
    assert_eq!(path.as_deref(), Some("new/a.jpg"));
}

#[tokio::test]
async fn test_listing_failure_writes_nothing() {
    let (_tmp, pool) = setup_test_db();
    let store = MemoryStore::new();
    store.add_listing("a.jpg", "aaa", "image/jpeg");
    *store.fail_listing.lock() = true;

    assert!(index_catalog(&pool, &store, LOCATION).await.is_err());
    let catalog = db::with_conn(&pool, db::query::catalog).await.unwrap();
    assert!(catalog.is_empty());
}
