mod common;

use common::{jpeg, setup_test_db, RED};
use faceatlas::db;
use faceatlas::pipeline::catalog::index_catalog;
use faceatlas::pipeline::hash::content_hash;
use faceatlas::remote::{ContentStore, LocalStore};
use tempfile::TempDir;

fn photo_root() -> TempDir {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("2021/trip")).unwrap();
    std::fs::write(tmp.path().join("2021/trip/one.jpg"), jpeg(16, 16, RED)).unwrap();
    std::fs::write(tmp.path().join("2021/notes.txt"), b"not a photo").unwrap();
    tmp
}

#[tokio::test]
async fn test_listing_reports_relative_paths_and_hashes() {
    let root = photo_root();
    let store = LocalStore::new(root.path());

    let entries = store.list("local:").await.unwrap();
    assert_eq!(entries.len(), 2);
    let photo = entries.iter().find(|e| e.path == "2021/trip/one.jpg").unwrap();
    assert_eq!(photo.mime_type, "image/jpeg");
    let expected = content_hash(&root.path().join("2021/trip/one.jpg")).unwrap();
    assert_eq!(photo.content_hash(), Some(expected));
    let notes = entries.iter().find(|e| e.path == "2021/notes.txt").unwrap();
    assert_eq!(notes.mime_type, "text/plain");
}

#[tokio::test]
async fn test_fetch_copy_and_mkdir() {
    let root = photo_root();
    let store = LocalStore::new(root.path());
    let scratch = TempDir::new().unwrap();

    let dest = scratch.path().join("nested/one.jpg");
    store.fetch("local:2021/trip/one.jpg", &dest).await.unwrap();
    assert!(dest.is_file());

    store.mkdir("local:exports/Alice").await.unwrap();
    store.copy("local:2021/trip/one.jpg", "local:exports/Alice/one.jpg").await.unwrap();
    assert!(root.path().join("exports/Alice/one.jpg").is_file());

    assert!(store.fetch("local:2021/none.jpg", &dest).await.is_err());
    assert!(store.copy("local:../escape.jpg", "local:x.jpg").await.is_err());
    assert!(store.list("local:missing").await.is_err());
}

#[tokio::test]
async fn test_local_store_feeds_the_catalog() {
    let root = photo_root();
    let store = LocalStore::new(root.path());
    let (_tmp, pool) = setup_test_db();

    let summary = index_catalog(&pool, &store, "local:").await.unwrap();
    assert_eq!((summary.listed, summary.indexed, summary.other_type), (2, 1, 1));
    let catalog = db::with_conn(&pool, db::query::catalog).await.unwrap();
    assert_eq!(catalog[0].1, "2021/trip/one.jpg");
}
