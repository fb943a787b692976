mod common;

use common::{jpeg, png, setup_test_db, MemoryStore, LOCATION, RED};
use faceatlas::db;
use faceatlas::pipeline::acquire::{acquire_image, acquire_unresolved, AcquireOutcome, AcquireSettings, SkipReason};
use faceatlas::pipeline::catalog::index_catalog;
use tempfile::TempDir;

fn settings(dir: &TempDir) -> AcquireSettings {
    AcquireSettings { folder: dir.path().join("work"), max_size: 1024 }
}

#[tokio::test]
async fn test_acquire_bounds_large_jpeg() {
    let work = TempDir::new().unwrap();
    let store = MemoryStore::new();
    store.add("p/x.jpg", "abc", "image/jpeg", jpeg(2000, 1000, RED));

    let outcome = acquire_image(&store, LOCATION, "abc", "p/x.jpg", &settings(&work)).await.unwrap();
    let AcquireOutcome::Acquired(img) = outcome else {
        panic!("expected acquired, got {:?}", outcome);
    };
    assert_eq!((img.width, img.height), (1024, 512));
    assert_eq!(img.local_path, work.path().join("work").join("abc.jpg"));
    let stored = image::open(&img.local_path).unwrap();
    assert_eq!((stored.width(), stored.height()), (1024, 512));
    // Raw download is gone
    assert!(!work.path().join("work").join("abc").exists());
}

#[tokio::test]
async fn test_missing_remote_file_is_skipped() {
    let work = TempDir::new().unwrap();
    let store = MemoryStore::new();
    store.add_listing("gone.jpg", "dead", "image/jpeg");

    let outcome = acquire_image(&store, LOCATION, "dead", "gone.jpg", &settings(&work)).await.unwrap();
    match outcome {
        AcquireOutcome::Skipped(reason) => {
            assert_eq!(reason, SkipReason::Download);
            assert_eq!(reason.to_string(), "unable to download");
        }
        other => panic!("expected skip, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_content_type_is_skipped_and_removed() {
    let work = TempDir::new().unwrap();
    let store = MemoryStore::new();
    store.add("fake.jpg", "f1", "image/jpeg", png(8, 8));

    let outcome = acquire_image(&store, LOCATION, "f1", "fake.jpg", &settings(&work)).await.unwrap();
    match outcome {
        AcquireOutcome::Skipped(reason) => assert_eq!(reason.to_string(), "image/png"),
        other => panic!("expected skip, got {:?}", other),
    }
    assert!(!work.path().join("work").join("f1").exists());
    assert!(!work.path().join("work").join("f1.jpg").exists());
}

#[tokio::test]
async fn test_undecodable_jpeg_is_resize_error() {
    let work = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend_from_slice(b"definitely not the rest of a jpeg");
    store.add("broken.jpg", "b1", "image/jpeg", bytes);

    let outcome = acquire_image(&store, LOCATION, "b1", "broken.jpg", &settings(&work)).await.unwrap();
    match outcome {
        AcquireOutcome::Skipped(reason) => assert_eq!(reason.to_string(), "resize error"),
        other => panic!("expected skip, got {:?}", other),
    }
    assert!(!work.path().join("work").join("b1").exists());
}

#[tokio::test]
async fn test_acquire_unresolved_keeps_states_exclusive() {
    let (tmp, pool) = setup_test_db();
    let store = MemoryStore::new();
    store.add("a.jpg", "aaa", "image/jpeg", jpeg(32, 32, RED));
    store.add("b.jpg", "bbb", "image/jpeg", b"plain text".to_vec());
    store.add_listing("c.jpg", "ccc", "image/jpeg");
    index_catalog(&pool, &store, LOCATION).await.unwrap();

    let settings = settings(&tmp);
    let summary = acquire_unresolved(&pool, &store, LOCATION, &settings, None).await.unwrap();
    assert_eq!((summary.attempted, summary.acquired, summary.skipped), (3, 1, 2));

    let (downloaded, skipped) = db::with_conn(&pool, |c| {
        Ok((db::query::downloaded_hashes(c)?, db::query::skipped_hashes(c)?))
    })
    .await
    .unwrap();
    assert_eq!(downloaded, vec!["aaa"]);
    assert_eq!(skipped.len(), 2);
    assert!(downloaded.iter().all(|h| !skipped.contains(h)));

    let reason = db::with_conn(&pool, |c| db::query::skip_reason(c, "bbb")).await.unwrap();
    assert_eq!(reason.as_deref(), Some("text/plain"));

    // Nothing left to do, skipped hashes are not retried
    let again = acquire_unresolved(&pool, &store, LOCATION, &settings, None).await.unwrap();
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn test_cleared_skip_is_retried_and_becomes_downloaded() {
    let (tmp, pool) = setup_test_db();
    let store = MemoryStore::new();
    store.add_listing("late.jpg", "late", "image/jpeg");
    index_catalog(&pool, &store, LOCATION).await.unwrap();
    let settings = settings(&tmp);
    acquire_unresolved(&pool, &store, LOCATION, &settings, None).await.unwrap();

    store.files.lock().insert("mem:late.jpg".into(), jpeg(16, 16, RED));
    assert!(db::with_conn(&pool, |c| db::writer::clear_skip(c, "late")).await.unwrap());
    let summary = acquire_unresolved(&pool, &store, LOCATION, &settings, None).await.unwrap();
    assert_eq!(summary.acquired, 1);
    let record = db::with_conn(&pool, |c| db::query::image_record(c, "late")).await.unwrap().unwrap();
    assert!(record.skip_reason.is_none());
}
