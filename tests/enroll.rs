mod common;

use common::{color_encoder, jpeg, setup_test_db, BLACK, GREEN, RED};
use faceatlas::matcher::MatchStrategy;
use faceatlas::profiles::{enroll_and_store, enroll_from_folder, load_library};
use tempfile::TempDir;

fn reference_folder() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let write = |name: &str, color| std::fs::write(tmp.path().join(name), jpeg(32, 32, color)).unwrap();
    write("2019_via_corbin_01.jpg", RED);
    write("2019_via_corbin_02.jpg", RED);
    write("2020_smith_jane_01.jpg", GREEN);
    write("portrait.jpg", RED);
    write("2020_doe_john_01.jpg", BLACK);
    std::fs::write(tmp.path().join("readme.txt"), b"labels go in file names").unwrap();
    tmp
}

#[test]
fn test_enroll_groups_references_and_rejects_bad_files() {
    let folder = reference_folder();
    let (library, report) = enroll_from_folder(&color_encoder(), folder.path()).unwrap();

    assert_eq!(report.images, 5);
    assert_eq!(report.enrolled, 3);
    assert_eq!(report.profiles, 2);
    assert_eq!(library.names(), vec!["CorbinVia", "JaneSmith"]);
    assert_eq!(library.profiles()[0].references.len(), 2);

    let rejected: Vec<&str> = report.rejected.iter().map(|(f, _)| f.as_str()).collect();
    assert!(rejected.contains(&"portrait.jpg"));
    assert!(rejected.contains(&"2020_doe_john_01.jpg"));
}

#[test]
fn test_enroll_missing_folder_errors() {
    let tmp = TempDir::new().unwrap();
    assert!(enroll_from_folder(&color_encoder(), &tmp.path().join("nope")).is_err());
}

#[tokio::test]
async fn test_enrolled_library_survives_reload() {
    let folder = reference_folder();
    let (_tmp, pool) = setup_test_db();

    let (library, _) = enroll_and_store(&pool, color_encoder(), folder.path().to_path_buf()).await.unwrap();
    let reloaded = load_library(&pool).await.unwrap();
    assert_eq!(reloaded.names(), library.names());

    let m = reloaded.best_match(&[1.0, 0.0, 0.0], MatchStrategy::DistanceThreshold { tolerance: 1.0 });
    assert_eq!(m.name, "CorbinVia");
}

#[tokio::test]
async fn test_empty_enrollment_keeps_stored_library() {
    let folder = reference_folder();
    let (_tmp, pool) = setup_test_db();
    enroll_and_store(&pool, color_encoder(), folder.path().to_path_buf()).await.unwrap();

    let empty = TempDir::new().unwrap();
    assert!(enroll_and_store(&pool, color_encoder(), empty.path().to_path_buf()).await.is_err());
    assert_eq!(load_library(&pool).await.unwrap().len(), 2);
}
