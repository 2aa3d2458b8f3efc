#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;

use drive_fs::Error;
use drive_fs::cache::fcache::{CacheRoot, InvalidRootPathError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_creates_directory_and_marker() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_path = tmp.path().join("cache");

    let root = CacheRoot::open(&cache_path).await.unwrap();

    assert!(cache_path.join(".drive_fs_cache").exists());
    assert!(root.is_open());
    assert_eq!(root.cached_file_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_rejects_file_path() {
    let tmp = tempfile::tempdir().unwrap();
    let file_path = tmp.path().join("not_a_dir");
    std::fs::write(&file_path, b"hello").unwrap();

    let result = CacheRoot::open(&file_path).await;

    assert!(
        matches!(result, Err(InvalidRootPathError::NotADirectory(_))),
        "expected NotADirectory, got {:?}",
        result.as_ref().map(|_| "Ok(...)").map_err(|e| format!("{e:?}"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_rejects_non_empty_unmarked_directory() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("foreign.txt"), b"data").unwrap();

    let result = CacheRoot::open(tmp.path()).await;

    assert!(
        matches!(result, Err(InvalidRootPathError::RootPathUnsafeCache(_))),
        "expected RootPathUnsafeCache, got {:?}",
        result.as_ref().map(|_| "Ok(...)").map_err(|e| format!("{e:?}"))
    );
    assert!(tmp.path().join("foreign.txt").exists(), "foreign data must survive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_wipes_a_previously_used_directory() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(".drive_fs_cache"), b"").unwrap();
    std::fs::write(tmp.path().join("leftover"), b"stale").unwrap();
    std::fs::create_dir(tmp.path().join("nested")).unwrap();

    let _root = CacheRoot::open(tmp.path()).await.unwrap();

    assert!(!tmp.path().join("leftover").exists());
    assert!(!tmp.path().join("nested").exists());
    assert!(tmp.path().join(".drive_fs_cache").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_is_shared_while_referenced() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let a = root.file("abc123").unwrap();
    let b = root.file("abc123").unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.ref_count(), 2);
    assert_eq!(root.cached_file_count(), 1);
    assert_eq!(a.path(), root.path().join("abc123"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forgotten_file_is_unlinked_after_its_last_handle_closes() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let file = root.file("abc123").unwrap();
    let path = file.path().to_path_buf();
    assert!(path.exists());

    let handle = file.open(false).unwrap();
    assert_eq!(file.ref_count(), 2);

    file.forget();
    assert!(path.exists(), "an open handle keeps the file");
    assert_eq!(file.ref_count(), 1);

    handle.close();
    assert!(!path.exists(), "last close should unlink");
    assert_eq!(file.ref_count(), 0);
    assert_eq!(root.cached_file_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_handles_keep_the_file_until_both_close() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let file = root.file("abc123").unwrap();
    file.write_all_at(b"cached bytes", 0).unwrap();
    let path = file.path().to_path_buf();
    let h1 = file.open(false).unwrap();
    let h2 = file.open(false).unwrap();
    file.forget();
    assert_eq!(file.ref_count(), 2);

    h1.close();
    assert!(path.exists(), "h2 still holds the file");
    assert_eq!(&h2.read(0, 6).unwrap()[..], b"cached");

    h2.close();
    assert!(!path.exists(), "closing the last handle unlinks");
    assert_eq!(root.cached_file_count(), 0);

    let fresh = root.file("abc123").unwrap();
    let h3 = fresh.open(false).unwrap();
    assert!(!Arc::ptr_eq(&file, &fresh));
    assert!(path.exists());
    assert_eq!(fresh.stat().unwrap().len(), 0, "the re-created file starts empty");
    assert!(h3.read(0, 16).unwrap().is_empty());
    h3.close();
    fresh.forget();
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_handle_releases_it_like_close() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let file = root.file("dropped").unwrap();
    let handle = file.open(true).unwrap();
    file.forget();
    drop(handle);

    assert!(!file.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_owner_must_forget_before_unlink() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let first = root.file("shared").unwrap();
    let second = root.file("shared").unwrap();

    first.forget();
    assert!(first.path().exists(), "the second owner still holds it");
    assert_eq!(second.ref_count(), 1);

    second.forget();
    assert!(!second.path().exists());
    assert_eq!(root.cached_file_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extra_forget_is_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let file = root.file("once").unwrap();
    let handle = file.open(false).unwrap();
    file.forget();
    file.forget();

    assert_eq!(file.ref_count(), 1, "the extra forget must not steal the handle's reference");
    assert!(file.path().exists());
    handle.close();
    assert!(!file.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handles_read_and_write_through_their_own_descriptor() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();
    let file = root.file("rw").unwrap();

    let writer = file.open(true).unwrap();
    let reader = file.open(false).unwrap();

    assert_eq!(writer.write(0, b"hello world").unwrap(), 11);
    assert_eq!(&reader.read(6, 5).unwrap()[..], b"world");
    assert_eq!(&reader.read(6, 100).unwrap()[..], b"world", "short read at EOF");
    assert!(reader.read(100, 10).unwrap().is_empty());

    assert!(matches!(reader.write(0, b"nope"), Err(Error::BadHandle)));
    assert!(writer.is_writable());
    assert!(!reader.is_writable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_forgotten_id_can_be_cached_again() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let first = root.file("again").unwrap();
    first.write_all_at(b"old bytes", 0).unwrap();
    first.forget();

    let second = root.file("again").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.stat().unwrap().len(), 0, "a new file starts empty");
    assert!(second.path().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_ids_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    for id in ["", "a/b", ".", "..", ".drive_fs_cache"] {
        assert!(
            matches!(root.file(id), Err(Error::InvalidId(ref bad)) if bad == id),
            "id {id:?} should be rejected"
        );
    }
    assert_eq!(root.cached_file_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn root_closes_only_after_creator_and_files_let_go() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let file = root.file("pinned").unwrap();
    let handle = file.open(false).unwrap();

    root.close();
    assert!(root.is_open(), "a live file pins the root");

    file.forget();
    assert!(root.is_open(), "an open handle pins the file, and so the root");

    handle.close();
    assert!(!root.is_open());
    assert!(matches!(root.file("late"), Err(Error::Shutdown)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_describes_the_cache_filesystem() {
    let tmp = tempfile::tempdir().unwrap();
    let root = CacheRoot::open(tmp.path()).await.unwrap();

    let stats = root.statfs().unwrap();
    assert!(stats.block_size > 0);
    assert!(stats.total_blocks >= stats.free_blocks);
    assert!(stats.max_filename_length > 0);

    root.close();
    assert!(matches!(root.statfs(), Err(Error::Shutdown)));
}

#[test]
fn concurrent_sessions_balance_their_references() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let root = runtime.block_on(CacheRoot::open(tmp.path())).unwrap();
    let file = root.file("busy").unwrap();
    file.write_all_at(b"payload", 0).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..200 {
                    let handle = file.open(false).unwrap();
                    assert_eq!(&handle.read(0, 7).unwrap()[..], b"payload");
                    handle.close();
                }
            });
        }
    });

    assert_eq!(file.ref_count(), 1);
    file.forget();
    assert!(!file.path().exists());
    assert_eq!(root.cached_file_count(), 0);
}
