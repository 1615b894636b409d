//! End-to-end session tests over the memory backend
//!
//! Covers the write/commit/read cycle, in-flight upload visibility and the
//! cache staying consistent across renames, removals and failures.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::*;
use fuse_bridge::backend::memory::MemoryBackend;
use fuse_bridge::backend::EntryMeta;
use fuse_bridge::cache::EntryLookup;
use fuse_bridge::BridgeError;

fn bridge_error(err: &anyhow::Error) -> Option<&BridgeError> {
    err.downcast_ref::<BridgeError>()
}

/// Names returned by read_dir, in listing order
async fn names(session: &TestSession, dir: &str) -> Result<Vec<String>> {
    Ok(session
        .read_dir(&key(dir))
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

#[tokio::test]
async fn test_write_then_read() -> Result<()> {
    let session = session();

    let fh = session.open_write(&key("/hello.txt")).await?;
    assert_eq!(session.write(fh, 0, b"hello ").await?, 6);
    assert_eq!(session.write(fh, 6, b"world").await?, 5);
    session.release(fh).await?;

    assert_eq!(read_file(&session, "/hello.txt").await?, b"hello world");
    assert_eq!(
        session.backend().contents("/hello.txt").as_deref(),
        Some(&b"hello world"[..])
    );
    assert_eq!(session.get_entry(&key("/hello.txt")).await?.size(), 11);
    assert!(session.uploads().is_empty());
    assert_eq!(session.open_handles(), 0);
    Ok(())
}

#[tokio::test]
async fn test_zero_byte_create() -> Result<()> {
    let session = session();

    let fh = session.open_write(&key("/empty")).await?;
    session.release(fh).await?;

    assert_eq!(
        session.backend().contents("/empty").as_deref(),
        Some(&b""[..])
    );
    assert_eq!(session.get_entry(&key("/empty")).await?.size(), 0);
    assert!(session.exists_entry(&key("/empty")).await?);
    assert!(!session.uploads().is_uploading(&key("/empty")));
    Ok(())
}

#[tokio::test]
async fn test_in_flight_upload_is_visible_but_not_readable() -> Result<()> {
    let session = session();
    let path = key("/draft");

    let fh = session.open_write(&path).await?;
    session.write(fh, 0, b"half").await?;

    // stat sees the in-progress entry, readers and other writers are turned away
    let pending = session.get_entry(&path).await?;
    assert_eq!(pending.id, 0);
    assert!(matches!(
        session.open_read(&path).await,
        Err(BridgeError::Busy(_))
    ));
    assert!(matches!(
        session.open_write(&path).await,
        Err(BridgeError::Busy(_))
    ));
    assert!(matches!(
        session.rename(&path, &key("/moved")).await,
        Err(BridgeError::Busy(_))
    ));

    session.release(fh).await?;

    let committed = session.get_entry(&path).await?;
    assert_ne!(committed.id, 0);
    assert_eq!(committed.size(), 4);
    assert_eq!(read_file(&session, "/draft").await?, b"half");
    Ok(())
}

#[tokio::test]
async fn test_overwrite_reports_previous_entry_until_commit() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/f", "old");
    let session = session_with(backend, "{}")?;
    let path = key("/f");

    let before = session.get_entry(&path).await?;
    let fh = session.open_write(&path).await?;
    session.write(fh, 0, b"newer").await?;
    assert_eq!(session.get_entry(&path).await?, before);

    session.release(fh).await?;
    let after = session.get_entry(&path).await?;
    assert_ne!(after, before);
    assert_eq!(after.size(), 5);
    assert_eq!(read_file(&session, "/f").await?, b"newer");
    Ok(())
}

#[tokio::test]
async fn test_failed_upload_leaves_cache_untouched() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/keep", "old");
    let session = session_with(backend, "{}")?;

    let before = session.get_entry(&key("/keep")).await?;
    session.backend().set_fail_uploads(true);

    let err = write_file(&session, "/keep", b"replacement").await.unwrap_err();
    assert!(matches!(bridge_error(&err), Some(BridgeError::Backend(_))));

    // flag cleared, metadata and contents still the pre-write state
    assert!(session.uploads().is_empty());
    assert_eq!(session.get_entry(&key("/keep")).await?, before);
    assert_eq!(
        session.backend().contents("/keep").as_deref(),
        Some(&b"old"[..])
    );

    let err = write_file(&session, "/fresh", b"data").await.unwrap_err();
    assert!(bridge_error(&err).is_some());
    assert!(session.get_entry(&key("/fresh")).await.unwrap_err().is_not_found());

    session.backend().set_fail_uploads(false);
    write_file(&session, "/fresh", b"data").await?;
    assert_eq!(read_file(&session, "/fresh").await?, b"data");
    Ok(())
}

#[tokio::test]
async fn test_commit_updates_cached_listing_only() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/d/a", "a");
    let session = session_with(backend, "{}")?;

    assert!(names(&session, "/").await?.contains(&"d".to_string()));
    write_file(&session, "/top", b"t").await?;
    assert_eq!(names(&session, "/").await?, vec!["d", "top"]);

    // listing of /d was never fetched: the commit must not invent a partial one
    write_file(&session, "/d/b", b"b").await?;
    assert!(!session.cache().has_directory_listing(&key("/d")));
    assert_eq!(names(&session, "/d").await?, vec!["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn test_mkdir_then_create_inside() -> Result<()> {
    let session = session();

    assert!(names(&session, "/").await?.is_empty());
    session.mkdir(&key("/m")).await?;
    assert_eq!(names(&session, "/").await?, vec!["m"]);
    assert!(names(&session, "/m").await?.is_empty());

    write_file(&session, "/m/f", b"inside").await?;
    assert_eq!(names(&session, "/m").await?, vec!["f"]);
    assert_eq!(session.cache().child_count(&key("/m")), Some(1));

    assert!(matches!(
        session.mkdir(&key("/m")).await,
        Err(BridgeError::AlreadyExists(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_rename_rebases_cached_subtree() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/a/x/y", "why");
    backend.insert_file("/b/keep", "k");
    let session = session_with(backend, "{}")?;

    names(&session, "/").await?;
    names(&session, "/a").await?;
    assert_eq!(names(&session, "/a/x").await?, vec!["y"]);

    session.rename(&key("/a/x"), &key("/b/x")).await?;

    let cache = session.cache();
    assert_eq!(
        cache.get_directory_listing(&key("/b/x")),
        Some(vec![key("/b/x/y")])
    );
    assert!(cache.has_file(&key("/b/x/y")));
    assert!(!cache.has_file(&key("/a/x")));
    assert!(!cache.has_file(&key("/a/x/y")));
    assert!(!cache.has_directory_listing(&key("/a/x")));
    assert_eq!(cache.get_directory_listing(&key("/a")), Some(Vec::new()));

    assert_eq!(names(&session, "/b").await?, vec!["keep", "x"]);
    assert_eq!(read_file(&session, "/b/x/y").await?, b"why");
    assert!(session.get_entry(&key("/a/x/y")).await.unwrap_err().is_not_found());

    assert!(matches!(
        session.rename(&key("/b"), &key("/b/x/inner")).await,
        Err(BridgeError::InvalidArgument(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_remove_files_and_directories() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/d/f", "x");
    let session = session_with(backend, "{}")?;

    assert!(matches!(
        session.remove(&key("/d")).await,
        Err(BridgeError::NotEmpty(_))
    ));
    names(&session, "/d").await?;
    assert!(matches!(
        session.remove(&key("/d")).await,
        Err(BridgeError::NotEmpty(_))
    ));

    session.remove(&key("/d/f")).await?;
    assert_eq!(session.cache().child_count(&key("/d")), Some(0));

    session.remove(&key("/d")).await?;
    assert!(!session.cache().has_directory_listing(&key("/d")));
    assert!(session.get_entry(&key("/d")).await.unwrap_err().is_not_found());
    assert!(!session.backend().exists("/d"));
    Ok(())
}

#[tokio::test]
async fn test_ignored_names_never_reach_backend() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/._resource", "fork");
    backend.insert_file("/.DS_Store", "finder");
    backend.insert_file("/real", "data");
    let yaml = r#"
ignore:
  apple_double: true
  patterns: ["*.swp"]
"#;
    let session = session_with(backend, yaml)?;

    assert_eq!(names(&session, "/").await?, vec!["real"]);
    assert!(session
        .get_entry(&key("/._resource"))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(!session.exists_entry(&key("/.DS_Store")).await?);
    assert!(matches!(
        session.open_write(&key("/notes.swp")).await,
        Err(BridgeError::InvalidArgument(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_distinct_paths() -> Result<()> {
    let session = session();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let path = format!("/file-{}", i);
                let data = pattern_bytes(10_000 + i * 517);
                write_file(&session, &path, &data).await?;
                anyhow::Ok(())
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    for i in 0..16 {
        let data = read_file(&session, &format!("/file-{}", i)).await?;
        assert_eq!(data, pattern_bytes(10_000 + i * 517));
    }
    assert!(session.uploads().is_empty());
    assert_eq!(names(&session, "/").await?.len(), 16);
    Ok(())
}

#[tokio::test]
async fn test_large_write_through_small_pipe() -> Result<()> {
    let session = session_with(MemoryBackend::new(), "upload:\n  pipe_capacity: 1KB\n")?;
    let data = pattern_bytes(256 * 1024);

    write_file(&session, "/big.bin", &data).await?;
    assert_eq!(read_file(&session, "/big.bin").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_unicode_equivalent_paths() -> Result<()> {
    let session = session();

    // precomposed é on write, e + combining acute on read
    write_file(&session, "/caf\u{e9}.txt", b"espresso").await?;
    assert_eq!(read_file(&session, "/cafe\u{301}.txt").await?, b"espresso");
    assert_eq!(names(&session, "/").await?, vec!["caf\u{e9}.txt"]);
    Ok(())
}

#[tokio::test]
async fn test_forward_only_reads() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/digits", "0123456789");
    let session = session_with(backend, "{}")?;

    let fh = session.open_read(&key("/digits")).await?;
    assert_eq!(&session.read(fh, 0, 4).await?[..], b"0123");
    // skipping ahead works, going back cannot
    assert_eq!(&session.read(fh, 8, 4).await?[..], b"89");
    assert!(matches!(
        session.read(fh, 0, 4).await,
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(session.read(fh, 10, 4).await?.is_empty());
    assert!(matches!(
        session.write(fh, 0, b"x").await,
        Err(BridgeError::NotWritable)
    ));
    session.release(fh).await?;

    let backend = MemoryBackend::seekable();
    backend.insert_file("/digits", "0123456789");
    let session = session_with(backend, "{}")?;
    let fh = session.open_read(&key("/digits")).await?;
    assert_eq!(&session.read(fh, 6, 4).await?[..], b"6789");
    assert_eq!(&session.read(fh, 0, 4).await?[..], b"0123");
    session.release(fh).await?;
    Ok(())
}

#[tokio::test]
async fn test_handle_errors() -> Result<()> {
    let session = session();

    assert!(matches!(
        session.read(999, 0, 1).await,
        Err(BridgeError::BadHandle(999))
    ));
    assert!(matches!(
        session.release(999).await,
        Err(BridgeError::BadHandle(999))
    ));

    session.mkdir(&key("/dir")).await?;
    assert!(matches!(
        session.open_read(&key("/dir")).await,
        Err(BridgeError::IsADirectory(_))
    ));
    assert!(matches!(
        session.open_write(&key("/missing/f")).await,
        Err(BridgeError::NotFound(_))
    ));
    // a failed open does not leave the path marked as uploading
    assert!(!session.uploads().is_uploading(&key("/missing/f")));

    let fh = session.open_write(&key("/t")).await?;
    session.write(fh, 0, b"0123456789").await?;
    session.truncate(fh, 4).await?;
    assert_eq!(session.handle_size(fh).await?, 4);
    session.release(fh).await?;
    assert!(matches!(
        session.release(fh).await,
        Err(BridgeError::BadHandle(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_rename_and_remove_wait_for_uploads_below() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/a/x/keep", "k");
    backend.insert_file("/b/other", "o");
    let session = session_with(backend, "{}")?;

    let fh = session.open_write(&key("/a/x/f")).await?;
    session.write(fh, 0, b"payload").await?;

    match session.rename(&key("/a/x"), &key("/b/x")).await {
        Err(BridgeError::Busy(path)) => assert_eq!(path, "/a/x"),
        other => panic!("expected Busy on the source, got {:?}", other),
    }
    assert!(matches!(
        session.remove(&key("/a/x")).await,
        Err(BridgeError::Busy(_))
    ));

    // an upload on the target is reported against the target
    let target_fh = session.open_write(&key("/b/other")).await?;
    session.write(target_fh, 0, b"new").await?;
    match session.rename(&key("/a/x/keep"), &key("/b/other")).await {
        Err(BridgeError::Busy(path)) => assert_eq!(path, "/b/other"),
        other => panic!("expected Busy on the target, got {:?}", other),
    }

    session.release(fh).await?;
    session.release(target_fh).await?;
    assert_eq!(read_file(&session, "/a/x/f").await?, b"payload");

    session.rename(&key("/a/x"), &key("/b/x")).await?;
    assert_eq!(read_file(&session, "/b/x/f").await?, b"payload");
    assert!(session.get_entry(&key("/a/x/f")).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_buffered_mode_uploads_on_release() -> Result<()> {
    let session = session_with(MemoryBackend::new(), "upload:\n  mode: buffered\n")?;
    let path = key("/buffered.txt");

    let fh = session.open_write(&path).await?;
    session.write(fh, 0, b"held in ").await?;
    session.write(fh, 8, b"memory").await?;
    assert!(session.backend().contents("/buffered.txt").is_none());
    assert!(session.uploads().is_uploading(&path));

    session.release(fh).await?;
    assert!(session.uploads().is_empty());
    assert_eq!(read_file(&session, "/buffered.txt").await?, b"held in memory");

    write_file(&session, "/empty", b"").await?;
    assert_eq!(session.get_entry(&key("/empty")).await?.size(), 0);

    let data = pattern_bytes(300 * 1024);
    write_file(&session, "/big.bin", &data).await?;
    assert_eq!(read_file(&session, "/big.bin").await?, data);
    Ok(())
}

#[tokio::test]
async fn test_buffered_mode_failure_keeps_previous_metadata() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.insert_file("/keep", "old");
    let session = session_with(backend, "upload:\n  mode: buffered\n")?;

    let before = session.get_entry(&key("/keep")).await?;
    session.backend().set_fail_uploads(true);
    let err = write_file(&session, "/keep", b"replacement").await.unwrap_err();
    assert!(matches!(bridge_error(&err), Some(BridgeError::Backend(_))));

    assert!(session.uploads().is_empty());
    assert_eq!(session.get_entry(&key("/keep")).await?, before);
    Ok(())
}
