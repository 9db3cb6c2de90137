#[cfg(test)]
mod tests {
    use crate::drive_fs::{DriveFs, DriveFsConfig};
    use crate::file_writer::WriteMode;
    use crate::lock_mgr::{LockDepth, LockMgr, LockMgrConfig, LockRequest};
    use drive_lib::{
        DriveError, DrivePath, MemoryObjectStore, NodeKind, ObjectStore, RetryPolicy,
        RetryingStore,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn create_test_fs() -> (DriveFs, Arc<MemoryObjectStore>) {
        let mem = Arc::new(MemoryObjectStore::new());
        let fs = DriveFs::new(mem.clone(), DriveFsConfig::default());
        (fs, mem)
    }

    fn p(s: &str) -> DrivePath {
        DrivePath::parse(s).unwrap()
    }

    async fn write_file(fs: &DriveFs, path: &str, data: &[u8], mode: WriteMode) {
        let mut writer = fs.open_for_write(&p(path), mode).await.unwrap();
        writer.write_chunk(data).unwrap();
        writer.close().await.unwrap();
    }

    async fn read_file(fs: &DriveFs, path: &str) -> Vec<u8> {
        let mut reader = fs.open_for_read(&p(path), None).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    // ==================== Mkdir / Stat Tests ====================

    #[tokio::test]
    async fn test_mkdir_then_stat_is_dir() {
        let (fs, _mem) = create_test_fs();
        for path in ["/a", "/a/b", "/a/b/c", "/other"] {
            fs.mkdir(&p(path)).await.unwrap();
            let node = fs.stat(&p(path)).await.unwrap();
            assert_eq!(node.kind, NodeKind::Dir);
        }
    }

    #[tokio::test]
    async fn test_mkdir_existing_and_missing_parent() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/a")).await.unwrap();
        assert!(matches!(
            fs.mkdir(&p("/a")).await,
            Err(DriveError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.mkdir(&DrivePath::root()).await,
            Err(DriveError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.mkdir(&p("/missing/x")).await,
            Err(DriveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_under_file_is_not_a_directory() {
        let (fs, _mem) = create_test_fs();
        write_file(&fs, "/f", b"x", WriteMode::CreateOrTruncate).await;
        assert!(matches!(
            fs.mkdir(&p("/f/sub")).await,
            Err(DriveError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_stat_reconciles_remote_size() {
        let (fs, mem) = create_test_fs();
        write_file(&fs, "/f", b"one", WriteMode::CreateOrTruncate).await;
        let node = fs.stat(&p("/f")).await.unwrap();
        assert_eq!(node.size, 3);

        // Another client rewrites the object directly.
        mem.upload_content(&node.id, bytes::Bytes::from_static(b"longer"))
            .await
            .unwrap();
        let node = fs.stat(&p("/f")).await.unwrap();
        assert_eq!(node.size, 6);
    }

    #[tokio::test]
    async fn test_stat_after_remote_delete_is_not_found() {
        let (fs, mem) = create_test_fs();
        write_file(&fs, "/f", b"x", WriteMode::CreateOrTruncate).await;
        let node = fs.stat(&p("/f")).await.unwrap();
        mem.delete_object(&node.id).await.unwrap();
        assert!(fs.stat(&p("/f")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stat_root() {
        let (fs, mem) = create_test_fs();
        let root = fs.stat(&DrivePath::root()).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(root.id, mem.root_id());
    }

    // ==================== Read / Write Tests ====================

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (fs, _mem) = create_test_fs();
        let payloads: [&[u8]; 3] = [b"", b"hello", &[7u8; 4096]];
        for (i, data) in payloads.iter().enumerate() {
            let path = format!("/f{}", i);
            write_file(&fs, &path, data, WriteMode::CreateOrTruncate).await;
            assert_eq!(read_file(&fs, &path).await, data.to_vec());
        }
    }

    #[tokio::test]
    async fn test_truncate_overwrites_in_place() {
        let (fs, mem) = create_test_fs();
        write_file(&fs, "/f", b"first version", WriteMode::CreateOrTruncate).await;
        let before = fs.stat(&p("/f")).await.unwrap();
        write_file(&fs, "/f", b"second", WriteMode::CreateOrTruncate).await;
        let after = fs.stat(&p("/f")).await.unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(after.size, 6);
        assert_eq!(read_file(&fs, "/f").await, b"second".to_vec());
        assert_eq!(mem.object_count(), 2);
    }

    #[tokio::test]
    async fn test_async_write_and_ranged_read() {
        let (fs, _mem) = create_test_fs();
        let mut writer = fs
            .open_for_write(&p("/stream.bin"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_all(b"0123456789").await.unwrap();
        writer.shutdown().await.unwrap();
        writer.close().await.unwrap();

        let mut reader = fs.open_for_read(&p("/stream.bin"), Some(2..5)).await.unwrap();
        assert_eq!(reader.content_length(), 3);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"234".to_vec());
    }

    #[tokio::test]
    async fn test_read_directory_is_error() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/d")).await.unwrap();
        assert!(matches!(
            fs.open_for_read(&p("/d"), None).await,
            Err(DriveError::IsADirectory(_))
        ));
        assert!(matches!(
            fs.open_for_write(&p("/d"), WriteMode::CreateOrTruncate).await,
            Err(DriveError::IsADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_writer_commits_nothing() {
        let (fs, mem) = create_test_fs();
        {
            let mut writer = fs
                .open_for_write(&p("/partial"), WriteMode::CreateExclusive)
                .await
                .unwrap();
            writer.write_chunk(b"half an upload").unwrap();
        }
        assert_eq!(mem.object_count(), 1);
        assert!(fs.stat(&p("/partial")).await.unwrap_err().is_not_found());

        // The exclusive reservation went away with the writer.
        write_file(&fs, "/partial", b"ok", WriteMode::CreateExclusive).await;
    }

    #[tokio::test]
    async fn test_write_over_limit_rejected() {
        let mem = Arc::new(MemoryObjectStore::new());
        let config = DriveFsConfig {
            max_write_size: 4,
            ..Default::default()
        };
        let fs = DriveFs::new(mem, config);
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"1234").unwrap();
        assert!(matches!(
            writer.write_chunk(b"5"),
            Err(DriveError::InvalidParam(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing() {
        let (fs, mem) = create_test_fs();
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"data").unwrap();
        // list (re-check), allocate id, then the create fails.
        mem.inject_failure_after(2, DriveError::PermissionDenied("quota".to_string()));
        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, DriveError::PermissionDenied(_)));
        assert_eq!(mem.object_count(), 1);
        assert!(fs.stat(&p("/f")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_new_file_never_visible_empty() {
        let (fs, mem) = create_test_fs();
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"payload").unwrap();
        let before = mem.call_count();
        let committed = writer.close().await.unwrap();
        // list (re-check), allocate id, create with content: no separate upload.
        assert_eq!(mem.call_count() - before, 3);
        assert_eq!(committed.node.size, 7);
        assert_eq!(
            mem.content_of(&committed.node.id).unwrap(),
            bytes::Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn test_commit_reports_created_or_replaced() {
        let (fs, _mem) = create_test_fs();
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"one").unwrap();
        let first = writer.close().await.unwrap();
        assert!(first.created);

        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"two").unwrap();
        let second = writer.close().await.unwrap();
        assert!(!second.created);
        assert_eq!(second.node.id, first.node.id);
    }

    #[tokio::test]
    async fn test_commit_after_lost_create_reply_makes_one_file() {
        let mem = Arc::new(MemoryObjectStore::new());
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        };
        let store = Arc::new(RetryingStore::new(mem.clone(), policy, 2));
        let fs = DriveFs::new(store, DriveFsConfig::default());
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateOrTruncate)
            .await
            .unwrap();
        writer.write_chunk(b"once").unwrap();
        // list (re-check), allocate id, then the create lands but its reply is lost.
        mem.inject_lost_reply_after(2, DriveError::Transient("connection reset".to_string()));
        let committed = writer.close().await.unwrap();
        assert!(committed.created);

        let children = fs.list_children(&DrivePath::root()).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(mem.object_count(), 2);
        assert_eq!(read_file(&fs, "/f").await, b"once".to_vec());
    }

    // ==================== Exclusive Create Tests ====================

    #[tokio::test]
    async fn test_concurrent_exclusive_create_one_wins() {
        let (fs, _mem) = create_test_fs();
        let open_and_close = |fs: DriveFs, data: &'static [u8]| async move {
            let mut writer = fs
                .open_for_write(&p("/race.txt"), WriteMode::CreateExclusive)
                .await?;
            writer.write_chunk(data)?;
            tokio::task::yield_now().await;
            writer.close().await
        };
        let (a, b) = tokio::join!(
            open_and_close(fs.clone(), b"from a"),
            open_and_close(fs.clone(), b"from b")
        );
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exists = results
            .iter()
            .filter(|r| matches!(r, Err(DriveError::AlreadyExists(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(exists, 1);
        assert_eq!(fs.list_children(&DrivePath::root()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_create_detects_remote_race() {
        let (fs, mem) = create_test_fs();
        let mut writer = fs
            .open_for_write(&p("/f"), WriteMode::CreateExclusive)
            .await
            .unwrap();
        writer.write_chunk(b"local").unwrap();

        // Another client creates the same name before we commit.
        mem.add_object(&mem.root_id(), "f", NodeKind::File)
            .await
            .unwrap();
        assert!(matches!(
            writer.close().await,
            Err(DriveError::AlreadyExists(_))
        ));
        assert_eq!(mem.object_count(), 2);
    }

    #[tokio::test]
    async fn test_exclusive_create_on_existing_fails() {
        let (fs, _mem) = create_test_fs();
        write_file(&fs, "/f", b"x", WriteMode::CreateOrTruncate).await;
        assert!(matches!(
            fs.open_for_write(&p("/f"), WriteMode::CreateExclusive).await,
            Err(DriveError::AlreadyExists(_))
        ));
    }

    // ==================== Remove Tests ====================

    #[tokio::test]
    async fn test_remove_non_empty_dir() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/d")).await.unwrap();
        write_file(&fs, "/d/a", b"a", WriteMode::CreateOrTruncate).await;
        write_file(&fs, "/d/b", b"b", WriteMode::CreateOrTruncate).await;

        assert!(matches!(
            fs.remove(&p("/d")).await,
            Err(DriveError::DirectoryNotEmpty(_))
        ));
        fs.remove(&p("/d/a")).await.unwrap();
        assert!(matches!(
            fs.remove(&p("/d")).await,
            Err(DriveError::DirectoryNotEmpty(_))
        ));
        fs.remove(&p("/d/b")).await.unwrap();
        fs.remove(&p("/d")).await.unwrap();
        assert!(fs.stat(&p("/d")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_missing_and_root() {
        let (fs, _mem) = create_test_fs();
        assert!(fs.remove(&p("/nope")).await.unwrap_err().is_not_found());
        assert!(matches!(
            fs.remove(&DrivePath::root()).await,
            Err(DriveError::InvalidParam(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_multi_parent_unlinks_one_path() {
        let (fs, mem) = create_test_fs();
        fs.mkdir(&p("/a")).await.unwrap();
        let b = fs.mkdir(&p("/b")).await.unwrap();
        write_file(&fs, "/a/shared", b"both", WriteMode::CreateOrTruncate).await;
        let node = fs.stat(&p("/a/shared")).await.unwrap();
        mem.add_parent_link(&node.id, &b.id).unwrap();

        fs.remove(&p("/a/shared")).await.unwrap();
        assert!(fs.stat(&p("/a/shared")).await.unwrap_err().is_not_found());
        let listed = fs.list_children(&p("/b")).await.unwrap();
        assert_eq!(listed.len(), 1);
        let still = fs.stat(&p("/b/shared")).await.unwrap();
        assert_eq!(still.id, node.id);
        assert_eq!(read_file(&fs, "/b/shared").await, b"both".to_vec());
    }

    // ==================== Rename Tests ====================

    #[tokio::test]
    async fn test_rename_onto_existing_fails_unchanged() {
        let (fs, _mem) = create_test_fs();
        write_file(&fs, "/a", b"aaa", WriteMode::CreateOrTruncate).await;
        write_file(&fs, "/b", b"bb", WriteMode::CreateOrTruncate).await;
        let a = fs.stat(&p("/a")).await.unwrap();
        let b = fs.stat(&p("/b")).await.unwrap();

        assert!(matches!(
            fs.rename(&p("/a"), &p("/b")).await,
            Err(DriveError::AlreadyExists(_))
        ));
        assert_eq!(fs.stat(&p("/a")).await.unwrap(), a);
        assert_eq!(fs.stat(&p("/b")).await.unwrap(), b);
        assert_eq!(read_file(&fs, "/a").await, b"aaa".to_vec());
        assert_eq!(read_file(&fs, "/b").await, b"bb".to_vec());
    }

    #[tokio::test]
    async fn test_rename_across_directories_keeps_id() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/src")).await.unwrap();
        fs.mkdir(&p("/dst")).await.unwrap();
        fs.mkdir(&p("/src/tree")).await.unwrap();
        write_file(&fs, "/src/tree/leaf", b"leaf", WriteMode::CreateOrTruncate).await;
        let tree = fs.stat(&p("/src/tree")).await.unwrap();

        let moved = fs.rename(&p("/src/tree"), &p("/dst/renamed")).await.unwrap();
        assert_eq!(moved.id, tree.id);
        assert!(fs.stat(&p("/src/tree")).await.unwrap_err().is_not_found());
        assert_eq!(read_file(&fs, "/dst/renamed/leaf").await, b"leaf".to_vec());
        assert!(fs.list_children(&p("/src")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree_and_missing_source() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/d")).await.unwrap();
        assert!(matches!(
            fs.rename(&p("/d"), &p("/d/inner")).await,
            Err(DriveError::InvalidParam(_))
        ));
        assert!(fs
            .rename(&p("/missing"), &p("/x"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            fs.rename(&DrivePath::root(), &p("/x")).await,
            Err(DriveError::InvalidParam(_))
        ));
    }

    #[tokio::test]
    async fn test_check_rename_leaves_destination_alone() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/d")).await.unwrap();
        write_file(&fs, "/d/x", b"keep", WriteMode::CreateOrTruncate).await;
        write_file(&fs, "/y", b"y", WriteMode::CreateOrTruncate).await;

        assert!(matches!(
            fs.check_rename(&p("/d"), &p("/d/x")).await,
            Err(DriveError::InvalidParam(_))
        ));
        assert!(fs
            .check_rename(&p("/missing"), &p("/y"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(fs
            .check_rename(&p("/y"), &p("/nope/y"))
            .await
            .unwrap_err()
            .is_not_found());
        // An occupied destination is the caller's business.
        fs.check_rename(&p("/y"), &p("/d/x")).await.unwrap();
        assert_eq!(read_file(&fs, "/d/x").await, b"keep".to_vec());
    }

    // ==================== Listing Tests ====================

    #[tokio::test]
    async fn test_list_children_of_file_is_not_a_directory() {
        let (fs, _mem) = create_test_fs();
        write_file(&fs, "/f", b"x", WriteMode::CreateOrTruncate).await;
        assert!(matches!(
            fs.list_children(&p("/f")).await,
            Err(DriveError::NotADirectory(_))
        ));
        assert!(fs.list_children(&p("/nope")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_children_sees_remote_changes() {
        let (fs, mem) = create_test_fs();
        let d = fs.mkdir(&p("/d")).await.unwrap();
        assert!(fs.list_children(&p("/d")).await.unwrap().is_empty());
        mem.add_object(&d.id, "remote.txt", NodeKind::File)
            .await
            .unwrap();
        let children = fs.list_children(&p("/d")).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "remote.txt");
    }

    #[tokio::test]
    async fn test_duplicate_names_resolve_to_newest() {
        let (fs, mem) = create_test_fs();
        let root = mem.root_id();
        let old = mem.add_object(&root, "dup", NodeKind::File).await.unwrap();
        let new = mem.add_object(&root, "dup", NodeKind::File).await.unwrap();
        mem.upload_content(&old.id, bytes::Bytes::from_static(b"old"))
            .await
            .unwrap();
        mem.upload_content(&new.id, bytes::Bytes::from_static(b"newest"))
            .await
            .unwrap();

        let children = fs.list_children(&DrivePath::root()).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, new.id);
        assert_eq!(read_file(&fs, "/dup").await, b"newest".to_vec());
    }

    // ==================== Retry Tests ====================

    #[tokio::test]
    async fn test_transient_failures_retried_through_fs() {
        let mem = Arc::new(MemoryObjectStore::new());
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
        };
        let store = Arc::new(RetryingStore::new(mem.clone(), policy, 2));
        let fs = DriveFs::new(store, DriveFsConfig::default());

        mem.inject_failure(DriveError::Transient("rate limited".to_string()));
        mem.inject_failure(DriveError::Transient("backend error".to_string()));
        fs.mkdir(&p("/docs")).await.unwrap();
        assert!(fs.stat(&p("/docs")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_not_found() {
        let (fs, mem) = create_test_fs();
        mem.inject_failure(DriveError::PermissionDenied("revoked".to_string()));
        assert!(matches!(
            fs.stat(&p("/docs")).await,
            Err(DriveError::PermissionDenied(_))
        ));
    }

    // ==================== Scenario ====================

    #[tokio::test]
    async fn test_docs_scenario() {
        let (fs, _mem) = create_test_fs();
        fs.mkdir(&p("/docs")).await.unwrap();
        write_file(&fs, "/docs/a.txt", b"hello", WriteMode::CreateExclusive).await;

        let a = fs.stat(&p("/docs/a.txt")).await.unwrap();
        assert_eq!(a.size, 5);
        let children = fs.list_children(&p("/docs")).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "a.txt");

        fs.rename(&p("/docs/a.txt"), &p("/docs/b.txt")).await.unwrap();
        assert!(fs.stat(&p("/docs/a.txt")).await.unwrap_err().is_not_found());
        let b = fs.stat(&p("/docs/b.txt")).await.unwrap();
        assert_eq!(b.size, 5);
        assert_eq!(b.id, a.id);
    }

    #[tokio::test]
    async fn test_locks_follow_rename() {
        let (fs, _mem) = create_test_fs();
        let locks = LockMgr::new(LockMgrConfig::default());
        fs.mkdir(&p("/docs")).await.unwrap();
        write_file(&fs, "/docs/a.txt", b"hello", WriteMode::CreateExclusive).await;
        let lock = locks
            .create_lock(
                &p("/docs/a.txt"),
                LockRequest::exclusive(LockDepth::Zero),
                Some(Duration::from_secs(60)),
            )
            .unwrap();

        fs.rename(&p("/docs/a.txt"), &p("/docs/b.txt")).await.unwrap();
        locks.move_locks(&p("/docs/a.txt"), &p("/docs/b.txt"));
        assert!(locks.confirm_lock(&p("/docs/b.txt"), &lock.token).is_ok());
        assert!(locks
            .create_lock(&p("/docs/a.txt"), LockRequest::exclusive(LockDepth::Zero), None)
            .is_ok());
    }
}
