//! Cross-module metadata store tests: migrations, clean-shutdown tracking,
//! and the item tree, which touch more than one submodule at once.

use super::items::{NewFileDescriptor, NewItem};
use super::Database;
use crate::types::{RarInnerRange, RarPart, SegmentRef};
use sqlx::sqlite::SqlitePoolOptions;

async fn test_db() -> Database {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Database::from_pool(pool).await.unwrap()
}

#[tokio::test]
async fn fresh_database_reports_unclean_start_until_marked() {
    let db = test_db().await;
    assert!(!db.was_clean_shutdown().await.unwrap());
    db.set_clean_shutdown().await.unwrap();
    assert!(db.was_clean_shutdown().await.unwrap());
}

#[tokio::test]
async fn opening_new_on_disk_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    let db = Database::new(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}

#[tokio::test]
async fn insert_item_tree_round_trips_every_descriptor_kind() {
    let db = test_db().await;

    let dir_id = uuid::Uuid::new_v4();
    let nzb_id = uuid::Uuid::new_v4();
    let rar_id = uuid::Uuid::new_v4();
    let multipart_id = uuid::Uuid::new_v4();

    let items = vec![
        NewItem {
            id: dir_id,
            parent_id: None,
            name: "Movie.2024".into(),
            path: "/Movie.2024".into(),
            file_size: None,
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: NewFileDescriptor::Directory,
        },
        NewItem {
            id: nzb_id,
            parent_id: Some(dir_id),
            name: "sample.nfo".into(),
            path: "/Movie.2024/sample.nfo".into(),
            file_size: Some(1024),
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: NewFileDescriptor::Nzb(vec![SegmentRef {
                message_id: "<seg1@example>".into(),
                size: 1024,
            }]),
        },
        NewItem {
            id: rar_id,
            parent_id: Some(dir_id),
            name: "movie.mkv".into(),
            path: "/Movie.2024/movie.mkv".into(),
            file_size: Some(4_000_000_000),
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: NewFileDescriptor::Rar {
                rar_parts: vec![RarPart {
                    segments: vec![SegmentRef {
                        message_id: "<vol1@example>".into(),
                        size: 2_000_000_000,
                    }],
                }],
                inner_offset_map: vec![RarInnerRange {
                    outer_volume_index: 0,
                    outer_byte_start: 0,
                    outer_byte_end: 2_000_000_000,
                    inner_byte_start: 0,
                    inner_byte_end: 2_000_000_000,
                }],
            },
        },
        NewItem {
            id: multipart_id,
            parent_id: Some(dir_id),
            name: "extras.bin".into(),
            path: "/Movie.2024/extras.bin".into(),
            file_size: Some(2048),
            release_date: chrono::Utc::now(),
            is_corrupted: true,
            corruption_reason: Some("unsupported rar".into()),
            descriptor: NewFileDescriptor::Multipart(vec![RarPart {
                segments: vec![SegmentRef {
                    message_id: "<part1@example>".into(),
                    size: 2048,
                }],
            }]),
        },
    ];

    db.insert_item_tree(&items).await.unwrap();

    let root = db.get_item("/Movie.2024").await.unwrap().unwrap();
    assert_eq!(root.id, dir_id);

    let children = db.list_children(Some(dir_id)).await.unwrap();
    assert_eq!(children.len(), 3);

    let nzb = db.get_nzb_descriptor(nzb_id).await.unwrap().unwrap();
    assert_eq!(nzb.segments.len(), 1);

    let rar = db.get_rar_descriptor(rar_id).await.unwrap().unwrap();
    assert_eq!(rar.rar_parts.len(), 1);
    assert_eq!(rar.inner_offset_map.len(), 1);

    let multipart = db.get_multipart_descriptor(multipart_id).await.unwrap().unwrap();
    assert_eq!(multipart.file_parts.len(), 1);

    let corrupted_item = db.get_item_by_id(multipart_id).await.unwrap().unwrap();
    assert!(corrupted_item.is_corrupted);
    assert_eq!(corrupted_item.corruption_reason.as_deref(), Some("unsupported rar"));
}

#[tokio::test]
async fn deleting_parent_cascades_to_children_and_descriptor() {
    let db = test_db().await;
    let dir_id = uuid::Uuid::new_v4();
    let file_id = uuid::Uuid::new_v4();

    db.insert_item_tree(&[
        NewItem {
            id: dir_id,
            parent_id: None,
            name: "root".into(),
            path: "/root".into(),
            file_size: None,
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: NewFileDescriptor::Directory,
        },
        NewItem {
            id: file_id,
            parent_id: Some(dir_id),
            name: "file.bin".into(),
            path: "/root/file.bin".into(),
            file_size: Some(10),
            release_date: chrono::Utc::now(),
            is_corrupted: false,
            corruption_reason: None,
            descriptor: NewFileDescriptor::Nzb(vec![SegmentRef {
                message_id: "<a@example>".into(),
                size: 10,
            }]),
        },
    ])
    .await
    .unwrap();

    db.delete_item_cascade(dir_id).await.unwrap();

    assert!(db.get_item_by_id(file_id).await.unwrap().is_none());
    assert!(db.get_nzb_descriptor(file_id).await.unwrap().is_none());
}
