// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::TtlMap;

#[tokio::test]
async fn get_returns_live_entries() {
    let map: TtlMap<String> = TtlMap::new();
    map.insert("k", "v".to_owned(), Some(Duration::from_secs(60))).await;
    assert_eq!(map.get("k").await.as_deref(), Some("v"));
}

#[tokio::test]
async fn expired_entries_are_gone() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("k", 1, Some(Duration::from_millis(5))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(map.get("k").await, None);
    assert_eq!(map.len().await, 0);
}

#[tokio::test]
async fn entries_without_ttl_never_expire() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("k", 1, None).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(map.get("k").await, Some(1));
}

#[tokio::test]
async fn insert_nx_is_first_writer_wins() {
    let map: TtlMap<u32> = TtlMap::new();
    assert!(map.insert_nx("k", 1, None).await);
    assert!(!map.insert_nx("k", 2, None).await);
    assert_eq!(map.get("k").await, Some(1));
}

#[tokio::test]
async fn insert_nx_wins_over_expired_entry() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("k", 1, Some(Duration::from_millis(5))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(map.insert_nx("k", 2, None).await);
    assert_eq!(map.get("k").await, Some(2));
}

#[tokio::test]
async fn extend_pushes_deadline_out() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("k", 1, Some(Duration::from_millis(30))).await;
    map.extend("k", Duration::from_secs(60)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(map.get("k").await, Some(1));
}

#[tokio::test]
async fn take_consumes_the_entry() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("k", 1, Some(Duration::from_secs(60))).await;
    assert_eq!(map.take("k").await, Some(1));
    assert_eq!(map.take("k").await, None);
}

#[tokio::test]
async fn sweep_drops_only_expired() {
    let map: TtlMap<u32> = TtlMap::new();
    map.insert("old", 1, Some(Duration::from_millis(5))).await;
    map.insert("new", 2, Some(Duration::from_secs(60))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    map.sweep().await;
    assert_eq!(map.len().await, 1);
    assert_eq!(map.get("new").await, Some(2));
}
