// tests/integration/objects_test.rs

//! Tests of the object store and the multi-object wait primitive:
//! reference counting, one-shot transitions, nested-id cycles, and
//! threshold waits with timeouts.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratus::core::errors::{Status, StatusCode, StratusError};
use stratus::core::objects::{MemoryBlobStore, ObjectStore, WaitManager};

fn new_store() -> Arc<ObjectStore> {
    Arc::new(
        ObjectStore::new(Arc::new(WaitManager::new()))
            .with_blob_store(Arc::new(MemoryBlobStore::new())),
    )
}

#[tokio::test]
async fn test_return_object_starts_unready_and_settles_once() {
    let store = new_store();
    store.add_return_object("obj-1").unwrap();
    assert!(!store.is_ready("obj-1"));

    store
        .put("obj-1", Bytes::from("payload"), HashSet::new(), false)
        .await
        .unwrap();
    assert!(store.set_ready("obj-1"));
    // The second transition is a no-op.
    assert!(!store.set_ready("obj-1"));

    let data = store.get("obj-1", 1000).await.unwrap();
    assert_eq!(data, Bytes::from("payload"));
}

#[tokio::test]
async fn test_set_error_sticks_even_if_data_appears() {
    let store = new_store();
    store.add_return_object("obj-1").unwrap();
    store.set_error("obj-1", Status::new(StatusCode::UserFunctionException, "boom"));

    // Later data and a late set_ready change nothing.
    store
        .put("obj-1", Bytes::from("late"), HashSet::new(), false)
        .await
        .unwrap();
    assert!(!store.set_ready("obj-1"));

    let err = store.get("obj-1", 100).await.unwrap_err();
    assert_eq!(err.code, StatusCode::UserFunctionException);
}

#[tokio::test]
async fn test_put_without_ownership_fails() {
    let store = new_store();
    let err = store
        .put("orphan", Bytes::from("x"), HashSet::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::ZeroReference(_)));
}

#[tokio::test]
async fn test_circular_nested_set_rejected() {
    let store = new_store();
    store.increase_global_reference(&["a".to_string(), "b".to_string()]);

    // Direct self-inclusion.
    let direct = store
        .put(
            "a",
            Bytes::from("x"),
            HashSet::from(["a".to_string()]),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(direct, StratusError::CircularNestedRef(_)));

    // Transitive: b nests a, then a may not nest b.
    store
        .put(
            "b",
            Bytes::from("y"),
            HashSet::from(["a".to_string()]),
            false,
        )
        .await
        .unwrap();
    let transitive = store
        .put(
            "a",
            Bytes::from("x"),
            HashSet::from(["b".to_string()]),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(transitive, StratusError::CircularNestedRef(_)));
}

#[tokio::test]
async fn test_reference_counting_drops_at_zero_and_releases_nested() {
    let store = new_store();
    let parent = "parent".to_string();
    let child = "child".to_string();
    store.increase_global_reference(&[parent.clone(), child.clone()]);
    store
        .put(
            &parent,
            Bytes::from("p"),
            HashSet::from([child.clone()]),
            false,
        )
        .await
        .unwrap();

    assert_eq!(store.query_global_reference(&[parent.clone()]), vec![1]);
    let removed = store.decrease_global_reference(&[parent.clone()]);
    // The parent's last reference also releases its nested child.
    assert!(removed.contains(&parent));
    assert!(removed.contains(&child));
    assert!(!store.contains(&parent));
    assert!(!store.contains(&child));
}

#[tokio::test]
async fn test_remote_reference_bulk_release() {
    let store = new_store();
    let ids = vec!["r1".to_string(), "r2".to_string()];
    store.increase_global_reference_remote(&ids, "peer-7");
    assert_eq!(store.query_global_reference(&ids), vec![1, 1]);

    let removed = store.decrease_references_of_remote("peer-7");
    assert_eq!(removed.len(), 2);
    assert_eq!(store.query_global_reference(&ids), vec![0, 0]);
}

#[tokio::test]
async fn test_bind_and_unbind_request_scope() {
    let store = new_store();
    store.add_return_object("a").unwrap();
    store.add_return_object("b").unwrap();
    store.bind_obj_ref_in_req("req-1", &["a".to_string(), "b".to_string()]);

    let bound = store.unbind_obj_ref_in_req("req-1");
    assert_eq!(bound.len(), 2);
    // A second unbind finds nothing.
    assert!(store.unbind_obj_ref_in_req("req-1").is_empty());
}

#[tokio::test]
async fn test_wait_min_ready_threshold() {
    let store = new_store();
    for id in ["w1", "w2", "w3"] {
        store.add_return_object(id).unwrap();
    }
    let ids: Vec<String> = ["w1", "w2", "w3"].iter().map(|s| s.to_string()).collect();

    let waiter = {
        let store = store.clone();
        let ids = ids.clone();
        tokio::spawn(async move { store.wait(&ids, 2, 5000).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .put("w1", Bytes::from("1"), HashSet::new(), false)
        .await
        .unwrap();
    store.set_ready("w1");
    // An error counts toward the threshold too.
    store.set_error("w2", Status::new(StatusCode::UserFunctionException, "bad"));

    let result = waiter.await.unwrap();
    assert_eq!(result.ready, vec!["w1".to_string()]);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors.contains_key("w2"));
    assert_eq!(result.unready, vec!["w3".to_string()]);
}

#[tokio::test]
async fn test_wait_timeout_returns_partial_result() {
    let store = new_store();
    store.add_return_object("slow").unwrap();
    let ids = vec!["slow".to_string()];

    let start = Instant::now();
    let result = store.wait(&ids, 1, 200).await;
    let elapsed = start.elapsed();

    assert!(result.ready.is_empty());
    assert_eq!(result.unready, vec!["slow".to_string()]);
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn test_check_signals_aborts_waits() {
    let store = new_store();
    store.add_return_object("never").unwrap();
    store.wait_manager().set_check_signals(Box::new(|| {
        Status::new(StatusCode::Finalized, "shutting down")
    }));

    let result = store.wait(&["never".to_string()], 1, 10_000).await;
    let status = result.errors.get("never").unwrap();
    assert_eq!(status.code, StatusCode::Finalized);
}

#[tokio::test]
async fn test_blob_promotion_is_idempotent_and_preserves_id() {
    let store = new_store();
    store.increase_global_reference(&["blob-1".to_string()]);
    store
        .put("blob-1", Bytes::from("data"), HashSet::new(), true)
        .await
        .unwrap();
    // A second promotion is a no-op.
    store
        .put("blob-1", Bytes::from("data"), HashSet::new(), true)
        .await
        .unwrap();
    let data = store.get("blob-1", 1000).await.unwrap();
    assert_eq!(data, Bytes::from("data"));
}

#[tokio::test]
async fn test_instance_ids_travel_with_readiness() {
    let store = new_store();
    store.add_return_object("handle").unwrap();

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_instance_ids("handle", 5000).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    store.set_instance_ids("handle", vec!["inst-1".to_string()]);
    store.set_ready("handle");

    let ids = waiter.await.unwrap().unwrap();
    assert_eq!(ids, vec!["inst-1".to_string()]);
}
