// tests/integration/client_test.rs

//! End-to-end tests of the client runtime against a live in-process
//! server: create, invoke, ordered invokes, kill, groups, queries, and
//! finalize.

use super::test_helpers::TestContext;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use stratus::client::adaptor::InvokeAdaptor;
use stratus::client::group::{range_create, FunctionGroup, FunctionGroupOptions};
use stratus::client::spec::{FunctionMeta, InvokeOptions};
use stratus::config::ClientConfig;
use stratus::core::errors::StratusError;
use stratus::core::objects::{ObjectStore, WaitManager};
use stratus::core::ordering::InvokeOrderManager;
use stratus::core::protocol::Arg;
use stratus::core::signal;
use tokio::net::TcpListener;

/// A full server plus one connected adaptor.
struct ClientFixture {
    ctx: TestContext,
    adaptor: Arc<InvokeAdaptor>,
    order_mgr: Arc<InvokeOrderManager>,
}

impl ClientFixture {
    async fn new() -> Self {
        let ctx = TestContext::new().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept_state = ctx.state.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        tokio::spawn(async move {
            stratus::server::connection_loop::run_accept_loop(accept_state, listener, shutdown_rx)
                .await;
        });

        let store = Arc::new(ObjectStore::new(Arc::new(WaitManager::new())));
        let order_mgr = Arc::new(InvokeOrderManager::new());
        let adaptor = InvokeAdaptor::connect(
            &addr,
            "tenant-0",
            ClientConfig::default(),
            store,
            order_mgr.clone(),
        )
        .await
        .expect("failed to connect adaptor");
        ClientFixture {
            ctx,
            adaptor,
            order_mgr,
        }
    }
}

#[tokio::test]
async fn test_create_and_invoke_roundtrip() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let mut opts = InvokeOptions::default();
    opts.resources = stratus::core::resources::Resources::new(100, 100);
    let handle = fx
        .adaptor
        .create_instance(FunctionMeta::new("echo"), Vec::new(), opts.clone())
        .await
        .expect("create must be accepted");

    // The handle settles with the materialized instance id.
    let instance_ids = fx
        .adaptor
        .store()
        .wait_instance_ids(&handle.id, 5000)
        .await
        .expect("instance must materialize");
    assert_eq!(instance_ids.len(), 1);

    // The loopback node echoes inline arguments back.
    let refs = fx
        .adaptor
        .invoke_function(
            &handle,
            FunctionMeta::new("echo"),
            vec![Arg::Inline(Bytes::from("hello"))],
            1,
            InvokeOptions::default(),
        )
        .await
        .expect("invoke must be accepted");
    let payload = fx.adaptor.get(&refs[0], 5000).await.expect("result ready");
    assert_eq!(payload, Bytes::from("hello"));
}

#[tokio::test]
async fn test_invalid_label_fails_synchronously() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let mut opts = InvokeOptions::default();
    opts.labels = vec!["-bad-".to_string()];
    let err = fx
        .adaptor
        .create_instance(FunctionMeta::new("echo"), Vec::new(), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::Parameter(_)));
}

#[tokio::test]
async fn test_concurrency_bounds_are_enforced() {
    let fx = ClientFixture::new().await;
    let mut opts = InvokeOptions::default();
    opts.concurrency = 1001;
    let err = fx
        .adaptor
        .create_instance(FunctionMeta::new("echo"), Vec::new(), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, StratusError::Parameter(_)));
}

#[tokio::test]
async fn test_ordered_invokes_assign_monotonic_sequences() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let mut create_opts = InvokeOptions::default();
    create_opts.need_order = true;
    create_opts.resources = stratus::core::resources::Resources::new(10, 10);
    let handle = fx
        .adaptor
        .create_instance(FunctionMeta::new("counter"), Vec::new(), create_opts)
        .await
        .unwrap();
    fx.adaptor
        .store()
        .wait_instance_ids(&handle.id, 5000)
        .await
        .unwrap();

    let mut invoke_opts = InvokeOptions::default();
    invoke_opts.need_order = true;
    let mut all_refs = Vec::new();
    for _ in 0..3 {
        let refs = fx
            .adaptor
            .invoke_function(
                &handle,
                FunctionMeta::new("counter"),
                vec![Arg::Inline(Bytes::from("x"))],
                1,
                invoke_opts.clone(),
            )
            .await
            .unwrap();
        all_refs.extend(refs);
    }
    // All three complete; the ordering table then shows every sequence
    // settled (create consumed 0, invokes 1..=3).
    for r in &all_refs {
        fx.adaptor.get(r, 5000).await.unwrap();
    }
    let ordering_id = &handle.id;
    let settled = fx
        .ctx
        .wait_until(
            || fx.order_mgr.unfinished_seq(ordering_id) == Some(4),
            Duration::from_secs(2),
        )
        .await;
    // The create's sequence 0 completes when the create notify lands.
    assert!(
        settled,
        "unfinished seq is {:?}",
        fx.order_mgr.unfinished_seq(ordering_id)
    );
}

#[tokio::test]
async fn test_named_instance_query_and_kill() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let mut opts = InvokeOptions::default();
    opts.named_instance = Some("primary".to_string());
    opts.resources = stratus::core::resources::Resources::new(10, 10);
    let handle = fx
        .adaptor
        .create_instance(FunctionMeta::new("svc"), Vec::new(), opts)
        .await
        .unwrap();
    let ids = fx
        .adaptor
        .store()
        .wait_instance_ids(&handle.id, 5000)
        .await
        .unwrap();

    let named = fx.adaptor.query_named_instances().await.unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].named_instance.as_deref(), Some("primary"));

    fx.adaptor
        .kill(&ids[0], signal::KILL_INSTANCE, "")
        .await
        .unwrap();
    let gone = fx
        .ctx
        .wait_until(|| fx.ctx.state.registry.get(&ids[0]).is_none(), Duration::from_secs(2))
        .await;
    assert!(gone);
    // Killing also frees the unit's capacity.
    let units = fx.adaptor.get_resources().await.unwrap();
    assert_eq!(
        units[0].allocatable,
        stratus::core::resources::Resources::new(1000, 1000)
    );
}

#[tokio::test]
async fn test_function_group_create_invoke_terminate() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let group = FunctionGroup::new(
        fx.adaptor.clone(),
        "workers",
        FunctionGroupOptions {
            timeout_ms: 10_000,
            same_lifecycle: true,
            bundle_size: 1,
            group_size: 2,
        },
    );
    let mut opts = InvokeOptions::default();
    opts.resources = stratus::core::resources::Resources::new(100, 100);
    group
        .create(FunctionMeta::new("worker"), Vec::new(), opts)
        .await
        .expect("group create must be accepted");

    let members = group.wait_ready(10_000).await.expect("group must run");
    assert_eq!(members.len(), 2);

    // Fan-out invoke: one return object per member.
    let refs = group
        .invoke_all(
            FunctionMeta::new("worker"),
            vec![Arg::Inline(Bytes::from("task"))],
            1,
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(refs.len(), 2);
    for r in &refs {
        fx.adaptor.get(r, 5000).await.unwrap();
    }

    let status = group.terminate().await;
    assert!(status.is_ok(), "terminate failed: {}", status.message);
}

#[tokio::test]
async fn test_range_create_fans_out_server_side() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let mut opts = InvokeOptions::default();
    opts.resources = stratus::core::resources::Resources::new(50, 50);
    let (group_id, handle) = range_create(
        &fx.adaptor,
        "range",
        3,
        FunctionMeta::new("worker"),
        Vec::new(),
        opts,
        10_000,
        true,
    )
    .await
    .expect("range create must be accepted");
    assert!(!group_id.is_empty());

    let ids = fx
        .adaptor
        .store()
        .wait_instance_ids(&handle.id, 10_000)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_accelerate_returns_queue_handles() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let group = FunctionGroup::new(
        fx.adaptor.clone(),
        "fast",
        FunctionGroupOptions {
            timeout_ms: 10_000,
            same_lifecycle: true,
            bundle_size: 1,
            group_size: 2,
        },
    );
    let mut opts = InvokeOptions::default();
    opts.resources = stratus::core::resources::Resources::new(10, 10);
    group
        .create(FunctionMeta::new("worker"), Vec::new(), opts)
        .await
        .unwrap();
    let handles = group.accelerate().await.unwrap();
    assert_eq!(handles.len(), 2);
    for handle in &handles {
        assert!(handle.starts_with("amq-"));
    }
}

#[tokio::test]
async fn test_finalize_drains_waiters() {
    let fx = ClientFixture::new().await;
    fx.ctx.add_unit("u1", 1000, 1000).await;

    let store = fx.adaptor.store();
    store.add_return_object("never-ready").unwrap();
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait(&["never-ready".to_string()], 1, 30_000).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.adaptor.finalize().await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("finalize must unblock waiters")
        .unwrap();
    assert!(result.errors.contains_key("never-ready"));

    // The adaptor refuses further work.
    let err = fx
        .adaptor
        .create_instance(FunctionMeta::new("late"), Vec::new(), InvokeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, StratusError::Finalized);
}
