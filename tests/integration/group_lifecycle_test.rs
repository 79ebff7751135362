// tests/integration/group_lifecycle_test.rs

//! Tests of the instance-group manager: same-lifecycle cascades, group
//! kills, node failure sweeps, and the master catch-up scan.

use super::test_helpers::make_instance;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stratus::core::errors::Status;
use stratus::core::groups::{
    group_key, GroupInfo, GroupManagerActor, GroupManagerHandle, GroupState, NoopScheduleControl,
    Role,
};
use stratus::core::instances::{
    instance_key, ForwardKillRequest, InstanceInfo, InstanceRegistry, InstanceState,
};
use stratus::core::meta::{GetOptions, MemoryMetaStore, MetaStore};
use stratus::core::protocol::{InvokeRequest, NotifyRequest};
use stratus::core::router::NodeRouter;
use stratus::core::scheduler::item::GroupOptions;
use stratus::core::signal::{GROUP_EXIT_SIGNAL, SHUT_DOWN_SIGNAL};

/// Records every kill and clear-group the manager routes.
#[derive(Default)]
struct RecordingRouter {
    kills: Mutex<Vec<(String, ForwardKillRequest)>>,
    cleared_groups: Mutex<Vec<String>>,
}

impl RecordingRouter {
    fn kills_for(&self, instance_id: &str) -> Vec<ForwardKillRequest> {
        self.kills
            .lock()
            .iter()
            .filter(|(_, req)| req.instance_id == instance_id)
            .map(|(_, req)| req.clone())
            .collect()
    }

    fn kill_count(&self) -> usize {
        self.kills.lock().len()
    }
}

#[async_trait]
impl NodeRouter for RecordingRouter {
    async fn resolve_address(&self, node: &str) -> Option<String> {
        Some(node.to_string())
    }

    async fn materialize(&self, _node: &str, _info: &InstanceInfo) -> Status {
        Status::ok()
    }

    async fn forward_invoke(&self, _node: &str, req: InvokeRequest) -> NotifyRequest {
        NotifyRequest {
            request_id: req.request_id,
            ..Default::default()
        }
    }

    async fn forward_kill(&self, node: &str, req: ForwardKillRequest) -> Status {
        self.kills.lock().push((node.to_string(), req));
        Status::ok()
    }

    async fn clear_group(&self, _node: &str, group_id: &str, _request_id: &str) -> Status {
        self.cleared_groups.lock().push(group_id.to_string());
        Status::ok()
    }
}

struct GroupFixture {
    meta: Arc<MemoryMetaStore>,
    router: Arc<RecordingRouter>,
    registry: Arc<InstanceRegistry>,
    handle: GroupManagerHandle,
}

impl GroupFixture {
    async fn new() -> Self {
        let meta = Arc::new(MemoryMetaStore::new());
        let router = Arc::new(RecordingRouter::default());
        let registry = Arc::new(InstanceRegistry::new());
        let handle = GroupManagerActor::spawn(
            meta.clone(),
            router.clone(),
            Arc::new(NoopScheduleControl),
            registry.clone(),
            Duration::from_secs(5),
        )
        .await
        .expect("failed to spawn group manager");
        handle.role_change(Role::Master).await;
        GroupFixture {
            meta,
            router,
            registry,
            handle,
        }
    }

    async fn put_group(&self, group: &GroupInfo) {
        let value = serde_json::to_string(group).unwrap();
        self.meta
            .put(&group_key(&group.group_id), &value, None)
            .await
            .unwrap();
    }

    async fn put_instance(&self, info: &InstanceInfo) {
        self.registry.upsert(info.clone());
        let value = serde_json::to_string(info).unwrap();
        self.meta
            .put(&instance_key(&info.instance_id), &value, None)
            .await
            .unwrap();
    }

    async fn group_record(&self, group_id: &str) -> Option<GroupInfo> {
        let response = self
            .meta
            .get(&group_key(group_id), GetOptions::default())
            .await
            .unwrap();
        response
            .kvs
            .first()
            .and_then(|kv| serde_json::from_str(&kv.value).ok())
    }

    async fn wait_until<F>(&self, mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    /// Polls until the persisted group record reaches the wanted state.
    async fn wait_for_group_state(&self, group_id: &str, wanted: GroupState) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if let Some(record) = self.group_record(group_id).await {
                if record.status == wanted {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

fn running_group(group_id: &str, same_lifecycle: bool) -> GroupInfo {
    GroupInfo {
        group_id: group_id.to_string(),
        owner_node: "node-1".to_string(),
        parent_id: None,
        status: GroupState::Running,
        message: String::new(),
        trace_id: format!("trace-{group_id}"),
        request_id: format!("req-{group_id}"),
        group_options: GroupOptions {
            group_name: group_id.to_string(),
            same_lifecycle,
            timeout_ms: 60_000,
            bundle_size: 1,
            total_size: 3,
            is_range: false,
        },
    }
}

fn member(group_id: &str, instance_id: &str) -> InstanceInfo {
    let mut info = make_instance(instance_id, 1, 10, 10);
    info.state = InstanceState::Running;
    info.owner_node = "node-1".to_string();
    info.group_id = Some(group_id.to_string());
    info
}

#[tokio::test]
async fn test_same_lifecycle_fatal_cascades_to_all_members() {
    let fx = GroupFixture::new().await;
    fx.put_group(&running_group("g", true)).await;
    for id in ["i1", "i2", "i3"] {
        fx.put_instance(&member("g", id)).await;
    }
    assert!(
        fx.wait_until(
            || fx.router.kill_count() == 0,
            Duration::from_millis(100)
        )
        .await
    );

    // i2 dies.
    let mut fatal = member("g", "i2");
    fatal.state = InstanceState::Fatal;
    fatal.exit_code = 137;
    fx.handle.instance_fatal(fatal).await;

    // The group fails with a message citing i2 and the survivors receive
    // GROUP_EXIT_SIGNAL.
    let failed = fx.wait_for_group_state("g", GroupState::Failed).await;
    assert!(failed, "group must transition to FAILED");
    let record = fx.group_record("g").await.unwrap();
    assert!(record.message.contains("i2"));

    let killed = fx
        .wait_until(|| fx.router.kill_count() >= 2, Duration::from_secs(2))
        .await;
    assert!(killed, "surviving members must be signalled");
    for id in ["i1", "i3"] {
        let kills = fx.router.kills_for(id);
        assert_eq!(kills.len(), 1, "{id} must receive exactly one kill");
        assert_eq!(kills[0].signal, GROUP_EXIT_SIGNAL);
    }
    assert!(fx.router.kills_for("i2").is_empty());
}

#[tokio::test]
async fn test_kill_group_shuts_members_down_and_clears_the_record() {
    let fx = GroupFixture::new().await;
    fx.put_group(&running_group("g", true)).await;
    for id in ["i1", "i2"] {
        fx.put_instance(&member("g", id)).await;
    }
    // Let the watch events land before killing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = fx.handle.kill_group("g", "").await;
    assert!(status.is_ok(), "kill group failed: {}", status.message);

    for id in ["i1", "i2"] {
        let kills = fx.router.kills_for(id);
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].signal, SHUT_DOWN_SIGNAL);
    }
    assert_eq!(fx.router.cleared_groups.lock().as_slice(), ["g"]);
    assert!(fx.group_record("g").await.is_none());
}

#[tokio::test]
async fn test_out_of_band_member_delete_fails_same_lifecycle_group() {
    let fx = GroupFixture::new().await;
    fx.put_group(&running_group("g", true)).await;
    for id in ["i1", "i2"] {
        fx.put_instance(&member("g", id)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Someone kills i1 directly, bypassing the group.
    fx.meta.delete(&instance_key("i1")).await.unwrap();

    let failed = fx.wait_for_group_state("g", GroupState::Failed).await;
    assert!(failed, "group must fail when a member is killed separately");
    let record = fx.group_record("g").await.unwrap();
    assert!(record.message.contains("killed separately"));
}

#[tokio::test]
async fn test_lifecycle_decoupled_group_survives_member_delete() {
    let fx = GroupFixture::new().await;
    fx.put_group(&running_group("g", false)).await;
    for id in ["i1", "i2"] {
        fx.put_instance(&member("g", id)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    fx.meta.delete(&instance_key("i1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let record = fx.group_record("g").await.unwrap();
    assert_eq!(record.status, GroupState::Running);
    assert_eq!(fx.router.kill_count(), 0);
}

#[tokio::test]
async fn test_node_abnormal_fails_scheduling_groups() {
    let fx = GroupFixture::new().await;
    let mut scheduling = running_group("g", true);
    scheduling.status = GroupState::Scheduling;
    fx.put_group(&scheduling).await;
    fx.put_instance(&member("g", "i1")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    fx.handle.node_abnormal("node-1").await;

    let failed = fx.wait_for_group_state("g", GroupState::Failed).await;
    assert!(failed);
    let record = fx.group_record("g").await.unwrap();
    assert_eq!(record.owner_node, "group-manager");
    let kills = fx.router.kills_for("i1");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].signal, GROUP_EXIT_SIGNAL);
}

#[tokio::test]
async fn test_master_catch_up_reissues_kills_for_failed_groups() {
    // Build the state while still a slave: a FAILED group with a member
    // that never received its kill (the previous master crashed mid-cascade).
    let meta = Arc::new(MemoryMetaStore::new());
    let router = Arc::new(RecordingRouter::default());
    let registry = Arc::new(InstanceRegistry::new());

    let mut failed = running_group("g", true);
    failed.status = GroupState::Failed;
    failed.message = "previous master died".to_string();
    meta.put(
        &group_key("g"),
        &serde_json::to_string(&failed).unwrap(),
        None,
    )
    .await
    .unwrap();

    let handle = GroupManagerActor::spawn(
        meta.clone(),
        router.clone(),
        Arc::new(NoopScheduleControl),
        registry.clone(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let survivor = member("g", "i1");
    registry.upsert(survivor.clone());
    meta.put(
        &instance_key("i1"),
        &serde_json::to_string(&survivor).unwrap(),
        None,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // As a slave nothing happened yet.
    assert_eq!(router.kill_count(), 0);

    handle.role_change(Role::Master).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline && router.kill_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let kills = router.kills_for("i1");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].signal, GROUP_EXIT_SIGNAL);
}
