use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use prozess::codec::registry::SerializerRegistry;
use prozess::config::EngineConfig;
use prozess::model::SocketRef;
use prozess::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use prozess::runtime::value::ParamValue;
use prozess::service::store::{ContextRecord, TaskRecord};
use prozess::service::{
    ContextCriteria, IsolationLevel, MemoryObjectStore, ObjectStore, PersistentTokenContextService,
    TaskCriteria, TokenContextService,
};
use prozess::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn persistent(store: Arc<dyn ObjectStore>, isolation: IsolationLevel) -> PersistentTokenContextService {
    PersistentTokenContextService::new(
        store,
        SerializerRegistry::with_builtins(),
        Arc::new(EngineConfig::default()),
    )
    .with_isolation(isolation)
}

async fn add_claimable(svc: &PersistentTokenContextService, priority: i32) -> Uuid {
    let ctx = svc.create_context().await.expect("create");
    ctx.set_priority(priority);
    ctx.set_state(LifecycleState::Suspended);
    ctx.set_request(LifecycleRequest::Resume);
    ctx.set_current_socket(Some(SocketRef::new("order", "ship", "in")));
    svc.add_context(&ctx).await.expect("add");
    ctx.id()
}

#[tokio::test]
async fn test_save_and_reload_round_trip() {
    let store = Arc::new(MemoryObjectStore::new());
    let svc = persistent(store, IsolationLevel::Merge);

    let ctx = svc.create_context().await.expect("create");
    ctx.set_priority(3);
    ctx.set_current_socket(Some(SocketRef::new("order", "ship", "done").with_queue("fast")));
    ctx.set_user_id(Some("alice".to_string()));
    ctx.set_state(LifecycleState::Suspended);
    ctx.set_request(LifecycleRequest::Resume);
    ctx.push_subprocess(SocketRef::new("billing", "entry", "in"))
        .expect("push");
    ctx.set_param("order.ship.count", ParamValue::Int(7)).expect("set");
    ctx.set_transient_param("scratch", ParamValue::Int(1));
    svc.add_context(&ctx).await.expect("add");

    let loaded = svc
        .get_context_by_id(ctx.id())
        .await
        .expect("load")
        .expect("present");

    // A fresh aggregate materialized from the record, not the live one.
    assert!(!Arc::ptr_eq(&ctx, &loaded));
    assert_eq!(loaded.priority(), 3);
    assert_eq!(loaded.state(), LifecycleState::Suspended);
    assert_eq!(loaded.request(), LifecycleRequest::Resume);
    assert_eq!(loaded.queue_type().as_deref(), Some("fast"));
    assert_eq!(loaded.user_id().as_deref(), Some("alice"));
    assert_eq!(
        loaded.current_socket().map(|s| s.qualified()).as_deref(),
        Some("order.ship.done")
    );
    assert_eq!(loaded.call_depth(), 1);
    assert_eq!(
        loaded.get_param("order.ship.count").expect("get"),
        Some(ParamValue::Int(7))
    );
    assert!(!loaded.has_param("scratch"), "transient slots do not persist");
}

#[tokio::test]
async fn test_executable_query_orders_and_caps() {
    let store = Arc::new(MemoryObjectStore::new());
    let svc = persistent(store, IsolationLevel::None);

    let slow = add_claimable(&svc, 9).await;
    let fast = add_claimable(&svc, 1).await;
    let mid = add_claimable(&svc, 5).await;

    let all = svc.get_executable_contexts(0).await.expect("query");
    let ids: Vec<Uuid> = all.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![fast, mid, slow]);

    let capped = svc.get_executable_contexts(2).await.expect("query");
    assert_eq!(capped.len(), 2);
}

#[tokio::test]
async fn test_single_isolation_caps_at_one() {
    let store = Arc::new(MemoryObjectStore::new());
    let svc = persistent(store, IsolationLevel::Single);

    add_claimable(&svc, 2).await;
    let first = add_claimable(&svc, 1).await;

    let result = svc.get_executable_contexts(0).await.expect("query");
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].id(), first);
}

/// Store stub simulating concurrent workers racing the scan: candidates can
/// vanish between snapshot and merge, and a RESUME request can be handed to
/// the first merge only. Every later merge sees it already consumed, the
/// way a concurrent worker's claim would leave it.
struct RacingStore {
    inner: MemoryObjectStore,
    consume_after_first_merge: bool,
    merged_once: DashSet<Uuid>,
    vanished: DashSet<Uuid>,
}

impl RacingStore {
    fn new(consume_after_first_merge: bool) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            consume_after_first_merge,
            merged_once: DashSet::new(),
            vanished: DashSet::new(),
        }
    }

    /// The row is still in the query snapshot but gone by merge time.
    fn vanish(&self, id: Uuid) {
        self.vanished.insert(id);
    }
}

#[async_trait]
impl ObjectStore for RacingStore {
    async fn begin(&self) -> Result<()> {
        self.inner.begin().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn allocate_id(&self) -> Result<Uuid> {
        self.inner.allocate_id().await
    }

    async fn save_context(&self, record: &ContextRecord) -> Result<()> {
        self.inner.save_context(record).await
    }

    async fn delete_context(&self, id: Uuid) -> Result<()> {
        self.inner.delete_context(id).await
    }

    async fn find_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        self.inner.find_context(id).await
    }

    async fn merge_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        if self.vanished.contains(&id) {
            return Ok(None);
        }
        let record = self.inner.merge_context(id).await?;
        match record {
            Some(mut record) => {
                if self.consume_after_first_merge && !self.merged_once.insert(id) {
                    // A concurrent worker already claimed this candidate.
                    record.request = LifecycleRequest::None;
                    record.state = LifecycleState::Selected;
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn evict(&self, id: Uuid) -> Result<()> {
        self.inner.evict(id).await
    }

    async fn query_contexts(&self, criteria: &ContextCriteria) -> Result<Vec<ContextRecord>> {
        self.inner.query_contexts(criteria).await
    }

    async fn update_context_states(
        &self,
        from: LifecycleState,
        node_id: Option<&str>,
        to: LifecycleState,
        to_request: LifecycleRequest,
    ) -> Result<u64> {
        self.inner
            .update_context_states(from, node_id, to, to_request)
            .await
    }

    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.inner.save_task(record).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.inner.delete_task(id).await
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        self.inner.find_task(id).await
    }

    async fn query_tasks(&self, criteria: &TaskCriteria) -> Result<Vec<TaskRecord>> {
        self.inner.query_tasks(criteria).await
    }
}

#[tokio::test]
async fn test_merge_isolation_prevents_double_claim() {
    let store = Arc::new(RacingStore::new(true));
    let svc = persistent(store, IsolationLevel::Merge);

    add_claimable(&svc, 1).await;

    // Worker A scans first and keeps the candidate.
    let first = svc.get_executable_contexts(0).await.expect("first scan");
    assert_eq!(first.len(), 1);

    // Worker B's merge re-check sees the request consumed and skips it.
    let second = svc.get_executable_contexts(0).await.expect("second scan");
    assert!(
        second.is_empty(),
        "merge isolation must not hand the same context to two workers"
    );
}

#[tokio::test]
async fn test_merge_skips_concurrently_deleted_candidates() {
    let store = Arc::new(RacingStore::new(false));
    let svc = persistent(store.clone(), IsolationLevel::Merge);

    let doomed = add_claimable(&svc, 1).await;
    let survivor = add_claimable(&svc, 2).await;

    // The delete lands between the query snapshot and the merge re-fetch.
    store.vanish(doomed);

    let result = svc.get_executable_contexts(0).await.expect("scan continues");
    let ids: Vec<Uuid> = result.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![survivor]);
}

#[tokio::test]
async fn test_session_overlay_exposes_uncommitted_progress() {
    let store = Arc::new(MemoryObjectStore::new());
    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    let svc = persistent(store, IsolationLevel::Merge).with_session_registry(sessions.clone());

    let ctx = svc.create_context().await.expect("create");
    ctx.set_state(LifecycleState::Suspended);
    svc.add_context(&ctx).await.expect("add");

    // Live, uncommitted progress in an executing session.
    sessions.register(Uuid::new_v4(), ctx.clone(), None);
    ctx.set_progress(5, 10, Some("halfway".to_string()));

    let read = svc
        .get_context_by_id(ctx.id())
        .await
        .expect("read")
        .expect("present");
    assert!(Arc::ptr_eq(&ctx, &read), "live registered instance is canonical");
    assert_eq!(read.progress().count, 5);

    // Once the session ends, readers fall back to the persisted snapshot,
    // which never saw the progress counters.
    sessions.unregister_context(ctx.id());
    let stale = svc
        .get_context_by_id(ctx.id())
        .await
        .expect("read")
        .expect("present");
    assert!(!Arc::ptr_eq(&ctx, &stale));
    assert_eq!(stale.progress().count, 0);
}

#[tokio::test]
async fn test_bulk_repair_through_the_store() {
    let store = Arc::new(MemoryObjectStore::new());
    let svc = persistent(store, IsolationLevel::Merge);

    for i in 0..4 {
        let ctx = svc.create_context().await.expect("create");
        if i < 2 {
            ctx.set_state(LifecycleState::Running);
            ctx.set_node_id(Some("W1".to_string()));
        } else {
            ctx.set_state(LifecycleState::Completed);
        }
        svc.add_context(&ctx).await.expect("add");
    }

    let changed = svc
        .change_context_state(
            LifecycleState::Running,
            LifecycleState::Suspended,
            LifecycleRequest::Resume,
            Some("W1"),
        )
        .await
        .expect("repair");
    assert_eq!(changed, 2);

    let claimable = svc.get_executable_contexts(0).await.expect("query");
    assert_eq!(claimable.len(), 2);
    for ctx in claimable {
        assert_eq!(ctx.state(), LifecycleState::Suspended);
        assert_eq!(ctx.node_id(), None);
    }
}

#[tokio::test]
async fn test_task_round_trip_and_delete_policy() {
    let store = Arc::new(MemoryObjectStore::new());
    let svc = persistent(store, IsolationLevel::Merge);

    let mut task = svc.create_task("review").await.expect("create");
    task.user_id = Some("bob".to_string());
    task.transition(prozess::task::TaskStatus::Enabled).expect("enable");
    svc.add_task(&task).await.expect("add");

    let loaded = svc.get_task_by_id(task.id).await.expect("get").expect("present");
    assert_eq!(loaded, task);

    task.delete_on_completion = true;
    task.transition(prozess::task::TaskStatus::Resumed).expect("resume");
    task.transition(prozess::task::TaskStatus::Completed).expect("complete");
    svc.save_task(&task).await.expect("save");
    assert!(svc.get_task_by_id(task.id).await.expect("get").is_none());
}
