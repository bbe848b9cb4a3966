use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::service::{ContextCriteria, TaskCriteria};
use crate::task::WorkflowTask;

/// Flat storage row for a TokenContext: the lifecycle, routing and owner
/// columns queries filter on, plus the opaque codec payload holding the
/// call stack and persistent parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub child_ids: Vec<Uuid>,
    pub state: LifecycleState,
    pub request: LifecycleRequest,
    pub priority: i32,
    pub queue_type: Option<String>,
    pub node_id: Option<String>,
    pub user_id: Option<String>,
    pub debugger_id: Option<String>,
    /// Qualified name of the current socket.
    pub current_socket: Option<String>,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

/// Storage row for a workflow task. Tasks are flat value types, so the
/// record is the task itself.
pub type TaskRecord = WorkflowTask;

/// 通用对象存储接口 (Object Store)
/// 持久后端消费的外部持久化/查询抽象：按 id 查找、按谓词查询、事务边界
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn begin(&self) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Id allocation for new objects (the createObject step).
    async fn allocate_id(&self) -> Result<Uuid>;

    async fn save_context(&self, record: &ContextRecord) -> Result<()>;
    async fn delete_context(&self, id: Uuid) -> Result<()>;
    /// A vanished id yields Ok(None).
    async fn find_context(&self, id: Uuid) -> Result<Option<ContextRecord>>;
    /// Fresh canonical re-fetch of a candidate pulled from an earlier query
    /// snapshot. Ok(None) when the object was deleted concurrently.
    async fn merge_context(&self, id: Uuid) -> Result<Option<ContextRecord>>;
    /// Drops the record from any store-level cache without deleting it.
    async fn evict(&self, id: Uuid) -> Result<()>;
    async fn query_contexts(&self, criteria: &ContextCriteria) -> Result<Vec<ContextRecord>>;

    /// The direct update statement behind bulk state repair: rewrites state
    /// and request for rows matching `(from[, node_id])` and clears the node
    /// owner. Returns the affected row count.
    async fn update_context_states(
        &self,
        from: LifecycleState,
        node_id: Option<&str>,
        to: LifecycleState,
        to_request: LifecycleRequest,
    ) -> Result<u64>;

    async fn save_task(&self, record: &TaskRecord) -> Result<()>;
    async fn delete_task(&self, id: Uuid) -> Result<()>;
    async fn find_task(&self, id: Uuid) -> Result<Option<TaskRecord>>;
    async fn query_tasks(&self, criteria: &TaskCriteria) -> Result<Vec<TaskRecord>>;
}

/// Applies ordering and the result cap shared by every store
/// implementation that filters in process.
pub(crate) fn finish_context_query(
    mut records: Vec<ContextRecord>,
    criteria: &ContextCriteria,
) -> Vec<ContextRecord> {
    if criteria.order_by_priority {
        records.sort_by_key(|r| r.priority);
    }
    if criteria.max_results > 0 && records.len() > criteria.max_results {
        records.truncate(criteria.max_results);
    }
    records
}

pub(crate) fn finish_task_query(
    mut records: Vec<TaskRecord>,
    criteria: &TaskCriteria,
) -> Vec<TaskRecord> {
    if criteria.order_by_priority {
        records.sort_by_key(|r| r.priority);
    }
    if criteria.max_results > 0 && records.len() > criteria.max_results {
        records.truncate(criteria.max_results);
    }
    records
}

/// In-memory object store: the reference implementation used by tests and
/// embedded deployments. Every operation autocommits; the transaction
/// calls are accepted no-ops.
pub struct MemoryObjectStore {
    contexts: DashMap<Uuid, ContextRecord>,
    tasks: DashMap<Uuid, TaskRecord>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn allocate_id(&self) -> Result<Uuid> {
        Ok(Uuid::new_v4())
    }

    async fn save_context(&self, record: &ContextRecord) -> Result<()> {
        self.contexts.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_context(&self, id: Uuid) -> Result<()> {
        self.contexts.remove(&id);
        Ok(())
    }

    async fn find_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        Ok(self.contexts.get(&id).map(|r| r.value().clone()))
    }

    async fn merge_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        self.find_context(id).await
    }

    async fn evict(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn query_contexts(&self, criteria: &ContextCriteria) -> Result<Vec<ContextRecord>> {
        let records: Vec<ContextRecord> = self
            .contexts
            .iter()
            .filter(|e| criteria.matches_record(e.value()))
            .map(|e| e.value().clone())
            .collect();
        Ok(finish_context_query(records, criteria))
    }

    async fn update_context_states(
        &self,
        from: LifecycleState,
        node_id: Option<&str>,
        to: LifecycleState,
        to_request: LifecycleRequest,
    ) -> Result<u64> {
        let mut count = 0u64;
        for mut entry in self.contexts.iter_mut() {
            let record = entry.value_mut();
            if record.state != from {
                continue;
            }
            if let Some(node) = node_id {
                if record.node_id.as_deref() != Some(node) {
                    continue;
                }
            }
            record.state = to;
            record.request = to_request;
            record.node_id = None;
            count += 1;
        }
        Ok(count)
    }

    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.tasks.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        self.tasks.remove(&id);
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(&id).map(|r| r.value().clone()))
    }

    async fn query_tasks(&self, criteria: &TaskCriteria) -> Result<Vec<TaskRecord>> {
        let records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|e| criteria.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        Ok(finish_task_query(records, criteria))
    }
}
