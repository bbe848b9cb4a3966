pub mod persistent;
pub mod redis_store;
pub mod store;
pub mod transient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::runtime::context::TokenContext;
use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::task::{TaskStatus, WorkflowTask};

pub use persistent::PersistentTokenContextService;
pub use redis_store::RedisObjectStore;
pub use store::{ContextRecord, MemoryObjectStore, ObjectStore, TaskRecord};
pub use transient::TransientTokenContextService;

/// 可执行上下文查询的隔离级别 (Isolation Level)
/// 决定迭代候选时对并发修改的重新校验力度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Single snapshot query, no re-validation. Cheapest, unsafe with
    /// concurrent workers: duplicate execution is possible and deployments
    /// choosing this accept that risk.
    None,
    /// Re-fetch and re-check each candidate while iterating. The
    /// correctness-preserving default for multi-worker deployments.
    #[default]
    Merge,
    /// Cap the underlying query at exactly one result, for workers that
    /// process strictly one context per poll.
    Single,
}

/// Query-by-predicate criteria for contexts.
#[derive(Debug, Clone, Default)]
pub struct ContextCriteria {
    pub state: Option<LifecycleState>,
    pub state_not: Option<LifecycleState>,
    pub request: Option<LifecycleRequest>,
    pub queue_type: Option<String>,
    pub node_id: Option<String>,
    pub user_id: Option<String>,
    pub parent_id: Option<Uuid>,
    pub debugger_id: Option<String>,
    pub order_by_priority: bool,
    /// 0 = unbounded.
    pub max_results: usize,
}

impl ContextCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// The admission-control predicate: claimable contexts ordered by
    /// ascending priority.
    pub fn executable(max_results: usize) -> Self {
        Self {
            request: Some(LifecycleRequest::Resume),
            state_not: Some(LifecycleState::Selected),
            order_by_priority: true,
            max_results,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_queue_type(mut self, queue_type: &str) -> Self {
        self.queue_type = Some(queue_type.to_string());
        self
    }

    pub fn with_node_id(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn matches_context(&self, ctx: &TokenContext) -> bool {
        if let Some(state) = self.state {
            if ctx.state() != state {
                return false;
            }
        }
        if let Some(state_not) = self.state_not {
            if ctx.state() == state_not {
                return false;
            }
        }
        if let Some(request) = self.request {
            if ctx.request() != request {
                return false;
            }
        }
        if let Some(queue_type) = &self.queue_type {
            if ctx.queue_type().as_deref() != Some(queue_type.as_str()) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if ctx.node_id().as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if ctx.user_id().as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(parent_id) = self.parent_id {
            if ctx.parent() != Some(parent_id) {
                return false;
            }
        }
        if let Some(debugger_id) = &self.debugger_id {
            if ctx.debugger_id().as_deref() != Some(debugger_id.as_str()) {
                return false;
            }
        }
        true
    }

    pub fn matches_record(&self, rec: &ContextRecord) -> bool {
        if let Some(state) = self.state {
            if rec.state != state {
                return false;
            }
        }
        if let Some(state_not) = self.state_not {
            if rec.state == state_not {
                return false;
            }
        }
        if let Some(request) = self.request {
            if rec.request != request {
                return false;
            }
        }
        if let Some(queue_type) = &self.queue_type {
            if rec.queue_type.as_deref() != Some(queue_type.as_str()) {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if rec.node_id.as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if rec.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(parent_id) = self.parent_id {
            if rec.parent_id != Some(parent_id) {
                return false;
            }
        }
        if let Some(debugger_id) = &self.debugger_id {
            if rec.debugger_id.as_deref() != Some(debugger_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Query-by-predicate criteria for workflow tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskCriteria {
    pub context_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub role_id: Option<String>,
    pub user_id: Option<String>,
    pub order_by_priority: bool,
    /// 0 = unbounded.
    pub max_results: usize,
}

impl TaskCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, task: &WorkflowTask) -> bool {
        if let Some(context_id) = self.context_id {
            if task.context_id != Some(context_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(role_id) = &self.role_id {
            if task.role_id.as_deref() != Some(role_id.as_str()) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if task.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// 上下文服务契约 (Token Context Service)
/// 瞬态与持久两种后端实现同一契约
#[async_trait]
pub trait TokenContextService: Send + Sync {
    // Transaction boundaries. No-ops for the transient backend.
    async fn begin(&self) -> Result<(), EngineError>;
    async fn flush(&self) -> Result<(), EngineError>;
    async fn commit(&self) -> Result<(), EngineError>;
    async fn rollback(&self) -> Result<(), EngineError>;

    /// Allocates an id from the backend and builds a fresh context. The
    /// context is not visible to queries until `add_context`.
    async fn create_context(&self) -> Result<Arc<TokenContext>, EngineError>;
    async fn add_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError>;
    async fn save_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError>;
    async fn delete_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError>;
    /// Drops the context from any cache layer without deleting it.
    async fn evict_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError>;

    /// A vanished id yields Ok(None), not an error.
    async fn get_context_by_id(&self, id: Uuid) -> Result<Option<Arc<TokenContext>>, EngineError>;
    async fn get_contexts(
        &self,
        criteria: &ContextCriteria,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError>;

    /// The admission-control query: `request == RESUME && state != SELECTED`,
    /// ascending priority, capped at `max_results` (0 = unbounded).
    async fn get_executable_contexts(
        &self,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError>;

    /// Bulk repair: rewrites all contexts matching `(from[, node_id])` to
    /// `(to, to_request)` and releases their node owner. Returns the number
    /// of contexts changed. Operationally invoked during startup recovery.
    async fn change_context_state(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        to_request: LifecycleRequest,
        node_id: Option<&str>,
    ) -> Result<u64, EngineError>;

    // Workflow tasks: same service/query pattern.
    async fn create_task(&self, name: &str) -> Result<WorkflowTask, EngineError>;
    async fn add_task(&self, task: &WorkflowTask) -> Result<(), EngineError>;
    /// Saving a COMPLETED task with the delete-on-completion policy set
    /// removes it instead.
    async fn save_task(&self, task: &WorkflowTask) -> Result<(), EngineError>;
    async fn delete_task(&self, task: &WorkflowTask) -> Result<(), EngineError>;
    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<WorkflowTask>, EngineError>;
    async fn get_tasks(
        &self,
        criteria: &TaskCriteria,
        max_results: usize,
    ) -> Result<Vec<WorkflowTask>, EngineError>;
}
