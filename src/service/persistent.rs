use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::codec::registry::SerializerRegistry;
use crate::codec::{decode_into_context, encode_context};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::SocketRef;
use crate::runtime::context::TokenContext;
use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::service::store::{ContextRecord, ObjectStore};
use crate::service::{ContextCriteria, IsolationLevel, TaskCriteria, TokenContextService};
use crate::session::SessionRegistry;
use crate::task::{TaskStatus, WorkflowTask};

/// 持久上下文服务 (Persistent Token Context Service)
/// 委托通用对象存储；可执行查询支持三种隔离级别
///
/// Reads consult the session registry overlay first: a live registered
/// instance is canonical for all in-memory fields, so uncommitted progress
/// stays visible and the merge step only re-validates the persisted
/// request column.
pub struct PersistentTokenContextService {
    store: Arc<dyn ObjectStore>,
    serializers: SerializerRegistry,
    config: Arc<EngineConfig>,
    isolation: IsolationLevel,
    session_registry: Option<Arc<SessionRegistry>>,
}

impl PersistentTokenContextService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        serializers: SerializerRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        let isolation = config.isolation;
        Self {
            store,
            serializers,
            config,
            isolation,
            session_registry: None,
        }
    }

    pub fn with_session_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.session_registry = Some(registry);
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn context_to_record(&self, ctx: &TokenContext) -> Result<ContextRecord, EngineError> {
        let payload = encode_context(ctx, &self.serializers)?;
        Ok(ContextRecord {
            id: ctx.id(),
            parent_id: ctx.parent(),
            child_ids: ctx.children(),
            state: ctx.state(),
            request: ctx.request(),
            priority: ctx.priority(),
            queue_type: ctx.queue_type(),
            node_id: ctx.node_id(),
            user_id: ctx.user_id(),
            debugger_id: ctx.debugger_id(),
            current_socket: ctx.current_socket().map(|s| s.qualified()),
            payload,
        })
    }

    fn record_to_context(&self, record: ContextRecord) -> Result<Arc<TokenContext>, EngineError> {
        let ctx = TokenContext::new(record.id, &self.config);
        ctx.set_parent(record.parent_id);
        ctx.set_children(record.child_ids);
        ctx.set_priority(record.priority);
        if let Some(qualified) = &record.current_socket {
            let socket = SocketRef::parse_qualified(qualified).ok_or_else(|| {
                EngineError::MalformedPayload(format!("unparseable socket name '{}'", qualified))
            })?;
            ctx.set_current_socket(Some(socket));
        }
        ctx.set_queue_type(record.queue_type);
        ctx.set_node_id(record.node_id);
        ctx.set_user_id(record.user_id);
        ctx.set_debugger_id(record.debugger_id);
        ctx.restore_lifecycle(record.state, record.request);
        decode_into_context(&ctx, &record.payload, &self.serializers)?;
        Ok(Arc::new(ctx))
    }

    /// A session-registered live instance wins over the stored record.
    fn materialize(&self, record: ContextRecord) -> Result<Arc<TokenContext>, EngineError> {
        if let Some(registry) = &self.session_registry {
            if let Some(live) = registry.find_by_context_id(record.id) {
                return Ok(live);
            }
        }
        self.record_to_context(record)
    }
}

#[async_trait]
impl TokenContextService for PersistentTokenContextService {
    async fn begin(&self) -> Result<(), EngineError> {
        Ok(self.store.begin().await?)
    }

    async fn flush(&self) -> Result<(), EngineError> {
        Ok(self.store.flush().await?)
    }

    async fn commit(&self) -> Result<(), EngineError> {
        Ok(self.store.commit().await?)
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        Ok(self.store.rollback().await?)
    }

    async fn create_context(&self) -> Result<Arc<TokenContext>, EngineError> {
        let id = self.store.allocate_id().await?;
        Ok(Arc::new(TokenContext::new(id, &self.config)))
    }

    async fn add_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        let record = self.context_to_record(ctx)?;
        Ok(self.store.save_context(&record).await?)
    }

    async fn save_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        // The byte payload is regenerated before every save; the live call
        // stack and parameter map stay the source of truth in memory.
        let record = self.context_to_record(ctx)?;
        Ok(self.store.save_context(&record).await?)
    }

    async fn delete_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        if let Some(registry) = &self.session_registry {
            registry.unregister_context(ctx.id());
        }
        Ok(self.store.delete_context(ctx.id()).await?)
    }

    async fn evict_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        if let Some(registry) = &self.session_registry {
            registry.unregister_context(ctx.id());
        }
        Ok(self.store.evict(ctx.id()).await?)
    }

    async fn get_context_by_id(&self, id: Uuid) -> Result<Option<Arc<TokenContext>>, EngineError> {
        if let Some(registry) = &self.session_registry {
            if let Some(live) = registry.find_by_context_id(id) {
                return Ok(Some(live));
            }
        }
        match self.store.find_context(id).await? {
            Some(record) => Ok(Some(self.record_to_context(record)?)),
            None => Ok(None),
        }
    }

    async fn get_contexts(
        &self,
        criteria: &ContextCriteria,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError> {
        let mut criteria = criteria.clone();
        criteria.max_results = max_results;
        let records = self.store.query_contexts(&criteria).await?;
        let mut contexts = Vec::with_capacity(records.len());
        for record in records {
            contexts.push(self.materialize(record)?);
        }
        Ok(contexts)
    }

    async fn get_executable_contexts(
        &self,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError> {
        let capped = match self.isolation {
            IsolationLevel::Single => 1,
            _ => max_results,
        };
        let criteria = ContextCriteria::executable(capped);
        let records = self.store.query_contexts(&criteria).await?;

        let mut contexts = Vec::with_capacity(records.len());
        for record in records {
            let record = if self.isolation == IsolationLevel::Merge {
                // Re-fetch each candidate so a context claimed or deleted by
                // a concurrent worker after the snapshot is skipped, never
                // handed out twice. Skip-and-continue: the scan never aborts.
                match self.store.merge_context(record.id).await? {
                    None => {
                        debug!(context_id = %record.id, "candidate vanished during scan, skipping");
                        continue;
                    }
                    Some(merged) if merged.request != LifecycleRequest::Resume => {
                        debug!(context_id = %record.id, "candidate no longer resumable, skipping");
                        continue;
                    }
                    Some(merged) => merged,
                }
            } else {
                record
            };
            contexts.push(self.materialize(record)?);
        }
        Ok(contexts)
    }

    async fn change_context_state(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        to_request: LifecycleRequest,
        node_id: Option<&str>,
    ) -> Result<u64, EngineError> {
        Ok(self
            .store
            .update_context_states(from, node_id, to, to_request)
            .await?)
    }

    async fn create_task(&self, name: &str) -> Result<WorkflowTask, EngineError> {
        let id = self.store.allocate_id().await?;
        Ok(WorkflowTask::new(id, name))
    }

    async fn add_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        Ok(self.store.save_task(task).await?)
    }

    async fn save_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        if task.status == TaskStatus::Completed && task.delete_on_completion {
            Ok(self.store.delete_task(task.id).await?)
        } else {
            Ok(self.store.save_task(task).await?)
        }
    }

    async fn delete_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        Ok(self.store.delete_task(task.id).await?)
    }

    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<WorkflowTask>, EngineError> {
        Ok(self.store.find_task(id).await?)
    }

    async fn get_tasks(
        &self,
        criteria: &TaskCriteria,
        max_results: usize,
    ) -> Result<Vec<WorkflowTask>, EngineError> {
        let mut criteria = criteria.clone();
        criteria.max_results = max_results;
        Ok(self.store.query_tasks(&criteria).await?)
    }
}
