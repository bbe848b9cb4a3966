use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::runtime::context::TokenContext;
use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::service::{ContextCriteria, TaskCriteria, TokenContextService};
use crate::task::{TaskStatus, WorkflowTask};

/// 瞬态上下文服务 (Transient Token Context Service)
/// 纯内存 map，无持久化；事务边界全部为 no-op
///
/// The executable query needs no merge step: there is only one
/// process-local store, so its semantics are equivalent to the persistent
/// backend's NONE isolation.
pub struct TransientTokenContextService {
    config: Arc<EngineConfig>,
    contexts: DashMap<Uuid, Arc<TokenContext>>,
    tasks: DashMap<Uuid, WorkflowTask>,
}

impl TransientTokenContextService {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            contexts: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

#[async_trait]
impl TokenContextService for TransientTokenContextService {
    async fn begin(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn commit(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_context(&self) -> Result<Arc<TokenContext>, EngineError> {
        Ok(Arc::new(TokenContext::new(Uuid::new_v4(), &self.config)))
    }

    async fn add_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        self.contexts.insert(ctx.id(), ctx.clone());
        Ok(())
    }

    async fn save_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        // The map holds the live aggregate, so saving is an idempotent insert.
        self.contexts.insert(ctx.id(), ctx.clone());
        Ok(())
    }

    async fn delete_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        self.contexts.remove(&ctx.id());
        Ok(())
    }

    async fn evict_context(&self, ctx: &Arc<TokenContext>) -> Result<(), EngineError> {
        // No persistent layer behind this backend: evicting equals removal.
        self.contexts.remove(&ctx.id());
        Ok(())
    }

    async fn get_context_by_id(&self, id: Uuid) -> Result<Option<Arc<TokenContext>>, EngineError> {
        Ok(self.contexts.get(&id).map(|e| e.value().clone()))
    }

    async fn get_contexts(
        &self,
        criteria: &ContextCriteria,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError> {
        let mut matches: Vec<Arc<TokenContext>> = self
            .contexts
            .iter()
            .filter(|e| criteria.matches_context(e.value()))
            .map(|e| e.value().clone())
            .collect();
        if criteria.order_by_priority {
            matches.sort_by_key(|c| c.priority());
        }
        if max_results > 0 && matches.len() > max_results {
            matches.truncate(max_results);
        }
        Ok(matches)
    }

    async fn get_executable_contexts(
        &self,
        max_results: usize,
    ) -> Result<Vec<Arc<TokenContext>>, EngineError> {
        let criteria = ContextCriteria::executable(max_results);
        self.get_contexts(&criteria, max_results).await
    }

    async fn change_context_state(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        to_request: LifecycleRequest,
        node_id: Option<&str>,
    ) -> Result<u64, EngineError> {
        let mut count = 0u64;
        for entry in self.contexts.iter() {
            let ctx = entry.value();
            if ctx.state() != from {
                continue;
            }
            if let Some(node) = node_id {
                if ctx.node_id().as_deref() != Some(node) {
                    continue;
                }
            }
            ctx.restore_lifecycle(to, to_request);
            ctx.set_node_id(None);
            count += 1;
        }
        Ok(count)
    }

    async fn create_task(&self, name: &str) -> Result<WorkflowTask, EngineError> {
        Ok(WorkflowTask::new(Uuid::new_v4(), name))
    }

    async fn add_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn save_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        if task.status == TaskStatus::Completed && task.delete_on_completion {
            self.tasks.remove(&task.id);
        } else {
            self.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn delete_task(&self, task: &WorkflowTask) -> Result<(), EngineError> {
        self.tasks.remove(&task.id);
        Ok(())
    }

    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<WorkflowTask>, EngineError> {
        Ok(self.tasks.get(&id).map(|e| e.value().clone()))
    }

    async fn get_tasks(
        &self,
        criteria: &TaskCriteria,
        max_results: usize,
    ) -> Result<Vec<WorkflowTask>, EngineError> {
        let mut matches: Vec<WorkflowTask> = self
            .tasks
            .iter()
            .filter(|e| criteria.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        if criteria.order_by_priority {
            matches.sort_by_key(|t| t.priority);
        }
        if max_results > 0 && matches.len() > max_results {
            matches.truncate(max_results);
        }
        Ok(matches)
    }
}
