use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::SocketRef;
use crate::runtime::context::TokenContext;
use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::service::TokenContextService;

/// Outcome reported by a unit of work at its return point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// The process instance ran to its end.
    Completed,
    /// The unit of work reached a yield point; the worker inspects the
    /// pending lifecycle request to decide how to park the context.
    Yielded,
}

/// 工作单元接口 (Handler)
/// 业务逻辑只通过 TokenContext 的参数接口与引擎交互
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError>;
}

/// 引擎工作者 (Worker)
/// 轮询可执行上下文、认领、执行、按生命周期规则落盘
///
/// Many workers may poll the same service concurrently; the claim
/// test-and-set plus the service's isolation level keep hand-off safe.
pub struct Worker {
    service: Arc<dyn TokenContextService>,
    handler: Arc<dyn Handler>,
    node_id: String,
    poll_interval: Duration,
    batch_size: usize,
}

impl Worker {
    pub fn new(
        service: Arc<dyn TokenContextService>,
        handler: Arc<dyn Handler>,
        node_id: &str,
        config: &EngineConfig,
    ) -> Self {
        Self {
            service,
            handler,
            node_id: node_id.to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Startup crash recovery: contexts this node abandoned as SELECTED or
    /// RUNNING are returned to the claimable pool.
    pub async fn recover(&self) -> Result<u64, EngineError> {
        let selected = self
            .service
            .change_context_state(
                LifecycleState::Selected,
                LifecycleState::Suspended,
                LifecycleRequest::Resume,
                Some(&self.node_id),
            )
            .await?;
        let running = self
            .service
            .change_context_state(
                LifecycleState::Running,
                LifecycleState::Suspended,
                LifecycleRequest::Resume,
                Some(&self.node_id),
            )
            .await?;
        let repaired = selected + running;
        if repaired > 0 {
            info!(node_id = %self.node_id, count = repaired, "recovered abandoned contexts");
        }
        Ok(repaired)
    }

    /// One poll cycle: fetch, claim, execute. Returns how many contexts
    /// this worker executed.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let candidates = self.service.get_executable_contexts(self.batch_size).await?;
        let mut executed = 0usize;
        for ctx in candidates {
            // Another worker may have won the claim race after the query.
            if !ctx.try_claim(&self.node_id) {
                continue;
            }
            self.execute_claimed(&ctx).await;
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute_claimed(&self, ctx: &Arc<TokenContext>) {
        ctx.begin_execution();

        let Some(socket) = ctx.current_socket() else {
            error!(context_id = %ctx.id(), "claimed context has no current socket");
            ctx.fail();
            self.persist(ctx).await;
            return;
        };

        match self.handler.run(ctx, &socket).await {
            Ok(HandlerVerdict::Completed) => ctx.complete(),
            Ok(HandlerVerdict::Yielded) => match ctx.request() {
                r if r.is_suspend() => ctx.apply_suspend(r),
                LifecycleRequest::Stop | LifecycleRequest::Abort => ctx.abort_execution(),
                // No pending request: park suspended until an external
                // actor posts RESUME.
                _ => ctx.apply_suspend(LifecycleRequest::SuspendTransaction),
            },
            Err(EngineError::KilledByController) => {
                info!(context_id = %ctx.id(), "context killed by controller");
                ctx.abort_execution();
            }
            Err(e) => {
                error!(context_id = %ctx.id(), socket = %socket, error = ?e, "unit of work failed");
                ctx.fail();
            }
        }

        self.persist(ctx).await;
    }

    async fn persist(&self, ctx: &Arc<TokenContext>) {
        if let Err(e) = self.service.save_context(ctx).await {
            error!(context_id = %ctx.id(), error = ?e, "failed to save context");
            return;
        }
        if let Err(e) = self.service.commit().await {
            error!(context_id = %ctx.id(), error = ?e, "commit failed");
        }
    }

    /// Poll loop. Ends when the shutdown channel flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(node_id = %self.node_id, "worker started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => info!(node_id = %self.node_id, count = n, "executed contexts"),
                Err(e) => warn!(node_id = %self.node_id, error = ?e, "poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(node_id = %self.node_id, "worker stopped");
    }
}
