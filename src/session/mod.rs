use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::ModelResolver;
use crate::runtime::context::TokenContext;
use crate::service::TokenContextService;

struct SessionEntry {
    context: Arc<TokenContext>,
    expires_at: Instant,
}

/// 会话注册表 (Session Registry)
/// 按会话 id 缓存存活的、可能未提交的上下文，叠加在持久服务的读取之前
///
/// Entries expire after their time-to-live; expired entries are purged on
/// access.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionEntry>,
    default_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            default_ttl,
        }
    }

    pub fn register(&self, session_id: Uuid, context: Arc<TokenContext>, ttl: Option<Duration>) {
        context.set_session_id(Some(session_id));
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.sessions.insert(
            session_id,
            SessionEntry {
                context,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn lookup(&self, session_id: Uuid) -> Option<Arc<TokenContext>> {
        let expired = match self.sessions.get(&session_id) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.context.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.sessions.remove(&session_id);
            debug!(session_id = %session_id, "session entry expired");
        }
        None
    }

    pub fn unregister(&self, session_id: Uuid) -> Option<Arc<TokenContext>> {
        self.sessions.remove(&session_id).map(|(_, e)| e.context)
    }

    /// Removes whichever session holds the given context.
    pub fn unregister_context(&self, context_id: Uuid) {
        self.sessions.retain(|_, entry| entry.context.id() != context_id);
    }

    /// Live-overlay lookup used by persistent reads.
    pub fn find_by_context_id(&self, context_id: Uuid) -> Option<Arc<TokenContext>> {
        let now = Instant::now();
        self.sessions
            .iter()
            .find(|e| e.context.id() == context_id && e.expires_at > now)
            .map(|e| e.context.clone())
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.expires_at > now);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Process-definition hot-update notification: re-resolves call-stack
    /// and current-socket references of every registered context and,
    /// recursively, every child context. A reference that cannot be
    /// re-resolved is reported per context but never aborts the walk.
    pub async fn perform_process_update(
        &self,
        resolver: &dyn ModelResolver,
        service: &dyn TokenContextService,
    ) -> Vec<(Uuid, bool)> {
        let mut results = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut work: Vec<Arc<TokenContext>> = self
            .sessions
            .iter()
            .map(|e| e.context.clone())
            .collect();

        while let Some(ctx) = work.pop() {
            if !visited.insert(ctx.id()) {
                continue;
            }
            let ok = ctx.update_call_stack(resolver);
            if !ok {
                warn!(context_id = %ctx.id(), "stale socket reference after process update");
            }
            results.push((ctx.id(), ok));

            for child in ctx.children() {
                match service.get_context_by_id(child).await {
                    Ok(Some(child_ctx)) => work.push(child_ctx),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(context_id = %child, error = ?e, "failed to load child context");
                    }
                }
            }
        }
        results
    }

    /// Removes and terminates every context attached to the given debugger
    /// id, recursively flagging all descendants for cooperative
    /// termination. Returns the number of contexts flagged.
    pub async fn request_session_abort(
        &self,
        debugger_id: &str,
        service: &dyn TokenContextService,
    ) -> usize {
        let attached: Vec<(Uuid, Arc<TokenContext>)> = self
            .sessions
            .iter()
            .filter(|e| e.context.debugger_id().as_deref() == Some(debugger_id))
            .map(|e| (*e.key(), e.context.clone()))
            .collect();

        let mut flagged = 0usize;
        let mut visited: HashSet<Uuid> = HashSet::new();
        for (session_id, ctx) in attached {
            self.sessions.remove(&session_id);

            let mut work = vec![ctx];
            while let Some(current) = work.pop() {
                if !visited.insert(current.id()) {
                    continue;
                }
                current.request_termination();
                flagged += 1;
                for child in current.children() {
                    if let Ok(Some(child_ctx)) = service.get_context_by_id(child).await {
                        work.push(child_ctx);
                    }
                }
            }
        }
        if flagged > 0 {
            info!(debugger_id = %debugger_id, count = flagged, "session abort requested");
        }
        flagged
    }
}
