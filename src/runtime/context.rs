use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{ModelResolver, SocketRef};
use crate::runtime::callstack::{CallFrame, CallStack, FrameKind};
use crate::runtime::lifecycle::{Lifecycle, LifecycleRequest, LifecycleState};
use crate::runtime::value::{is_process_variable, ContextValue, ParamValue};

/// 进度信息 (Progress Info)
/// 仅用于 UI 反馈，与正确性无关
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressInfo {
    pub count: u32,
    pub total: u32,
    pub text: Option<String>,
}

#[derive(Debug, Default)]
struct ContextMeta {
    parent: Option<Uuid>,
    current_socket: Option<SocketRef>,
    chosen_exit: Option<String>,
    priority: i32,
    queue_type: Option<String>,
    node_id: Option<String>,
    user_id: Option<String>,
    debugger_id: Option<String>,
    session_id: Option<Uuid>,
}

/// 令牌上下文 (Token Context)
/// 一个在途流程实例的全部可变状态：位置、调用栈、参数、生命周期
///
/// Single-writer invariant: call stack and parameters are mutated only by
/// the thread currently executing the context. Other threads may read
/// concurrently and must treat the aggregate as live, mutable state.
pub struct TokenContext {
    id: Uuid,
    strict_variables: bool,
    lifecycle: Lifecycle,
    call_stack: Mutex<CallStack>,
    params: DashMap<String, ContextValue>,
    /// Process-local bindings (worker handles, flags). Never serialized,
    /// cleared on every deserialization.
    runtime_attrs: DashMap<String, Arc<dyn Any + Send + Sync>>,
    kill_requested: AtomicBool,
    meta: RwLock<ContextMeta>,
    progress: Mutex<ProgressInfo>,
    children: Mutex<Vec<Uuid>>,
}

impl TokenContext {
    pub fn new(id: Uuid, config: &EngineConfig) -> Self {
        Self {
            id,
            strict_variables: config.strict_variables,
            lifecycle: Lifecycle::new(),
            call_stack: Mutex::new(CallStack::new(config.max_call_depth)),
            params: DashMap::new(),
            runtime_attrs: DashMap::new(),
            kill_requested: AtomicBool::new(false),
            meta: RwLock::new(ContextMeta::default()),
            progress: Mutex::new(ProgressInfo::default()),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    // --- Parameters (handler boundary) ---

    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn get_param(&self, name: &str) -> Result<Option<ParamValue>, EngineError> {
        if is_process_variable(name) {
            return self.get_process_variable(name);
        }
        Ok(self.params.get(name).map(|v| v.value.clone()))
    }

    /// Sets a persistent parameter. Process-variable names are routed
    /// through the variable access rules.
    pub fn set_param(&self, name: &str, value: ParamValue) -> Result<(), EngineError> {
        if is_process_variable(name) {
            return self.set_process_variable(name, value);
        }
        self.params
            .insert(name.to_string(), ContextValue::persistent(value));
        Ok(())
    }

    /// Sets a parameter excluded from the serialized payload.
    pub fn set_transient_param(&self, name: &str, value: ParamValue) {
        self.params
            .insert(name.to_string(), ContextValue::transient(value));
    }

    pub fn remove_param(&self, name: &str) -> Option<ContextValue> {
        self.params.remove(name).map(|(_, v)| v)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|e| e.key().clone()).collect()
    }

    // --- Process variables ---

    /// Declares a process variable scoped to `scope_process`. The name must
    /// carry the reserved marker prefix.
    pub fn declare_process_variable(&self, name: &str, scope_process: &str, persistent: bool) {
        debug_assert!(is_process_variable(name));
        self.params
            .entry(name.to_string())
            .or_insert_with(|| ContextValue::scoped(ParamValue::Null, scope_process, persistent));
    }

    /// Relaxed mode returns Ok(None) for an unknown variable; strict mode
    /// promotes that to a fatal error.
    pub fn get_process_variable(&self, name: &str) -> Result<Option<ParamValue>, EngineError> {
        match self.params.get(name) {
            Some(slot) => Ok(Some(slot.value.clone())),
            None if self.strict_variables => Err(EngineError::UndeclaredVariable(name.to_string())),
            None => Ok(None),
        }
    }

    /// Relaxed mode auto-declares an unscoped persistent variable; strict
    /// mode requires a prior declaration.
    pub fn set_process_variable(&self, name: &str, value: ParamValue) -> Result<(), EngineError> {
        match self.params.get_mut(name) {
            Some(mut slot) => {
                slot.value = value;
                Ok(())
            }
            None if self.strict_variables => Err(EngineError::UndeclaredVariable(name.to_string())),
            None => {
                self.params
                    .insert(name.to_string(), ContextValue::persistent(value));
                Ok(())
            }
        }
    }

    /// Drops every process variable scoped to one of the given processes.
    pub fn clear_process_variables_for(&self, processes: &[String]) {
        if processes.is_empty() {
            return;
        }
        self.params.retain(|_, slot| match &slot.scope {
            Some(scope) => !processes.contains(scope),
            None => true,
        });
    }

    // --- Call stack ---

    pub fn push_subprocess(&self, entry_socket: SocketRef) -> Result<CallFrame, EngineError> {
        let mut stack = self.call_stack.lock().unwrap();
        stack.push_subprocess(entry_socket).map(|f| f.clone())
    }

    pub fn push_return_point(&self, socket: SocketRef) -> Result<CallFrame, EngineError> {
        let mut stack = self.call_stack.lock().unwrap();
        stack.push_return_point(socket).map(|f| f.clone())
    }

    /// Pops the top frame and trims process variables scoped to processes
    /// no remaining frame references.
    pub fn pop_frame(&self) -> Result<CallFrame, EngineError> {
        let (frame, released) = self.call_stack.lock().unwrap().pop()?;
        self.clear_process_variables_for(&released);
        Ok(frame)
    }

    pub fn peek_frame(&self) -> Option<CallFrame> {
        self.call_stack.lock().unwrap().peek().cloned()
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.lock().unwrap().depth()
    }

    pub fn is_process_executing(&self, process: &str) -> bool {
        self.call_stack.lock().unwrap().is_process_executing(process)
    }

    pub fn contains_socket_reference(&self, qualified: &str) -> bool {
        self.call_stack
            .lock()
            .unwrap()
            .contains_socket_reference(qualified)
    }

    /// Discards the whole stack and the variables it scoped.
    pub fn clear_call_stack(&self) {
        let released = self.call_stack.lock().unwrap().clear();
        self.clear_process_variables_for(&released);
    }

    /// Re-resolves the call stack and the current socket after a process
    /// definition hot reload. Returns false if any reference is stale.
    pub fn update_call_stack(&self, resolver: &dyn ModelResolver) -> bool {
        let stack_ok = self
            .call_stack
            .lock()
            .unwrap()
            .perform_process_update(resolver);

        let mut meta = self.meta.write().unwrap();
        let socket_ok = match &meta.current_socket {
            Some(socket) => match resolver.resolve_socket(&socket.qualified()) {
                Some(fresh) => {
                    meta.current_socket = Some(fresh);
                    true
                }
                None => false,
            },
            None => true,
        };

        stack_ok && socket_ok
    }

    // --- Lifecycle ---

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn request(&self) -> LifecycleRequest {
        self.lifecycle.request()
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.lifecycle.set_state(state);
    }

    pub fn set_request(&self, request: LifecycleRequest) {
        self.lifecycle.set_request(request);
    }

    pub async fn wait_lifecycle_request(&self, target: LifecycleRequest) {
        self.lifecycle.wait_request(target).await;
    }

    /// Claims the context for a worker node. On success the state is
    /// SELECTED and the node id records the owner for crash recovery.
    pub fn try_claim(&self, node_id: &str) -> bool {
        if !self.lifecycle.try_claim() {
            return false;
        }
        self.meta.write().unwrap().node_id = Some(node_id.to_string());
        true
    }

    pub fn begin_execution(&self) {
        self.lifecycle.set_state(LifecycleState::Running);
    }

    pub fn complete(&self) {
        self.lifecycle
            .restore(LifecycleState::Completed, LifecycleRequest::None);
    }

    pub fn abort_execution(&self) {
        self.lifecycle
            .restore(LifecycleState::Aborted, LifecycleRequest::None);
    }

    /// Unrecoverable failure. Current socket and call stack are left intact
    /// so the error can be diagnosed without replaying execution.
    pub fn fail(&self) {
        self.lifecycle.set_state(LifecycleState::Error);
    }

    pub fn apply_suspend(&self, request: LifecycleRequest) {
        self.lifecycle.apply_suspend(request);
    }

    pub(crate) fn restore_lifecycle(&self, state: LifecycleState, request: LifecycleRequest) {
        self.lifecycle.restore(state, request);
    }

    // --- Cooperative termination ---

    pub fn request_termination(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
    }

    pub fn termination_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Yield-point check for executing business code. Raises the
    /// distinguished killed-by-controller condition.
    pub fn check_termination(&self) -> Result<(), EngineError> {
        if self.termination_requested() {
            Err(EngineError::KilledByController)
        } else {
            Ok(())
        }
    }

    // --- Runtime attributes (never serialized) ---

    pub fn set_runtime_attr(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.runtime_attrs.insert(name.to_string(), value);
    }

    pub fn runtime_attr<T: 'static + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.runtime_attrs
            .get(name)
            .and_then(|v| v.value().clone().downcast::<T>().ok())
    }

    pub fn remove_runtime_attr(&self, name: &str) {
        self.runtime_attrs.remove(name);
    }

    pub fn runtime_attr_count(&self) -> usize {
        self.runtime_attrs.len()
    }

    /// Drops all runtime attributes and the termination flag. Invoked on
    /// every deserialization.
    pub fn clear_runtime_attrs(&self) {
        self.runtime_attrs.clear();
        self.kill_requested.store(false, Ordering::SeqCst);
    }

    // --- Position ---

    pub fn current_socket(&self) -> Option<SocketRef> {
        self.meta.read().unwrap().current_socket.clone()
    }

    /// Sets the current position. The queue type follows the socket's queue
    /// hint when it carries one.
    pub fn set_current_socket(&self, socket: Option<SocketRef>) {
        let mut meta = self.meta.write().unwrap();
        if let Some(s) = &socket {
            if s.queue.is_some() {
                meta.queue_type = s.queue.clone();
            }
        }
        meta.current_socket = socket;
    }

    /// Handler boundary: signals which exit socket the unit of work chose.
    pub fn choose_exit_socket(&self, socket_name: &str) {
        self.meta.write().unwrap().chosen_exit = Some(socket_name.to_string());
    }

    pub fn chosen_exit(&self) -> Option<String> {
        self.meta.read().unwrap().chosen_exit.clone()
    }

    // --- Misc accessors ---

    pub fn priority(&self) -> i32 {
        self.meta.read().unwrap().priority
    }

    pub fn set_priority(&self, priority: i32) {
        self.meta.write().unwrap().priority = priority;
    }

    pub fn queue_type(&self) -> Option<String> {
        self.meta.read().unwrap().queue_type.clone()
    }

    pub fn set_queue_type(&self, queue_type: Option<String>) {
        self.meta.write().unwrap().queue_type = queue_type;
    }

    pub fn node_id(&self) -> Option<String> {
        self.meta.read().unwrap().node_id.clone()
    }

    pub fn set_node_id(&self, node_id: Option<String>) {
        self.meta.write().unwrap().node_id = node_id;
    }

    pub fn user_id(&self) -> Option<String> {
        self.meta.read().unwrap().user_id.clone()
    }

    pub fn set_user_id(&self, user_id: Option<String>) {
        self.meta.write().unwrap().user_id = user_id;
    }

    pub fn debugger_id(&self) -> Option<String> {
        self.meta.read().unwrap().debugger_id.clone()
    }

    pub fn set_debugger_id(&self, debugger_id: Option<String>) {
        self.meta.write().unwrap().debugger_id = debugger_id;
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.meta.read().unwrap().session_id
    }

    pub fn set_session_id(&self, session_id: Option<Uuid>) {
        self.meta.write().unwrap().session_id = session_id;
    }

    // --- Parent / child links (id references, arena style) ---

    pub fn parent(&self) -> Option<Uuid> {
        self.meta.read().unwrap().parent
    }

    pub fn set_parent(&self, parent: Option<Uuid>) {
        self.meta.write().unwrap().parent = parent;
    }

    pub fn add_child(&self, child: Uuid) {
        let mut children = self.children.lock().unwrap();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    /// A child may outlive removal from the parent's child set; this only
    /// drops the reference.
    pub fn remove_child(&self, child: Uuid) {
        self.children.lock().unwrap().retain(|c| *c != child);
    }

    pub fn children(&self) -> Vec<Uuid> {
        self.children.lock().unwrap().clone()
    }

    pub fn set_children(&self, children: Vec<Uuid>) {
        *self.children.lock().unwrap() = children;
    }

    // --- Progress ---

    pub fn set_progress(&self, count: u32, total: u32, text: Option<String>) {
        let mut progress = self.progress.lock().unwrap();
        progress.count = count;
        progress.total = total;
        progress.text = text;
    }

    pub fn progress(&self) -> ProgressInfo {
        self.progress.lock().unwrap().clone()
    }

    // --- Codec support ---

    pub fn snapshot_call_stack(&self) -> Vec<CallFrame> {
        self.call_stack.lock().unwrap().frames().to_vec()
    }

    pub fn snapshot_params(&self) -> Vec<(String, ContextValue)> {
        self.params
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Replaces call stack and parameters wholesale from a decoded payload.
    /// Runtime attributes and the termination flag are always cleared.
    pub fn restore_from_parts(&self, frames: Vec<CallFrame>, params: Vec<(String, ContextValue)>) {
        self.clear_runtime_attrs();
        {
            let mut stack = self.call_stack.lock().unwrap();
            stack.clear();
            for frame in frames {
                // Depth was validated when the frames were first pushed.
                let _ = match frame.kind {
                    FrameKind::Search => stack.push_subprocess(frame.socket),
                    FrameKind::Continue => stack.push_return_point(frame.socket),
                };
            }
        }
        self.params.clear();
        for (name, slot) in params {
            self.params.insert(name, slot);
        }
    }
}

impl fmt::Debug for TokenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.lifecycle.snapshot();
        f.debug_struct("TokenContext")
            .field("id", &self.id)
            .field("state", &snapshot.state)
            .field("request", &snapshot.request)
            .field("priority", &self.priority())
            .field("call_depth", &self.call_depth())
            .finish()
    }
}
