use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 生命周期状态 (Lifecycle State)
/// 描述上下文当前所处的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Created,
    Suspended,
    Selected,
    Running,
    Completed,
    Aborted,
    Error,
    /// Suspended but kept resident in memory, not flushed (SUSPEND_MEMORY).
    Idling,
}

/// 生命周期请求 (Lifecycle Request)
/// 描述外部期望的下一步动作；与 state 正交
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleRequest {
    None,
    Resume,
    SuspendImmediate,
    SuspendTransaction,
    SuspendMemory,
    Stop,
    Abort,
    User1,
    User2,
    User3,
}

impl LifecycleState {
    /// Integer code used for storage columns.
    pub fn as_code(&self) -> i32 {
        match self {
            LifecycleState::Created => 0,
            LifecycleState::Suspended => 1,
            LifecycleState::Selected => 2,
            LifecycleState::Running => 3,
            LifecycleState::Completed => 4,
            LifecycleState::Aborted => 5,
            LifecycleState::Error => 6,
            LifecycleState::Idling => 7,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LifecycleState::Created),
            1 => Some(LifecycleState::Suspended),
            2 => Some(LifecycleState::Selected),
            3 => Some(LifecycleState::Running),
            4 => Some(LifecycleState::Completed),
            5 => Some(LifecycleState::Aborted),
            6 => Some(LifecycleState::Error),
            7 => Some(LifecycleState::Idling),
            _ => None,
        }
    }
}

impl LifecycleRequest {
    /// Integer code used for storage columns.
    pub fn as_code(&self) -> i32 {
        match self {
            LifecycleRequest::None => 0,
            LifecycleRequest::Resume => 1,
            LifecycleRequest::SuspendImmediate => 2,
            LifecycleRequest::SuspendTransaction => 3,
            LifecycleRequest::SuspendMemory => 4,
            LifecycleRequest::Stop => 5,
            LifecycleRequest::Abort => 6,
            LifecycleRequest::User1 => 7,
            LifecycleRequest::User2 => 8,
            LifecycleRequest::User3 => 9,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(LifecycleRequest::None),
            1 => Some(LifecycleRequest::Resume),
            2 => Some(LifecycleRequest::SuspendImmediate),
            3 => Some(LifecycleRequest::SuspendTransaction),
            4 => Some(LifecycleRequest::SuspendMemory),
            5 => Some(LifecycleRequest::Stop),
            6 => Some(LifecycleRequest::Abort),
            7 => Some(LifecycleRequest::User1),
            8 => Some(LifecycleRequest::User2),
            9 => Some(LifecycleRequest::User3),
            _ => None,
        }
    }

    pub fn is_suspend(&self) -> bool {
        matches!(
            self,
            LifecycleRequest::SuspendImmediate
                | LifecycleRequest::SuspendTransaction
                | LifecycleRequest::SuspendMemory
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub request: LifecycleRequest,
}

/// State machine core shared by every TokenContext. Built on a watch
/// channel: `send_modify` wakes all waiters unconditionally, and waiters
/// re-check their predicate and re-block on mismatch.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleSnapshot>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleSnapshot {
            state: LifecycleState::Created,
            request: LifecycleRequest::None,
        });
        Self { tx }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        *self.tx.borrow()
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    pub fn request(&self) -> LifecycleRequest {
        self.tx.borrow().request
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.tx.send_modify(|s| s.state = state);
    }

    /// Wakes all waiters even when the new value matches none of them.
    pub fn set_request(&self, request: LifecycleRequest) {
        self.tx.send_modify(|s| s.request = request);
    }

    /// Blocks until `request == target`. Unrelated request changes wake the
    /// waiter, which re-checks and blocks again.
    pub async fn wait_request(&self, target: LifecycleRequest) {
        let mut rx = self.tx.subscribe();
        // wait_for inspects the current value before awaiting changes, so a
        // request posted before the wait also satisfies it.
        let _ = rx.wait_for(|s| s.request == target).await;
    }

    /// Atomic claim: succeeds iff `request == RESUME && state != SELECTED`,
    /// in which case the state becomes SELECTED.
    pub fn try_claim(&self) -> bool {
        let mut claimed = false;
        self.tx.send_modify(|s| {
            if s.request == LifecycleRequest::Resume && s.state != LifecycleState::Selected {
                s.state = LifecycleState::Selected;
                claimed = true;
            }
        });
        claimed
    }

    /// Applies a suspend request observed at a yield point: SUSPEND_MEMORY
    /// parks the context as IDLING (kept resident), anything else as
    /// SUSPENDED. The request is consumed.
    pub fn apply_suspend(&self, request: LifecycleRequest) {
        self.tx.send_modify(|s| {
            s.state = if request == LifecycleRequest::SuspendMemory {
                LifecycleState::Idling
            } else {
                LifecycleState::Suspended
            };
            s.request = LifecycleRequest::None;
        });
    }

    /// Restores both axes in one notification, used when materializing a
    /// context from storage.
    pub fn restore(&self, state: LifecycleState, request: LifecycleRequest) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.request = request;
        });
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
