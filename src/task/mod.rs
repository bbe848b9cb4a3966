use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// 人工任务状态 (Workflow Task Status)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unknown,
    Disabled,
    Enabled,
    Resumed,
    Completed,
    Error,
}

/// 人工任务 (Workflow Task)
/// 可选地 1:1 绑定一个 TokenContext；携带指派信息与完成后删除策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: Uuid,
    pub name: String,
    pub context_id: Option<Uuid>,
    pub status: TaskStatus,
    /// Assignment: role id and/or user id.
    pub role_id: Option<String>,
    pub user_id: Option<String>,
    pub priority: i32,
    /// Due time as milliseconds since the Unix epoch.
    pub due_at_ms: Option<u64>,
    pub delete_on_completion: bool,
}

impl WorkflowTask {
    pub fn new(id: Uuid, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            context_id: None,
            status: TaskStatus::Unknown,
            role_id: None,
            user_id: None,
            priority: 0,
            due_at_ms: None,
            delete_on_completion: false,
        }
    }

    /// Enforces the task lifecycle:
    /// UNKNOWN -> DISABLED|ENABLED, DISABLED <-> ENABLED,
    /// ENABLED -> RESUMED, RESUMED -> COMPLETED|ERROR.
    /// ERROR is reachable from any active status.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), EngineError> {
        use TaskStatus::*;
        let legal = match (self.status, to) {
            (Unknown, Disabled) | (Unknown, Enabled) => true,
            (Disabled, Enabled) | (Enabled, Disabled) => true,
            (Enabled, Resumed) => true,
            (Resumed, Completed) => true,
            (Disabled, Error) | (Enabled, Error) | (Resumed, Error) => true,
            _ => false,
        };
        if !legal {
            return Err(EngineError::InvalidTaskTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
