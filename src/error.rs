use thiserror::Error;

use crate::task::TaskStatus;

/// 引擎错误 (Engine Error)
/// 区分致命错误、可跳过错误与协作式终止
#[derive(Debug, Error)]
pub enum EngineError {
    /// Likely infinite recursion. The stack is left unchanged.
    #[error("call stack overflow: depth {depth} exceeds maximum {max}")]
    CallStackOverflow { depth: usize, max: usize },

    #[error("pop on empty call stack")]
    EmptyCallStack,

    #[error("unknown context payload version tag {0:#04x}")]
    UnknownVersion(u8),

    #[error("malformed context payload: {0}")]
    MalformedPayload(String),

    #[error("no serializer registered for type '{type_tag}' (parameter '{param}')")]
    UnregisteredType { type_tag: String, param: String },

    /// Raised only when strict variable access is configured.
    #[error("undeclared process variable '{0}'")]
    UndeclaredVariable(String),

    /// Cooperative termination requested by an external controller.
    /// Distinguished from ordinary failures so callers can map it to ABORTED.
    #[error("context execution killed by controller")]
    KilledByController,

    #[error("invalid task transition {from:?} -> {to:?}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },

    /// A context was scheduled without a resolvable current socket.
    #[error("context {0} has no current socket")]
    MissingSocket(uuid::Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
