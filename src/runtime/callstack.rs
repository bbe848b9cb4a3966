use crate::error::EngineError;
use crate::model::{ModelResolver, SocketRef};

pub const DEFAULT_MAX_DEPTH: usize = 50;

/// 调用帧类型
/// CONTINUE: 子流程返回后精确恢复到该 socket
/// SEARCH: 子流程返回后按名字匹配出口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Continue,
    Search,
}

impl FrameKind {
    pub fn as_code(&self) -> u8 {
        match self {
            FrameKind::Continue => 0,
            FrameKind::Search => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameKind::Continue),
            1 => Some(FrameKind::Search),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub kind: FrameKind,
    pub socket: SocketRef,
}

/// 调用栈 (Call Stack)
/// 有界的子流程调用帧序列，由单个 TokenContext 独占持有
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Saves a SEARCH return point before invoking a sub-process.
    pub fn push_subprocess(&mut self, entry_socket: SocketRef) -> Result<&CallFrame, EngineError> {
        self.push(FrameKind::Search, entry_socket)
    }

    /// Saves a CONTINUE return point: resume exactly at this socket.
    pub fn push_return_point(&mut self, socket: SocketRef) -> Result<&CallFrame, EngineError> {
        self.push(FrameKind::Continue, socket)
    }

    fn push(&mut self, kind: FrameKind, socket: SocketRef) -> Result<&CallFrame, EngineError> {
        if self.frames.len() >= self.max_depth {
            // Fatal, not retryable: almost certainly infinite recursion.
            // The stack must not be mutated.
            return Err(EngineError::CallStackOverflow {
                depth: self.frames.len() + 1,
                max: self.max_depth,
            });
        }
        self.frames.push(CallFrame { kind, socket });
        Ok(self.frames.last().expect("frame just pushed"))
    }

    /// Removes and returns the top frame together with the ids of processes
    /// released by the shrink. A discarded frame's process is released iff
    /// no remaining frame references the same process.
    pub fn pop(&mut self) -> Result<(CallFrame, Vec<String>), EngineError> {
        let frame = self.frames.pop().ok_or(EngineError::EmptyCallStack)?;
        let process = &frame.socket.process;
        let still_referenced = self.frames.iter().any(|f| &f.socket.process == process);
        let released = if still_referenced {
            Vec::new()
        } else {
            vec![process.clone()]
        };
        Ok((frame, released))
    }

    pub fn peek(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Scans all frames, top-down, for any socket belonging to `process`.
    pub fn is_process_executing(&self, process: &str) -> bool {
        self.frames.iter().rev().any(|f| f.socket.process == process)
    }

    /// Scans CONTINUE frames only.
    pub fn contains_socket_reference(&self, qualified: &str) -> bool {
        self.frames
            .iter()
            .filter(|f| f.kind == FrameKind::Continue)
            .any(|f| f.socket.qualified() == qualified)
    }

    /// Re-resolves every frame's socket against a hot-reloaded definition.
    /// Returns false if any frame's socket can no longer be resolved; such
    /// frames keep their stale reference and the owning context must be
    /// treated as unrecoverable without manual intervention.
    pub fn perform_process_update(&mut self, resolver: &dyn ModelResolver) -> bool {
        let mut all_resolved = true;
        for frame in &mut self.frames {
            match resolver.resolve_socket(&frame.socket.qualified()) {
                Some(fresh) => frame.socket = fresh,
                None => all_resolved = false,
            }
        }
        all_resolved
    }

    /// Discards all frames, returning every referenced process id once.
    pub fn clear(&mut self) -> Vec<String> {
        let mut released: Vec<String> = Vec::new();
        for frame in self.frames.drain(..) {
            if !released.contains(&frame.socket.process) {
                released.push(frame.socket.process.clone());
            }
        }
        released
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}
