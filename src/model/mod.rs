use dashmap::DashMap;
use std::fmt;

/// 节点出入口引用 (Socket Reference)
/// 指向流程定义图中某个节点的一个出入口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRef {
    /// Owning process id. May itself contain '.' separators.
    pub process: String,
    pub node: String,
    pub socket: String,
    /// Queue routing hint of the node, if the model declares one.
    pub queue: Option<String>,
}

impl SocketRef {
    pub fn new(process: &str, node: &str, socket: &str) -> Self {
        Self {
            process: process.to_string(),
            node: node.to_string(),
            socket: socket.to_string(),
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Fully qualified name: "{process}.{node}.{socket}".
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.process, self.node, self.socket)
    }

    /// Parses a qualified name. Node and socket names cannot contain '.';
    /// everything before the last two segments belongs to the process id.
    pub fn parse_qualified(qualified: &str) -> Option<Self> {
        let mut parts = qualified.rsplitn(3, '.');
        let socket = parts.next()?;
        let node = parts.next()?;
        let process = parts.next()?;
        if process.is_empty() || node.is_empty() || socket.is_empty() {
            return None;
        }
        Some(Self::new(process, node, socket))
    }
}

impl fmt::Display for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// 模型解析服务接口
/// 引擎只消费这一种模型查询：按限定名解析 Socket
pub trait ModelResolver: Send + Sync {
    fn resolve_socket(&self, qualified: &str) -> Option<SocketRef>;
}

/// In-memory resolver for tests and embedded deployments. Hot reloads are
/// simulated by re-registering or removing sockets.
pub struct StaticModelResolver {
    sockets: DashMap<String, SocketRef>,
}

impl StaticModelResolver {
    pub fn new() -> Self {
        Self {
            sockets: DashMap::new(),
        }
    }

    pub fn register_socket(&self, socket: SocketRef) {
        self.sockets.insert(socket.qualified(), socket);
    }

    /// Drops every socket of the given process, as if a reloaded definition
    /// no longer declared them.
    pub fn remove_process(&self, process: &str) {
        self.sockets.retain(|_, s| s.process != process);
    }
}

impl Default for StaticModelResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelResolver for StaticModelResolver {
    fn resolve_socket(&self, qualified: &str) -> Option<SocketRef> {
        self.sockets.get(qualified).map(|s| s.value().clone())
    }
}
