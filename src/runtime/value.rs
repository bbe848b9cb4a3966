use serde_json::Value;

/// Reserved name prefix marking process variables. A parameter name is a
/// process variable iff it starts with this character.
pub const PROCESS_VARIABLE_MARKER: char = '#';

pub fn is_process_variable(name: &str) -> bool {
    name.starts_with(PROCESS_VARIABLE_MARKER)
}

/// 参数值 (Parameter Value)
/// 显式类型联合，serializer registry 按 type_tag 分发
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    /// Extension point: payload interpreted by a registered custom serializer.
    Custom { tag: String, data: Value },
}

impl ParamValue {
    /// Dispatch key into the serializer registry.
    pub fn type_tag(&self) -> &str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "string",
            ParamValue::Bytes(_) => "bytes",
            ParamValue::Json(_) => "json",
            ParamValue::Custom { tag, .. } => tag,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        ParamValue::Bytes(v)
    }
}

impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        ParamValue::Json(v)
    }
}

/// 上下文参数槽 (Context Value)
/// 值 + 持久化标记；process variable 额外携带其作用域流程
#[derive(Debug, Clone, PartialEq)]
pub struct ContextValue {
    pub value: ParamValue,
    /// Only persistent slots are written by the payload codec.
    pub persistent: bool,
    /// Owning process id for process variables; None for plain parameters
    /// and for variables auto-declared in relaxed mode.
    pub scope: Option<String>,
}

impl ContextValue {
    pub fn persistent(value: ParamValue) -> Self {
        Self {
            value,
            persistent: true,
            scope: None,
        }
    }

    pub fn transient(value: ParamValue) -> Self {
        Self {
            value,
            persistent: false,
            scope: None,
        }
    }

    pub fn scoped(value: ParamValue, process: &str, persistent: bool) -> Self {
        Self {
            value,
            persistent,
            scope: Some(process.to_string()),
        }
    }
}
