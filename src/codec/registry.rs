use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::wire::{ByteReader, ByteWriter};
use crate::error::EngineError;
use crate::runtime::value::ParamValue;

/// 值序列化器接口 (Value Serializer)
/// 每种值类型一个编解码对；新增类型只需注册，无需改动 codec 本身
pub trait ValueSerializer: Send + Sync {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError>;
    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError>;
}

/// Per-type serializer registry. A registry can be scoped to an executing
/// model and passed into the decode call, which replaces the original
/// design's ambient class-loader swapping.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn ValueSerializer>>,
}

impl SerializerRegistry {
    /// Empty registry. Most callers want `with_builtins`.
    pub fn new() -> Self {
        Self {
            serializers: HashMap::new(),
        }
    }

    /// Registry preloaded with a serializer for every built-in value kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("null", Arc::new(NullSerializer));
        registry.register("bool", Arc::new(BoolSerializer));
        registry.register("int", Arc::new(IntSerializer));
        registry.register("float", Arc::new(FloatSerializer));
        registry.register("string", Arc::new(TextSerializer));
        registry.register("bytes", Arc::new(BytesSerializer));
        registry.register("json", Arc::new(JsonSerializer));
        registry
    }

    pub fn register(&mut self, type_tag: &str, serializer: Arc<dyn ValueSerializer>) {
        self.serializers.insert(type_tag.to_string(), serializer);
    }

    /// Fails with a diagnosable error naming the type and the parameter key.
    pub fn resolve(
        &self,
        type_tag: &str,
        param: &str,
    ) -> Result<&Arc<dyn ValueSerializer>, EngineError> {
        self.serializers
            .get(type_tag)
            .ok_or_else(|| EngineError::UnregisteredType {
                type_tag: type_tag.to_string(),
                param: param.to_string(),
            })
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// --- Built-in serializers ---

struct NullSerializer;

impl ValueSerializer for NullSerializer {
    fn write(&self, _value: &ParamValue, _out: &mut ByteWriter) -> Result<(), EngineError> {
        Ok(())
    }

    fn read(&self, _input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Null)
    }
}

struct BoolSerializer;

impl ValueSerializer for BoolSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Bool(b) => {
                out.put_u8(if *b { 1 } else { 0 });
                Ok(())
            }
            other => Err(mismatch("bool", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Bool(input.get_u8()? != 0))
    }
}

struct IntSerializer;

impl ValueSerializer for IntSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Int(i) => {
                out.put_i64(*i);
                Ok(())
            }
            other => Err(mismatch("int", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Int(input.get_i64()?))
    }
}

struct FloatSerializer;

impl ValueSerializer for FloatSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Float(f) => {
                out.put_f64(*f);
                Ok(())
            }
            other => Err(mismatch("float", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Float(input.get_f64()?))
    }
}

struct TextSerializer;

impl ValueSerializer for TextSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Text(s) => {
                out.put_str(s);
                Ok(())
            }
            other => Err(mismatch("string", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Text(input.get_str()?))
    }
}

struct BytesSerializer;

impl ValueSerializer for BytesSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Bytes(b) => {
                out.put_bytes(b);
                Ok(())
            }
            other => Err(mismatch("bytes", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        Ok(ParamValue::Bytes(input.get_bytes()?))
    }
}

struct JsonSerializer;

impl ValueSerializer for JsonSerializer {
    fn write(&self, value: &ParamValue, out: &mut ByteWriter) -> Result<(), EngineError> {
        match value {
            ParamValue::Json(v) => {
                let encoded = serde_json::to_vec(v)
                    .map_err(|e| EngineError::MalformedPayload(format!("json encode: {}", e)))?;
                out.put_bytes(&encoded);
                Ok(())
            }
            other => Err(mismatch("json", other)),
        }
    }

    fn read(&self, input: &mut ByteReader) -> Result<ParamValue, EngineError> {
        let bytes = input.get_bytes()?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::MalformedPayload(format!("json decode: {}", e)))?;
        Ok(ParamValue::Json(value))
    }
}

fn mismatch(expected: &str, got: &ParamValue) -> EngineError {
    EngineError::MalformedPayload(format!(
        "serializer '{}' received a {} value",
        expected,
        got.type_tag()
    ))
}
