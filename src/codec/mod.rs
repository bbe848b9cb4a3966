//! Versioned binary payload for a TokenContext's call stack and persistent
//! parameters. Consumed only by this subsystem, not a public wire format.
//!
//! Layout (version 2):
//!   magic byte, version byte,
//!   call stack: frame count (u32), then per frame: kind (u8) + qualified socket name,
//!   parameter entries: name, [scope for '#'-names], type tag, serializer payload,
//!   empty-name sentinel,
//!   four reserved u32 slots (written zero, skipped on read).
//!
//! A payload whose first byte is not the magic byte takes the single
//! documented legacy path: version 0, parameter entries only, no call
//! stack and no reserved block. A recognized magic byte with any other
//! version is a fatal error.

pub mod registry;
pub mod wire;

use crate::error::EngineError;
use crate::model::SocketRef;
use crate::runtime::callstack::{CallFrame, FrameKind};
use crate::runtime::context::TokenContext;
use crate::runtime::value::{is_process_variable, ContextValue};

use registry::SerializerRegistry;
use wire::{ByteReader, ByteWriter};

pub const PAYLOAD_MAGIC: u8 = 0xC7;
pub const PAYLOAD_VERSION: u8 = 2;
const RESERVED_SLOTS: usize = 4;

/// Serializes the call stack and the persistent parameter slots. Transient
/// slots and runtime attributes are never written.
pub fn encode_context(
    ctx: &TokenContext,
    registry: &SerializerRegistry,
) -> Result<Vec<u8>, EngineError> {
    let mut out = ByteWriter::new();
    out.put_u8(PAYLOAD_MAGIC);
    out.put_u8(PAYLOAD_VERSION);

    let frames = ctx.snapshot_call_stack();
    out.put_u32(frames.len() as u32);
    for frame in &frames {
        out.put_u8(frame.kind.as_code());
        out.put_str(&frame.socket.qualified());
    }

    write_param_entries(ctx, registry, &mut out)?;

    for _ in 0..RESERVED_SLOTS {
        out.put_u32(0);
    }

    Ok(out.into_bytes())
}

/// Rebuilds call stack and parameters from a payload. The context's runtime
/// attributes and termination flag are cleared regardless of payload
/// contents; process-variable slots are re-declared purely from the name
/// prefix convention before their value is assigned.
pub fn decode_into_context(
    ctx: &TokenContext,
    bytes: &[u8],
    registry: &SerializerRegistry,
) -> Result<(), EngineError> {
    if bytes.is_empty() {
        ctx.restore_from_parts(Vec::new(), Vec::new());
        return Ok(());
    }

    if bytes[0] != PAYLOAD_MAGIC {
        // Legacy payloads predate the version tag: parameter entries only.
        let mut input = ByteReader::new(bytes);
        let params = read_param_entries(&mut input, registry)?;
        ctx.restore_from_parts(Vec::new(), params);
        return Ok(());
    }

    let mut input = ByteReader::new(bytes);
    let _magic = input.get_u8()?;
    let version = input.get_u8()?;
    if version != PAYLOAD_VERSION {
        return Err(EngineError::UnknownVersion(version));
    }

    let frame_count = input.get_u32()? as usize;
    let mut frames = Vec::with_capacity(frame_count);
    for _ in 0..frame_count {
        let kind_code = input.get_u8()?;
        let kind = FrameKind::from_code(kind_code).ok_or_else(|| {
            EngineError::MalformedPayload(format!("unknown frame kind {:#04x}", kind_code))
        })?;
        let qualified = input.get_str()?;
        let socket = SocketRef::parse_qualified(&qualified).ok_or_else(|| {
            EngineError::MalformedPayload(format!("unparseable socket name '{}'", qualified))
        })?;
        frames.push(CallFrame { kind, socket });
    }

    let params = read_param_entries(&mut input, registry)?;

    for _ in 0..RESERVED_SLOTS {
        let _ = input.get_u32()?;
    }

    ctx.restore_from_parts(frames, params);
    Ok(())
}

fn write_param_entries(
    ctx: &TokenContext,
    registry: &SerializerRegistry,
    out: &mut ByteWriter,
) -> Result<(), EngineError> {
    for (name, slot) in ctx.snapshot_params() {
        if !slot.persistent {
            continue;
        }
        out.put_str(&name);
        if is_process_variable(&name) {
            out.put_str(slot.scope.as_deref().unwrap_or(""));
        }
        let tag = slot.value.type_tag();
        out.put_str(tag);
        let serializer = registry.resolve(tag, &name)?;
        serializer.write(&slot.value, out)?;
    }
    // Empty name terminates the entry sequence.
    out.put_str("");
    Ok(())
}

fn read_param_entries(
    input: &mut ByteReader,
    registry: &SerializerRegistry,
) -> Result<Vec<(String, ContextValue)>, EngineError> {
    let mut params = Vec::new();
    loop {
        let name = input.get_str()?;
        if name.is_empty() {
            break;
        }
        let scope = if is_process_variable(&name) {
            let scope = input.get_str()?;
            if scope.is_empty() { None } else { Some(scope) }
        } else {
            None
        };
        let tag = input.get_str()?;
        let serializer = registry.resolve(&tag, &name)?;
        let value = serializer.read(input)?;
        params.push((
            name,
            ContextValue {
                value,
                persistent: true,
                scope,
            },
        ));
    }
    Ok(params)
}
