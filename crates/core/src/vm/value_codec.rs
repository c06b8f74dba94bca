//! Tagged value layout shared with the module.
//!
//! A slot is 16 bytes: the type tag at offset 0, the payload at offset 8.
//! Booleans and numbers are stored inline, little-endian. Strings are a `u32`
//! pointer to a NUL-terminated buffer. Arrays point to a block holding a `u32`
//! count, four reserved bytes, then one slot per element.
//!
//! The same tags are used by the inline wire form, where the payload follows
//! the tag directly and strings and arrays are stored in place.

use std::io::{Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use super::memory::{LinearMemory, MemPtr};
use crate::types::{ObjectHandle, Value, ValueKind};

pub const SLOT_SIZE: u32 = 16;
pub const PAYLOAD_OFFSET: u32 = 8;
pub const ARRAY_HEADER_SIZE: u32 = 8;
const MAX_DEPTH: usize = 32;

/// Allocates a slot and writes `value` into it.
pub fn encode_value(memory: &mut LinearMemory, value: &Value) -> Result<MemPtr> {
    let slot = memory.alloc(SLOT_SIZE, 8)?;
    write_value(memory, slot, value)?;
    Ok(slot)
}

pub fn write_value(memory: &mut LinearMemory, slot: MemPtr, value: &Value) -> Result<()> {
    write_slot(memory, slot, value, 0)
}

pub fn decode_value(memory: &LinearMemory, slot: MemPtr) -> Result<Value> {
    read_slot(memory, slot, 0)
}

/// Decodes a slot, degrading to `Undefined` when it is malformed.
pub fn decode_or_undefined(memory: &LinearMemory, slot: MemPtr) -> Value {
    match decode_value(memory, slot) {
        Ok(value) => value,
        Err(error) => {
            warn!(slot, "value marshaling failed, using undefined: {error:#}");
            Value::Undefined
        }
    }
}

/// Returns `value` when it fits the slot layout, `Undefined` otherwise. Leaves
/// nothing allocated.
pub fn marshalable_or_undefined(memory: &mut LinearMemory, value: &Value) -> Value {
    let mark = memory.mark();
    let encoded = encode_value(memory, value);
    memory.release(mark);
    match encoded {
        Ok(_) => value.clone(),
        Err(error) => {
            warn!(fault = "protocol", "value marshaling failed, using undefined: {error:#}");
            Value::Undefined
        }
    }
}

/// Slots of the elements of an array slot, without decoding them.
pub fn array_element_slots(memory: &LinearMemory, slot: MemPtr) -> Result<Vec<MemPtr>> {
    let mut input = memory.read(slot, SLOT_SIZE)?;
    let kind = ValueKind::try_from(input.read_u8()?)?;
    if kind != ValueKind::Array {
        bail!("expected an array slot, found {kind:?}");
    }
    let mut payload = &input[(PAYLOAD_OFFSET - 1) as usize..];
    let block = payload.read_u32::<LittleEndian>()?;
    let mut header = memory.read(block, ARRAY_HEADER_SIZE)?;
    let count = header.read_u32::<LittleEndian>()?;
    (0..count)
        .map(|index| {
            let element = SLOT_SIZE
                .checked_mul(index)
                .and_then(|offset| offset.checked_add(ARRAY_HEADER_SIZE))
                .and_then(|offset| block.checked_add(offset))
                .ok_or_else(|| anyhow!("array element {index} out of range"))?;
            memory.read(element, SLOT_SIZE)?;
            Ok(element)
        })
        .collect()
}

fn write_slot(memory: &mut LinearMemory, slot: MemPtr, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        bail!("array nesting deeper than {MAX_DEPTH}");
    }
    let payload = slot
        .checked_add(PAYLOAD_OFFSET)
        .ok_or_else(|| anyhow!("slot address overflow"))?;

    // Nested allocations first; the payload slice borrow must not overlap them.
    let pointer = match value {
        Value::String(text) => Some(memory.write_c_string(text)?),
        Value::Array(items) => {
            let count = u32::try_from(items.len()).context("array too long")?;
            let size = count
                .checked_mul(SLOT_SIZE)
                .and_then(|size| size.checked_add(ARRAY_HEADER_SIZE))
                .ok_or_else(|| anyhow!("array too long"))?;
            let block = memory.alloc(size, 8)?;
            let mut header = memory.slice_mut(block, ARRAY_HEADER_SIZE)?;
            header.write_u32::<LittleEndian>(count)?;
            header.write_u32::<LittleEndian>(0)?;
            for (index, item) in items.iter().enumerate() {
                let element = block + ARRAY_HEADER_SIZE + SLOT_SIZE * index as u32;
                write_slot(memory, element, item, depth + 1)?;
            }
            Some(block)
        }
        _ => None,
    };

    memory.slice_mut(slot, 1)?[0] = value.kind().tag();
    let mut out = memory.slice_mut(payload, SLOT_SIZE - PAYLOAD_OFFSET)?;
    out.fill(0);
    match value {
        Value::Undefined | Value::Null => {}
        Value::Boolean(flag) => out.write_i32::<LittleEndian>(i32::from(*flag))?,
        Value::Int8(v) => out.write_i8(*v)?,
        Value::Uint8(v) => out.write_u8(*v)?,
        Value::Int16(v) => out.write_i16::<LittleEndian>(*v)?,
        Value::Uint16(v) => out.write_u16::<LittleEndian>(*v)?,
        Value::Int32(v) => out.write_i32::<LittleEndian>(*v)?,
        Value::Uint32(v) => out.write_u32::<LittleEndian>(*v)?,
        Value::Int64(v) => out.write_i64::<LittleEndian>(*v)?,
        Value::Uint64(v) => out.write_u64::<LittleEndian>(*v)?,
        Value::Float(v) => out.write_f32::<LittleEndian>(*v)?,
        Value::Double(v) => out.write_f64::<LittleEndian>(*v)?,
        Value::ObjectRef(handle) => out.write_u32::<LittleEndian>(handle.0)?,
        Value::String(_) | Value::Array(_) => {
            let pointer = pointer.ok_or_else(|| anyhow!("missing payload pointer"))?;
            out.write_u32::<LittleEndian>(pointer)?;
        }
    }
    Ok(())
}

fn read_slot(memory: &LinearMemory, slot: MemPtr, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        bail!("array nesting deeper than {MAX_DEPTH}");
    }
    let mut input = memory.read(slot, SLOT_SIZE)?;
    let kind = ValueKind::try_from(input.read_u8()?)?;
    let mut payload = &input[(PAYLOAD_OFFSET - 1) as usize..];

    Ok(match kind {
        ValueKind::Undefined => Value::Undefined,
        ValueKind::Null => Value::Null,
        ValueKind::Boolean => Value::Boolean(payload.read_i32::<LittleEndian>()? != 0),
        ValueKind::Int8 => Value::Int8(payload.read_i8()?),
        ValueKind::Uint8 => Value::Uint8(payload.read_u8()?),
        ValueKind::Int16 => Value::Int16(payload.read_i16::<LittleEndian>()?),
        ValueKind::Uint16 => Value::Uint16(payload.read_u16::<LittleEndian>()?),
        ValueKind::Int32 => Value::Int32(payload.read_i32::<LittleEndian>()?),
        ValueKind::Uint32 => Value::Uint32(payload.read_u32::<LittleEndian>()?),
        ValueKind::Int64 => Value::Int64(payload.read_i64::<LittleEndian>()?),
        ValueKind::Uint64 => Value::Uint64(payload.read_u64::<LittleEndian>()?),
        ValueKind::Float => Value::Float(payload.read_f32::<LittleEndian>()?),
        ValueKind::Double => Value::Double(payload.read_f64::<LittleEndian>()?),
        ValueKind::ObjectRef => Value::ObjectRef(ObjectHandle(payload.read_u32::<LittleEndian>()?)),
        ValueKind::String => {
            let pointer = payload.read_u32::<LittleEndian>()?;
            Value::String(memory.read_c_string(pointer)?)
        }
        ValueKind::Array => {
            let mut items = Vec::new();
            for element in array_element_slots(memory, slot)? {
                items.push(read_slot(memory, element, depth + 1)?);
            }
            Value::Array(items)
        }
    })
}

/// Appends the inline wire form of `value`.
pub fn write_wire_value<W: Write>(out: &mut W, value: &Value) -> Result<()> {
    write_wire(out, value, 0)
}

pub fn read_wire_value<R: Read>(input: &mut R) -> Result<Value> {
    read_wire(input, 0)
}

fn write_wire<W: Write>(out: &mut W, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        bail!("array nesting deeper than {MAX_DEPTH}");
    }
    out.write_u8(value.kind().tag())?;
    match value {
        Value::Undefined | Value::Null => {}
        Value::Boolean(flag) => out.write_u8(u8::from(*flag))?,
        Value::Int8(v) => out.write_i8(*v)?,
        Value::Uint8(v) => out.write_u8(*v)?,
        Value::Int16(v) => out.write_i16::<LittleEndian>(*v)?,
        Value::Uint16(v) => out.write_u16::<LittleEndian>(*v)?,
        Value::Int32(v) => out.write_i32::<LittleEndian>(*v)?,
        Value::Uint32(v) => out.write_u32::<LittleEndian>(*v)?,
        Value::Int64(v) => out.write_i64::<LittleEndian>(*v)?,
        Value::Uint64(v) => out.write_u64::<LittleEndian>(*v)?,
        Value::Float(v) => out.write_f32::<LittleEndian>(*v)?,
        Value::Double(v) => out.write_f64::<LittleEndian>(*v)?,
        Value::ObjectRef(handle) => out.write_u32::<LittleEndian>(handle.0)?,
        Value::String(text) => write_c_string(out, text)?,
        Value::Array(items) => {
            let count = u32::try_from(items.len()).context("array too long")?;
            out.write_u32::<LittleEndian>(count)?;
            for item in items {
                write_wire(out, item, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn read_wire<R: Read>(input: &mut R, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        bail!("array nesting deeper than {MAX_DEPTH}");
    }
    let kind = ValueKind::try_from(input.read_u8()?)?;
    Ok(match kind {
        ValueKind::Undefined => Value::Undefined,
        ValueKind::Null => Value::Null,
        ValueKind::Boolean => Value::Boolean(input.read_u8()? != 0),
        ValueKind::Int8 => Value::Int8(input.read_i8()?),
        ValueKind::Uint8 => Value::Uint8(input.read_u8()?),
        ValueKind::Int16 => Value::Int16(input.read_i16::<LittleEndian>()?),
        ValueKind::Uint16 => Value::Uint16(input.read_u16::<LittleEndian>()?),
        ValueKind::Int32 => Value::Int32(input.read_i32::<LittleEndian>()?),
        ValueKind::Uint32 => Value::Uint32(input.read_u32::<LittleEndian>()?),
        ValueKind::Int64 => Value::Int64(input.read_i64::<LittleEndian>()?),
        ValueKind::Uint64 => Value::Uint64(input.read_u64::<LittleEndian>()?),
        ValueKind::Float => Value::Float(input.read_f32::<LittleEndian>()?),
        ValueKind::Double => Value::Double(input.read_f64::<LittleEndian>()?),
        ValueKind::ObjectRef => Value::ObjectRef(ObjectHandle(input.read_u32::<LittleEndian>()?)),
        ValueKind::String => Value::String(read_c_string(input)?),
        ValueKind::Array => {
            let count = input.read_u32::<LittleEndian>()?;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(read_wire(input, depth + 1)?);
            }
            Value::Array(items)
        }
    })
}

pub(crate) fn write_c_string<W: Write>(out: &mut W, text: &str) -> Result<()> {
    if text.as_bytes().contains(&0) {
        bail!("string contains an interior NUL byte");
    }
    out.write_all(text.as_bytes())?;
    out.write_u8(0)?;
    Ok(())
}

pub(crate) fn read_c_string<R: Read>(input: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        match input.read_u8()? {
            0 => break,
            byte => bytes.push(byte),
        }
    }
    String::from_utf8(bytes).context("string is not valid UTF-8")
}
