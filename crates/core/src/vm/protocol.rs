//! Wire format of the host and module channels.
//!
//! Every message is a frame: a `u32` body length, a channel byte, then the
//! body. Host and module bodies are a sequence of sections, each introduced by
//! a section byte. All integers are little-endian. A frame that fails to decode
//! is dropped by the receiver; the channel keeps going.

use std::io::{Cursor, Read, Write};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::trace::{read_handle, write_handle, TraceEvent};
use super::value_codec::{read_c_string, read_wire_value, write_c_string, write_wire_value};
use crate::flow_state::FlowStateHandle;
use crate::types::Value;

const CHANNEL_HOST: u8 = b'H';
const CHANNEL_MODULE: u8 = b'M';
const CHANNEL_TRACE: u8 = b'T';

const SECTION_GRAPH: u8 = 1;
const SECTION_WHEEL: u8 = 2;
const SECTION_POINTER: u8 = 3;
const SECTION_GLOBALS: u8 = 4;
const SECTION_DEBUGGER: u8 = 5;
const SECTION_WIDGET_ACTIONS: u8 = 6;
const SECTION_EVAL_PROPERTIES: u8 = 7;
const SECTION_FRAME: u8 = 16;
const SECTION_PROPERTY_VALUES: u8 = 17;

const FRAME_HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEvent {
    pub x: i32,
    pub y: i32,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelEvent {
    pub delta_y: i32,
    pub clicked: bool,
}

/// New value for the global at `index` in the compiled graph's global table.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalUpdate {
    pub index: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WidgetAction {
    pub flow_state: FlowStateHandle,
    pub component: String,
    pub output: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRequest {
    pub request_id: u32,
    pub flow_state: FlowStateHandle,
    pub component: String,
    pub property: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyValue {
    pub request_id: u32,
    pub result: std::result::Result<Value, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// RGBA, row-major.
    pub pixels: Vec<u8>,
}

/// Host to module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMessage {
    pub graph: Option<Vec<u8>>,
    pub wheel: Option<WheelEvent>,
    pub pointer_events: Vec<PointerEvent>,
    pub global_updates: Vec<GlobalUpdate>,
    /// JSON-encoded debugger command.
    pub debugger_command: Option<Vec<u8>>,
    pub widget_actions: Vec<WidgetAction>,
    pub eval_properties: Vec<PropertyRequest>,
}

/// Module to host, one per processed [`HostMessage`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleMessage {
    pub frame: Option<Frame>,
    pub property_values: Vec<PropertyValue>,
}

impl HostMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        if let Some(graph) = &self.graph {
            body.write_u8(SECTION_GRAPH)?;
            write_blob(&mut body, graph)?;
        }
        if let Some(wheel) = &self.wheel {
            body.write_u8(SECTION_WHEEL)?;
            body.write_i32::<LittleEndian>(wheel.delta_y)?;
            body.write_u8(u8::from(wheel.clicked))?;
        }
        if !self.pointer_events.is_empty() {
            body.write_u8(SECTION_POINTER)?;
            write_count(&mut body, self.pointer_events.len())?;
            for event in &self.pointer_events {
                body.write_i32::<LittleEndian>(event.x)?;
                body.write_i32::<LittleEndian>(event.y)?;
                body.write_u8(u8::from(event.pressed))?;
            }
        }
        if !self.global_updates.is_empty() {
            body.write_u8(SECTION_GLOBALS)?;
            write_count(&mut body, self.global_updates.len())?;
            for update in &self.global_updates {
                body.write_u32::<LittleEndian>(update.index)?;
                write_wire_value(&mut body, &update.value)?;
            }
        }
        if let Some(command) = &self.debugger_command {
            body.write_u8(SECTION_DEBUGGER)?;
            write_blob(&mut body, command)?;
        }
        if !self.widget_actions.is_empty() {
            body.write_u8(SECTION_WIDGET_ACTIONS)?;
            write_count(&mut body, self.widget_actions.len())?;
            for action in &self.widget_actions {
                write_handle(&mut body, action.flow_state)?;
                write_c_string(&mut body, &action.component)?;
                write_c_string(&mut body, &action.output)?;
                write_wire_value(&mut body, &action.value)?;
            }
        }
        if !self.eval_properties.is_empty() {
            body.write_u8(SECTION_EVAL_PROPERTIES)?;
            write_count(&mut body, self.eval_properties.len())?;
            for request in &self.eval_properties {
                body.write_u32::<LittleEndian>(request.request_id)?;
                write_handle(&mut body, request.flow_state)?;
                write_c_string(&mut body, &request.component)?;
                write_c_string(&mut body, &request.property)?;
            }
        }
        frame(CHANNEL_HOST, &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = open_frame(bytes, CHANNEL_HOST)?;
        let mut cursor = Cursor::new(body);
        let mut message = Self::default();

        while !at_end(&cursor) {
            match cursor.read_u8()? {
                SECTION_GRAPH => message.graph = Some(read_blob(&mut cursor)?),
                SECTION_WHEEL => {
                    message.wheel = Some(WheelEvent {
                        delta_y: cursor.read_i32::<LittleEndian>()?,
                        clicked: cursor.read_u8()? != 0,
                    })
                }
                SECTION_POINTER => {
                    for _ in 0..read_count(&mut cursor, 9)? {
                        message.pointer_events.push(PointerEvent {
                            x: cursor.read_i32::<LittleEndian>()?,
                            y: cursor.read_i32::<LittleEndian>()?,
                            pressed: cursor.read_u8()? != 0,
                        });
                    }
                }
                SECTION_GLOBALS => {
                    for _ in 0..read_count(&mut cursor, 5)? {
                        message.global_updates.push(GlobalUpdate {
                            index: cursor.read_u32::<LittleEndian>()?,
                            value: read_wire_value(&mut cursor)?,
                        });
                    }
                }
                SECTION_DEBUGGER => message.debugger_command = Some(read_blob(&mut cursor)?),
                SECTION_WIDGET_ACTIONS => {
                    for _ in 0..read_count(&mut cursor, 11)? {
                        message.widget_actions.push(WidgetAction {
                            flow_state: read_handle(&mut cursor)?,
                            component: read_c_string(&mut cursor)?,
                            output: read_c_string(&mut cursor)?,
                            value: read_wire_value(&mut cursor)?,
                        });
                    }
                }
                SECTION_EVAL_PROPERTIES => {
                    for _ in 0..read_count(&mut cursor, 14)? {
                        message.eval_properties.push(PropertyRequest {
                            request_id: cursor.read_u32::<LittleEndian>()?,
                            flow_state: read_handle(&mut cursor)?,
                            component: read_c_string(&mut cursor)?,
                            property: read_c_string(&mut cursor)?,
                        });
                    }
                }
                other => bail!("unknown host message section {other}"),
            }
        }
        Ok(message)
    }
}

impl ModuleMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        if let Some(frame) = &self.frame {
            body.write_u8(SECTION_FRAME)?;
            body.write_u32::<LittleEndian>(frame.width)?;
            body.write_u32::<LittleEndian>(frame.height)?;
            write_blob(&mut body, &frame.pixels)?;
        }
        if !self.property_values.is_empty() {
            body.write_u8(SECTION_PROPERTY_VALUES)?;
            write_count(&mut body, self.property_values.len())?;
            for value in &self.property_values {
                body.write_u32::<LittleEndian>(value.request_id)?;
                match &value.result {
                    Ok(value) => {
                        body.write_u8(1)?;
                        write_wire_value(&mut body, value)?;
                    }
                    Err(error) => {
                        body.write_u8(0)?;
                        write_c_string(&mut body, &error.replace('\0', " "))?;
                    }
                }
            }
        }
        frame(CHANNEL_MODULE, &body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = open_frame(bytes, CHANNEL_MODULE)?;
        let mut cursor = Cursor::new(body);
        let mut message = Self::default();

        while !at_end(&cursor) {
            match cursor.read_u8()? {
                SECTION_FRAME => {
                    let width = cursor.read_u32::<LittleEndian>()?;
                    let height = cursor.read_u32::<LittleEndian>()?;
                    let pixels = read_blob(&mut cursor)?;
                    let expected = (width as u64) * (height as u64) * 4;
                    if pixels.len() as u64 != expected {
                        bail!(
                            "frame of {width}x{height} carries {} bytes, expected {expected}",
                            pixels.len()
                        );
                    }
                    message.frame = Some(Frame {
                        width,
                        height,
                        pixels,
                    });
                }
                SECTION_PROPERTY_VALUES => {
                    for _ in 0..read_count(&mut cursor, 6)? {
                        let request_id = cursor.read_u32::<LittleEndian>()?;
                        let result = match cursor.read_u8()? {
                            0 => Err(read_c_string(&mut cursor)?),
                            _ => Ok(read_wire_value(&mut cursor)?),
                        };
                        message
                            .property_values
                            .push(PropertyValue { request_id, result });
                    }
                }
                other => bail!("unknown module message section {other}"),
            }
        }
        Ok(message)
    }
}

/// Wraps a flushed trace batch for the trace channel.
pub fn encode_trace_frame(trace: &[u8]) -> Result<Vec<u8>> {
    frame(CHANNEL_TRACE, trace)
}

pub fn decode_trace_frame(bytes: &[u8]) -> Result<Vec<TraceEvent>> {
    TraceEvent::decode_stream(open_frame(bytes, CHANNEL_TRACE)?)
}

fn frame(channel: u8, body: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(body.len()).context("message body too large")?;
    let mut out = Vec::with_capacity(body.len() + FRAME_HEADER_SIZE);
    out.write_u32::<LittleEndian>(len)?;
    out.write_u8(channel)?;
    out.write_all(body)?;
    Ok(out)
}

fn open_frame(bytes: &[u8], channel: u8) -> Result<&[u8]> {
    let mut header = bytes;
    let len = header
        .read_u32::<LittleEndian>()
        .context("frame shorter than its header")? as usize;
    let found = header.read_u8().context("frame shorter than its header")?;
    if found != channel {
        bail!(
            "frame for channel '{}' received on channel '{}'",
            found as char,
            channel as char
        );
    }
    let body = &bytes[FRAME_HEADER_SIZE..];
    if body.len() != len {
        bail!("frame declares {len} body bytes but carries {}", body.len());
    }
    Ok(body)
}

fn at_end(cursor: &Cursor<&[u8]>) -> bool {
    cursor.position() as usize >= cursor.get_ref().len()
}

fn write_count<W: Write>(out: &mut W, count: usize) -> Result<()> {
    out.write_u32::<LittleEndian>(u32::try_from(count).context("too many entries")?)?;
    Ok(())
}

/// Reads an entry count, rejecting counts the remaining bytes cannot hold.
fn read_count(cursor: &mut Cursor<&[u8]>, min_entry_size: usize) -> Result<u32> {
    let count = cursor.read_u32::<LittleEndian>()?;
    let remaining = remaining(cursor);
    if (count as usize).saturating_mul(min_entry_size) > remaining {
        bail!("section declares {count} entries but only {remaining} bytes remain");
    }
    Ok(count)
}

fn write_blob<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    write_count(out, bytes.len())?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    if len > remaining(cursor) {
        return Err(anyhow!(
            "blob of {len} bytes exceeds the {} remaining",
            remaining(cursor)
        ));
    }
    let mut bytes = vec![0; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}
