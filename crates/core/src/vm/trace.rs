//! Debugger trace batching.
//!
//! The module cannot call back into the host while a tick runs, so trace
//! output is collected here and flushed once per tick as a single message.

use std::io::{Cursor, Read, Write};

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::trace;

use super::value_codec::{read_c_string, read_wire_value, write_c_string, write_wire_value};
use crate::debug_event::{RuntimeEvent, Severity};
use crate::flow_state::FlowStateHandle;
use crate::types::Value;

/// Pending and accumulated trace bytes for one module tick.
#[derive(Debug, Default)]
pub struct TraceBuffer {
    pending: Option<Vec<u8>>,
    accumulated: Option<Vec<u8>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a trace message. An unfinished previous message is finished first.
    pub fn start(&mut self) {
        self.finish();
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.pending.get_or_insert_with(Vec::new).extend_from_slice(bytes);
    }

    /// Moves the pending message onto the outbound accumulator.
    pub fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            trace!(bytes = pending.len(), "trace message finished");
            self.accumulated
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&pending);
        }
    }

    /// Everything accumulated since the last flush, if anything.
    pub fn take_flush(&mut self) -> Option<Vec<u8>> {
        self.finish();
        self.accumulated.take()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none() && self.accumulated.is_none()
    }
}

const EVENT_FLOW_STARTED: u8 = 1;
const EVENT_FLOW_FINISHED: u8 = 2;
const EVENT_COMPONENT_EXECUTED: u8 = 3;
const EVENT_VALUE_PROPAGATED: u8 = 4;
const EVENT_PAUSED: u8 = 5;
const EVENT_RESUMED: u8 = 6;
const EVENT_LOG: u8 = 7;

/// One record of the module to host trace stream.
///
/// Encoded as a kind byte, a `u32` body length, then the body.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    FlowStarted {
        flow_state: FlowStateHandle,
        flow: String,
    },
    FlowFinished {
        flow_state: FlowStateHandle,
        flow: String,
    },
    ComponentExecuted {
        flow_state: FlowStateHandle,
        component: String,
    },
    ValuePropagated {
        component: String,
        output: String,
        value: Value,
    },
    Paused {
        flow_state: FlowStateHandle,
        component: String,
    },
    Resumed,
    Log {
        severity: Severity,
        message: String,
    },
}

impl TraceEvent {
    pub fn from_runtime(event: &RuntimeEvent) -> Self {
        match event {
            RuntimeEvent::FlowStarted { flow_state, flow } => Self::FlowStarted {
                flow_state: *flow_state,
                flow: flow.clone(),
            },
            RuntimeEvent::FlowFinished { flow_state, flow } => Self::FlowFinished {
                flow_state: *flow_state,
                flow: flow.clone(),
            },
            RuntimeEvent::ComponentExecuted {
                flow_state,
                component,
                ..
            } => Self::ComponentExecuted {
                flow_state: *flow_state,
                component: component.clone(),
            },
            RuntimeEvent::ValuePropagated {
                component,
                output,
                value,
                ..
            } => Self::ValuePropagated {
                component: component.clone(),
                output: output.clone(),
                value: value.clone(),
            },
            RuntimeEvent::Paused {
                flow_state,
                component,
                ..
            } => Self::Paused {
                flow_state: *flow_state,
                component: component.clone(),
            },
            RuntimeEvent::Resumed => Self::Resumed,
            RuntimeEvent::Log(record) => Self::Log {
                severity: record.severity,
                message: record.message.clone(),
            },
        }
    }

    /// The event with its payload made encodable: a propagated value becomes
    /// `Undefined` and NUL bytes in log text are replaced. `None` when the
    /// failure lies in an identifier.
    pub fn degraded(&self) -> Option<Self> {
        match self {
            Self::ValuePropagated {
                component, output, ..
            } => Some(Self::ValuePropagated {
                component: component.clone(),
                output: output.clone(),
                value: Value::Undefined,
            }),
            Self::Log { severity, message } => Some(Self::Log {
                severity: *severity,
                message: message.replace('\0', "\u{fffd}"),
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let kind = match self {
            Self::FlowStarted { flow_state, flow } => {
                write_handle(&mut body, *flow_state)?;
                write_c_string(&mut body, flow)?;
                EVENT_FLOW_STARTED
            }
            Self::FlowFinished { flow_state, flow } => {
                write_handle(&mut body, *flow_state)?;
                write_c_string(&mut body, flow)?;
                EVENT_FLOW_FINISHED
            }
            Self::ComponentExecuted {
                flow_state,
                component,
            } => {
                write_handle(&mut body, *flow_state)?;
                write_c_string(&mut body, component)?;
                EVENT_COMPONENT_EXECUTED
            }
            Self::ValuePropagated {
                component,
                output,
                value,
            } => {
                write_c_string(&mut body, component)?;
                write_c_string(&mut body, output)?;
                write_wire_value(&mut body, value)?;
                EVENT_VALUE_PROPAGATED
            }
            Self::Paused {
                flow_state,
                component,
            } => {
                write_handle(&mut body, *flow_state)?;
                write_c_string(&mut body, component)?;
                EVENT_PAUSED
            }
            Self::Resumed => EVENT_RESUMED,
            Self::Log { severity, message } => {
                body.write_u8(severity_code(*severity))?;
                write_c_string(&mut body, message)?;
                EVENT_LOG
            }
        };

        let mut out = Vec::with_capacity(body.len() + 5);
        out.write_u8(kind)?;
        out.write_u32::<LittleEndian>(u32::try_from(body.len()).context("trace event too large")?)?;
        out.write_all(&body)?;
        Ok(out)
    }

    /// Decodes a flushed trace message into its events.
    pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut cursor = Cursor::new(bytes);
        let mut events = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            let kind = cursor.read_u8()?;
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            let start = cursor.position() as usize;
            let Some(body) = bytes.get(start..start.saturating_add(len)) else {
                bail!("trace event of {len} bytes truncated at offset {start}");
            };
            cursor.set_position((start + len) as u64);
            let mut body = Cursor::new(body);
            events.push(Self::decode_body(kind, &mut body)?);
            if (body.position() as usize) != len {
                bail!("trace event kind {kind} has {} trailing bytes", len - body.position() as usize);
            }
        }
        Ok(events)
    }

    fn decode_body<R: Read>(kind: u8, body: &mut R) -> Result<Self> {
        Ok(match kind {
            EVENT_FLOW_STARTED => Self::FlowStarted {
                flow_state: read_handle(body)?,
                flow: read_c_string(body)?,
            },
            EVENT_FLOW_FINISHED => Self::FlowFinished {
                flow_state: read_handle(body)?,
                flow: read_c_string(body)?,
            },
            EVENT_COMPONENT_EXECUTED => Self::ComponentExecuted {
                flow_state: read_handle(body)?,
                component: read_c_string(body)?,
            },
            EVENT_VALUE_PROPAGATED => Self::ValuePropagated {
                component: read_c_string(body)?,
                output: read_c_string(body)?,
                value: read_wire_value(body)?,
            },
            EVENT_PAUSED => Self::Paused {
                flow_state: read_handle(body)?,
                component: read_c_string(body)?,
            },
            EVENT_RESUMED => Self::Resumed,
            EVENT_LOG => Self::Log {
                severity: severity_from_code(body.read_u8()?)?,
                message: read_c_string(body)?,
            },
            other => bail!("unknown trace event kind {other}"),
        })
    }
}

pub(crate) fn write_handle<W: Write>(out: &mut W, handle: FlowStateHandle) -> Result<()> {
    out.write_u32::<LittleEndian>(handle.index)?;
    out.write_u32::<LittleEndian>(handle.generation)?;
    Ok(())
}

pub(crate) fn read_handle<R: Read>(input: &mut R) -> Result<FlowStateHandle> {
    Ok(FlowStateHandle {
        index: input.read_u32::<LittleEndian>()?,
        generation: input.read_u32::<LittleEndian>()?,
    })
}

fn severity_code(severity: Severity) -> u8 {
    match severity {
        Severity::Debug => 0,
        Severity::Info => 1,
        Severity::Warning => 2,
        Severity::Error => 3,
    }
}

fn severity_from_code(code: u8) -> Result<Severity> {
    Ok(match code {
        0 => Severity::Debug,
        1 => Severity::Info,
        2 => Severity::Warning,
        3 => Severity::Error,
        other => bail!("unknown severity code {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_are_batched_until_flush() {
        let mut buffer = TraceBuffer::new();
        assert!(buffer.take_flush().is_none());

        buffer.start();
        buffer.write(&[1, 2]);
        buffer.write(&[3]);
        buffer.start();
        buffer.write(&[4]);
        buffer.finish();
        buffer.finish();

        assert_eq!(buffer.take_flush(), Some(vec![1, 2, 3, 4]));
        assert!(buffer.is_empty());
        assert!(buffer.take_flush().is_none());
    }

    #[test]
    fn test_event_stream_decodes_in_order() {
        let handle = FlowStateHandle {
            index: 2,
            generation: 1,
        };
        let events = vec![
            TraceEvent::FlowStarted {
                flow_state: handle,
                flow: "main".to_string(),
            },
            TraceEvent::ValuePropagated {
                component: "a".to_string(),
                output: "value".to_string(),
                value: Value::Int32(42),
            },
            TraceEvent::Log {
                severity: Severity::Warning,
                message: "slow".to_string(),
            },
            TraceEvent::Resumed,
        ];

        let mut buffer = TraceBuffer::new();
        for event in &events {
            buffer.start();
            buffer.write(&event.encode().expect("encode"));
            buffer.finish();
        }
        let flushed = buffer.take_flush().expect("flushed bytes");
        assert_eq!(TraceEvent::decode_stream(&flushed).expect("decode"), events);
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let mut bytes = TraceEvent::Resumed.encode().expect("encode");
        let log = TraceEvent::Log {
            severity: Severity::Info,
            message: "cut".to_string(),
        };
        bytes.extend(log.encode().expect("encode"));
        bytes.pop();
        assert!(TraceEvent::decode_stream(&bytes).is_err());
    }
}
