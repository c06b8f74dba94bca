//! SplitLines node: turns a stream of text chunks into complete lines.
//!
//! Text after the last newline is kept in the component execution state and
//! prefixed to the next chunk. A truthy `flush` input emits the remainder.

use anyhow::{bail, Result};

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::types::{PortType, Value};

#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

pub struct SplitLinesBehavior;

impl ExecuteBehavior for SplitLinesBehavior {
    fn behavior_name(&self) -> &str {
        "SplitLines"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::data("chunk", PortType::Str, true),
            PortDefinition::data("flush", PortType::Boolean, false),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("lines", PortType::Array, false)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let chunk = match ctx.get_input_value("chunk") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => bail!(
                "{}: input 'chunk' must be a string, got {:?}",
                ctx.component_id(),
                other.kind()
            ),
            None => String::new(),
        };
        let flush = ctx.get_input_value("flush").is_some_and(Value::is_truthy);
        ctx.clear_input_value("flush");

        let component_id = ctx.component_id().to_string();
        if ctx.component_execution_state::<LineBuffer>().is_none() {
            ctx.set_component_execution_state(LineBuffer::default());
        }
        let Some(buffer) = ctx.component_execution_state_mut::<LineBuffer>() else {
            bail!("{component_id}: line buffer unavailable");
        };
        let mut lines = buffer.push(&chunk);
        if flush {
            lines.extend(buffer.flush());
        }

        if !lines.is_empty() {
            let lines = lines.into_iter().map(Value::String).collect();
            ctx.propagate_value("lines", Value::Array(lines))?;
            ctx.propagate_value_through_seqout();
        }
        Ok(None)
    }
}
