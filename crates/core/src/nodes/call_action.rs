//! Sub-flow invocation.
//!
//! `CallAction` starts the action flow named by its `action` property as a
//! child of the current flow state and pulses `seqout` once the child has
//! finished. Inside the action flow, `Output` forwards its `value` input to the
//! calling component's output named by its `name` property.

use anyhow::{anyhow, Result};

use super::literal_property;
use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::types::PortType;

pub struct CallActionBehavior;

impl ExecuteBehavior for CallActionBehavior {
    fn behavior_name(&self) -> &str {
        "CallAction"
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let action = literal_property(ctx, "action")?.to_string();
        ctx.execute_call_action(&action)?;
        Ok(None)
    }
}

pub struct OutputBehavior;

impl ExecuteBehavior for OutputBehavior {
    fn behavior_name(&self) -> &str {
        "Output"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("value", PortType::Any, true)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let name = literal_property(ctx, "name")?.to_string();
        let value = ctx
            .get_input_value("value")
            .cloned()
            .ok_or_else(|| anyhow!("{}: input 'value' is required", ctx.component_id()))?;
        ctx.propagate_value_to_caller(&name, value);
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
