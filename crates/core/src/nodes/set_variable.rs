//! SetVariable node: assigns its `value` input to the variable named by the
//! `variable` property.
//!
//! The innermost flow state declaring the variable receives the write. Globals
//! come last. A name nobody declares becomes a local of the current flow state.

use anyhow::{anyhow, Result};

use super::literal_property;
use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::types::PortType;

pub struct SetVariableBehavior;

impl ExecuteBehavior for SetVariableBehavior {
    fn behavior_name(&self) -> &str {
        "SetVariable"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("value", PortType::Any, true)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let variable = literal_property(ctx, "variable")?.to_string();
        let value = ctx
            .get_input_value("value")
            .cloned()
            .ok_or_else(|| anyhow!("{}: input 'value' is required", ctx.component_id()))?;
        ctx.assign_variable(&variable, value);
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
