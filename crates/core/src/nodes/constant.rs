//! Constant node: evaluates its `value` property and emits the result.
//!
//! The property is an expression, so `"40 + 2"`, `"'text'"` and references to
//! variables all work. The result goes to the `value` output, then `seqout`.

use anyhow::Result;

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::types::PortType;

pub struct ConstantBehavior;

impl ExecuteBehavior for ConstantBehavior {
    fn behavior_name(&self) -> &str {
        "Constant"
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("value", PortType::Any, false)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let value = ctx.eval_property("value")?;
        ctx.propagate_value("value", value)?;
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
