//! CatchError node: receives faults that no connected `@error` output handled
//! in its flow state or any flow state called from it.
//!
//! The scheduler writes the fault text into `message`. The node forwards it
//! through its `message` output and pulses `seqout`.

use anyhow::Result;

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition, CATCH_ERROR_BEHAVIOR, CATCH_ERROR_INPUT};
use crate::types::PortType;

pub struct CatchErrorBehavior;

impl ExecuteBehavior for CatchErrorBehavior {
    fn behavior_name(&self) -> &str {
        CATCH_ERROR_BEHAVIOR
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data(CATCH_ERROR_INPUT, PortType::Str, false)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data(CATCH_ERROR_INPUT, PortType::Str, false)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let Some(message) = ctx.get_input_value(CATCH_ERROR_INPUT).cloned() else {
            return Ok(None);
        };
        ctx.clear_input_value(CATCH_ERROR_INPUT);
        ctx.propagate_value(CATCH_ERROR_INPUT, message)?;
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
