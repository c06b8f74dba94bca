//! Log node: writes its `value` input to the runtime log.

use anyhow::{anyhow, Result};

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::types::{PortType, Value};

pub struct LogBehavior;

impl ExecuteBehavior for LogBehavior {
    fn behavior_name(&self) -> &str {
        "Log"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("value", PortType::Any, true)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let value = ctx
            .get_input_value("value")
            .cloned()
            .ok_or_else(|| anyhow!("{}: input 'value' is required", ctx.component_id()))?;

        let message = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let message = if ctx.has_property("prefix") {
            format!("{}{message}", ctx.eval_property("prefix")?)
        } else {
            message
        };
        ctx.log_info(message);
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
