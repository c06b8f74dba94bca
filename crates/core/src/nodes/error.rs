//! Error node: faults with the evaluated `message` property.

use anyhow::Result;

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior};
use crate::types::Value;

pub struct ErrorBehavior;

impl ExecuteBehavior for ErrorBehavior {
    fn behavior_name(&self) -> &str {
        "Error"
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let message = match ctx.eval_property("message")? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        ctx.throw_error(message);
        Ok(None)
    }
}
