//! Start node: pulses `seqout` once when its flow state starts.

use anyhow::Result;

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior};

pub struct StartBehavior;

impl ExecuteBehavior for StartBehavior {
    fn behavior_name(&self) -> &str {
        "Start"
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        ctx.propagate_value_through_seqout();
        Ok(None)
    }
}
