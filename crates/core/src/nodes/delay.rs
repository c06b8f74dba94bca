//! Delay node: pulses `seqout` after `milliseconds` have elapsed.
//!
//! The wait runs off the scheduler thread. On a tokio runtime it is a spawned
//! task, otherwise a plain thread. The result comes back through an
//! [`AsyncContinuation`](crate::context::AsyncContinuation), so the record
//! stays running until the timer fires.

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::node::{Disposer, ExecuteBehavior};

pub struct DelayBehavior;

impl ExecuteBehavior for DelayBehavior {
    fn behavior_name(&self) -> &str {
        "Delay"
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let raw = ctx.eval_property("milliseconds")?;
        let Some(millis) = raw.as_i64() else {
            bail!(
                "{}: property 'milliseconds' must be an integer, got {raw}",
                ctx.component_id()
            );
        };
        if millis < 0 {
            bail!(
                "{}: property 'milliseconds' must not be negative, got {millis}",
                ctx.component_id()
            );
        }
        let delay = Duration::from_millis(millis as u64);
        let continuation = ctx.start_async_execution()?;
        debug!(component = %ctx.component_id(), ?delay, "delay started");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    continuation.propagate_value_through_seqout();
                    continuation.end();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    continuation.propagate_value_through_seqout();
                    continuation.end();
                });
            }
        }
        Ok(None)
    }
}
