//! Builtin behaviors registered by [`crate::registry::register_builtin_behaviors`].

pub mod call_action;
pub mod catch_error;
pub mod constant;
pub mod delay;
pub mod error;
pub mod log;
pub mod set_variable;
pub mod split_lines;
pub mod start;

use anyhow::{anyhow, Result};

use crate::context::ExecutionContext;

/// Raw text of a property, without evaluating it as an expression.
pub(crate) fn literal_property<'c>(ctx: &'c ExecutionContext<'_>, name: &str) -> Result<&'c str> {
    ctx.component()
        .properties
        .get(name)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| anyhow!("{}: property '{}' is not defined", ctx.component_id(), name))
}
