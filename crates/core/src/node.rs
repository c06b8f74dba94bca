use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::types::PortType;

/// Implicit sequence input present on every component.
pub const SEQIN: &str = "seqin";
/// Implicit sequence output present on every component.
pub const SEQOUT: &str = "seqout";
/// Implicit output that receives fault messages when connected.
pub const ERROR_OUTPUT: &str = "@error";
/// Behavior that raises faults; its faults are caught from the parent flow.
pub const ERROR_BEHAVIOR: &str = "Error";
/// Behavior receiving faults no `@error` output handled.
pub const CATCH_ERROR_BEHAVIOR: &str = "CatchError";
/// Input of a `CatchError` component that receives the fault message.
pub const CATCH_ERROR_INPUT: &str = "message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub is_sequence: bool,
}

impl PortDefinition {
    pub fn data(name: &str, port_type: PortType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required,
            is_sequence: false,
        }
    }

    pub fn sequence(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port_type: PortType::Any,
            required: false,
            is_sequence: true,
        }
    }
}

/// Cancellation callback returned by a long-running invocation.
///
/// Consumed by [`Disposer::dispose`], so it can run at most once.
pub struct Disposer {
    callback: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl Disposer {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn dispose(self) -> Result<()> {
        (self.callback)()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposer")
    }
}

/// Behavior executed when a component's record becomes ready.
pub trait ExecuteBehavior: Send + Sync {
    fn behavior_name(&self) -> &str;

    /// Ports a component of this kind must declare at least.
    fn input_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        Vec::new()
    }

    /// Behaviors that need host OS facilities are dispatched back to the host
    /// when the graph runs inside the VM.
    fn requires_host(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>>;
}
