use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::expression::{self, Scope};
use crate::flow_state::{FlowStateHandle, RecordKey};
use crate::graph::{ComponentIndex, ComponentInstance};
use crate::node::{ERROR_OUTPUT, SEQOUT};
use crate::types::Value;

/// Callback for a host request made through `send_message_to_component`.
pub type HostCallback = Box<dyn FnOnce(Value) + Send>;

/// Variable lookup across the data contexts visible from a flow state.
pub trait DataScope {
    fn lookup_variable(&self, flow_state: Option<FlowStateHandle>, name: &str) -> Option<Value>;
}

/// Scope with globals only, for contexts not bound to a flow state.
pub struct DetachedScope<'a> {
    pub globals: &'a BTreeMap<String, Value>,
}

impl DataScope for DetachedScope<'_> {
    fn lookup_variable(&self, _flow_state: Option<FlowStateHandle>, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ContinuationCommand {
    Propagate { output: String, value: Value },
    Seqout,
    Throw(String),
    End,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContinuationMessage {
    pub key: RecordKey,
    pub epoch: u64,
    pub command: ContinuationCommand,
}

/// Token returned by `start_async_execution`.
///
/// Every call is forwarded to the scheduler and applied at the start of its
/// next tick, in send order. `end` consumes the token. Dropping it without
/// `end` leaves the record running and reports a liveness fault.
pub struct AsyncContinuation {
    key: RecordKey,
    epoch: u64,
    sender: UnboundedSender<ContinuationMessage>,
    ended: bool,
}

impl AsyncContinuation {
    pub fn key(&self) -> RecordKey {
        self.key
    }

    pub fn propagate_value(&self, output: &str, value: Value) {
        self.send(ContinuationCommand::Propagate {
            output: output.to_string(),
            value,
        });
    }

    pub fn propagate_value_through_seqout(&self) {
        self.send(ContinuationCommand::Seqout);
    }

    pub fn throw_error(&self, message: impl Into<String>) {
        self.send(ContinuationCommand::Throw(message.into()));
    }

    /// Releases the continuation. Safe from any thread.
    pub fn end(mut self) {
        self.ended = true;
        self.send(ContinuationCommand::End);
    }

    fn send(&self, command: ContinuationCommand) {
        let message = ContinuationMessage {
            key: self.key,
            epoch: self.epoch,
            command,
        };
        if self.sender.send(message).is_err() {
            debug!(
                flow_state = %self.key.flow_state,
                component = self.key.component,
                "scheduler is gone; continuation message discarded"
            );
        }
    }
}

impl Drop for AsyncContinuation {
    fn drop(&mut self) {
        if !self.ended {
            warn!(
                flow_state = %self.key.flow_state,
                component = self.key.component,
                "async continuation dropped without end; record stays running"
            );
            self.send(ContinuationCommand::Abandoned);
        }
    }
}

/// Side effects recorded during one invocation. The scheduler applies them
/// after the behavior returns: data first, then `seqout`.
#[derive(Default)]
pub(crate) struct Effects {
    pub propagations: Vec<(String, Value)>,
    pub caller_outputs: Vec<(String, Value)>,
    pub seqout: bool,
    pub fault: Option<String>,
    pub logs: Vec<String>,
    pub assignments: Vec<(String, Value)>,
    pub host_messages: Vec<(Value, HostCallback)>,
    pub call_action: Option<String>,
    pub async_started: bool,
}

struct PropertyScope<'b> {
    inputs: &'b HashMap<String, Value>,
    cleared: &'b HashSet<String>,
    scope: &'b dyn DataScope,
    flow_state: Option<FlowStateHandle>,
}

impl Scope for PropertyScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        if !self.cleared.contains(name) {
            if let Some(value) = self.inputs.get(name) {
                return Some(value.clone());
            }
        }
        self.scope.lookup_variable(self.flow_state, name)
    }
}

/// Capability object handed to a behavior for one invocation.
pub struct ExecutionContext<'a> {
    scope: &'a dyn DataScope,
    component: &'a ComponentInstance,
    key: Option<RecordKey>,
    inputs: &'a HashMap<String, Value>,
    cleared: HashSet<String>,
    running_state: Option<Box<dyn Any + Send>>,
    effects: Effects,
    epoch: u64,
    sender: Option<&'a UnboundedSender<ContinuationMessage>>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn bound(
        scope: &'a dyn DataScope,
        component: &'a ComponentInstance,
        key: RecordKey,
        inputs: &'a HashMap<String, Value>,
        running_state: Option<Box<dyn Any + Send>>,
        epoch: u64,
        sender: &'a UnboundedSender<ContinuationMessage>,
    ) -> Self {
        Self {
            scope,
            component,
            key: Some(key),
            inputs,
            cleared: HashSet::new(),
            running_state,
            effects: Effects::default(),
            epoch,
            sender: Some(sender),
        }
    }

    /// Context not bound to any flow state. Async execution is unavailable.
    pub fn detached(
        scope: &'a dyn DataScope,
        component: &'a ComponentInstance,
        inputs: &'a HashMap<String, Value>,
    ) -> Self {
        Self {
            scope,
            component,
            key: None,
            inputs,
            cleared: HashSet::new(),
            running_state: None,
            effects: Effects::default(),
            epoch: 0,
            sender: None,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component.id
    }

    pub fn component(&self) -> &ComponentInstance {
        self.component
    }

    pub fn flow_state(&self) -> Option<FlowStateHandle> {
        self.key.map(|key| key.flow_state)
    }

    pub fn component_index(&self) -> Option<ComponentIndex> {
        self.key.map(|key| key.component)
    }

    pub fn get_input_value(&self, name: &str) -> Option<&Value> {
        if self.cleared.contains(name) {
            return None;
        }
        self.inputs.get(name)
    }

    pub fn clear_input_value(&mut self, name: &str) {
        self.cleared.insert(name.to_string());
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.component.properties.contains_key(name)
    }

    /// Evaluates the expression bound to a property. Inputs shadow variables.
    pub fn eval_property(&self, name: &str) -> Result<Value> {
        let source = self.component.properties.get(name).ok_or_else(|| {
            anyhow!(
                "{}: property '{}' is not defined",
                self.component.id,
                name
            )
        })?;
        let scope = PropertyScope {
            inputs: self.inputs,
            cleared: &self.cleared,
            scope: self.scope,
            flow_state: self.flow_state(),
        };
        expression::evaluate(source, &scope).map_err(|error| {
            anyhow!(
                "{}: failed to evaluate property '{}': {error}",
                self.component.id,
                name
            )
        })
    }

    pub fn propagate_value(&mut self, output: &str, value: Value) -> Result<()> {
        if output == SEQOUT {
            self.propagate_value_through_seqout();
            return Ok(());
        }
        if output == ERROR_OUTPUT || self.component.output_port(output).is_none() {
            bail!("{}: unknown output '{}'", self.component.id, output);
        }
        if self.effects.fault.is_some() {
            debug!(component = %self.component.id, output, "propagation after fault suppressed");
            return Ok(());
        }
        self.effects.propagations.push((output.to_string(), value));
        Ok(())
    }

    /// Pulses `seqout`. Delivery happens after every data propagation of
    /// this invocation.
    pub fn propagate_value_through_seqout(&mut self) {
        self.effects.seqout = true;
    }

    pub fn start_async_execution(&mut self) -> Result<AsyncContinuation> {
        let (Some(key), Some(sender)) = (self.key, self.sender) else {
            bail!(
                "{}: async execution is not available in a detached context",
                self.component.id
            );
        };
        if self.effects.async_started {
            warn!(component = %self.component.id, "second start_async_execution rejected");
            bail!(
                "{}: async execution already started for this invocation",
                self.component.id
            );
        }
        self.effects.async_started = true;
        Ok(AsyncContinuation {
            key,
            epoch: self.epoch,
            sender: sender.clone(),
            ended: false,
        })
    }

    /// Faults this invocation. Later propagations from it are dropped.
    pub fn throw_error(&mut self, message: impl Into<String>) {
        if self.effects.fault.is_none() {
            self.effects.fault = Some(message.into());
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.effects.fault.is_some()
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.effects.logs.push(message.into());
    }

    pub fn component_execution_state<T: 'static>(&self) -> Option<&T> {
        self.running_state.as_ref()?.downcast_ref::<T>()
    }

    pub fn component_execution_state_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.running_state.as_mut()?.downcast_mut::<T>()
    }

    pub fn set_component_execution_state<T: Any + Send>(&mut self, state: T) {
        self.running_state = Some(Box::new(state));
    }

    pub fn clear_component_execution_state(&mut self) {
        self.running_state = None;
    }

    /// Request/response side channel to the host surface. The callback runs
    /// at the start of a later tick.
    pub fn send_message_to_component(&mut self, payload: Value, callback: HostCallback) {
        self.effects.host_messages.push((payload, callback));
    }

    pub fn assign_variable(&mut self, name: &str, value: Value) {
        self.effects.assignments.push((name.to_string(), value));
    }

    /// Starts an action flow as a child of this flow state. The record stays
    /// running until the child finishes, then its `seqout` is pulsed.
    pub fn execute_call_action(&mut self, flow_name: &str) -> Result<()> {
        if self.key.is_none() {
            bail!(
                "{}: call action is not available in a detached context",
                self.component.id
            );
        }
        self.effects.call_action = Some(flow_name.to_string());
        Ok(())
    }

    /// Propagates through an output of the component that called this flow.
    pub fn propagate_value_to_caller(&mut self, output: &str, value: Value) {
        if self.effects.fault.is_none() {
            self.effects.caller_outputs.push((output.to_string(), value));
        }
    }

    pub(crate) fn into_parts(self) -> (Effects, Option<Box<dyn Any + Send>>, HashSet<String>) {
        (self.effects, self.running_state, self.cleared)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::node::PortDefinition;
    use crate::types::PortType;

    fn component() -> ComponentInstance {
        ComponentInstance::new("b", "Copy")
            .with_input(PortDefinition::data("x", PortType::Integer, true))
            .with_output(PortDefinition::data("y", PortType::Integer, false))
            .with_property("doubled", "x * 2")
            .with_property("greeting", "prefix + '!'")
    }

    fn key() -> RecordKey {
        RecordKey {
            flow_state: FlowStateHandle {
                index: 0,
                generation: 0,
            },
            component: 1,
        }
    }

    #[test]
    fn test_eval_property_reads_inputs_then_variables() {
        let globals = BTreeMap::from([("prefix".to_string(), Value::from("hi"))]);
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::from([("x".to_string(), Value::Int32(21))]);
        let mut ctx = ExecutionContext::detached(&scope, &component, &inputs);

        assert_eq!(ctx.eval_property("doubled").expect("doubled"), Value::Int32(42));
        assert_eq!(ctx.eval_property("greeting").expect("greeting"), Value::from("hi!"));

        ctx.clear_input_value("x");
        assert!(ctx.get_input_value("x").is_none());
        assert!(ctx.eval_property("doubled").is_err());

        let err = ctx.eval_property("missing").expect_err("undefined property");
        assert_eq!(err.to_string(), "b: property 'missing' is not defined");
    }

    #[test]
    fn test_propagate_rejects_unknown_output_and_stops_after_fault() {
        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::new();
        let mut ctx = ExecutionContext::detached(&scope, &component, &inputs);

        assert!(ctx.propagate_value("nope", Value::Null).is_err());
        assert!(ctx.propagate_value(ERROR_OUTPUT, Value::Null).is_err());
        ctx.propagate_value("y", Value::Int32(1)).expect("first propagation");
        ctx.throw_error("boom");
        ctx.propagate_value("y", Value::Int32(2)).expect("suppressed, not an error");

        let (effects, _, _) = ctx.into_parts();
        assert_eq!(effects.propagations, vec![("y".to_string(), Value::Int32(1))]);
        assert_eq!(effects.fault.as_deref(), Some("boom"));
    }

    #[test]
    fn test_second_start_async_is_rejected() {
        let (tx, mut rx) = unbounded_channel();
        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::new();
        let mut ctx =
            ExecutionContext::bound(&scope, &component, key(), &inputs, None, 7, &tx);

        let token = ctx.start_async_execution().expect("first start");
        assert!(ctx.start_async_execution().is_err());

        token.propagate_value("y", Value::Int32(3));
        token.end();

        let first = rx.try_recv().expect("propagate message");
        assert_eq!(first.epoch, 7);
        assert_eq!(
            first.command,
            ContinuationCommand::Propagate {
                output: "y".to_string(),
                value: Value::Int32(3)
            }
        );
        assert_eq!(rx.try_recv().expect("end message").command, ContinuationCommand::End);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_continuation_reports_abandoned() {
        let (tx, mut rx) = unbounded_channel();
        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::new();
        let mut ctx =
            ExecutionContext::bound(&scope, &component, key(), &inputs, None, 1, &tx);

        drop(ctx.start_async_execution().expect("start"));
        assert_eq!(
            rx.try_recv().expect("abandoned message").command,
            ContinuationCommand::Abandoned
        );
    }

    #[test]
    fn test_detached_context_cannot_go_async() {
        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::new();
        let mut ctx = ExecutionContext::detached(&scope, &component, &inputs);
        assert!(ctx.start_async_execution().is_err());
        assert!(ctx.execute_call_action("sub").is_err());
    }

    #[test]
    fn test_execution_state_slot() {
        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let component = component();
        let inputs = HashMap::new();
        let mut ctx = ExecutionContext::detached(&scope, &component, &inputs);

        assert!(ctx.component_execution_state::<u32>().is_none());
        ctx.set_component_execution_state(5u32);
        *ctx.component_execution_state_mut::<u32>().expect("state") += 1;
        assert_eq!(ctx.component_execution_state::<u32>(), Some(&6));
        assert!(ctx.component_execution_state::<String>().is_none());
    }
}
