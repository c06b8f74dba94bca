use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::context::{
    ContinuationCommand, ContinuationMessage, DataScope, ExecutionContext, HostCallback,
};
use crate::debug_event::{
    FaultKind, LogRecord, RuntimeEvent, RuntimeLogs, Severity, DEFAULT_LOG_CAPACITY,
};
use crate::debugger::{
    Breakpoint, ComponentRef, DebugSnapshot, DebuggerCommand, DebuggerSession, FlowRelation,
    FlowSummary, PausedAt, QueueEntry, RecordSummary, WatchValue,
};
use crate::expression::{self, Scope};
use crate::flow_state::{
    is_ready, ComponentRecord, FlowArena, FlowState, FlowStateHandle, LiveContinuation,
    RecordKey, RecordStatus,
};
use crate::graph::{ComponentIndex, FlowKind, Project};
use crate::node::{
    Disposer, CATCH_ERROR_BEHAVIOR, CATCH_ERROR_INPUT, ERROR_BEHAVIOR, ERROR_OUTPUT, SEQOUT,
};
use crate::registry::BehaviorRegistry;
use crate::types::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub log_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No record was ready.
    Idle,
    /// This many records ran.
    Executed(usize),
    /// The debugger halted before a record.
    Paused,
}

/// Outstanding `send_message_to_component` request, waiting for the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRequest {
    pub id: u64,
    pub flow_state: FlowStateHandle,
    pub component: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy)]
struct TickCursor {
    flow_state: FlowStateHandle,
    next: ComponentIndex,
    executed: usize,
}

struct ScopeView<'a> {
    arena: &'a FlowArena,
    globals: &'a BTreeMap<String, Value>,
}

impl DataScope for ScopeView<'_> {
    fn lookup_variable(&self, flow_state: Option<FlowStateHandle>, name: &str) -> Option<Value> {
        let mut current = flow_state;
        while let Some(handle) = current {
            let Some(state) = self.arena.get(handle) else {
                break;
            };
            if let Some(value) = state.variables.get(name) {
                return Some(value.clone());
            }
            current = state.parent;
        }
        self.globals.get(name).cloned()
    }
}

struct WatchScope<'a> {
    view: ScopeView<'a>,
    flow_state: Option<FlowStateHandle>,
}

impl Scope for WatchScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.view.lookup_variable(self.flow_state, name)
    }
}

struct RecordScope<'a> {
    inputs: &'a HashMap<String, Value>,
    view: ScopeView<'a>,
    flow_state: FlowStateHandle,
}

impl Scope for RecordScope<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.inputs
            .get(name)
            .cloned()
            .or_else(|| self.view.lookup_variable(Some(self.flow_state), name))
    }
}

/// Single-threaded, tick-driven executor of flow states.
///
/// Within one flow state, ready records run in declaration order and each at
/// most once per tick. Propagations are applied as soon as an invocation
/// returns, so later records see them in the same tick.
pub struct Scheduler {
    project: Arc<Project>,
    registry: Arc<BehaviorRegistry>,
    arena: FlowArena,
    globals: BTreeMap<String, Value>,
    debugger: DebuggerSession,
    logs: RuntimeLogs,
    events: Vec<RuntimeEvent>,
    continuation_tx: UnboundedSender<ContinuationMessage>,
    continuation_rx: UnboundedReceiver<ContinuationMessage>,
    next_epoch: u64,
    host_requests: Vec<HostRequest>,
    host_callbacks: HashMap<u64, (RecordKey, HostCallback)>,
    host_responses: VecDeque<(u64, Value)>,
    next_request_id: u64,
    cursor: Option<TickCursor>,
    round: VecDeque<FlowStateHandle>,
    round_executed: usize,
}

impl Scheduler {
    pub fn new(project: Project, registry: Arc<BehaviorRegistry>) -> Result<Self> {
        Self::with_options(project, registry, SchedulerOptions::default())
    }

    pub fn with_options(
        project: Project,
        registry: Arc<BehaviorRegistry>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        project.validate(&registry)?;
        let (continuation_tx, continuation_rx) = unbounded_channel();
        Ok(Self {
            globals: project.globals.clone(),
            project: Arc::new(project),
            registry,
            arena: FlowArena::new(),
            debugger: DebuggerSession::new(),
            logs: RuntimeLogs::with_capacity(options.log_capacity),
            events: Vec::new(),
            continuation_tx,
            continuation_rx,
            next_epoch: 1,
            host_requests: Vec::new(),
            host_callbacks: HashMap::new(),
            host_responses: VecDeque::new(),
            next_request_id: 1,
            cursor: None,
            round: VecDeque::new(),
            round_executed: 0,
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn registry(&self) -> &Arc<BehaviorRegistry> {
        &self.registry
    }

    /// Swaps in a new graph. Every flow state is torn down first.
    pub fn reload(&mut self, project: Project) -> Result<()> {
        project.validate(&self.registry)?;
        for handle in self.arena.handles() {
            if self.arena.get(handle).is_some_and(|state| state.parent.is_none()) {
                self.teardown(handle);
            }
        }
        self.globals = project.globals.clone();
        self.project = Arc::new(project);
        self.cursor = None;
        self.round.clear();
        self.round_executed = 0;
        self.debugger.reset_run_state();
        info!("project reloaded");
        Ok(())
    }

    pub fn start_flow(&mut self, name: &str) -> Result<FlowStateHandle> {
        let index = self
            .project
            .flow_index(name)
            .ok_or_else(|| anyhow!("unknown flow: {name}"))?;
        Ok(self.create_flow_state(index, None, None))
    }

    /// Starts every page flow, in declaration order.
    pub fn start_page_flows(&mut self) -> Vec<FlowStateHandle> {
        let pages: Vec<usize> = self
            .project
            .flows
            .iter()
            .enumerate()
            .filter(|(_, flow)| flow.kind == FlowKind::Page)
            .map(|(index, _)| index)
            .collect();
        pages
            .into_iter()
            .map(|index| self.create_flow_state(index, None, None))
            .collect()
    }

    /// Tears down a flow state and everything it started. Disposers run once.
    pub fn stop_flow(&mut self, handle: FlowStateHandle) -> Result<()> {
        let state = self
            .arena
            .get(handle)
            .ok_or_else(|| anyhow!("unknown flow state {handle}"))?;
        let caller = state.parent.zip(state.owner);
        self.teardown(handle);

        if let Some((parent, owner)) = caller {
            let key = RecordKey {
                flow_state: parent,
                component: owner,
            };
            if let Some(record) = self.arena.record_mut(key) {
                if record.waiting_on == Some(handle) {
                    record.waiting_on = None;
                    refresh_status(record);
                }
            }
        }
        Ok(())
    }

    /// Runs one tick of a single flow state.
    pub fn tick(&mut self, handle: FlowStateHandle) -> Result<TickOutcome> {
        if self.debugger.is_paused() {
            return Ok(TickOutcome::Paused);
        }
        if !self.arena.contains(handle) {
            bail!("unknown flow state {handle}");
        }
        if self.cursor.map(|c| c.flow_state) != Some(handle) {
            self.begin_tick();
        }
        let outcome = self.tick_flow(handle)?;
        if outcome != TickOutcome::Paused {
            self.complete_finished_flows();
        }
        Ok(outcome)
    }

    /// Runs one tick of every live flow state in creation order. A round
    /// interrupted by the debugger resumes where it halted.
    pub fn tick_all(&mut self) -> Result<TickOutcome> {
        if self.debugger.is_paused() {
            return Ok(TickOutcome::Paused);
        }
        if self.round.is_empty() {
            self.begin_tick();
            self.round = self.arena.handles().into();
            self.round_executed = 0;
        }

        // Popped before ticking: a tick may tear down flow states, including
        // the one being ticked, and teardown prunes the round.
        while let Some(handle) = self.round.pop_front() {
            if self.arena.contains(handle) {
                match self.tick_flow(handle)? {
                    TickOutcome::Paused => {
                        self.round.push_front(handle);
                        return Ok(TickOutcome::Paused);
                    }
                    TickOutcome::Executed(count) => self.round_executed += count,
                    TickOutcome::Idle => {}
                }
            }
        }

        self.complete_finished_flows();
        let executed = std::mem::take(&mut self.round_executed);
        Ok(if executed > 0 {
            TickOutcome::Executed(executed)
        } else {
            TickOutcome::Idle
        })
    }

    /// Ticks until nothing runs, the debugger halts, or `max_ticks` is hit.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> Result<TickOutcome> {
        let mut last = TickOutcome::Idle;
        for _ in 0..max_ticks {
            last = self.tick_all()?;
            if matches!(last, TickOutcome::Idle | TickOutcome::Paused) {
                break;
            }
        }
        Ok(last)
    }

    pub fn flow_states(&self) -> Vec<FlowStateHandle> {
        self.arena.handles()
    }

    pub fn flow_state(&self, handle: FlowStateHandle) -> Option<&FlowState> {
        self.arena.get(handle)
    }

    pub fn flow_name(&self, handle: FlowStateHandle) -> Option<&str> {
        let state = self.arena.get(handle)?;
        Some(self.project.flow(state.flow_index)?.name.as_str())
    }

    pub fn record(&self, handle: FlowStateHandle, component_id: &str) -> Option<&ComponentRecord> {
        let state = self.arena.get(handle)?;
        let index = self
            .project
            .flow(state.flow_index)?
            .component_index(component_id)?;
        state.records.get(index)
    }

    pub fn record_status(&self, handle: FlowStateHandle, component_id: &str) -> Option<RecordStatus> {
        self.record(handle, component_id).map(ComponentRecord::status)
    }

    /// True when nothing in the flow state is ready, running, or waiting on
    /// a called flow.
    pub fn is_quiescent(&self, handle: FlowStateHandle) -> bool {
        let Some(state) = self.arena.get(handle) else {
            return true;
        };
        let Some(flow) = self.project.flow(state.flow_index) else {
            return true;
        };
        state.children.is_empty()
            && state.records.iter().enumerate().all(|(index, record)| {
                record.status != RecordStatus::Running && !is_ready(flow, index, record)
            })
    }

    /// Any record in any flow state still running.
    pub fn has_running_records(&self) -> bool {
        self.arena.handles().into_iter().any(|handle| {
            self.arena.get(handle).is_some_and(|state| {
                state
                    .records
                    .iter()
                    .any(|record| record.status == RecordStatus::Running)
            })
        })
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn logs(&self) -> &RuntimeLogs {
        &self.logs
    }

    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn debugger(&self) -> &DebuggerSession {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut DebuggerSession {
        &mut self.debugger
    }

    pub fn breakpoints(&mut self) -> Vec<Breakpoint> {
        self.debugger.breakpoints(&self.project)
    }

    pub fn apply_debugger_command(&mut self, command: DebuggerCommand) -> Result<()> {
        let was_paused = self.debugger.is_paused();
        self.debugger.apply(command, &self.project)?;
        if was_paused && !self.debugger.is_paused() {
            info!("debugger resumed");
            self.events.push(RuntimeEvent::Resumed);
        }
        Ok(())
    }

    /// Active flows, ready queue and watch values as of now.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let focus = self
            .debugger
            .paused_at()
            .map(|at| at.flow_state)
            .or_else(|| self.arena.handles().first().copied());
        self.build_snapshot(focus)
    }

    pub fn take_host_requests(&mut self) -> Vec<HostRequest> {
        std::mem::take(&mut self.host_requests)
    }

    /// Queues a host response. Its callback runs at the start of the next tick.
    pub fn respond_host_request(&mut self, id: u64, response: Value) -> Result<()> {
        if !self.host_callbacks.contains_key(&id) {
            bail!("unknown host request {id}");
        }
        self.host_responses.push_back((id, response));
        Ok(())
    }

    /// Propagates a value through a component output on behalf of an external
    /// event, as if the component had produced it.
    pub fn execute_widget_action(
        &mut self,
        handle: FlowStateHandle,
        component_id: &str,
        output: &str,
        value: Value,
    ) -> Result<()> {
        let key = self.record_key(handle, component_id)?;
        let project = Arc::clone(&self.project);
        let component = self
            .arena
            .get(handle)
            .and_then(|state| project.flow(state.flow_index))
            .and_then(|flow| flow.component(key.component))
            .context("component vanished")?;
        if component.output_port(output).is_none() {
            bail!("{component_id}: unknown output '{output}'");
        }
        self.propagate(key, output, value);
        Ok(())
    }

    /// Evaluates a component property against its record's current inputs and
    /// the variables visible from the flow state.
    pub fn eval_property(
        &self,
        handle: FlowStateHandle,
        component_id: &str,
        property: &str,
    ) -> Result<Value> {
        let key = self.record_key(handle, component_id)?;
        let state = self
            .arena
            .get(handle)
            .ok_or_else(|| anyhow!("unknown flow state {handle}"))?;
        let component = self
            .project
            .flow(state.flow_index)
            .and_then(|flow| flow.component(key.component))
            .context("component vanished")?;
        let source = component
            .properties
            .get(property)
            .ok_or_else(|| anyhow!("{component_id}: property '{property}' is not defined"))?;

        let scope = RecordScope {
            inputs: &state.records[key.component].inputs,
            view: ScopeView {
                arena: &self.arena,
                globals: &self.globals,
            },
            flow_state: handle,
        };
        expression::evaluate(source, &scope)
            .with_context(|| format!("{component_id}: failed to evaluate property '{property}'"))
    }

    /// Runs a record's disposer now. Returns false when it had none.
    pub fn dispose_component(&mut self, handle: FlowStateHandle, component_id: &str) -> Result<bool> {
        let key = self.record_key(handle, component_id)?;
        let disposer = self
            .arena
            .record_mut(key)
            .and_then(|record| record.disposer.take());
        let Some(disposer) = disposer else {
            return Ok(false);
        };
        self.run_disposer(key.flow_state, component_id, disposer);
        if let Some(record) = self.arena.record_mut(key) {
            refresh_status(record);
        }
        Ok(true)
    }

    fn record_key(&self, handle: FlowStateHandle, component_id: &str) -> Result<RecordKey> {
        let state = self
            .arena
            .get(handle)
            .ok_or_else(|| anyhow!("unknown flow state {handle}"))?;
        let component = self
            .project
            .flow(state.flow_index)
            .and_then(|flow| flow.component_index(component_id))
            .ok_or_else(|| anyhow!("unknown component: {component_id}"))?;
        Ok(RecordKey {
            flow_state: handle,
            component,
        })
    }

    fn create_flow_state(
        &mut self,
        flow_index: usize,
        parent: Option<FlowStateHandle>,
        owner: Option<ComponentIndex>,
    ) -> FlowStateHandle {
        let project = Arc::clone(&self.project);
        let flow = &project.flows[flow_index];
        let handle = self
            .arena
            .insert(FlowState::new(flow_index, flow, parent, owner));
        if let Some(parent) = parent.and_then(|p| self.arena.get_mut(p)) {
            parent.children.push(handle);
        }
        info!(flow = %flow.name, flow_state = %handle, "flow state started");
        self.events.push(RuntimeEvent::FlowStarted {
            flow_state: handle,
            flow: flow.name.clone(),
        });
        handle
    }

    fn teardown(&mut self, handle: FlowStateHandle) {
        let children = match self.arena.get(handle) {
            Some(state) => state.children.clone(),
            None => return,
        };
        for child in children {
            self.teardown(child);
        }

        let Some(mut state) = self.arena.remove(handle) else {
            return;
        };
        let project = Arc::clone(&self.project);
        let flow = project.flow(state.flow_index);
        for (index, record) in state.records.iter_mut().enumerate() {
            record.continuation = None;
            if let Some(disposer) = record.disposer.take() {
                let component = flow
                    .and_then(|f| f.component(index))
                    .map(|c| c.id.as_str())
                    .unwrap_or("?");
                self.run_disposer(handle, component, disposer);
            }
        }
        if let Some(parent) = state.parent.and_then(|p| self.arena.get_mut(p)) {
            parent.children.retain(|child| *child != handle);
        }
        if self.cursor.is_some_and(|c| c.flow_state == handle) {
            self.cursor = None;
        }
        self.round.retain(|h| *h != handle);
        self.host_callbacks
            .retain(|_, (key, _)| key.flow_state != handle);
        self.host_requests.retain(|request| request.flow_state != handle);

        let flow_name = flow.map(|f| f.name.clone()).unwrap_or_default();
        info!(flow = %flow_name, flow_state = %handle, "flow state finished");
        self.events.push(RuntimeEvent::FlowFinished {
            flow_state: handle,
            flow: flow_name,
        });
    }

    fn run_disposer(&mut self, handle: FlowStateHandle, component: &str, disposer: Disposer) {
        let message = match catch_unwind(AssertUnwindSafe(|| disposer.dispose())) {
            Ok(Ok(())) => {
                debug!(flow_state = %handle, component, "disposer ran");
                return;
            }
            Ok(Err(error)) => format!("disposer failed: {error:#}"),
            Err(payload) => format!("disposer panicked: {}", panic_message(payload.as_ref())),
        };
        self.log_fault(FaultKind::Disposer, handle, component, message);
    }

    fn begin_tick(&mut self) {
        while let Some((id, response)) = self.host_responses.pop_front() {
            let Some((key, callback)) = self.host_callbacks.remove(&id) else {
                continue;
            };
            if !self.arena.contains(key.flow_state) {
                debug!(request = id, "host response for a finished flow state dropped");
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(response))) {
                let message = format!("host callback panicked: {}", panic_message(payload.as_ref()));
                self.fault(key, message);
            }
        }

        while let Ok(message) = self.continuation_rx.try_recv() {
            self.apply_continuation(message);
        }
    }

    fn apply_continuation(&mut self, message: ContinuationMessage) {
        let key = message.key;
        let live = match self.arena.record_mut(key).and_then(|r| r.continuation) {
            Some(live) if live.epoch == message.epoch => live,
            _ => {
                debug!(
                    flow_state = %key.flow_state,
                    component = key.component,
                    "stale continuation message dropped"
                );
                return;
            }
        };

        match message.command {
            ContinuationCommand::Propagate { output, value } => {
                if live.faulted {
                    return;
                }
                if self.has_output(key, &output) {
                    self.propagate(key, &output, value);
                } else {
                    let component = self.component_id(key);
                    self.fault(key, format!("{component}: unknown output '{output}'"));
                    self.mark_continuation_faulted(key);
                }
            }
            ContinuationCommand::Seqout => {
                if !live.faulted {
                    self.propagate(key, SEQOUT, Value::Null);
                }
            }
            ContinuationCommand::Throw(text) => {
                self.mark_continuation_faulted(key);
                self.fault(key, text);
            }
            ContinuationCommand::End => {
                if let Some(record) = self.arena.record_mut(key) {
                    record.continuation = None;
                    if record.status != RecordStatus::Faulted {
                        refresh_status(record);
                    }
                }
            }
            ContinuationCommand::Abandoned => {
                if let Some(record) = self.arena.record_mut(key) {
                    if let Some(live) = record.continuation.as_mut() {
                        live.abandoned = true;
                    }
                }
                let component = self.component_id(key);
                self.log_fault(
                    FaultKind::Liveness,
                    key.flow_state,
                    &component,
                    "async continuation dropped without end; record stays running".to_string(),
                );
            }
        }
    }

    fn mark_continuation_faulted(&mut self, key: RecordKey) {
        if let Some(live) = self
            .arena
            .record_mut(key)
            .and_then(|record| record.continuation.as_mut())
        {
            live.faulted = true;
        }
    }

    fn tick_flow(&mut self, handle: FlowStateHandle) -> Result<TickOutcome> {
        if self.debugger.is_paused() {
            return Ok(TickOutcome::Paused);
        }
        let (mut next, mut executed) = match self.cursor {
            Some(cursor) if cursor.flow_state == handle => {
                self.cursor = None;
                (cursor.next, cursor.executed)
            }
            _ => (0, 0),
        };
        let project = Arc::clone(&self.project);

        loop {
            let Some(state) = self.arena.get(handle) else {
                break;
            };
            if next >= state.records.len() {
                break;
            }
            let flow = project
                .flow(state.flow_index)
                .context("flow state refers to a missing flow")?;
            let index = next;
            next += 1;
            if !is_ready(flow, index, &state.records[index]) {
                continue;
            }

            let key = RecordKey {
                flow_state: handle,
                component: index,
            };
            let component = flow
                .component(index)
                .context("record without component")?;
            let target = ComponentRef::new(&flow.name, &component.id);
            let arena = &self.arena;
            let halt = self
                .debugger
                .should_halt(key, &target, |origin| relation(arena, handle, origin));
            if halt {
                self.cursor = Some(TickCursor {
                    flow_state: handle,
                    next: index,
                    executed,
                });
                self.enter_pause(key, target);
                return Ok(TickOutcome::Paused);
            }

            self.invoke(key)?;
            executed += 1;
        }

        Ok(if executed > 0 {
            TickOutcome::Executed(executed)
        } else {
            TickOutcome::Idle
        })
    }

    fn invoke(&mut self, key: RecordKey) -> Result<()> {
        let project = Arc::clone(&self.project);
        let state = self
            .arena
            .get(key.flow_state)
            .ok_or_else(|| anyhow!("unknown flow state {}", key.flow_state))?;
        let flow = project
            .flow(state.flow_index)
            .context("flow state refers to a missing flow")?;
        let component = flow
            .component(key.component)
            .context("record without component")?;

        let (previous, running_state) = {
            let record = self
                .arena
                .record_mut(key)
                .context("record vanished before invocation")?;
            (record.disposer.take(), record.running_state.take())
        };
        if let Some(disposer) = previous {
            self.run_disposer(key.flow_state, &component.id, disposer);
        }

        let behavior = match self.registry.get(&component.component_type) {
            Ok(behavior) => behavior,
            Err(error) => {
                self.consume_inputs(key, &Default::default());
                self.fault(key, format!("{error:#}"));
                return Ok(());
            }
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        debug!(flow = %flow.name, component = %component.id, "executing component");

        let (outcome, mut effects, running_state, cleared) = {
            let state = self
                .arena
                .get(key.flow_state)
                .context("flow state vanished before invocation")?;
            let scope = ScopeView {
                arena: &self.arena,
                globals: &self.globals,
            };
            let mut ctx = ExecutionContext::bound(
                &scope,
                component,
                key,
                &state.records[key.component].inputs,
                running_state,
                epoch,
                &self.continuation_tx,
            );
            let outcome = catch_unwind(AssertUnwindSafe(|| behavior.execute(&mut ctx)));
            let (effects, running_state, cleared) = ctx.into_parts();
            (outcome, effects, running_state, cleared)
        };

        self.events.push(RuntimeEvent::ComponentExecuted {
            flow_state: key.flow_state,
            flow: flow.name.clone(),
            component: component.id.clone(),
        });

        let disposer = match outcome {
            Ok(Ok(disposer)) => disposer,
            Ok(Err(error)) => {
                effects.fault.get_or_insert_with(|| format!("{error:#}"));
                None
            }
            Err(payload) => {
                effects
                    .fault
                    .get_or_insert_with(|| format!("panicked: {}", panic_message(payload.as_ref())));
                None
            }
        };

        if let Some(record) = self.arena.record_mut(key) {
            record.running_state = running_state;
            record.disposer = disposer;
            if effects.async_started {
                record.continuation = Some(LiveContinuation {
                    epoch,
                    faulted: effects.fault.is_some(),
                    abandoned: false,
                });
            }
        }
        self.consume_inputs(key, &cleared);

        // Work recorded before a fault still lands; the fault only cancels
        // seqout and the call action.
        let fault = effects.fault.take();
        for message in effects.logs {
            self.log_info(key.flow_state, &component.id, message);
        }
        for (name, value) in effects.assignments {
            self.assign_variable(key.flow_state, &name, value);
        }
        for (payload, callback) in effects.host_messages {
            let id = self.next_request_id;
            self.next_request_id += 1;
            self.host_requests.push(HostRequest {
                id,
                flow_state: key.flow_state,
                component: component.id.clone(),
                payload,
            });
            self.host_callbacks.insert(id, (key, callback));
        }
        for (output, value) in effects.propagations {
            self.propagate(key, &output, value);
        }
        if !effects.caller_outputs.is_empty() {
            self.propagate_to_caller(key, effects.caller_outputs);
        }
        if let Some(message) = fault {
            self.fault(key, message);
            return Ok(());
        }

        if let Some(action) = effects.call_action {
            let Some(flow_index) = project.flow_index(&action) else {
                self.fault(key, format!("{}: unknown action flow '{action}'", component.id));
                return Ok(());
            };
            let child = self.create_flow_state(flow_index, Some(key.flow_state), Some(key.component));
            if let Some(record) = self.arena.record_mut(key) {
                record.waiting_on = Some(child);
            }
            if effects.seqout {
                debug!(component = %component.id, "seqout deferred until the called flow finishes");
            }
        } else if effects.seqout {
            self.propagate(key, SEQOUT, Value::Null);
        }

        if let Some(record) = self.arena.record_mut(key) {
            refresh_status(record);
        }
        Ok(())
    }

    fn consume_inputs(&mut self, key: RecordKey, cleared: &HashSet<String>) {
        let project = Arc::clone(&self.project);
        let component = self
            .arena
            .get(key.flow_state)
            .and_then(|state| project.flow(state.flow_index))
            .and_then(|flow| flow.component(key.component));
        let Some(component) = component else {
            return;
        };
        if let Some(record) = self.arena.record_mut(key) {
            record
                .inputs
                .retain(|name, _| !component.is_sequence_input(name) && !cleared.contains(name));
            record.unread.clear();
            record.start_pending = false;
            record.last_error = None;
        }
    }

    fn propagate(&mut self, key: RecordKey, output: &str, value: Value) {
        let project = Arc::clone(&self.project);
        let Some(state) = self.arena.get(key.flow_state) else {
            return;
        };
        let Some(flow) = project.flow(state.flow_index) else {
            return;
        };
        let Some(component) = flow.component(key.component) else {
            return;
        };

        self.events.push(RuntimeEvent::ValuePropagated {
            flow: flow.name.clone(),
            component: component.id.clone(),
            output: output.to_string(),
            value: value.clone(),
        });

        let targets = flow.connections_from(key.component, output);
        if let Some(state) = self.arena.get_mut(key.flow_state) {
            for (target, connection) in targets {
                state.records[target].write_input(&connection.target_port, value.clone());
            }
        }
    }

    fn propagate_to_caller(&mut self, key: RecordKey, outputs: Vec<(String, Value)>) {
        let caller = self
            .arena
            .get(key.flow_state)
            .and_then(|state| state.parent.zip(state.owner));
        let Some((parent, owner)) = caller else {
            let component = self.component_id(key);
            self.fault(key, format!("{component}: flow was not called from another flow"));
            return;
        };
        let caller_key = RecordKey {
            flow_state: parent,
            component: owner,
        };
        for (output, value) in outputs {
            if self.has_output(caller_key, &output) {
                self.propagate(caller_key, &output, value);
            } else {
                let component = self.component_id(caller_key);
                self.fault(key, format!("{component}: unknown output '{output}'"));
                return;
            }
        }
    }

    fn has_output(&self, key: RecordKey, output: &str) -> bool {
        output != ERROR_OUTPUT
            && self
                .arena
                .get(key.flow_state)
                .and_then(|state| self.project.flow(state.flow_index))
                .and_then(|flow| flow.component(key.component))
                .is_some_and(|component| component.output_port(output).is_some())
    }

    fn component_id(&self, key: RecordKey) -> String {
        self.arena
            .get(key.flow_state)
            .and_then(|state| self.project.flow(state.flow_index))
            .and_then(|flow| flow.component(key.component))
            .map(|component| component.id.clone())
            .unwrap_or_else(|| format!("#{}", key.component))
    }

    fn assign_variable(&mut self, handle: FlowStateHandle, name: &str, value: Value) {
        let mut current = Some(handle);
        while let Some(h) = current {
            let Some(state) = self.arena.get_mut(h) else {
                break;
            };
            if let Some(slot) = state.variables.get_mut(name) {
                *slot = value;
                return;
            }
            current = state.parent;
        }
        if let Some(slot) = self.globals.get_mut(name) {
            *slot = value;
            return;
        }
        if let Some(state) = self.arena.get_mut(handle) {
            state.variables.insert(name.to_string(), value);
        }
    }

    /// Marks the record faulted, logs, and routes the message to the nearest
    /// connected `@error` output, walking up through calling components. When
    /// none is wired the nearest `CatchError` component receives it instead.
    fn fault(&mut self, key: RecordKey, message: String) {
        let component = self.component_id(key);
        if let Some(record) = self.arena.record_mut(key) {
            record.status = RecordStatus::Faulted;
            record.last_error = Some(message.clone());
        }
        self.log_fault(FaultKind::Component, key.flow_state, &component, message.clone());

        if let Some(handler) = self.find_error_output(key) {
            if handler != key {
                let child = self
                    .arena
                    .record_mut(handler)
                    .and_then(|record| record.waiting_on.take());
                if let Some(child) = child {
                    self.teardown(child);
                }
                if let Some(record) = self.arena.record_mut(handler) {
                    refresh_status(record);
                }
            }
            self.propagate(handler, ERROR_OUTPUT, Value::String(message));
            return;
        }
        self.route_to_catch_error(key, message);
    }

    fn find_error_output(&self, key: RecordKey) -> Option<RecordKey> {
        let mut current = key;
        loop {
            let state = self.arena.get(current.flow_state)?;
            let flow = self.project.flow(state.flow_index)?;
            if flow.has_outgoing(current.component, ERROR_OUTPUT) {
                return Some(current);
            }
            let (parent, owner) = state.parent.zip(state.owner)?;
            current = RecordKey {
                flow_state: parent,
                component: owner,
            };
        }
    }

    /// Hands the fault to the nearest `CatchError` component. Faults raised by
    /// an `Error` component are caught starting from the parent flow state.
    /// Work queued in the faulting flow state is dropped, and a called flow
    /// below the catching flow state is stopped without pulsing its caller.
    fn route_to_catch_error(&mut self, key: RecordKey, message: String) {
        let Some(state) = self.arena.get(key.flow_state) else {
            return;
        };
        let raised_by_error = self
            .project
            .flow(state.flow_index)
            .and_then(|flow| flow.component(key.component))
            .is_some_and(|component| component.component_type == ERROR_BEHAVIOR);
        let start = if raised_by_error {
            state.parent
        } else {
            Some(key.flow_state)
        };
        let Some(catcher) = self.find_catch_error(start) else {
            debug!(flow_state = %key.flow_state, "fault has no handler");
            return;
        };

        if let Some(state) = self.arena.get_mut(key.flow_state) {
            for record in &mut state.records {
                record.unread.clear();
                record.start_pending = false;
            }
        }

        if catcher.flow_state != key.flow_state {
            let mut doomed = key.flow_state;
            while let Some(parent) = self.arena.get(doomed).and_then(|state| state.parent) {
                if parent == catcher.flow_state {
                    break;
                }
                doomed = parent;
            }
            if doomed != catcher.flow_state {
                if let Err(error) = self.stop_flow(doomed) {
                    warn!(flow_state = %doomed, "failed to stop faulted flow: {error:#}");
                }
            }
        }

        if let Some(record) = self.arena.record_mut(catcher) {
            record.write_input(CATCH_ERROR_INPUT, Value::String(message));
        }
    }

    fn find_catch_error(&self, start: Option<FlowStateHandle>) -> Option<RecordKey> {
        let mut current = start;
        while let Some(handle) = current {
            let state = self.arena.get(handle)?;
            let flow = self.project.flow(state.flow_index)?;
            let found = flow
                .components()
                .find(|(_, component)| component.component_type == CATCH_ERROR_BEHAVIOR);
            if let Some((index, _)) = found {
                return Some(RecordKey {
                    flow_state: handle,
                    component: index,
                });
            }
            current = state.parent;
        }
        None
    }

    /// Called flows that went quiescent are torn down and their caller's
    /// `seqout` is pulsed.
    fn complete_finished_flows(&mut self) {
        for handle in self.arena.handles() {
            let caller = self
                .arena
                .get(handle)
                .and_then(|state| state.parent.zip(state.owner));
            let Some((parent, owner)) = caller else {
                continue;
            };
            if !self.is_quiescent(handle) {
                continue;
            }
            self.teardown(handle);

            let key = RecordKey {
                flow_state: parent,
                component: owner,
            };
            let released = match self.arena.record_mut(key) {
                Some(record) if record.waiting_on == Some(handle) => {
                    record.waiting_on = None;
                    refresh_status(record);
                    true
                }
                _ => false,
            };
            if released {
                self.propagate(key, SEQOUT, Value::Null);
            }
        }
    }

    fn enter_pause(&mut self, key: RecordKey, target: ComponentRef) {
        let snapshot = self.build_snapshot(Some(key.flow_state));
        info!(flow = %target.flow, component = %target.component, "debugger paused");
        self.events.push(RuntimeEvent::Paused {
            flow_state: key.flow_state,
            flow: target.flow.clone(),
            component: target.component.clone(),
        });
        self.debugger.halt(
            PausedAt {
                flow_state: key.flow_state,
                component_index: key.component,
                target,
            },
            snapshot,
        );
    }

    fn build_snapshot(&self, focus: Option<FlowStateHandle>) -> DebugSnapshot {
        let mut active_flows = Vec::new();
        let mut queue = Vec::new();

        for handle in self.arena.handles() {
            let Some(state) = self.arena.get(handle) else {
                continue;
            };
            let Some(flow) = self.project.flow(state.flow_index) else {
                continue;
            };
            let mut running = Vec::new();
            let mut stalled = Vec::new();
            let mut records = Vec::new();
            for (index, component) in flow.components() {
                let record = &state.records[index];
                records.push(RecordSummary {
                    component: component.id.clone(),
                    status: record.status,
                    inputs: record
                        .inputs
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                    last_error: record.last_error.clone(),
                });
                if record.status == RecordStatus::Running {
                    running.push(component.id.clone());
                }
                if record.is_stalled() {
                    stalled.push(component.id.clone());
                }
                if is_ready(flow, index, record) {
                    queue.push(QueueEntry {
                        flow_state: handle,
                        target: ComponentRef::new(&flow.name, &component.id),
                    });
                }
            }
            active_flows.push(FlowSummary {
                flow_state: handle,
                id: state.id,
                flow: flow.name.clone(),
                parent: state.parent,
                running,
                stalled,
                variables: state.variables.clone(),
                records,
                finished: self.is_quiescent(handle),
            });
        }

        let scope = WatchScope {
            view: ScopeView {
                arena: &self.arena,
                globals: &self.globals,
            },
            flow_state: focus,
        };
        let watches = self
            .debugger
            .watches()
            .iter()
            .map(|source| match expression::evaluate(source, &scope) {
                Ok(value) => WatchValue {
                    expression: source.clone(),
                    value: Some(value),
                    error: None,
                },
                Err(error) => WatchValue {
                    expression: source.clone(),
                    value: None,
                    error: Some(error.to_string()),
                },
            })
            .collect();

        DebugSnapshot {
            state: self.debugger.state().clone(),
            active_flows,
            queue,
            watches,
            recent_logs: self.logs.recent(32),
        }
    }

    fn log_info(&mut self, handle: FlowStateHandle, component: &str, message: String) {
        info!(flow_state = %handle, component, "{message}");
        let record = LogRecord::new(Severity::Info, message).at(handle, component);
        self.logs.push(record.clone());
        self.events.push(RuntimeEvent::Log(record));
    }

    fn log_fault(&mut self, kind: FaultKind, handle: FlowStateHandle, component: &str, message: String) {
        match kind {
            FaultKind::Liveness | FaultKind::DebuggerDesync => {
                warn!(flow_state = %handle, component, fault = ?kind, "{message}")
            }
            _ => error!(flow_state = %handle, component, fault = ?kind, "{message}"),
        }
        let record = LogRecord::fault(kind, message).at(handle, component);
        self.logs.push(record.clone());
        self.events.push(RuntimeEvent::Log(record));
    }
}

fn refresh_status(record: &mut ComponentRecord) {
    record.status = if record.continuation.is_some()
        || record.disposer.is_some()
        || record.waiting_on.is_some()
    {
        RecordStatus::Running
    } else {
        RecordStatus::Idle
    };
}

fn relation(arena: &FlowArena, candidate: FlowStateHandle, origin: FlowStateHandle) -> FlowRelation {
    if candidate == origin {
        FlowRelation::Same
    } else if arena.is_within(candidate, origin) {
        FlowRelation::Descendant
    } else if arena.is_within(origin, candidate) {
        FlowRelation::Ancestor
    } else {
        FlowRelation::Unrelated
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
