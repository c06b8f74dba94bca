use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::debug_event::LogRecord;
use crate::flow_state::{FlowStateHandle, RecordKey, RecordStatus};
use crate::graph::{ComponentIndex, Project};
use crate::types::Value;

/// Stable reference to a component across graph reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentRef {
    pub flow: String,
    pub component: String,
}

impl ComponentRef {
    pub fn new(flow: &str, component: &str) -> Self {
        Self {
            flow: flow.to_string(),
            component: component.to_string(),
        }
    }

    /// Parses `flow/component`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (flow, component) = raw
            .split_once('/')
            .ok_or_else(|| anyhow!("expected FLOW/COMPONENT, got '{raw}'"))?;
        if flow.is_empty() || component.is_empty() {
            bail!("expected FLOW/COMPONENT, got '{raw}'");
        }
        Ok(Self::new(flow, component))
    }

    fn exists_in(&self, project: &Project) -> bool {
        project
            .flow_index(&self.flow)
            .and_then(|index| project.flow(index))
            .is_some_and(|flow| flow.component_index(&self.component).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub target: ComponentRef,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Halt at the next record anywhere, including called flows.
    Into,
    /// Halt at the next record outside flows called from the current one.
    Over,
    /// Halt once execution is outside the current flow.
    Out,
}

/// Where a candidate record's flow state sits relative to the step origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRelation {
    Same,
    Ancestor,
    Descendant,
    Unrelated,
}

impl StepMode {
    fn halts_in(self, relation: FlowRelation) -> bool {
        match self {
            Self::Into => true,
            Self::Over => relation != FlowRelation::Descendant,
            Self::Out => matches!(relation, FlowRelation::Ancestor | FlowRelation::Unrelated),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedAt {
    pub flow_state: FlowStateHandle,
    pub component_index: ComponentIndex,
    pub target: ComponentRef,
}

impl PausedAt {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            flow_state: self.flow_state,
            component: self.component_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Detached,
    Running,
    Paused(PausedAt),
}

#[derive(Debug, Clone, Copy)]
struct StepRequest {
    mode: StepMode,
    origin: FlowStateHandle,
    executed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchValue {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_state: FlowStateHandle,
    pub id: Uuid,
    pub flow: String,
    pub parent: Option<FlowStateHandle>,
    pub running: Vec<String>,
    /// Records whose continuation was dropped without `end`.
    pub stalled: Vec<String>,
    pub variables: BTreeMap<String, Value>,
    pub records: Vec<RecordSummary>,
    /// Nothing left to run and nothing running.
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub component: String,
    pub status: RecordStatus,
    pub inputs: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub flow_state: FlowStateHandle,
    pub target: ComponentRef,
}

/// What the observer sees when the scheduler halts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub state: SessionState,
    pub active_flows: Vec<FlowSummary>,
    pub queue: Vec<QueueEntry>,
    pub watches: Vec<WatchValue>,
    pub recent_logs: Vec<LogRecord>,
}

/// Commands from the observing UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DebuggerCommand {
    Attach,
    Detach,
    Continue,
    Pause,
    Step { mode: StepMode },
    AddBreakpoint { target: ComponentRef },
    RemoveBreakpoint { target: ComponentRef },
    EnableBreakpoint { target: ComponentRef },
    DisableBreakpoint { target: ComponentRef },
    EnableAllBreakpoints,
    DisableAllBreakpoints,
    RemoveAllBreakpoints,
    AddWatch { expression: String },
    SetWatch { index: usize, expression: String },
    RemoveWatch { index: usize },
}

/// Breakpoints, watches and the pause/step state machine.
///
/// The scheduler consults [`DebuggerSession::should_halt`] before every
/// invocation. Nothing here touches flow state directly.
#[derive(Debug)]
pub struct DebuggerSession {
    state: SessionState,
    breakpoints: BTreeMap<ComponentRef, bool>,
    watches: Vec<String>,
    pause_requested: bool,
    step: Option<StepRequest>,
    bypass: Option<RecordKey>,
    last_snapshot: Option<DebugSnapshot>,
}

impl DebuggerSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Detached,
            breakpoints: BTreeMap::new(),
            watches: Vec::new(),
            pause_requested: false,
            step: None,
            bypass: None,
            last_snapshot: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.state, SessionState::Detached)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, SessionState::Paused(_))
    }

    pub fn paused_at(&self) -> Option<&PausedAt> {
        match &self.state {
            SessionState::Paused(at) => Some(at),
            _ => None,
        }
    }

    pub fn last_snapshot(&self) -> Option<&DebugSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn attach(&mut self) {
        if !self.is_attached() {
            self.state = SessionState::Running;
        }
    }

    /// Breakpoints stay stored but never halt until the next attach. A paused
    /// run continues from the halted record.
    pub fn detach(&mut self) {
        if let SessionState::Paused(at) = &self.state {
            self.bypass = Some(at.key());
        }
        self.state = SessionState::Detached;
        self.pause_requested = false;
        self.step = None;
    }

    pub fn resume(&mut self) -> Result<()> {
        let SessionState::Paused(at) = &self.state else {
            bail!("debugger is not paused");
        };
        self.bypass = Some(at.key());
        self.state = SessionState::Running;
        Ok(())
    }

    /// Runs the halted record, then halts before the next record the step
    /// mode allows.
    pub fn step(&mut self, mode: StepMode) -> Result<()> {
        let SessionState::Paused(at) = &self.state else {
            bail!("debugger is not paused");
        };
        self.step = Some(StepRequest {
            mode,
            origin: at.flow_state,
            executed: false,
        });
        self.bypass = Some(at.key());
        self.state = SessionState::Running;
        Ok(())
    }

    /// Halts before the next record the scheduler is about to run.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            SessionState::Detached => bail!("debugger is detached"),
            SessionState::Paused(_) => Ok(()),
            SessionState::Running => {
                self.pause_requested = true;
                Ok(())
            }
        }
    }

    pub fn add_breakpoint(&mut self, target: ComponentRef) {
        self.breakpoints.insert(target, true);
    }

    pub fn remove_breakpoint(&mut self, target: &ComponentRef) -> bool {
        self.breakpoints.remove(target).is_some()
    }

    pub fn enable_breakpoint(&mut self, target: &ComponentRef) -> Result<()> {
        self.set_breakpoint_enabled(target, true)
    }

    pub fn disable_breakpoint(&mut self, target: &ComponentRef) -> Result<()> {
        self.set_breakpoint_enabled(target, false)
    }

    fn set_breakpoint_enabled(&mut self, target: &ComponentRef, enabled: bool) -> Result<()> {
        let slot = self
            .breakpoints
            .get_mut(target)
            .ok_or_else(|| anyhow!("no breakpoint on {}/{}", target.flow, target.component))?;
        *slot = enabled;
        Ok(())
    }

    pub fn enable_all_breakpoints(&mut self) {
        self.breakpoints.values_mut().for_each(|enabled| *enabled = true);
    }

    pub fn disable_all_breakpoints(&mut self) {
        self.breakpoints.values_mut().for_each(|enabled| *enabled = false);
    }

    pub fn remove_all_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Drops breakpoints on components missing from `project`.
    pub fn prune_breakpoints(&mut self, project: &Project) -> usize {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|target, _| target.exists_in(project));
        let pruned = before - self.breakpoints.len();
        if pruned > 0 {
            debug!(pruned, "pruned breakpoints on missing components");
        }
        pruned
    }

    /// Breakpoint list after pruning against the current graph.
    pub fn breakpoints(&mut self, project: &Project) -> Vec<Breakpoint> {
        self.prune_breakpoints(project);
        self.breakpoints
            .iter()
            .map(|(target, enabled)| Breakpoint {
                target: target.clone(),
                enabled: *enabled,
            })
            .collect()
    }

    pub fn has_enabled_breakpoint(&self, target: &ComponentRef) -> bool {
        self.breakpoints.get(target).copied().unwrap_or(false)
    }

    pub fn add_watch(&mut self, expression: &str) {
        self.watches.push(expression.to_string());
    }

    pub fn set_watch(&mut self, index: usize, expression: &str) -> Result<()> {
        let slot = self
            .watches
            .get_mut(index)
            .ok_or_else(|| anyhow!("no watch expression at index {index}"))?;
        *slot = expression.to_string();
        Ok(())
    }

    pub fn remove_watch(&mut self, index: usize) -> Result<String> {
        if index >= self.watches.len() {
            bail!("no watch expression at index {index}");
        }
        Ok(self.watches.remove(index))
    }

    pub fn watches(&self) -> &[String] {
        &self.watches
    }

    /// Applies everything except the run-control commands that need the
    /// scheduler's bookkeeping, which it handles itself.
    pub fn apply(&mut self, command: DebuggerCommand, project: &Project) -> Result<()> {
        match command {
            DebuggerCommand::Attach => self.attach(),
            DebuggerCommand::Detach => self.detach(),
            DebuggerCommand::Continue => self.resume()?,
            DebuggerCommand::Pause => self.pause()?,
            DebuggerCommand::Step { mode } => self.step(mode)?,
            DebuggerCommand::AddBreakpoint { target } => {
                if !target.exists_in(project) {
                    bail!("unknown component {}/{}", target.flow, target.component);
                }
                self.add_breakpoint(target);
            }
            DebuggerCommand::RemoveBreakpoint { target } => {
                self.remove_breakpoint(&target);
            }
            DebuggerCommand::EnableBreakpoint { target } => self.enable_breakpoint(&target)?,
            DebuggerCommand::DisableBreakpoint { target } => self.disable_breakpoint(&target)?,
            DebuggerCommand::EnableAllBreakpoints => self.enable_all_breakpoints(),
            DebuggerCommand::DisableAllBreakpoints => self.disable_all_breakpoints(),
            DebuggerCommand::RemoveAllBreakpoints => self.remove_all_breakpoints(),
            DebuggerCommand::AddWatch { expression } => self.add_watch(&expression),
            DebuggerCommand::SetWatch { index, expression } => {
                self.set_watch(index, &expression)?
            }
            DebuggerCommand::RemoveWatch { index } => {
                self.remove_watch(index)?;
            }
        }
        Ok(())
    }

    /// Halt check run before each invocation.
    pub(crate) fn should_halt<F>(&mut self, key: RecordKey, target: &ComponentRef, relation: F) -> bool
    where
        F: Fn(FlowStateHandle) -> FlowRelation,
    {
        if self.bypass == Some(key) {
            self.bypass = None;
            if let Some(step) = self.step.as_mut() {
                step.executed = true;
            }
            return false;
        }
        if !self.is_attached() {
            return false;
        }
        if self.pause_requested {
            return true;
        }
        if let Some(step) = self.step {
            if step.executed && step.mode.halts_in(relation(step.origin)) {
                return true;
            }
        }
        self.has_enabled_breakpoint(target)
    }

    /// Forgets the halted position, keeping breakpoints and watches.
    pub(crate) fn reset_run_state(&mut self) {
        if self.is_paused() {
            self.state = SessionState::Running;
        }
        self.pause_requested = false;
        self.step = None;
        self.bypass = None;
    }

    pub(crate) fn halt(&mut self, at: PausedAt, snapshot: DebugSnapshot) {
        self.state = SessionState::Paused(at);
        self.pause_requested = false;
        self.step = None;
        self.last_snapshot = Some(DebugSnapshot {
            state: self.state.clone(),
            ..snapshot
        });
    }
}

impl Default for DebuggerSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ComponentInstance, FlowGraph, FlowKind};

    fn project() -> Project {
        let mut flow = FlowGraph::new("main", FlowKind::Page);
        flow.add_component(ComponentInstance::new("a", "Start"))
            .expect("add a");
        flow.add_component(ComponentInstance::new("b", "Log"))
            .expect("add b");
        Project {
            flows: vec![flow],
            globals: BTreeMap::new(),
        }
    }

    fn key(component: ComponentIndex) -> RecordKey {
        RecordKey {
            flow_state: FlowStateHandle {
                index: 0,
                generation: 0,
            },
            component,
        }
    }

    fn empty_snapshot() -> DebugSnapshot {
        DebugSnapshot {
            state: SessionState::Running,
            active_flows: vec![],
            queue: vec![],
            watches: vec![],
            recent_logs: vec![],
        }
    }

    fn paused_at(component: ComponentIndex, name: &str) -> PausedAt {
        PausedAt {
            flow_state: key(component).flow_state,
            component_index: component,
            target: ComponentRef::new("main", name),
        }
    }

    #[test]
    fn test_detached_breakpoints_are_inert() {
        let mut session = DebuggerSession::new();
        let target = ComponentRef::new("main", "b");
        session.add_breakpoint(target.clone());

        assert!(!session.should_halt(key(1), &target, |_| FlowRelation::Same));

        session.attach();
        assert!(session.should_halt(key(1), &target, |_| FlowRelation::Same));

        session.disable_breakpoint(&target).expect("breakpoint exists");
        assert!(!session.should_halt(key(1), &target, |_| FlowRelation::Same));
    }

    #[test]
    fn test_resume_bypasses_halted_record_once() {
        let mut session = DebuggerSession::new();
        let target = ComponentRef::new("main", "b");
        session.attach();
        session.add_breakpoint(target.clone());
        session.halt(paused_at(1, "b"), empty_snapshot());
        assert!(session.is_paused());

        session.resume().expect("resume from pause");
        assert!(!session.should_halt(key(1), &target, |_| FlowRelation::Same));
        assert!(session.should_halt(key(1), &target, |_| FlowRelation::Same));
    }

    #[test]
    fn test_step_halts_after_one_record() {
        let mut session = DebuggerSession::new();
        session.attach();
        session.halt(paused_at(0, "a"), empty_snapshot());
        session.step(StepMode::Over).expect("step from pause");

        let a = ComponentRef::new("main", "a");
        let b = ComponentRef::new("main", "b");
        assert!(!session.should_halt(key(0), &a, |_| FlowRelation::Same));
        assert!(!session.should_halt(key(5), &b, |_| FlowRelation::Descendant));
        assert!(session.should_halt(key(1), &b, |_| FlowRelation::Same));
    }

    #[test]
    fn test_step_out_skips_same_flow() {
        let mut session = DebuggerSession::new();
        session.attach();
        session.halt(paused_at(0, "a"), empty_snapshot());
        session.step(StepMode::Out).expect("step out");

        let a = ComponentRef::new("main", "a");
        let b = ComponentRef::new("main", "b");
        assert!(!session.should_halt(key(0), &a, |_| FlowRelation::Same));
        assert!(!session.should_halt(key(1), &b, |_| FlowRelation::Same));
        assert!(session.should_halt(key(1), &b, |_| FlowRelation::Ancestor));
    }

    #[test]
    fn test_pause_requires_attach_and_resume_requires_pause() {
        let mut session = DebuggerSession::new();
        assert!(session.pause().is_err());
        assert!(session.resume().is_err());

        session.attach();
        session.pause().expect("pause while running");
        let target = ComponentRef::new("main", "a");
        assert!(session.should_halt(key(0), &target, |_| FlowRelation::Same));
    }

    #[test]
    fn test_bulk_breakpoint_operations_and_pruning() {
        let project = project();
        let mut session = DebuggerSession::new();
        session.add_breakpoint(ComponentRef::new("main", "a"));
        session.add_breakpoint(ComponentRef::new("main", "b"));
        session.add_breakpoint(ComponentRef::new("gone", "x"));

        session.disable_all_breakpoints();
        let listed = session.breakpoints(&project);
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|bp| !bp.enabled));

        session.enable_all_breakpoints();
        assert!(session.breakpoints(&project).iter().all(|bp| bp.enabled));

        session.remove_all_breakpoints();
        assert!(session.breakpoints(&project).is_empty());
    }

    #[test]
    fn test_apply_commands_and_watches() {
        let project = project();
        let mut session = DebuggerSession::new();

        let command: DebuggerCommand = serde_json::from_value(serde_json::json!({
            "command": "add_breakpoint",
            "target": {"flow": "main", "component": "b"}
        }))
        .expect("command parses");
        session.apply(command, &project).expect("add breakpoint");
        assert!(session.has_enabled_breakpoint(&ComponentRef::new("main", "b")));

        let unknown = DebuggerCommand::AddBreakpoint {
            target: ComponentRef::new("main", "zzz"),
        };
        assert!(session.apply(unknown, &project).is_err());

        session.add_watch("x + 1");
        session.set_watch(0, "x + 2").expect("set watch");
        assert_eq!(session.watches(), &["x + 2".to_string()]);
        assert!(session.remove_watch(3).is_err());
        assert_eq!(session.remove_watch(0).expect("remove watch"), "x + 2");
    }

    #[test]
    fn test_component_ref_parse() {
        assert_eq!(
            ComponentRef::parse("main/b").expect("parse"),
            ComponentRef::new("main", "b")
        );
        assert!(ComponentRef::parse("main").is_err());
        assert!(ComponentRef::parse("/b").is_err());
    }
}
