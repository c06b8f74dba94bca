use std::collections::BTreeMap;
use std::sync::Arc;

use seqflow_core::debug_event::RuntimeEvent;
use seqflow_core::debugger::{ComponentRef, DebuggerCommand, SessionState, StepMode};
use seqflow_core::flow_state::FlowStateHandle;
use seqflow_core::graph::{ComponentInstance, FlowGraph, FlowKind, Project};
use seqflow_core::node::{PortDefinition, SEQIN, SEQOUT};
use seqflow_core::registry::build_default_registry;
use seqflow_core::scheduler::{Scheduler, TickOutcome};
use seqflow_core::types::{PortType, Value};

/// `a -> b -> c`, each stage adding one to the running total.
fn chain() -> Project {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(
        ComponentInstance::new("a", "Constant")
            .with_output(PortDefinition::data("value", PortType::Any, false))
            .with_property("value", "1"),
    )
    .expect("add a");
    for (id, prev) in [("b", "a"), ("c", "b")] {
        flow.add_component(
            ComponentInstance::new(id, "Constant")
                .with_input(PortDefinition::data("value", PortType::Any, true))
                .with_output(PortDefinition::data("value", PortType::Any, false))
                .with_property("value", "value + 1"),
        )
        .expect("add stage");
        flow.connect(prev, "value", id, "value").expect("data");
        flow.connect(prev, SEQOUT, id, SEQIN).expect("sequence");
    }
    flow.add_component(
        ComponentInstance::new("store", "SetVariable")
            .with_input(PortDefinition::data("value", PortType::Any, true))
            .with_property("variable", "total"),
    )
    .expect("add store");
    flow.connect("c", "value", "store", "value").expect("store");

    Project {
        flows: vec![flow],
        globals: BTreeMap::new(),
    }
}

fn attached() -> Scheduler {
    let mut scheduler =
        Scheduler::new(chain(), Arc::new(build_default_registry())).expect("valid project");
    scheduler
        .apply_debugger_command(DebuggerCommand::Attach)
        .expect("attach");
    scheduler
}

fn total(scheduler: &Scheduler, handle: FlowStateHandle) -> Option<Value> {
    scheduler
        .flow_state(handle)
        .and_then(|state| state.variable("total"))
        .cloned()
}

fn paused_component(scheduler: &Scheduler) -> Option<String> {
    scheduler
        .debugger()
        .paused_at()
        .map(|at| at.target.component.clone())
}

#[test]
fn breakpoint_pause_and_continue_reach_same_result() {
    let mut plain =
        Scheduler::new(chain(), Arc::new(build_default_registry())).expect("valid project");
    let plain_main = plain.start_page_flows()[0];
    plain.run_until_idle(8).expect("run");
    let expected = total(&plain, plain_main);
    assert_eq!(expected, Some(Value::Int32(3)));

    let mut debugged = attached();
    debugged
        .apply_debugger_command(DebuggerCommand::AddBreakpoint {
            target: ComponentRef::new("main", "b"),
        })
        .expect("breakpoint");
    let main = debugged.start_page_flows()[0];

    assert_eq!(debugged.tick_all().expect("tick"), TickOutcome::Paused);
    assert_eq!(paused_component(&debugged).as_deref(), Some("b"));
    let snapshot = debugged.debugger().last_snapshot().expect("snapshot");
    assert!(matches!(snapshot.state, SessionState::Paused(_)));
    assert_eq!(snapshot.queue.first().map(|entry| entry.target.component.as_str()), Some("b"));

    debugged
        .apply_debugger_command(DebuggerCommand::Continue)
        .expect("continue");
    debugged.run_until_idle(8).expect("resume");
    assert_eq!(total(&debugged, main), expected);
}

#[test]
fn step_into_halts_before_each_following_record() {
    let mut scheduler = attached();
    scheduler
        .apply_debugger_command(DebuggerCommand::Pause)
        .expect("pause");
    let main = scheduler.start_page_flows()[0];

    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Paused);
    assert_eq!(paused_component(&scheduler).as_deref(), Some("a"));

    let mut visited = Vec::new();
    for _ in 0..3 {
        scheduler
            .apply_debugger_command(DebuggerCommand::Step {
                mode: StepMode::Into,
            })
            .expect("step");
        assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Paused);
        visited.extend(paused_component(&scheduler));
    }
    assert_eq!(visited, vec!["b", "c", "store"]);
    assert!(total(&scheduler, main).is_none());

    scheduler
        .apply_debugger_command(DebuggerCommand::Continue)
        .expect("continue");
    scheduler.run_until_idle(4).expect("finish");
    assert_eq!(total(&scheduler, main), Some(Value::Int32(3)));
}

#[test]
fn continue_does_not_rehalt_on_the_same_breakpoint() {
    let mut scheduler = attached();
    scheduler
        .apply_debugger_command(DebuggerCommand::AddBreakpoint {
            target: ComponentRef::new("main", "c"),
        })
        .expect("breakpoint");
    scheduler.start_page_flows();

    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Paused);
    scheduler
        .apply_debugger_command(DebuggerCommand::Continue)
        .expect("continue");
    assert!(matches!(
        scheduler.tick_all().expect("resume"),
        TickOutcome::Executed(_)
    ));
    assert!(!scheduler.debugger().is_paused());

    let events = scheduler.drain_events();
    let pauses = events
        .iter()
        .filter(|event| matches!(event, RuntimeEvent::Paused { .. }))
        .count();
    assert_eq!(pauses, 1);
    assert!(events.iter().any(|event| matches!(event, RuntimeEvent::Resumed)));
}

#[test]
fn detached_session_ignores_breakpoints() {
    let mut scheduler = attached();
    scheduler
        .apply_debugger_command(DebuggerCommand::AddBreakpoint {
            target: ComponentRef::new("main", "a"),
        })
        .expect("breakpoint");
    scheduler
        .apply_debugger_command(DebuggerCommand::Detach)
        .expect("detach");
    let main = scheduler.start_page_flows()[0];

    scheduler.run_until_idle(8).expect("run");
    assert_eq!(total(&scheduler, main), Some(Value::Int32(3)));
    assert_eq!(scheduler.breakpoints().len(), 1);
}

#[test]
fn breakpoint_on_unknown_component_is_rejected() {
    let mut scheduler = attached();
    let result = scheduler.apply_debugger_command(DebuggerCommand::AddBreakpoint {
        target: ComponentRef::new("main", "missing"),
    });
    assert!(result.is_err());
    assert!(scheduler.breakpoints().is_empty());
}

#[test]
fn snapshot_reports_watches_and_serializes() {
    let mut scheduler = attached();
    scheduler
        .apply_debugger_command(DebuggerCommand::AddWatch {
            expression: "total * 10".to_string(),
        })
        .expect("watch");
    scheduler
        .apply_debugger_command(DebuggerCommand::AddWatch {
            expression: "nope +".to_string(),
        })
        .expect("watch");
    scheduler.start_page_flows();
    scheduler.run_until_idle(8).expect("run");

    let snapshot = scheduler.debug_snapshot();
    assert_eq!(snapshot.watches.len(), 2);
    assert_eq!(snapshot.watches[0].value, Some(Value::Int32(30)));
    assert!(snapshot.watches[1].error.is_some());
    assert_eq!(snapshot.active_flows.len(), 1);
    assert!(snapshot.active_flows[0].finished);

    let json = serde_json::to_value(&snapshot).expect("serialize snapshot");
    assert_eq!(json["active_flows"][0]["flow"], "main");
}
