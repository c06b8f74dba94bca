use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use seqflow_core::context::{AsyncContinuation, ExecutionContext};
use seqflow_core::debug_event::{FaultKind, RuntimeEvent};
use seqflow_core::flow_state::{FlowStateHandle, RecordStatus};
use seqflow_core::graph::{ComponentInstance, FlowGraph, FlowKind, Project};
use seqflow_core::node::{Disposer, ExecuteBehavior, PortDefinition, ERROR_OUTPUT, SEQIN, SEQOUT};
use seqflow_core::registry::{build_default_registry, BehaviorRegistry};
use seqflow_core::scheduler::{Scheduler, TickOutcome};
use seqflow_core::types::{PortType, Value};

fn constant(id: &str, expression: &str) -> ComponentInstance {
    ComponentInstance::new(id, "Constant")
        .with_output(PortDefinition::data("value", PortType::Any, false))
        .with_property("value", expression)
}

fn set_variable(id: &str, variable: &str) -> ComponentInstance {
    ComponentInstance::new(id, "SetVariable")
        .with_input(PortDefinition::data("value", PortType::Any, true))
        .with_property("variable", variable)
}

fn project(flows: Vec<FlowGraph>) -> Project {
    Project {
        flows,
        globals: BTreeMap::new(),
    }
}

fn scheduler(project: Project, registry: BehaviorRegistry) -> Scheduler {
    Scheduler::new(project, Arc::new(registry)).expect("valid project")
}

fn variable(scheduler: &Scheduler, handle: FlowStateHandle, name: &str) -> Option<Value> {
    scheduler
        .flow_state(handle)
        .and_then(|state| state.variable(name))
        .cloned()
}

fn a_to_b() -> FlowGraph {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(constant("a", "42")).expect("add a");
    flow.add_component(set_variable("b", "y")).expect("add b");
    flow.connect("a", "value", "b", "value").expect("data");
    flow.connect("a", SEQOUT, "b", SEQIN).expect("sequence");
    flow
}

#[test]
fn value_and_sequence_reach_successor_and_are_consumed() {
    let mut scheduler = scheduler(project(vec![a_to_b()]), build_default_registry());
    let main = scheduler.start_page_flows()[0];

    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Executed(2));
    assert_eq!(variable(&scheduler, main, "y"), Some(Value::Int32(42)));

    let b = scheduler.record(main, "b").expect("record b");
    assert_eq!(b.unread_count(), 0);
    assert!(!b.is_unread(SEQIN));

    let executed_b = scheduler
        .drain_events()
        .iter()
        .filter(|event| {
            matches!(event, RuntimeEvent::ComponentExecuted { component, .. } if component == "b")
        })
        .count();
    assert_eq!(executed_b, 1);
    assert_eq!(scheduler.tick_all().expect("idle"), TickOutcome::Idle);
}

fn execution_trace(project: Project) -> Vec<RuntimeEvent> {
    let mut scheduler = scheduler(project, build_default_registry());
    scheduler.start_page_flows();
    scheduler.run_until_idle(16).expect("run");
    scheduler
        .drain_events()
        .into_iter()
        .filter(|event| !matches!(event, RuntimeEvent::Log(_)))
        .collect()
}

#[test]
fn same_graph_and_inputs_give_same_execution_order() {
    let mut second = FlowGraph::new("other", FlowKind::Page);
    second.add_component(constant("x", "'a' + 'b'")).expect("add x");
    second
        .add_component(
            ComponentInstance::new("log", "Log")
                .with_input(PortDefinition::data("value", PortType::Any, true)),
        )
        .expect("add log");
    second.connect("x", "value", "log", "value").expect("wire");

    let first = execution_trace(project(vec![a_to_b(), second.clone()]));
    let again = execution_trace(project(vec![a_to_b(), second]));
    assert!(!first.is_empty());
    assert_eq!(first, again);
}

#[test]
fn last_write_within_a_tick_wins() {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(constant("first", "1")).expect("add first");
    flow.add_component(constant("second", "2")).expect("add second");
    flow.add_component(set_variable("sink", "y")).expect("add sink");
    flow.connect("first", "value", "sink", "value").expect("first");
    flow.connect("second", "value", "sink", "value").expect("second");

    let mut scheduler = scheduler(project(vec![flow]), build_default_registry());
    let main = scheduler.start_page_flows()[0];
    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Executed(3));
    assert_eq!(variable(&scheduler, main, "y"), Some(Value::Int32(2)));
}

#[test]
fn zero_delay_resumes_on_a_later_tick() {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(ComponentInstance::new("wait", "Delay").with_property("milliseconds", "0"))
        .expect("add wait");
    flow.add_component(constant("after", "'done'")).expect("add after");
    flow.add_component(set_variable("store", "state")).expect("add store");
    flow.connect("wait", SEQOUT, "after", SEQIN).expect("seq");
    flow.connect("after", "value", "store", "value").expect("data");

    let mut scheduler = scheduler(project(vec![flow]), build_default_registry());
    let main = scheduler.start_page_flows()[0];
    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Executed(1));
    assert_eq!(scheduler.record_status(main, "wait"), Some(RecordStatus::Running));

    for _ in 0..200 {
        scheduler.tick_all().expect("tick");
        if variable(&scheduler, main, "state").is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(variable(&scheduler, main, "state"), Some(Value::from("done")));
    assert_eq!(scheduler.record_status(main, "wait"), Some(RecordStatus::Idle));
}

struct Forgetful;

impl ExecuteBehavior for Forgetful {
    fn behavior_name(&self) -> &str {
        "Forgetful"
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let continuation = ctx.start_async_execution()?;
        drop(continuation);
        Ok(None)
    }
}

#[test]
fn dropped_continuation_leaves_record_running_and_is_reported() {
    let mut registry = build_default_registry();
    registry.register(Forgetful);
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(ComponentInstance::new("f", "Forgetful"))
        .expect("add f");

    let mut scheduler = scheduler(project(vec![flow]), registry);
    let main = scheduler.start_page_flows()[0];
    scheduler.tick_all().expect("first tick");
    scheduler.tick_all().expect("drain continuation");

    assert_eq!(scheduler.record_status(main, "f"), Some(RecordStatus::Running));
    assert!(scheduler.record(main, "f").is_some_and(|record| record.is_stalled()));
    assert_eq!(scheduler.logs().faults(FaultKind::Liveness).len(), 1);
}

struct Subscription {
    disposed: Arc<AtomicUsize>,
}

impl ExecuteBehavior for Subscription {
    fn behavior_name(&self) -> &str {
        "Subscription"
    }

    fn execute(&self, _ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let disposed = Arc::clone(&self.disposed);
        Ok(Some(Disposer::new(move || {
            disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })))
    }
}

#[test]
fn reload_runs_each_disposer_exactly_once() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let mut registry = build_default_registry();
    registry.register(Subscription {
        disposed: Arc::clone(&disposed),
    });
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(ComponentInstance::new("s", "Subscription"))
        .expect("add s");

    let mut scheduler = scheduler(project(vec![flow]), registry);
    let main = scheduler.start_page_flows()[0];
    scheduler.tick_all().expect("tick");
    assert_eq!(scheduler.record_status(main, "s"), Some(RecordStatus::Running));

    scheduler.reload(project(vec![a_to_b()])).expect("reload");
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert!(scheduler.flow_state(main).is_none());
    assert!(scheduler.flow_states().is_empty());

    scheduler.start_page_flows();
    scheduler.run_until_idle(8).expect("run new project");
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

/// Keeps its continuation outside the scheduler and registers a disposer.
struct Holder {
    disposed: Arc<AtomicUsize>,
    held: Arc<Mutex<Vec<AsyncContinuation>>>,
}

impl ExecuteBehavior for Holder {
    fn behavior_name(&self) -> &str {
        "Holder"
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("out", PortType::Any, false)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let continuation = ctx.start_async_execution()?;
        self.held.lock().expect("held continuations").push(continuation);
        let disposed = Arc::clone(&self.disposed);
        Ok(Some(Disposer::new(move || {
            disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })))
    }
}

#[test]
fn teardown_disposes_once_and_ignores_late_continuation_messages() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let held = Arc::new(Mutex::new(Vec::new()));
    let mut registry = build_default_registry();
    registry.register(Holder {
        disposed: Arc::clone(&disposed),
        held: Arc::clone(&held),
    });

    let mut main = FlowGraph::new("main", FlowKind::Page);
    main.add_component(
        ComponentInstance::new("holder", "Holder")
            .with_output(PortDefinition::data("out", PortType::Any, false)),
    )
    .expect("add holder");
    main.add_component(set_variable("store", "got")).expect("add store");
    main.connect("holder", "out", "store", "value").expect("data");
    let mut other = FlowGraph::new("other", FlowKind::Page);
    other.add_component(constant("k", "1")).expect("add k");

    let mut scheduler = scheduler(project(vec![main, other]), registry);
    let pages = scheduler.start_page_flows();
    let (main, other) = (pages[0], pages[1]);
    scheduler.tick_all().expect("tick");
    assert_eq!(scheduler.record_status(main, "holder"), Some(RecordStatus::Running));

    scheduler.stop_flow(main).expect("stop");
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    scheduler.drain_events();

    let continuation = held.lock().expect("held").pop().expect("continuation kept");
    continuation.propagate_value("out", Value::Int32(9));
    continuation.end();
    scheduler.run_until_idle(4).expect("tick after teardown");

    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.flow_states(), vec![other]);
    assert!(variable(&scheduler, other, "got").is_none());
    assert!(!scheduler.drain_events().iter().any(|event| matches!(
        event,
        RuntimeEvent::ValuePropagated { component, .. } if component == "holder"
    )));
}

/// Asks the host for a value and forwards the answer from the callback.
struct Ask;

impl ExecuteBehavior for Ask {
    fn behavior_name(&self) -> &str {
        "Ask"
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::data("answer", PortType::Any, false)]
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let continuation = ctx.start_async_execution()?;
        ctx.send_message_to_component(
            Value::from("question"),
            Box::new(move |response| {
                continuation.propagate_value("answer", response);
                continuation.end();
            }),
        );
        Ok(None)
    }
}

fn ask_flow() -> FlowGraph {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(
        ComponentInstance::new("ask", "Ask")
            .with_output(PortDefinition::data("answer", PortType::Any, false)),
    )
    .expect("add ask");
    flow.add_component(set_variable("store", "reply")).expect("add store");
    flow.connect("ask", "answer", "store", "value").expect("data");
    flow
}

#[test]
fn host_response_runs_callback_on_next_tick() {
    let mut registry = build_default_registry();
    registry.register(Ask);
    let mut scheduler = scheduler(project(vec![ask_flow()]), registry);
    let main = scheduler.start_page_flows()[0];

    scheduler.tick_all().expect("tick");
    let requests = scheduler.take_host_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].component, "ask");
    assert_eq!(requests[0].flow_state, main);
    assert_eq!(requests[0].payload, Value::from("question"));
    assert!(scheduler.take_host_requests().is_empty());
    assert_eq!(scheduler.record_status(main, "ask"), Some(RecordStatus::Running));

    scheduler
        .respond_host_request(requests[0].id, Value::Int32(42))
        .expect("respond");
    assert!(variable(&scheduler, main, "reply").is_none());

    scheduler.tick_all().expect("tick with response");
    assert_eq!(variable(&scheduler, main, "reply"), Some(Value::Int32(42)));
    assert_eq!(scheduler.record_status(main, "ask"), Some(RecordStatus::Idle));
    assert!(scheduler.respond_host_request(requests[0].id, Value::Null).is_err());
}

#[test]
fn host_request_of_torn_down_flow_is_dropped() {
    let mut registry = build_default_registry();
    registry.register(Ask);
    let mut scheduler = scheduler(project(vec![ask_flow()]), registry);
    let main = scheduler.start_page_flows()[0];

    scheduler.tick_all().expect("tick");
    let id = scheduler.take_host_requests()[0].id;
    scheduler.stop_flow(main).expect("stop");

    assert!(scheduler.respond_host_request(id, Value::Int32(1)).is_err());
    assert_eq!(scheduler.tick_all().expect("tick"), TickOutcome::Idle);

    let restarted = scheduler.start_page_flows()[0];
    scheduler.tick_all().expect("tick");
    scheduler.stop_flow(restarted).expect("stop before the host saw it");
    assert!(scheduler.take_host_requests().is_empty());
}

fn action_flow(name: &str) -> FlowGraph {
    FlowGraph::new(name, FlowKind::Action)
}

#[test]
fn call_action_returns_output_and_pulses_caller() {
    let mut double = action_flow("double");
    double.add_component(constant("c", "21 * 2")).expect("add c");
    double
        .add_component(
            ComponentInstance::new("out", "Output")
                .with_input(PortDefinition::data("value", PortType::Any, true))
                .with_property("name", "result"),
        )
        .expect("add out");
    double.connect("c", "value", "out", "value").expect("wire");

    let mut main = FlowGraph::new("main", FlowKind::Page);
    main.add_component(
        ComponentInstance::new("call", "CallAction")
            .with_output(PortDefinition::data("result", PortType::Any, false))
            .with_property("action", "double"),
    )
    .expect("add call");
    main.add_component(set_variable("store", "r")).expect("add store");
    main.add_component(constant("flag", "true")).expect("add flag");
    main.add_component(set_variable("done", "finished")).expect("add done");
    main.connect("call", "result", "store", "value").expect("result");
    main.connect("call", SEQOUT, "flag", SEQIN).expect("seq");
    main.connect("flag", "value", "done", "value").expect("flag");

    let mut scheduler = scheduler(project(vec![main, double]), build_default_registry());
    let pages = scheduler.start_page_flows();
    assert_eq!(pages.len(), 1);
    let root = pages[0];

    scheduler.tick_all().expect("caller tick");
    assert_eq!(scheduler.record_status(root, "call"), Some(RecordStatus::Running));
    assert_eq!(scheduler.flow_states().len(), 2);

    scheduler.run_until_idle(16).expect("run");
    assert_eq!(variable(&scheduler, root, "r"), Some(Value::Int32(42)));
    assert_eq!(variable(&scheduler, root, "finished"), Some(Value::Boolean(true)));
    assert_eq!(scheduler.flow_states(), vec![root]);
    assert_eq!(scheduler.record_status(root, "call"), Some(RecordStatus::Idle));
}

#[test]
fn fault_in_called_flow_reaches_caller_error_output() {
    let mut fail = action_flow("fail");
    fail.add_component(ComponentInstance::new("e", "Error").with_property("message", "'bad input'"))
        .expect("add e");

    let mut main = FlowGraph::new("main", FlowKind::Page);
    main.add_component(ComponentInstance::new("call", "CallAction").with_property("action", "fail"))
        .expect("add call");
    main.add_component(set_variable("caught", "err")).expect("add caught");
    main.connect("call", ERROR_OUTPUT, "caught", "value").expect("error wire");

    let mut scheduler = scheduler(project(vec![main, fail]), build_default_registry());
    let root = scheduler.start_page_flows()[0];
    scheduler.run_until_idle(16).expect("run");

    let caught = variable(&scheduler, root, "err").expect("error routed");
    assert!(caught.as_str().is_some_and(|message| message.contains("bad input")));
    assert_eq!(scheduler.flow_states(), vec![root]);
    assert_eq!(scheduler.logs().faults(FaultKind::Component).len(), 1);
}

#[test]
fn unknown_behavior_is_rejected_at_load() {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(ComponentInstance::new("x", "NoSuchThing"))
        .expect("add x");
    let error = Scheduler::new(project(vec![flow]), Arc::new(build_default_registry()))
        .err()
        .expect("invalid project");
    assert!(format!("{error:#}").contains("NoSuchThing"));
}

#[test]
fn project_json_round_trips_through_scheduler() {
    let raw = r#"{
        "flows": [{
            "name": "main",
            "components": [
                {"id": "a", "component_type": "Constant",
                 "outputs": [{"name": "value", "port_type": "Any"}],
                 "properties": {"value": "limit * 2"}},
                {"id": "b", "component_type": "SetVariable",
                 "inputs": [{"name": "value", "port_type": "Any", "required": true}],
                 "properties": {"variable": "limit"}}
            ],
            "connections": [
                {"from_component": "a", "from_port": "value", "to_component": "b", "to_port": "value"}
            ]
        }],
        "globals": {"limit": {"type": "int32", "value": 5}}
    }"#;
    let project = Project::from_json(raw).expect("parse");
    let mut scheduler = scheduler(project, build_default_registry());
    scheduler.start_page_flows();
    scheduler.run_until_idle(4).expect("run");
    assert_eq!(scheduler.global("limit"), Some(&Value::Int32(10)));
}

fn catch_error(id: &str) -> ComponentInstance {
    ComponentInstance::new(id, "CatchError")
        .with_input(PortDefinition::data("message", PortType::Str, false))
        .with_output(PortDefinition::data("message", PortType::Str, false))
}

#[test]
fn unhandled_fault_goes_to_catch_error_and_drops_queued_work() {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(constant("a", "1")).expect("add a");
    flow.add_component(constant("bad", "missing + 1")).expect("add bad");
    flow.add_component(set_variable("late", "late")).expect("add late");
    flow.add_component(catch_error("catch")).expect("add catch");
    flow.add_component(set_variable("store", "caught")).expect("add store");
    flow.connect("a", SEQOUT, "bad", SEQIN).expect("sequence");
    flow.connect("a", "value", "late", "value").expect("data");
    flow.connect("catch", "message", "store", "value").expect("message");

    let mut scheduler = scheduler(project(vec![flow]), build_default_registry());
    let main = scheduler.start_page_flows()[0];
    scheduler.run_until_idle(8).expect("run");

    let caught = variable(&scheduler, main, "caught").expect("fault caught");
    assert!(caught.as_str().is_some_and(|message| message.contains("missing")));
    assert!(variable(&scheduler, main, "late").is_none());
    assert_eq!(scheduler.record_status(main, "bad"), Some(RecordStatus::Faulted));
    assert_eq!(scheduler.logs().faults(FaultKind::Component).len(), 1);
}

#[test]
fn error_in_called_flow_is_caught_by_caller_flow() {
    let mut fail = action_flow("fail");
    fail.add_component(ComponentInstance::new("e", "Error").with_property("message", "'bad input'"))
        .expect("add e");
    fail.add_component(catch_error("inner")).expect("add inner catch");

    let mut main = FlowGraph::new("main", FlowKind::Page);
    main.add_component(ComponentInstance::new("call", "CallAction").with_property("action", "fail"))
        .expect("add call");
    main.add_component(constant("after", "true")).expect("add after");
    main.add_component(set_variable("continued", "continued")).expect("add continued");
    main.add_component(catch_error("catch")).expect("add catch");
    main.add_component(set_variable("store", "caught")).expect("add store");
    main.connect("call", SEQOUT, "after", SEQIN).expect("sequence");
    main.connect("after", "value", "continued", "value").expect("data");
    main.connect("catch", "message", "store", "value").expect("message");

    let mut scheduler = scheduler(project(vec![main, fail]), build_default_registry());
    let root = scheduler.start_page_flows()[0];
    scheduler.run_until_idle(16).expect("run");

    assert_eq!(variable(&scheduler, root, "caught"), Some(Value::from("bad input")));
    assert!(variable(&scheduler, root, "continued").is_none());
    assert_eq!(scheduler.flow_states(), vec![root]);
    assert_eq!(scheduler.record_status(root, "call"), Some(RecordStatus::Idle));
}

#[test]
fn fault_without_any_handler_is_only_logged() {
    let mut flow = FlowGraph::new("main", FlowKind::Page);
    flow.add_component(constant("bad", "missing + 1")).expect("add bad");
    flow.add_component(constant("fine", "2")).expect("add fine");
    flow.add_component(set_variable("store", "ok")).expect("add store");
    flow.connect("fine", "value", "store", "value").expect("data");

    let mut scheduler = scheduler(project(vec![flow]), build_default_registry());
    let main = scheduler.start_page_flows()[0];
    scheduler.run_until_idle(8).expect("run");

    assert_eq!(variable(&scheduler, main, "ok"), Some(Value::Int32(2)));
    assert_eq!(scheduler.logs().faults(FaultKind::Component).len(), 1);
}
