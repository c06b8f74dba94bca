//! The sandboxed module side of the bridge.
//!
//! [`GraphModule`] owns its own [`Scheduler`] built from a compiled graph blob,
//! so the readiness and sequencing rules are exactly the host's. Behaviors that
//! need host facilities are replaced by [`NativeProxy`] stand-ins, which
//! marshal their inputs through linear memory and call back into the host
//! registry synchronously.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::memory::{LinearMemory, MemPtr};
use super::protocol::{Frame, PointerEvent, PropertyRequest, WheelEvent, WidgetAction};
use super::trace::{TraceBuffer, TraceEvent};
use super::value_codec::{
    array_element_slots, decode_or_undefined, decode_value, encode_value, marshalable_or_undefined,
};
use crate::context::{DetachedScope, ExecutionContext};
use crate::debugger::DebuggerCommand;
use crate::graph::{ComponentInstance, Project};
use crate::node::{Disposer, ExecuteBehavior, PortDefinition};
use crate::registry::BehaviorRegistry;
use crate::scheduler::{panic_message, Scheduler};
use crate::types::Value;

pub const DEFAULT_DISPLAY_WIDTH: u32 = 480;
pub const DEFAULT_DISPLAY_HEIGHT: u32 = 272;
pub const DEFAULT_MEMORY_BYTES: usize = 1 << 20;

const BACKGROUND: [u8; 4] = [0x20, 0x20, 0x28, 0xff];
const POINTER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Numeric id of a behavior that runs on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeType {
    pub type_id: u32,
    pub name: String,
}

/// Graph blob sent to the module once at load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledGraph {
    pub project: Project,
    pub native_types: Vec<NativeType>,
    /// Global names in index order, for index-addressed updates.
    pub globals: Vec<String>,
}

/// Validates `project` and packs it for [`FlowModule::load`].
pub fn compile_project(project: &Project, registry: &BehaviorRegistry) -> Result<Vec<u8>> {
    project.validate(registry)?;

    let mut native_types = Vec::new();
    for name in registry.list_behaviors() {
        if registry.get(name)?.requires_host() {
            native_types.push(NativeType {
                type_id: native_types.len() as u32,
                name: name.to_string(),
            });
        }
    }

    let compiled = CompiledGraph {
        project: project.clone(),
        native_types,
        globals: project.globals.keys().cloned().collect(),
    };
    serde_json::to_vec(&compiled).context("failed to serialize compiled graph")
}

/// Runs host behaviors on behalf of the module.
pub struct NativeDispatcher {
    registry: Arc<BehaviorRegistry>,
    type_names: HashMap<u32, String>,
}

impl NativeDispatcher {
    pub fn new(registry: Arc<BehaviorRegistry>, native_types: &[NativeType]) -> Self {
        Self {
            registry,
            type_names: native_types
                .iter()
                .map(|native| (native.type_id, native.name.clone()))
                .collect(),
        }
    }

    /// Decodes the inputs at `inputs`, runs the behavior, and writes the
    /// outcome back into `memory`.
    ///
    /// The outcome slot is an array of: output pairs, seqout flag, error
    /// message or undefined, log lines.
    pub fn dispatch(
        &self,
        type_id: u32,
        component: &ComponentInstance,
        memory: &mut LinearMemory,
        inputs: MemPtr,
    ) -> Result<MemPtr> {
        let name = self
            .type_names
            .get(&type_id)
            .ok_or_else(|| anyhow!("unknown native component type {type_id}"))?;
        let behavior = self.registry.get(name)?;

        let mut values = HashMap::new();
        for slot in array_element_slots(memory, inputs)? {
            match decode_value(memory, slot)? {
                Value::Array(pair) => match <[Value; 2]>::try_from(pair) {
                    Ok([Value::String(port), value]) => {
                        values.insert(port, value);
                    }
                    _ => bail!("malformed native input pair"),
                },
                other => bail!("malformed native input entry: {other}"),
            }
        }

        let globals = BTreeMap::new();
        let scope = DetachedScope { globals: &globals };
        let mut ctx = ExecutionContext::detached(&scope, component, &values);
        let outcome = catch_unwind(AssertUnwindSafe(|| behavior.execute(&mut ctx)));
        let (effects, _, _) = ctx.into_parts();

        let error = match outcome {
            Ok(Ok(disposer)) => {
                if let Some(disposer) = disposer {
                    warn!(component = %component.id, "native behavior returned a disposer; running it now");
                    run_disposer(disposer);
                }
                effects.fault
            }
            Ok(Err(error)) => Some(format!("{error:#}")),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };

        let outputs = effects
            .propagations
            .into_iter()
            .map(|(output, value)| {
                let value = marshalable_or_undefined(memory, &value);
                Value::Array(vec![Value::String(output), value])
            })
            .collect();
        let error = error.map(|message| marshalable_or_undefined(memory, &Value::String(message)));
        let logs = effects
            .logs
            .into_iter()
            .map(|line| marshalable_or_undefined(memory, &Value::String(line)))
            .collect();
        let result = Value::Array(vec![
            Value::Array(outputs),
            Value::Boolean(effects.seqout),
            error.unwrap_or_default(),
            Value::Array(logs),
        ]);
        encode_value(memory, &result)
    }
}

fn run_disposer(disposer: Disposer) {
    if let Err(error) = disposer.dispose() {
        warn!("native disposer failed: {error:#}");
    }
}

/// Memory and dispatcher shared by every proxy of one loaded graph.
pub struct NativeLink {
    memory: LinearMemory,
    dispatcher: NativeDispatcher,
}

impl NativeLink {
    pub fn new(memory: LinearMemory, dispatcher: NativeDispatcher) -> Self {
        Self { memory, dispatcher }
    }
}

/// Module-side stand-in for a behavior that must run on the host.
pub struct NativeProxy {
    name: String,
    type_id: u32,
    inputs: Vec<PortDefinition>,
    outputs: Vec<PortDefinition>,
    link: Arc<Mutex<NativeLink>>,
}

struct NativeOutcome {
    outputs: Vec<(String, Value)>,
    seqout: bool,
    error: Option<String>,
    logs: Vec<String>,
}

impl NativeProxy {
    fn call(&self, link: &mut NativeLink, ctx: &ExecutionContext<'_>) -> Result<NativeOutcome> {
        let mut pairs = Vec::new();
        for port in ctx.component().inputs.iter().filter(|port| !port.is_sequence) {
            if let Some(value) = ctx.get_input_value(&port.name) {
                // One bad input degrades to undefined; the call still happens.
                let value = marshalable_or_undefined(&mut link.memory, value);
                pairs.push(Value::Array(vec![Value::String(port.name.clone()), value]));
            }
        }
        let inputs = encode_value(&mut link.memory, &Value::Array(pairs))?;
        let result = link
            .dispatcher
            .dispatch(self.type_id, ctx.component(), &mut link.memory, inputs)?;

        let memory = &link.memory;
        let parts = array_element_slots(memory, result)?;
        let [outputs, seqout, error, logs] = parts.as_slice() else {
            bail!("native result has {} parts, expected 4", parts.len());
        };

        let mut decoded = Vec::new();
        for pair in array_element_slots(memory, *outputs)? {
            let fields = array_element_slots(memory, pair)?;
            let [name, value] = fields.as_slice() else {
                bail!("malformed native output pair");
            };
            let Value::String(name) = decode_value(memory, *name)? else {
                bail!("native output name is not a string");
            };
            // One bad value degrades that propagation only.
            decoded.push((name, decode_or_undefined(memory, *value)));
        }

        let logs = match decode_value(memory, *logs)? {
            Value::Array(lines) => lines.into_iter().map(|line| line.to_string()).collect(),
            _ => Vec::new(),
        };
        Ok(NativeOutcome {
            outputs: decoded,
            seqout: decode_value(memory, *seqout)?.is_truthy(),
            error: match decode_value(memory, *error)? {
                Value::String(message) => Some(message),
                _ => None,
            },
            logs,
        })
    }
}

impl ExecuteBehavior for NativeProxy {
    fn behavior_name(&self) -> &str {
        &self.name
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        self.inputs.clone()
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        self.outputs.clone()
    }

    fn requires_host(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
        let outcome = {
            let mut guard = self
                .link
                .lock()
                .map_err(|_| anyhow!("native link poisoned"))?;
            let link = &mut *guard;
            let mark = link.memory.mark();
            let outcome = self.call(link, ctx);
            link.memory.release(mark);
            outcome?
        };
        debug!(component = %ctx.component_id(), behavior = %self.name, "native call returned");

        for line in outcome.logs {
            ctx.log_info(line);
        }
        if let Some(error) = outcome.error {
            ctx.throw_error(error);
            return Ok(None);
        }
        for (output, value) in outcome.outputs {
            ctx.propagate_value(&output, value)?;
        }
        if outcome.seqout {
            ctx.propagate_value_through_seqout();
        }
        Ok(None)
    }
}

/// Entry points the bridge worker drives, one host message at a time.
pub trait FlowModule: Send {
    fn load(&mut self, blob: &[u8]) -> Result<()>;

    fn on_wheel_event(&mut self, event: WheelEvent);

    fn on_pointer_event(&mut self, event: PointerEvent);

    fn update_global(&mut self, index: u32, value: Value) -> Result<()>;

    fn on_debugger_message(&mut self, bytes: &[u8]) -> Result<()>;

    fn execute_widget_action(&mut self, action: WidgetAction) -> Result<()>;

    /// One internal tick. Trace output goes to `trace`.
    fn main_loop(&mut self, trace: &mut TraceBuffer) -> Result<()>;

    fn eval_property(&mut self, request: &PropertyRequest) -> Result<Value>;

    /// The rendered frame, when it changed since the last call.
    fn synced_frame(&mut self) -> Option<Frame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleOptions {
    pub display_width: u32,
    pub display_height: u32,
    pub memory_bytes: usize,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            display_width: DEFAULT_DISPLAY_WIDTH,
            display_height: DEFAULT_DISPLAY_HEIGHT,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

pub struct GraphModule {
    host_registry: Arc<BehaviorRegistry>,
    options: ModuleOptions,
    scheduler: Option<Scheduler>,
    global_names: Vec<String>,
    frame: Vec<u8>,
    frame_dirty: bool,
}

impl GraphModule {
    pub fn new(host_registry: Arc<BehaviorRegistry>, options: ModuleOptions) -> Self {
        Self {
            host_registry,
            options,
            scheduler: None,
            global_names: Vec::new(),
            frame: Vec::new(),
            frame_dirty: false,
        }
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    fn scheduler_mut(&mut self) -> Result<&mut Scheduler> {
        self.scheduler
            .as_mut()
            .ok_or_else(|| anyhow!("no graph loaded"))
    }

    fn module_registry(&self, compiled: &CompiledGraph) -> Result<BehaviorRegistry> {
        let link = Arc::new(Mutex::new(NativeLink::new(
            LinearMemory::new(self.options.memory_bytes),
            NativeDispatcher::new(Arc::clone(&self.host_registry), &compiled.native_types),
        )));

        let mut registry = BehaviorRegistry::new();
        for name in self.host_registry.list_behaviors() {
            let behavior = self.host_registry.get(name)?;
            match compiled.native_types.iter().find(|native| native.name == name) {
                Some(native) => registry.register(NativeProxy {
                    name: name.to_string(),
                    type_id: native.type_id,
                    inputs: behavior.input_ports(),
                    outputs: behavior.output_ports(),
                    link: Arc::clone(&link),
                }),
                None => registry.register_shared(behavior),
            }
        }
        Ok(registry)
    }

    fn clear_frame(&mut self) {
        let pixels = self.options.display_width as usize * self.options.display_height as usize;
        self.frame = BACKGROUND.repeat(pixels);
        self.frame_dirty = true;
    }

    fn draw_pointer(&mut self, x: i32, y: i32) {
        let (width, height) = (
            self.options.display_width as i32,
            self.options.display_height as i32,
        );
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (px, py) = (x + dx, y + dy);
                if px < 0 || py < 0 || px >= width || py >= height {
                    continue;
                }
                let offset = ((py * width + px) * 4) as usize;
                if let Some(pixel) = self.frame.get_mut(offset..offset + 4) {
                    pixel.copy_from_slice(&POINTER);
                }
            }
        }
        self.frame_dirty = true;
    }
}

impl FlowModule for GraphModule {
    fn load(&mut self, blob: &[u8]) -> Result<()> {
        let compiled: CompiledGraph =
            serde_json::from_slice(blob).context("invalid compiled graph blob")?;
        let registry = self.module_registry(&compiled)?;
        let flows = compiled.project.flows.len();
        let mut scheduler = Scheduler::new(compiled.project, Arc::new(registry))?;
        let pages = scheduler.start_page_flows();

        info!(
            flows,
            pages = pages.len(),
            native_types = compiled.native_types.len(),
            "graph loaded into module"
        );
        self.scheduler = Some(scheduler);
        self.global_names = compiled.globals;
        self.clear_frame();
        Ok(())
    }

    fn on_wheel_event(&mut self, event: WheelEvent) {
        if event.delta_y == 0 && !event.clicked {
            return;
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.set_global("$wheel_delta", Value::Int32(event.delta_y));
            scheduler.set_global("$wheel_clicked", Value::Boolean(event.clicked));
        }
    }

    fn on_pointer_event(&mut self, event: PointerEvent) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        scheduler.set_global("$pointer_x", Value::Int32(event.x));
        scheduler.set_global("$pointer_y", Value::Int32(event.y));
        scheduler.set_global("$pointer_pressed", Value::Boolean(event.pressed));
        if event.pressed {
            self.draw_pointer(event.x, event.y);
        }
    }

    fn update_global(&mut self, index: u32, value: Value) -> Result<()> {
        let name = self
            .global_names
            .get(index as usize)
            .cloned()
            .ok_or_else(|| anyhow!("global index {index} out of range"))?;
        self.scheduler_mut()?.set_global(&name, value);
        Ok(())
    }

    fn on_debugger_message(&mut self, bytes: &[u8]) -> Result<()> {
        let command: DebuggerCommand =
            serde_json::from_slice(bytes).context("invalid debugger command")?;
        self.scheduler_mut()?.apply_debugger_command(command)
    }

    fn execute_widget_action(&mut self, action: WidgetAction) -> Result<()> {
        self.scheduler_mut()?.execute_widget_action(
            action.flow_state,
            &action.component,
            &action.output,
            action.value,
        )
    }

    fn main_loop(&mut self, trace: &mut TraceBuffer) -> Result<()> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(());
        };
        scheduler.tick_all()?;
        for event in scheduler.drain_events() {
            let event = TraceEvent::from_runtime(&event);
            let encoded = match event.encode() {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(fault = "protocol", "trace event marshaling failed: {error:#}");
                    match event.degraded().map(|event| event.encode()) {
                        Some(Ok(bytes)) => bytes,
                        _ => continue,
                    }
                }
            };
            trace.start();
            trace.write(&encoded);
            trace.finish();
        }
        Ok(())
    }

    fn eval_property(&mut self, request: &PropertyRequest) -> Result<Value> {
        self.scheduler_mut()?
            .eval_property(request.flow_state, &request.component, &request.property)
    }

    fn synced_frame(&mut self) -> Option<Frame> {
        if !self.frame_dirty {
            return None;
        }
        self.frame_dirty = false;
        Some(Frame {
            width: self.options.display_width,
            height: self.options.display_height,
            pixels: self.frame.clone(),
        })
    }
}
