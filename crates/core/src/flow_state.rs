use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{ComponentIndex, FlowGraph};
use crate::node::{Disposer, CATCH_ERROR_BEHAVIOR};
use crate::types::Value;

/// Generational index of a live [`FlowState`]. A stale handle never resolves
/// to a newer flow that reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowStateHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for FlowStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Identity of one runtime record: a component inside a live flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub flow_state: FlowStateHandle,
    pub component: ComponentIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Idle,
    Running,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveContinuation {
    pub epoch: u64,
    /// The invocation faulted; later propagations from this token are dropped.
    pub faulted: bool,
    /// The token was dropped without `end`. The record stays running.
    pub abandoned: bool,
}

/// Mutable state of one component inside one flow state.
pub struct ComponentRecord {
    pub(crate) inputs: HashMap<String, Value>,
    pub(crate) unread: HashSet<String>,
    pub(crate) running_state: Option<Box<dyn Any + Send>>,
    pub(crate) status: RecordStatus,
    pub(crate) disposer: Option<Disposer>,
    pub(crate) continuation: Option<LiveContinuation>,
    pub(crate) waiting_on: Option<FlowStateHandle>,
    pub(crate) start_pending: bool,
    pub(crate) last_error: Option<String>,
}

impl ComponentRecord {
    fn new(start_pending: bool) -> Self {
        Self {
            inputs: HashMap::new(),
            unread: HashSet::new(),
            running_state: None,
            status: RecordStatus::Idle,
            disposer: None,
            continuation: None,
            waiting_on: None,
            start_pending,
            last_error: None,
        }
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    pub fn is_unread(&self, name: &str) -> bool {
        self.unread.contains(name)
    }

    pub fn unread_count(&self) -> usize {
        self.unread.len()
    }

    pub fn has_live_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    pub fn has_disposer(&self) -> bool {
        self.disposer.is_some()
    }

    pub fn is_stalled(&self) -> bool {
        self.continuation.is_some_and(|c| c.abandoned)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn running_state<T: 'static>(&self) -> Option<&T> {
        self.running_state.as_ref()?.downcast_ref::<T>()
    }

    pub(crate) fn write_input(&mut self, port: &str, value: Value) {
        self.inputs.insert(port.to_string(), value);
        self.unread.insert(port.to_string());
    }
}

impl fmt::Debug for ComponentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRecord")
            .field("inputs", &self.inputs)
            .field("unread", &self.unread)
            .field("status", &self.status)
            .field("has_disposer", &self.disposer.is_some())
            .field("continuation", &self.continuation)
            .field("waiting_on", &self.waiting_on)
            .finish()
    }
}

/// Live instance of a flow.
#[derive(Debug)]
pub struct FlowState {
    pub(crate) id: Uuid,
    pub(crate) flow_index: usize,
    pub(crate) parent: Option<FlowStateHandle>,
    pub(crate) owner: Option<ComponentIndex>,
    pub(crate) records: Vec<ComponentRecord>,
    pub(crate) variables: BTreeMap<String, Value>,
    pub(crate) children: Vec<FlowStateHandle>,
}

impl FlowState {
    pub(crate) fn new(
        flow_index: usize,
        flow: &FlowGraph,
        parent: Option<FlowStateHandle>,
        owner: Option<ComponentIndex>,
    ) -> Self {
        let records = flow
            .components()
            .map(|(index, component)| {
                // Components with nothing wired into them run once on start.
                // CatchError only runs when a fault reaches it.
                let has_wired_input = flow.has_connected_sequence_input(index)
                    || component
                        .inputs
                        .iter()
                        .any(|port| flow.has_incoming(index, &port.name));
                ComponentRecord::new(
                    !has_wired_input && component.component_type != CATCH_ERROR_BEHAVIOR,
                )
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            flow_index,
            parent,
            owner,
            records,
            variables: flow.variables.clone(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn flow_index(&self) -> usize {
        self.flow_index
    }

    pub fn parent(&self) -> Option<FlowStateHandle> {
        self.parent
    }

    pub fn owner(&self) -> Option<ComponentIndex> {
        self.owner
    }

    pub fn children(&self) -> &[FlowStateHandle] {
        &self.children
    }

    pub fn record(&self, component: ComponentIndex) -> Option<&ComponentRecord> {
        self.records.get(component)
    }

    pub fn records(&self) -> &[ComponentRecord] {
        &self.records
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }
}

struct Slot {
    generation: u32,
    state: Option<FlowState>,
}

/// Arena of flow states. Parents are referenced by handle only.
#[derive(Default)]
pub struct FlowArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<FlowStateHandle>,
}

impl FlowArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: FlowState) -> FlowStateHandle {
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.state = Some(state);
                FlowStateHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    state: Some(state),
                });
                FlowStateHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.order.push(handle);
        handle
    }

    pub fn remove(&mut self, handle: FlowStateHandle) -> Option<FlowState> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let state = slot.state.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.order.retain(|h| *h != handle);
        Some(state)
    }

    pub fn get(&self, handle: FlowStateHandle) -> Option<&FlowState> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.state.as_ref()
    }

    pub fn get_mut(&mut self, handle: FlowStateHandle) -> Option<&mut FlowState> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.state.as_mut()
    }

    pub fn contains(&self, handle: FlowStateHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn record_mut(&mut self, key: RecordKey) -> Option<&mut ComponentRecord> {
        self.get_mut(key.flow_state)?.records.get_mut(key.component)
    }

    /// Live handles in creation order.
    pub fn handles(&self) -> Vec<FlowStateHandle> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True when `ancestor` is `handle` itself or one of its parents.
    pub fn is_within(&self, handle: FlowStateHandle, ancestor: FlowStateHandle) -> bool {
        let mut current = Some(handle);
        while let Some(h) = current {
            if h == ancestor {
                return true;
            }
            current = self.get(h).and_then(|state| state.parent);
        }
        false
    }
}

/// Readiness rule for one record.
///
/// A record holding a live continuation or waiting on a child flow is never
/// ready. With a wired sequence input, a pulse plus fresh values on every
/// required data input is needed. Without one, fresh data on a required input
/// (with all required inputs present) is enough, or any fresh input when none
/// are required. Unwired components become ready once, on start.
pub(crate) fn is_ready(flow: &FlowGraph, index: ComponentIndex, record: &ComponentRecord) -> bool {
    if record.continuation.is_some() || record.waiting_on.is_some() {
        return false;
    }
    let Some(component) = flow.component(index) else {
        return false;
    };
    if record.start_pending {
        return true;
    }

    if flow.has_connected_sequence_input(index) {
        let pulsed = record
            .unread
            .iter()
            .any(|name| component.is_sequence_input(name));
        return pulsed
            && component
                .required_data_inputs()
                .all(|port| record.unread.contains(&port.name));
    }

    let mut required = component.required_data_inputs().peekable();
    if required.peek().is_none() {
        return !record.unread.is_empty();
    }

    let mut any_unread = false;
    for port in required {
        if !record.inputs.contains_key(&port.name) {
            return false;
        }
        any_unread |= record.unread.contains(&port.name);
    }
    any_unread
}
