use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::node::{PortDefinition, ERROR_OUTPUT, SEQIN, SEQOUT};
use crate::registry::BehaviorRegistry;
use crate::types::{PortType, Value};

/// Position of a component inside its flow, in declaration order.
pub type ComponentIndex = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub id: String,
    pub component_type: String,
    #[serde(default)]
    pub inputs: Vec<PortDefinition>,
    #[serde(default)]
    pub outputs: Vec<PortDefinition>,
    /// Property name to expression source.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ComponentInstance {
    pub fn new(id: &str, component_type: &str) -> Self {
        Self {
            id: id.to_string(),
            component_type: component_type.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_property(mut self, name: &str, expression: &str) -> Self {
        self.properties
            .insert(name.to_string(), expression.to_string());
        self
    }

    /// Declared input or the implicit `seqin`.
    pub fn input_port(&self, name: &str) -> Option<PortDefinition> {
        if name == SEQIN {
            return Some(PortDefinition::sequence(SEQIN));
        }
        self.inputs.iter().find(|port| port.name == name).cloned()
    }

    /// Declared output or one of the implicit `seqout` / `@error` outputs.
    pub fn output_port(&self, name: &str) -> Option<PortDefinition> {
        match name {
            SEQOUT => Some(PortDefinition::sequence(SEQOUT)),
            ERROR_OUTPUT => Some(PortDefinition::data(ERROR_OUTPUT, PortType::Str, false)),
            _ => self.outputs.iter().find(|port| port.name == name).cloned(),
        }
    }

    pub fn is_sequence_input(&self, name: &str) -> bool {
        self.input_port(name).is_some_and(|port| port.is_sequence)
    }

    pub fn required_data_inputs(&self) -> impl Iterator<Item = &PortDefinition> {
        self.inputs
            .iter()
            .filter(|port| port.required && !port.is_sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLine {
    pub source_port: String,
    pub target_port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Started automatically with the project.
    #[default]
    Page,
    /// Runs only when invoked through a call action.
    Action,
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub name: String,
    pub kind: FlowKind,
    pub variables: BTreeMap<String, Value>,
    graph: StableDiGraph<ComponentInstance, ConnectionLine>,
    component_ids: HashMap<String, NodeIndex>,
}

impl FlowGraph {
    pub fn new(name: &str, kind: FlowKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            variables: BTreeMap::new(),
            graph: StableDiGraph::new(),
            component_ids: HashMap::new(),
        }
    }

    pub fn add_component(&mut self, instance: ComponentInstance) -> Result<ComponentIndex> {
        if self.component_ids.contains_key(&instance.id) {
            bail!("duplicate component id: {}", instance.id);
        }

        let component_id = instance.id.clone();
        let index = self.graph.add_node(instance);
        self.component_ids.insert(component_id, index);
        Ok(index.index())
    }

    pub fn add_connection(
        &mut self,
        from_id: &str,
        connection: ConnectionLine,
        to_id: &str,
    ) -> Result<()> {
        let from_idx = self
            .component_ids
            .get(from_id)
            .copied()
            .ok_or_else(|| anyhow!("unknown source component id: {from_id}"))?;
        let to_idx = self
            .component_ids
            .get(to_id)
            .copied()
            .ok_or_else(|| anyhow!("unknown target component id: {to_id}"))?;

        self.graph.add_edge(from_idx, to_idx, connection);
        Ok(())
    }

    pub fn connect(
        &mut self,
        from_id: &str,
        source_port: &str,
        to_id: &str,
        target_port: &str,
    ) -> Result<()> {
        self.add_connection(
            from_id,
            ConnectionLine {
                source_port: source_port.to_string(),
                target_port: target_port.to_string(),
            },
            to_id,
        )
    }

    pub fn component_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn component(&self, index: ComponentIndex) -> Option<&ComponentInstance> {
        self.graph.node_weight(NodeIndex::new(index))
    }

    pub fn component_index(&self, id: &str) -> Option<ComponentIndex> {
        self.component_ids.get(id).map(|idx| idx.index())
    }

    /// Components in declaration order.
    pub fn components(&self) -> impl Iterator<Item = (ComponentIndex, &ComponentInstance)> {
        self.graph
            .node_indices()
            .map(move |idx| (idx.index(), &self.graph[idx]))
    }

    /// Targets of one output port, in connection declaration order.
    pub fn connections_from(
        &self,
        index: ComponentIndex,
        source_port: &str,
    ) -> Vec<(ComponentIndex, &ConnectionLine)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(NodeIndex::new(index), Direction::Outgoing)
            .filter(|edge| edge.weight().source_port == source_port)
            .map(|edge| (edge.id().index(), edge.target().index(), edge.weight()))
            .collect();
        edges.sort_by_key(|(edge_id, _, _)| *edge_id);
        edges
            .into_iter()
            .map(|(_, target, connection)| (target, connection))
            .collect()
    }

    pub fn has_incoming(&self, index: ComponentIndex, target_port: &str) -> bool {
        self.graph
            .edges_directed(NodeIndex::new(index), Direction::Incoming)
            .any(|edge| edge.weight().target_port == target_port)
    }

    pub fn has_outgoing(&self, index: ComponentIndex, source_port: &str) -> bool {
        self.graph
            .edges_directed(NodeIndex::new(index), Direction::Outgoing)
            .any(|edge| edge.weight().source_port == source_port)
    }

    /// True when at least one sequence input of the component is wired.
    pub fn has_connected_sequence_input(&self, index: ComponentIndex) -> bool {
        let Some(component) = self.component(index) else {
            return false;
        };
        self.graph
            .edges_directed(NodeIndex::new(index), Direction::Incoming)
            .any(|edge| component.is_sequence_input(&edge.weight().target_port))
    }

    pub fn validate(&self, registry: &BehaviorRegistry) -> Result<()> {
        for (_, component) in self.components() {
            let behavior = registry.get(&component.component_type).with_context(|| {
                format!(
                    "component '{}' in flow '{}' has no registered behavior",
                    component.id, self.name
                )
            })?;

            for port in behavior.input_ports() {
                if component.input_port(&port.name).is_none() {
                    bail!(
                        "component '{}' is missing input port '{}' required by behavior '{}'",
                        component.id,
                        port.name,
                        component.component_type
                    );
                }
            }
            for port in behavior.output_ports() {
                if component.output_port(&port.name).is_none() {
                    bail!(
                        "component '{}' is missing output port '{}' required by behavior '{}'",
                        component.id,
                        port.name,
                        component.component_type
                    );
                }
            }
        }

        for edge in self.graph.edge_references() {
            let source = &self.graph[edge.source()];
            let target = &self.graph[edge.target()];
            let connection = edge.weight();

            let source_port = source.output_port(&connection.source_port).ok_or_else(|| {
                anyhow!(
                    "component '{}' has no output port '{}'",
                    source.id,
                    connection.source_port
                )
            })?;
            let target_port = target.input_port(&connection.target_port).ok_or_else(|| {
                anyhow!(
                    "component '{}' has no input port '{}'",
                    target.id,
                    connection.target_port
                )
            })?;

            if source_port.is_sequence != target_port.is_sequence {
                bail!(
                    "connection '{}:{}' -> '{}:{}' mixes sequence and data ports",
                    source.id,
                    connection.source_port,
                    target.id,
                    connection.target_port
                );
            }

            if !source_port.port_type.is_compatible(&target_port.port_type) {
                bail!(
                    "incompatible port types: '{}:{}' ({:?}) -> '{}:{}' ({:?})",
                    source.id,
                    connection.source_port,
                    source_port.port_type,
                    target.id,
                    connection.target_port,
                    target_port.port_type
                );
            }
        }

        for (index, component) in self.components() {
            for input in component.required_data_inputs() {
                if !self.has_incoming(index, &input.name) {
                    bail!(
                        "component '{}' missing required input port '{}'",
                        component.id,
                        input.name
                    );
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FlowGraphSerde {
    name: String,
    #[serde(default)]
    kind: FlowKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    variables: BTreeMap<String, Value>,
    components: Vec<ComponentInstance>,
    #[serde(default)]
    connections: Vec<ConnectionSerde>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionSerde {
    from_component: String,
    from_port: String,
    to_component: String,
    to_port: String,
}

impl Serialize for FlowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Declaration order is the scheduling order, so it is kept as-is.
        let components: Vec<ComponentInstance> =
            self.components().map(|(_, c)| c.clone()).collect();

        let mut edges: Vec<_> = self.graph.edge_references().collect();
        edges.sort_by_key(|edge| edge.id().index());
        let connections = edges
            .into_iter()
            .map(|edge| ConnectionSerde {
                from_component: self.graph[edge.source()].id.clone(),
                from_port: edge.weight().source_port.clone(),
                to_component: self.graph[edge.target()].id.clone(),
                to_port: edge.weight().target_port.clone(),
            })
            .collect();

        FlowGraphSerde {
            name: self.name.clone(),
            kind: self.kind,
            variables: self.variables.clone(),
            components,
            connections,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = FlowGraphSerde::deserialize(deserializer)?;
        let mut flow = FlowGraph::new(&serialized.name, serialized.kind);
        flow.variables = serialized.variables;

        for component in serialized.components {
            flow.add_component(component).map_err(D::Error::custom)?;
        }

        for connection in serialized.connections {
            flow.add_connection(
                &connection.from_component,
                ConnectionLine {
                    source_port: connection.from_port,
                    target_port: connection.to_port,
                },
                &connection.to_component,
            )
            .map_err(D::Error::custom)?;
        }

        Ok(flow)
    }
}

/// Every flow of a loaded project plus its global variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub flows: Vec<FlowGraph>,
    #[serde(default)]
    pub globals: BTreeMap<String, Value>,
}

impl Project {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse project JSON")
    }

    pub fn flow(&self, index: usize) -> Option<&FlowGraph> {
        self.flows.get(index)
    }

    pub fn flow_index(&self, name: &str) -> Option<usize> {
        self.flows.iter().position(|flow| flow.name == name)
    }

    pub fn validate(&self, registry: &BehaviorRegistry) -> Result<()> {
        let mut names = HashSet::new();
        for flow in &self.flows {
            if !names.insert(flow.name.as_str()) {
                bail!("duplicate flow name: {}", flow.name);
            }
            flow.validate(registry)
                .with_context(|| format!("invalid flow '{}'", flow.name))?;
        }
        Ok(())
    }
}
