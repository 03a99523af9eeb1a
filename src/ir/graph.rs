//! Arena graph for the compiler IR.
//!
//! Nodes live in an arena indexed by [`NodeId`]. Ids are never reused, so a
//! pass can hold ids across rewrites; replacing a node redirects edges by id
//! and leaves the old slot to dead-node elimination.

use crate::error::ForgeResult;
use crate::graph_error;
use crate::ir::{Op, OpKind, PartialShape, RtInfo, RuntimeTag, Tensor, TensorDesc};
use crate::ir::ElementType;
use crate::shape_infer::{self, ConstantAccessor};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }

    pub fn out(self, index: usize) -> Output {
        Output { node: self, index }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One output port of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Output {
    pub node: NodeId,
    pub index: usize,
}

impl From<NodeId> for Output {
    fn from(node: NodeId) -> Self {
        Output { node, index: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: Op,
    pub inputs: Vec<Output>,
    pub outputs: Vec<TensorDesc>,
    pub rt_info: RtInfo,
}

impl Node {
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn input(&self, index: usize) -> Option<Output> {
        self.inputs.get(index).copied()
    }

    pub fn output_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.outputs.get(index)
    }

    pub fn is_constant(&self) -> bool {
        self.op.is_constant()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
}

/// Constant lookup over a node's input edges.
struct InputConstants<'a> {
    graph: &'a Graph,
    inputs: &'a [Output],
}

impl ConstantAccessor for InputConstants<'_> {
    fn constant(&self, input: usize) -> Option<&Tensor> {
        self.inputs
            .get(input)
            .and_then(|o| self.graph.constant_value(*o))
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(
        &mut self,
        name: &str,
        element_type: ElementType,
        shape: PartialShape,
    ) -> ForgeResult<NodeId> {
        let id = self.add_node(
            name,
            Op::Parameter(TensorDesc::new(element_type, shape)),
            Vec::new(),
        )?;
        self.parameters.push(id);
        Ok(id)
    }

    pub fn add_constant(&mut self, name: &str, tensor: Tensor) -> ForgeResult<NodeId> {
        self.add_node(name, Op::Constant(tensor), Vec::new())
    }

    pub fn add_result(&mut self, name: &str, output: Output) -> ForgeResult<NodeId> {
        let id = self.add_node(name, Op::Result, vec![output])?;
        self.results.push(id);
        Ok(id)
    }

    /// Add a node and infer its output descriptors.
    pub fn add_node(&mut self, name: &str, op: Op, inputs: Vec<Output>) -> ForgeResult<NodeId> {
        let input_descs = self.input_descs(name, &inputs)?;
        let outputs = shape_infer::infer(
            name,
            &op,
            &input_descs,
            &InputConstants {
                graph: self,
                inputs: &inputs,
            },
        )?;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            id,
            name: name.to_string(),
            op,
            inputs,
            outputs,
            rt_info: RtInfo::new(),
        }));
        Ok(id)
    }

    fn input_descs(&self, name: &str, inputs: &[Output]) -> ForgeResult<Vec<TensorDesc>> {
        inputs
            .iter()
            .map(|o| {
                self.output_desc(*o).cloned().ok_or_else(|| {
                    graph_error!("{}: input {}:{} does not exist", name, o.node, o.index)
                })
            })
            .collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    pub fn try_node(&self, id: NodeId) -> ForgeResult<&Node> {
        self.node(id)
            .ok_or_else(|| graph_error!("node {} does not exist", id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    pub fn kind(&self, id: NodeId) -> Option<OpKind> {
        self.node(id).map(Node::kind)
    }

    pub fn output_desc(&self, output: Output) -> Option<&TensorDesc> {
        self.node(output.node)
            .and_then(|n| n.outputs.get(output.index))
    }

    pub fn element_type(&self, output: Output) -> Option<ElementType> {
        self.output_desc(output).map(|d| d.element_type)
    }

    /// Value of `output` if its producer is a Constant.
    pub fn constant_value(&self, output: Output) -> Option<&Tensor> {
        self.node(output.node).and_then(|n| n.op.as_constant())
    }

    /// Enable a tag. Returns true when the node changed.
    pub fn enable_tag(&mut self, id: NodeId, tag: RuntimeTag) -> bool {
        self.node_mut(id)
            .map(|n| n.rt_info.enable(tag))
            .unwrap_or(false)
    }

    /// Record an explicit opt-out. Returns true when the node changed.
    pub fn disable_tag(&mut self, id: NodeId, tag: RuntimeTag) -> bool {
        self.node_mut(id)
            .map(|n| n.rt_info.disable(tag))
            .unwrap_or(false)
    }

    pub fn has_tag(&self, id: NodeId, tag: RuntimeTag) -> bool {
        self.node(id)
            .map(|n| n.rt_info.is_enabled(tag))
            .unwrap_or(false)
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    /// Live node ids in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().flatten().map(|n| n.id).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// Id the next inserted node will get.
    pub fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len())
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn count_kind(&self, kind: OpKind) -> usize {
        self.nodes().filter(|n| n.kind() == kind).count()
    }

    /// `name` if free, otherwise `name_1`, `name_2`, ...
    pub fn unique_name(&self, name: &str) -> String {
        let taken: HashSet<&str> = self.nodes().map(|n| n.name.as_str()).collect();
        if !taken.contains(name) {
            return name.to_string();
        }
        (1..)
            .map(|i| format!("{}_{}", name, i))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_else(|| name.to_string())
    }

    /// All (consumer, input index) pairs reading `output`.
    pub fn consumers(&self, output: Output) -> Vec<(NodeId, usize)> {
        let mut uses = Vec::new();
        for node in self.nodes() {
            for (idx, input) in node.inputs.iter().enumerate() {
                if *input == output {
                    uses.push((node.id, idx));
                }
            }
        }
        uses
    }

    /// Consumers of any output of `id`.
    pub fn node_consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for node in self.nodes() {
            if node.inputs.iter().any(|o| o.node == id) && !seen.contains(&node.id) {
                seen.push(node.id);
            }
        }
        seen
    }

    pub fn set_input(&mut self, consumer: NodeId, index: usize, output: Output) -> ForgeResult<()> {
        if self.output_desc(output).is_none() {
            return Err(graph_error!("output {}:{} does not exist", output.node, output.index));
        }
        let node = self
            .node_mut(consumer)
            .ok_or_else(|| graph_error!("node {} does not exist", consumer))?;
        let slot = node
            .inputs
            .get_mut(index)
            .ok_or_else(|| graph_error!("node {} has no input {}", consumer, index))?;
        *slot = output;
        Ok(())
    }

    /// Point every reader of `old` at `new`. Returns the number of edges moved.
    pub fn replace_output_uses(&mut self, old: Output, new: Output) -> ForgeResult<usize> {
        if self.output_desc(new).is_none() {
            return Err(graph_error!("output {}:{} does not exist", new.node, new.index));
        }
        let mut moved = 0;
        for node in self.nodes.iter_mut().flatten() {
            if node.id == new.node {
                continue;
            }
            for input in node.inputs.iter_mut() {
                if *input == old {
                    *input = new;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    /// Redirect every output of `old` to the same-index output of `new`.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> ForgeResult<()> {
        let old_outputs = self.try_node(old)?.outputs.len();
        let new_outputs = self.try_node(new)?.outputs.len();
        if new_outputs < old_outputs {
            return Err(graph_error!(
                "replacement {} has {} outputs, {} needs {}",
                new,
                new_outputs,
                old,
                old_outputs
            ));
        }
        for index in 0..old_outputs {
            self.replace_output_uses(old.out(index), new.out(index))?;
        }
        Ok(())
    }

    /// Swap the payload of `id` in place and re-infer its outputs.
    pub fn replace_op(&mut self, id: NodeId, op: Op) -> ForgeResult<()> {
        let node = self.try_node(id)?;
        let name = node.name.clone();
        let inputs = node.inputs.clone();
        let input_descs = self.input_descs(&name, &inputs)?;
        let outputs = shape_infer::infer(
            &name,
            &op,
            &input_descs,
            &InputConstants {
                graph: self,
                inputs: &inputs,
            },
        )?;
        if let Some(node) = self.node_mut(id) {
            node.op = op;
            node.outputs = outputs;
        }
        Ok(())
    }

    /// Drop nodes that no result depends on. Parameters always survive.
    pub fn remove_dead_nodes(&mut self) -> usize {
        let mut live: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = self.results.clone();
        stack.extend(self.parameters.iter().copied());
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                stack.extend(node.inputs.iter().map(|o| o.node));
            }
        }
        let mut removed = 0;
        for slot in self.nodes.iter_mut() {
            let dead = matches!(slot, Some(node) if !live.contains(&node.id));
            if dead {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Kahn topological order, ties broken by node id.
    pub fn topological_order(&self) -> ForgeResult<Vec<NodeId>> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes() {
            indegree.entry(node.id).or_insert(0);
            for input in &node.inputs {
                if self.node(input.node).is_none() {
                    return Err(graph_error!(
                        "{} reads removed node {}",
                        node.name,
                        input.node
                    ));
                }
                *indegree.entry(node.id).or_insert(0) += 1;
                users.entry(input.node).or_default().push(node.id);
            }
        }
        let mut ready: BinaryHeap<Reverse<NodeId>> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            if let Some(list) = users.get(&id) {
                for user in list {
                    if let Some(d) = indegree.get_mut(user) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(Reverse(*user));
                        }
                    }
                }
            }
        }
        if order.len() != indegree.len() {
            return Err(graph_error!(
                "graph has a cycle ({} of {} nodes ordered)",
                order.len(),
                indegree.len()
            ));
        }
        Ok(order)
    }

    /// Re-run shape inference over the whole graph in topological order.
    pub fn revalidate(&mut self) -> ForgeResult<()> {
        for id in self.topological_order()? {
            let node = self.try_node(id)?;
            let name = node.name.clone();
            let inputs = node.inputs.clone();
            let op = node.op.clone();
            let input_descs = self.input_descs(&name, &inputs)?;
            let outputs = shape_infer::infer(
                &name,
                &op,
                &input_descs,
                &InputConstants {
                    graph: self,
                    inputs: &inputs,
                },
            )?;
            if let Some(node) = self.node_mut(id) {
                node.outputs = outputs;
            }
        }
        Ok(())
    }

    /// True when every leaf feeding `output` is a Constant.
    pub fn is_on_constant_path(&self, output: Output) -> bool {
        let mut stack = vec![output.node];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.node(id) {
                Some(node) => match node.kind() {
                    OpKind::Constant => {}
                    OpKind::Parameter => return false,
                    _ if node.inputs.is_empty() => return false,
                    _ => stack.extend(node.inputs.iter().map(|o| o.node)),
                },
                None => return false,
            }
        }
        true
    }

    /// Structural hash of names, operators with their attributes, edges,
    /// descriptors and constant values.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let order = self.topological_order().unwrap_or_else(|_| self.node_ids());
        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for id in &order {
            if let Some(node) = self.node(*id) {
                node.name.hash(&mut hasher);
                node.kind().hash(&mut hasher);
                hash_op(&node.op, &mut hasher);
                for input in &node.inputs {
                    position.get(&input.node).hash(&mut hasher);
                    input.index.hash(&mut hasher);
                }
                node.outputs.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

fn hash_op<H: Hasher>(op: &Op, state: &mut H) {
    match op {
        Op::Constant(tensor) => tensor.hash_bits(state),
        // Attribute payloads are small; the debug form covers every field,
        // float attributes included.
        other => format!("{:?}", other).hash(state),
    }
}
