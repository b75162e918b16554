use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeInputs, NodeKind, NodeModes};
use crate::device::DeviceIndex;

/// Arena holding the nodes of one task graph.
///
/// Nodes never own each other: inputs live in [`NodeKind`] payloads and `uses` are
/// back-references, both stored as [`NodeId`] indices into this arena.
#[derive(Clone, Debug, Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        self.add_node_with_modes(kind, NodeModes::default())
    }

    /// Appends a node and records it as a use of each of its inputs. Inputs outside the
    /// arena are kept as-is so the compiler can report them.
    pub fn add_node_with_modes(&mut self, kind: NodeKind, modes: NodeModes) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let inputs = kind.inputs();
        self.nodes.push(Node {
            kind,
            id: None,
            uses: Vec::new(),
            modes,
        });
        for input in inputs {
            if input.index() < self.nodes.len() && input != id {
                self.add_use(input, id);
            }
        }
        id
    }

    pub fn add_use(&mut self, producer: NodeId, consumer: NodeId) {
        let uses = &mut self.nodes[producer.index()].uses;
        if !uses.contains(&consumer) {
            uses.push(consumer);
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn inputs(&self, id: NodeId) -> NodeInputs {
        self.nodes[id.index()].kind.inputs()
    }

    pub fn uses(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].uses
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    pub fn filter<F>(&self, mut predicate: F) -> Vec<NodeId>
    where
        F: FnMut(&NodeKind) -> bool,
    {
        self.iter()
            .filter(|(_, node)| predicate(&node.kind))
            .map(|(id, _)| id)
            .collect()
    }

    /// Redirects every consumer of `old` to `new`, moving the use links with it. A consumer
    /// equal to `new` keeps its reference to `old`, so a node can be spliced in after `old`.
    pub fn replace_at_usages(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        let consumers = std::mem::take(&mut self.nodes[old.index()].uses);
        let mut kept = Vec::new();
        for consumer in consumers {
            if consumer == new {
                kept.push(consumer);
                continue;
            }
            if self.nodes[consumer.index()].kind.replace_input(old, new) {
                self.add_use(new, consumer);
            }
        }
        self.nodes[old.index()].uses = kept;
    }

    pub fn modes(&self, id: NodeId) -> NodeModes {
        self.nodes[id.index()].modes
    }

    pub fn set_modes(&mut self, id: NodeId, modes: NodeModes) {
        self.nodes[id.index()].modes = modes;
    }

    pub fn id_of(&self, id: NodeId) -> Option<u32> {
        self.nodes[id.index()].id
    }

    pub(crate) fn assign_id(&mut self, node: NodeId, id: u32) {
        self.nodes[node.index()].id = Some(id);
    }

    pub fn clear_ids(&mut self) {
        for node in &mut self.nodes {
            node.id = None;
        }
    }

    /// Object-table index behind a data or transfer node, following `value` links.
    pub fn object_index(&self, mut id: NodeId) -> Option<usize> {
        loop {
            match &self.get(id)?.kind {
                NodeKind::Object { index } => return Some(*index),
                NodeKind::Allocate { value, .. }
                | NodeKind::CopyIn { value, .. }
                | NodeKind::StreamIn { value, .. }
                | NodeKind::DependentRead { value, .. }
                | NodeKind::CopyOut { value, .. }
                | NodeKind::BlockingCopyOut { value, .. } => id = *value,
                _ => return None,
            }
        }
    }

    /// Device targeted by an operation node.
    pub fn device_of(&self, id: NodeId) -> Option<DeviceIndex> {
        let context = self.get(id)?.kind.context()?;
        match self.get(context)?.kind {
            NodeKind::DeviceContext { device } => Some(device),
            _ => None,
        }
    }

    /// Operation nodes that execute against a device-context node.
    pub fn context_members(&self, context: NodeId) -> SmallVec<[NodeId; 16]> {
        self.uses(context).iter().copied().collect()
    }
}
