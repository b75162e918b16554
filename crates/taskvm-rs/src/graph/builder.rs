//! Lowering of an [`ImmutableTaskGraph`] into a [`NodeGraph`] for a given device assignment.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::trace;

use super::arena::NodeGraph;
use super::node::{BlockingMode, CacheMode, NodeId, NodeKind, NodeModes, SharingMode};
use crate::device::DeviceIndex;
use crate::error::{Result, RuntimeError};
use crate::task::{Access, DataTransferMode, ImmutableTaskGraph, TaskArg};

/// Where the latest value of one object lives while lowering.
#[derive(Default)]
struct ObjectFlow {
    node: Option<NodeId>,
    /// Incremented on every kernel write.
    version: u32,
    /// Latest write, as `(dependent read, context)`.
    written: Option<(NodeId, NodeId)>,
    /// Value node per context together with the version it holds.
    resident: HashMap<NodeId, (NodeId, u32)>,
    allocations: HashMap<NodeId, NodeId>,
}

struct Lowering<'a> {
    graph: &'a ImmutableTaskGraph,
    nodes: NodeGraph,
    contexts: HashMap<DeviceIndex, NodeId>,
    constants: HashMap<usize, NodeId>,
    parameters: HashMap<usize, NodeId>,
    flows: Vec<ObjectFlow>,
}

/// Builds the node graph of `graph` with task `i` placed on `assignment[i]`.
pub fn build_graph(graph: &ImmutableTaskGraph, assignment: &[DeviceIndex]) -> Result<NodeGraph> {
    if assignment.len() != graph.tasks().len() {
        return Err(RuntimeError::InvalidArgument(format!(
            "graph '{}' has {} tasks but {} device assignments",
            graph.name(),
            graph.tasks().len(),
            assignment.len()
        )));
    }
    let mut lowering = Lowering {
        graph,
        nodes: NodeGraph::new(),
        contexts: HashMap::new(),
        constants: HashMap::new(),
        parameters: HashMap::new(),
        flows: (0..graph.objects().len()).map(|_| ObjectFlow::default()).collect(),
    };
    for (task_index, device) in assignment.iter().enumerate() {
        lowering.lower_task(task_index, *device)?;
    }
    lowering.lower_outputs();
    trace!(
        graph = graph.name(),
        nodes = lowering.nodes.len(),
        "lowered task graph"
    );
    Ok(lowering.nodes)
}

impl Lowering<'_> {
    fn context(&mut self, device: DeviceIndex) -> NodeId {
        let nodes = &mut self.nodes;
        *self
            .contexts
            .entry(device)
            .or_insert_with(|| nodes.add_node(NodeKind::DeviceContext { device }))
    }

    fn object_node(&mut self, object: usize) -> NodeId {
        if let Some(node) = self.flows[object].node {
            return node;
        }
        let node = self.nodes.add_node(NodeKind::Object { index: object });
        self.flows[object].node = Some(node);
        node
    }

    fn allocation(&mut self, object: usize, context: NodeId) -> NodeId {
        if let Some(alloc) = self.flows[object].allocations.get(&context) {
            return *alloc;
        }
        let value = self.object_node(object);
        let alloc = self.nodes.add_node(NodeKind::Allocate { value, context });
        self.flows[object].allocations.insert(context, alloc);
        alloc
    }

    /// Value node to pass for `object` to a task running in `context`.
    fn resolve_object(&mut self, object: usize, access: Access, context: NodeId) -> NodeId {
        let flow = &self.flows[object];
        if let Some((node, version)) = flow.resident.get(&context) {
            if *version == flow.version {
                return *node;
            }
        }
        let shared = flow.resident.keys().any(|other| *other != context)
            || flow.written.is_some_and(|(_, ctx)| ctx != context);
        let staged_from = flow.written.map(|(read, _)| read);
        let version = flow.version;

        let value = self.object_node(object);
        let allocation = self.allocation(object, context);
        let sharing = if shared {
            SharingMode::Shared
        } else {
            SharingMode::Exclusive
        };

        let node = if access == Access::Write {
            allocation
        } else if let Some(after) = staged_from {
            self.nodes.add_node_with_modes(
                NodeKind::CopyIn {
                    value,
                    context,
                    allocation,
                    after: Some(after),
                },
                NodeModes::default()
                    .with_sharing(sharing)
                    .with_cache(CacheMode::Uncached),
            )
        } else {
            match self.graph.input_mode(object) {
                Some(DataTransferMode::EveryExecution) => self.nodes.add_node_with_modes(
                    NodeKind::StreamIn {
                        value,
                        context,
                        allocation,
                        after: None,
                    },
                    NodeModes::default()
                        .with_sharing(sharing)
                        .with_cache(CacheMode::Uncached),
                ),
                _ => self.nodes.add_node_with_modes(
                    NodeKind::CopyIn {
                        value,
                        context,
                        allocation,
                        after: None,
                    },
                    NodeModes::default().with_sharing(sharing),
                ),
            }
        };
        self.flows[object].resident.insert(context, (node, version));
        node
    }

    fn lower_task(&mut self, task_index: usize, device: DeviceIndex) -> Result<()> {
        let graph = self.graph;
        let task = &graph.tasks()[task_index];
        let context = self.context(device);

        let mut args: SmallVec<[NodeId; 8]> = SmallVec::with_capacity(task.args.len());
        let mut writes = Vec::new();
        for arg in &task.args {
            let node = match *arg {
                TaskArg::Object { object, access } => {
                    if object >= self.flows.len() {
                        return Err(RuntimeError::InvalidArgument(format!(
                            "task '{}' references unknown object {object}",
                            task.name
                        )));
                    }
                    let node = self.resolve_object(object, access, context);
                    if access.writes() {
                        writes.push((object, node));
                    }
                    node
                }
                TaskArg::Constant(index) => {
                    let nodes = &mut self.nodes;
                    *self
                        .constants
                        .entry(index)
                        .or_insert_with(|| nodes.add_node(NodeKind::Constant { index }))
                }
                TaskArg::Parameter(index) => {
                    let nodes = &mut self.nodes;
                    *self
                        .parameters
                        .entry(index)
                        .or_insert_with(|| nodes.add_node(NodeKind::Parameter { index }))
                }
            };
            args.push(node);
        }

        let task_node = self.nodes.add_node(NodeKind::Task {
            context,
            task_index,
            args,
        });

        for (object, value) in writes {
            let read = self.nodes.add_node(NodeKind::DependentRead {
                value,
                context,
                task: task_node,
            });
            let flow = &mut self.flows[object];
            flow.version += 1;
            flow.written = Some((read, context));
            flow.resident.insert(context, (read, flow.version));
        }
        Ok(())
    }

    fn lower_outputs(&mut self) {
        let mut seen = Vec::new();
        for transfer in self.graph.outputs() {
            if transfer.mode == DataTransferMode::UnderDemand || seen.contains(&transfer.object) {
                continue;
            }
            seen.push(transfer.object);
            let Some((read, context)) = self.flows[transfer.object].written else {
                trace!(
                    object = transfer.object,
                    "skipping host transfer of an object no task writes"
                );
                continue;
            };
            let NodeKind::DependentRead { task, .. } = *self.nodes.kind(read) else {
                continue;
            };
            if transfer.blocking {
                self.nodes.add_node_with_modes(
                    NodeKind::BlockingCopyOut {
                        value: read,
                        context,
                        task,
                    },
                    NodeModes {
                        blocking: BlockingMode::Blocking,
                        ..NodeModes::default()
                    },
                );
            } else {
                self.nodes.add_node(NodeKind::CopyOut {
                    value: read,
                    context,
                    task,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::DataObject;
    use crate::task::{Arg, TaskGraph};

    fn count(graph: &NodeGraph, name: &str) -> usize {
        graph.filter(|kind| kind.name() == name).len()
    }

    #[test]
    fn vector_add_lowers_to_transfers_task_and_readback() {
        let a = DataObject::from_f32(&[1.0; 8]);
        let b = DataObject::from_f32(&[2.0; 8]);
        let c = DataObject::zeros_f32(8);
        let mut builder = TaskGraph::new("s0");
        builder
            .transfer_to_device(DataTransferMode::EveryExecution, &[&a])
            .transfer_to_device(DataTransferMode::FirstExecution, &[&b])
            .task(
                "t0",
                "add",
                vec![Arg::read(&a), Arg::read(&b), Arg::write(&c)],
            )
            .transfer_to_host(DataTransferMode::EveryExecution, &[&c]);
        let snapshot = builder.snapshot().unwrap();

        let nodes = build_graph(&snapshot, &[DeviceIndex(0)]).unwrap();
        assert_eq!(count(&nodes, "context"), 1);
        assert_eq!(count(&nodes, "allocate"), 3);
        assert_eq!(count(&nodes, "stream_in"), 1);
        assert_eq!(count(&nodes, "copy_in"), 1);
        assert_eq!(count(&nodes, "dependent_read"), 1);
        assert_eq!(count(&nodes, "copy_out"), 1);

        let task = nodes.filter(|kind| matches!(kind, NodeKind::Task { .. }))[0];
        let NodeKind::Task { args, .. } = nodes.kind(task) else {
            unreachable!()
        };
        assert_eq!(nodes.kind(args[2]).name(), "allocate");
    }

    #[test]
    fn cross_device_read_after_write_is_staged() {
        let a = DataObject::from_f32(&[1.0; 4]);
        let b = DataObject::zeros_f32(4);
        let mut builder = TaskGraph::new("s0");
        builder
            .task("t0", "inc", vec![Arg::read_write(&a)])
            .task("t1", "copy", vec![Arg::read(&a), Arg::write(&b)]);
        let snapshot = builder.snapshot().unwrap();

        let nodes = build_graph(&snapshot, &[DeviceIndex(0), DeviceIndex(1)]).unwrap();
        let staged = nodes.filter(|kind| {
            matches!(
                kind,
                NodeKind::CopyIn {
                    after: Some(_),
                    ..
                }
            )
        });
        assert_eq!(staged.len(), 1);
        assert_eq!(nodes.device_of(staged[0]), Some(DeviceIndex(1)));
        assert!(nodes.modes(staged[0]).sharing == SharingMode::Shared);
    }

    #[test]
    fn same_device_chain_reuses_dependent_read() {
        let a = DataObject::from_f32(&[1.0; 4]);
        let mut builder = TaskGraph::new("s0");
        builder
            .task("t0", "inc", vec![Arg::read_write(&a)])
            .task("t1", "inc", vec![Arg::read_write(&a)]);
        let snapshot = builder.snapshot().unwrap();

        let nodes = build_graph(&snapshot, &[DeviceIndex(0), DeviceIndex(0)]).unwrap();
        assert_eq!(count(&nodes, "copy_in"), 1);
        assert_eq!(count(&nodes, "dependent_read"), 2);
        let second = nodes.filter(|kind| matches!(kind, NodeKind::Task { task_index: 1, .. }))[0];
        let NodeKind::Task { args, .. } = nodes.kind(second) else {
            unreachable!()
        };
        assert_eq!(nodes.kind(args[0]).name(), "dependent_read");
    }
}
