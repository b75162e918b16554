//! Graph compiler: schedules a [`NodeGraph`] and emits a [`BytecodeProgram`].

pub mod batch;
pub mod bytecode;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use smallvec::SmallVec;
use tracing::debug;

use crate::config::{CompilerConfig, ReadbackBlocking};
use crate::device::DeviceIndex;
use crate::error::{Result, RuntimeError};
use crate::graph::{BlockingMode, NodeGraph, NodeId, NodeKind, NodeModes};

pub use batch::{Batches, Chunk};
pub use bytecode::{BytecodeProgram, BytecodeReader, Instruction, LaunchArg, NO_WAIT};

/// Output of one compilation. Immutable; the plan replays it until the device assignment
/// of its graph changes.
#[derive(Clone, Debug)]
pub struct CompiledGraph {
    program: BytecodeProgram,
    devices: Vec<DeviceIndex>,
    task_devices: Vec<DeviceIndex>,
    num_event_lists: usize,
    num_instructions: usize,
}

impl CompiledGraph {
    pub fn program(&self) -> &BytecodeProgram {
        &self.program
    }

    /// Devices with at least one context group, in order of first use.
    pub fn devices(&self) -> &[DeviceIndex] {
        &self.devices
    }

    pub fn task_device(&self, task: usize) -> Option<DeviceIndex> {
        self.task_devices.get(task).copied()
    }

    pub fn num_tasks(&self) -> usize {
        self.task_devices.len()
    }

    pub fn num_event_lists(&self) -> usize {
        self.num_event_lists
    }

    pub fn num_instructions(&self) -> usize {
        self.num_instructions
    }

    /// The same compilation with its program replaced by a patched or hand-assembled one.
    /// Device tables and counts still describe the original program.
    pub fn with_program(&self, program: BytecodeProgram) -> Self {
        Self {
            program,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GraphCompiler {
    config: CompilerConfig,
    batches: Option<Batches>,
}

impl GraphCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            batches: None,
        }
    }

    /// Emits the schedule once per batch instead of once per whole object.
    pub fn with_batches(mut self, batches: Batches) -> Self {
        self.batches = Some(batches);
        self
    }

    /// Compiles `graph` for a task table of `num_tasks` entries.
    #[tracing::instrument(skip_all, fields(nodes = graph.len(), tasks = num_tasks))]
    pub fn compile(&self, graph: &mut NodeGraph, num_tasks: usize) -> Result<CompiledGraph> {
        let order = assign_ids(graph)?;
        let segments = schedule(graph, &order)?;
        if self.batches.is_some() {
            if let Some((device, _)) = segments.iter().find(|(device, _)| *device != segments[0].0) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "batch processing runs on a single device, graph also uses {device}"
                )));
            }
        }
        let mut emitter = Emitter::new(graph, self.config, self.batches, num_tasks);
        let compiled = emitter.emit(&segments)?;
        debug!(
            bytes = compiled.program.len(),
            instructions = compiled.num_instructions,
            contexts = compiled.devices.len(),
            "compiled task graph"
        );
        Ok(compiled)
    }
}

/// Assigns monotonically increasing ids in dependency order and returns the nodes in that
/// order. Ties are broken by arena position, which keeps compilation deterministic.
pub fn assign_ids(graph: &mut NodeGraph) -> Result<Vec<NodeId>> {
    graph.clear_ids();
    let len = graph.len();
    let mut pending = vec![0usize; len];
    let mut successors: Vec<SmallVec<[NodeId; 4]>> = vec![SmallVec::new(); len];
    for (node, entry) in graph.iter() {
        let mut inputs = entry.kind().inputs();
        inputs.sort();
        inputs.dedup();
        for input in inputs {
            if input.index() >= len || input == node {
                return Err(RuntimeError::DependencyViolation {
                    node: node.0,
                    input: input.0,
                });
            }
            pending[node.index()] += 1;
            successors[input.index()].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<NodeId>> = graph
        .iter()
        .filter(|(node, _)| pending[node.index()] == 0)
        .map(|(node, _)| Reverse(node))
        .collect();
    let mut order = Vec::with_capacity(len);
    while let Some(Reverse(node)) = ready.pop() {
        graph.assign_id(node, order.len() as u32);
        order.push(node);
        for successor in &successors[node.index()] {
            pending[successor.index()] -= 1;
            if pending[successor.index()] == 0 {
                ready.push(Reverse(*successor));
            }
        }
    }

    if order.len() != len {
        let (node, _) = graph
            .iter()
            .find(|(node, _)| graph.id_of(*node).is_none())
            .ok_or_else(|| RuntimeError::InvalidArgument("scheduling lost a node".into()))?;
        let input = graph
            .inputs(node)
            .into_iter()
            .find(|input| graph.id_of(*input).is_none())
            .unwrap_or(node);
        return Err(RuntimeError::DependencyViolation {
            node: node.0,
            input: input.0,
        });
    }
    Ok(order)
}

/// Groups operation nodes into per-context segments. Within a context nodes keep their id
/// order; a context is suspended at the first node whose inputs from other contexts have
/// not been emitted yet.
fn schedule(graph: &NodeGraph, order: &[NodeId]) -> Result<Vec<(DeviceIndex, Vec<NodeId>)>> {
    let mut contexts: Vec<DeviceIndex> = Vec::new();
    let mut queues: HashMap<DeviceIndex, Vec<NodeId>> = HashMap::new();
    for node in order {
        if !graph.kind(*node).is_operation() {
            continue;
        }
        let device = graph
            .device_of(*node)
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("{node} has no device context")))?;
        if !queues.contains_key(&device) {
            contexts.push(device);
        }
        queues.entry(device).or_default().push(*node);
    }

    let mut cursors: HashMap<DeviceIndex, usize> = HashMap::new();
    let mut emitted: HashSet<NodeId> = HashSet::new();
    let mut segments = Vec::new();
    let total: usize = queues.values().map(Vec::len).sum();
    while emitted.len() < total {
        let mut progressed = false;
        for device in &contexts {
            let queue = &queues[device];
            let cursor = cursors.entry(*device).or_default();
            let mut segment = Vec::new();
            while let Some(node) = queue.get(*cursor) {
                let blocked = graph.inputs(*node).iter().any(|input| {
                    graph.kind(*input).is_operation()
                        && graph.device_of(*input) != Some(*device)
                        && !emitted.contains(input)
                });
                if blocked {
                    break;
                }
                emitted.insert(*node);
                segment.push(*node);
                *cursor += 1;
            }
            if !segment.is_empty() {
                progressed = true;
                segments.push((*device, segment));
            }
        }
        if !progressed {
            let stuck = contexts
                .iter()
                .find_map(|device| queues[device].get(cursors[device]).copied())
                .unwrap_or(NodeId(0));
            return Err(RuntimeError::DependencyViolation {
                node: stuck.0,
                input: stuck.0,
            });
        }
    }
    Ok(segments)
}

struct Emitter<'a> {
    graph: &'a NodeGraph,
    config: CompilerConfig,
    batches: Option<Batches>,
    chunk: Chunk,
    num_tasks: usize,
    instructions: Vec<Instruction>,
    lists: HashMap<NodeId, u32>,
    next_list: u32,
}

impl<'a> Emitter<'a> {
    fn new(
        graph: &'a NodeGraph,
        config: CompilerConfig,
        batches: Option<Batches>,
        num_tasks: usize,
    ) -> Self {
        Self {
            graph,
            config,
            batches,
            chunk: Chunk::default(),
            num_tasks,
            instructions: Vec::new(),
            lists: HashMap::new(),
            next_list: 0,
        }
    }

    fn emit(&mut self, segments: &[(DeviceIndex, Vec<NodeId>)]) -> Result<CompiledGraph> {
        let mut devices: Vec<DeviceIndex> = Vec::new();
        for (device, _) in segments {
            if !devices.contains(device) {
                devices.push(*device);
            }
        }
        let blocking_copy_outs = self.blocking_copy_outs(segments);

        let mut task_devices = vec![None; self.num_tasks];
        let mut ends_blocking: HashMap<DeviceIndex, bool> = HashMap::new();
        let chunks = match &self.batches {
            Some(batches) => batches.chunks(),
            None => vec![Chunk::default()],
        };
        for chunk in chunks {
            self.chunk = chunk;
            for (device, nodes) in segments {
                self.instructions.push(Instruction::Context { device: device.0 });
                for node in nodes {
                    if let NodeKind::Task { task_index, .. } = self.graph.kind(*node) {
                        let slot = task_devices.get_mut(*task_index).ok_or_else(|| {
                            RuntimeError::InvalidArgument(format!(
                                "task index {task_index} out of range ({} tasks)",
                                self.num_tasks
                            ))
                        })?;
                        *slot = Some(*device);
                    }
                    let blocking = blocking_copy_outs.contains(node);
                    self.emit_node(*node, *device, blocking)?;
                    ends_blocking.insert(*device, blocking);
                }
            }
        }
        for device in &devices {
            if !ends_blocking.get(device).copied().unwrap_or(false) {
                self.instructions.push(Instruction::Context { device: device.0 });
                self.instructions.push(Instruction::Barrier {
                    wait: NO_WAIT,
                    mode: NodeModes::blocking().encode(),
                });
            }
        }
        self.instructions.push(Instruction::End);

        let task_devices = task_devices
            .into_iter()
            .enumerate()
            .map(|(task, device)| {
                device.ok_or_else(|| {
                    RuntimeError::InvalidArgument(format!("task {task} has no node in the graph"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut instructions = vec![Instruction::Setup {
            contexts: devices.len() as u32,
            tasks: self.num_tasks as u32,
            event_lists: self.next_list,
        }];
        instructions.append(&mut self.instructions);
        Ok(CompiledGraph {
            program: BytecodeProgram::assemble(&instructions),
            devices,
            task_devices,
            num_event_lists: self.next_list as usize,
            num_instructions: instructions.len(),
        })
    }

    /// Copy-outs that must block under the configured read-back policy.
    fn blocking_copy_outs(&self, segments: &[(DeviceIndex, Vec<NodeId>)]) -> HashSet<NodeId> {
        let mut blocking = HashSet::new();
        let mut last: HashMap<DeviceIndex, NodeId> = HashMap::new();
        for (device, nodes) in segments {
            for node in nodes {
                match self.graph.kind(*node) {
                    NodeKind::BlockingCopyOut { .. } => {
                        blocking.insert(*node);
                    }
                    NodeKind::CopyOut { .. } => {
                        if self.graph.modes(*node).is_blocking()
                            || self.config.readback_blocking == ReadbackBlocking::Always
                        {
                            blocking.insert(*node);
                        }
                        last.insert(*device, *node);
                    }
                    _ => {}
                }
            }
        }
        if self.config.readback_blocking == ReadbackBlocking::LastPerContext {
            blocking.extend(last.into_values());
        }
        blocking
    }

    fn list(&mut self, node: NodeId) -> u32 {
        if let Some(list) = self.lists.get(&node) {
            return *list;
        }
        let list = self.next_list;
        self.next_list += 1;
        self.lists.insert(node, list);
        list
    }

    /// Dependency list the node waits on, if anything in its context feeds it an event.
    fn wait_list(&mut self, node: NodeId) -> i32 {
        let device = self.graph.device_of(node);
        let waits = self.graph.inputs(node).iter().any(|input| {
            produces_event(self.graph.kind(*input)) && self.graph.device_of(*input) == device
        });
        if waits {
            self.list(node) as i32
        } else {
            NO_WAIT
        }
    }

    /// Appends the event of the instruction just emitted to each same-context consumer.
    fn publish(&mut self, node: NodeId) {
        let device = self.graph.device_of(node);
        let consumers: SmallVec<[NodeId; 8]> = self
            .graph
            .uses(node)
            .iter()
            .copied()
            .filter(|consumer| {
                self.graph.kind(*consumer).is_operation()
                    && self.graph.device_of(*consumer) == device
            })
            .collect();
        for consumer in consumers {
            let list = self.list(consumer);
            self.instructions.push(Instruction::AddDependency { list });
        }
    }

    fn object_operand(&self, node: NodeId) -> Result<u32> {
        self.graph
            .object_index(node)
            .map(|index| index as u32)
            .ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("{node} does not refer to a data object"))
            })
    }

    fn emit_node(&mut self, node: NodeId, device: DeviceIndex, blocking: bool) -> Result<()> {
        let graph = self.graph;
        let mut modes = graph.modes(node);
        if blocking {
            modes.blocking = BlockingMode::Blocking;
        }
        let mode = modes.encode();
        let Chunk {
            offset,
            len,
            threads,
        } = self.chunk;
        match graph.kind(node) {
            NodeKind::Allocate { .. } => {
                let object = self.object_operand(node)?;
                self.instructions.push(Instruction::Allocate {
                    object,
                    mode,
                    batch: self.batches.map_or(0, |batches| batches.batch_bytes()),
                });
            }
            NodeKind::CopyIn { .. } | NodeKind::StreamIn { .. } => {
                let object = self.object_operand(node)?;
                let wait = self.wait_list(node);
                let streamed = matches!(graph.kind(node), NodeKind::StreamIn { .. });
                self.instructions.push(if streamed {
                    Instruction::StreamIn {
                        object,
                        wait,
                        mode,
                        offset,
                        len,
                    }
                } else {
                    Instruction::CopyIn {
                        object,
                        wait,
                        mode,
                        offset,
                        len,
                    }
                });
                self.publish(node);
            }
            NodeKind::Task {
                task_index, args, ..
            } => {
                let mut operands = SmallVec::with_capacity(args.len());
                for arg in args {
                    operands.push(match graph.kind(*arg) {
                        NodeKind::Constant { index } => LaunchArg::Constant(*index as u32),
                        NodeKind::Parameter { index } => LaunchArg::Parameter(*index as u32),
                        _ => LaunchArg::Reference(self.object_operand(*arg)?),
                    });
                }
                let wait = self.wait_list(node);
                self.instructions.push(Instruction::Launch {
                    task: *task_index as u32,
                    wait,
                    mode,
                    threads,
                    args: operands,
                });
                self.publish(node);
            }
            NodeKind::DependentRead { .. } => {
                let wait = self.wait_list(node);
                self.instructions.push(Instruction::Barrier { wait, mode });
                let staged = graph.uses(node).iter().any(|consumer| {
                    graph.kind(*consumer).is_operation()
                        && graph.device_of(*consumer) != Some(device)
                });
                if staged {
                    let list = self.list(node);
                    self.instructions.push(Instruction::AddDependency { list });
                    self.instructions.push(Instruction::ReadHost {
                        object: self.object_operand(node)?,
                        wait: list as i32,
                        mode: NodeModes::blocking().encode(),
                    });
                }
                self.publish(node);
            }
            NodeKind::CopyOut { .. } | NodeKind::BlockingCopyOut { .. } => {
                let object = self.object_operand(node)?;
                let list = self.list(node);
                self.instructions.push(Instruction::Barrier {
                    wait: list as i32,
                    mode: NodeModes::default().encode(),
                });
                self.instructions.push(Instruction::AddDependency { list });
                let wait = list as i32;
                self.instructions.push(if blocking {
                    Instruction::CopyOutBlocking {
                        object,
                        wait,
                        mode,
                        offset,
                        len,
                    }
                } else {
                    Instruction::CopyOut {
                        object,
                        wait,
                        mode,
                        offset,
                        len,
                    }
                });
                self.publish(node);
            }
            NodeKind::Object { .. }
            | NodeKind::Parameter { .. }
            | NodeKind::Constant { .. }
            | NodeKind::DeviceContext { .. } => {}
        }
        Ok(())
    }
}

fn produces_event(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::CopyIn { .. }
            | NodeKind::StreamIn { .. }
            | NodeKind::Task { .. }
            | NodeKind::DependentRead { .. }
            | NodeKind::CopyOut { .. }
            | NodeKind::BlockingCopyOut { .. }
    )
}
