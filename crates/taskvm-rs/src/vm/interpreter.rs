use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use smallvec::smallvec;
use tracing::{debug, info, trace};

use super::events::EventList;
use super::runtime::GraphRuntime;
use crate::callstack::CallStack;
use crate::compiler::{CompiledGraph, Instruction, LaunchArg};
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceIndex, DeviceRegistry, EventHandle, ExecutionConfig};
use crate::error::{DeviceError, Result, RuntimeError};
use crate::graph::NodeModes;
use crate::grid::WorkerGrid;
use crate::object::{Constant, DataObject};
use crate::profiler::{elapsed_ns, ProfilerType, TimeProfiler};
use crate::task::{ImmutableTaskGraph, TaskArg};

/// Everything one invocation reads but never mutates.
#[derive(Clone, Copy)]
pub struct ExecutionInputs<'a> {
    pub graph: &'a ImmutableTaskGraph,
    pub compiled: &'a CompiledGraph,
    pub devices: &'a DeviceRegistry,
    /// Effective worker grid of every task, indexed like the graph's task table.
    pub grids: &'a [WorkerGrid],
    pub parameters: &'a [Constant],
    pub config: &'a RuntimeConfig,
}

/// Work issued by one or more invocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounters {
    pub copy_ins: u64,
    pub copy_ins_skipped: u64,
    pub stream_ins: u64,
    pub launches: u64,
    pub read_hosts: u64,
    pub copy_outs: u64,
    pub barriers: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
}

impl ExecutionCounters {
    pub fn merge(&mut self, other: &ExecutionCounters) {
        self.copy_ins += other.copy_ins;
        self.copy_ins_skipped += other.copy_ins_skipped;
        self.stream_ins += other.stream_ins;
        self.launches += other.launches;
        self.read_hosts += other.read_hosts;
        self.copy_outs += other.copy_outs;
        self.barriers += other.barriers;
        self.bytes_to_device += other.bytes_to_device;
        self.bytes_to_host += other.bytes_to_host;
    }
}

/// Single-pass issue loop over one compiled program.
pub struct Interpreter<'a> {
    inputs: ExecutionInputs<'a>,
    runtime: &'a mut GraphRuntime,
    profiler: &'a mut TimeProfiler,
    device: Option<DeviceIndex>,
    last_events: EventList,
    /// Last event issued per device, chained into wait lists of devices that do not order
    /// commands on their own.
    tails: HashMap<DeviceIndex, EventHandle>,
    counters: ExecutionCounters,
    offset: usize,
    opcode: u8,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        inputs: ExecutionInputs<'a>,
        runtime: &'a mut GraphRuntime,
        profiler: &'a mut TimeProfiler,
    ) -> Self {
        Self {
            inputs,
            runtime,
            profiler,
            device: None,
            last_events: EventList::new(),
            tails: HashMap::new(),
            counters: ExecutionCounters::default(),
            offset: 0,
            opcode: 0,
        }
    }

    pub fn run(mut self) -> Result<ExecutionCounters> {
        let compiled: &'a CompiledGraph = self.inputs.compiled;
        let mut reader = compiled.program().reader();
        let mut started = false;
        loop {
            if reader.at_end() {
                return Err(RuntimeError::malformed(
                    reader.position(),
                    0,
                    "program ends without END",
                ));
            }
            let (offset, instruction) = reader.next_instruction()?;
            self.offset = offset;
            self.opcode = instruction.opcode();
            if self.inputs.config.print_bytecodes {
                info!(graph = self.inputs.graph.name(), "{offset:>6}: {instruction}");
            } else {
                trace!(graph = self.inputs.graph.name(), "{offset:>6}: {instruction}");
            }

            if !started && !matches!(instruction, Instruction::Setup { .. }) {
                return Err(self.malformed("program does not start with SETUP"));
            }
            match instruction {
                Instruction::Setup {
                    tasks, event_lists, ..
                } => {
                    if started {
                        return Err(self.malformed("SETUP repeated"));
                    }
                    if tasks as usize != self.inputs.graph.tasks().len() {
                        return Err(self.malformed(format!(
                            "program expects {tasks} tasks, graph has {}",
                            self.inputs.graph.tasks().len()
                        )));
                    }
                    if event_lists as usize > compiled.num_event_lists() {
                        return Err(self.malformed(format!(
                            "program declares {event_lists} event lists, compilation produced {}",
                            compiled.num_event_lists()
                        )));
                    }
                    self.runtime.lists.reset(event_lists as usize);
                    started = true;
                }
                Instruction::Context { device } => {
                    let device = DeviceIndex(device);
                    self.inputs.devices.get(device)?;
                    self.device = Some(device);
                }
                Instruction::Allocate { object, batch, .. } => self.allocate(object, batch)?,
                Instruction::CopyIn {
                    object,
                    wait,
                    offset,
                    len,
                    ..
                } => self.copy_in(object, wait, offset, len)?,
                Instruction::StreamIn {
                    object,
                    wait,
                    offset,
                    len,
                    ..
                } => self.stream_in(object, wait, offset, len)?,
                Instruction::Launch {
                    task,
                    wait,
                    threads,
                    args,
                    ..
                } => self.launch(task, wait, threads, &args)?,
                Instruction::ReadHost { object, wait, .. } => self.read_host(object, wait)?,
                Instruction::CopyOut {
                    object,
                    wait,
                    offset,
                    len,
                    ..
                } => self.copy_out(object, wait, offset, len, false)?,
                Instruction::CopyOutBlocking {
                    object,
                    wait,
                    offset,
                    len,
                    ..
                } => self.copy_out(object, wait, offset, len, true)?,
                Instruction::Barrier { wait, mode } => self.barrier(wait, mode)?,
                Instruction::AddDependency { list } => {
                    if !self
                        .runtime
                        .lists
                        .extend(list as usize, &self.last_events)
                    {
                        return Err(
                            self.malformed(format!("event list {list} is missing or full"))
                        );
                    }
                }
                Instruction::End => break,
            }
        }
        Ok(self.counters)
    }

    fn malformed(&self, reason: impl Into<String>) -> RuntimeError {
        RuntimeError::malformed(self.offset, self.opcode, reason)
    }

    fn context(&self) -> Result<(DeviceIndex, &'a Arc<dyn Device>)> {
        let index = self
            .device
            .ok_or_else(|| self.malformed("no device context selected"))?;
        let devices: &'a DeviceRegistry = self.inputs.devices;
        Ok((index, devices.get(index)?))
    }

    fn object(&self, object: u32) -> Result<(usize, &'a DataObject)> {
        let objects: &'a [DataObject] = self.inputs.graph.objects();
        let index = object as usize;
        objects
            .get(index)
            .map(|data| (index, data))
            .ok_or_else(|| self.malformed(format!("object index {object} out of range")))
    }

    /// Takes the wait list `wait`, chained after the previous command on devices that do
    /// not order commands themselves.
    fn wait_events(&mut self, index: DeviceIndex, device: &Arc<dyn Device>, wait: i32) -> Result<EventList> {
        let mut events = self
            .runtime
            .lists
            .take(wait)
            .ok_or_else(|| self.malformed(format!("event list {wait} out of range")))?;
        if !device.auto_orders() {
            if let Some(tail) = self.tails.get(&index) {
                if !events.contains(tail) {
                    events.push(*tail);
                }
            }
        }
        Ok(events)
    }

    fn record(&mut self, device: DeviceIndex, event: EventHandle) {
        self.last_events = smallvec![event];
        self.tails.insert(device, event);
    }

    /// With profiling enabled, waits for `event` and charges its device time to `kind`.
    fn profile(
        &mut self,
        index: DeviceIndex,
        device: &Arc<dyn Device>,
        event: EventHandle,
        kind: ProfilerType,
        task: Option<&str>,
    ) -> Result<()> {
        if !self.profiler.is_enabled() {
            return Ok(());
        }
        let op = match kind {
            ProfilerType::DeviceKernel => "launch",
            _ => "transfer",
        };
        device
            .wait_event(event)
            .map_err(|err| RuntimeError::device(op, None, index, err))?;
        let resolved = device
            .resolve_event(event)
            .map_err(|err| RuntimeError::device(op, None, index, err))?;
        match task {
            Some(task) => self.profiler.add_task_kernel(task, resolved.execution_ns()),
            None => self.profiler.add(kind, resolved.execution_ns()),
        }
        Ok(())
    }

    fn allocate(&mut self, object: u32, batch: u64) -> Result<()> {
        let (index, device) = self.context()?;
        let (object, data) = self.object(object)?;
        let state = self.runtime.tracker.ensure_allocated(object, index);
        let before = state.buffer();
        device
            .ensure_allocated(data, batch, state)
            .map_err(|err| RuntimeError::device("allocate", Some(object), index, err))?;
        let rebound = state.buffer() != before;
        if rebound {
            debug!(object, %index, bytes = data.byte_len(), "bound device buffer");
            // Frames on this device may still hold the old address.
            self.runtime.reset_stacks_on(index);
        }
        Ok(())
    }

    fn copy_in(&mut self, object: u32, wait: i32, offset: u64, len: u64) -> Result<()> {
        let (index, device) = self.context()?;
        let (object, data) = self.object(object)?;
        let waits = self.wait_events(index, device, wait)?;
        // A partial window belongs to one batch and is always transferred.
        if len == 0 && !self.runtime.tracker.ensure_present(object, index) {
            self.counters.copy_ins_skipped += 1;
            self.last_events = waits;
            return Ok(());
        }
        let start = Instant::now();
        let result = match self.runtime.tracker.state(object, index) {
            Some(state) => device.ensure_present(data, state, &waits, offset, len),
            None => Err(DeviceError::execution("object has no device record")),
        };
        let event = self.transferred_in("copy_in", object, index, result)?;
        self.profiler
            .add_elapsed(ProfilerType::DataTransferDispatch, start);
        self.counters.copy_ins += 1;
        self.counters.bytes_to_device += window(data, offset, len);
        debug!(object, %index, "copy in");
        self.profile(index, device, event, ProfilerType::CopyIn, None)
    }

    fn stream_in(&mut self, object: u32, wait: i32, offset: u64, len: u64) -> Result<()> {
        let (index, device) = self.context()?;
        let (object, data) = self.object(object)?;
        let waits = self.wait_events(index, device, wait)?;
        self.runtime.tracker.ensure_allocated(object, index);

        let total = window(data, offset, len);
        let end = offset
            .checked_add(total)
            .ok_or_else(|| self.malformed(format!("window of {total} bytes at {offset} overflows")))?;
        let chunk = self.inputs.config.stream_chunk_bytes;
        let start = Instant::now();
        let result = match self.runtime.tracker.state(object, index) {
            None => Err(DeviceError::execution("object has no device record")),
            Some(state) if chunk == 0 || total <= chunk => {
                device.stream_in(data, state, &waits, offset, len)
            }
            Some(state) => {
                let mut chunks = Vec::new();
                let mut cursor = offset;
                let mut failed = None;
                while cursor < end {
                    let step = chunk.min(end - cursor);
                    match device.stream_in(data, state, &waits, cursor, step) {
                        Ok(event) => chunks.push(event),
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                    cursor += step;
                }
                match failed {
                    Some(err) => Err(err),
                    None => device.enqueue_barrier(&chunks),
                }
            }
        };
        let event = self.transferred_in("stream_in", object, index, result)?;
        self.profiler
            .add_elapsed(ProfilerType::DataTransferDispatch, start);
        self.counters.stream_ins += 1;
        self.counters.bytes_to_device += total;
        debug!(object, %index, bytes = total, "stream in");
        self.profile(index, device, event, ProfilerType::CopyIn, None)
    }

    /// Settles the state of a host-to-device transfer.
    fn transferred_in(
        &mut self,
        op: &'static str,
        object: usize,
        index: DeviceIndex,
        result: std::result::Result<EventHandle, DeviceError>,
    ) -> Result<EventHandle> {
        match result {
            Ok(event) => {
                self.runtime.tracker.mark_valid(object, index);
                self.record(index, event);
                Ok(event)
            }
            Err(err) => {
                self.runtime.tracker.invalidate(object, index);
                Err(RuntimeError::device(op, Some(object), index, err))
            }
        }
    }

    fn launch(&mut self, task: u32, wait: i32, threads: u64, args: &[LaunchArg]) -> Result<()> {
        let (index, device) = self.context()?;
        let graph: &'a ImmutableTaskGraph = self.inputs.graph;
        let task_index = task as usize;
        let descriptor = graph
            .tasks()
            .get(task_index)
            .ok_or_else(|| self.malformed(format!("task index {task} out of range")))?;
        if args.len() != descriptor.num_args() {
            return Err(self.malformed(format!(
                "task '{}' takes {} arguments, LAUNCH pushes {}",
                descriptor.name,
                descriptor.num_args(),
                args.len()
            )));
        }

        let mut addresses: Vec<Option<u64>> = Vec::with_capacity(args.len());
        for (arg, declared) in args.iter().zip(&descriptor.args) {
            let LaunchArg::Reference(object) = *arg else {
                addresses.push(None);
                continue;
            };
            let (object, _) = self.object(object)?;
            let reads = matches!(declared, TaskArg::Object { access, .. } if access.reads());
            let state = self.runtime.tracker.state(object, index);
            let buffer = state.and_then(|state| state.buffer());
            let ready = match (state, buffer) {
                (Some(state), Some(_)) => !reads || state.is_valid(),
                _ => false,
            };
            if !ready {
                return Err(RuntimeError::device(
                    "launch",
                    Some(object),
                    index,
                    DeviceError::execution(format!(
                        "argument of task '{}' is not valid on the device",
                        descriptor.name
                    )),
                ));
            }
            addresses.push(buffer.map(|buffer| buffer.address));
        }

        self.prepare_stack(task_index, index, args, &addresses)?;
        let kernel = self.runtime.kernel(
            self.inputs.devices,
            index,
            task_index,
            descriptor,
            self.profiler,
        )?;
        let mut grid = self
            .inputs
            .grids
            .get(task_index)
            .copied()
            .unwrap_or(descriptor.grid);
        if threads > 0 {
            if grid.dims() != 1 {
                return Err(self.malformed(format!(
                    "batched launch of '{}' needs a 1D grid, task uses {}D",
                    descriptor.name,
                    grid.dims()
                )));
            }
            grid = WorkerGrid::d1(threads);
        }
        let config = ExecutionConfig::new(grid);
        let waits = self.wait_events(index, device, wait)?;

        let start = Instant::now();
        let result = match self.runtime.stacks.get(task_index) {
            Some(Some(stack)) => kernel.launch(stack, &config, &waits),
            _ => Err(DeviceError::execution("task has no call stack")),
        };
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                for (object, access) in descriptor.objects() {
                    if access.writes() {
                        self.runtime.tracker.invalidate(object, index);
                    }
                }
                if let Some(Some(stack)) = self.runtime.stacks.get_mut(task_index) {
                    stack.reset();
                }
                return Err(RuntimeError::device("launch", None, index, err));
            }
        };
        let latency = elapsed_ns(start);
        self.profiler.add(ProfilerType::KernelDispatch, latency);
        if let Some(Some(stack)) = self.runtime.stacks.get_mut(task_index) {
            stack.stats_mut().record(latency);
        }
        for (object, access) in descriptor.objects() {
            if access.writes() {
                self.runtime.tracker.mark_modified(object, index);
            }
        }
        self.record(index, event);
        self.counters.launches += 1;
        debug!(task = %descriptor.name, %index, threads = grid.total_threads(), "launch");
        self.profile(
            index,
            device,
            event,
            ProfilerType::DeviceKernel,
            Some(descriptor.name.as_str()),
        )
    }

    /// Builds the frame of `task` on first use or after it was invalidated; otherwise only
    /// refreshes call parameter slots.
    fn prepare_stack(
        &mut self,
        task: usize,
        index: DeviceIndex,
        args: &[LaunchArg],
        addresses: &[Option<u64>],
    ) -> Result<()> {
        let constants: &'a [Constant] = self.inputs.graph.constants();
        let parameters: &'a [Constant] = self.inputs.parameters;
        let parameter = |slot: u32| {
            parameters.get(slot as usize).copied().ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("call parameter {slot} was not supplied"))
            })
        };

        let slot = self
            .runtime
            .stacks
            .get_mut(task)
            .ok_or_else(|| RuntimeError::malformed(self.offset, self.opcode, "task has no stack slot"))?;
        let reusable = matches!(slot, Some(stack) if stack.is_on_device() && stack.device() == index);
        if reusable {
            if let Some(stack) = slot.as_mut() {
                for (position, arg) in args.iter().enumerate() {
                    if let LaunchArg::Parameter(param) = *arg {
                        stack.set_arg(position, parameter(param)?.to_slot());
                    }
                }
            }
            return Ok(());
        }

        let mut stack = match slot.take() {
            Some(stack) if stack.device() == index => stack,
            previous => {
                let mut stack = CallStack::new(args.len(), index);
                if let Some(previous) = previous {
                    *stack.stats_mut() = previous.stats().clone();
                }
                stack
            }
        };
        stack.reset();
        for (arg, address) in args.iter().zip(addresses) {
            match *arg {
                LaunchArg::Constant(constant) => {
                    let value = constants.get(constant as usize).copied().ok_or_else(|| {
                        RuntimeError::malformed(
                            self.offset,
                            self.opcode,
                            format!("constant {constant} out of range"),
                        )
                    })?;
                    stack.push_value(value);
                }
                LaunchArg::Parameter(param) => stack.push_value(parameter(param)?),
                LaunchArg::Reference(_) => stack.push_address(address.unwrap_or_default()),
            }
        }
        stack.mark_on_device();
        trace!(task, %index, args = stack.pushed_args(), "built call stack");
        *slot = Some(stack);
        Ok(())
    }

    fn read_host(&mut self, object: u32, wait: i32) -> Result<()> {
        let (index, device) = self.context()?;
        let (object, data) = self.object(object)?;
        let waits = self.wait_events(index, device, wait)?;
        let start = Instant::now();
        let result = match self.runtime.tracker.state(object, index) {
            Some(state) => device.stream_out_blocking(data, state, &waits, 0, 0),
            None => Err(DeviceError::execution("object has no device record")),
        };
        let event = result.map_err(|err| RuntimeError::device("read_host", Some(object), index, err))?;
        self.profiler
            .add_elapsed(ProfilerType::DataTransferDispatch, start);
        self.runtime.tracker.mark_synced(object, index);
        self.record(index, event);
        self.counters.read_hosts += 1;
        self.counters.bytes_to_host += data.byte_len();
        debug!(object, %index, "staged object through host");
        self.profile(index, device, event, ProfilerType::CopyOut, None)
    }

    fn copy_out(&mut self, object: u32, wait: i32, offset: u64, len: u64, blocking: bool) -> Result<()> {
        let (index, device) = self.context()?;
        let (object, data) = self.object(object)?;
        let waits = self.wait_events(index, device, wait)?;
        let start = Instant::now();
        let result = match self.runtime.tracker.state(object, index) {
            Some(state) if blocking => device.stream_out_blocking(data, state, &waits, offset, len),
            Some(state) => device.stream_out(data, state, &waits, offset, len),
            None => Err(DeviceError::execution("object has no device record")),
        };
        let event = result.map_err(|err| RuntimeError::device("copy_out", Some(object), index, err))?;
        self.profiler
            .add_elapsed(ProfilerType::DataTransferDispatch, start);
        self.runtime.tracker.mark_synced(object, index);
        self.record(index, event);
        self.counters.copy_outs += 1;
        self.counters.bytes_to_host += window(data, offset, len);
        debug!(object, %index, blocking, "copy out");
        self.profile(index, device, event, ProfilerType::CopyOut, None)
    }

    fn barrier(&mut self, wait: i32, mode: u8) -> Result<()> {
        let (index, device) = self.context()?;
        let waits = self.wait_events(index, device, wait)?;
        let event = device
            .enqueue_barrier(&waits)
            .map_err(|err| RuntimeError::device("barrier", None, index, err))?;
        if NodeModes::decode(mode).is_blocking() {
            device
                .wait_event(event)
                .map_err(|err| RuntimeError::device("barrier", None, index, err))?;
        }
        self.record(index, event);
        self.counters.barriers += 1;
        Ok(())
    }
}

/// Bytes covered by an `(offset, len)` operand pair, `len == 0` meaning "to the end".
fn window(object: &DataObject, offset: u64, len: u64) -> u64 {
    if len == 0 {
        object.byte_len().saturating_sub(offset)
    } else {
        len
    }
}
