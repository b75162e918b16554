//! Execution plans: the user-facing entry point.
//!
//! An [`ExecutionPlan`] owns one or more immutable task graphs together with everything
//! needed to replay them: the device table, the task-to-device assignment of each graph,
//! per-graph runtime state and a cache of compiled programs. Compilation happens lazily on
//! the first execution after the assignment of a graph changes; geometry overrides and
//! profiler toggles never trigger one.

mod cache;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::callstack::KernelStats;
use crate::compiler::{Batches, BytecodeProgram, CompiledGraph, GraphCompiler};
use crate::config::RuntimeConfig;
use crate::device::{DeviceIndex, DeviceRegistry};
use crate::error::{Result, RuntimeError};
use crate::graph::build_graph;
use crate::grid::{GridScheduler, WorkerGrid};
use crate::object::{Constant, DataObject};
use crate::profiler::{ProfilerMode, ProfilerResult, ProfilerType, TimeProfiler};
use crate::task::ImmutableTaskGraph;
use crate::vm::{ExecutionCounters, ExecutionInputs, GraphRuntime, Interpreter};

pub use cache::{fnv1a_hash, ProgramCache, ProgramKey};

struct GraphEntry {
    graph: ImmutableTaskGraph,
    assignment: Vec<DeviceIndex>,
    runtime: GraphRuntime,
    current: Option<Arc<CompiledGraph>>,
}

impl GraphEntry {
    fn new(graph: ImmutableTaskGraph) -> Self {
        Self {
            assignment: vec![DeviceIndex::default(); graph.tasks().len()],
            runtime: GraphRuntime::new(&graph),
            graph,
            current: None,
        }
    }
}

pub struct ExecutionPlan {
    devices: DeviceRegistry,
    graphs: Vec<GraphEntry>,
    selected: Option<usize>,
    scheduler: Option<GridScheduler>,
    parameters: Vec<Constant>,
    config: RuntimeConfig,
    profiler: TimeProfiler,
    cache: ProgramCache,
    compile_count: u64,
}

impl ExecutionPlan {
    /// Creates a plan over `graphs`, with every task placed on device 0.
    pub fn new(
        devices: DeviceRegistry,
        graphs: impl IntoIterator<Item = ImmutableTaskGraph>,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "an execution plan needs at least one device".into(),
            ));
        }
        let graphs: Vec<GraphEntry> = graphs.into_iter().map(GraphEntry::new).collect();
        if graphs.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "an execution plan needs at least one task graph".into(),
            ));
        }
        let config = RuntimeConfig::default();
        Ok(Self {
            devices,
            graphs,
            selected: None,
            scheduler: None,
            parameters: Vec::new(),
            profiler: TimeProfiler::new(config.profiler),
            cache: ProgramCache::new(config.program_cache_capacity),
            config,
            compile_count: 0,
        })
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn num_graphs(&self) -> usize {
        self.graphs.len()
    }

    pub fn graph(&self, index: usize) -> Option<&ImmutableTaskGraph> {
        self.graphs.get(index).map(|entry| &entry.graph)
    }

    /// Device currently assigned to each task of graph `index`.
    pub fn assignment(&self, index: usize) -> Option<&[DeviceIndex]> {
        self.graphs.get(index).map(|entry| entry.assignment.as_slice())
    }

    pub fn runtime(&self, index: usize) -> Option<&GraphRuntime> {
        self.graphs.get(index).map(|entry| &entry.runtime)
    }

    /// Program used by the last execution of graph `index`, if it is still current.
    pub fn compiled(&self, index: usize) -> Option<&CompiledGraph> {
        self.graphs.get(index)?.current.as_deref()
    }

    pub fn program(&self, index: usize) -> Option<&BytecodeProgram> {
        self.compiled(index).map(CompiledGraph::program)
    }

    /// Number of compilations performed by this plan.
    pub fn compile_count(&self) -> u64 {
        self.compile_count
    }

    pub fn program_cache(&self) -> &ProgramCache {
        &self.cache
    }

    /// Launch statistics of the first task named `task` in any graph.
    pub fn kernel_stats(&self, task: &str) -> Option<KernelStats> {
        self.graphs.iter().find_map(|entry| {
            let index = entry.graph.task_index(task)?;
            entry.runtime.kernel_stats(index).cloned()
        })
    }

    pub fn with_config(&mut self, config: RuntimeConfig) -> &mut Self {
        if config.compiler != self.config.compiler {
            self.cache.clear();
            for entry in &mut self.graphs {
                entry.current = None;
            }
        }
        self.cache.resize(config.program_cache_capacity);
        if config.profiler != self.profiler.mode() {
            self.profiler.set_mode(config.profiler);
        }
        self.config = config;
        self
    }

    /// Processes every object in windows of `bytes`; zero turns batching off. Only plans
    /// whose tasks all run on one device can be batched.
    pub fn with_batch(&mut self, bytes: u64) -> &mut Self {
        let config = self.config.clone().with_batch_bytes(bytes);
        self.with_config(config)
    }

    pub fn with_profiler(&mut self, mode: ProfilerMode) -> &mut Self {
        self.config.profiler = mode;
        self.profiler.set_mode(mode);
        self
    }

    pub fn without_profiler(&mut self) -> &mut Self {
        self.with_profiler(ProfilerMode::Disabled)
    }

    pub fn with_grid_scheduler(&mut self, scheduler: GridScheduler) -> &mut Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Drops geometry overrides; tasks run with their declared grids again.
    pub fn with_default_scheduler(&mut self) -> &mut Self {
        self.scheduler = None;
        self
    }

    /// Values bound to `Arg::param` slots on the next executions.
    pub fn with_parameters(&mut self, parameters: &[Constant]) -> &mut Self {
        self.parameters = parameters.to_vec();
        self
    }

    /// Restricts [`ExecutionPlan::execute`] to one graph.
    pub fn with_graph(&mut self, index: usize) -> Result<&mut Self> {
        self.entry(index)?;
        self.selected = Some(index);
        Ok(self)
    }

    pub fn with_all_graphs(&mut self) -> &mut Self {
        self.selected = None;
        self
    }

    /// Moves every task of every graph to `device`.
    pub fn with_device(&mut self, device: DeviceIndex) -> Result<&mut Self> {
        for graph in 0..self.graphs.len() {
            self.with_device_for_graph(graph, device)?;
        }
        Ok(self)
    }

    pub fn with_device_for_graph(&mut self, graph: usize, device: DeviceIndex) -> Result<&mut Self> {
        let tasks: Vec<usize> = (0..self.entry(graph)?.graph.tasks().len()).collect();
        self.reassign(graph, &tasks, device)?;
        Ok(self)
    }

    pub fn with_device_for_task(
        &mut self,
        graph: usize,
        task: &str,
        device: DeviceIndex,
    ) -> Result<&mut Self> {
        let entry = self.entry(graph)?;
        let index = entry.graph.task_index(task).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "graph '{}' has no task '{task}'",
                entry.graph.name()
            ))
        })?;
        self.reassign(graph, &[index], device)?;
        Ok(self)
    }

    /// Compiles every graph and installs every kernel without executing anything.
    pub fn with_warm_up(&mut self) -> Result<&mut Self> {
        for graph in 0..self.graphs.len() {
            self.compile(graph)?;
            let entry = &mut self.graphs[graph];
            for (task, descriptor) in entry.graph.tasks().iter().enumerate() {
                entry.runtime.kernel(
                    &self.devices,
                    entry.assignment[task],
                    task,
                    descriptor,
                    &mut self.profiler,
                )?;
            }
        }
        Ok(self)
    }

    /// Runs the selected graph, or every graph in order.
    pub fn execute(&mut self) -> Result<ExecutionResult<'_>> {
        let graphs: Vec<usize> = match self.selected {
            Some(graph) => vec![graph],
            None => (0..self.graphs.len()).collect(),
        };
        self.execute_graphs(graphs)
    }

    #[tracing::instrument(skip(self))]
    pub fn execute_graph(&mut self, index: usize) -> Result<ExecutionResult<'_>> {
        self.entry(index)?;
        self.execute_graphs(vec![index])
    }

    fn execute_graphs(&mut self, graphs: Vec<usize>) -> Result<ExecutionResult<'_>> {
        let start = Instant::now();
        self.profiler.clear();
        // Geometry of every selected graph is checked before any device work is issued.
        let grids = graphs
            .iter()
            .map(|graph| self.resolve_grids(*graph))
            .collect::<Result<Vec<_>>>()?;
        let mut counters = ExecutionCounters::default();
        for (graph, grids) in graphs.iter().zip(&grids) {
            counters.merge(&self.run(*graph, grids)?);
        }
        self.profiler.add_elapsed(ProfilerType::Total, start);
        Ok(ExecutionResult {
            profiler: self.profiler.result(),
            counters,
            graphs,
            plan: self,
        })
    }

    fn run(&mut self, index: usize, grids: &[WorkerGrid]) -> Result<ExecutionCounters> {
        let compiled = self.compile(index)?;
        let entry = &mut self.graphs[index];
        let inputs = ExecutionInputs {
            graph: &entry.graph,
            compiled: &*compiled,
            devices: &self.devices,
            grids,
            parameters: &self.parameters,
            config: &self.config,
        };
        let counters = Interpreter::new(inputs, &mut entry.runtime, &mut self.profiler).run()?;
        debug!(graph = entry.graph.name(), ?counters, "executed task graph");
        Ok(counters)
    }

    /// Effective grid of each task. Overrides must keep the declared dimensionality.
    fn resolve_grids(&self, index: usize) -> Result<Vec<WorkerGrid>> {
        let graph = &self.entry(index)?.graph;
        graph
            .tasks()
            .iter()
            .map(|task| {
                let Some(grid) = self
                    .scheduler
                    .as_ref()
                    .and_then(|scheduler| scheduler.grid(graph.name(), &task.name))
                else {
                    return Ok(task.grid);
                };
                if grid.dims() != task.dims() {
                    return Err(RuntimeError::ConfigurationMismatch {
                        task: format!("{}.{}", graph.name(), task.name),
                        expected: task.dims(),
                        found: grid.dims(),
                    });
                }
                grid.validate()?;
                Ok(*grid)
            })
            .collect()
    }

    fn compile(&mut self, index: usize) -> Result<Arc<CompiledGraph>> {
        let entry = self
            .graphs
            .get(index)
            .ok_or_else(|| missing_graph(index, self.graphs.len()))?;
        if let Some(current) = &entry.current {
            return Ok(Arc::clone(current));
        }
        let key = ProgramKey::new(entry.graph.id(), &entry.assignment)?;
        let compiled = match self.cache.get(&key) {
            Some(compiled) => compiled,
            None => {
                let start = Instant::now();
                let mut nodes = build_graph(&entry.graph, &entry.assignment)?;
                let mut compiler = GraphCompiler::new(self.config.compiler);
                let batch_bytes = self.config.compiler.batch_bytes;
                if batch_bytes > 0 {
                    compiler = compiler.with_batches(Batches::for_graph(&entry.graph, batch_bytes)?);
                }
                let compiled = compiler.compile(&mut nodes, entry.graph.tasks().len())?;
                self.profiler.add_elapsed(ProfilerType::Compile, start);
                self.compile_count += 1;
                info!(
                    graph = entry.graph.name(),
                    compilations = self.compile_count,
                    instructions = compiled.num_instructions(),
                    "compiled task graph"
                );
                if self.config.dump_program {
                    info!(
                        graph = entry.graph.name(),
                        "program:\n{}",
                        compiled.program().disassemble()
                    );
                }
                let compiled = Arc::new(compiled);
                self.cache.insert(key, Arc::clone(&compiled));
                compiled
            }
        };
        self.graphs[index].current = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    fn entry(&self, index: usize) -> Result<&GraphEntry> {
        self.graphs
            .get(index)
            .ok_or_else(|| missing_graph(index, self.graphs.len()))
    }

    /// Moves `tasks` of graph `graph` to `device`. Objects no longer used by any task left
    /// on the old device are read back if modified and released there.
    fn reassign(&mut self, graph: usize, tasks: &[usize], device: DeviceIndex) -> Result<()> {
        self.devices.get(device)?;
        self.entry(graph)?;
        let entry = &mut self.graphs[graph];
        for &task in tasks {
            let previous = entry.assignment[task];
            if previous == device {
                continue;
            }
            entry.assignment[task] = device;
            entry.runtime.remap_task(task);
            // Dropped before releasing anything so a failed read-back cannot leave the
            // old program current for the new assignment.
            entry.current = None;

            let still_used: HashSet<usize> = entry
                .graph
                .tasks()
                .iter()
                .zip(&entry.assignment)
                .filter(|(_, assigned)| **assigned == previous)
                .flat_map(|(other, _)| other.objects().map(|(object, _)| object))
                .collect();
            let released: Vec<usize> = entry.graph.tasks()[task]
                .objects()
                .map(|(object, _)| object)
                .filter(|object| !still_used.contains(object))
                .collect();
            for object in released {
                read_back(&self.devices, entry, object, previous)?;
                entry.runtime.detach(&self.devices, object, previous)?;
            }
            info!(
                graph = entry.graph.name(),
                task = %entry.graph.tasks()[task].name,
                from = %previous,
                to = %device,
                "reassigned task"
            );
        }
        Ok(())
    }

    /// Copies the newest device version of each object back to host memory. Only needed
    /// for objects transferred `UnderDemand`; other outputs are copied by the program.
    pub fn transfer_to_host(&mut self, objects: &[&DataObject]) -> Result<()> {
        for object in objects {
            let mut found = false;
            for entry in &mut self.graphs {
                let Some(index) = entry.graph.object_index(object) else {
                    continue;
                };
                found = true;
                let owner = entry
                    .runtime
                    .tracker()
                    .object(index)
                    .and_then(|global| global.owner());
                if let Some(owner) = owner {
                    read_back(&self.devices, entry, index, owner)?;
                }
            }
            if !found {
                return Err(RuntimeError::InvalidArgument(format!(
                    "object {:?} is not part of this plan",
                    object.id()
                )));
            }
        }
        Ok(())
    }

    /// Releases every device buffer held by the plan. The next execution allocates and
    /// transfers again.
    pub fn free_device_memory(&mut self) -> Result<&mut Self> {
        for entry in &mut self.graphs {
            entry.runtime.release_device_memory(&self.devices)?;
        }
        Ok(self)
    }

    /// Frees device memory, then resets every device, dropping installed kernels.
    pub fn reset_device(&mut self) -> Result<&mut Self> {
        self.free_device_memory()?;
        for (index, device) in self.devices.iter() {
            device
                .reset()
                .map_err(|err| RuntimeError::device("reset", None, index, err))?;
            for entry in &mut self.graphs {
                entry.runtime.forget_kernels_on(index);
            }
        }
        Ok(self)
    }

    pub fn clear_profiles(&mut self) -> &mut Self {
        self.profiler.clear();
        for entry in &mut self.graphs {
            entry.runtime.clear_kernel_stats();
        }
        self
    }

    /// Marks every device copy stale, e.g. after the host rewrote input objects that are
    /// only transferred on first execution.
    pub fn invalidate_objects(&mut self) -> &mut Self {
        for entry in &mut self.graphs {
            entry.runtime.tracker_mut().invalidate_all();
        }
        self
    }
}

fn missing_graph(index: usize, len: usize) -> RuntimeError {
    RuntimeError::InvalidArgument(format!("graph index {index} out of range ({len} graphs)"))
}

/// Reads `object` back from `device` if the device holds a newer version than the host.
fn read_back(
    devices: &DeviceRegistry,
    entry: &mut GraphEntry,
    object: usize,
    device: DeviceIndex,
) -> Result<()> {
    let Some(state) = entry.runtime.tracker().state(object, device) else {
        return Ok(());
    };
    if !state.is_modified() {
        return Ok(());
    }
    let data = &entry.graph.objects()[object];
    devices
        .get(device)?
        .stream_out_blocking(data, state, &[], 0, 0)
        .map_err(|err| RuntimeError::device("read_back", Some(object), device, err))?;
    entry.runtime.tracker_mut().mark_synced(object, device);
    debug!(object, %device, "read back modified object");
    Ok(())
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        for (index, device) in self.devices.iter() {
            if let Err(err) = device.sync() {
                warn!(device = %index, error = %err, "device sync failed during plan teardown");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("devices", &self.devices)
            .field(
                "graphs",
                &self
                    .graphs
                    .iter()
                    .map(|entry| entry.graph.name())
                    .collect::<Vec<_>>(),
            )
            .field("compile_count", &self.compile_count)
            .finish()
    }
}

/// Outcome of one execution. Borrows the plan so under-demand objects can still be
/// fetched from the devices.
pub struct ExecutionResult<'p> {
    plan: &'p mut ExecutionPlan,
    graphs: Vec<usize>,
    profiler: ProfilerResult,
    counters: ExecutionCounters,
}

impl std::fmt::Debug for ExecutionResult<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("graphs", &self.graphs)
            .field("counters", &self.counters)
            .field("profiler", &self.profiler)
            .finish_non_exhaustive()
    }
}

impl ExecutionResult<'_> {
    pub fn profiler_result(&self) -> &ProfilerResult {
        &self.profiler
    }

    pub fn counters(&self) -> &ExecutionCounters {
        &self.counters
    }

    /// Graphs run by this execution, in order.
    pub fn graphs(&self) -> &[usize] {
        &self.graphs
    }

    pub fn transfer_to_host(&mut self, objects: &[&DataObject]) -> Result<&mut Self> {
        self.plan.transfer_to_host(objects)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn plan_is_send() {
        assert_send::<ExecutionPlan>();
    }

    #[test]
    fn empty_plans_are_rejected() {
        let err = ExecutionPlan::new(DeviceRegistry::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
}
