//! Mutable task-graph builder and its immutable snapshots.
//!
//! A [`TaskGraph`] records host-to-device transfers, kernel invocations and device-to-host
//! transfers in declaration order. [`TaskGraph::snapshot`] freezes the description into an
//! [`ImmutableTaskGraph`]; later edits to the builder never reach an existing snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::grid::WorkerGrid;
use crate::object::{Constant, DataObject};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// When an object moves between host and device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTransferMode {
    /// Copied to the device on the first execution only.
    FirstExecution,
    /// Copied on every execution.
    EveryExecution,
    /// Never copied implicitly; the host fetches results on request.
    UnderDemand,
}

/// How a kernel touches one argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    None,
    Read,
    /// Write-only: the kernel never reads the incoming contents.
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Task argument as supplied by the user.
#[derive(Clone, Debug)]
pub enum Arg {
    Object(DataObject, Access),
    Constant(Constant),
    /// Call parameter slot, resolved at execution time.
    Parameter(usize),
}

impl Arg {
    pub fn read(object: &DataObject) -> Self {
        Arg::Object(object.clone(), Access::Read)
    }

    pub fn write(object: &DataObject) -> Self {
        Arg::Object(object.clone(), Access::Write)
    }

    pub fn read_write(object: &DataObject) -> Self {
        Arg::Object(object.clone(), Access::ReadWrite)
    }

    pub fn scalar(value: Constant) -> Self {
        Arg::Constant(value)
    }

    pub fn param(index: usize) -> Self {
        Arg::Parameter(index)
    }
}

/// Task argument after interning, indexing into the graph's tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskArg {
    Object { object: usize, access: Access },
    Constant(usize),
    Parameter(usize),
}

/// Everything a device needs to know to install a task's kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub kernel: String,
    pub args: Vec<TaskArg>,
    pub grid: WorkerGrid,
}

impl TaskDescriptor {
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Declared dimensionality of the task's default geometry.
    pub fn dims(&self) -> usize {
        self.grid.dims()
    }

    pub fn objects(&self) -> impl Iterator<Item = (usize, Access)> + '_ {
        self.args.iter().filter_map(|arg| match *arg {
            TaskArg::Object { object, access } => Some((object, access)),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTransfer {
    pub object: usize,
    pub mode: DataTransferMode,
    pub blocking: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    name: String,
    objects: Vec<DataObject>,
    constants: Vec<Constant>,
    num_parameters: usize,
    inputs: Vec<(usize, DataTransferMode)>,
    tasks: Vec<TaskDescriptor>,
    outputs: Vec<HostTransfer>,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transfer_to_device(
        &mut self,
        mode: DataTransferMode,
        objects: &[&DataObject],
    ) -> &mut Self {
        for object in objects {
            let index = self.intern(object);
            match self.inputs.iter_mut().find(|(existing, _)| *existing == index) {
                Some(entry) => entry.1 = mode,
                None => self.inputs.push((index, mode)),
            }
        }
        self
    }

    /// Adds a task whose default geometry is one thread per element of its first object
    /// argument.
    pub fn task(&mut self, name: impl Into<String>, kernel: impl Into<String>, args: Vec<Arg>) -> &mut Self {
        let default = args
            .iter()
            .find_map(|arg| match arg {
                Arg::Object(object, _) => Some(object.len().max(1) as u64),
                _ => None,
            })
            .unwrap_or(1);
        self.task_with_grid(name, kernel, args, WorkerGrid::d1(default))
    }

    pub fn task_with_grid(
        &mut self,
        name: impl Into<String>,
        kernel: impl Into<String>,
        args: Vec<Arg>,
        grid: WorkerGrid,
    ) -> &mut Self {
        let args = args
            .into_iter()
            .map(|arg| match arg {
                Arg::Object(object, access) => TaskArg::Object {
                    object: self.intern(&object),
                    access,
                },
                Arg::Constant(value) => {
                    self.constants.push(value);
                    TaskArg::Constant(self.constants.len() - 1)
                }
                Arg::Parameter(index) => {
                    self.num_parameters = self.num_parameters.max(index + 1);
                    TaskArg::Parameter(index)
                }
            })
            .collect();
        self.tasks.push(TaskDescriptor {
            name: name.into(),
            kernel: kernel.into(),
            args,
            grid,
        });
        self
    }

    pub fn transfer_to_host(&mut self, mode: DataTransferMode, objects: &[&DataObject]) -> &mut Self {
        for object in objects {
            let object = self.intern(object);
            self.outputs.push(HostTransfer {
                object,
                mode,
                blocking: false,
            });
        }
        self
    }

    /// Host transfer that always waits for the data, regardless of the compiler's
    /// read-back policy.
    pub fn transfer_to_host_blocking(&mut self, objects: &[&DataObject]) -> &mut Self {
        for object in objects {
            let object = self.intern(object);
            self.outputs.push(HostTransfer {
                object,
                mode: DataTransferMode::EveryExecution,
                blocking: true,
            });
        }
        self
    }

    pub fn snapshot(&self) -> Result<ImmutableTaskGraph> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(RuntimeError::InvalidArgument(format!(
                    "task graph '{}' declares task '{}' twice",
                    self.name, task.name
                )));
            }
            task.grid.validate()?;
        }
        if self.tasks.is_empty() {
            return Err(RuntimeError::InvalidArgument(format!(
                "task graph '{}' has no tasks",
                self.name
            )));
        }
        Ok(ImmutableTaskGraph {
            inner: Arc::new(GraphData {
                id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name.clone(),
                objects: self.objects.clone(),
                constants: self.constants.clone(),
                num_parameters: self.num_parameters,
                inputs: self.inputs.clone(),
                tasks: self.tasks.clone(),
                outputs: self.outputs.clone(),
            }),
        })
    }

    fn intern(&mut self, object: &DataObject) -> usize {
        match self.objects.iter().position(|known| known.ptr_eq(object)) {
            Some(index) => index,
            None => {
                self.objects.push(object.clone());
                self.objects.len() - 1
            }
        }
    }
}

#[derive(Debug)]
struct GraphData {
    id: u64,
    name: String,
    objects: Vec<DataObject>,
    constants: Vec<Constant>,
    num_parameters: usize,
    inputs: Vec<(usize, DataTransferMode)>,
    tasks: Vec<TaskDescriptor>,
    outputs: Vec<HostTransfer>,
}

/// Frozen task graph. Cheap to clone; clones share the same identity.
#[derive(Clone, Debug)]
pub struct ImmutableTaskGraph {
    inner: Arc<GraphData>,
}

impl ImmutableTaskGraph {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn objects(&self) -> &[DataObject] {
        &self.inner.objects
    }

    pub fn object_index(&self, object: &DataObject) -> Option<usize> {
        self.inner.objects.iter().position(|known| known.ptr_eq(object))
    }

    pub fn constants(&self) -> &[Constant] {
        &self.inner.constants
    }

    pub fn num_parameters(&self) -> usize {
        self.inner.num_parameters
    }

    pub fn inputs(&self) -> &[(usize, DataTransferMode)] {
        &self.inner.inputs
    }

    pub fn input_mode(&self, object: usize) -> Option<DataTransferMode> {
        self.inner
            .inputs
            .iter()
            .find(|(index, _)| *index == object)
            .map(|(_, mode)| *mode)
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.inner.tasks
    }

    pub fn task_index(&self, name: &str) -> Option<usize> {
        self.inner.tasks.iter().position(|task| task.name == name)
    }

    pub fn outputs(&self) -> &[HostTransfer] {
        &self.inner.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_isolated_from_later_edits() {
        let a = DataObject::from_f32(&[1.0; 4]);
        let b = DataObject::zeros_f32(4);
        let mut graph = TaskGraph::new("s0");
        graph
            .transfer_to_device(DataTransferMode::EveryExecution, &[&a])
            .task("t0", "copy", vec![Arg::read(&a), Arg::write(&b)]);
        let snapshot = graph.snapshot().unwrap();

        graph.transfer_to_host(DataTransferMode::EveryExecution, &[&b]);
        graph.task("t1", "copy", vec![Arg::read(&b), Arg::write(&a)]);

        assert_eq!(snapshot.tasks().len(), 1);
        assert!(snapshot.outputs().is_empty());
        assert_eq!(graph.snapshot().unwrap().tasks().len(), 2);
    }

    #[test]
    fn objects_are_interned_by_identity() {
        let a = DataObject::from_f32(&[1.0; 4]);
        let twin = DataObject::from_f32(&[1.0; 4]);
        let mut graph = TaskGraph::new("s0");
        graph.task(
            "t0",
            "k",
            vec![Arg::read(&a), Arg::read(&a.clone()), Arg::write(&twin)],
        );
        let snapshot = graph.snapshot().unwrap();
        assert_eq!(snapshot.objects().len(), 2);
        assert_eq!(snapshot.tasks()[0].grid, WorkerGrid::d1(4));
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let a = DataObject::zeros_f32(2);
        let mut graph = TaskGraph::new("s0");
        graph.task("t0", "k", vec![Arg::read_write(&a)]);
        graph.task("t0", "k", vec![Arg::read_write(&a)]);
        assert!(graph.snapshot().is_err());
    }
}
