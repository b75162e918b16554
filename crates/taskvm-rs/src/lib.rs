pub mod callstack;
pub mod compiler;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod grid;
pub mod memory;
pub mod object;
pub mod plan;
pub mod profiler;
pub mod task;
pub mod vm;

pub use config::{CompilerConfig, ReadbackBlocking, RuntimeConfig};
pub use device::{Device, DeviceIndex, DeviceRegistry, InstalledKernel};
pub use error::{DeviceError, DeviceResult, Result, RuntimeError};
pub use grid::{GridScheduler, WorkerGrid};
pub use object::{Constant, DataObject};
pub use plan::{ExecutionPlan, ExecutionResult};
pub use profiler::{ProfilerMode, ProfilerResult};
pub use task::{Access, Arg, DataTransferMode, ImmutableTaskGraph, TaskGraph};
