//! Boundary contracts between the runtime and device backends.
//!
//! The runtime never talks to a driver directly. Everything it needs from an accelerator
//! goes through [`Device`] (memory, transfers, events, code installation) and through the
//! [`InstalledKernel`] handles that `Device::install_code` returns.

pub mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::callstack::CallStack;
use crate::error::DeviceResult;
use crate::grid::WorkerGrid;
use crate::memory::DeviceObjectState;
use crate::object::DataObject;
use crate::task::TaskDescriptor;

pub use registry::{create_device, list_devices, register_device, DeviceRegistry};

/// Slot of a device in a [`DeviceRegistry`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceIndex(pub u32);

impl DeviceIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to an asynchronous device operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

/// A resolved event. Timestamps are nanoseconds on the device clock and are only
/// meaningful when profiling is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub handle: EventHandle,
    pub status: EventStatus,
    pub submit_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl Event {
    pub fn execution_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    pub fn queued_ns(&self) -> u64 {
        self.start_ns.saturating_sub(self.submit_ns)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub capacity: u64,
    pub used: u64,
}

impl MemoryInfo {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Launch parameters resolved for one LAUNCH instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub grid: WorkerGrid,
}

impl ExecutionConfig {
    pub fn new(grid: WorkerGrid) -> Self {
        Self { grid }
    }
}

/// A kernel ready to run on one device.
pub trait InstalledKernel: Send + Sync {
    /// Enqueues the kernel once `wait` has completed and returns its event.
    fn launch(
        &self,
        stack: &CallStack,
        config: &ExecutionConfig,
        wait: &[EventHandle],
    ) -> DeviceResult<EventHandle>;
}

/// Device contract consumed by the interpreter.
///
/// Transfer methods receive the object's current [`DeviceObjectState`] only to locate the
/// bound buffer; flag transitions are owned by the runtime. `offset` and `len` select a
/// byte window of the object, `len == 0` meaning "the whole object". A buffer allocated
/// with a batch size smaller than its object holds one batch, so host offset `offset`
/// lands at `offset % batch_size` on the device.
pub trait Device: Send + Sync {
    /// Human-readable identifier (e.g. `"ref-cpu:0"`).
    fn name(&self) -> &str;

    /// Binds a buffer to `state` unless one of sufficient size is already bound.
    /// A non-zero `batch_size` asks for a buffer of exactly `min(batch_size, object size)`
    /// bytes.
    fn ensure_allocated(
        &self,
        object: &DataObject,
        batch_size: u64,
        state: &mut DeviceObjectState,
    ) -> DeviceResult<()>;

    /// Copies host data into the bound buffer.
    fn ensure_present(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle>;

    /// Copies one window of host data into the bound buffer. The interpreter may call this
    /// several times per object to stream large buffers in chunks.
    fn stream_in(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle>;

    /// Enqueues a device-to-host copy without waiting for it.
    fn stream_out(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle>;

    /// Device-to-host copy that returns only after the data reached the host.
    fn stream_out_blocking(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        let event = self.stream_out(object, state, wait, offset, len)?;
        self.wait_event(event)?;
        Ok(event)
    }

    /// Releases the buffer bound to `state`, if any.
    fn deallocate(&self, state: &mut DeviceObjectState) -> DeviceResult<()>;

    fn install_code(&self, task: &TaskDescriptor) -> DeviceResult<Arc<dyn InstalledKernel>>;

    fn resolve_event(&self, handle: EventHandle) -> DeviceResult<Event>;

    /// Blocks the calling thread until `handle` has completed.
    fn wait_event(&self, handle: EventHandle) -> DeviceResult<()>;

    /// Enqueues a marker that completes once every event in `wait` has completed.
    fn enqueue_barrier(&self, wait: &[EventHandle]) -> DeviceResult<EventHandle>;

    /// Blocks until all previously enqueued work has completed.
    fn sync(&self) -> DeviceResult<()>;

    fn memory_provider(&self) -> MemoryInfo;

    /// Drops every allocation, installed kernel and pending event.
    fn reset(&self) -> DeviceResult<()>;

    /// Whether commands execute in submission order without explicit dependencies.
    fn auto_orders(&self) -> bool {
        true
    }
}
