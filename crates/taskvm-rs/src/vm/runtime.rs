use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::events::EventLists;
use crate::callstack::{CallStack, KernelStats};
use crate::device::{DeviceIndex, DeviceRegistry, InstalledKernel};
use crate::error::{Result, RuntimeError};
use crate::memory::ObjectStateTracker;
use crate::profiler::{ProfilerType, TimeProfiler};
use crate::task::{ImmutableTaskGraph, TaskDescriptor};

/// State that outlives a single invocation of one compiled graph: object residency, call
/// stacks and installed kernels.
#[derive(Default)]
pub struct GraphRuntime {
    pub(crate) tracker: ObjectStateTracker,
    pub(crate) stacks: Vec<Option<CallStack>>,
    pub(crate) kernels: HashMap<(usize, DeviceIndex), Arc<dyn InstalledKernel>>,
    pub(crate) lists: EventLists,
}

impl GraphRuntime {
    pub fn new(graph: &ImmutableTaskGraph) -> Self {
        Self {
            tracker: ObjectStateTracker::new(graph.objects().len()),
            stacks: vec![None; graph.tasks().len()],
            kernels: HashMap::new(),
            lists: EventLists::default(),
        }
    }

    pub fn tracker(&self) -> &ObjectStateTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ObjectStateTracker {
        &mut self.tracker
    }

    pub fn stack(&self, task: usize) -> Option<&CallStack> {
        self.stacks.get(task)?.as_ref()
    }

    pub fn kernel_stats(&self, task: usize) -> Option<&KernelStats> {
        self.stack(task).map(CallStack::stats)
    }

    /// Forces every frame to be rebuilt on its next launch.
    pub fn reset_stacks(&mut self) {
        for stack in self.stacks.iter_mut().flatten() {
            stack.reset();
        }
    }

    pub fn reset_stacks_on(&mut self, device: DeviceIndex) {
        for stack in self.stacks.iter_mut().flatten() {
            if stack.device() == device {
                stack.reset();
            }
        }
    }

    /// Invalidates the frame of a task moved to another device. Kernel statistics survive
    /// the move.
    pub fn remap_task(&mut self, task: usize) {
        if let Some(Some(stack)) = self.stacks.get_mut(task) {
            stack.reset();
        }
    }

    /// Returns the kernel of `task` installed on `device`, installing it on first use.
    pub(crate) fn kernel(
        &mut self,
        devices: &DeviceRegistry,
        device: DeviceIndex,
        task_index: usize,
        task: &TaskDescriptor,
        profiler: &mut TimeProfiler,
    ) -> Result<Arc<dyn InstalledKernel>> {
        if let Some(kernel) = self.kernels.get(&(task_index, device)) {
            return Ok(Arc::clone(kernel));
        }
        let start = Instant::now();
        let kernel = devices
            .get(device)?
            .install_code(task)
            .map_err(|err| RuntimeError::device("install_code", None, device, err))?;
        profiler.add_elapsed(ProfilerType::CodeInstall, start);
        debug!(task = %task.name, kernel = %task.kernel, %device, "installed kernel");
        self.kernels.insert((task_index, device), Arc::clone(&kernel));
        Ok(kernel)
    }

    pub fn clear_kernel_stats(&mut self) {
        for stack in self.stacks.iter_mut().flatten() {
            stack.stats_mut().clear();
        }
    }

    pub fn forget_kernels_on(&mut self, device: DeviceIndex) {
        self.kernels.retain(|(_, installed), _| *installed != device);
    }

    /// Releases the buffer of `object` on `device` and removes its record.
    pub fn detach(&mut self, devices: &DeviceRegistry, object: usize, device: DeviceIndex) -> Result<()> {
        if let Some(mut state) = self.tracker.detach(object, device) {
            devices
                .get(device)?
                .deallocate(&mut state)
                .map_err(|err| RuntimeError::device("deallocate", Some(object), device, err))?;
            debug!(object, %device, "detached object from device");
        }
        Ok(())
    }

    /// Releases every buffer held by this graph and forces frames to be rebuilt.
    pub fn release_device_memory(&mut self, devices: &DeviceRegistry) -> Result<()> {
        for device in self.tracker.devices() {
            for object in self.tracker.objects_on(device) {
                self.detach(devices, object, device)?;
            }
        }
        self.reset_stacks();
        Ok(())
    }
}
