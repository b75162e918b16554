use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use taskvm_rs::device::{Event, EventHandle, MemoryInfo};
use taskvm_rs::memory::DeviceObjectState;
use taskvm_rs::task::TaskDescriptor;
use taskvm_rs::{
    Arg, DataObject, DataTransferMode, Device, DeviceError, DeviceRegistry, DeviceResult,
    ExecutionPlan, InstalledKernel, TaskGraph,
};
use taskvm_rs_backend_ref_cpu::{register_ref_cpu_device, RefCpuDevice};

#[derive(Default)]
struct Counts {
    allocations: AtomicU64,
    copies_in: AtomicU64,
    streams_in: AtomicU64,
    copies_out: AtomicU64,
    installs: AtomicU64,
    syncs: AtomicU64,
}

impl Counts {
    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

/// Forwards to a reference device and counts every call the runtime makes.
struct CountingDevice {
    inner: RefCpuDevice,
    counts: Arc<Counts>,
}

impl Device for CountingDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ensure_allocated(
        &self,
        object: &DataObject,
        batch_size: u64,
        state: &mut DeviceObjectState,
    ) -> DeviceResult<()> {
        self.counts.allocations.fetch_add(1, Ordering::SeqCst);
        self.inner.ensure_allocated(object, batch_size, state)
    }

    fn ensure_present(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.counts.copies_in.fetch_add(1, Ordering::SeqCst);
        self.inner.ensure_present(object, state, wait, offset, len)
    }

    fn stream_in(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.counts.streams_in.fetch_add(1, Ordering::SeqCst);
        self.inner.stream_in(object, state, wait, offset, len)
    }

    fn stream_out(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.counts.copies_out.fetch_add(1, Ordering::SeqCst);
        self.inner.stream_out(object, state, wait, offset, len)
    }

    fn deallocate(&self, state: &mut DeviceObjectState) -> DeviceResult<()> {
        self.inner.deallocate(state)
    }

    fn install_code(&self, task: &TaskDescriptor) -> DeviceResult<Arc<dyn InstalledKernel>> {
        self.counts.installs.fetch_add(1, Ordering::SeqCst);
        self.inner.install_code(task)
    }

    fn resolve_event(&self, handle: EventHandle) -> DeviceResult<Event> {
        self.inner.resolve_event(handle)
    }

    fn wait_event(&self, handle: EventHandle) -> DeviceResult<()> {
        self.inner.wait_event(handle)
    }

    fn enqueue_barrier(&self, wait: &[EventHandle]) -> DeviceResult<EventHandle> {
        self.inner.enqueue_barrier(wait)
    }

    fn sync(&self) -> DeviceResult<()> {
        self.counts.syncs.fetch_add(1, Ordering::SeqCst);
        self.inner.sync()
    }

    fn memory_provider(&self) -> MemoryInfo {
        self.inner.memory_provider()
    }

    fn reset(&self) -> DeviceResult<()> {
        self.inner.reset()
    }
}

fn counting_plan(
    mode: DataTransferMode,
) -> Result<(ExecutionPlan, Arc<Counts>, DataObject, DataObject)> {
    let counts = Arc::new(Counts::default());
    let device = CountingDevice {
        inner: RefCpuDevice::new(),
        counts: Arc::clone(&counts),
    };
    let a = DataObject::from_f32(&[1.0; 16]);
    let b = DataObject::from_f32(&[2.0; 16]);
    let c = DataObject::zeros_f32(16);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(mode, &[&a, &b])
        .task(
            "t0",
            "vector_add",
            vec![Arg::read(&a), Arg::read(&b), Arg::write(&c)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[&c]);
    let plan = ExecutionPlan::new(
        DeviceRegistry::new().with_device(Arc::new(device)),
        [builder.snapshot()?],
    )?;
    Ok((plan, counts, a, c))
}

#[test]
fn first_execution_inputs_cross_the_boundary_once() -> Result<()> {
    let (mut plan, counts, _, c) = counting_plan(DataTransferMode::FirstExecution)?;
    for _ in 0..5 {
        plan.execute()?;
    }
    assert_eq!(Counts::get(&counts.copies_in), 2);
    assert_eq!(Counts::get(&counts.streams_in), 0);
    assert_eq!(Counts::get(&counts.copies_out), 5);
    assert_eq!(Counts::get(&counts.allocations), 15);
    assert_eq!(Counts::get(&counts.installs), 1);
    assert_eq!(c.to_f32_vec(), vec![3.0; 16]);
    Ok(())
}

#[test]
fn every_execution_inputs_cross_the_boundary_each_time() -> Result<()> {
    let (mut plan, counts, a, c) = counting_plan(DataTransferMode::EveryExecution)?;
    for round in 0..5 {
        a.copy_from_f32(&[round as f32; 16])?;
        plan.execute()?;
        assert_eq!(c.to_f32_vec(), vec![round as f32 + 2.0; 16]);
    }
    assert_eq!(Counts::get(&counts.streams_in), 10);
    assert_eq!(Counts::get(&counts.copies_in), 0);
    Ok(())
}

#[test]
fn dropping_a_plan_syncs_its_devices() -> Result<()> {
    let (mut plan, counts, _, _) = counting_plan(DataTransferMode::FirstExecution)?;
    plan.execute()?;
    drop(plan);
    assert_eq!(Counts::get(&counts.syncs), 1);
    Ok(())
}

#[test]
fn devices_can_be_created_by_name() -> Result<()> {
    register_ref_cpu_device();
    assert!(taskvm_rs::device::list_devices().contains(&"ref-cpu".to_string()));
    let devices = DeviceRegistry::from_names(&["ref-cpu", "ref-cpu"])?;
    assert_eq!(devices.len(), 2);
    assert!(DeviceRegistry::from_names(&["no-such-device"]).is_err());

    let device = taskvm_rs::device::create_device("ref-cpu")
        .ok_or_else(|| DeviceError::execution("ref-cpu is not registered"))?;
    assert!(device.name().starts_with("ref-cpu:"));
    Ok(())
}
