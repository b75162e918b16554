use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::Lazy;
use taskvm_rs::callstack::CallStack;
use taskvm_rs::device::{
    Device, EventHandle, Event, EventStatus, ExecutionConfig, InstalledKernel, MemoryInfo,
};
use taskvm_rs::memory::{Buffer, DeviceObjectState};
use taskvm_rs::task::{TaskArg, TaskDescriptor};
use taskvm_rs::{DataObject, DeviceError, DeviceResult};
use tracing::{debug, trace};

use crate::kernels::{FrameArg, KernelFn, KernelFrame, KernelRegistry};

/// Default heap size of a reference device.
pub const DEFAULT_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

const ALIGNMENT: u64 = 64;
const MAX_RETAINED_EVENTS: usize = 1 << 16;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Direction of a host/device copy, as seen by interceptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    HostToDevice,
    DeviceToHost,
}

/// Hook consulted before every transfer and launch. Returning an error makes the
/// operation fail without touching device memory.
pub trait RefCpuInterceptor: Send + Sync {
    fn before_transfer(&self, _kind: TransferKind, _object: &DataObject) -> Option<DeviceError> {
        None
    }

    fn before_launch(&self, _task: &TaskDescriptor) -> Option<DeviceError> {
        None
    }
}

#[derive(Default)]
pub struct NoopInterceptor;

impl RefCpuInterceptor for NoopInterceptor {}

/// Interceptor that fails a configurable number of upcoming operations.
#[derive(Debug, Default)]
pub struct FaultInjector {
    launches: AtomicUsize,
    transfers: AtomicUsize,
}

impl FaultInjector {
    pub fn fail_launches(&self, count: usize) {
        self.launches.store(count, Ordering::SeqCst);
    }

    pub fn fail_transfers(&self, count: usize) {
        self.transfers.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl RefCpuInterceptor for FaultInjector {
    fn before_transfer(&self, kind: TransferKind, _object: &DataObject) -> Option<DeviceError> {
        Self::take(&self.transfers)
            .then(|| DeviceError::execution(format!("injected {kind:?} transfer failure")))
    }

    fn before_launch(&self, task: &TaskDescriptor) -> Option<DeviceError> {
        Self::take(&self.launches)
            .then(|| DeviceError::execution(format!("injected failure launching '{}'", task.name)))
    }
}

/// Operation counters of one reference device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCpuStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub copies_in: u64,
    pub copies_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub launches: u64,
    pub barriers: u64,
    pub installs: u64,
}

struct Heap {
    buffers: HashMap<u64, Vec<u8>>,
    next_offset: u64,
    used: u64,
}

struct EventTable {
    next: u64,
    events: BTreeMap<u64, Event>,
}

struct Shared {
    name: String,
    base: u64,
    capacity: u64,
    auto_orders: bool,
    heap: Mutex<Heap>,
    events: Mutex<EventTable>,
    stats: Mutex<RefCpuStats>,
    kernels: Arc<KernelRegistry>,
    interceptor: Arc<dyn RefCpuInterceptor>,
}

impl Shared {
    fn check_waits(&self, wait: &[EventHandle]) -> DeviceResult<()> {
        let table = self.events.lock().expect("event table poisoned");
        for handle in wait {
            match table.events.get(&handle.0) {
                Some(event) if event.status == EventStatus::Complete => {}
                Some(event) => {
                    return Err(DeviceError::execution(format!(
                        "dependency {} did not complete ({:?})",
                        handle.0, event.status
                    )))
                }
                None => {
                    return Err(DeviceError::execution(format!(
                        "unknown event {} on {}",
                        handle.0, self.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn record(&self, submit_ns: u64, start_ns: u64) -> EventHandle {
        let mut table = self.events.lock().expect("event table poisoned");
        let handle = EventHandle(table.next);
        table.next += 1;
        table.events.insert(
            handle.0,
            Event {
                handle,
                status: EventStatus::Complete,
                submit_ns,
                start_ns,
                end_ns: now_ns(),
            },
        );
        while table.events.len() > MAX_RETAINED_EVENTS {
            table.events.pop_first();
        }
        handle
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, RefCpuStats> {
        self.stats.lock().expect("device stats poisoned")
    }

    fn buffer(state: &DeviceObjectState) -> DeviceResult<Buffer> {
        state
            .buffer()
            .ok_or_else(|| DeviceError::execution("object has no buffer on this device"))
    }

    fn copy_in(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        let submit = now_ns();
        self.check_waits(wait)?;
        if let Some(err) = self
            .interceptor
            .before_transfer(TransferKind::HostToDevice, object)
        {
            return Err(err);
        }
        let buffer = Self::buffer(state)?;
        let start = now_ns();
        let bytes = object
            .read_bytes(offset, len)
            .map_err(|err| DeviceError::execution(err.to_string()))?;
        {
            let mut heap = self.heap.lock().expect("device heap poisoned");
            let memory = heap
                .buffers
                .get_mut(&buffer.address)
                .ok_or_else(|| DeviceError::execution("buffer was released"))?;
            let start = device_offset(object, memory.len(), offset);
            let range = window(memory.len(), start, bytes.len())?;
            memory[range].copy_from_slice(&bytes);
        }
        let mut stats = self.stats();
        stats.copies_in += 1;
        stats.bytes_in += bytes.len() as u64;
        drop(stats);
        trace!(device = %self.name, address = buffer.address, bytes = bytes.len(), "host to device");
        Ok(self.record(submit, start))
    }

    fn copy_out(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        let submit = now_ns();
        self.check_waits(wait)?;
        if let Some(err) = self
            .interceptor
            .before_transfer(TransferKind::DeviceToHost, object)
        {
            return Err(err);
        }
        let buffer = Self::buffer(state)?;
        let start = now_ns();
        let bytes = {
            let heap = self.heap.lock().expect("device heap poisoned");
            let memory = heap
                .buffers
                .get(&buffer.address)
                .ok_or_else(|| DeviceError::execution("buffer was released"))?;
            let start = device_offset(object, memory.len(), offset);
            let len = if len == 0 {
                (memory.len() as u64).saturating_sub(start)
            } else {
                len
            };
            let range = window(memory.len(), start, len as usize)?;
            memory[range].to_vec()
        };
        object
            .write_bytes(offset, &bytes)
            .map_err(|err| DeviceError::execution(err.to_string()))?;
        let mut stats = self.stats();
        stats.copies_out += 1;
        stats.bytes_out += bytes.len() as u64;
        drop(stats);
        trace!(device = %self.name, address = buffer.address, bytes = bytes.len(), "device to host");
        Ok(self.record(submit, start))
    }
}

/// Device-side position of host byte `offset`. A buffer allocated for one batch is smaller
/// than its object and holds the window currently being processed.
fn device_offset(object: &DataObject, buffer_len: usize, offset: u64) -> u64 {
    let buffer_len = buffer_len as u64;
    if buffer_len > 0 && buffer_len < object.byte_len() {
        offset % buffer_len
    } else {
        offset
    }
}

fn window(total: usize, offset: u64, len: usize) -> DeviceResult<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| DeviceError::execution("transfer offset overflows"))?;
    match start.checked_add(len) {
        Some(end) if end <= total => Ok(start..end),
        _ => Err(DeviceError::execution(format!(
            "transfer of {len} bytes at offset {offset} exceeds buffer of {total} bytes"
        ))),
    }
}

/// Device backed by host memory. Every operation completes before it returns, so events
/// are always complete and carry real host timestamps.
#[derive(Clone)]
pub struct RefCpuDevice {
    shared: Arc<Shared>,
}

impl RefCpuDevice {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self::builder().capacity(capacity).build()
    }

    pub fn builder() -> RefCpuDeviceBuilder {
        RefCpuDeviceBuilder::default()
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.shared.kernels
    }

    /// Makes `kernel` available to tasks whose kernel name is `name`.
    pub fn register_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut KernelFrame<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.kernels.register(name, kernel);
    }

    pub fn stats(&self) -> RefCpuStats {
        *self.shared.stats()
    }

    pub fn reset_stats(&self) {
        *self.shared.stats() = RefCpuStats::default();
    }

    /// Bytes of the buffer bound at `address`, if any.
    pub fn read_buffer(&self, address: u64) -> Option<Vec<u8>> {
        self.shared
            .heap
            .lock()
            .expect("device heap poisoned")
            .buffers
            .get(&address)
            .cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.shared
            .heap
            .lock()
            .expect("device heap poisoned")
            .buffers
            .len()
    }
}

impl Default for RefCpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RefCpuDeviceBuilder {
    capacity: u64,
    auto_orders: bool,
    kernels: Option<Arc<KernelRegistry>>,
    interceptor: Arc<dyn RefCpuInterceptor>,
}

impl Default for RefCpuDeviceBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY_BYTES,
            auto_orders: true,
            kernels: None,
            interceptor: Arc::new(NoopInterceptor),
        }
    }
}

impl RefCpuDeviceBuilder {
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// When disabled the device reports that it needs explicit dependencies between
    /// consecutive commands.
    pub fn auto_orders(mut self, enabled: bool) -> Self {
        self.auto_orders = enabled;
        self
    }

    /// Shares one kernel table between several devices.
    pub fn kernels(mut self, kernels: Arc<KernelRegistry>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn interceptor<I: RefCpuInterceptor + 'static>(mut self, interceptor: Arc<I>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn build(self) -> RefCpuDevice {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let base = (id + 1) << 40;
        RefCpuDevice {
            shared: Arc::new(Shared {
                name: format!("ref-cpu:{id}"),
                base,
                capacity: self.capacity,
                auto_orders: self.auto_orders,
                heap: Mutex::new(Heap {
                    buffers: HashMap::new(),
                    next_offset: 0,
                    used: 0,
                }),
                events: Mutex::new(EventTable {
                    next: base,
                    events: BTreeMap::new(),
                }),
                stats: Mutex::new(RefCpuStats::default()),
                kernels: self
                    .kernels
                    .unwrap_or_else(|| Arc::new(KernelRegistry::with_builtins())),
                interceptor: self.interceptor,
            }),
        }
    }
}

impl Device for RefCpuDevice {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn ensure_allocated(
        &self,
        object: &DataObject,
        batch_size: u64,
        state: &mut DeviceObjectState,
    ) -> DeviceResult<()> {
        let size = match batch_size {
            0 => object.byte_len(),
            batch => batch.min(object.byte_len()),
        };
        if let Some(buffer) = state.buffer() {
            // Batched buffers must match the batch exactly so kernels see one window.
            let reusable = match batch_size {
                0 => buffer.size >= size,
                _ => buffer.size == size,
            };
            if reusable {
                return Ok(());
            }
            self.deallocate(state)?;
        }

        let mut heap = self.shared.heap.lock().expect("device heap poisoned");
        let available = self.shared.capacity.saturating_sub(heap.used);
        if size > available {
            return Err(DeviceError::out_of_memory(size, available));
        }
        let offset = heap.next_offset;
        heap.next_offset += size.max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        heap.used += size;
        let address = self.shared.base + offset;
        heap.buffers.insert(address, vec![0u8; size as usize]);
        drop(heap);

        state.bind(Buffer {
            offset,
            address,
            size,
        });
        self.shared.stats().allocations += 1;
        debug!(device = %self.shared.name, address, size, "allocated buffer");
        Ok(())
    }

    fn ensure_present(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.shared.copy_in(object, state, wait, offset, len)
    }

    fn stream_in(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.shared.copy_in(object, state, wait, offset, len)
    }

    fn stream_out(
        &self,
        object: &DataObject,
        state: &DeviceObjectState,
        wait: &[EventHandle],
        offset: u64,
        len: u64,
    ) -> DeviceResult<EventHandle> {
        self.shared.copy_out(object, state, wait, offset, len)
    }

    fn deallocate(&self, state: &mut DeviceObjectState) -> DeviceResult<()> {
        let Some(buffer) = state.unbind() else {
            return Ok(());
        };
        let mut heap = self.shared.heap.lock().expect("device heap poisoned");
        if heap.buffers.remove(&buffer.address).is_some() {
            heap.used = heap.used.saturating_sub(buffer.size);
            drop(heap);
            self.shared.stats().deallocations += 1;
        }
        Ok(())
    }

    fn install_code(&self, task: &TaskDescriptor) -> DeviceResult<Arc<dyn InstalledKernel>> {
        let body = self.shared.kernels.get(&task.kernel).ok_or_else(|| {
            DeviceError::unsupported(
                "install_code",
                format!("no kernel named '{}' on {}", task.kernel, self.shared.name),
            )
        })?;
        self.shared.stats().installs += 1;
        Ok(Arc::new(RefCpuKernel {
            shared: Arc::clone(&self.shared),
            task: task.clone(),
            body,
        }))
    }

    fn resolve_event(&self, handle: EventHandle) -> DeviceResult<Event> {
        self.shared
            .events
            .lock()
            .expect("event table poisoned")
            .events
            .get(&handle.0)
            .copied()
            .ok_or_else(|| DeviceError::execution(format!("unknown event {}", handle.0)))
    }

    fn wait_event(&self, handle: EventHandle) -> DeviceResult<()> {
        self.shared.check_waits(&[handle])
    }

    fn enqueue_barrier(&self, wait: &[EventHandle]) -> DeviceResult<EventHandle> {
        let submit = now_ns();
        self.shared.check_waits(wait)?;
        self.shared.stats().barriers += 1;
        Ok(self.shared.record(submit, now_ns()))
    }

    fn sync(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn memory_provider(&self) -> MemoryInfo {
        MemoryInfo {
            capacity: self.shared.capacity,
            used: self.shared.heap.lock().expect("device heap poisoned").used,
        }
    }

    fn reset(&self) -> DeviceResult<()> {
        let mut heap = self.shared.heap.lock().expect("device heap poisoned");
        heap.buffers.clear();
        heap.used = 0;
        heap.next_offset = 0;
        drop(heap);
        self.shared
            .events
            .lock()
            .expect("event table poisoned")
            .events
            .clear();
        debug!(device = %self.shared.name, "reset device");
        Ok(())
    }

    fn auto_orders(&self) -> bool {
        self.shared.auto_orders
    }
}

struct RefCpuKernel {
    shared: Arc<Shared>,
    task: TaskDescriptor,
    body: KernelFn,
}

impl InstalledKernel for RefCpuKernel {
    fn launch(
        &self,
        stack: &CallStack,
        config: &ExecutionConfig,
        wait: &[EventHandle],
    ) -> DeviceResult<EventHandle> {
        let submit = now_ns();
        self.shared.check_waits(wait)?;
        if let Some(err) = self.shared.interceptor.before_launch(&self.task) {
            return Err(err);
        }
        if stack.arg_count() != self.task.num_args() || stack.pushed_args() != self.task.num_args()
        {
            return Err(DeviceError::execution(format!(
                "frame of '{}' holds {} of {} arguments",
                self.task.name,
                stack.pushed_args(),
                self.task.num_args()
            )));
        }

        let mut args = Vec::with_capacity(self.task.num_args());
        {
            let heap = self.shared.heap.lock().expect("device heap poisoned");
            for (slot, arg) in stack.args().iter().zip(&self.task.args) {
                args.push(match arg {
                    TaskArg::Object { .. } => {
                        let memory = heap.buffers.get(slot).ok_or_else(|| {
                            DeviceError::execution(format!(
                                "'{}' references unmapped address {slot:#x}",
                                self.task.name
                            ))
                        })?;
                        FrameArg::Buffer(memory.clone())
                    }
                    TaskArg::Constant(_) | TaskArg::Parameter(_) => FrameArg::Scalar(*slot),
                });
            }
        }

        let start = now_ns();
        let mut frame = KernelFrame::new(&self.task, &config.grid, args);
        (self.body)(&mut frame).map_err(|err| {
            DeviceError::execution(format!("kernel '{}' failed: {err:#}", self.task.kernel))
        })?;

        let mut heap = self.shared.heap.lock().expect("device heap poisoned");
        for ((slot, arg), value) in stack
            .args()
            .iter()
            .zip(&self.task.args)
            .zip(frame.into_args())
        {
            if let (TaskArg::Object { access, .. }, FrameArg::Buffer(bytes)) = (arg, value) {
                if access.writes() {
                    match heap.buffers.get_mut(slot) {
                        Some(memory) if memory.len() == bytes.len() => {
                            memory.copy_from_slice(&bytes)
                        }
                        _ => {
                            return Err(DeviceError::execution(format!(
                                "buffer at {slot:#x} changed during '{}'",
                                self.task.name
                            )))
                        }
                    }
                }
            }
        }
        drop(heap);
        self.shared.stats().launches += 1;
        Ok(self.shared.record(submit, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskvm_rs::WorkerGrid;

    #[test]
    fn allocation_respects_capacity() {
        let device = RefCpuDevice::with_capacity(64);
        let small = DataObject::zeros_f32(8);
        let large = DataObject::zeros_f32(16);
        let mut state = DeviceObjectState::default();
        device.ensure_allocated(&small, 0, &mut state).unwrap();
        assert_eq!(device.memory_provider().used, 32);

        let mut other = DeviceObjectState::default();
        let err = device.ensure_allocated(&large, 0, &mut other).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::OutOfMemory {
                requested: 64,
                available: 32
            }
        ));

        device.deallocate(&mut state).unwrap();
        assert_eq!(device.memory_provider().used, 0);
        device.ensure_allocated(&large, 0, &mut other).unwrap();
    }

    #[test]
    fn transfers_round_trip_through_device_memory() {
        let device = RefCpuDevice::new();
        let source = DataObject::from_f32(&[1.0, 2.0, 3.0]);
        let target = DataObject::zeros_f32(3);
        let mut state = DeviceObjectState::default();
        device.ensure_allocated(&source, 0, &mut state).unwrap();
        let event = device.ensure_present(&source, &state, &[], 0, 0).unwrap();
        device.stream_out_blocking(&target, &state, &[event], 0, 0).unwrap();
        assert_eq!(target.to_f32_vec(), vec![1.0, 2.0, 3.0]);

        let stats = device.stats();
        assert_eq!((stats.copies_in, stats.copies_out), (1, 1));
        assert_eq!(stats.bytes_in, 12);
    }

    #[test]
    fn unknown_wait_events_are_rejected() {
        let device = RefCpuDevice::new();
        assert!(device.enqueue_barrier(&[EventHandle(7)]).is_err());
        let event = device.enqueue_barrier(&[]).unwrap();
        let resolved = device.resolve_event(event).unwrap();
        assert_eq!(resolved.status, EventStatus::Complete);
        assert!(resolved.end_ns >= resolved.start_ns);
    }

    #[test]
    fn launch_writes_back_only_written_arguments() {
        let device = RefCpuDevice::new();
        let a = DataObject::from_f32(&[1.0; 4]);
        let b = DataObject::from_f32(&[2.0; 4]);
        let c = DataObject::zeros_f32(4);
        let mut states = Vec::new();
        for object in [&a, &b, &c] {
            let mut state = DeviceObjectState::default();
            device.ensure_allocated(object, 0, &mut state).unwrap();
            device.ensure_present(object, &state, &[], 0, 0).unwrap();
            states.push(state);
        }
        let task = TaskDescriptor {
            name: "t0".into(),
            kernel: "vector_add".into(),
            args: vec![
                TaskArg::Object {
                    object: 0,
                    access: taskvm_rs::Access::Read,
                },
                TaskArg::Object {
                    object: 1,
                    access: taskvm_rs::Access::Read,
                },
                TaskArg::Object {
                    object: 2,
                    access: taskvm_rs::Access::Write,
                },
            ],
            grid: WorkerGrid::d1(4),
        };
        let kernel = device.install_code(&task).unwrap();
        let mut stack = CallStack::new(3, taskvm_rs::DeviceIndex(0));
        for state in &states {
            stack.push_address(state.buffer().unwrap().address);
        }
        let event = kernel
            .launch(&stack, &ExecutionConfig::new(task.grid), &[])
            .unwrap();
        device.stream_out_blocking(&c, &states[2], &[event], 0, 0).unwrap();
        assert_eq!(c.to_f32_vec(), vec![3.0; 4]);
    }

    #[test]
    fn batch_buffers_hold_one_window_at_a_time() {
        let device = RefCpuDevice::new();
        let source = DataObject::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let target = DataObject::zeros_f32(6);
        let mut state = DeviceObjectState::default();
        device.ensure_allocated(&source, 8, &mut state).unwrap();
        assert_eq!(state.buffer().map(|buffer| buffer.size), Some(8));

        for offset in [0, 8, 16] {
            device.stream_in(&source, &state, &[], offset, 8).unwrap();
            device
                .stream_out_blocking(&target, &state, &[], offset, 8)
                .unwrap();
        }
        assert_eq!(target.to_f32_vec(), source.to_f32_vec());
        assert_eq!(device.stats().bytes_in, 24);
    }

    #[test]
    fn injected_faults_fail_once() {
        let faults = Arc::new(FaultInjector::default());
        let device = RefCpuDevice::builder().interceptor(Arc::clone(&faults)).build();
        let object = DataObject::zeros_f32(2);
        let mut state = DeviceObjectState::default();
        device.ensure_allocated(&object, 0, &mut state).unwrap();
        faults.fail_transfers(1);
        assert!(device.ensure_present(&object, &state, &[], 0, 0).is_err());
        assert!(device.ensure_present(&object, &state, &[], 0, 0).is_ok());
    }

    #[test]
    fn missing_kernels_are_unsupported() {
        let device = RefCpuDevice::new();
        let task = TaskDescriptor {
            name: "t0".into(),
            kernel: "does_not_exist".into(),
            args: Vec::new(),
            grid: WorkerGrid::d1(1),
        };
        assert!(matches!(
            device.install_code(&task),
            Err(DeviceError::Unsupported { .. })
        ));
    }
}
