pub mod device;
pub mod kernels;

use std::sync::Arc;

pub use device::{
    FaultInjector, NoopInterceptor, RefCpuDevice, RefCpuDeviceBuilder, RefCpuInterceptor,
    RefCpuStats, TransferKind, DEFAULT_CAPACITY_BYTES,
};
pub use kernels::{KernelFn, KernelFrame, KernelRegistry};

/// Register the reference device with the global device registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the device is registered.
/// The device is registered under both "ref-cpu" and "cpu" names.
pub fn register_ref_cpu_device() {
    let constructor = || Arc::new(RefCpuDevice::new()) as Arc<dyn taskvm_rs::Device>;

    taskvm_rs::device::register_device("ref-cpu", constructor);
    taskvm_rs::device::register_device("cpu", constructor);
}

// Auto-register on library load
#[cfg(any(target_os = "linux", target_os = "android"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_CPU_DEVICE: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_cpu_device();
    }
    register
};
