use std::sync::Arc;

use anyhow::Result;
use taskvm_rs::{
    Arg, Constant, DataObject, DataTransferMode, DeviceRegistry, ExecutionPlan, ProfilerMode,
    ReadbackBlocking, RuntimeConfig, TaskGraph,
};
use taskvm_rs_backend_ref_cpu::RefCpuDevice;

const N: usize = 1024;

fn saxpy_plan(device: &RefCpuDevice, x: &DataObject, y: &DataObject) -> Result<ExecutionPlan> {
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::EveryExecution, &[x, y])
        .task(
            "t0",
            "saxpy",
            vec![Arg::scalar(Constant::F32(2.0)), Arg::read(x), Arg::read_write(y)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[y]);
    let devices = DeviceRegistry::new().with_device(Arc::new(device.clone()));
    Ok(ExecutionPlan::new(devices, [builder.snapshot()?])?)
}

#[test]
fn disabled_profiler_reports_zeros() -> Result<()> {
    let device = RefCpuDevice::new();
    let x = DataObject::from_f32(&[1.0; N]);
    let y = DataObject::from_f32(&[1.0; N]);
    let mut plan = saxpy_plan(&device, &x, &y)?;

    let result = plan.execute()?;
    let profile = result.profiler_result();
    assert!(!profile.is_enabled());
    assert_eq!(profile.total_time(), 0);
    assert_eq!(profile.compile_time(), 0);
    assert_eq!(profile.data_transfers_time(), 0);
    assert_eq!(profile.device_kernel_time(), 0);
    assert_eq!(profile.task_kernel_time("t0"), 0);
    assert_eq!(y.to_f32_vec(), vec![3.0; N]);
    Ok(())
}

#[test]
fn enabled_profiler_accounts_for_every_phase() -> Result<()> {
    let device = RefCpuDevice::new();
    let x = DataObject::from_f32(&[1.0; N]);
    let y = DataObject::from_f32(&[1.0; N]);
    let mut plan = saxpy_plan(&device, &x, &y)?;
    plan.with_profiler(ProfilerMode::Enabled);

    let result = plan.execute()?;
    let profile = result.profiler_result().clone();
    assert!(profile.is_enabled());
    assert!(profile.total_time() > 0);
    assert!(profile.compile_time() > 0);
    assert!(
        profile.total_time()
            >= profile.compile_time() + profile.data_transfers_time() + profile.device_kernel_time()
    );
    assert_eq!(profile.device_kernel_time(), profile.task_kernel_time("t0"));

    let json: serde_json::Value = serde_json::from_str(&profile.to_json()?)?;
    assert_eq!(json["enabled"], serde_json::Value::Bool(true));

    // A replay does not compile again.
    let replay = plan.execute()?.profiler_result().clone();
    assert_eq!(replay.compile_time(), 0);
    assert!(replay.total_time() > 0);

    plan.without_profiler();
    let off = plan.execute()?.profiler_result().clone();
    assert_eq!(off.total_time(), 0);
    Ok(())
}

#[test]
fn streamed_inputs_are_split_into_chunks() -> Result<()> {
    let device = RefCpuDevice::new();
    let x = DataObject::from_f32(&[1.0; N]);
    let y = DataObject::from_f32(&[1.0; N]);
    let mut plan = saxpy_plan(&device, &x, &y)?;
    plan.with_config(RuntimeConfig::default().with_stream_chunk_bytes(1024));

    let counters = *plan.execute()?.counters();
    assert_eq!(counters.stream_ins, 2);
    assert_eq!(counters.bytes_to_device, 2 * 4 * N as u64);
    assert_eq!(device.stats().copies_in, 8);
    assert_eq!(y.to_f32_vec(), vec![3.0; N]);
    Ok(())
}

#[test]
fn readback_policy_changes_recompile() -> Result<()> {
    let device = RefCpuDevice::new();
    let x = DataObject::from_f32(&[1.0; N]);
    let y = DataObject::from_f32(&[0.0; N]);
    let mut plan = saxpy_plan(&device, &x, &y)?;
    plan.execute()?;
    assert_eq!(plan.compile_count(), 1);

    plan.with_config(RuntimeConfig::default().with_print_bytecodes(true));
    plan.execute()?;
    assert_eq!(plan.compile_count(), 1);

    plan.with_config(
        RuntimeConfig::default().with_readback_blocking(ReadbackBlocking::Always),
    );
    y.copy_from_f32(&[0.0; N])?;
    plan.execute()?;
    assert_eq!(plan.compile_count(), 2);
    assert_eq!(y.to_f32_vec(), vec![2.0; N]);
    Ok(())
}
