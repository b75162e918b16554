use std::sync::Arc;

use anyhow::Result;
use taskvm_rs::{
    Arg, Constant, DataObject, DataTransferMode, Device, DeviceIndex, DeviceRegistry,
    ExecutionPlan, ImmutableTaskGraph, RuntimeError, TaskGraph,
};
use taskvm_rs_backend_ref_cpu::RefCpuDevice;
use tracing_subscriber::EnvFilter;

const N: usize = 16;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry(devices: &[&RefCpuDevice]) -> DeviceRegistry {
    devices.iter().fold(DeviceRegistry::new(), |registry, device| {
        registry.with_device(Arc::new((*device).clone()))
    })
}

struct VectorAdd {
    a: DataObject,
    b: DataObject,
    c: DataObject,
    graph: ImmutableTaskGraph,
}

fn vector_add(mode: DataTransferMode) -> Result<VectorAdd> {
    let a = DataObject::from_f32(&[1.0; N]);
    let b = DataObject::from_f32(&[2.0; N]);
    let c = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(mode, &[&a, &b])
        .task(
            "t0",
            "vector_add",
            vec![Arg::read(&a), Arg::read(&b), Arg::write(&c)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[&c]);
    let graph = builder.snapshot()?;
    Ok(VectorAdd { a, b, c, graph })
}

#[test]
fn vector_add_produces_sums() -> Result<()> {
    init_tracing();
    let device = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;

    let result = plan.execute()?;
    assert_eq!(result.counters().launches, 1);
    assert_eq!(result.graphs(), &[0]);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(plan.compile_count(), 1);
    Ok(())
}

#[test]
fn replay_is_idempotent_and_skips_cached_inputs() -> Result<()> {
    init_tracing();
    let device = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;

    let first = *plan.execute()?.counters();
    assert_eq!(first.copy_ins, 2);
    assert_eq!(first.copy_ins_skipped, 0);

    for _ in 0..3 {
        c.copy_from_f32(&[0.0; N])?;
        let counters = *plan.execute()?.counters();
        assert_eq!(counters.copy_ins, 0);
        assert_eq!(counters.copy_ins_skipped, 2);
        assert_eq!(counters.copy_outs, 1);
        assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    }
    assert_eq!(plan.compile_count(), 1);
    assert_eq!(device.stats().installs, 1);
    assert_eq!(plan.kernel_stats("t0").map(|stats| stats.invocations()), Some(4));
    Ok(())
}

#[test]
fn every_execution_inputs_are_resent() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { a, c, graph, .. } = vector_add(DataTransferMode::EveryExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;

    plan.execute()?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);

    a.copy_from_f32(&[10.0; N])?;
    let counters = *plan.execute()?.counters();
    assert_eq!(counters.stream_ins, 2);
    assert_eq!(counters.copy_ins, 0);
    assert_eq!(c.to_f32_vec(), vec![12.0; N]);
    Ok(())
}

#[test]
fn first_execution_inputs_need_invalidation_to_refresh() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { a, c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;
    plan.execute()?;

    a.copy_from_f32(&[10.0; N])?;
    plan.execute()?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);

    plan.invalidate_objects();
    plan.execute()?;
    assert_eq!(c.to_f32_vec(), vec![12.0; N]);
    Ok(())
}

#[test]
fn reassignment_recompiles_once_and_keeps_results() -> Result<()> {
    init_tracing();
    let first = RefCpuDevice::new();
    let second = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&first, &second]), [graph])?;

    plan.execute()?;
    assert_eq!(plan.compile_count(), 1);
    assert_eq!(first.live_buffers(), 3);

    plan.with_device(DeviceIndex(1))?;
    assert_eq!(first.live_buffers(), 0);
    c.copy_from_f32(&[0.0; N])?;
    plan.execute()?;
    assert_eq!(plan.compile_count(), 2);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(second.stats().launches, 1);
    assert_eq!(plan.assignment(0), Some(&[DeviceIndex(1)][..]));

    plan.execute()?;
    assert_eq!(plan.compile_count(), 2);

    // Moving back reuses the program compiled for the original placement.
    plan.with_device(DeviceIndex(0))?;
    plan.execute()?;
    assert_eq!(plan.compile_count(), 2);
    assert_eq!(plan.program_cache().hits(), 1);
    assert_eq!(plan.kernel_stats("t0").map(|stats| stats.invocations()), Some(4));
    Ok(())
}

#[test]
fn every_execution_transfers_follow_reassignment() -> Result<()> {
    let first = RefCpuDevice::new();
    let second = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::EveryExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&first, &second]), [graph])?;

    plan.execute()?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);

    plan.with_device(DeviceIndex(1))?;
    assert_eq!(first.live_buffers(), 0);
    c.copy_from_f32(&[0.0; N])?;
    let counters = *plan.execute()?.counters();
    assert_eq!(counters.stream_ins, 2);
    assert_eq!(counters.copy_outs, 1);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(first.stats().launches, 1);
    assert_eq!(second.stats().launches, 1);
    assert_eq!(second.live_buffers(), 3);
    Ok(())
}

#[test]
fn batched_plans_process_one_window_at_a_time() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;
    plan.with_batch(24);

    let counters = *plan.execute()?.counters();
    assert_eq!(counters.launches, 3);
    assert_eq!(counters.copy_ins, 6);
    assert_eq!(counters.copy_outs, 3);
    assert_eq!(counters.bytes_to_device, 2 * 4 * N as u64);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(device.memory_provider().used, 3 * 24);

    c.copy_from_f32(&[0.0; N])?;
    plan.execute()?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(plan.compile_count(), 1);

    // Whole-object buffers replace the batch-sized ones.
    c.copy_from_f32(&[0.0; N])?;
    plan.with_batch(0).execute()?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    assert_eq!(plan.compile_count(), 2);
    assert_eq!(device.memory_provider().used, 3 * 4 * N as u64);
    Ok(())
}

#[test]
fn batches_are_refused_across_devices() -> Result<()> {
    let first = RefCpuDevice::new();
    let second = RefCpuDevice::new();
    let a = DataObject::from_f32(&[1.0; N]);
    let b = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::FirstExecution, &[&a])
        .task("t0", "copy", vec![Arg::read(&a), Arg::write(&b)])
        .task(
            "t1",
            "scale",
            vec![Arg::read_write(&b), Arg::scalar(Constant::F32(2.0))],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[&b]);
    let mut plan = ExecutionPlan::new(registry(&[&first, &second]), [builder.snapshot()?])?;
    plan.with_device_for_task(0, "t1", DeviceIndex(1))?.with_batch(16);

    assert!(matches!(
        plan.execute(),
        Err(RuntimeError::InvalidArgument(_))
    ));
    assert_eq!(first.stats().launches + second.stats().launches, 0);

    plan.with_device(DeviceIndex(0))?;
    plan.execute()?;
    assert_eq!(b.to_f32_vec(), vec![2.0; N]);
    Ok(())
}

#[test]
fn unknown_devices_and_tasks_are_rejected() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;

    assert!(plan.with_device(DeviceIndex(3)).is_err());
    assert!(matches!(
        plan.with_device_for_task(0, "missing", DeviceIndex(0)),
        Err(RuntimeError::InvalidArgument(_))
    ));
    assert!(plan.with_graph(2).is_err());
    assert!(plan.execute_graph(2).is_err());
    Ok(())
}

#[test]
fn snapshots_are_isolated_from_later_edits() -> Result<()> {
    let device = RefCpuDevice::new();
    let a = DataObject::from_f32(&[1.0; N]);
    let b = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::EveryExecution, &[&a])
        .task("t0", "copy", vec![Arg::read(&a), Arg::write(&b)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&b]);
    let before = builder.snapshot()?;

    builder.task(
        "t1",
        "scale",
        vec![Arg::read_write(&b), Arg::scalar(Constant::F32(4.0))],
    );
    let after = builder.snapshot()?;
    assert_eq!(before.tasks().len(), 1);
    assert_eq!(after.tasks().len(), 2);
    assert_ne!(before.id(), after.id());

    let mut plan = ExecutionPlan::new(registry(&[&device]), [before])?;
    plan.execute()?;
    assert_eq!(b.to_f32_vec(), vec![1.0; N]);
    Ok(())
}

#[test]
fn duplicate_task_names_are_rejected() {
    let a = DataObject::zeros_f32(4);
    let mut builder = TaskGraph::new("s0");
    builder
        .task("t0", "fill", vec![Arg::write(&a), Arg::scalar(Constant::F32(1.0))])
        .task("t0", "fill", vec![Arg::write(&a), Arg::scalar(Constant::F32(2.0))]);
    assert!(matches!(
        builder.snapshot(),
        Err(RuntimeError::InvalidArgument(_))
    ));
}

#[test]
fn dependent_tasks_across_devices_stage_through_host() -> Result<()> {
    init_tracing();
    let first = RefCpuDevice::new();
    let second = RefCpuDevice::new();
    let a = DataObject::from_f32(&[1.5; N]);
    let b = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::FirstExecution, &[&a])
        .task(
            "t0",
            "scale",
            vec![Arg::read_write(&a), Arg::scalar(Constant::F32(2.0))],
        )
        .task("t1", "copy", vec![Arg::read(&a), Arg::write(&b)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&b]);
    let mut plan = ExecutionPlan::new(registry(&[&first, &second]), [builder.snapshot()?])?;
    plan.with_device_for_task(0, "t1", DeviceIndex(1))?;

    let counters = *plan.execute()?.counters();
    assert_eq!(counters.read_hosts, 1);
    assert_eq!(counters.launches, 2);
    assert_eq!(b.to_f32_vec(), vec![3.0; N]);
    assert_eq!(first.stats().launches, 1);
    assert_eq!(second.stats().launches, 1);
    Ok(())
}

#[test]
fn under_demand_outputs_are_fetched_on_request() -> Result<()> {
    let device = RefCpuDevice::new();
    let a = DataObject::from_f32(&[1.0; N]);
    let b = DataObject::from_f32(&[2.0; N]);
    let c = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::FirstExecution, &[&a, &b])
        .task(
            "t0",
            "vector_add",
            vec![Arg::read(&a), Arg::read(&b), Arg::write(&c)],
        )
        .transfer_to_host(DataTransferMode::UnderDemand, &[&c]);
    let mut plan = ExecutionPlan::new(registry(&[&device]), [builder.snapshot()?])?;

    let mut result = plan.execute()?;
    assert_eq!(result.counters().copy_outs, 0);
    assert_eq!(c.to_f32_vec(), vec![0.0; N]);

    result.transfer_to_host(&[&c])?;
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);

    let stranger = DataObject::zeros_f32(1);
    assert!(matches!(
        plan.transfer_to_host(&[&stranger]),
        Err(RuntimeError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn parameters_are_rebound_without_recompiling() -> Result<()> {
    let device = RefCpuDevice::new();
    let x = DataObject::from_f32(&[1.0; N]);
    let y = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::FirstExecution, &[&x])
        .task(
            "t0",
            "add_scalar",
            vec![Arg::read(&x), Arg::write(&y), Arg::param(0)],
        )
        .transfer_to_host(DataTransferMode::EveryExecution, &[&y]);
    let mut plan = ExecutionPlan::new(registry(&[&device]), [builder.snapshot()?])?;

    assert!(matches!(
        plan.execute(),
        Err(RuntimeError::InvalidArgument(_))
    ));

    plan.with_parameters(&[Constant::F32(0.5)]).execute()?;
    assert_eq!(y.to_f32_vec(), vec![1.5; N]);

    plan.with_parameters(&[Constant::F32(-3.0)]).execute()?;
    assert_eq!(y.to_f32_vec(), vec![-2.0; N]);
    assert_eq!(plan.compile_count(), 1);
    Ok(())
}

#[test]
fn graphs_run_in_order_or_one_at_a_time() -> Result<()> {
    let device = RefCpuDevice::new();
    let a = DataObject::zeros_f32(N);
    let b = DataObject::zeros_f32(N);

    let mut first = TaskGraph::new("fill_a");
    first
        .task("t0", "fill", vec![Arg::write(&a), Arg::scalar(Constant::F32(7.0))])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&a]);
    let mut second = TaskGraph::new("fill_b");
    second
        .task("t0", "fill", vec![Arg::write(&b), Arg::scalar(Constant::F32(9.0))])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&b]);

    let mut plan = ExecutionPlan::new(
        registry(&[&device]),
        [first.snapshot()?, second.snapshot()?],
    )?;

    plan.with_graph(1)?;
    let result = plan.execute()?;
    assert_eq!(result.graphs(), &[1]);
    assert_eq!(a.to_f32_vec(), vec![0.0; N]);
    assert_eq!(b.to_f32_vec(), vec![9.0; N]);

    let result = plan.with_all_graphs().execute()?;
    assert_eq!(result.graphs(), &[0, 1]);
    assert_eq!(result.counters().launches, 2);
    assert_eq!(a.to_f32_vec(), vec![7.0; N]);
    Ok(())
}

#[test]
fn warm_up_installs_kernels_ahead_of_execution() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;

    plan.with_warm_up()?;
    assert_eq!(plan.compile_count(), 1);
    assert_eq!(device.stats().installs, 1);
    assert_eq!(device.stats().launches, 0);

    plan.execute()?;
    assert_eq!(device.stats().installs, 1);
    assert_eq!(plan.compile_count(), 1);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    Ok(())
}

#[test]
fn freed_memory_is_reallocated_on_next_execution() -> Result<()> {
    let device = RefCpuDevice::new();
    let VectorAdd { c, graph, .. } = vector_add(DataTransferMode::FirstExecution)?;
    let mut plan = ExecutionPlan::new(registry(&[&device]), [graph])?;
    plan.execute()?;

    plan.free_device_memory()?;
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.memory_provider().used, 0);

    c.copy_from_f32(&[0.0; N])?;
    let counters = *plan.execute()?.counters();
    assert_eq!(counters.copy_ins, 2);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);

    plan.reset_device()?;
    c.copy_from_f32(&[0.0; N])?;
    plan.execute()?;
    assert_eq!(device.stats().installs, 2);
    assert_eq!(c.to_f32_vec(), vec![3.0; N]);
    Ok(())
}

#[test]
fn devices_without_implicit_ordering_still_complete() -> Result<()> {
    let device = RefCpuDevice::builder().auto_orders(false).build();
    let a = DataObject::from_f32(&[2.0; N]);
    let b = DataObject::zeros_f32(N);
    let mut builder = TaskGraph::new("s0");
    builder
        .transfer_to_device(DataTransferMode::EveryExecution, &[&a])
        .task(
            "t0",
            "scale",
            vec![Arg::read_write(&a), Arg::scalar(Constant::F32(3.0))],
        )
        .task("t1", "copy", vec![Arg::read(&a), Arg::write(&b)])
        .transfer_to_host(DataTransferMode::EveryExecution, &[&b]);
    let mut plan = ExecutionPlan::new(registry(&[&device]), [builder.snapshot()?])?;
    plan.execute()?;
    assert_eq!(b.to_f32_vec(), vec![6.0; N]);
    Ok(())
}
