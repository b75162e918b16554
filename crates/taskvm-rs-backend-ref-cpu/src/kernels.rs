//! Host kernels addressable by name from task graphs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, ensure, Result};
use taskvm_rs::task::TaskDescriptor;
use taskvm_rs::WorkerGrid;

pub type KernelFn = Arc<dyn Fn(&mut KernelFrame<'_>) -> Result<()> + Send + Sync>;

pub(crate) enum FrameArg {
    Buffer(Vec<u8>),
    Scalar(u64),
}

/// Arguments of one kernel invocation. Buffers are copies of device memory; written
/// buffers are stored back after the kernel returns.
pub struct KernelFrame<'a> {
    task: &'a TaskDescriptor,
    grid: &'a WorkerGrid,
    args: Vec<FrameArg>,
}

impl<'a> KernelFrame<'a> {
    pub(crate) fn new(task: &'a TaskDescriptor, grid: &'a WorkerGrid, args: Vec<FrameArg>) -> Self {
        Self { task, grid, args }
    }

    pub(crate) fn into_args(self) -> Vec<FrameArg> {
        self.args
    }

    pub fn task(&self) -> &TaskDescriptor {
        self.task
    }

    pub fn grid(&self) -> &WorkerGrid {
        self.grid
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Thread indices of the first grid dimension, clipped to `len` elements.
    pub fn range_1d(&self, len: usize) -> std::ops::Range<usize> {
        let start = (self.grid.offset()[0] as usize).min(len);
        let end = start.saturating_add(self.grid.global()[0] as usize).min(len);
        start..end
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.args.get(index) {
            Some(FrameArg::Buffer(bytes)) => Ok(bytes.as_slice()),
            Some(FrameArg::Scalar(_)) => bail!("argument {index} is a scalar, not a buffer"),
            None => bail!("argument {index} out of range ({} arguments)", self.args.len()),
        }
    }

    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let len = self.args.len();
        match self.args.get_mut(index) {
            Some(FrameArg::Buffer(bytes)) => Ok(bytes.as_mut_slice()),
            Some(FrameArg::Scalar(_)) => bail!("argument {index} is a scalar, not a buffer"),
            None => bail!("argument {index} out of range ({len} arguments)"),
        }
    }

    pub fn f32s(&self, index: usize) -> Result<Vec<f32>> {
        bytes_to_f32(self.bytes(index)?)
    }

    pub fn i32s(&self, index: usize) -> Result<Vec<i32>> {
        let bytes = self.bytes(index)?;
        ensure!(bytes.len() % 4 == 0, "buffer length mismatches i32");
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    pub fn write_f32s(&mut self, index: usize, values: &[f32]) -> Result<()> {
        let bytes = self.bytes_mut(index)?;
        ensure!(
            bytes.len() == values.len() * 4,
            "buffer of {} bytes cannot hold {} f32 values",
            bytes.len(),
            values.len()
        );
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    pub fn write_i32s(&mut self, index: usize, values: &[i32]) -> Result<()> {
        let bytes = self.bytes_mut(index)?;
        ensure!(
            bytes.len() == values.len() * 4,
            "buffer of {} bytes cannot hold {} i32 values",
            bytes.len(),
            values.len()
        );
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Raw 8-byte slot of a scalar argument.
    pub fn scalar(&self, index: usize) -> Result<u64> {
        match self.args.get(index) {
            Some(FrameArg::Scalar(slot)) => Ok(*slot),
            Some(FrameArg::Buffer(_)) => bail!("argument {index} is a buffer, not a scalar"),
            None => bail!("argument {index} out of range ({} arguments)", self.args.len()),
        }
    }

    pub fn scalar_f32(&self, index: usize) -> Result<f32> {
        Ok(f32::from_bits(self.scalar(index)? as u32))
    }

    pub fn scalar_f64(&self, index: usize) -> Result<f64> {
        Ok(f64::from_bits(self.scalar(index)?))
    }

    pub fn scalar_i32(&self, index: usize) -> Result<i32> {
        Ok(self.scalar(index)? as i64 as i32)
    }

    pub fn scalar_i64(&self, index: usize) -> Result<i64> {
        Ok(self.scalar(index)? as i64)
    }
}

fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 4 == 0, "buffer length mismatches f32");
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Name-to-kernel table consulted by `install_code`.
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, KernelFn>>,
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self {
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the element-wise and matrix kernels below.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register("noop", |_| Ok(()));
        registry.register("vector_add", vector_add);
        registry.register("copy", copy);
        registry.register("scale", scale);
        registry.register("saxpy", saxpy);
        registry.register("add_scalar", add_scalar);
        registry.register("fill", fill);
        registry.register("matmul", matmul);
        registry
    }

    pub fn register<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut KernelFrame<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels
            .write()
            .expect("kernel registry poisoned")
            .insert(name.to_string(), Arc::new(kernel));
    }

    pub fn get(&self, name: &str) -> Option<KernelFn> {
        self.kernels
            .read()
            .expect("kernel registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kernels
            .read()
            .expect("kernel registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// `c[i] = a[i] + b[i]`
fn vector_add(frame: &mut KernelFrame<'_>) -> Result<()> {
    let a = frame.f32s(0)?;
    let b = frame.f32s(1)?;
    let mut c = frame.f32s(2)?;
    ensure!(a.len() == b.len() && b.len() == c.len(), "vector_add operands differ in length");
    for i in frame.range_1d(c.len()) {
        c[i] = a[i] + b[i];
    }
    frame.write_f32s(2, &c)
}

/// `dst[i] = src[i]`
fn copy(frame: &mut KernelFrame<'_>) -> Result<()> {
    let src = frame.bytes(0)?.to_vec();
    let dst = frame.bytes_mut(1)?;
    ensure!(src.len() == dst.len(), "copy operands differ in length");
    dst.copy_from_slice(&src);
    Ok(())
}

/// `x[i] *= factor`
fn scale(frame: &mut KernelFrame<'_>) -> Result<()> {
    let factor = frame.scalar_f32(1)?;
    let mut x = frame.f32s(0)?;
    for i in frame.range_1d(x.len()) {
        x[i] *= factor;
    }
    frame.write_f32s(0, &x)
}

/// `y[i] = alpha * x[i] + y[i]`
fn saxpy(frame: &mut KernelFrame<'_>) -> Result<()> {
    let alpha = frame.scalar_f32(0)?;
    let x = frame.f32s(1)?;
    let mut y = frame.f32s(2)?;
    ensure!(x.len() == y.len(), "saxpy operands differ in length");
    for i in frame.range_1d(y.len()) {
        y[i] += alpha * x[i];
    }
    frame.write_f32s(2, &y)
}

/// `y[i] = x[i] + value`
fn add_scalar(frame: &mut KernelFrame<'_>) -> Result<()> {
    let x = frame.f32s(0)?;
    let value = frame.scalar_f32(2)?;
    let mut y = frame.f32s(1)?;
    ensure!(x.len() == y.len(), "add_scalar operands differ in length");
    for i in frame.range_1d(y.len()) {
        y[i] = x[i] + value;
    }
    frame.write_f32s(1, &y)
}

/// `dst[i] = value`
fn fill(frame: &mut KernelFrame<'_>) -> Result<()> {
    let value = frame.scalar_f32(1)?;
    let mut dst = frame.f32s(0)?;
    for i in frame.range_1d(dst.len()) {
        dst[i] = value;
    }
    frame.write_f32s(0, &dst)
}

/// Square `n x n` product `c = a * b`, one thread per output element of a 2D grid.
fn matmul(frame: &mut KernelFrame<'_>) -> Result<()> {
    let a = frame.f32s(0)?;
    let b = frame.f32s(1)?;
    let mut c = frame.f32s(2)?;
    let n = usize::try_from(frame.scalar_i32(3)?).map_err(|_| anyhow!("negative matrix size"))?;
    ensure!(
        a.len() == n * n && b.len() == n * n && c.len() == n * n,
        "matmul expects {n}x{n} operands"
    );
    let grid = frame.grid();
    ensure!(grid.dims() == 2, "matmul runs on a 2D grid, got {}D", grid.dims());
    let rows = (grid.global()[0] as usize).min(n);
    let cols = (grid.global()[1] as usize).min(n);
    for row in 0..rows {
        for col in 0..cols {
            c[row * n + col] = (0..n).map(|k| a[row * n + k] * b[k * n + col]).sum();
        }
    }
    frame.write_f32s(2, &c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kernel: &str) -> TaskDescriptor {
        TaskDescriptor {
            name: "t0".into(),
            kernel: kernel.into(),
            args: Vec::new(),
            grid: WorkerGrid::d1(4),
        }
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    #[test]
    fn vector_add_respects_grid_bounds() {
        let task = descriptor("vector_add");
        let grid = WorkerGrid::d1(2);
        let mut frame = KernelFrame::new(
            &task,
            &grid,
            vec![
                FrameArg::Buffer(f32_bytes(&[1.0; 4])),
                FrameArg::Buffer(f32_bytes(&[2.0; 4])),
                FrameArg::Buffer(f32_bytes(&[0.0; 4])),
            ],
        );
        vector_add(&mut frame).unwrap();
        assert_eq!(frame.f32s(2).unwrap(), vec![3.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn scalar_accessors_decode_widened_slots() {
        let task = descriptor("noop");
        let grid = WorkerGrid::d1(1);
        let frame = KernelFrame::new(
            &task,
            &grid,
            vec![
                FrameArg::Scalar(u64::from(2.5f32.to_bits())),
                FrameArg::Scalar(-3i32 as i64 as u64),
            ],
        );
        assert_eq!(frame.scalar_f32(0).unwrap(), 2.5);
        assert_eq!(frame.scalar_i32(1).unwrap(), -3);
        assert!(frame.bytes(0).is_err());
        assert!(frame.scalar(2).is_err());
    }

    #[test]
    fn matmul_multiplies_square_matrices() {
        let task = descriptor("matmul");
        let grid = WorkerGrid::d2(2, 2);
        let mut frame = KernelFrame::new(
            &task,
            &grid,
            vec![
                FrameArg::Buffer(f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
                FrameArg::Buffer(f32_bytes(&[5.0, 6.0, 7.0, 8.0])),
                FrameArg::Buffer(f32_bytes(&[0.0; 4])),
                FrameArg::Scalar(2),
            ],
        );
        matmul(&mut frame).unwrap();
        assert_eq!(frame.f32s(2).unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = KernelRegistry::with_builtins();
        assert!(registry.get("vector_add").is_some());
        assert!(registry.get("missing").is_none());
        registry.register("custom", |_| Ok(()));
        assert!(registry.names().contains(&"custom".to_string()));
    }
}
