//! Worker geometry: global/local work sizes handed to kernel launches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerGrid {
    dims: usize,
    global: [u64; 3],
    local: Option<[u64; 3]>,
    offset: [u64; 3],
}

impl WorkerGrid {
    pub fn d1(x: u64) -> Self {
        Self::new(1, [x, 1, 1])
    }

    pub fn d2(x: u64, y: u64) -> Self {
        Self::new(2, [x, y, 1])
    }

    pub fn d3(x: u64, y: u64, z: u64) -> Self {
        Self::new(3, [x, y, z])
    }

    fn new(dims: usize, global: [u64; 3]) -> Self {
        Self {
            dims,
            global,
            local: None,
            offset: [0; 3],
        }
    }

    pub fn with_local(mut self, local: [u64; 3]) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_offset(mut self, offset: [u64; 3]) -> Self {
        self.offset = offset;
        self
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn global(&self) -> &[u64] {
        &self.global[..self.dims]
    }

    pub fn local(&self) -> Option<&[u64]> {
        self.local.as_ref().map(|local| &local[..self.dims])
    }

    pub fn offset(&self) -> &[u64] {
        &self.offset[..self.dims]
    }

    pub fn total_threads(&self) -> u64 {
        self.global().iter().product()
    }

    /// Local sizes must be non-zero and divide the global size in every dimension.
    pub fn validate(&self) -> Result<()> {
        if self.global().contains(&0) {
            return Err(RuntimeError::InvalidArgument(format!(
                "worker grid has an empty global dimension: {:?}",
                self.global()
            )));
        }
        if let Some(local) = self.local() {
            for (axis, (&global, &local)) in self.global().iter().zip(local).enumerate() {
                if local == 0 || global % local != 0 {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "local size {local} does not divide global size {global} on axis {axis}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-task worker geometry overrides, keyed by `"<graph>.<task>"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridScheduler {
    grids: HashMap<String, WorkerGrid>,
}

impl GridScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grid(mut self, key: impl Into<String>, grid: WorkerGrid) -> Self {
        self.set_grid(key, grid);
        self
    }

    pub fn set_grid(&mut self, key: impl Into<String>, grid: WorkerGrid) {
        self.grids.insert(key.into(), grid);
    }

    pub fn grid(&self, graph: &str, task: &str) -> Option<&WorkerGrid> {
        self.grids.get(&format!("{graph}.{task}"))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.grids.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }
}
