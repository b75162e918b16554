//! Batch processing: one program pass per fixed-size window of every object.

use crate::error::{Result, RuntimeError};
use crate::task::{DataTransferMode, ImmutableTaskGraph};

/// Byte window handled by one pass of a batched program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    /// Zero means "the whole object".
    pub len: u64,
    /// Threads launched per task; zero keeps the task's grid.
    pub threads: u64,
}

/// Split of a graph's objects into batches of `batch_bytes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Batches {
    batch_bytes: u64,
    total_bytes: u64,
    elem_size: u64,
}

impl Batches {
    /// Batch layout of `graph`. Every object must share one size and element type, every
    /// task must run on a 1D grid, and no output may be left on the device.
    pub fn for_graph(graph: &ImmutableTaskGraph, batch_bytes: u64) -> Result<Self> {
        let invalid = |reason: String| {
            Err(RuntimeError::InvalidArgument(format!(
                "graph '{}' cannot run in batches: {reason}",
                graph.name()
            )))
        };
        let Some(first) = graph.objects().first() else {
            return invalid("it has no data objects".into());
        };
        let total_bytes = first.byte_len();
        let elem_size = first.elem_size() as u64;
        if total_bytes == 0 {
            return invalid("its objects are empty".into());
        }
        if batch_bytes == 0 || batch_bytes % elem_size != 0 {
            return invalid(format!(
                "batch of {batch_bytes} bytes is not a multiple of the {elem_size}-byte element"
            ));
        }
        for (index, object) in graph.objects().iter().enumerate() {
            if object.byte_len() != total_bytes || object.elem_size() as u64 != elem_size {
                return invalid(format!(
                    "object {index} holds {} bytes of {}-byte elements, expected {total_bytes} of {elem_size}",
                    object.byte_len(),
                    object.elem_size()
                ));
            }
        }
        if let Some(task) = graph.tasks().iter().find(|task| task.dims() != 1) {
            return invalid(format!("task '{}' runs on a {}D grid", task.name, task.dims()));
        }
        if graph
            .outputs()
            .iter()
            .any(|output| output.mode == DataTransferMode::UnderDemand)
        {
            return invalid("under-demand outputs would only keep the last batch".into());
        }
        Ok(Self {
            batch_bytes,
            total_bytes,
            elem_size,
        })
    }

    pub fn batch_bytes(&self) -> u64 {
        self.batch_bytes
    }

    /// Windows in processing order; the last one may be short.
    pub fn chunks(&self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < self.total_bytes {
            let len = self.batch_bytes.min(self.total_bytes - offset);
            chunks.push(Chunk {
                offset,
                len,
                threads: len / self.elem_size,
            });
            offset += len;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::WorkerGrid;
    use crate::object::DataObject;
    use crate::task::{Arg, TaskGraph};

    fn copy_graph(src: &DataObject, dst: &DataObject) -> ImmutableTaskGraph {
        let mut builder = TaskGraph::new("s0");
        builder
            .transfer_to_device(DataTransferMode::EveryExecution, &[src])
            .task("t0", "copy", vec![Arg::read(src), Arg::write(dst)])
            .transfer_to_host(DataTransferMode::EveryExecution, &[dst]);
        builder.snapshot().unwrap()
    }

    #[test]
    fn last_chunk_holds_the_remainder() {
        let graph = copy_graph(&DataObject::zeros_f32(10), &DataObject::zeros_f32(10));
        let chunks = Batches::for_graph(&graph, 16).unwrap().chunks();
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, len: 16, threads: 4 },
                Chunk { offset: 16, len: 16, threads: 4 },
                Chunk { offset: 32, len: 8, threads: 2 },
            ]
        );
    }

    #[test]
    fn oversized_batch_is_a_single_chunk() {
        let graph = copy_graph(&DataObject::zeros_f32(4), &DataObject::zeros_f32(4));
        let chunks = Batches::for_graph(&graph, 1024).unwrap().chunks();
        assert_eq!(chunks, vec![Chunk { offset: 0, len: 16, threads: 4 }]);
    }

    #[test]
    fn unbatchable_graphs_are_rejected() {
        let graph = copy_graph(&DataObject::zeros_f32(8), &DataObject::zeros_f32(4));
        assert!(Batches::for_graph(&graph, 16).is_err());

        let graph = copy_graph(&DataObject::zeros_f32(8), &DataObject::zeros_f32(8));
        assert!(Batches::for_graph(&graph, 6).is_err());

        let a = DataObject::zeros_f32(16);
        let mut builder = TaskGraph::new("s0");
        builder
            .task_with_grid("t0", "fill", vec![Arg::write(&a)], WorkerGrid::d2(4, 4))
            .transfer_to_host(DataTransferMode::EveryExecution, &[&a]);
        assert!(Batches::for_graph(&builder.snapshot().unwrap(), 16).is_err());

        let mut builder = TaskGraph::new("s0");
        builder
            .task("t0", "fill", vec![Arg::write(&a)])
            .transfer_to_host(DataTransferMode::UnderDemand, &[&a]);
        assert!(Batches::for_graph(&builder.snapshot().unwrap(), 16).is_err());
    }
}
