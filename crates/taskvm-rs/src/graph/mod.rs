//! Node graph model: data, context and operation nodes of one task graph.

mod arena;
mod builder;
mod node;

pub use arena::NodeGraph;
pub use builder::build_graph;
pub use node::{
    BlockingMode, CacheMode, Node, NodeId, NodeInputs, NodeKind, NodeModes, SharingMode,
    MODE_BLOCKING, MODE_CACHEABLE, MODE_SHARED,
};
