use std::fmt;

use smallvec::{smallvec, SmallVec};

use crate::device::DeviceIndex;

/// Index of a node in a [`NodeGraph`](super::NodeGraph) arena. Arena order is the total
/// order used for deterministic re-serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

pub type NodeInputs = SmallVec<[NodeId; 4]>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockingMode {
    Blocking,
    #[default]
    NonBlocking,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SharingMode {
    #[default]
    Exclusive,
    /// The object is resident on more than one device in the same graph.
    Shared,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CacheMode {
    #[default]
    Cacheable,
    Uncached,
}

pub const MODE_BLOCKING: u8 = 0x01;
pub const MODE_SHARED: u8 = 0x02;
pub const MODE_CACHEABLE: u8 = 0x04;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NodeModes {
    pub blocking: BlockingMode,
    pub sharing: SharingMode,
    pub cache: CacheMode,
}

impl NodeModes {
    pub fn blocking() -> Self {
        Self {
            blocking: BlockingMode::Blocking,
            ..Self::default()
        }
    }

    pub fn with_sharing(mut self, sharing: SharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking == BlockingMode::Blocking
    }

    pub fn encode(self) -> u8 {
        let mut byte = 0;
        if self.blocking == BlockingMode::Blocking {
            byte |= MODE_BLOCKING;
        }
        if self.sharing == SharingMode::Shared {
            byte |= MODE_SHARED;
        }
        if self.cache == CacheMode::Cacheable {
            byte |= MODE_CACHEABLE;
        }
        byte
    }

    pub fn decode(byte: u8) -> Self {
        Self {
            blocking: if byte & MODE_BLOCKING != 0 {
                BlockingMode::Blocking
            } else {
                BlockingMode::NonBlocking
            },
            sharing: if byte & MODE_SHARED != 0 {
                SharingMode::Shared
            } else {
                SharingMode::Exclusive
            },
            cache: if byte & MODE_CACHEABLE != 0 {
                CacheMode::Cacheable
            } else {
                CacheMode::Uncached
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Host data object, by object-table index.
    Object { index: usize },
    /// Call parameter, by parameter-table index.
    Parameter { index: usize },
    /// Inline scalar, by constant-pool index.
    Constant { index: usize },
    DeviceContext { device: DeviceIndex },
    Allocate { value: NodeId, context: NodeId },
    /// Host-to-device copy performed only while the device copy is stale.
    CopyIn {
        value: NodeId,
        context: NodeId,
        allocation: NodeId,
        /// Producer in another context that must reach the host first.
        after: Option<NodeId>,
    },
    /// Host-to-device copy performed on every execution.
    StreamIn {
        value: NodeId,
        context: NodeId,
        allocation: NodeId,
        after: Option<NodeId>,
    },
    /// The value of `value` once `task` has written it.
    DependentRead {
        value: NodeId,
        context: NodeId,
        task: NodeId,
    },
    CopyOut {
        value: NodeId,
        context: NodeId,
        task: NodeId,
    },
    BlockingCopyOut {
        value: NodeId,
        context: NodeId,
        task: NodeId,
    },
    Task {
        context: NodeId,
        task_index: usize,
        args: SmallVec<[NodeId; 8]>,
    },
}

impl NodeKind {
    pub fn inputs(&self) -> NodeInputs {
        match self {
            NodeKind::Object { .. }
            | NodeKind::Parameter { .. }
            | NodeKind::Constant { .. }
            | NodeKind::DeviceContext { .. } => NodeInputs::new(),
            NodeKind::Allocate { value, context } => smallvec![*value, *context],
            NodeKind::CopyIn {
                value,
                context,
                allocation,
                after,
            }
            | NodeKind::StreamIn {
                value,
                context,
                allocation,
                after,
            } => {
                let mut inputs: NodeInputs = smallvec![*value, *context, *allocation];
                inputs.extend(*after);
                inputs
            }
            NodeKind::DependentRead {
                value,
                context,
                task,
            }
            | NodeKind::CopyOut {
                value,
                context,
                task,
            }
            | NodeKind::BlockingCopyOut {
                value,
                context,
                task,
            } => smallvec![*value, *context, *task],
            NodeKind::Task { context, args, .. } => {
                let mut inputs: NodeInputs = smallvec![*context];
                inputs.extend(args.iter().copied());
                inputs
            }
        }
    }

    /// Rewrites every reference to `old` with `new`. Returns whether anything changed.
    pub(crate) fn replace_input(&mut self, old: NodeId, new: NodeId) -> bool {
        let mut changed = false;
        let mut swap = |slot: &mut NodeId| {
            if *slot == old {
                *slot = new;
                changed = true;
            }
        };
        match self {
            NodeKind::Object { .. }
            | NodeKind::Parameter { .. }
            | NodeKind::Constant { .. }
            | NodeKind::DeviceContext { .. } => {}
            NodeKind::Allocate { value, context } => {
                swap(value);
                swap(context);
            }
            NodeKind::CopyIn {
                value,
                context,
                allocation,
                after,
            }
            | NodeKind::StreamIn {
                value,
                context,
                allocation,
                after,
            } => {
                swap(value);
                swap(context);
                swap(allocation);
                if let Some(after) = after {
                    swap(after);
                }
            }
            NodeKind::DependentRead {
                value,
                context,
                task,
            }
            | NodeKind::CopyOut {
                value,
                context,
                task,
            }
            | NodeKind::BlockingCopyOut {
                value,
                context,
                task,
            } => {
                swap(value);
                swap(context);
                swap(task);
            }
            NodeKind::Task { context, args, .. } => {
                swap(context);
                args.iter_mut().for_each(&mut swap);
            }
        }
        changed
    }

    /// Device context of an operation node.
    pub fn context(&self) -> Option<NodeId> {
        match self {
            NodeKind::Allocate { context, .. }
            | NodeKind::CopyIn { context, .. }
            | NodeKind::StreamIn { context, .. }
            | NodeKind::DependentRead { context, .. }
            | NodeKind::CopyOut { context, .. }
            | NodeKind::BlockingCopyOut { context, .. }
            | NodeKind::Task { context, .. } => Some(*context),
            _ => None,
        }
    }

    /// Operation nodes produce bytecode; data and context nodes do not.
    pub fn is_operation(&self) -> bool {
        self.context().is_some()
    }

    pub fn is_copy_out(&self) -> bool {
        matches!(
            self,
            NodeKind::CopyOut { .. } | NodeKind::BlockingCopyOut { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Object { .. } => "object",
            NodeKind::Parameter { .. } => "parameter",
            NodeKind::Constant { .. } => "constant",
            NodeKind::DeviceContext { .. } => "context",
            NodeKind::Allocate { .. } => "allocate",
            NodeKind::CopyIn { .. } => "copy_in",
            NodeKind::StreamIn { .. } => "stream_in",
            NodeKind::DependentRead { .. } => "dependent_read",
            NodeKind::CopyOut { .. } => "copy_out",
            NodeKind::BlockingCopyOut { .. } => "blocking_copy_out",
            NodeKind::Task { .. } => "task",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) id: Option<u32>,
    pub(crate) uses: Vec<NodeId>,
    pub(crate) modes: NodeModes,
}

impl Node {
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Compile-time id; `None` until the compiler schedules the node.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn uses(&self) -> &[NodeId] {
        &self.uses
    }

    pub fn modes(&self) -> NodeModes {
        self.modes
    }
}
