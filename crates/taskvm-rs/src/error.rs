use std::fmt;

use thiserror::Error;

use crate::device::DeviceIndex;

/// Error reported by a device backend through the Device or Installed Kernel contract.
#[derive(Debug)]
pub enum DeviceError {
    OutOfMemory { requested: u64, available: u64 },
    Unsupported { op: &'static str, reason: String },
    Execution { message: String },
}

impl DeviceError {
    pub fn out_of_memory(requested: u64, available: u64) -> Self {
        DeviceError::OutOfMemory {
            requested,
            available,
        }
    }

    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        DeviceError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        DeviceError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "device out of memory: requested {requested} bytes, {available} available"
            ),
            DeviceError::Unsupported { op, reason } => {
                write!(f, "{op} is not supported: {reason}")
            }
            DeviceError::Execution { message } => {
                write!(f, "device execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Convenience alias for results returned by device routines.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors surfaced by the runtime to callers of the execution plan.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(
        "allocation of object {object} failed on device {device}: requested {requested} bytes, {available} available"
    )]
    AllocationFailure {
        object: usize,
        device: DeviceIndex,
        requested: u64,
        available: u64,
    },
    #[error("node {node} depends on node {input} which has no id yet")]
    DependencyViolation { node: u32, input: u32 },
    #[error("{op} failed for object {object:?} on device {device}: {source}")]
    DeviceOperation {
        op: &'static str,
        object: Option<usize>,
        device: DeviceIndex,
        #[source]
        source: DeviceError,
    },
    #[error("worker grid for task '{task}' is {found}D but the task declares {expected}D")]
    ConfigurationMismatch {
        task: String,
        expected: usize,
        found: usize,
    },
    #[error("malformed bytecode at offset {offset} (opcode {opcode:#04x}): {reason}")]
    MalformedBytecode {
        offset: usize,
        opcode: u8,
        reason: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RuntimeError {
    pub(crate) fn device(
        op: &'static str,
        object: Option<usize>,
        device: DeviceIndex,
        source: DeviceError,
    ) -> Self {
        match (source, object) {
            (
                DeviceError::OutOfMemory {
                    requested,
                    available,
                },
                Some(object),
            ) => RuntimeError::AllocationFailure {
                object,
                device,
                requested,
                available,
            },
            (source, object) => RuntimeError::DeviceOperation {
                op,
                object,
                device,
                source,
            },
        }
    }

    pub(crate) fn malformed(offset: usize, opcode: u8, reason: impl Into<String>) -> Self {
        RuntimeError::MalformedBytecode {
            offset,
            opcode,
            reason: reason.into(),
        }
    }

    /// Allocation failures may be retried on another device; everything else is final
    /// for the current invocation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RuntimeError::AllocationFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
