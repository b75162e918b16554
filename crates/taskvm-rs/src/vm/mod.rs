//! Bytecode interpreter.
//!
//! [`Interpreter`] walks a compiled program once per invocation, driving devices through
//! the [`crate::device::Device`] contract. State that must survive between invocations of
//! the same graph (object residency, call stacks, installed kernels) lives in
//! [`GraphRuntime`], owned by the execution plan.

mod events;
mod interpreter;
mod runtime;

pub use events::{EventList, EventLists, MAX_EVENTS_PER_LIST};
pub use interpreter::{ExecutionCounters, ExecutionInputs, Interpreter};
pub use runtime::GraphRuntime;
