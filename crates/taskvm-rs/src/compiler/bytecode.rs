//! Bytecode encoding.
//!
//! Every instruction is one opcode byte followed by fixed-width little-endian operands.
//! Event-list operands are `i32` with `-1` meaning "no dependencies".
//!
//! | opcode | operands |
//! |--------|----------|
//! | SETUP | contexts u32, tasks u32, event lists u32 |
//! | CONTEXT | device u32 |
//! | ALLOCATE | object u32, mode u8, batch u64 |
//! | COPY_IN, STREAM_IN | object u32, wait i32, mode u8, offset u64, len u64 |
//! | LAUNCH | task u32, args u32, wait i32, mode u8, threads u64, then per arg: kind u8, index u32 |
//! | READ_HOST | object u32, wait i32, mode u8 |
//! | COPY_OUT, COPY_OUT_BLOCKING | object u32, wait i32, mode u8, offset u64, len u64 |
//! | BARRIER | wait i32, mode u8 |
//! | ADD_DEPENDENCY | list u32 |
//! | END | |

use std::fmt::{self, Write as _};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Result, RuntimeError};
use crate::graph::NodeModes;

pub const OP_SETUP: u8 = 0x01;
pub const OP_CONTEXT: u8 = 0x02;
pub const OP_ALLOCATE: u8 = 0x10;
pub const OP_COPY_IN: u8 = 0x11;
pub const OP_STREAM_IN: u8 = 0x12;
pub const OP_LAUNCH: u8 = 0x20;
pub const OP_PUSH_CONSTANT_ARG: u8 = 0x21;
pub const OP_PUSH_REFERENCE_ARG: u8 = 0x22;
pub const OP_PUSH_PARAMETER_ARG: u8 = 0x23;
pub const OP_READ_HOST: u8 = 0x30;
pub const OP_COPY_OUT: u8 = 0x31;
pub const OP_COPY_OUT_BLOCKING: u8 = 0x32;
pub const OP_BARRIER: u8 = 0x40;
pub const OP_ADD_DEPENDENCY: u8 = 0x41;
pub const OP_END: u8 = 0xff;

/// Dependency-list operand meaning "wait for nothing".
pub const NO_WAIT: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchArg {
    Constant(u32),
    Reference(u32),
    Parameter(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Setup {
        contexts: u32,
        tasks: u32,
        event_lists: u32,
    },
    Context {
        device: u32,
    },
    Allocate {
        object: u32,
        mode: u8,
        batch: u64,
    },
    CopyIn {
        object: u32,
        wait: i32,
        mode: u8,
        offset: u64,
        len: u64,
    },
    StreamIn {
        object: u32,
        wait: i32,
        mode: u8,
        offset: u64,
        len: u64,
    },
    Launch {
        task: u32,
        wait: i32,
        mode: u8,
        /// Threads of one batch; zero runs the task's own grid.
        threads: u64,
        args: SmallVec<[LaunchArg; 8]>,
    },
    ReadHost {
        object: u32,
        wait: i32,
        mode: u8,
    },
    CopyOut {
        object: u32,
        wait: i32,
        mode: u8,
        offset: u64,
        len: u64,
    },
    CopyOutBlocking {
        object: u32,
        wait: i32,
        mode: u8,
        offset: u64,
        len: u64,
    },
    Barrier {
        wait: i32,
        mode: u8,
    },
    AddDependency {
        list: u32,
    },
    End,
}

impl Instruction {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Setup { .. } => OP_SETUP,
            Instruction::Context { .. } => OP_CONTEXT,
            Instruction::Allocate { .. } => OP_ALLOCATE,
            Instruction::CopyIn { .. } => OP_COPY_IN,
            Instruction::StreamIn { .. } => OP_STREAM_IN,
            Instruction::Launch { .. } => OP_LAUNCH,
            Instruction::ReadHost { .. } => OP_READ_HOST,
            Instruction::CopyOut { .. } => OP_COPY_OUT,
            Instruction::CopyOutBlocking { .. } => OP_COPY_OUT_BLOCKING,
            Instruction::Barrier { .. } => OP_BARRIER,
            Instruction::AddDependency { .. } => OP_ADD_DEPENDENCY,
            Instruction::End => OP_END,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Setup { .. } => "SETUP",
            Instruction::Context { .. } => "CONTEXT",
            Instruction::Allocate { .. } => "ALLOCATE",
            Instruction::CopyIn { .. } => "COPY_IN",
            Instruction::StreamIn { .. } => "STREAM_IN",
            Instruction::Launch { .. } => "LAUNCH",
            Instruction::ReadHost { .. } => "READ_HOST",
            Instruction::CopyOut { .. } => "COPY_OUT",
            Instruction::CopyOutBlocking { .. } => "COPY_OUT_BLOCKING",
            Instruction::Barrier { .. } => "BARRIER",
            Instruction::AddDependency { .. } => "ADD_DEPENDENCY",
            Instruction::End => "END",
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode());
        match self {
            Instruction::Setup {
                contexts,
                tasks,
                event_lists,
            } => {
                put_u32(out, *contexts);
                put_u32(out, *tasks);
                put_u32(out, *event_lists);
            }
            Instruction::Context { device } => put_u32(out, *device),
            Instruction::Allocate {
                object,
                mode,
                batch,
            } => {
                put_u32(out, *object);
                out.push(*mode);
                put_u64(out, *batch);
            }
            Instruction::CopyIn {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::StreamIn {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::CopyOut {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::CopyOutBlocking {
                object,
                wait,
                mode,
                offset,
                len,
            } => {
                put_u32(out, *object);
                put_i32(out, *wait);
                out.push(*mode);
                put_u64(out, *offset);
                put_u64(out, *len);
            }
            Instruction::Launch {
                task,
                wait,
                mode,
                threads,
                args,
            } => {
                put_u32(out, *task);
                put_u32(out, args.len() as u32);
                put_i32(out, *wait);
                out.push(*mode);
                put_u64(out, *threads);
                for arg in args {
                    let (kind, index) = match *arg {
                        LaunchArg::Constant(index) => (OP_PUSH_CONSTANT_ARG, index),
                        LaunchArg::Reference(index) => (OP_PUSH_REFERENCE_ARG, index),
                        LaunchArg::Parameter(index) => (OP_PUSH_PARAMETER_ARG, index),
                    };
                    out.push(kind);
                    put_u32(out, index);
                }
            }
            Instruction::ReadHost { object, wait, mode } => {
                put_u32(out, *object);
                put_i32(out, *wait);
                out.push(*mode);
            }
            Instruction::Barrier { wait, mode } => {
                put_i32(out, *wait);
                out.push(*mode);
            }
            Instruction::AddDependency { list } => put_u32(out, *list),
            Instruction::End => {}
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        match self {
            Instruction::Setup {
                contexts,
                tasks,
                event_lists,
            } => write!(
                f,
                " contexts={contexts} tasks={tasks} event_lists={event_lists}"
            ),
            Instruction::Context { device } => write!(f, " device={device}"),
            Instruction::Allocate {
                object,
                mode,
                batch,
            } => write!(f, " obj={object} {} batch={batch}", ModeLabel(*mode)),
            Instruction::CopyIn {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::StreamIn {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::CopyOut {
                object,
                wait,
                mode,
                offset,
                len,
            }
            | Instruction::CopyOutBlocking {
                object,
                wait,
                mode,
                offset,
                len,
            } => write!(
                f,
                " obj={object} wait={wait} {} offset={offset} len={len}",
                ModeLabel(*mode)
            ),
            Instruction::Launch {
                task,
                wait,
                mode,
                threads,
                args,
            } => {
                write!(f, " task={task} wait={wait} {}", ModeLabel(*mode))?;
                if *threads > 0 {
                    write!(f, " threads={threads}")?;
                }
                write!(f, " args=[")?;
                for (position, arg) in args.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    match arg {
                        LaunchArg::Constant(index) => write!(f, "const:{index}")?,
                        LaunchArg::Reference(index) => write!(f, "obj:{index}")?,
                        LaunchArg::Parameter(index) => write!(f, "param:{index}")?,
                    }
                }
                write!(f, "]")
            }
            Instruction::ReadHost { object, wait, mode } => {
                write!(f, " obj={object} wait={wait} {}", ModeLabel(*mode))
            }
            Instruction::Barrier { wait, mode } => {
                write!(f, " wait={wait} {}", ModeLabel(*mode))
            }
            Instruction::AddDependency { list } => write!(f, " list={list}"),
            Instruction::End => Ok(()),
        }
    }
}

struct ModeLabel(u8);

impl fmt::Display for ModeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modes = NodeModes::decode(self.0);
        write!(
            f,
            "mode={}{}{}",
            if modes.is_blocking() { "B" } else { "-" },
            if self.0 & crate::graph::MODE_SHARED != 0 {
                "S"
            } else {
                "-"
            },
            if self.0 & crate::graph::MODE_CACHEABLE != 0 {
                "C"
            } else {
                "-"
            },
        )
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Immutable encoded program. Clones share the underlying bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytecodeProgram {
    bytes: Arc<[u8]>,
}

impl BytecodeProgram {
    pub fn assemble(instructions: &[Instruction]) -> Self {
        let mut out = Vec::new();
        for instruction in instructions {
            instruction.encode(&mut out);
        }
        Self::from_bytes(out)
    }

    /// Wraps raw bytes without validating them; decoding reports malformed input.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reader(&self) -> BytecodeReader<'_> {
        BytecodeReader::new(&self.bytes)
    }

    pub fn decode_all(&self) -> Result<Vec<Instruction>> {
        let mut reader = self.reader();
        let mut instructions = Vec::new();
        while !reader.at_end() {
            let (_, instruction) = reader.next_instruction()?;
            let end = instruction == Instruction::End;
            instructions.push(instruction);
            if end {
                break;
            }
        }
        Ok(instructions)
    }

    /// One instruction per line, prefixed with its byte offset.
    pub fn disassemble(&self) -> String {
        let mut reader = self.reader();
        let mut text = String::new();
        while !reader.at_end() {
            match reader.next_instruction() {
                Ok((offset, instruction)) => {
                    let _ = writeln!(text, "{offset:>6}: {instruction}");
                    if instruction == Instruction::End {
                        break;
                    }
                }
                Err(err) => {
                    let _ = writeln!(text, "<{err}>");
                    break;
                }
            }
        }
        text
    }
}

/// Cursor decoding instructions from a byte slice.
pub struct BytecodeReader<'a> {
    bytes: &'a [u8],
    position: usize,
    opcode: u8,
}

impl<'a> BytecodeReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            opcode: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }

    /// Decodes the instruction at the cursor and returns it with its offset.
    pub fn next_instruction(&mut self) -> Result<(usize, Instruction)> {
        let offset = self.position;
        self.opcode = 0;
        let opcode = self.u8(offset)?;
        self.opcode = opcode;
        let instruction = match opcode {
            OP_SETUP => Instruction::Setup {
                contexts: self.u32(offset)?,
                tasks: self.u32(offset)?,
                event_lists: self.u32(offset)?,
            },
            OP_CONTEXT => Instruction::Context {
                device: self.u32(offset)?,
            },
            OP_ALLOCATE => Instruction::Allocate {
                object: self.u32(offset)?,
                mode: self.u8(offset)?,
                batch: self.u64(offset)?,
            },
            OP_COPY_IN | OP_STREAM_IN | OP_COPY_OUT | OP_COPY_OUT_BLOCKING => {
                let object = self.u32(offset)?;
                let wait = self.i32(offset)?;
                let mode = self.u8(offset)?;
                let transfer_offset = self.u64(offset)?;
                let len = self.u64(offset)?;
                match opcode {
                    OP_COPY_IN => Instruction::CopyIn {
                        object,
                        wait,
                        mode,
                        offset: transfer_offset,
                        len,
                    },
                    OP_STREAM_IN => Instruction::StreamIn {
                        object,
                        wait,
                        mode,
                        offset: transfer_offset,
                        len,
                    },
                    OP_COPY_OUT => Instruction::CopyOut {
                        object,
                        wait,
                        mode,
                        offset: transfer_offset,
                        len,
                    },
                    _ => Instruction::CopyOutBlocking {
                        object,
                        wait,
                        mode,
                        offset: transfer_offset,
                        len,
                    },
                }
            }
            OP_LAUNCH => {
                let task = self.u32(offset)?;
                let count = self.u32(offset)?;
                let wait = self.i32(offset)?;
                let mode = self.u8(offset)?;
                let threads = self.u64(offset)?;
                let mut args = SmallVec::new();
                for _ in 0..count {
                    let kind = self.u8(offset)?;
                    let index = self.u32(offset)?;
                    args.push(match kind {
                        OP_PUSH_CONSTANT_ARG => LaunchArg::Constant(index),
                        OP_PUSH_REFERENCE_ARG => LaunchArg::Reference(index),
                        OP_PUSH_PARAMETER_ARG => LaunchArg::Parameter(index),
                        other => {
                            return Err(RuntimeError::malformed(
                                offset,
                                opcode,
                                format!("unknown launch argument kind {other:#04x}"),
                            ))
                        }
                    });
                }
                Instruction::Launch {
                    task,
                    wait,
                    mode,
                    threads,
                    args,
                }
            }
            OP_READ_HOST => Instruction::ReadHost {
                object: self.u32(offset)?,
                wait: self.i32(offset)?,
                mode: self.u8(offset)?,
            },
            OP_BARRIER => Instruction::Barrier {
                wait: self.i32(offset)?,
                mode: self.u8(offset)?,
            },
            OP_ADD_DEPENDENCY => Instruction::AddDependency {
                list: self.u32(offset)?,
            },
            OP_END => Instruction::End,
            other => {
                return Err(RuntimeError::malformed(offset, other, "unknown opcode"));
            }
        };
        Ok((offset, instruction))
    }

    fn take<const N: usize>(&mut self, offset: usize) -> Result<[u8; N]> {
        let end = self.position + N;
        let bytes = self.bytes.get(self.position..end).ok_or_else(|| {
            RuntimeError::malformed(
                offset,
                self.opcode,
                format!("truncated operand at byte {}", self.position),
            )
        })?;
        self.position = end;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    fn u8(&mut self, offset: usize) -> Result<u8> {
        Ok(self.take::<1>(offset)?[0])
    }

    fn u32(&mut self, offset: usize) -> Result<u32> {
        self.take(offset).map(u32::from_le_bytes)
    }

    fn i32(&mut self, offset: usize) -> Result<i32> {
        self.take(offset).map(i32::from_le_bytes)
    }

    fn u64(&mut self, offset: usize) -> Result<u64> {
        self.take(offset).map(u64::from_le_bytes)
    }
}
