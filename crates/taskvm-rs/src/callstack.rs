//! Kernel argument frames.
//!
//! Layout, in 8-byte little-endian slots:
//!
//! | slot | contents                      |
//! |------|-------------------------------|
//! | 0    | return value                  |
//! | 1    | deoptimization / error code   |
//! | 2    | frame base address            |
//! | 3    | declared argument count       |
//! | 4..  | one slot per argument         |
//!
//! Arguments are either inline primitives widened to 8 bytes or absolute device buffer
//! addresses.

use serde::Serialize;

use crate::device::DeviceIndex;
use crate::object::Constant;

pub const HEADER_SLOTS: usize = 4;
pub const SLOT_BYTES: usize = 8;

const RETURN_SLOT: usize = 0;
const DEOPT_SLOT: usize = 1;
const FRAME_BASE_SLOT: usize = 2;
const ARG_COUNT_SLOT: usize = 3;

#[derive(Clone, Debug)]
pub struct CallStack {
    slots: Vec<u64>,
    declared_args: usize,
    device: DeviceIndex,
    on_device: bool,
    stats: KernelStats,
}

impl CallStack {
    pub fn new(declared_args: usize, device: DeviceIndex) -> Self {
        let mut stack = Self {
            slots: Vec::with_capacity(HEADER_SLOTS + declared_args),
            declared_args,
            device,
            on_device: false,
            stats: KernelStats::default(),
        };
        stack.reset();
        stack
    }

    /// Clears every argument and the header, keeping profiling counters.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.slots.resize(HEADER_SLOTS, 0);
        self.slots[ARG_COUNT_SLOT] = self.declared_args as u64;
        self.on_device = false;
    }

    pub fn push_value(&mut self, value: Constant) {
        self.slots.push(value.to_slot());
    }

    pub fn push_address(&mut self, address: u64) {
        self.slots.push(address);
    }

    /// Overwrites argument `arg` in place. Used for call parameters whose values may change
    /// between invocations of an otherwise unchanged frame.
    pub fn set_arg(&mut self, arg: usize, value: u64) -> bool {
        match self.slots.get_mut(HEADER_SLOTS + arg) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn set_frame_base(&mut self, address: u64) {
        self.slots[FRAME_BASE_SLOT] = address;
    }

    pub fn return_value(&self) -> u64 {
        self.slots[RETURN_SLOT]
    }

    pub fn deopt_code(&self) -> u64 {
        self.slots[DEOPT_SLOT]
    }

    pub fn frame_base(&self) -> u64 {
        self.slots[FRAME_BASE_SLOT]
    }

    /// Declared number of arguments, as stored in the header.
    pub fn arg_count(&self) -> usize {
        self.slots[ARG_COUNT_SLOT] as usize
    }

    /// Number of argument slots pushed so far.
    pub fn pushed_args(&self) -> usize {
        self.slots.len() - HEADER_SLOTS
    }

    pub fn arg(&self, index: usize) -> Option<u64> {
        self.slots.get(HEADER_SLOTS + index).copied()
    }

    pub fn args(&self) -> &[u64] {
        &self.slots[HEADER_SLOTS..]
    }

    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// The frame as it would be copied to device memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.slots
            .iter()
            .flat_map(|slot| slot.to_le_bytes())
            .collect()
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn is_on_device(&self) -> bool {
        self.on_device
    }

    /// Marks the frame complete; later launches reuse it without pushing arguments again.
    pub fn mark_on_device(&mut self) {
        self.on_device = true;
    }

    pub fn stats(&self) -> &KernelStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut KernelStats {
        &mut self.stats
    }
}

/// Launch latency statistics for one task, updated with Welford's online algorithm.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct KernelStats {
    invocations: u64,
    min_ns: u64,
    max_ns: u64,
    mean_ns: f64,
    m2: f64,
}

impl KernelStats {
    pub fn record(&mut self, latency_ns: u64) {
        self.invocations += 1;
        if self.invocations == 1 {
            self.min_ns = latency_ns;
            self.max_ns = latency_ns;
        } else {
            self.min_ns = self.min_ns.min(latency_ns);
            self.max_ns = self.max_ns.max(latency_ns);
        }
        let sample = latency_ns as f64;
        let delta = sample - self.mean_ns;
        self.mean_ns += delta / self.invocations as f64;
        self.m2 += delta * (sample - self.mean_ns);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn min_ns(&self) -> u64 {
        self.min_ns
    }

    pub fn max_ns(&self) -> u64 {
        self.max_ns
    }

    pub fn mean_ns(&self) -> f64 {
        self.mean_ns
    }

    /// Population standard deviation.
    pub fn stddev_ns(&self) -> f64 {
        if self.invocations < 2 {
            return 0.0;
        }
        (self.m2 / self.invocations as f64).sqrt()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
