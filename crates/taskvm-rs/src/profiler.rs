//! Execution timers.
//!
//! The plan owns one [`TimeProfiler`]; the interpreter adds host-measured dispatch times
//! and device-measured event times to it. Results are exported as [`ProfilerResult`]
//! snapshots whose getters report zero while profiling is disabled.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfilerMode {
    #[default]
    Disabled,
    /// Collect timers; the interpreter waits on events to read device timestamps.
    Enabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProfilerType {
    Total,
    Compile,
    CodeInstall,
    CopyIn,
    CopyOut,
    KernelDispatch,
    DataTransferDispatch,
    DeviceKernel,
}

impl ProfilerType {
    pub const ALL: [ProfilerType; 8] = [
        ProfilerType::Total,
        ProfilerType::Compile,
        ProfilerType::CodeInstall,
        ProfilerType::CopyIn,
        ProfilerType::CopyOut,
        ProfilerType::KernelDispatch,
        ProfilerType::DataTransferDispatch,
        ProfilerType::DeviceKernel,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Debug, Default)]
pub struct TimeProfiler {
    mode: ProfilerMode,
    timers: [u64; 8],
    task_kernel_ns: BTreeMap<String, u64>,
}

impl TimeProfiler {
    pub fn new(mode: ProfilerMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == ProfilerMode::Enabled
    }

    pub fn mode(&self) -> ProfilerMode {
        self.mode
    }

    /// Switching modes always drops collected timers, so a disabled profiler never carries
    /// numbers from an earlier run.
    pub fn set_mode(&mut self, mode: ProfilerMode) {
        self.mode = mode;
        self.clear();
    }

    pub fn clear(&mut self) {
        self.timers = [0; 8];
        self.task_kernel_ns.clear();
    }

    pub fn add(&mut self, kind: ProfilerType, nanos: u64) {
        if self.is_enabled() {
            let slot = &mut self.timers[kind.slot()];
            *slot = slot.saturating_add(nanos);
        }
    }

    pub fn add_elapsed(&mut self, kind: ProfilerType, start: Instant) {
        self.add(kind, elapsed_ns(start));
    }

    pub fn add_task_kernel(&mut self, task: &str, nanos: u64) {
        if self.is_enabled() {
            self.add(ProfilerType::DeviceKernel, nanos);
            *self.task_kernel_ns.entry(task.to_string()).or_default() += nanos;
        }
    }

    pub fn get(&self, kind: ProfilerType) -> u64 {
        if self.is_enabled() {
            self.timers[kind.slot()]
        } else {
            0
        }
    }

    pub fn result(&self) -> ProfilerResult {
        if !self.is_enabled() {
            return ProfilerResult::default();
        }
        ProfilerResult {
            enabled: true,
            timers: ProfilerType::ALL
                .iter()
                .map(|kind| (*kind, self.timers[kind.slot()]))
                .collect(),
            task_kernel_ns: self.task_kernel_ns.clone(),
        }
    }
}

pub(crate) fn elapsed_ns(start: Instant) -> u64 {
    let nanos = start.elapsed().as_nanos();
    nanos.min(u128::from(u64::MAX)) as u64
}

/// Timings of one execution. Every getter returns zero when profiling was disabled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerResult {
    enabled: bool,
    timers: BTreeMap<ProfilerType, u64>,
    task_kernel_ns: BTreeMap<String, u64>,
}

impl ProfilerResult {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn timer(&self, kind: ProfilerType) -> u64 {
        self.timers.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_time(&self) -> u64 {
        self.timer(ProfilerType::Total)
    }

    pub fn compile_time(&self) -> u64 {
        self.timer(ProfilerType::Compile)
    }

    pub fn install_time(&self) -> u64 {
        self.timer(ProfilerType::CodeInstall)
    }

    pub fn device_write_time(&self) -> u64 {
        self.timer(ProfilerType::CopyIn)
    }

    pub fn device_read_time(&self) -> u64 {
        self.timer(ProfilerType::CopyOut)
    }

    pub fn data_transfers_time(&self) -> u64 {
        self.device_write_time()
            .saturating_add(self.device_read_time())
    }

    pub fn dispatch_time(&self) -> u64 {
        self.timer(ProfilerType::KernelDispatch)
    }

    pub fn data_transfer_dispatch_time(&self) -> u64 {
        self.timer(ProfilerType::DataTransferDispatch)
    }

    pub fn device_kernel_time(&self) -> u64 {
        self.timer(ProfilerType::DeviceKernel)
    }

    pub fn task_kernel_time(&self, task: &str) -> u64 {
        self.task_kernel_ns.get(task).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
