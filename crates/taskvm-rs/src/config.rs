//! Runtime configuration.
//!
//! Settings are threaded explicitly through the compiler and interpreter, so plans with
//! different configurations can coexist in one process. Environment variables are only
//! consulted by [`RuntimeConfig::from_env`].

use std::env;

use serde::{Deserialize, Serialize};

use crate::profiler::ProfilerMode;

/// Default chunk size for streamed host-to-device transfers.
pub const DEFAULT_STREAM_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Default number of compiled programs retained per plan.
pub const DEFAULT_PROGRAM_CACHE_CAPACITY: usize = 16;

/// Which device-to-host copies block the issuing thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadbackBlocking {
    /// Only the final copy-out of each device context blocks; contexts without one end in
    /// a blocking barrier.
    #[default]
    LastPerContext,
    /// Every copy-out blocks.
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub readback_blocking: ReadbackBlocking,
    /// Splits single-device programs into batches of this many bytes per object; zero
    /// processes whole objects.
    pub batch_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log every interpreted instruction at `info` level.
    pub print_bytecodes: bool,
    /// Log the disassembly of each freshly compiled program.
    pub dump_program: bool,
    /// Chunk size for STREAM_IN transfers; zero disables chunking.
    pub stream_chunk_bytes: u64,
    pub program_cache_capacity: usize,
    pub profiler: ProfilerMode,
    pub compiler: CompilerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            print_bytecodes: false,
            dump_program: false,
            stream_chunk_bytes: DEFAULT_STREAM_CHUNK_BYTES,
            program_cache_capacity: DEFAULT_PROGRAM_CACHE_CAPACITY,
            profiler: ProfilerMode::Disabled,
            compiler: CompilerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `TASKVM_PRINT_BYTECODES`, `TASKVM_DUMP_PROGRAM`,
    /// `TASKVM_PROFILER`, `TASKVM_STREAM_CHUNK_BYTES` and `TASKVM_BATCH_BYTES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_flag("TASKVM_PRINT_BYTECODES") {
            config.print_bytecodes = value;
        }
        if let Some(value) = env_flag("TASKVM_DUMP_PROGRAM") {
            config.dump_program = value;
        }
        if let Some(true) = env_flag("TASKVM_PROFILER") {
            config.profiler = ProfilerMode::Enabled;
        }
        if let Some(bytes) = env_u64("TASKVM_STREAM_CHUNK_BYTES") {
            config.stream_chunk_bytes = bytes;
        }
        if let Some(bytes) = env_u64("TASKVM_BATCH_BYTES") {
            config.compiler.batch_bytes = bytes;
        }
        config
    }

    pub fn with_print_bytecodes(mut self, enabled: bool) -> Self {
        self.print_bytecodes = enabled;
        self
    }

    pub fn with_dump_program(mut self, enabled: bool) -> Self {
        self.dump_program = enabled;
        self
    }

    pub fn with_stream_chunk_bytes(mut self, bytes: u64) -> Self {
        self.stream_chunk_bytes = bytes;
        self
    }

    pub fn with_program_cache_capacity(mut self, capacity: usize) -> Self {
        self.program_cache_capacity = capacity;
        self
    }

    pub fn with_profiler(mut self, mode: ProfilerMode) -> Self {
        self.profiler = mode;
        self
    }

    pub fn with_readback_blocking(mut self, policy: ReadbackBlocking) -> Self {
        self.compiler.readback_blocking = policy;
        self
    }

    pub fn with_batch_bytes(mut self, bytes: u64) -> Self {
        self.compiler.batch_bytes = bytes;
        self
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value} should parse as true");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value} should parse as false");
        }
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"print_bytecodes": true, "compiler": {"readback_blocking": "Always"}}"#)
                .unwrap();
        assert!(config.print_bytecodes);
        assert_eq!(config.compiler.readback_blocking, ReadbackBlocking::Always);
        assert_eq!(config.stream_chunk_bytes, DEFAULT_STREAM_CHUNK_BYTES);
        assert_eq!(config.compiler.batch_bytes, 0);
    }
}
