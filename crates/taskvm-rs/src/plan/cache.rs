//! Compiled-program cache keyed by graph identity and device assignment.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

use crate::compiler::CompiledGraph;
use crate::device::DeviceIndex;
use crate::error::{Result, RuntimeError};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV1A_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV1A_PRIME)
    })
}

fn hash_serializable<T: Serialize>(value: &T) -> Result<u64> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| RuntimeError::InvalidArgument(format!("cannot hash value: {err}")))?;
    Ok(fnv1a_hash(&bytes))
}

/// A compiled program is valid for exactly one graph snapshot under one task-to-device
/// assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub graph_id: u64,
    pub assignment_hash: u64,
}

impl ProgramKey {
    pub fn new(graph_id: u64, assignment: &[DeviceIndex]) -> Result<Self> {
        Ok(Self {
            graph_id,
            assignment_hash: hash_serializable(&assignment)?,
        })
    }
}

pub struct ProgramCache {
    entries: LruCache<ProgramKey, Arc<CompiledGraph>>,
    hits: u64,
    misses: u64,
}

impl ProgramCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: &ProgramKey) -> Option<Arc<CompiledGraph>> {
        match self.entries.get(key) {
            Some(compiled) => {
                self.hits += 1;
                Some(Arc::clone(compiled))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: ProgramKey, compiled: Arc<CompiledGraph>) {
        self.entries.put(key, compiled);
    }

    pub fn resize(&mut self, capacity: usize) {
        self.entries
            .resize(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl std::fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn key_depends_on_assignment() {
        let a = ProgramKey::new(7, &[DeviceIndex(0), DeviceIndex(0)]).unwrap();
        let b = ProgramKey::new(7, &[DeviceIndex(0), DeviceIndex(1)]).unwrap();
        let c = ProgramKey::new(7, &[DeviceIndex(0), DeviceIndex(0)]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, ProgramKey::new(8, &[DeviceIndex(0), DeviceIndex(0)]).unwrap());
    }
}
