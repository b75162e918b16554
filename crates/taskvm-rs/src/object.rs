//! Host-side data objects referenced by task graphs.
//!
//! A [`DataObject`] is a shared, fixed-size byte buffer. Graphs hold clones of the handle,
//! so the host can keep reading results from the same object after an execution.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Result, RuntimeError};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a host data object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

struct ObjectInner {
    id: ObjectId,
    elem_size: usize,
    bytes: RwLock<Vec<u8>>,
}

#[derive(Clone)]
pub struct DataObject {
    inner: Arc<ObjectInner>,
}

impl DataObject {
    pub fn from_bytes(bytes: Vec<u8>, elem_size: usize) -> Self {
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(ObjectInner {
                id,
                elem_size: elem_size.max(1),
                bytes: RwLock::new(bytes),
            }),
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values).to_vec(), 4)
    }

    pub fn from_i32(values: &[i32]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values).to_vec(), 4)
    }

    pub fn zeros_f32(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len * 4], 4)
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn byte_len(&self) -> u64 {
        self.read().len() as u64
    }

    /// Number of elements, using the element size the object was created with.
    pub fn len(&self) -> usize {
        self.read().len() / self.inner.elem_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem_size(&self) -> usize {
        self.inner.elem_size
    }

    pub fn ptr_eq(&self, other: &DataObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copies `len` bytes starting at `offset`; `len == 0` means "to the end".
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.read();
        let range = byte_range(bytes.len(), offset, len).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!(
                "read of {len} bytes at offset {offset} exceeds object {} of {} bytes",
                self.id(),
                bytes.len()
            ))
        })?;
        Ok(bytes[range].to_vec())
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self
            .inner
            .bytes
            .write()
            .expect("data object lock poisoned");
        let total = bytes.len();
        let range = byte_range(total, offset, data.len() as u64)
            .filter(|range| range.len() == data.len())
            .ok_or_else(|| {
                RuntimeError::InvalidArgument(format!(
                    "write of {} bytes at offset {offset} exceeds object {} of {total} bytes",
                    data.len(),
                    self.id(),
                ))
            })?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        bytemuck::pod_collect_to_vec(&self.read())
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        bytemuck::pod_collect_to_vec(&self.read())
    }

    pub fn copy_from_f32(&self, values: &[f32]) -> Result<()> {
        if values.len() * 4 != self.byte_len() as usize {
            return Err(RuntimeError::InvalidArgument(format!(
                "object {} holds {} bytes, got {} f32 values",
                self.id(),
                self.byte_len(),
                values.len()
            )));
        }
        self.write_bytes(0, bytemuck::cast_slice(values))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.inner.bytes.read().expect("data object lock poisoned")
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataObject")
            .field("id", &self.inner.id)
            .field("bytes", &self.byte_len())
            .finish()
    }
}

pub(crate) fn byte_range(total: usize, offset: u64, len: u64) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    if start > total {
        return None;
    }
    let end = if len == 0 {
        total
    } else {
        start.checked_add(usize::try_from(len).ok()?)?
    };
    (end <= total).then_some(start..end)
}

/// Scalar values pushed inline into a kernel frame.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Constant {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Constant {
    /// The value widened to an 8-byte frame slot.
    pub fn to_slot(self) -> u64 {
        match self {
            Constant::I32(value) => value as i64 as u64,
            Constant::I64(value) => value as u64,
            Constant::F32(value) => u64::from(value.to_bits()),
            Constant::F64(value) => value.to_bits(),
        }
    }
}
