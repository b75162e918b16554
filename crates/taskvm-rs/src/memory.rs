//! Per (object, device) residency bookkeeping.
//!
//! Every object referenced by a compiled graph owns one [`GlobalObjectState`], which in turn
//! holds one [`DeviceObjectState`] per device the object has been placed on. The interpreter
//! is the only writer; devices only read the bound [`Buffer`] and bind new ones during
//! allocation.

use std::collections::BTreeMap;

use crate::device::DeviceIndex;

/// Device-side allocation bound to an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Buffer {
    /// Offset relative to the start of the device heap.
    pub offset: u64,
    /// Absolute device address, as written into kernel frames.
    pub address: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectStatus {
    Unallocated,
    Allocated,
    Valid,
    Modified,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceObjectState {
    buffer: Option<Buffer>,
    valid: bool,
    modified: bool,
    has_contents: bool,
}

impl DeviceObjectState {
    pub fn buffer(&self) -> Option<Buffer> {
        self.buffer
    }

    /// Binds a freshly allocated buffer. Any previous contents are gone, so the state
    /// drops back to `Allocated`.
    pub fn bind(&mut self, buffer: Buffer) {
        self.buffer = Some(buffer);
        self.valid = false;
        self.modified = false;
        self.has_contents = false;
    }

    pub fn unbind(&mut self) -> Option<Buffer> {
        self.valid = false;
        self.modified = false;
        self.has_contents = false;
        self.buffer.take()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn has_contents(&self) -> bool {
        self.has_contents
    }

    pub fn status(&self) -> ObjectStatus {
        match (self.buffer.is_some(), self.valid, self.modified) {
            (false, _, _) => ObjectStatus::Unallocated,
            (true, false, _) => ObjectStatus::Allocated,
            (true, true, false) => ObjectStatus::Valid,
            (true, true, true) => ObjectStatus::Modified,
        }
    }

    pub fn needs_transfer(&self) -> bool {
        !self.valid
    }

    pub fn mark_valid(&mut self) {
        self.valid = true;
        self.modified = false;
        self.has_contents = true;
    }

    pub fn mark_modified(&mut self) {
        self.valid = true;
        self.modified = true;
        self.has_contents = true;
    }

    /// Device contents were copied back to the host.
    pub fn mark_synced(&mut self) {
        self.modified = false;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.modified = false;
        self.has_contents = false;
    }
}

/// All device placements of one object, plus the device holding the newest copy.
#[derive(Clone, Debug, Default)]
pub struct GlobalObjectState {
    owner: Option<DeviceIndex>,
    devices: BTreeMap<DeviceIndex, DeviceObjectState>,
}

impl GlobalObjectState {
    pub fn owner(&self) -> Option<DeviceIndex> {
        self.owner
    }

    pub fn device(&self, device: DeviceIndex) -> Option<&DeviceObjectState> {
        self.devices.get(&device)
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceIndex, &DeviceObjectState)> {
        self.devices.iter().map(|(device, state)| (*device, state))
    }
}

#[derive(Debug, Default)]
pub struct ObjectStateTracker {
    objects: Vec<GlobalObjectState>,
}

impl ObjectStateTracker {
    pub fn new(num_objects: usize) -> Self {
        Self {
            objects: vec![GlobalObjectState::default(); num_objects],
        }
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn object(&self, object: usize) -> Option<&GlobalObjectState> {
        self.objects.get(object)
    }

    pub fn state(&self, object: usize, device: DeviceIndex) -> Option<&DeviceObjectState> {
        self.objects.get(object)?.devices.get(&device)
    }

    pub fn state_mut(
        &mut self,
        object: usize,
        device: DeviceIndex,
    ) -> Option<&mut DeviceObjectState> {
        self.objects.get_mut(object)?.devices.get_mut(&device)
    }

    /// Returns the record for `(object, device)`, creating an unallocated one on first
    /// reference.
    pub fn ensure_allocated(&mut self, object: usize, device: DeviceIndex) -> &mut DeviceObjectState {
        if object >= self.objects.len() {
            self.objects.resize_with(object + 1, GlobalObjectState::default);
        }
        self.objects[object].devices.entry(device).or_default()
    }

    /// Whether a host-to-device transfer is required before `object` can be read on `device`.
    pub fn ensure_present(&mut self, object: usize, device: DeviceIndex) -> bool {
        self.ensure_allocated(object, device).needs_transfer()
    }

    pub fn mark_valid(&mut self, object: usize, device: DeviceIndex) {
        self.ensure_allocated(object, device).mark_valid();
    }

    /// A kernel on `device` wrote the object: that copy becomes the owner and every other
    /// placement is stale.
    pub fn mark_modified(&mut self, object: usize, device: DeviceIndex) {
        self.ensure_allocated(object, device).mark_modified();
        let global = &mut self.objects[object];
        global.owner = Some(device);
        for (other, state) in global.devices.iter_mut() {
            if *other != device {
                state.invalidate();
            }
        }
    }

    pub fn mark_synced(&mut self, object: usize, device: DeviceIndex) {
        if let Some(state) = self.state_mut(object, device) {
            state.mark_synced();
        }
        if let Some(global) = self.objects.get_mut(object) {
            if global.owner == Some(device) {
                global.owner = None;
            }
        }
    }

    pub fn invalidate(&mut self, object: usize, device: DeviceIndex) {
        if let Some(state) = self.state_mut(object, device) {
            state.invalidate();
        }
    }

    /// Invalidates every placement of every object, e.g. after the host rewrote inputs.
    pub fn invalidate_all(&mut self) {
        for global in &mut self.objects {
            global.owner = None;
            for state in global.devices.values_mut() {
                state.invalidate();
            }
        }
    }

    /// Removes the record for `(object, device)`. The caller releases the returned buffer.
    pub fn detach(&mut self, object: usize, device: DeviceIndex) -> Option<DeviceObjectState> {
        let global = self.objects.get_mut(object)?;
        if global.owner == Some(device) {
            global.owner = None;
        }
        global.devices.remove(&device)
    }

    /// Object indices with a record on `device`.
    pub fn objects_on(&self, device: DeviceIndex) -> Vec<usize> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, global)| global.devices.contains_key(&device))
            .map(|(object, _)| object)
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceIndex> {
        let mut devices: Vec<_> = self
            .objects
            .iter()
            .flat_map(|global| global.devices.keys().copied())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }
}
