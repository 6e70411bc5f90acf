//! Table of guest VMs, carved from the pool during bootstrap.
//!
//! Readers (hypercalls looking up a VM by handle) take the lock shared;
//! creation and teardown take it exclusively.

use crate::error::Error;
use hyp_info::memory::{MAX_VMS, VM_HANDLE_OFFSET};
use hyp_memory_addresses::PhysicalAddress;
use hyp_sync::RwSpinLock;

/// Host-visible name of a VM: its slot index plus [`VM_HANDLE_OFFSET`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmHandle(u32);

impl VmHandle {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    fn slot(self) -> Option<usize> {
        let idx = self.0.checked_sub(VM_HANDLE_OFFSET)? as usize;
        (idx < MAX_VMS).then_some(idx)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn from_slot(idx: usize) -> Self {
        Self(idx as u32 + VM_HANDLE_OFFSET)
    }
}

/// What the guardian keeps about a VM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Root of the VM's stage-2 table.
    pub pgd: PhysicalAddress,
    pub nr_vcpus: u32,
}

/// One slot as laid out in the carved pages.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VmSlot {
    pgd: u64,
    nr_vcpus: u32,
    in_use: u32,
}

const _: () = assert!(size_of::<VmSlot>() == 16);

impl VmSlot {
    const fn info(&self) -> Option<VmInfo> {
        if self.in_use == 0 {
            return None;
        }
        Some(VmInfo {
            pgd: PhysicalAddress::new(self.pgd),
            nr_vcpus: self.nr_vcpus,
        })
    }
}

pub struct VmTable<'a> {
    slots: RwSpinLock<&'a mut [VmSlot]>,
}

impl<'a> VmTable<'a> {
    /// Clear `slots` and use the first [`MAX_VMS`] of them.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if fewer than [`MAX_VMS`] slots are given.
    pub fn init(slots: &'a mut [VmSlot]) -> Result<Self, Error> {
        let slots = slots.get_mut(..MAX_VMS).ok_or(Error::InvalidArgument)?;
        slots.fill(VmSlot::default());
        Ok(Self {
            slots: RwSpinLock::new(slots),
        })
    }

    /// Store `vm` in the first free slot.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] when all slots are taken.
    pub fn insert(&self, vm: VmInfo) -> Result<VmHandle, Error> {
        let mut slots = self.slots.write();
        let idx = slots
            .iter()
            .position(|s| s.in_use == 0)
            .ok_or(Error::OutOfMemory)?;
        slots[idx] = VmSlot {
            pgd: vm.pgd.as_u64(),
            nr_vcpus: vm.nr_vcpus,
            in_use: 1,
        };
        let handle = VmHandle::from_slot(idx);
        log::debug!("vm {handle:?} created with {} vcpus", vm.nr_vcpus);
        Ok(handle)
    }

    #[must_use]
    pub fn get(&self, handle: VmHandle) -> Option<VmInfo> {
        let idx = handle.slot()?;
        self.slots.read()[idx].info()
    }

    /// # Errors
    /// [`Error::InvalidArgument`] for a handle that names no VM.
    pub fn remove(&self, handle: VmHandle) -> Result<VmInfo, Error> {
        let idx = handle.slot().ok_or(Error::InvalidArgument)?;
        let mut slots = self.slots.write();
        let info = slots[idx].info().ok_or(Error::InvalidArgument)?;
        slots[idx] = VmSlot::default();
        Ok(info)
    }

    /// Number of live VMs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.in_use != 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(n: u32) -> VmInfo {
        VmInfo {
            pgd: PhysicalAddress::new(0x4000_0000 + u64::from(n) * 0x1000),
            nr_vcpus: n,
        }
    }

    #[test]
    fn handles_start_at_the_offset() {
        let mut slots = vec![VmSlot::default(); MAX_VMS];
        let table = VmTable::init(&mut slots).unwrap();
        let a = table.insert(vm(1)).unwrap();
        let b = table.insert(vm(2)).unwrap();
        assert_eq!(a.as_u32(), VM_HANDLE_OFFSET);
        assert_eq!(b.as_u32(), VM_HANDLE_OFFSET + 1);
        assert_eq!(table.get(b), Some(vm(2)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut slots = vec![VmSlot::default(); MAX_VMS + 3];
        let table = VmTable::init(&mut slots).unwrap();
        let a = table.insert(vm(1)).unwrap();
        table.insert(vm(2)).unwrap();
        assert_eq!(table.remove(a), Ok(vm(1)));
        assert_eq!(table.get(a), None);
        assert_eq!(table.remove(a), Err(Error::InvalidArgument));
        assert_eq!(table.insert(vm(3)), Ok(a));
    }

    #[test]
    fn full_table_and_foreign_handles() {
        let mut slots = vec![VmSlot::default(); MAX_VMS];
        let table = VmTable::init(&mut slots).unwrap();
        for n in 0..MAX_VMS {
            table.insert(vm(u32::try_from(n).unwrap())).unwrap();
        }
        assert_eq!(table.insert(vm(0)), Err(Error::OutOfMemory));
        assert_eq!(table.get(VmHandle::new(0)), None);
        assert_eq!(table.get(VmHandle::new(VM_HANDLE_OFFSET + MAX_VMS as u32)), None);
        assert_eq!(table.remove(VmHandle::new(7)), Err(Error::InvalidArgument));
    }

    #[test]
    fn too_few_slots_are_rejected() {
        let mut slots = vec![VmSlot::default(); MAX_VMS - 1];
        assert!(VmTable::init(&mut slots).is_err());
    }
}
