//! # Physical memory access
//!
//! Two [`PhysMapper`]s: [`LinearPhysMapper`] for a guardian running on its
//! linear map, and (with the `std` feature) [`SimulatedMemory`], which backs
//! a set of fake physical ranges with heap frames for tests and the host-side
//! simulator.

use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{PhysRange, PhysicalAddress};
use hyp_pgtable::{LinearMap, PhysMapper};

/// [`PhysMapper`] for code running on the linear map: `va = pa + offset`.
///
/// # Safety
/// The linear map must cover every physical address passed in, writable.
#[derive(Debug, Copy, Clone)]
pub struct LinearPhysMapper(LinearMap);

impl LinearPhysMapper {
    #[must_use]
    pub const fn new(linear: LinearMap) -> Self {
        Self(linear)
    }
}

impl PhysMapper for LinearPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.0.phys_to_virt(pa).as_u64() as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and linearly mapped.
        unsafe { &mut *va }
    }
}

/// View `len` consecutive `T`s starting at `pa`.
///
/// # Safety
/// As [`PhysMapper::phys_to_mut`], for the whole `len * size_of::<T>()` bytes.
pub unsafe fn phys_slice_mut<'a, T, M: PhysMapper>(
    mapper: &M,
    pa: PhysicalAddress,
    len: usize,
) -> &'a mut [T] {
    // SAFETY: forwarded to the caller.
    unsafe {
        let first: &mut T = mapper.phys_to_mut(pa);
        core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len)
    }
}

/// Zero every page of `range`.
///
/// # Safety
/// `range` must be mapped writable through `mapper` and not referenced elsewhere.
pub unsafe fn zero_range<M: PhysMapper>(mapper: &M, range: PhysRange) {
    for page in range.pages() {
        // SAFETY: forwarded to the caller.
        let bytes: &mut [u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(page) };
        bytes.fill(0);
    }
}

#[cfg(any(test, feature = "std"))]
pub use simulated::SimulatedMemory;

#[cfg(any(test, feature = "std"))]
mod simulated {
    use super::{PAGE_SIZE, PhysMapper, PhysRange, PhysicalAddress};
    use core::cell::UnsafeCell;
    use std::vec::Vec;

    #[repr(C, align(4096))]
    struct Frame([u8; PAGE_SIZE as usize]);

    /// Heap-backed stand-in for physical memory.
    ///
    /// Each simulated range is a contiguous vector of zeroed 4 KiB frames, so
    /// multi-page objects (the vmemmap, the VM table) can be viewed as slices.
    pub struct SimulatedMemory {
        regions: Vec<(PhysRange, Vec<UnsafeCell<Frame>>)>,
    }

    impl SimulatedMemory {
        #[must_use]
        pub fn new(ranges: &[PhysRange]) -> Self {
            let regions = ranges
                .iter()
                .map(|r| {
                    let frames = (0..r.page_count())
                        .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
                        .collect();
                    (*r, frames)
                })
                .collect();
            Self { regions }
        }

        #[must_use]
        pub fn covers(&self, pa: PhysicalAddress) -> bool {
            self.regions.iter().any(|(r, _)| r.contains(pa))
        }

        fn byte_ptr(&self, pa: PhysicalAddress) -> Option<*mut u8> {
            self.regions.iter().find(|(r, _)| r.contains(pa)).map(|(r, frames)| {
                let off = pa.as_u64() - r.start().as_u64();
                let frame = &frames[(off / PAGE_SIZE) as usize];
                // SAFETY: `off % PAGE_SIZE` stays within the frame.
                unsafe { frame.get().cast::<u8>().add((off % PAGE_SIZE) as usize) }
            })
        }
    }

    impl PhysMapper for SimulatedMemory {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let Some(ptr) = self.byte_ptr(pa) else {
                panic!("{pa:?} is not simulated memory");
            };
            // SAFETY: the caller promises `T` matches the bytes at `pa`.
            unsafe { &mut *ptr.cast::<T>() }
        }
    }
}
