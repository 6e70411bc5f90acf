//! # Host-to-Guardian Boot Interface
//!
//! Everything the host passes to the guardian's entry call. The host is not
//! trusted, so [`BootParams::validate`] checks every value before any memory
//! is touched.

use crate::memory::{MAX_VA_BITS, MIN_VA_BITS, PAGE_SIZE, PRIVATE_VA_SIZE};
use hyp_memory_addresses::{PhysRange, PhysicalAddress, Size4K, VirtRange, VirtualAddress};

/// Per-CPU bootstrap parameters.
///
/// `base` and `stack_pa` are inputs from the host. `stack_hyp_va` and
/// `pgd_pa` are written by bootstrap and consumed by the trampoline that
/// moves each CPU onto the finalized page table.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PerCpuParams {
    /// Physical base of this CPU's per-CPU data region.
    pub base: PhysicalAddress,
    /// Physical address of the page the host set aside for this CPU's stack.
    pub stack_pa: PhysicalAddress,
    /// Top of the stack in guardian VA (output).
    pub stack_hyp_va: VirtualAddress,
    /// Root of the guardian page table (output).
    pub pgd_pa: PhysicalAddress,
}

/// Physical layout of the guardian image and the ranges it maps at boot.
#[derive(Debug, Copy, Clone)]
pub struct GuardianImage<'a> {
    pub text: PhysRange,
    pub rodata: PhysRange,
    pub data: PhysRange,
    pub bss: PhysRange,
    /// Boot-transition code that must stay executable at VA == PA while the
    /// new table root is installed.
    pub idmap: PhysRange,
    /// Host-owned ranges the guardian reads (host lends them read-only).
    pub host_shared: &'a [PhysRange],
    /// Firmware image whose ownership moves from host to guardian.
    pub firmware: Option<PhysRange>,
}

/// Fixed description of the machine, known before the entry call.
#[derive(Debug, Copy, Clone)]
pub struct Platform<'a> {
    /// Every range of RAM the host reported. Ownership is tracked per page of these.
    pub memory: &'a [PhysRange],
    pub image: GuardianImage<'a>,
    /// Ranges that must become inaccessible to the host (e.g. confidential VM memory).
    pub protected: &'a [PhysRange],
    /// Guardian VA of a physical address is `pa + linear_map_offset`.
    pub linear_map_offset: u64,
    /// Start of the private VA window (stacks).
    pub private_va_base: VirtualAddress,
    /// Size of each CPU's per-CPU data region in bytes.
    pub per_cpu_size: u64,
}

/// Arguments of the entry call.
///
/// `per_cpu` is only borrowed for the entry call itself, while the platform
/// description outlives it.
#[derive(Debug)]
pub struct BootParams<'a, 'c> {
    pub phys_base: PhysicalAddress,
    pub size: u64,
    pub cpu_count: usize,
    pub per_cpu: &'c mut [PerCpuParams],
    pub va_bits: u8,
    pub platform: Platform<'a>,
}

/// Reasons the entry call refuses its arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootParamsError {
    #[error("pool base or size is not page aligned")]
    UnalignedPool,
    #[error("pool is empty or its end overflows")]
    BadPoolSize,
    #[error("cpu count {cpu_count} does not match {entries} per-CPU entries")]
    CpuCountMismatch { cpu_count: usize, entries: usize },
    #[error("{0} VA bits is outside the supported range")]
    UnsupportedVaBits(u8),
    #[error("pool is not contained in a single memory region")]
    PoolOutsideMemory,
    #[error("a memory region is empty, unaligned or overlaps another one")]
    BadMemoryRegion,
    #[error("{0} is unaligned or not addressable by the guardian")]
    BadRange(&'static str),
    #[error("per-CPU region of cpu {0} is unaligned or outside memory")]
    BadPerCpu(usize),
}

impl BootParams<'_, '_> {
    /// The donated pool as a range.
    ///
    /// # Errors
    /// Fails if the size is zero or the end overflows.
    pub fn pool(&self) -> Result<PhysRange, BootParamsError> {
        if self.size == 0 {
            return Err(BootParamsError::BadPoolSize);
        }
        PhysRange::new(self.phys_base, self.size).ok_or(BootParamsError::BadPoolSize)
    }

    /// Checks every precondition of the entry call.
    ///
    /// # Errors
    /// Returns the first violated precondition.
    pub fn validate(&self) -> Result<(), BootParamsError> {
        if !self.phys_base.is_aligned::<Size4K>() || !self.size.is_multiple_of(PAGE_SIZE) {
            return Err(BootParamsError::UnalignedPool);
        }
        let pool = self.pool()?;
        if self.cpu_count != self.per_cpu.len() || self.cpu_count == 0 {
            return Err(BootParamsError::CpuCountMismatch {
                cpu_count: self.cpu_count,
                entries: self.per_cpu.len(),
            });
        }
        if !(MIN_VA_BITS..=MAX_VA_BITS).contains(&self.va_bits) {
            return Err(BootParamsError::UnsupportedVaBits(self.va_bits));
        }

        let platform = &self.platform;
        self.validate_memory()?;
        if !platform.memory.iter().any(|r| r.contains_range(&pool)) {
            return Err(BootParamsError::PoolOutsideMemory);
        }

        let image = &platform.image;
        for (name, range) in [
            ("text", image.text),
            ("rodata", image.rodata),
            ("data", image.data),
            ("bss", image.bss),
        ] {
            self.check_linear(name, &range)?;
        }
        for range in image.host_shared {
            self.check_linear("host shared range", range)?;
        }
        if let Some(firmware) = &image.firmware {
            self.check_linear("firmware", firmware)?;
        }
        for range in platform.protected {
            if !range.is_aligned::<Size4K>() || !self.in_memory(range) {
                return Err(BootParamsError::BadRange("protected range"));
            }
        }
        if !image.idmap.is_aligned::<Size4K>() || image.idmap.end().as_u64() > self.va_limit() {
            return Err(BootParamsError::BadRange("idmap"));
        }
        let private = self.private_va().ok_or(BootParamsError::BadRange("private VA window"))?;
        if private.end().as_u64() > self.va_limit()
            || platform.memory.iter().any(|r| {
                self.linear_range(r)
                    .is_none_or(|linear| linear.overlaps(&private))
            })
        {
            return Err(BootParamsError::BadRange("private VA window"));
        }

        for (cpu, params) in self.per_cpu.iter().enumerate() {
            let region = PhysRange::new(params.base, platform.per_cpu_size)
                .ok_or(BootParamsError::BadPerCpu(cpu))?;
            let stack = PhysRange::from_pages(params.stack_pa, 1)
                .ok_or(BootParamsError::BadPerCpu(cpu))?;
            if !region.is_aligned::<Size4K>()
                || !stack.is_aligned::<Size4K>()
                || !self.in_memory(&region)
                || !self.in_memory(&stack)
            {
                return Err(BootParamsError::BadPerCpu(cpu));
            }
        }
        Ok(())
    }

    /// Exclusive upper bound of guardian virtual addresses.
    #[must_use]
    pub const fn va_limit(&self) -> u64 {
        1u64 << self.va_bits
    }

    /// Guardian VA range of the linear map of `range`, if it fits the VA space.
    #[must_use]
    pub fn linear_range(&self, range: &PhysRange) -> Option<VirtRange> {
        let start = range.start().as_u64().checked_add(self.platform.linear_map_offset)?;
        let r = VirtRange::new(VirtualAddress::new(start), range.size())?;
        (r.end().as_u64() <= self.va_limit()).then_some(r)
    }

    /// The private VA window.
    #[must_use]
    pub fn private_va(&self) -> Option<VirtRange> {
        VirtRange::new(self.platform.private_va_base, PRIVATE_VA_SIZE)
    }

    fn in_memory(&self, range: &PhysRange) -> bool {
        self.platform.memory.iter().any(|r| r.contains_range(range))
    }

    fn check_linear(&self, name: &'static str, range: &PhysRange) -> Result<(), BootParamsError> {
        if !range.is_aligned::<Size4K>() || !self.in_memory(range) || self.linear_range(range).is_none() {
            return Err(BootParamsError::BadRange(name));
        }
        Ok(())
    }

    fn validate_memory(&self) -> Result<(), BootParamsError> {
        let memory = self.platform.memory;
        for (i, region) in memory.iter().enumerate() {
            if region.is_empty() || !region.is_aligned::<Size4K>() || self.linear_range(region).is_none() {
                return Err(BootParamsError::BadMemoryRegion);
            }
            if memory[i + 1..].iter().any(|other| other.overlaps(region)) {
                return Err(BootParamsError::BadMemoryRegion);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn range(base: u64, size: u64) -> PhysRange {
        PhysRange::new(PhysicalAddress::new(base), size).unwrap()
    }

    fn platform(memory: &[PhysRange]) -> Platform<'_> {
        Platform {
            memory,
            image: GuardianImage {
                text: range(0x4000_0000, 0x4000),
                rodata: range(0x4000_4000, 0x2000),
                data: range(0x4000_6000, 0x1000),
                bss: range(0x4000_7000, 0x1000),
                idmap: range(0x4000_0000, 0x1000),
                host_shared: &[],
                firmware: None,
            },
            protected: &[],
            linear_map_offset: 0x80_0000_0000,
            private_va_base: VirtualAddress::new(0xC0_0000_0000),
            per_cpu_size: 0x2000,
        }
    }

    fn per_cpu() -> [PerCpuParams; 4] {
        core::array::from_fn(|cpu| PerCpuParams {
            base: PhysicalAddress::new(0x4010_0000 + cpu as u64 * 0x2000),
            stack_pa: PhysicalAddress::new(0x4020_0000 + cpu as u64 * 0x1000),
            ..PerCpuParams::default()
        })
    }

    #[test]
    fn accepts_a_well_formed_call() {
        let memory = [range(0x4000_0000, 64 * MIB)];
        let mut cpus = per_cpu();
        let params = BootParams {
            phys_base: PhysicalAddress::new(0x4100_0000),
            size: 16 * MIB,
            cpu_count: 4,
            per_cpu: &mut cpus,
            va_bits: 40,
            platform: platform(&memory),
        };
        assert_eq!(params.validate(), Ok(()));
        assert_eq!(params.pool().unwrap().page_count(), 4096);
    }

    #[test]
    fn rejects_unaligned_pool_and_cpu_mismatch() {
        let memory = [range(0x4000_0000, 64 * MIB)];
        let mut cpus = per_cpu();
        let mut params = BootParams {
            phys_base: PhysicalAddress::new(0x4100_0800),
            size: 16 * MIB,
            cpu_count: 4,
            per_cpu: &mut cpus,
            va_bits: 40,
            platform: platform(&memory),
        };
        assert_eq!(params.validate(), Err(BootParamsError::UnalignedPool));

        params.phys_base = PhysicalAddress::new(0x4100_0000);
        params.cpu_count = 3;
        assert_eq!(
            params.validate(),
            Err(BootParamsError::CpuCountMismatch {
                cpu_count: 3,
                entries: 4
            })
        );
    }

    #[test]
    fn rejects_pool_outside_memory_and_bad_va_bits() {
        let memory = [range(0x4000_0000, 64 * MIB)];
        let mut cpus = per_cpu();
        let mut params = BootParams {
            phys_base: PhysicalAddress::new(0x4400_0000),
            size: 16 * MIB,
            cpu_count: 4,
            per_cpu: &mut cpus,
            va_bits: 40,
            platform: platform(&memory),
        };
        assert_eq!(params.validate(), Err(BootParamsError::PoolOutsideMemory));

        params.phys_base = PhysicalAddress::new(0x4100_0000);
        params.va_bits = 52;
        assert_eq!(params.validate(), Err(BootParamsError::UnsupportedVaBits(52)));
    }

    #[test]
    fn rejects_private_window_overlapping_the_linear_map() {
        let memory = [range(0x4000_0000, 64 * MIB)];
        let mut cpus = per_cpu();
        let mut platform = platform(&memory);
        platform.private_va_base = VirtualAddress::new(0x80_4000_0000);
        let params = BootParams {
            phys_base: PhysicalAddress::new(0x4100_0000),
            size: 16 * MIB,
            cpu_count: 4,
            per_cpu: &mut cpus,
            va_bits: 40,
            platform,
        };
        assert_eq!(
            params.validate(),
            Err(BootParamsError::BadRange("private VA window"))
        );
    }
}
