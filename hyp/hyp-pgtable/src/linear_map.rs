use hyp_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Conversion between physical addresses and the guardian's linear map.
///
/// Every memory region is mapped at `pa + offset`. The arithmetic wraps,
/// making both directions total; callers validate that the ranges they
/// translate are linearly mapped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinearMap {
    offset: u64,
}

impl LinearMap {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// VA equals PA. Used for the host's stage-2 table, whose input addresses
    /// are the host's physical addresses.
    #[inline]
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_agree() {
        let lm = LinearMap::new(0x80_0000_0000);
        let pa = PhysicalAddress::new(0x4000_1000);
        assert_eq!(lm.phys_to_virt(pa), VirtualAddress::new(0x80_4000_1000));
        assert_eq!(lm.virt_to_phys(lm.phys_to_virt(pa)), pa);
        assert_eq!(LinearMap::identity().phys_to_virt(pa).as_u64(), pa.as_u64());
    }
}
