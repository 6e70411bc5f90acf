//! # Final pool allocator
//!
//! A binary buddy allocator over the donated pool whose free lists are
//! threaded through the vmemmap. Every page carries a reference count; a
//! block returns to its free list when the count of its head page drops to
//! zero, merging with free buddies on the way.
//!
//! ```text
//! order 2: [ 0 1 2 3 ]          alloc_page(0) splits down:
//! order 1: [ 0 1 ][ 2 3 ]       -> 0 handed out,
//! order 0: [0][1][2][3]            1 and [2 3] back on their lists
//! ```

use crate::error::AllocError;
use crate::vmemmap::{NO_PAGE, PageDescriptor, Vmemmap};
use hyp_info::memory::{MAX_ORDER, PAGE_SIZE};
use hyp_memory_addresses::{Pfn, PhysRange, PhysicalAddress, PhysicalPage, Size4K};
use hyp_pgtable::{FrameAlloc, PgtableError};

const ORDERS: usize = MAX_ORDER as usize;

/// Refcounted buddy allocator over `[first_pfn, first_pfn + n_pages)`.
pub struct HypPool<'a> {
    vmemmap: Vmemmap<'a>,
    free_area: [u32; ORDERS],
    range: PhysRange,
    /// Vmemmap index of the first pool page.
    base_idx: usize,
    max_order: u8,
    free_pages: u64,
}

impl<'a> HypPool<'a> {
    /// Take over the pool.
    ///
    /// The first `reserved` pages (already handed out by the early allocator)
    /// keep one reference each; the rest are put on the free lists.
    ///
    /// # Errors
    /// [`AllocError::InvalidArgument`] if the pool is not entirely memory
    /// tracked by `vmemmap`, or `reserved > n_pages`.
    pub fn init(
        vmemmap: Vmemmap<'a>,
        first_pfn: Pfn,
        n_pages: u64,
        reserved: u64,
    ) -> Result<Self, AllocError> {
        if reserved > n_pages {
            return Err(AllocError::InvalidArgument("more reserved pages than pool pages"));
        }
        let start = first_pfn
            .checked_phys()
            .ok_or(AllocError::InvalidArgument("pool pfn"))?;
        let range = PhysRange::from_pages(start, n_pages)
            .filter(|r| !r.is_empty())
            .ok_or(AllocError::InvalidArgument("pool size"))?;
        let base_idx = vmemmap
            .index_of(start)
            .ok_or(AllocError::InvalidArgument("pool outside memory"))?;
        let last = range
            .end()
            .checked_sub(PAGE_SIZE)
            .and_then(|pa| vmemmap.index_of(pa));
        if last != Some(base_idx + n_pages as usize - 1) {
            return Err(AllocError::InvalidArgument("pool spans memory regions"));
        }

        // Largest order whose blocks can still fit in the pool.
        let max_order = (u64::BITS - n_pages.leading_zeros()).min(u32::from(MAX_ORDER)) as u8;

        let mut pool = Self {
            vmemmap,
            free_area: [NO_PAGE; ORDERS],
            range,
            base_idx,
            max_order,
            free_pages: 0,
        };
        for i in 0..n_pages as usize {
            let d = pool.vmemmap.get_mut(base_idx + i);
            d.refcount = 1;
            d.order = 0;
            d.meta.set_free(false);
            d.next = NO_PAGE;
            d.prev = NO_PAGE;
        }
        for i in reserved..n_pages {
            let pa = PhysicalAddress::new(start.as_u64() + i * PAGE_SIZE);
            pool.put_page(pa)?;
        }
        log::debug!(
            "pool {:?}: {} pages, {reserved} reserved, max order {max_order}",
            pool.range,
            n_pages
        );
        Ok(pool)
    }

    #[must_use]
    pub const fn range(&self) -> PhysRange {
        self.range
    }

    /// Pages currently on the free lists.
    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.free_pages
    }

    #[must_use]
    pub const fn vmemmap(&self) -> &Vmemmap<'a> {
        &self.vmemmap
    }

    pub const fn vmemmap_mut(&mut self) -> &mut Vmemmap<'a> {
        &mut self.vmemmap
    }

    /// Allocate a block of `1 << order` pages with a reference count of one.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no block of at least `order` is free,
    /// [`AllocError::InvalidArgument`] for orders the pool cannot serve.
    pub fn alloc_page(&mut self, order: u8) -> Result<PhysicalPage<Size4K>, AllocError> {
        if order >= self.max_order {
            return Err(AllocError::InvalidArgument("order"));
        }
        let mut i = order;
        while i < self.max_order && self.free_area[usize::from(i)] == NO_PAGE {
            i += 1;
        }
        if i == self.max_order {
            return Err(AllocError::OutOfMemory);
        }

        let idx = self.free_area[usize::from(i)];
        self.remove(idx, i);
        while i > order {
            i -= 1;
            let buddy = idx + (1 << i);
            self.desc_mut(buddy).order = i;
            self.push(buddy, i);
        }

        let d = self.desc_mut(idx);
        d.order = order;
        d.refcount = 1;
        d.meta.set_free(false);
        self.free_pages -= 1 << order;
        self.address(idx).map(|pa| pa.page())
    }

    /// Take a reference on the page containing `pa`.
    ///
    /// Works for any tracked page, not just pool pages.
    ///
    /// # Errors
    /// [`AllocError::NotTracked`] or [`AllocError::RefcountOverflow`].
    pub fn get_page(&mut self, pa: PhysicalAddress) -> Result<(), AllocError> {
        let d = self.vmemmap.descriptor_mut(pa)?;
        d.refcount = d
            .refcount
            .checked_add(1)
            .ok_or(AllocError::RefcountOverflow(pa))?;
        Ok(())
    }

    /// Drop a reference; a pool block whose count reaches zero is freed.
    ///
    /// # Errors
    /// [`AllocError::NotTracked`] or [`AllocError::RefcountUnderflow`].
    pub fn put_page(&mut self, pa: PhysicalAddress) -> Result<(), AllocError> {
        let idx = self.vmemmap.index_of(pa).ok_or(AllocError::NotTracked(pa))?;
        let d = self.vmemmap.get_mut(idx);
        d.refcount = d
            .refcount
            .checked_sub(1)
            .ok_or(AllocError::RefcountUnderflow(pa.align_down::<Size4K>()))?;
        if d.refcount == 0 && self.range.contains(pa) {
            self.attach(self.to_pool(idx));
        }
        Ok(())
    }

    /// Reference count of the page containing `pa`.
    ///
    /// # Errors
    /// [`AllocError::NotTracked`].
    pub fn page_count(&self, pa: PhysicalAddress) -> Result<u16, AllocError> {
        Ok(self.vmemmap.descriptor(pa)?.refcount)
    }

    /// Return a block to the free lists, merging it with free buddies.
    fn attach(&mut self, mut idx: u32) {
        let mut order = self.vmemmap.get(self.from_pool(idx)).order;
        self.free_pages += 1 << order;
        while order + 1 < self.max_order {
            let Some(buddy) = self.free_buddy(idx, order) else {
                break;
            };
            self.remove(buddy, order);
            idx = idx.min(buddy);
            order += 1;
        }
        self.desc_mut(idx).order = order;
        self.push(idx, order);
    }

    /// The buddy of `idx` at `order`, if it heads a free block of that order.
    fn free_buddy(&self, idx: u32, order: u8) -> Option<u32> {
        let buddy = idx ^ (1 << order);
        if u64::from(buddy) + (1 << order) > self.range.page_count() {
            return None;
        }
        let d = self.vmemmap.get(self.from_pool(buddy));
        (d.meta.free() && d.order == order).then_some(buddy)
    }

    // Free lists are indexed by pool-relative page index so that buddy
    // arithmetic is a single XOR.

    fn push(&mut self, idx: u32, order: u8) {
        let head = self.free_area[usize::from(order)];
        if head != NO_PAGE {
            self.desc_mut(head).prev = idx;
        }
        let d = self.desc_mut(idx);
        d.next = head;
        d.prev = NO_PAGE;
        d.meta.set_free(true);
        self.free_area[usize::from(order)] = idx;
    }

    fn remove(&mut self, idx: u32, order: u8) {
        let (next, prev) = {
            let d = self.desc_mut(idx);
            d.meta.set_free(false);
            let links = (d.next, d.prev);
            d.next = NO_PAGE;
            d.prev = NO_PAGE;
            links
        };
        if prev == NO_PAGE {
            self.free_area[usize::from(order)] = next;
        } else {
            self.desc_mut(prev).next = next;
        }
        if next != NO_PAGE {
            self.desc_mut(next).prev = prev;
        }
    }

    fn desc_mut(&mut self, idx: u32) -> &mut PageDescriptor {
        let v = self.from_pool(idx);
        self.vmemmap.get_mut(v)
    }

    const fn from_pool(&self, idx: u32) -> usize {
        self.base_idx + idx as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn to_pool(&self, vmemmap_idx: usize) -> u32 {
        (vmemmap_idx - self.base_idx) as u32
    }

    fn address(&self, idx: u32) -> Result<PhysicalAddress, AllocError> {
        self.range
            .start()
            .checked_add(u64::from(idx) * PAGE_SIZE)
            .ok_or(AllocError::OutOfMemory)
    }
}

impl FrameAlloc for HypPool<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_page(0).ok()
    }

    fn get_page(&mut self, pa: PhysicalAddress) -> Result<(), PgtableError> {
        Ok(Self::get_page(self, pa)?)
    }

    fn put_page(&mut self, pa: PhysicalAddress) -> Result<(), PgtableError> {
        Ok(Self::put_page(self, pa)?)
    }

    fn page_count(&self, pa: PhysicalAddress) -> u32 {
        Self::page_count(self, pa).map_or(0, u32::from)
    }
}


#[cfg(test)]
mod fuzz {
    use super::*;
    use crate::vmemmap::PageDescriptor;
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    const BASE: u64 = 0x4000_0000;

    fn memory(pages: u64) -> [PhysRange; 1] {
        [PhysRange::from_pages(PhysicalAddress::new(BASE), pages).unwrap()]
    }

    fn pa(page: u64) -> PhysicalAddress {
        PhysicalAddress::new(BASE + page * PAGE_SIZE)
    }

    /// Random pool geometry for reservation conservation.
    #[derive(Clone, Debug)]
    struct PoolShape {
        pages: u64,
        reserved: u64,
        orders: Vec<u8>,
    }

    impl Arbitrary for PoolShape {
        fn arbitrary(g: &mut Gen) -> Self {
            let pages = u64::arbitrary(g) % 300 + 1;
            let reserved = u64::arbitrary(g) % (pages + 1);
            let orders = (0..8).map(|_| u8::arbitrary(g) % 3).collect();
            Self { pages, reserved, orders }
        }
    }

    #[test]
    fn exhausting_the_pool_yields_exactly_the_unreserved_pages() {
        fn prop(shape: PoolShape) -> bool {
            let memory = memory(shape.pages);
            let mut backing = vec![PageDescriptor::INIT; shape.pages as usize];
            let Ok(vmemmap) = Vmemmap::new(&mut backing, &memory) else {
                return false;
            };
            let Ok(mut pool) = HypPool::init(vmemmap, pa(0).pfn(), shape.pages, shape.reserved)
            else {
                return false;
            };

            // A few higher-order blocks first, then single pages until empty.
            let mut handed_out = 0u64;
            for &order in &shape.orders {
                if let Ok(p) = pool.alloc_page(order) {
                    handed_out += 1 << order;
                    if p.base() < pa(shape.reserved) {
                        return false;
                    }
                }
            }
            while pool.alloc_page(0).is_ok() {
                handed_out += 1;
            }
            pool.alloc_page(0) == Err(AllocError::OutOfMemory)
                && handed_out == shape.pages - shape.reserved
                && pool.free_pages() == 0
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(PoolShape) -> bool);
    }

    #[test]
    fn freeing_everything_restores_the_free_count() {
        fn prop(shape: PoolShape) -> bool {
            let memory = memory(shape.pages);
            let mut backing = vec![PageDescriptor::INIT; shape.pages as usize];
            let Ok(vmemmap) = Vmemmap::new(&mut backing, &memory) else {
                return false;
            };
            let Ok(mut pool) = HypPool::init(vmemmap, pa(0).pfn(), shape.pages, shape.reserved)
            else {
                return false;
            };
            let before = pool.free_pages();
            let mut held = Vec::new();
            while let Ok(p) = pool.alloc_page(0) {
                held.push(p);
            }
            held.iter().all(|p| pool.put_page(p.base()).is_ok()) && pool.free_pages() == before
        }
        QuickCheck::new()
            .tests(100)
            .quickcheck(prop as fn(PoolShape) -> bool);
    }
}
