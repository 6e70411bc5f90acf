//! # Post-bootstrap ownership transitions
//!
//! The host requests these through hypercalls once the guardian is in
//! place. Every transition checks the current owner and state of each page
//! first and refuses with [`Error::OwnershipInconsistency`] without touching
//! anything if a page is not where the transition expects it.
//!
//! ```text
//!               host_share_guardian            host_unshare_guardian
//!  host Owned  ─────────────────────► SharedOwned ─────────────────► Owned
//!
//!               host_donate_guardian           guardian_donate_host
//!  host Owned  ─────────────────────► guardian Owned ──────────────► host Owned
//! ```
//!
//! All transitions serialize on one lock covering the guardian table, the
//! pool and the host's stage-2.

use crate::error::Error;
use crate::host::HostStage2;
use crate::vm_table::VmTable;
use hyp_alloc::pool::HypPool;
use hyp_alloc::vmemmap::{OwnerId, PageDescriptor};
use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{Pfn, PhysRange, PhysicalAddress, VirtualAddress};
use hyp_pgtable::{GuardianPageTable, MapAttrs, PageState, PhysMapper, Protection};
use hyp_sync::SpinLock;

/// The guardian after a successful bootstrap.
pub struct Guardian<'a, M: PhysMapper, H> {
    state: SpinLock<State<'a, M, H>>,
    vms: VmTable<'a>,
}

struct State<'a, M: PhysMapper, H> {
    table: GuardianPageTable<'a, M>,
    pool: HypPool<'a>,
    host: H,
}

impl<'a, M: PhysMapper, H: HostStage2> Guardian<'a, M, H> {
    pub(crate) const fn new(
        table: GuardianPageTable<'a, M>,
        pool: HypPool<'a>,
        host: H,
        vms: VmTable<'a>,
    ) -> Self {
        Self {
            state: SpinLock::new(State { table, pool, host }),
            vms,
        }
    }

    /// Map a host page into the guardian; the host keeps ownership.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a pfn outside memory,
    /// [`Error::OwnershipInconsistency`] unless the host exclusively owns it.
    pub fn host_share_guardian(&self, pfn: Pfn) -> Result<(), Error> {
        self.state.with_lock(|s| s.share(pfn))
    }

    /// Undo [`host_share_guardian`](Self::host_share_guardian).
    ///
    /// # Errors
    /// [`Error::OwnershipInconsistency`] unless the page is currently shared
    /// with the guardian, [`Error::Busy`] while it is pinned.
    pub fn host_unshare_guardian(&self, pfn: Pfn) -> Result<(), Error> {
        self.state.with_lock(|s| s.unshare(pfn))
    }

    /// Transfer `nr_pages` host pages to the guardian.
    ///
    /// # Errors
    /// [`Error::OwnershipInconsistency`] unless the host exclusively owns
    /// every page; whatever mapping or the host's stage-2 report.
    pub fn host_donate_guardian(&self, pfn: Pfn, nr_pages: u64) -> Result<(), Error> {
        self.state.with_lock(|s| s.donate_to_guardian(pfn, nr_pages))
    }

    /// Return pages previously donated by the host.
    ///
    /// # Errors
    /// [`Error::OwnershipInconsistency`] unless every page came from
    /// [`host_donate_guardian`](Self::host_donate_guardian), [`Error::Busy`]
    /// if one is still referenced.
    pub fn guardian_donate_host(&self, pfn: Pfn, nr_pages: u64) -> Result<(), Error> {
        self.state.with_lock(|s| s.donate_to_host(pfn, nr_pages))
    }

    /// Keep a shared page from being unshared while the guardian uses it.
    ///
    /// # Errors
    /// [`Error::OwnershipInconsistency`] unless the page is shared with the guardian.
    pub fn pin_shared(&self, pfn: Pfn) -> Result<(), Error> {
        self.state.with_lock(|s| {
            let pa = s.shared_page(pfn)?;
            s.pool.get_page(pa)?;
            Ok(())
        })
    }

    /// # Errors
    /// [`Error::OwnershipInconsistency`] for a page that is not pinned.
    pub fn unpin_shared(&self, pfn: Pfn) -> Result<(), Error> {
        self.state.with_lock(|s| {
            let pa = s.shared_page(pfn)?;
            s.pool.put_page(pa)?;
            Ok(())
        })
    }

    /// Cached owner and host state of a page.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for a pfn outside memory.
    pub fn page_info(&self, pfn: Pfn) -> Result<(OwnerId, PageState), Error> {
        self.state.with_lock(|s| {
            let pa = pfn.checked_phys().ok_or(Error::InvalidArgument)?;
            let d = s.descriptor(pa)?;
            Ok((
                d.owner().ok_or(Error::OwnershipInconsistency)?,
                d.host_state()?,
            ))
        })
    }

    /// Reference count of the page containing `pa`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an address outside memory.
    pub fn page_count(&self, pa: PhysicalAddress) -> Result<u16, Error> {
        self.state.with_lock(|s| Ok(s.descriptor(pa)?.refcount))
    }

    /// Pages left in the pool.
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.state.with_lock(|s| s.pool.free_pages())
    }

    /// Allocate a page from the pool for guardian use.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] when the pool is exhausted.
    pub fn alloc_page(&self) -> Result<PhysicalAddress, Error> {
        self.state.with_lock(|s| Ok(s.pool.alloc_page(0)?.base()))
    }

    /// # Errors
    /// [`Error::OwnershipInconsistency`] for a page that is not allocated.
    pub fn free_page(&self, pa: PhysicalAddress) -> Result<(), Error> {
        self.state.with_lock(|s| {
            if !s.pool.range().contains(pa) {
                return Err(Error::InvalidArgument);
            }
            Ok(s.pool.put_page(pa)?)
        })
    }

    /// Run `f` with the host's stage-2 while holding the guardian lock.
    pub fn with_host<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        self.state.with_lock(|s| f(&mut s.host))
    }

    /// Root of the guardian page table.
    #[must_use]
    pub fn table_root(&self) -> PhysicalAddress {
        self.state.with_lock(|s| s.table.root().base())
    }

    #[must_use]
    pub const fn vm_table(&self) -> &VmTable<'a> {
        &self.vms
    }
}

impl<M: PhysMapper, H: HostStage2> State<'_, M, H> {
    fn share(&mut self, pfn: Pfn) -> Result<(), Error> {
        let pa = pfn.checked_phys().ok_or(Error::InvalidArgument)?;
        self.check_page(pa, OwnerId::Host, PageState::Owned)?;
        let va = self.table.linear().phys_to_virt(pa);
        #[cfg(feature = "debug-checks")]
        self.expect_unmapped(va)?;

        self.table.map(
            &mut self.pool,
            va,
            pa,
            PAGE_SIZE,
            MapAttrs::new(Protection::ReadWrite, PageState::SharedBorrowed),
        )?;
        self.descriptor_mut(pa)?.set_host_state(PageState::SharedOwned);
        log::debug!("host shared {pa:?} with the guardian");
        Ok(())
    }

    fn unshare(&mut self, pfn: Pfn) -> Result<(), Error> {
        let pa = self.shared_page(pfn)?;
        if self.descriptor(pa)?.refcount != 0 {
            return Err(Error::Busy);
        }
        let va = self.table.linear().phys_to_virt(pa);
        self.table.unmap(&mut self.pool, va, PAGE_SIZE)?;
        self.descriptor_mut(pa)?.set_host_state(PageState::Owned);
        log::debug!("host unshared {pa:?}");
        Ok(())
    }

    fn donate_to_guardian(&mut self, pfn: Pfn, nr_pages: u64) -> Result<(), Error> {
        let range = self.page_range(pfn, nr_pages)?;
        for pa in range.pages() {
            self.check_page(pa, OwnerId::Host, PageState::Owned)?;
            #[cfg(feature = "debug-checks")]
            self.expect_unmapped(self.table.linear().phys_to_virt(pa))?;
        }

        let va = self.table.linear().phys_to_virt(range.start());
        if let Err(e) = self
            .table
            .map_phys(&mut self.pool, range, MapAttrs::owned(Protection::ReadWrite))
            .map_err(Error::from)
            .and_then(|()| self.host.set_owner(range, OwnerId::Guardian))
        {
            self.undo_map(va, range);
            return Err(e);
        }
        for pa in range.pages() {
            let d = self.descriptor_mut(pa)?;
            d.set_owner(OwnerId::Guardian);
            d.set_host_state(PageState::Owned);
            d.meta.set_donated(true);
        }
        log::debug!("host donated {range:?} to the guardian");
        Ok(())
    }

    fn donate_to_host(&mut self, pfn: Pfn, nr_pages: u64) -> Result<(), Error> {
        let range = self.page_range(pfn, nr_pages)?;
        let linear = self.table.linear();
        for pa in range.pages() {
            let d = self.check_page(pa, OwnerId::Guardian, PageState::Owned)?;
            if !d.meta.donated() {
                log::warn!("{pa:?} was not donated by the host");
                return Err(Error::OwnershipInconsistency);
            }
            if d.refcount != 0 {
                return Err(Error::Busy);
            }
            let leaf = self.table.get_leaf(linear.phys_to_virt(pa))?;
            if leaf.is_none_or(|l| l.pa != pa || l.entry.page_state() != Ok(PageState::Owned)) {
                return Err(Error::OwnershipInconsistency);
            }
        }

        self.table.unmap(&mut self.pool, linear.phys_to_virt(range.start()), range.size())?;
        self.host.set_owner(range, OwnerId::Host)?;
        for pa in range.pages() {
            let d = self.descriptor_mut(pa)?;
            d.set_owner(OwnerId::Host);
            d.set_host_state(PageState::Owned);
            d.meta.set_donated(false);
        }
        log::debug!("guardian returned {range:?} to the host");
        Ok(())
    }

    /// A page the host currently shares with the guardian.
    fn shared_page(&self, pfn: Pfn) -> Result<PhysicalAddress, Error> {
        let pa = pfn.checked_phys().ok_or(Error::InvalidArgument)?;
        self.check_page(pa, OwnerId::Host, PageState::SharedOwned)?;
        let va = self.table.linear().phys_to_virt(pa);
        match self.table.get_leaf(va)? {
            Some(leaf) if leaf.pa == pa && leaf.entry.page_state() == Ok(PageState::SharedBorrowed) => Ok(pa),
            _ => {
                log::warn!("{pa:?} is not mapped as shared by the guardian");
                Err(Error::OwnershipInconsistency)
            }
        }
    }

    fn check_page(&self, pa: PhysicalAddress, owner: OwnerId, state: PageState) -> Result<&PageDescriptor, Error> {
        let d = self.descriptor(pa)?;
        if d.owner() != Some(owner) || d.host_state() != Ok(state) {
            log::warn!(
                "{pa:?}: expected {owner:?}/{state:?}, found {:?}/{:?}",
                d.owner(),
                d.host_state()
            );
            return Err(Error::OwnershipInconsistency);
        }
        Ok(d)
    }

    #[cfg(feature = "debug-checks")]
    fn expect_unmapped(&self, va: VirtualAddress) -> Result<(), Error> {
        if self.table.get_leaf(va)?.is_some() {
            log::warn!("{va:?} is already mapped by the guardian");
            return Err(Error::OwnershipInconsistency);
        }
        Ok(())
    }

    fn undo_map(&mut self, va: VirtualAddress, range: PhysRange) {
        if let Err(e) = self.table.unmap(&mut self.pool, va, range.size()) {
            log::error!("could not undo mapping of {range:?}: {e}");
        }
    }

    fn page_range(&self, pfn: Pfn, nr_pages: u64) -> Result<PhysRange, Error> {
        let start = pfn.checked_phys().ok_or(Error::InvalidArgument)?;
        let range = PhysRange::from_pages(start, nr_pages)
            .filter(|r| !r.is_empty())
            .ok_or(Error::InvalidArgument)?;
        if range.overlaps(&self.pool.range()) {
            return Err(Error::InvalidArgument);
        }
        Ok(range)
    }

    fn descriptor(&self, pa: PhysicalAddress) -> Result<&PageDescriptor, Error> {
        self.pool.vmemmap().descriptor(pa).map_err(|_| Error::InvalidArgument)
    }

    fn descriptor_mut(&mut self, pa: PhysicalAddress) -> Result<&mut PageDescriptor, Error> {
        self.pool
            .vmemmap_mut()
            .descriptor_mut(pa)
            .map_err(|_| Error::InvalidArgument)
    }
}
