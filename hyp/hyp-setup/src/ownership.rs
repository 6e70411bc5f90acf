//! # Page ownership
//!
//! Each page of memory has an owner ([`OwnerId`]) and a cached host-side
//! [`PageState`], both held in its vmemmap descriptor. The authoritative
//! copy of ownership lives in the host's stage-2 table; the cache lets the
//! guardian answer "who owns this page" without walking it.
//!
//! During finalize the guardian reads the state bits of its own mappings
//! and derives the host's view from them:
//!
//! | guardian sees    | host stage-2             | cached host state   |
//! |------------------|--------------------------|---------------------|
//! | `Owned`          | owner set to guardian    | `Owned`             |
//! | `SharedOwned`    | unchanged                | `SharedBorrowed`    |
//! | `SharedBorrowed` | unchanged                | `SharedOwned`       |

use crate::error::Error;
use crate::host::{HostStage2, HostTable};
use hyp_alloc::vmemmap::{OwnerId, PageDescriptor, Vmemmap};
use hyp_memory_addresses::{PhysRange, PhysicalAddress, Size4K, VirtRange, VirtualAddress};
use hyp_pgtable::{
    EntryKind, EntryRef, GuardianPageTable, Level, LinearMap, PageState, PhysMapper, Visitor,
    WalkFlags,
};

/// Ownership bookkeeping over the vmemmap, mirrored into the host's stage-2.
pub struct OwnershipTracker<'t, 'a, H> {
    vmemmap: &'t mut Vmemmap<'a>,
    host: &'t mut H,
}

impl<'t, 'a, H: HostStage2> OwnershipTracker<'t, 'a, H> {
    pub const fn new(vmemmap: &'t mut Vmemmap<'a>, host: &'t mut H) -> Self {
        Self { vmemmap, host }
    }

    /// Take a reference on the page containing `pa`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] outside memory,
    /// [`Error::OwnershipInconsistency`] on overflow.
    pub fn get_page(&mut self, pa: PhysicalAddress) -> Result<(), Error> {
        let d = self.descriptor_mut(pa)?;
        d.refcount = d.refcount.checked_add(1).ok_or(Error::OwnershipInconsistency)?;
        Ok(())
    }

    /// Drop a reference and return the remaining count.
    ///
    /// Nothing is freed here; a count of zero only tells the caller the page
    /// is unreferenced.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] outside memory,
    /// [`Error::OwnershipInconsistency`] on underflow.
    pub fn put_page(&mut self, pa: PhysicalAddress) -> Result<u16, Error> {
        let d = self.descriptor_mut(pa)?;
        d.refcount = d.refcount.checked_sub(1).ok_or(Error::OwnershipInconsistency)?;
        Ok(d.refcount)
    }

    /// # Errors
    /// [`Error::InvalidArgument`] outside memory.
    pub fn page_count(&self, pa: PhysicalAddress) -> Result<u16, Error> {
        self.vmemmap
            .descriptor(pa)
            .map(|d| d.refcount)
            .map_err(|_| Error::InvalidArgument)
    }

    /// Bring the page containing `pa` in line with the state bits the
    /// guardian's own mapping carries for it.
    ///
    /// A shared state flips the cached state if it is already one of the
    /// shared pair, and sets the mirror of `observed` otherwise. The owner
    /// follows the resulting state: the host owns a page it shares out, the
    /// guardian owns a page it lends in.
    ///
    /// # Errors
    /// - [`Error::OwnershipInconsistency`] for the reserved encoding; nothing
    ///   is changed.
    /// - [`Error::InvalidArgument`] outside memory.
    /// - Whatever [`HostStage2::set_owner`] reports.
    pub fn reconcile_with_host(&mut self, pa: PhysicalAddress, observed: u8) -> Result<(), Error> {
        let observed = PageState::try_from(observed).map_err(|e| {
            log::error!("{pa:?}: guardian mapping carries invalid state {:#04b}", e.0);
            Error::OwnershipInconsistency
        })?;
        let page = PhysRange::from_pages(pa.align_down::<Size4K>(), 1)
            .ok_or(Error::InvalidArgument)?;
        let cached = self
            .descriptor_mut(page.start())?
            .host_state()
            .map_err(|_| Error::OwnershipInconsistency)?;

        let state = match observed {
            PageState::Owned => {
                self.host.set_owner(page, OwnerId::Guardian)?;
                PageState::Owned
            }
            _ if cached.is_shared() => cached.mirrored(),
            shared => shared.mirrored(),
        };
        let owner = match state {
            PageState::Owned | PageState::SharedBorrowed => OwnerId::Guardian,
            PageState::SharedOwned => OwnerId::Host,
        };

        let d = self.descriptor_mut(page.start())?;
        d.set_host_state(state);
        d.set_owner(owner);
        log::trace!("{pa:?}: guardian sees {observed:?}, host state {cached:?} -> {state:?}");
        Ok(())
    }

    /// Hand every page of `range` to the protected owner.
    ///
    /// Only pages the host exclusively owns can move; the whole range is
    /// checked before the host's stage-2 is touched.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if `range` is not page-aligned memory.
    /// - [`Error::OwnershipInconsistency`] if any page is not host-owned.
    /// - Whatever [`HostStage2::set_owner`] reports.
    pub fn mark_protected(&mut self, range: PhysRange) -> Result<(), Error> {
        if !range.is_aligned::<Size4K>()
            || !range.pages().all(|pa| self.vmemmap.is_memory(pa))
        {
            return Err(Error::InvalidArgument);
        }
        for pa in range.pages() {
            let info = self.page_info(pa)?;
            if info != (OwnerId::Host, PageState::Owned) {
                log::error!("{pa:?} in protected range {range:?} is {info:?}");
                return Err(Error::OwnershipInconsistency);
            }
        }
        self.host.set_owner(range, OwnerId::Protected)?;
        for pa in range.pages() {
            let d = self.descriptor_mut(pa)?;
            d.set_owner(OwnerId::Protected);
            d.set_host_state(PageState::Owned);
        }
        log::debug!("{range:?} handed to the protected owner");
        Ok(())
    }

    /// Take a reference on every table page of the host's stage-2, so the
    /// allocator never hands them out.
    ///
    /// The host table is only trusted as far as its pages lie in `scratch`,
    /// the range it was built in. The root and each child table are checked
    /// before they are read.
    ///
    /// Returns the number of pages pinned.
    ///
    /// # Errors
    /// [`Error::WalkFailure`] on a malformed host table or a table page
    /// outside `scratch`.
    pub fn pin_host_tables<M: PhysMapper>(
        &mut self,
        mapper: &M,
        host: HostTable,
        scratch: PhysRange,
    ) -> Result<u64, Error> {
        let root = host.root.base();
        if !scratch.contains(root) || !self.vmemmap.is_memory(root) {
            log::error!("host stage-2 root {root:?} lies outside {scratch:?}");
            return Err(Error::WalkFailure);
        }
        let table = GuardianPageTable::from_root(mapper, host.root, LinearMap::identity(), host.ipa_bits)?;
        let all = VirtRange::new(VirtualAddress::zero(), table.va_limit()).ok_or(Error::WalkFailure)?;
        self.get_page(root)?;
        let mut pin = PinHostTables {
            tracker: self,
            scratch,
            pinned: 1,
        };
        table.walk(all, &mut pin)?;
        Ok(pin.pinned)
    }

    /// The cached owner and state of the page containing `pa`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] outside memory,
    /// [`Error::OwnershipInconsistency`] for a corrupt descriptor.
    pub fn page_info(&self, pa: PhysicalAddress) -> Result<(OwnerId, PageState), Error> {
        let d = self.vmemmap.descriptor(pa).map_err(|_| Error::InvalidArgument)?;
        let owner = d.owner().ok_or(Error::OwnershipInconsistency)?;
        let state = d.host_state().map_err(|_| Error::OwnershipInconsistency)?;
        Ok((owner, state))
    }

    fn descriptor_mut(&mut self, pa: PhysicalAddress) -> Result<&mut PageDescriptor, Error> {
        self.vmemmap.descriptor_mut(pa).map_err(|_| Error::InvalidArgument)
    }
}

/// Reconciles every page the guardian maps with the host's view.
pub struct OwnershipFixup<'r, 't, 'a, H> {
    tracker: &'r mut OwnershipTracker<'t, 'a, H>,
    pages: u64,
}

impl<'r, 't, 'a, H: HostStage2> OwnershipFixup<'r, 't, 'a, H> {
    pub const fn new(tracker: &'r mut OwnershipTracker<'t, 'a, H>) -> Self {
        Self { tracker, pages: 0 }
    }

    /// Pages reconciled so far.
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }
}

impl<H: HostStage2> Visitor for OwnershipFixup<'_, '_, '_, H> {
    type Error = Error;

    fn flags(&self) -> WalkFlags {
        WalkFlags::new().with_leaf(true)
    }

    fn visit_leaf(&mut self, entry: EntryRef, level: Level) -> Result<(), Error> {
        if !matches!(entry.entry.kind(level), EntryKind::Block | EntryKind::Page) {
            return Ok(());
        }
        let range = PhysRange::new(entry.entry.output_address(), level.granule()).ok_or(Error::InvalidArgument)?;
        let observed = entry.entry.sw_state();
        for pa in range.pages() {
            if !self.tracker.vmemmap.is_memory(pa) {
                log::error!("guardian maps {pa:?} at {:?}, which is not memory", entry.va);
                return Err(Error::InvalidArgument);
            }
            self.tracker.reconcile_with_host(pa, observed)?;
            self.pages += 1;
        }
        Ok(())
    }
}

/// Takes a reference on each table page of a host stage-2 table.
struct PinHostTables<'r, 't, 'a, H> {
    tracker: &'r mut OwnershipTracker<'t, 'a, H>,
    scratch: PhysRange,
    pinned: u64,
}

impl<H: HostStage2> Visitor for PinHostTables<'_, '_, '_, H> {
    type Error = Error;

    fn flags(&self) -> WalkFlags {
        WalkFlags::new().with_table_pre(true)
    }

    fn visit_table_pre(&mut self, entry: EntryRef, level: Level) -> Result<bool, Error> {
        let EntryKind::Table(child) = entry.entry.kind(level) else {
            return Ok(false);
        };
        let pa = child.base();
        if !self.scratch.contains(pa) || !self.tracker.vmemmap.is_memory(pa) {
            log::error!(
                "host stage-2 descriptor at {:?} points at {pa:?}, outside {:?}",
                entry.entry_pa,
                self.scratch
            );
            return Err(Error::WalkFailure);
        }
        self.tracker.get_page(pa)?;
        self.pinned += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyp_alloc::vmemmap::PageDescriptor;

    const BASE: u64 = 0x4000_0000;
    const PAGES: u64 = 32;

    #[derive(Default)]
    struct RecordingHost {
        calls: Vec<(PhysRange, OwnerId)>,
        fail_at: Option<usize>,
    }

    impl HostStage2 for RecordingHost {
        fn prepare(&mut self, _scratch: PhysRange) -> Result<(), Error> {
            Ok(())
        }

        fn set_owner(&mut self, range: PhysRange, owner: OwnerId) -> Result<(), Error> {
            if self.fail_at == Some(self.calls.len()) {
                return Err(Error::WalkFailure);
            }
            self.calls.push((range, owner));
            Ok(())
        }

        fn table(&self) -> Option<HostTable> {
            None
        }
    }

    fn memory() -> [PhysRange; 1] {
        [PhysRange::from_pages(PhysicalAddress::new(BASE), PAGES).unwrap()]
    }

    fn page(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(BASE + n * 0x1000)
    }

    fn with_tracker<R>(
        host: &mut RecordingHost,
        f: impl FnOnce(&mut OwnershipTracker<'_, '_, RecordingHost>) -> R,
    ) -> R {
        let memory = memory();
        let mut descriptors = vec![PageDescriptor::INIT; PAGES as usize];
        let mut vmemmap = Vmemmap::new(&mut descriptors, &memory).unwrap();
        let mut tracker = OwnershipTracker::new(&mut vmemmap, host);
        f(&mut tracker)
    }

    #[test]
    fn owned_pages_move_to_the_guardian() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            t.reconcile_with_host(page(3), PageState::Owned.into_bits()).unwrap();
            assert_eq!(t.page_info(page(3)), Ok((OwnerId::Guardian, PageState::Owned)));
            assert_eq!(t.page_info(page(4)), Ok((OwnerId::Host, PageState::Owned)));
        });
        assert_eq!(host.calls, vec![(PhysRange::from_pages(page(3), 1).unwrap(), OwnerId::Guardian)]);
    }

    #[test]
    fn shared_pages_take_the_mirrored_state() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            t.reconcile_with_host(page(0), PageState::SharedBorrowed.into_bits()).unwrap();
            t.reconcile_with_host(page(1), PageState::SharedOwned.into_bits()).unwrap();
            assert_eq!(t.page_info(page(0)), Ok((OwnerId::Host, PageState::SharedOwned)));
            assert_eq!(t.page_info(page(1)), Ok((OwnerId::Guardian, PageState::SharedBorrowed)));
        });
        assert!(host.calls.is_empty());
    }

    #[test]
    fn double_reconcile_flips_back() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            let shared = PageState::SharedBorrowed.into_bits();
            t.reconcile_with_host(page(5), shared).unwrap();
            assert_eq!(t.page_info(page(5)).unwrap().1, PageState::SharedOwned);
            t.reconcile_with_host(page(5), shared).unwrap();
            assert_eq!(t.page_info(page(5)).unwrap().1, PageState::SharedBorrowed);
            t.reconcile_with_host(page(5), shared).unwrap();
            assert_eq!(t.page_info(page(5)).unwrap().1, PageState::SharedOwned);
        });
    }

    #[test]
    fn invalid_encoding_changes_nothing() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            t.reconcile_with_host(page(7), PageState::SharedOwned.into_bits()).unwrap();
            let before = t.page_info(page(7));
            assert_eq!(t.reconcile_with_host(page(7), 0b11), Err(Error::OwnershipInconsistency));
            assert_eq!(t.page_info(page(7)), before);
        });
        assert!(host.calls.is_empty());
    }

    #[test]
    fn host_failure_leaves_the_page_alone() {
        let mut host = RecordingHost {
            fail_at: Some(0),
            ..RecordingHost::default()
        };
        with_tracker(&mut host, |t| {
            assert_eq!(t.reconcile_with_host(page(2), 0), Err(Error::WalkFailure));
            assert_eq!(t.page_info(page(2)), Ok((OwnerId::Host, PageState::Owned)));
        });
    }

    #[test]
    fn pages_outside_memory_are_rejected() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            assert_eq!(t.reconcile_with_host(page(PAGES), 0), Err(Error::InvalidArgument));
            assert_eq!(t.get_page(PhysicalAddress::new(0x1000)), Err(Error::InvalidArgument));
        });
    }

    #[test]
    fn refcounts_never_free() {
        let mut host = RecordingHost::default();
        with_tracker(&mut host, |t| {
            t.get_page(page(1)).unwrap();
            t.get_page(page(1)).unwrap();
            assert_eq!(t.page_count(page(1)), Ok(2));
            assert_eq!(t.put_page(page(1)), Ok(1));
            assert_eq!(t.put_page(page(1)), Ok(0));
            assert_eq!(t.put_page(page(1)), Err(Error::OwnershipInconsistency));
        });
    }

    #[test]
    fn protected_ranges_leave_the_host() {
        let mut host = RecordingHost::default();
        let range = PhysRange::from_pages(page(8), 4).unwrap();
        with_tracker(&mut host, |t| {
            t.mark_protected(range).unwrap();
            for pa in range.pages() {
                assert_eq!(t.page_info(pa).unwrap().0, OwnerId::Protected);
            }
            assert_eq!(t.page_info(page(12)).unwrap().0, OwnerId::Host);
            let outside = PhysRange::from_pages(page(PAGES - 1), 2).unwrap();
            assert_eq!(t.mark_protected(outside), Err(Error::InvalidArgument));
        });
        assert_eq!(host.calls, vec![(range, OwnerId::Protected)]);
    }

    #[test]
    fn protecting_pages_the_host_does_not_own_changes_nothing() {
        let mut host = RecordingHost::default();
        let range = PhysRange::from_pages(page(16), 4).unwrap();
        with_tracker(&mut host, |t| {
            t.reconcile_with_host(page(18), PageState::Owned.into_bits()).unwrap();
            t.reconcile_with_host(page(24), PageState::SharedBorrowed.into_bits()).unwrap();
            assert_eq!(t.mark_protected(range), Err(Error::OwnershipInconsistency));
            for pa in range.pages() {
                let expected = if pa == page(18) { OwnerId::Guardian } else { OwnerId::Host };
                assert_eq!(t.page_info(pa).unwrap().0, expected, "{pa:?}");
            }

            // Shared with the guardian counts as not exclusively the host's.
            let shared = PhysRange::from_pages(page(24), 1).unwrap();
            assert_eq!(t.mark_protected(shared), Err(Error::OwnershipInconsistency));
            assert_eq!(t.page_info(page(24)), Ok((OwnerId::Host, PageState::SharedOwned)));

            // Protecting twice is refused as well.
            let once = PhysRange::from_pages(page(28), 2).unwrap();
            t.mark_protected(once).unwrap();
            assert_eq!(t.mark_protected(once), Err(Error::OwnershipInconsistency));
        });
        assert_eq!(
            host.calls,
            vec![
                (PhysRange::from_pages(page(18), 1).unwrap(), OwnerId::Guardian),
                (PhysRange::from_pages(page(28), 2).unwrap(), OwnerId::Protected),
            ]
        );
    }
}
