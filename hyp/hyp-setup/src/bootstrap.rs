//! # Guardian bootstrap
//!
//! The host donates a contiguous pool and calls [`bootstrap`] on its boot
//! CPU. Bootstrap runs in two halves:
//!
//! ```text
//! bootstrap()                          BootstrapContext::finalize()
//!  1. carve the pool                    3. vmemmap + host stage-2, hand the
//!  2. build the guardian table             pool to the buddy allocator
//!     (image, pool, per-CPU,            4. reconcile ownership of every
//!      shared, firmware, idmap,            page the guardian maps
//!      stacks) and fill per-CPU         5. take protected ranges away
//!      stack_hyp_va / pgd_pa            6. pin host stage-2 table pages
//!                                       7. external services on a
//!                                          zeroed proxy window
//!          every CPU switches           8. VM table
//!          to the new table  ────────►  enter_host()
//! ```
//!
//! Any failure aborts the whole sequence. Nothing is rolled back: the
//! donated memory is considered lost and the host gets an error code while
//! its secondary CPUs stay parked.

use crate::api::Guardian;
use crate::error::Error;
use crate::host::{ExternalServices, HostContext, HostStage2};
use crate::ownership::{OwnershipFixup, OwnershipTracker};
use crate::vm_table::{VmSlot, VmTable};
use hyp_alloc::early::EarlyAllocator;
use hyp_alloc::phys_mapper::{phys_slice_mut, zero_range};
use hyp_alloc::pool::HypPool;
use hyp_alloc::fix_hyp_pgtable_refcnt;
use hyp_alloc::vmemmap::{DESCRIPTOR_SIZE, PageDescriptor, Vmemmap};
use hyp_info::boot::{BootParams, Platform};
use hyp_info::memory::{MAX_VMS, PAGE_SIZE, PRIVATE_VA_SIZE, STACK_PAGES};
use hyp_info::sizing;
use hyp_memory_addresses::{PhysRange, VirtRange};
use hyp_pgtable::{
    GuardianPageTable, LinearMap, MapAttrs, PageState, PhysMapper, PrivateVaRange, Protection,
};

/// Where each carve-out of the donated pool ended up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    pub vmemmap: PhysRange,
    pub vm_table: PhysRange,
    pub guardian_pgtable: PhysRange,
    pub host_s2: PhysRange,
    pub proxy: PhysRange,
}

impl PoolLayout {
    /// Cut the fixed-size regions off the front of the pool, in order.
    ///
    /// # Errors
    /// [`Error::OutOfMemory`] if the pool is too small.
    pub fn carve(early: &mut EarlyAllocator, memory: &[PhysRange]) -> Result<Self, Error> {
        let layout = Self {
            vmemmap: early.alloc_contiguous(sizing::vmemmap_pages(memory, DESCRIPTOR_SIZE))?,
            vm_table: early.alloc_contiguous(sizing::vm_table_pages(size_of::<VmSlot>()))?,
            guardian_pgtable: early.alloc_contiguous(sizing::guardian_pgtable_pages(memory))?,
            host_s2: early.alloc_contiguous(sizing::host_s2_pgtable_pages(memory))?,
            proxy: early.alloc_contiguous(sizing::proxy_pages())?,
        };
        log::debug!("pool layout: {layout:?}");
        Ok(layout)
    }
}

/// State carried from [`bootstrap`] to [`BootstrapContext::finalize`].
pub struct BootstrapContext<'a, M: PhysMapper> {
    mapper: &'a M,
    platform: Platform<'a>,
    pool: PhysRange,
    layout: PoolLayout,
    /// Pool pages the early allocator handed out.
    reserved: u64,
    cpu_count: usize,
    table: GuardianPageTable<'a, M>,
    pgtable_alloc: EarlyAllocator,
    private_va: PrivateVaRange,
}

/// Outcome of [`BootstrapContext::finalize`].
pub enum Transition<G> {
    /// Bootstrap completed; the host resumes with the guardian in place.
    Continue(G),
    /// Bootstrap failed; the host gets the error code.
    Abort(Error),
}

impl<G> Transition<G> {
    #[must_use]
    pub const fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    /// The error of an aborted transition.
    #[must_use]
    pub const fn error(&self) -> Option<Error> {
        match self {
            Self::Continue(_) => None,
            Self::Abort(e) => Some(*e),
        }
    }
}

/// Steps 1 and 2 of bootstrap, run by the entry call.
///
/// On success every entry of `params.per_cpu` carries the stack top and the
/// table root its CPU switches to.
///
/// # Errors
/// [`Error::InvalidArgument`] for bad parameters, [`Error::OutOfMemory`] if
/// the pool is too small, [`Error::MappingConflict`] for overlapping image
/// ranges with different attributes.
pub fn bootstrap<'a, M: PhysMapper>(
    params: BootParams<'a, '_>,
    mapper: &'a M,
) -> Result<BootstrapContext<'a, M>, Error> {
    if let Err(e) = params.validate() {
        log::error!("boot parameters rejected: {e}");
        return Err(e.into());
    }
    let pool = params.pool()?;
    let private = params.private_va().ok_or(Error::InvalidArgument)?;
    let BootParams {
        cpu_count,
        per_cpu,
        va_bits,
        platform,
        ..
    } = params;
    log::info!("bootstrap: pool {pool:?}, {cpu_count} cpus, {va_bits}-bit VA");

    let mut early = EarlyAllocator::new();
    early.init(pool)?;
    let layout = PoolLayout::carve(&mut early, platform.memory)?;
    let reserved = early.pages_used();

    let mut pgtable_alloc = EarlyAllocator::new();
    pgtable_alloc.init(layout.guardian_pgtable)?;
    let linear = LinearMap::new(platform.linear_map_offset);
    let table = GuardianPageTable::init_radix(mapper, &mut pgtable_alloc, linear, va_bits)?;

    let mut ctx = BootstrapContext {
        mapper,
        platform,
        pool,
        layout,
        reserved,
        cpu_count,
        table,
        pgtable_alloc,
        private_va: PrivateVaRange::new(private),
    };
    ctx.map_image()?;

    for (cpu, cpu_params) in per_cpu.iter_mut().enumerate() {
        let region = PhysRange::new(cpu_params.base, platform.per_cpu_size).ok_or(Error::InvalidArgument)?;
        ctx.map(region, MapAttrs::owned(Protection::ReadWrite))?;

        let stack = ctx.private_va.alloc((STACK_PAGES + 1) * PAGE_SIZE)?;
        let guard = stack.start();
        let bottom = guard.checked_add(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        ctx.table.map(
            &mut ctx.pgtable_alloc,
            bottom,
            cpu_params.stack_pa,
            STACK_PAGES * PAGE_SIZE,
            MapAttrs::owned(Protection::ReadWrite),
        )?;
        cpu_params.stack_hyp_va = stack.end();
        cpu_params.pgd_pa = ctx.table.root().base();
        log::debug!("cpu {cpu}: stack {bottom:?}..{:?}, guard page {guard:?}", stack.end());
    }

    log::info!(
        "bootstrap: guardian table at {:?}, {} of {} table pages used",
        ctx.table.root(),
        ctx.pgtable_alloc.pages_used(),
        ctx.layout.guardian_pgtable.page_count()
    );
    Ok(ctx)
}

impl<'a, M: PhysMapper> BootstrapContext<'a, M> {
    #[must_use]
    pub const fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Pool pages carved before the buddy allocator takes over.
    #[must_use]
    pub const fn reserved_pages(&self) -> u64 {
        self.reserved
    }

    #[must_use]
    pub const fn table(&self) -> &GuardianPageTable<'a, M> {
        &self.table
    }

    /// Steps 3 to 8 of bootstrap, run once every CPU is on the new table.
    ///
    /// The early allocator is dropped here; from now on table pages come
    /// from the pool.
    pub fn finalize<H: HostStage2, S: ExternalServices>(
        self,
        host: H,
        services: &mut S,
    ) -> Transition<Guardian<'a, M, H>> {
        match self.try_finalize(host, services) {
            Ok(guardian) => {
                log::info!("finalize: guardian ready");
                Transition::Continue(guardian)
            }
            Err(e) => {
                log::error!("finalize failed: {e} ({})", e.code());
                Transition::Abort(e)
            }
        }
    }

    fn try_finalize<H: HostStage2, S: ExternalServices>(
        self,
        mut host: H,
        services: &mut S,
    ) -> Result<Guardian<'a, M, H>, Error> {
        let Self {
            mapper,
            platform,
            pool,
            layout,
            reserved,
            cpu_count,
            table,
            ..
        } = self;

        let len = usize::try_from(layout.vmemmap.size() / DESCRIPTOR_SIZE as u64)
            .map_err(|_| Error::InvalidArgument)?;
        // SAFETY: the vmemmap carve-out is mapped and nothing else refers to it.
        let descriptors: &'a mut [PageDescriptor] =
            unsafe { phys_slice_mut(mapper, layout.vmemmap.start(), len) };
        let mut vmemmap = Vmemmap::new(descriptors, platform.memory)?;
        vmemmap.init();

        host.prepare(layout.host_s2)?;
        let host_table = host.table().ok_or(Error::InvalidArgument)?;

        let mut pool = HypPool::init(vmemmap, pool.start().pfn(), pool.page_count(), reserved)?;
        let entries = fix_hyp_pgtable_refcnt(&table, &mut pool)?;
        log::info!(
            "finalize: pool of {} pages, {} free, {entries} table entries",
            pool.range().page_count(),
            pool.free_pages()
        );

        {
            let mut tracker = OwnershipTracker::new(pool.vmemmap_mut(), &mut host);
            let mut fixup = OwnershipFixup::new(&mut tracker);
            let linear = table.linear();
            for region in platform.memory {
                let va = VirtRange::new(linear.phys_to_virt(region.start()), region.size())
                    .ok_or(Error::InvalidArgument)?;
                table.walk(va, &mut fixup)?;
            }
            let private = VirtRange::new(platform.private_va_base, PRIVATE_VA_SIZE)
                .ok_or(Error::InvalidArgument)?;
            table.walk(private, &mut fixup)?;
            log::info!("finalize: reconciled {} pages", fixup.pages());

            for range in platform.protected {
                tracker.mark_protected(*range)?;
            }

            let pinned = tracker.pin_host_tables(mapper, host_table, layout.host_s2)?;
            log::info!("finalize: pinned {pinned} host stage-2 table pages");
        }

        // SAFETY: the proxy carve-out is mapped and nothing else refers to it
        // until the services take it.
        unsafe { zero_range(mapper, layout.proxy) };
        services.init(layout.proxy)?;

        // SAFETY: the VM table carve-out is mapped and nothing else refers to it.
        let slots: &'a mut [VmSlot] = unsafe { phys_slice_mut(mapper, layout.vm_table.start(), MAX_VMS) };
        let vms = VmTable::init(slots)?;

        log::debug!("finalize: {cpu_count} cpus on table {:?}", table.root());
        Ok(Guardian::new(table, pool, host, vms))
    }

    fn map_image(&mut self) -> Result<(), Error> {
        let image = self.platform.image;
        self.map(image.text, MapAttrs::owned(Protection::Execute))?;
        self.map(image.rodata, MapAttrs::owned(Protection::ReadOnly))?;
        self.map(image.data, MapAttrs::owned(Protection::ReadWrite))?;
        self.map(image.bss, MapAttrs::owned(Protection::ReadWrite))?;
        self.map(self.pool, MapAttrs::owned(Protection::ReadWrite))?;
        for range in image.host_shared {
            self.map(*range, MapAttrs::new(Protection::ReadOnly, PageState::SharedBorrowed))?;
        }
        if let Some(firmware) = image.firmware {
            self.map(firmware, MapAttrs::owned(Protection::ReadOnly))?;
        }
        if !image.idmap.is_empty() {
            self.table.identity_map_range(&mut self.pgtable_alloc, image.idmap)?;
        }
        Ok(())
    }

    fn map(&mut self, range: PhysRange, attrs: MapAttrs) -> Result<(), Error> {
        if range.is_empty() {
            return Ok(());
        }
        self.table.map_phys(&mut self.pgtable_alloc, range, attrs)?;
        Ok(())
    }
}

/// Hand control back to the host.
///
/// On [`Transition::Continue`] the host sees zero and the secondary CPUs are
/// released. On [`Transition::Abort`] it sees the error code and they stay
/// parked.
pub fn enter_host<G, C: HostContext>(host: &mut C, transition: Transition<G>) -> Option<G> {
    match transition {
        Transition::Continue(guardian) => {
            host.set_return_code(0);
            host.release_cpus();
            Some(guardian)
        }
        Transition::Abort(e) => {
            host.set_return_code(e.code());
            None
        }
    }
}

/// Run the whole bootstrap sequence and report the result to the host.
pub fn boot_guardian<'a, M, H, S, C>(
    params: BootParams<'a, '_>,
    mapper: &'a M,
    host: H,
    services: &mut S,
    ctx: &mut C,
) -> Option<Guardian<'a, M, H>>
where
    M: PhysMapper,
    H: HostStage2,
    S: ExternalServices,
    C: HostContext,
{
    let transition = match bootstrap(params, mapper) {
        Ok(boot) => boot.finalize(host, services),
        Err(e) => Transition::Abort(e),
    };
    enter_host(ctx, transition)
}
