#![allow(dead_code)]

use hyp_alloc::early::EarlyAllocator;
use hyp_alloc::phys_mapper::SimulatedMemory;
use hyp_alloc::vmemmap::{DESCRIPTOR_SIZE, OwnerId};
use hyp_info::boot::{BootParams, GuardianImage, PerCpuParams, Platform};
use hyp_info::sizing;
use hyp_memory_addresses::{PhysRange, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use hyp_pgtable::{GuardianPageTable, LinearMap, MapAttrs, PageTable, PageTableEntry, PhysMapper, Protection};
use hyp_setup::{Error, ExternalServices, HostContext, HostStage2, HostTable, VmSlot};
use std::cell::RefCell;
use std::rc::Rc;

pub const MEMORY_BASE: u64 = 0x4000_0000;
pub const MEMORY_SIZE: u64 = 32 << 20;
pub const POOL_BASE: u64 = 0x4100_0000;
pub const LINEAR_OFFSET: u64 = 0x80_0000_0000;
pub const PRIVATE_VA_BASE: u64 = 0x10_0000_0000;
pub const VA_BITS: u8 = 40;
pub const HOST_IPA_BITS: u8 = 40;

pub fn range(base: u64, pages: u64) -> PhysRange {
    PhysRange::from_pages(PhysicalAddress::new(base), pages).unwrap()
}

/// A 32 MiB machine with the image at the bottom and the pool at the top.
pub struct Fixture {
    pub memory: [PhysRange; 1],
    pub host_shared: [PhysRange; 1],
    pub protected: Vec<PhysRange>,
    pub image: GuardianImage<'static>,
    pub pool: PhysRange,
    pub cpu_count: usize,
    pub mem: SimulatedMemory,
}

impl Fixture {
    pub fn new(pool_pages: u64, cpu_count: usize) -> Self {
        let memory = [range(MEMORY_BASE, MEMORY_SIZE / 0x1000)];
        Self {
            memory,
            host_shared: [range(0x4002_0000, 2)],
            protected: vec![range(0x4080_0000, 16)],
            image: GuardianImage {
                text: range(0x4000_0000, 16),
                rodata: range(0x4001_0000, 8),
                data: range(0x4001_8000, 4),
                bss: range(0x4001_c000, 4),
                idmap: range(0x4000_0000, 1),
                host_shared: &[],
                firmware: Some(range(0x4003_0000, 4)),
            },
            pool: range(POOL_BASE, pool_pages),
            cpu_count,
            mem: SimulatedMemory::new(&memory),
        }
    }

    pub fn cpus(&self) -> Vec<PerCpuParams> {
        (0..self.cpu_count as u64)
            .map(|cpu| PerCpuParams {
                base: PhysicalAddress::new(0x4010_0000 + cpu * 0x2000),
                stack_pa: PhysicalAddress::new(0x4018_0000 + cpu * 0x1000),
                ..PerCpuParams::default()
            })
            .collect()
    }

    pub fn platform(&self) -> Platform<'_> {
        Platform {
            memory: &self.memory,
            image: GuardianImage {
                host_shared: &self.host_shared,
                ..self.image
            },
            protected: &self.protected,
            linear_map_offset: LINEAR_OFFSET,
            private_va_base: VirtualAddress::new(PRIVATE_VA_BASE),
            per_cpu_size: 0x2000,
        }
    }

    pub fn params<'a, 'c>(&'a self, per_cpu: &'c mut [PerCpuParams]) -> BootParams<'a, 'c> {
        BootParams {
            phys_base: self.pool.start(),
            size: self.pool.size(),
            cpu_count: per_cpu.len(),
            per_cpu,
            va_bits: VA_BITS,
            platform: self.platform(),
        }
    }

    /// Pages bootstrap carves off the pool before the buddy allocator runs.
    pub fn expected_reserved(&self) -> u64 {
        sizing::vmemmap_pages(&self.memory, DESCRIPTOR_SIZE)
            + sizing::vm_table_pages(size_of::<VmSlot>())
            + sizing::guardian_pgtable_pages(&self.memory)
            + sizing::host_s2_pgtable_pages(&self.memory)
            + sizing::proxy_pages()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    Prepare,
    /// Fail the n-th `set_owner` call (counting from zero) with `WalkFailure`.
    SetOwner(usize),
    Protect,
    BadHostTable,
    /// Point an unused root slot of the host table at this physical address.
    ForeignTable(u64),
}

#[derive(Debug, Default)]
pub struct HostLog {
    pub prepared: Option<PhysRange>,
    pub owners: Vec<(PhysRange, OwnerId)>,
}

/// Host stage-2 that identity-maps all memory and records ownership calls.
pub struct MockHost<'m> {
    mem: &'m SimulatedMemory,
    memory: Vec<PhysRange>,
    table: Option<HostTable>,
    fault: Option<Fault>,
    set_owner_calls: usize,
    pub log: Rc<RefCell<HostLog>>,
}

impl<'m> MockHost<'m> {
    pub fn new(fx: &'m Fixture, fault: Option<Fault>) -> Self {
        Self {
            mem: &fx.mem,
            memory: fx.memory.to_vec(),
            table: None,
            fault,
            set_owner_calls: 0,
            log: Rc::default(),
        }
    }

    pub fn owner_calls(&self) -> usize {
        self.log.borrow().owners.len()
    }
}

impl HostStage2 for MockHost<'_> {
    fn prepare(&mut self, scratch: PhysRange) -> Result<(), Error> {
        if self.fault == Some(Fault::Prepare) {
            return Err(Error::OutOfMemory);
        }
        let mut alloc = EarlyAllocator::new();
        alloc.init(scratch)?;
        let mut table = GuardianPageTable::init_radix(self.mem, &mut alloc, LinearMap::identity(), HOST_IPA_BITS)?;
        for region in &self.memory {
            table.map_phys(&mut alloc, *region, MapAttrs::owned(Protection::ReadWrite))?;
        }
        if let Some(Fault::ForeignTable(pa)) = self.fault {
            let child = PhysicalAddress::new(pa).page::<Size4K>();
            // SAFETY: the root page lies in simulated memory and nothing else
            // holds a reference to it.
            let root: &mut PageTable = unsafe { self.mem.phys_to_mut(table.root().base()) };
            root.set(1, PageTableEntry::next_table(child));
        }
        self.table = Some(HostTable {
            root: table.root(),
            ipa_bits: HOST_IPA_BITS,
        });
        self.log.borrow_mut().prepared = Some(scratch);
        Ok(())
    }

    fn set_owner(&mut self, range: PhysRange, owner: OwnerId) -> Result<(), Error> {
        let call = self.set_owner_calls;
        self.set_owner_calls += 1;
        match self.fault {
            Some(Fault::SetOwner(n)) if n == call => return Err(Error::WalkFailure),
            Some(Fault::Protect) if owner == OwnerId::Protected => return Err(Error::InvalidArgument),
            _ => {}
        }
        self.log.borrow_mut().owners.push((range, owner));
        Ok(())
    }

    fn table(&self) -> Option<HostTable> {
        if self.fault == Some(Fault::BadHostTable) {
            // A root outside memory.
            return Some(HostTable {
                root: PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1000)),
                ipa_bits: HOST_IPA_BITS,
            });
        }
        self.table
    }
}

#[derive(Debug, Default)]
pub struct MockServices {
    pub fail: bool,
    pub scratch: Option<PhysRange>,
}

impl ExternalServices for MockServices {
    fn init(&mut self, scratch: PhysRange) -> Result<(), Error> {
        if self.fail {
            return Err(Error::InvalidArgument);
        }
        self.scratch = Some(scratch);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockContext {
    pub rc: Option<i32>,
    pub released: bool,
}

impl HostContext for MockContext {
    fn set_return_code(&mut self, code: i32) {
        self.rc = Some(code);
    }

    fn release_cpus(&mut self) {
        self.released = true;
    }
}
