//! The host side of the simulated machine.

use hyp_alloc::early::EarlyAllocator;
use hyp_alloc::phys_mapper::SimulatedMemory;
use hyp_alloc::vmemmap::OwnerId;
use hyp_memory_addresses::PhysRange;
use hyp_pgtable::{GuardianPageTable, LinearMap, MapAttrs, Protection};
use hyp_setup::{Error, ExternalServices, HostContext, HostStage2, HostTable};

pub const IPA_BITS: u8 = 40;

/// Host stage-2 that identity-maps every memory region and counts how many
/// pages it has handed to each owner.
pub struct SimHost<'m> {
    mem: &'m SimulatedMemory,
    memory: &'m [PhysRange],
    table: Option<HostTable>,
    pub pages_to: [u64; 3],
}

impl<'m> SimHost<'m> {
    pub const fn new(mem: &'m SimulatedMemory, memory: &'m [PhysRange]) -> Self {
        Self {
            mem,
            memory,
            table: None,
            pages_to: [0; 3],
        }
    }
}

impl HostStage2 for SimHost<'_> {
    fn prepare(&mut self, scratch: PhysRange) -> Result<(), Error> {
        let mut alloc = EarlyAllocator::new();
        alloc.init(scratch)?;
        let mut table = GuardianPageTable::init_radix(self.mem, &mut alloc, LinearMap::identity(), IPA_BITS)?;
        for region in self.memory {
            table.map_phys(&mut alloc, *region, MapAttrs::owned(Protection::ReadWrite))?;
        }
        log::info!(
            "host stage-2 at {:?}, {} of {} scratch pages used",
            table.root(),
            alloc.pages_used(),
            scratch.page_count()
        );
        self.table = Some(HostTable {
            root: table.root(),
            ipa_bits: IPA_BITS,
        });
        Ok(())
    }

    fn set_owner(&mut self, range: PhysRange, owner: OwnerId) -> Result<(), Error> {
        self.pages_to[owner as usize] += range.page_count();
        Ok(())
    }

    fn table(&self) -> Option<HostTable> {
        self.table
    }
}

#[derive(Default)]
pub struct SimServices {
    pub mailboxes: Option<PhysRange>,
}

impl ExternalServices for SimServices {
    fn init(&mut self, scratch: PhysRange) -> Result<(), Error> {
        log::info!("proxy mailboxes at {scratch:?}");
        self.mailboxes = Some(scratch);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimCpus {
    pub return_code: Option<i32>,
    pub released: bool,
}

impl HostContext for SimCpus {
    fn set_return_code(&mut self, code: i32) {
        self.return_code = Some(code);
    }

    fn release_cpus(&mut self) {
        self.released = true;
    }
}
