//! # Memory Layout

/// log2 of the translation granule.
pub const PAGE_SHIFT: u32 = 12;

/// The translation granule in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Descriptors per translation table (one 4 KiB page of 8-byte entries).
pub const PTRS_PER_TABLE: u64 = PAGE_SIZE / 8;

/// First translation level of a 4 KiB-granule regime with 48 VA bits.
pub const FIRST_LEVEL: u8 = 0;

/// Last translation level; only page descriptors live here.
pub const LAST_LEVEL: u8 = 3;

/// Smallest supported guardian VA width (two levels of translation).
pub const MIN_VA_BITS: u8 = 25;

/// Largest supported guardian VA width (four levels of translation).
pub const MAX_VA_BITS: u8 = 48;

/// Blocks of order `0..MAX_ORDER` are handed out by the final pool allocator.
pub const MAX_ORDER: u8 = 11;

/// Capacity of the per-VM table.
pub const MAX_VMS: usize = 255;

/// VM handles are slot indices shifted by this offset so that `0` is never valid.
pub const VM_HANDLE_OFFSET: u32 = 0x1000;

/// Pages per mailbox of the external proxy service (one TX, one RX).
pub const PROXY_MAILBOX_PAGES: u64 = 1;

/// Size of the private VA window used for stacks and other non-linear mappings.
pub const PRIVATE_VA_SIZE: u64 = 1 << 30;

/// Extra host stage-2 pages reserved for concatenated top-level tables.
pub const HOST_S2_PGD_EXTRA_PAGES: u64 = 16;

/// Space reserved for host stage-2 MMIO mappings.
pub const MMIO_VA_SIZE: u64 = 1 << 30;

/// Per-CPU stacks occupy one page, preceded by one unmapped guard page.
pub const STACK_PAGES: u64 = 1;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PTRS_PER_TABLE == 512);
    assert!(MIN_VA_BITS < MAX_VA_BITS);
    assert!(PRIVATE_VA_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(MAX_VMS as u64 + VM_HANDLE_OFFSET as u64 <= u32::MAX as u64);
};
