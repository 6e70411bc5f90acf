//! # Translation table descriptors
//!
//! One 64-bit descriptor format serves every level of the guardian's
//! 4 KiB-granule table. What a valid descriptor means depends on the level it
//! is found at, see [`PageTableEntry::kind`].

use crate::level::Level;
use bitfield_struct::bitfield;
use hyp_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single translation table descriptor in its raw bitfield form.
///
/// ### Bit layout
///
/// | Bits  | Name        | Meaning |
/// |-------|-------------|---------|
/// | 0     | valid       | Descriptor is valid |
/// | 1     | table       | Table (levels 0–2) or page (level 3); clear means block |
/// | 2–4   | `AttrIndx`  | Memory attribute index |
/// | 5     | NS          | Non-secure |
/// | 6     | AP\[1\]     | Unprivileged access |
/// | 7     | AP\[2\]     | Read-only |
/// | 8–9   | SH          | Shareability |
/// | 10    | AF          | Access flag |
/// | 11    | nG          | Not global |
/// | 12–47 | OA          | Output address bits \[47:12\] |
/// | 52    | Contiguous  | Contiguous hint |
/// | 53    | PXN         | Privileged execute-never |
/// | 54    | XN          | Execute-never |
/// | 55–56 | SW          | Page ownership state (software defined) |
///
/// The software bits never influence translation. They record which party
/// owns the mapped page from the guardian's point of view, see [`PageState`].
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Valid (bit 0). A clear bit makes every other field meaningless.
    pub valid: bool,

    /// Table / page (bit 1).
    ///
    /// At levels 0–2, set for a pointer to the next table and clear for a
    /// block. At level 3, must be set for a page mapping.
    pub table: bool,

    /// Index into the memory attribute register (bits 2..=4).
    #[bits(3)]
    pub attr_index: u8,

    /// Non-secure (bit 5).
    pub non_secure: bool,

    /// AP\[1\] (bit 6): unprivileged access. Always clear for guardian mappings.
    pub unprivileged: bool,

    /// AP\[2\] (bit 7): read-only.
    pub read_only: bool,

    /// Shareability (bits 8..=9). `0b11` is inner shareable.
    #[bits(2)]
    pub shareability: u8,

    /// Access flag (bit 10). Set on creation, the guardian never takes access faults.
    pub access_flag: bool,

    /// Not global (bit 11).
    pub not_global: bool,

    /// Output address bits \[47:12\] (bits 12..=47).
    #[bits(36)]
    output_address_47_12: u64,

    #[bits(4)]
    __reserved_48_51: u8,

    /// Contiguous hint (bit 52).
    pub contiguous: bool,

    /// Privileged execute-never (bit 53).
    pub pxn: bool,

    /// Execute-never (bit 54).
    pub xn: bool,

    /// Software page state (bits 55..=56), see [`PageState`].
    #[bits(2)]
    pub sw_state: u8,

    #[bits(7)]
    __ignored_57_63: u8,
}

/// Inner shareable.
const SH_INNER: u8 = 0b11;

/// Attribute index of normal write-back memory.
const ATTR_NORMAL: u8 = 0;

/// Ownership state of a mapped page, as recorded in the descriptor's software bits.
///
/// The fourth encoding (`0b11`) is not a state; decoding it fails with
/// [`InvalidPageState`], which is how a corrupted or tampered descriptor is
/// detected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageState {
    /// Exclusively owned by whoever holds this mapping.
    Owned = 0b00,
    /// Owned by the mapping party and shared with the peer.
    SharedOwned = 0b01,
    /// Owned by the peer and borrowed by the mapping party.
    SharedBorrowed = 0b10,
}

/// The software bits held the reserved `0b11` encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid page state encoding {0:#04b}")]
pub struct InvalidPageState(pub u8);

impl PageState {
    /// The state the peer must record for the same page.
    ///
    /// `SharedOwned` and `SharedBorrowed` mirror each other; `Owned` has no
    /// shared counterpart and stays `Owned`.
    #[inline]
    #[must_use]
    pub const fn mirrored(self) -> Self {
        match self {
            Self::Owned => Self::Owned,
            Self::SharedOwned => Self::SharedBorrowed,
            Self::SharedBorrowed => Self::SharedOwned,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::SharedOwned | Self::SharedBorrowed)
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageState {
    type Error = InvalidPageState;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            0b00 => Ok(Self::Owned),
            0b01 => Ok(Self::SharedOwned),
            0b10 => Ok(Self::SharedBorrowed),
            other => Err(InvalidPageState(other)),
        }
    }
}

/// Access permissions of a guardian mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Read and execute (text).
    Execute,
    /// Read and write, never executable.
    ReadWrite,
    /// Read only, never executable.
    ReadOnly,
}

/// What a leaf mapping carries besides its output address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MapAttrs {
    pub prot: Protection,
    pub state: PageState,
}

impl MapAttrs {
    #[inline]
    #[must_use]
    pub const fn new(prot: Protection, state: PageState) -> Self {
        Self { prot, state }
    }

    /// An exclusively owned mapping.
    #[inline]
    #[must_use]
    pub const fn owned(prot: Protection) -> Self {
        Self::new(prot, PageState::Owned)
    }
}

/// Interpretation of a descriptor at a given level.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Invalid,
    /// Pointer to the next-level table.
    Table(PhysicalPage<Size4K>),
    /// Block mapping (levels 1–2).
    Block,
    /// Page mapping (level 3).
    Page,
    /// A valid encoding the architecture reserves: a block at level 0, or a
    /// level-3 descriptor without the page bit.
    Reserved,
}

impl PageTableEntry {
    /// Build a leaf descriptor for `pa` at `level`.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, level: Level, attrs: MapAttrs) -> Self {
        let (read_only, xn) = match attrs.prot {
            Protection::Execute => (true, false),
            Protection::ReadWrite => (false, true),
            Protection::ReadOnly => (true, true),
        };
        Self::new()
            .with_valid(true)
            .with_table(level.is_last())
            .with_attr_index(ATTR_NORMAL)
            .with_shareability(SH_INNER)
            .with_access_flag(true)
            .with_read_only(read_only)
            .with_xn(xn)
            .with_output_address_47_12(pa.as_u64() >> 12)
            .with_sw_state(attrs.state.into_bits())
    }

    /// Build a descriptor pointing at the next-level table `child`.
    #[inline]
    #[must_use]
    pub const fn next_table(child: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(true)
            .with_output_address_47_12(child.base().as_u64() >> 12)
    }

    /// Output address: the mapped page or block, or the next table.
    #[inline]
    #[must_use]
    pub const fn output_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.output_address_47_12() << 12)
    }

    /// Classify the descriptor as found at `level`.
    #[must_use]
    pub const fn kind(self, level: Level) -> EntryKind {
        if !self.valid() {
            return EntryKind::Invalid;
        }
        if level.is_last() {
            return if self.table() {
                EntryKind::Page
            } else {
                EntryKind::Reserved
            };
        }
        if self.table() {
            EntryKind::Table(self.output_address().page::<Size4K>())
        } else if level.supports_block() {
            EntryKind::Block
        } else {
            EntryKind::Reserved
        }
    }

    /// Decode the software ownership state.
    ///
    /// # Errors
    /// Fails on the reserved `0b11` encoding.
    #[inline]
    pub fn page_state(self) -> Result<PageState, InvalidPageState> {
        PageState::try_from(self.sw_state())
    }

    /// Access permissions of a leaf descriptor.
    #[inline]
    #[must_use]
    pub const fn protection(self) -> Protection {
        match (self.read_only(), self.xn()) {
            (true, false) => Protection::Execute,
            (false, _) => Protection::ReadWrite,
            (true, true) => Protection::ReadOnly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encodings_follow_protection() {
        let pa = PhysicalAddress::new(0x4000_3000);
        let text = PageTableEntry::leaf(pa, Level::LAST, MapAttrs::owned(Protection::Execute));
        assert!(text.valid() && text.table() && text.access_flag());
        assert!(text.read_only() && !text.xn());
        assert_eq!(text.output_address(), pa);
        assert_eq!(text.kind(Level::LAST), EntryKind::Page);
        assert_eq!(text.protection(), Protection::Execute);

        let data = PageTableEntry::leaf(pa, Level::LAST, MapAttrs::owned(Protection::ReadWrite));
        assert!(!data.read_only() && data.xn());

        let block = PageTableEntry::leaf(
            PhysicalAddress::new(0x4020_0000),
            Level::new(2).unwrap(),
            MapAttrs::new(Protection::ReadOnly, PageState::SharedBorrowed),
        );
        assert_eq!(block.kind(Level::new(2).unwrap()), EntryKind::Block);
        assert_eq!(block.page_state(), Ok(PageState::SharedBorrowed));
    }

    #[test]
    fn reserved_encodings_are_detected() {
        let pa = PhysicalAddress::new(0x4000_0000);
        let block = PageTableEntry::leaf(pa, Level::new(2).unwrap(), MapAttrs::owned(Protection::ReadOnly));
        // A block descriptor found at level 3 lacks the page bit.
        assert_eq!(block.kind(Level::LAST), EntryKind::Reserved);
        // Level 0 cannot hold blocks.
        assert_eq!(block.kind(Level::new(0).unwrap()), EntryKind::Reserved);
        assert_eq!(PageTableEntry::new().kind(Level::LAST), EntryKind::Invalid);
    }

    #[test]
    fn software_state_round_trip_and_sentinel() {
        let e = PageTableEntry::leaf(
            PhysicalAddress::new(0x1000),
            Level::LAST,
            MapAttrs::new(Protection::ReadWrite, PageState::SharedOwned),
        );
        assert_eq!(e.page_state(), Ok(PageState::SharedOwned));

        let tampered = e.with_sw_state(0b11);
        assert_eq!(tampered.page_state(), Err(InvalidPageState(0b11)));
        assert_ne!(e, tampered);
    }

    #[test]
    fn mirrored_states() {
        assert_eq!(PageState::SharedOwned.mirrored(), PageState::SharedBorrowed);
        assert_eq!(PageState::SharedBorrowed.mirrored(), PageState::SharedOwned);
        assert_eq!(PageState::Owned.mirrored(), PageState::Owned);
        assert_eq!(PageState::SharedOwned.mirrored().mirrored(), PageState::SharedOwned);
    }
}
