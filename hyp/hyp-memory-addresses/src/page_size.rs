use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Mapping granule of a 4 KiB-granule translation regime.
pub trait PageSize:
    sealed::Sealed + Copy + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Bytes per granule.
    const SIZE: u64;
    const SHIFT: u32;
    const NAME: &'static str;
}

macro_rules! granule {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

granule!(
    /// 4 KiB page, a level-3 page descriptor.
    Size4K, 12, "4K"
);
granule!(
    /// 2 MiB block, a level-2 block descriptor.
    Size2M, 21, "2M"
);
granule!(
    /// 1 GiB block, a level-1 block descriptor.
    Size1G, 30, "1G"
);
