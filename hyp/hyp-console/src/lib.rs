//! # Guardian console
//!
//! The guardian has no device of its own to print to. Log output goes into
//! an in-memory ring buffer that the host drains and forwards wherever it
//! likes.
//!
//! * [`ConsoleLogger`] implements [`log::Log`] and formats every record as
//!   `"[LEVEL] target: message\n"`.
//! * [`hyp_trace!`] writes unfiltered, preformatted text to a console.
//!
//! Disabling the `enabled` feature turns every write into a no-op while
//! keeping the API, so call sites need no `cfg`s.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod logger;
mod ring;

pub use logger::ConsoleLogger;
pub use ring::RingBuffer;

/// Size of the console ring in bytes.
pub const CONSOLE_BYTES: usize = 16 * 1024;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod console_fmt {
    use core::fmt::{self, Write};

    #[doc(hidden)]
    #[inline]
    pub fn console_write<W: Write>(sink: &mut W, args: fmt::Arguments) {
        // Best effort; the ring never fails to accept bytes.
        let _ = sink.write_fmt(args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod console_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn console_write<W: fmt::Write>(_: &mut W, _: fmt::Arguments) {}
}

/// Write `format!`-style text to a [`ConsoleLogger`].
#[macro_export]
macro_rules! hyp_trace {
    ($console:expr, $($arg:tt)*) => {{
        $crate::ConsoleLogger::write_fmt(&$console, core::format_args!($($arg)*));
    }};
}
